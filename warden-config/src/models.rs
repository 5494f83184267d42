use std::convert::TryFrom;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A single entry in a label's step sequence.
#[derive(Debug, Clone)]
pub enum StepDescriptor {
    Filter {
        filter: String,
        args: Map<String, Value>,
        else_branch: Option<String>,
    },
    Action {
        action: String,
        args: Map<String, Value>,
        then_branch: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(default)]
    then: Option<String>,
    #[serde(default, rename = "else")]
    else_: Option<String>,
}

impl<'de> Deserialize<'de> for StepDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawStep::deserialize(deserializer)?;
        StepDescriptor::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<RawStep> for StepDescriptor {
    type Error = ConfigError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        match (raw.filter, raw.action) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousStep(format!("{raw:?}", raw = raw))),
            (Some(filter), None) => Ok(StepDescriptor::Filter {
                filter,
                args: raw.args,
                else_branch: raw.else_,
            }),
            (None, Some(action)) => Ok(StepDescriptor::Action {
                action,
                args: raw.args,
                then_branch: raw.then,
            }),
            (None, None) => Err(ConfigError::NotFilterOrAction(format!(
                "args={:?}",
                raw.args
            ))),
        }
    }
}

/// `email.*` block of the config document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmailConfig {
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default = "default_to")]
    pub to: Vec<String>,
    #[serde(default = "default_sendmail")]
    pub sendmail: Vec<String>,
}

fn default_subject() -> String {
    "Warden Notification".to_string()
}
fn default_from() -> String {
    "warden".to_string()
}
fn default_to() -> Vec<String> {
    vec!["hostmaster".to_string()]
}
fn default_sendmail() -> Vec<String> {
    vec!["/usr/bin/sendmail".to_string(), "-t".to_string()]
}

/// `nftBan.*` block: argv prefix for the `nft` firewall CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct NftBanConfig {
    #[serde(default = "default_nft")]
    pub nft: Vec<String>,
}

impl Default for NftBanConfig {
    fn default() -> Self {
        Self { nft: default_nft() }
    }
}

fn default_nft() -> Vec<String> {
    vec!["/usr/bin/nft".to_string()]
}

/// `ipsetBan.*` block: argv prefix for the `ipset` firewall CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct IpsetBanConfig {
    #[serde(default = "default_ipset")]
    pub ipset: Vec<String>,
}

impl Default for IpsetBanConfig {
    fn default() -> Self {
        Self {
            ipset: default_ipset(),
        }
    }
}

fn default_ipset() -> Vec<String> {
    vec![
        "/usr/bin/ipset".to_string(),
        "-exist".to_string(),
        "-quiet".to_string(),
    ]
}

fn default_storage() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_encoding() -> String {
    "iso-8859-1".to_string()
}

/// The whole `warden.json` document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage: PathBuf,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default, rename = "nftBan")]
    pub nft_ban: NftBanConfig,
    #[serde(default, rename = "ipsetBan")]
    pub ipset_ban: IpsetBanConfig,
    #[serde(default = "default_encoding", rename = "8bit-message-encoding")]
    pub eight_bit_encoding: String,
    #[serde(default)]
    pub debug: bool,
    /// label -> step sequence, in the JSON document's own key order: the
    /// workflow builder's implicit fall-through between top-level chains
    /// depends on this being the *document* order, not any later sort.
    #[serde(default)]
    pub actions: Map<String, Value>,
}

impl Config {
    /// The `actions` map, decoded into typed step sequences, preserving
    /// the document's label order.
    pub fn action_chains(&self) -> Result<Vec<(String, Vec<StepDescriptor>)>, ConfigError> {
        let mut chains = Vec::with_capacity(self.actions.len());
        for (label, steps) in &self.actions {
            let steps: Vec<StepDescriptor> = serde_json::from_value(steps.clone())
                .map_err(|source| ConfigError::Parse {
                    path: PathBuf::from(format!("actions.{label}")),
                    source,
                })?;
            chains.push((label.clone(), steps));
        }
        Ok(chains)
    }

    /// Path to the ban state file for a given driver (`nftBan` /
    /// `ipsetBan`): `<storage>/<driver>.json`.
    pub fn ban_state_path(&self, driver: &str) -> PathBuf {
        self.storage.join(format!("{driver}.json"))
    }

    /// Path to the daily report's append-only journal file.
    pub fn report_journal_path(&self) -> PathBuf {
        self.storage.join("action_dailyReport.journal")
    }
}
