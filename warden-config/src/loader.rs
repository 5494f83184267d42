use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;
use crate::models::Config;

/// Name of the environment variable carrying an extra config directory.
pub const EXTRA_DIR_ENVVAR: &str = "WARDEN_EXTRA";

const CONFIG_FILE_NAME: &str = "warden.json";

/// Build the ordered list of directories to search for `warden.json`.
///
/// Order is `[cwd, $WARDEN_EXTRA (if set and a directory), /etc/warden (if a
/// directory)]`, always searching the current directory first.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for candidate in ["/etc/warden", env::var(EXTRA_DIR_ENVVAR).as_deref().unwrap_or("")] {
        if !candidate.is_empty() && Path::new(candidate).is_dir() {
            paths.insert(0, PathBuf::from(candidate));
        }
    }
    paths.insert(0, PathBuf::from("."));
    paths
}

/// Load `warden.json` from the given search paths.
///
/// Every path is tried in order; a readable-and-parseable file updates the
/// result, but the search does not stop early — so if more than one
/// directory holds a valid config, the *last* one in `paths` wins.
pub fn load(paths: &[PathBuf]) -> Result<Config, ConfigError> {
    let mut found: Option<Config> = None;
    for dir in paths {
        let candidate = dir.join(CONFIG_FILE_NAME);
        match fs::read_to_string(&candidate) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(config) => found = Some(config),
                Err(source) => debug!(path = %candidate.display(), %source, "JSON decode error"),
            },
            Err(source) => debug!(path = %candidate.display(), %source, "IO error"),
        }
    }
    found.ok_or_else(|| {
        ConfigError::NotFound(paths.iter().map(|d| d.join(CONFIG_FILE_NAME)).collect())
    })
}

/// Convenience wrapper over [`default_search_paths`] + [`load`].
pub fn load_default() -> Result<Config, ConfigError> {
    load(&default_search_paths())
}
