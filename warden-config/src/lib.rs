//! Configuration loading and validation for the warden journal-pipeline
//! daemon.
//!
//! The on-disk format is a single JSON document, `warden.json`.
//! [`loader::load_default`] searches the current directory, an optional
//! `WARDEN_EXTRA` directory, and `/etc/warden`.

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigError;
pub use loader::{default_search_paths, load, load_default, EXTRA_DIR_ENVVAR};
pub use models::{Config, EmailConfig, IpsetBanConfig, NftBanConfig, StepDescriptor};
