use std::path::PathBuf;

/// Configuration-stage errors: missing file, malformed JSON, or a step
/// descriptor that is neither a filter nor an action.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no readable `warden.json` found in any of: {0:?}")]
    NotFound(Vec<PathBuf>),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("step descriptor is neither `filter` nor `action`: {0}")]
    NotFilterOrAction(String),

    #[error("step descriptor carries both `filter` and `action`: {0}")]
    AmbiguousStep(String),
}
