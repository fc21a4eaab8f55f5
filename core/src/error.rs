//! Error type shared by every capability.
//! Failures are terminal for the call that produced them; the only recovery
//! is trying the next heuristic in a fixed fallback chain.

/// A specialized [`Result`] for shim operations.
pub type Result<T, E = ShimError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("{feature} is not supported on {platform}")]
    Unsupported {
        feature: &'static str,
        platform: &'static str,
    },

    #[error("could not detect {0}")]
    NotDetected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({}): {stderr}", describe_exit(.code))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cannot display user notification when a user is not logged in")]
    NoUserSession,

    #[error("service error: {0}")]
    Service(String),

    #[error("{call} failed with HRESULT {hresult:#010x}")]
    Com { call: &'static str, hresult: i32 },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// Shorthand for a capability missing on the running platform.
    pub fn unsupported(feature: &'static str) -> Self {
        ShimError::Unsupported {
            feature,
            platform: std::env::consts::OS,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl From<toml::de::Error> for ShimError {
    fn from(err: toml::de::Error) -> Self {
        ShimError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ShimError {
    fn from(err: toml::ser::Error) -> Self {
        ShimError::Config(err.to_string())
    }
}
