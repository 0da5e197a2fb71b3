use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Transition failed: {0}")]
    Transition(String),

    #[error("Action not found: {action_id}")]
    ActionNotFound { action_id: String },

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Invocation {invocation_id} gave up after {attempts} attempts")]
    RetriesExhausted { invocation_id: String, attempts: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Config(s) => Self::Config(s.clone()),
            Self::Storage(s) => Self::Storage(s.clone()),
            Self::Transition(s) => Self::Transition(s.clone()),
            Self::ActionNotFound { action_id } => Self::ActionNotFound {
                action_id: action_id.clone(),
            },
            Self::Action(s) => Self::Action(s.clone()),
            Self::RetriesExhausted {
                invocation_id,
                attempts,
            } => Self::RetriesExhausted {
                invocation_id: invocation_id.clone(),
                attempts: *attempts,
            },
            Self::Internal(s) => Self::Internal(s.clone()),
            // For errors that can't be cloned, convert to string representation
            Self::Database(e) => Self::Internal(format!("Database error: {}", e)),
            Self::Serialization(e) => Self::Internal(format!("Serialization error: {}", e)),
            Self::Yaml(e) => Self::Internal(format!("YAML error: {}", e)),
            Self::Io(e) => Self::Internal(format!("IO error: {}", e)),
            Self::AddrParse(e) => Self::Internal(format!("Address parse error: {}", e)),
        }
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn transition(msg: impl Into<String>) -> Self {
        Self::Transition(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Storage-level failures must reach the caller; everything else about an
    /// effect is retried or reported.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Storage(_))
    }
}
