use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Plugin-related errors
    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already exists: {0}")]
    PluginAlreadyExists(String),

    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Plugin execution error: {0}")]
    PluginExecution(String),

    #[error("Plugin timeout: {0}")]
    PluginTimeout(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    // Queue-related errors
    #[error("Queue stopped: {0}")]
    QueueStopped(String),

    #[error("Batch handler error: {0}")]
    BatchHandler(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
