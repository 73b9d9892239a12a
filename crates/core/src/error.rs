use std::sync::Arc;

/// Result alias that carries the custom [`BridgeError`] type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Common error type for the bridge crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No bank is registered for the requested sound name.
    #[error("no sample bank registered for `{name}`")]
    SoundNotFound { name: String },
    /// An asset could not be retrieved.
    #[error("failed to fetch `{url}`: {reason}")]
    Fetch { url: String, reason: String },
    /// An asset was retrieved but could not be decoded into PCM.
    #[error("failed to decode `{url}`: {reason}")]
    Decode { url: String, reason: String },
    /// A sample manifest was unreachable or malformed.
    #[error("invalid sample manifest `{url}`: {reason}")]
    Manifest { url: String, reason: String },
    /// The render engine failed to instantiate or rejected a call.
    #[error("engine error: {0}")]
    Engine(String),
    /// The render thread has gone away.
    #[error("render thread disconnected")]
    Disconnected,
    /// Configuration failed to parse or validate.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A failure shared between every waiter of the same pending load.
    #[error(transparent)]
    Shared(Arc<BridgeError>),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Looks through [`BridgeError::Shared`] wrappers to the underlying error.
    pub fn root(&self) -> &BridgeError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Returns `true` when the error only means the sound is unknown.
    pub fn is_sound_not_found(&self) -> bool {
        matches!(self.root(), Self::SoundNotFound { .. })
    }
}

impl From<&str> for BridgeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BridgeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
