use std::fmt;

/// Main error type for the membership protocol
#[derive(Debug)]
pub enum MembershipError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Transport layer errors (send, request-response, unreachable peer)
    Transport(String),

    /// Gossip dissemination errors
    Gossip(String),

    /// Metadata store errors (fetch failures)
    Metadata(String),

    /// A request-response exchange did not complete in time
    Timeout(String),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// The protocol has been stopped and no longer accepts commands
    Stopped,
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// Binary encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary decoding errors
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MembershipError::Transport(msg) => write!(f, "Transport error: {}", msg),
            MembershipError::Gossip(msg) => write!(f, "Gossip error: {}", msg),
            MembershipError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            MembershipError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            MembershipError::Serialization(err) => write!(f, "Serialization error: {}", err),
            MembershipError::Stopped => write!(f, "Membership protocol is stopped"),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Encode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Binary decode: {}", err),
        }
    }
}

impl std::error::Error for MembershipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MembershipError::Serialization(SerializationError::Encode(err)) => Some(err),
            MembershipError::Serialization(SerializationError::Decode(err)) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, MembershipError>;

impl MembershipError {
    /// Transient errors degrade to "retry on the next protocol round"
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MembershipError::Transport(_)
                | MembershipError::Gossip(_)
                | MembershipError::Metadata(_)
                | MembershipError::Timeout(_)
        )
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            MembershipError::Config(_) => "configuration_error",
            MembershipError::Transport(_) => "transport_error",
            MembershipError::Gossip(_) => "gossip_error",
            MembershipError::Metadata(_) => "metadata_error",
            MembershipError::Timeout(_) => "timeout",
            MembershipError::Serialization(_) => "serialization_error",
            MembershipError::Stopped => "stopped",
        }
    }
}

impl From<bincode::error::EncodeError> for MembershipError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MembershipError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for MembershipError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MembershipError::Serialization(SerializationError::Decode(err))
    }
}

impl From<SerializationError> for MembershipError {
    fn from(err: SerializationError) -> Self {
        MembershipError::Serialization(err)
    }
}

impl From<tokio::time::error::Elapsed> for MembershipError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MembershipError::Timeout(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MembershipError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MembershipError::Stopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MembershipError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MembershipError::Stopped
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::MembershipError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MembershipError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::MembershipError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MembershipError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! metadata_error {
    ($msg:expr) => {
        $crate::error::MembershipError::Metadata($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MembershipError::Metadata(format!($fmt, $($arg)*))
    };
}
