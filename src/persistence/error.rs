use std::fmt;

/// Persistence failure
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    /// A model could not be encoded
    Serialize(bincode::error::EncodeError),
    /// A stored record could not be decoded
    Deserialize(bincode::error::DecodeError),
    /// The storage engine failed
    Storage(fjall::Error),
    /// A record decoded but holds impossible values
    Corruption(String),
    /// The writer task already stopped
    Closed,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {}", e),
            Self::Serialize(e) => write!(f, "encode: {}", e),
            Self::Deserialize(e) => write!(f, "decode: {}", e),
            Self::Storage(e) => write!(f, "storage: {}", e),
            Self::Corruption(what) => write!(f, "corrupt record: {}", what),
            Self::Closed => f.write_str("persistence writer closed"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialize(e) => Some(e),
            Self::Deserialize(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Corruption(_) | Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(e: fjall::Error) -> Self {
        Self::Storage(e)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialize(e)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Deserialize(e)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
