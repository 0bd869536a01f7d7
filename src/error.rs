#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("corrupt block: {0}")]
    CorruptBlock(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("item of {len} bytes exceeds the block size limit of {max} bytes")]
    ItemTooLarge { len: usize, max: usize },
    #[error("merge cancelled")]
    Cancelled,
    #[error("table is closed")]
    Closed,
}

impl Error {
    pub fn decode_error(e: impl Into<Box<dyn std::error::Error>>) -> Self {
        Self::Decode(e.into().to_string())
    }

    /// Recovers an owned error from one shared by a cache loader.
    pub(crate) fn from_shared(e: std::sync::Arc<Error>) -> Self {
        std::sync::Arc::try_unwrap(e).unwrap_or_else(|e| match e.as_ref() {
            Self::Decode(s) => Self::Decode(s.clone()),
            Self::CorruptBlock(s) => Self::CorruptBlock(s.clone()),
            Self::Validation(s) => Self::Validation(s.clone()),
            Self::Io(io) => Self::Io(std::io::Error::new(io.kind(), io.to_string())),
            Self::Metadata(m) => Self::Decode(m.to_string()),
            Self::ItemTooLarge { len, max } => Self::ItemTooLarge {
                len: *len,
                max: *max,
            },
            Self::Cancelled => Self::Cancelled,
            Self::Closed => Self::Closed,
        })
    }

    /// Returns true for errors caused by malformed persisted data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::CorruptBlock(_) | Self::Validation(_) | Self::Metadata(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
