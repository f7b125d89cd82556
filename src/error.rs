use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Fewer bytes in the frame than the documented layout requires.
    #[error("truncated frame: needed {needed} bytes at offset {offset}")]
    TruncatedFrame { offset: usize, needed: usize },

    #[error("oversized frame: message_length {0} exceeds limit")]
    OversizedFrame(i32),

    #[error("invalid op code {0}")]
    InvalidOpcode(i32),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("cstring is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} bytes left after documented body")]
    TrailingGarbage(usize),

    #[error("OP_MSG checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Whether this error must tear down the connection. Non-fatal decode
    /// errors are handled per-frame by the dispatcher (error reply or
    /// silent drop) and the connection keeps reading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::TruncatedFrame { .. }
                | Error::OversizedFrame(_)
                | Error::TrailingGarbage(_)
        )
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::MalformedDocument(e.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Error::MalformedDocument(e.to_string())
    }
}

pub type Result<T> = StdResult<T, Error>;
