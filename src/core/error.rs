use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dimension out of range: {0}")]
    OutOfRange(String),

    #[error("domain error: {0}")]
    Domain(String),

    #[error("invalid input file '{}': {msg}", path.display())]
    FileParser { path: PathBuf, msg: String },

    #[error("hash table full after {reprobes} reprobes")]
    TableFull { reprobes: u32 },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn file_parser(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Error::FileParser {
            path: path.into(),
            msg: msg.into(),
        }
    }
}
