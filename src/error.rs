use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("game '{game}': missing key `{key}`")]
    KeyMissing { game: String, key: String },

    #[error("game '{game}': array `{key}` is empty")]
    ArrayEmpty { game: String, key: String },

    #[error("game '{game}': {message}")]
    Value { game: String, message: String },

    #[error("game '{game}': mod folder '{}' does not exist", .path.display())]
    FolderMissing { game: String, path: PathBuf },

    #[error("game '{game}': set `{set}` includes itself")]
    Recursion { game: String, set: String },

    #[error("game '{game}': invalid mount state: {message}")]
    StateInvalid { game: String, message: String },

    #[error("game '{game}': the overlay is still in use")]
    Busy { game: String },

    #[error("{context}: {source}")]
    File {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn file(context: impl Into<String>, source: io::Error) -> Self {
        Error::File {
            context: context.into(),
            source,
        }
    }
}
