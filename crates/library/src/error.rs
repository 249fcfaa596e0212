use metadata::MetadataError;

use crate::config::ConfigError;

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Sqlite(rusqlite::Error),
    Config(ConfigError),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Metadata(err) => write!(f, "metadata error: {}", err),
            LibraryError::Sqlite(err) => write!(f, "db error: {}", err),
            LibraryError::Config(err) => write!(f, "config error: {}", err),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<MetadataError> for LibraryError {
    fn from(err: MetadataError) -> Self {
        LibraryError::Metadata(err)
    }
}

impl From<rusqlite::Error> for LibraryError {
    fn from(err: rusqlite::Error) -> Self {
        LibraryError::Sqlite(err)
    }
}

impl From<ConfigError> for LibraryError {
    fn from(err: ConfigError) -> Self {
        LibraryError::Config(err)
    }
}
