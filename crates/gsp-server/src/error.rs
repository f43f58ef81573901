//! Service startup errors

use thiserror::Error;

use crate::directory::DirectoryError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}
