use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

