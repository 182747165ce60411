use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinderError {
    #[error("Secure randomness unavailable: {0}")]
    EntropySource(String),
    #[error("Invalid recovery phrase: {0}")]
    InvalidPhrase(String),
    #[error("Decryption failed (wrong password or corrupted vault)")]
    Decryption,
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage allocation failed: {0}")]
    Allocation(String),
    #[error("Unrecognized storage capacity: {actual_mb} MB (allowed: {allowed:?})")]
    UnrecognizedCapacity { actual_mb: u64, allowed: Vec<u64> },
    #[error("Recovery phrase does not match the account bound to this storage")]
    IdentityMismatch,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("An account already exists for this storage. Log in with its recovery phrase or reset first.")]
    AccountExists,
    #[error("No existing account found. Please create a new account.")]
    NoAccount,
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, BinderError>;

impl From<serde_json::Error> for BinderError {
    fn from(err: serde_json::Error) -> Self {
        BinderError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BinderError {
    fn from(err: reqwest::Error) -> Self {
        BinderError::Server(err.to_string())
    }
}
