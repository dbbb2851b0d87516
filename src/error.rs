use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Invalid package format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedFormat(u8),

    #[error("Path escapes the extraction root: {0}")]
    PathTraversal(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Untrusted package: {0}")]
    Untrusted(String),

    #[error("TPM requested but no TPM is available")]
    TpmUnavailable,

    #[error("Password exceeds {0} bytes")]
    PasswordTooLong(usize),

    #[error("Password error: {0}")]
    Password(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Invalid key signing request: {0}")]
    InvalidKsr(String),

    #[error("Setup process failed with exit code {0}")]
    SetupFailed(i32),

    #[error("A setup run is already in progress")]
    AlreadyRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, SetupError>;
