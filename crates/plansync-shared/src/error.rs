use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlansyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonce { expected: usize, actual: usize },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid salt")]
    InvalidSalt,

    #[error("Password must not be empty")]
    EmptyPassword,

    #[error("Room identifier must not be empty")]
    EmptyRoomId,

    #[error("Key derivation needs at least one iteration")]
    InvalidIterations,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}
