/// ChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Symmetric key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Per-room salt size in bytes
pub const SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 rounds used for room credentials
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Key derivation domain separators
pub const KDF_PURPOSE_AUTH: &str = "AUTH";
pub const KDF_PURPOSE_DATA: &str = "DATA";

/// Length of generated room codes
pub const ROOM_CODE_LEN: usize = 6;

/// Accepted room code length range (inclusive)
pub const ROOM_CODE_MIN_LEN: usize = 4;
pub const ROOM_CODE_MAX_LEN: usize = 12;

/// Frames larger than this are split into chunks (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on fragments per message (64 MiB at the default chunk size)
pub const MAX_CHUNKS: u32 = 4096;

/// Heartbeat ping interval in milliseconds
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// A peer silent for this long is considered gone (three missed pings)
pub const HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

/// Outbound sync is suppressed for this long after applying a remote update
pub const SETTLE_WINDOW_MS: u64 = 100;

/// Title shown for a record that could not be decrypted
pub const UNDECRYPTABLE_TITLE: &str = "\u{26a0} Decryption failed";

/// Default HTTP port of the relay server
pub const DEFAULT_HTTP_PORT: u16 = 8080;
