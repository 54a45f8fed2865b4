use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::{
    KDF_PURPOSE_AUTH, KDF_PURPOSE_DATA, NONCE_SIZE, PBKDF2_ITERATIONS, SALT_SIZE,
    SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

/// Per-room random salt, minted once when the room is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidSalt)?;
        let arr: [u8; SALT_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidSalt)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<String> for Salt {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Salt> for String {
    fn from(salt: Salt) -> Self {
        salt.to_hex()
    }
}

/// Hex-encoded AUTH derivation. This is the only derived value that ever
/// leaves the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthCredential(String);

impl AuthCredential {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against another credential.
    pub fn matches(&self, other: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = other.as_bytes();
        ours.len() == theirs.len() && ours.ct_eq(theirs).unwrap_u8() == 1
    }
}

/// Symmetric data key. Opaque: it cannot be serialized, printed or exported.
#[derive(Clone)]
pub struct DataKey(Key);

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Both halves of a room's derived credentials.
#[derive(Debug, Clone)]
pub struct RoomKeys {
    pub auth: AuthCredential,
    pub data: DataKey,
}

/// AEAD output as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// base64 of the 12-byte nonce
    pub iv: String,
    /// base64 of ciphertext || tag
    pub data: String,
}

pub fn derive_room_keys(
    room_id: &str,
    password: &str,
    salt: &Salt,
) -> Result<RoomKeys, CryptoError> {
    derive_room_keys_with_rounds(room_id, password, salt, PBKDF2_ITERATIONS)
}

// Separate AUTH and DATA derivations: knowing the credential reveals nothing
// about the data key.
pub fn derive_room_keys_with_rounds(
    room_id: &str,
    password: &str,
    salt: &Salt,
    rounds: u32,
) -> Result<RoomKeys, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    if room_id.trim().is_empty() {
        return Err(CryptoError::EmptyRoomId);
    }
    if rounds == 0 {
        return Err(CryptoError::InvalidIterations);
    }

    let auth = pbkdf2_purpose(password, salt, KDF_PURPOSE_AUTH, room_id, rounds);
    let data = pbkdf2_purpose(password, salt, KDF_PURPOSE_DATA, room_id, rounds);

    Ok(RoomKeys {
        auth: AuthCredential(hex::encode(auth)),
        data: DataKey(Key::clone_from_slice(&data)),
    })
}

fn pbkdf2_purpose(
    password: &str,
    salt: &Salt,
    purpose: &str,
    room_id: &str,
    rounds: u32,
) -> [u8; SYMMETRIC_KEY_SIZE] {
    let mut material = Vec::with_capacity(SALT_SIZE + purpose.len() + 1 + room_id.len());
    material.extend_from_slice(salt.as_bytes());
    material.extend_from_slice(purpose.as_bytes());
    material.push(b':');
    material.extend_from_slice(room_id.as_bytes());

    let mut out = [0u8; SYMMETRIC_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &material, rounds, &mut out);
    out
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn encrypt(key: &DataKey, plaintext: &[u8]) -> Result<Ciphertext, CryptoError> {
    let cipher = ChaCha20Poly1305::new(&key.0);
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Ciphertext {
        iv: STANDARD.encode(nonce_bytes),
        data: STANDARD.encode(ciphertext),
    })
}

pub fn decrypt(key: &DataKey, ciphertext: &Ciphertext) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = STANDARD
        .decode(&ciphertext.iv)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce {
            expected: NONCE_SIZE,
            actual: nonce_bytes.len(),
        });
    }
    let data = STANDARD
        .decode(&ciphertext.data)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;

    let cipher = ChaCha20Poly1305::new(&key.0);
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), data.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn encrypt_json<T: Serialize>(key: &DataKey, value: &T) -> Result<Ciphertext, CryptoError> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    encrypt(key, &plaintext)
}

pub fn decrypt_json<T: DeserializeOwned>(
    key: &DataKey,
    ciphertext: &Ciphertext,
) -> Result<T, CryptoError> {
    let plaintext = decrypt(key, ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
