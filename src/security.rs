//! Encryption and signing seams.
//!
//! Applied at the transport boundary when configured. The core defines the
//! interfaces only; concrete primitives (AES-GCM, HMAC) are external
//! collaborators. Signature verification must not leak timing; the
//! comparison helper here is the one implementations should use.

use crate::error::ProcessingError;

/// Result type for security operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Ciphertext plus the parameters needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Initialization vector / nonce.
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// Authentication tag.
    pub tag: Vec<u8>,
}

/// Authenticated encryption over envelope bytes.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<EncryptedPayload>;
    fn decrypt(&self, payload: &EncryptedPayload, key: &[u8]) -> Result<Vec<u8>>;
}

/// Detached signatures over envelope bytes.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature. Implementations must compare with
    /// [`constant_time_eq`].
    fn verify(&self, bytes: &[u8], signature: &[u8], key: &[u8]) -> Result<bool>;
}

/// Constant-time byte comparison.
///
/// Folds the XOR of every byte pair so the running time depends only on
/// the input length, never on where the first mismatch sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"signature", b"signature"));
        assert!(!constant_time_eq(b"signature", b"signaturX"));
        assert!(!constant_time_eq(b"signature", b"Xignature"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(constant_time_eq(b"", b""));
    }
}
