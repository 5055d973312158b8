//! 静态数据变换（data-at-rest）
//!
//! 标量字段写入前可经过对称变换，读回时逆变换；逆变换失败按完整性错误处理，不做掩盖。
//!
use crate::error::{StoreError, StoreResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub trait DataEncryption: Send + Sync {
    fn name(&self) -> &str;

    fn encrypt(&self, plain: &str) -> String;

    fn decrypt(&self, encrypted: &str) -> StoreResult<String>;
}

/// 原样写入
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl DataEncryption for NoEncryption {
    fn name(&self) -> &str {
        "none"
    }

    fn encrypt(&self, plain: &str) -> String {
        plain.to_string()
    }

    fn decrypt(&self, encrypted: &str) -> StoreResult<String> {
        Ok(encrypted.to_string())
    }
}

/// 与密钥逐字节异或后以 base64 文本保存
#[derive(Debug, Clone)]
pub struct KeyedCipher {
    key: Vec<u8>,
}

impl KeyedCipher {
    pub fn new(key: impl AsRef<[u8]>) -> StoreResult<Self> {
        let key = key.as_ref().to_vec();
        if key.is_empty() {
            return Err(StoreError::Configuration {
                reason: "encryption key must not be empty".to_string(),
            });
        }
        Ok(Self { key })
    }

    fn apply(&self, bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl DataEncryption for KeyedCipher {
    fn name(&self) -> &str {
        "keyed"
    }

    fn encrypt(&self, plain: &str) -> String {
        STANDARD.encode(self.apply(plain.as_bytes()))
    }

    fn decrypt(&self, encrypted: &str) -> StoreResult<String> {
        let bytes = STANDARD
            .decode(encrypted)
            .map_err(|e| StoreError::integrity(format!("undecodable ciphertext: {e}")))?;
        String::from_utf8(self.apply(&bytes))
            .map_err(|e| StoreError::integrity(format!("decrypted data is not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_cipher_is_symmetric() {
        let cipher = KeyedCipher::new("s3cret").unwrap();
        let encrypted = cipher.encrypt("Grüße, world");
        assert_ne!(encrypted, "Grüße, world");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "Grüße, world");
    }

    #[test]
    fn garbage_ciphertext_is_integrity_error() {
        let cipher = KeyedCipher::new("k").unwrap();
        match cipher.decrypt("***not base64***") {
            Err(StoreError::Integrity { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_key_rejected() {
        assert!(KeyedCipher::new("").is_err());
        assert_eq!(NoEncryption.decrypt("abc").unwrap(), "abc");
    }
}
