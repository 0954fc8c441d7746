//! TKS 信封加密模块
//!
//! 使用 AES-256-GCM 对明文密钥 ID 做可逆的信封加密；
//! 存储中的明文 ID 永远不直接离开进程。

// Allow deprecated generic-array::from_slice until aes-gcm upgrades
#![allow(deprecated)]

use crate::error::{TksError, TksResult};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use base64::prelude::*;
use rand::RngCore;
use tracing::{debug, info};

/// 密文格式: base64(nonce[12] || ciphertext || tag[16])
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 机密配置项来源
///
/// 信封密钥与管理员旁路密钥都通过此枚举解析，
/// 优先级由配置层决定（文件 > 环境变量 > 直接配置）。
#[derive(Debug, Clone)]
pub enum SecretSource {
    /// 直接从配置文件读取
    Direct(String),
    /// 从环境变量读取
    Environment(String),
    /// 从文件路径读取
    File(String),
}

impl SecretSource {
    /// 解析出机密值（去除首尾空白）
    pub fn load(&self) -> TksResult<String> {
        let value = match self {
            SecretSource::Direct(value) => {
                debug!("Loading secret from direct configuration");
                value.clone()
            }
            SecretSource::Environment(env_var) => {
                debug!("Loading secret from environment variable: {}", env_var);
                std::env::var(env_var).map_err(|e| {
                    TksError::Config(format!(
                        "Failed to read secret from environment variable {env_var}: {e}"
                    ))
                })?
            }
            SecretSource::File(path) => {
                debug!("Loading secret from file: {}", path);
                std::fs::read_to_string(path).map_err(|e| {
                    TksError::Config(format!("Failed to read secret from file {path}: {e}"))
                })?
            }
        };

        Ok(value.trim().to_string())
    }
}

/// 信封加密器
///
/// 与存储不同，信封密钥是必须项：没有密钥就无法启动服务，
/// 不存在"明文直通"的兼容模式。
#[derive(Clone)]
pub struct TokenEnvelope {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEnvelope").finish_non_exhaustive()
    }
}

impl TokenEnvelope {
    /// 从机密来源创建信封加密器
    pub fn from_source(source: &SecretSource) -> TksResult<Self> {
        let key = source.load()?;
        Self::from_key(&key)
    }

    /// 从密钥字符串创建信封加密器
    ///
    /// 密钥可以是:
    /// - 64 字符的十六进制字符串 (32 字节)
    /// - 43/44 字符的 Base64 字符串 (32 字节)
    pub fn from_key(key: &str) -> TksResult<Self> {
        let key = key.trim();

        let key_bytes = if key.len() == 64 {
            hex::decode(key)
                .map_err(|e| TksError::Config(format!("Invalid envelope key hex format: {e}")))?
        } else if key.len() == 44 || key.len() == 43 {
            BASE64_STANDARD
                .decode(key)
                .map_err(|e| TksError::Config(format!("Invalid envelope key base64 format: {e}")))?
        } else {
            return Err(TksError::Config(format!(
                "Invalid envelope key length: expected 64 hex chars or 44 base64 chars, got {}",
                key.len()
            )));
        };

        if key_bytes.len() != 32 {
            return Err(TksError::Config(format!(
                "Invalid envelope key size: expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| TksError::Crypto(format!("Failed to create cipher: {e}")))?;

        info!("Envelope key loaded successfully");
        Ok(Self { cipher })
    }

    /// 加密明文密钥 ID
    ///
    /// 每次调用使用新的随机 nonce，同一明文多次加密产生不同密文。
    pub fn encrypt(&self, plaintext_id: &str) -> TksResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext_id.as_bytes())
            .map_err(|e| TksError::Crypto(format!("Encryption failed: {e}")))?;

        // 组合: nonce || ciphertext (包含 tag)
        let mut encrypted = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        encrypted.extend_from_slice(&nonce_bytes);
        encrypted.extend_from_slice(&ciphertext);

        Ok(BASE64_STANDARD.encode(&encrypted))
    }

    /// 解密密文，还原明文密钥 ID
    ///
    /// 格式错误、被篡改、或由其他密钥加密的密文一律返回
    /// [`TksError::InvalidEnvelope`]，调用方据此与"密钥不存在"区分。
    pub fn decrypt(&self, ciphertext: &str) -> TksResult<String> {
        let encrypted_bytes = BASE64_STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| TksError::InvalidEnvelope)?;

        if encrypted_bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(TksError::InvalidEnvelope);
        }

        let (nonce_bytes, payload) = encrypted_bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|_| TksError::InvalidEnvelope)?;

        String::from_utf8(plaintext).map_err(|_| TksError::InvalidEnvelope)
    }

    /// 生成新的信封密钥（用于初始化部署）
    ///
    /// 返回十六进制格式的 32 字节随机密钥
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_hex_key() {
        let key = TokenEnvelope::generate_key();
        let envelope = TokenEnvelope::from_key(&key).unwrap();

        let id = "550e8400-e29b-41d4-a716-446655440000";
        let ciphertext = envelope.encrypt(id).unwrap();
        assert_ne!(ciphertext, id);

        let decrypted = envelope.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, id);
    }

    #[test]
    fn test_roundtrip_base64_key() {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let key_b64 = BASE64_STANDARD.encode(key);

        let envelope = TokenEnvelope::from_key(&key_b64).unwrap();
        let ciphertext = envelope.encrypt("some-token-id").unwrap();
        assert_eq!(envelope.decrypt(&ciphertext).unwrap(), "some-token-id");
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let envelope = TokenEnvelope::from_key(&TokenEnvelope::generate_key()).unwrap();
        let a = envelope.encrypt("same-id").unwrap();
        let b = envelope.encrypt("same-id").unwrap();
        // 随机 nonce，密文不同，但均可解密
        assert_ne!(a, b);
        assert_eq!(envelope.decrypt(&a).unwrap(), "same-id");
        assert_eq!(envelope.decrypt(&b).unwrap(), "same-id");
    }

    #[test]
    fn test_invalid_key_length() {
        let result = TokenEnvelope::from_key("too-short");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid envelope key length")
        );
    }

    #[test]
    fn test_invalid_key_hex() {
        let invalid_hex = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz";
        assert!(TokenEnvelope::from_key(invalid_hex).is_err());
    }

    #[test]
    fn test_decrypt_with_foreign_key_fails() {
        let envelope1 = TokenEnvelope::from_key(&TokenEnvelope::generate_key()).unwrap();
        let envelope2 = TokenEnvelope::from_key(&TokenEnvelope::generate_key()).unwrap();

        let ciphertext = envelope1.encrypt("secret-id").unwrap();
        let result = envelope2.decrypt(&ciphertext);
        assert!(matches!(result, Err(TksError::InvalidEnvelope)));
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails() {
        let envelope = TokenEnvelope::from_key(&TokenEnvelope::generate_key()).unwrap();
        let ciphertext = envelope.encrypt("secret-id").unwrap();

        let mut bytes = BASE64_STANDARD.decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64_STANDARD.encode(&bytes);

        assert!(matches!(
            envelope.decrypt(&tampered),
            Err(TksError::InvalidEnvelope)
        ));
    }

    #[test]
    fn test_decrypt_garbage_inputs() {
        let envelope = TokenEnvelope::from_key(&TokenEnvelope::generate_key()).unwrap();

        assert!(matches!(
            envelope.decrypt("not-valid-base64!!!"),
            Err(TksError::InvalidEnvelope)
        ));

        // 合法 base64 但长度不足 nonce + tag
        let short = BASE64_STANDARD.encode([0u8; 10]);
        assert!(matches!(
            envelope.decrypt(&short),
            Err(TksError::InvalidEnvelope)
        ));
    }

    #[test]
    fn test_secret_source_from_environment() {
        let key = TokenEnvelope::generate_key();
        unsafe {
            std::env::set_var("TEST_TKS_ENVELOPE_KEY", &key);
        }

        let source = SecretSource::Environment("TEST_TKS_ENVELOPE_KEY".to_string());
        let envelope = TokenEnvelope::from_source(&source).unwrap();
        let ct = envelope.encrypt("x").unwrap();
        assert_eq!(envelope.decrypt(&ct).unwrap(), "x");

        unsafe {
            std::env::remove_var("TEST_TKS_ENVELOPE_KEY");
        }
    }

    #[test]
    fn test_secret_source_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let key = TokenEnvelope::generate_key();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{key}").unwrap();
        file.flush().unwrap();

        let source = SecretSource::File(file.path().to_string_lossy().to_string());
        assert!(TokenEnvelope::from_source(&source).is_ok());
    }

    #[test]
    fn test_generate_key_format() {
        let key = TokenEnvelope::generate_key();
        assert_eq!(key.len(), 64);
        assert!(TokenEnvelope::from_key(&key).is_ok());
    }
}
