//! 对象存储配置（StoreConfig）
//!
//! 可由构建器组装，也可从 JSON 加载；缺省字段取默认值。
//!
use bon::Builder;
use nos_domain::encryption::{DataEncryption, KeyedCipher, NoEncryption};
use nos_domain::error::{StoreError, StoreResult};
use nos_domain::key::KeyKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 静态数据加密配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncryptionConfig {
    #[default]
    None,
    Keyed {
        key: String,
    },
}

impl EncryptionConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptionConfig::None)
    }

    pub fn cipher(&self) -> StoreResult<Arc<dyn DataEncryption>> {
        match self {
            EncryptionConfig::None => Ok(Arc::new(NoEncryption)),
            EncryptionConfig::Keyed { key } => Ok(Arc::new(KeyedCipher::new(key)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 每次向存储预取的标识数量
    #[builder(default = 10)]
    id_batch_size: u64,
    /// 持久主键的变体
    #[builder(default)]
    key_kind: KeyKind,
    #[builder(default)]
    encryption: EncryptionConfig,
    #[builder(default = 3_000)]
    connect_timeout_ms: u64,
    #[builder(default = 10_000)]
    read_timeout_ms: u64,
    /// 文件存储服务端等待记录锁的上限
    #[builder(default = 2_000)]
    lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| StoreError::Configuration {
            reason: format!("invalid store config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.id_batch_size == 0 {
            return Err(StoreError::Configuration {
                reason: "id_batch_size must be at least 1".to_string(),
            });
        }
        if let EncryptionConfig::Keyed { key } = &self.encryption {
            if key.is_empty() {
                return Err(StoreError::Configuration {
                    reason: "encryption key must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn id_batch_size(&self) -> u64 {
        self.id_batch_size
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn encryption(&self) -> &EncryptionConfig {
        &self.encryption
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
