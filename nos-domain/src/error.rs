//! 对象存储统一错误定义
//!
//! 覆盖标识/主键、版本与序列、映射配置、事务状态、传输可用性等错误，
//! 各存储后端与门面统一转换为 `StoreError`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    // --- 配置 ---
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    #[error("type has no persistable fields: {type_name}")]
    NoPersistableFields { type_name: String },
    #[error("no specification for type: {type_name}")]
    MissingSpecification { type_name: String },
    #[error("unknown field: type={type_name}, field={field}")]
    UnknownField { type_name: String, field: String },

    // --- 前置条件/状态 ---
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },
    #[error("precondition failed: {reason}")]
    Precondition { reason: String },
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
    #[error("reference to non-persistent object: field={field}, target={reference}")]
    DanglingReference { field: String, reference: String },
    #[error("object is not independently persistable: {type_name}")]
    NotIndependentlyPersistable { type_name: String },
    #[error("transaction already complete: {id}")]
    TransactionAlreadyComplete { id: String },
    #[error("unsupported query: {kind}")]
    UnsupportedQuery { kind: String },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    // --- 并发/完整性 ---
    #[error("optimistic lock failure: object={reference}, expected=v{expected}, actual=v{actual}")]
    OptimisticLock {
        reference: String,
        expected: u64,
        actual: u64,
    },
    #[error("sequence exhausted: sequence={sequence}, next={next}, limit={limit}")]
    SequenceExhausted {
        sequence: String,
        next: u64,
        limit: u64,
    },
    #[error("record locked by another transaction: {reference}")]
    LockConflict { reference: String },
    #[error("duplicate key: {reference}")]
    DuplicateKey { reference: String },
    #[error("integrity error: {reason}")]
    Integrity { reason: String },

    // --- 传输/可用性 ---
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    #[error("store timeout: {reason}")]
    StoreTimeout { reason: String },
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    // --- 查找 ---
    #[error("object not found: {reference}")]
    ObjectNotFound { reference: String },

    // --- 解析/序列化 ---
    #[error("malformed key: input={input:?}, reason={reason}")]
    MalformedKey { input: String, reason: String },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

/// 错误分类，对应调用方的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 初始化/注册阶段即失败
    Configuration,
    /// 编程错误：前置条件或状态不满足
    State,
    /// 可由调用方整体重试
    Concurrency,
    /// 连接、超时、报文格式
    Transport,
    NotFound,
    /// 存储数据无法解码
    Data,
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Configuration { .. }
            | StoreError::NoPersistableFields { .. }
            | StoreError::MissingSpecification { .. }
            | StoreError::UnknownField { .. } => ErrorCategory::Configuration,
            StoreError::IllegalState { .. }
            | StoreError::Precondition { .. }
            | StoreError::InvalidValue { .. }
            | StoreError::DanglingReference { .. }
            | StoreError::NotIndependentlyPersistable { .. }
            | StoreError::TransactionAlreadyComplete { .. }
            | StoreError::UnsupportedQuery { .. }
            | StoreError::TypeMismatch { .. } => ErrorCategory::State,
            StoreError::OptimisticLock { .. }
            | StoreError::SequenceExhausted { .. }
            | StoreError::LockConflict { .. }
            | StoreError::DuplicateKey { .. } => ErrorCategory::Concurrency,
            StoreError::StoreUnavailable { .. }
            | StoreError::StoreTimeout { .. }
            | StoreError::Protocol { .. }
            | StoreError::Io { .. } => ErrorCategory::Transport,
            StoreError::ObjectNotFound { .. } => ErrorCategory::NotFound,
            StoreError::Integrity { .. }
            | StoreError::MalformedKey { .. }
            | StoreError::Parse { .. }
            | StoreError::Serde { .. } => ErrorCategory::Data,
        }
    }

    /// 并发类错误可由调用方重试整个操作；本层从不自动重试
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Concurrency
    }

    pub fn illegal_state(reason: impl Into<String>) -> Self {
        StoreError::IllegalState {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        StoreError::Protocol {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::num::ParseIntError> for StoreError {
    fn from(err: std::num::ParseIntError) -> Self {
        StoreError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::num::ParseFloatError> for StoreError {
    fn from(err: std::num::ParseFloatError) -> Self {
        StoreError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::str::ParseBoolError> for StoreError {
    fn from(err: std::str::ParseBoolError) -> Self {
        StoreError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for StoreError {
    fn from(err: chrono::ParseError) -> Self {
        StoreError::Parse {
            reason: err.to_string(),
        }
    }
}
