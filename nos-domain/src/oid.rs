//! 对象标识（Oid）
//!
//! 标识一个可持久化对象实例：逻辑类型名 + 主键 + 生命周期状态。
//! 新对象以临时（Transient）标识创建，首次保存时通过 `set_id` + `make_persistent`
//! 提升为持久标识，并保留一代“前一个标识”供缓存对账使用。
//!
//! 相等与哈希只看（类型名, 主键），与状态和前驱无关。
//!
use crate::error::{StoreError, StoreResult};
use crate::key::{KeyKind, PrimaryKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OidState {
    Transient,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oid {
    type_name: String,
    key: PrimaryKey,
    state: OidState,
    /// 待提升的新主键
    staged: Option<PrimaryKey>,
    /// 提升前的快照，仅保留一代
    previous: Option<Box<Oid>>,
}

impl Oid {
    /// 临时标识的主键为本地生成的负数占位值，不会与存储分配的主键冲突
    pub fn create_transient(type_name: impl Into<String>, serial_no: u64) -> Self {
        let placeholder = -i64::try_from(serial_no).unwrap_or(i64::MAX);
        Self {
            type_name: type_name.into(),
            key: PrimaryKey::Integer(placeholder),
            state: OidState::Transient,
            staged: None,
            previous: None,
        }
    }

    pub fn create_persistent(type_name: impl Into<String>, key: PrimaryKey) -> Self {
        Self {
            type_name: type_name.into(),
            key,
            state: OidState::Persistent,
            staged: None,
            previous: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn state(&self) -> OidState {
        self.state
    }

    pub fn is_transient(&self) -> bool {
        self.state == OidState::Transient
    }

    pub fn is_persistent(&self) -> bool {
        self.state == OidState::Persistent
    }

    pub fn staged_key(&self) -> Option<&PrimaryKey> {
        self.staged.as_ref()
    }

    /// 暂存提升用的新主键
    pub fn set_id(&mut self, key: PrimaryKey) -> StoreResult<()> {
        if self.is_persistent() {
            return Err(StoreError::illegal_state(format!(
                "cannot stage a new key on persistent oid {self}"
            )));
        }
        self.staged = Some(key);
        Ok(())
    }

    /// 提升为持久标识：替换主键，并把调用前的快照记为前驱
    pub fn make_persistent(&mut self) -> StoreResult<()> {
        if self.is_persistent() {
            return Err(StoreError::illegal_state(format!(
                "oid {self} is already persistent"
            )));
        }
        let Some(key) = self.staged.take() else {
            return Err(StoreError::Precondition {
                reason: format!("no key staged for transient oid {self}"),
            });
        };

        let mut snapshot = self.clone();
        snapshot.staged = Some(key.clone());
        snapshot.previous = None;

        self.key = key;
        self.state = OidState::Persistent;
        self.previous = Some(Box::new(snapshot));
        Ok(())
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    pub fn previous(&self) -> Option<&Oid> {
        self.previous.as_deref()
    }

    pub fn clear_previous(&mut self) {
        self.previous = None;
    }

    /// 撤销一次提升，恢复为前驱（事务回滚时使用）
    pub fn revert_promotion(&mut self) -> bool {
        match self.previous.take() {
            Some(previous) => {
                *self = *previous;
                self.staged = None;
                true
            }
            None => false,
        }
    }

    /// `类型名@主键`，主键按 `PrimaryKey::reference_text` 转义
    pub fn reference_string(&self) -> String {
        format!("{}@{}", self.type_name, self.key.reference_text())
    }

    /// 解析引用串，所得标识为持久状态
    pub fn parse_reference(reference: &str, kind: KeyKind) -> StoreResult<Self> {
        let Some((type_name, key)) = reference.rsplit_once('@') else {
            return Err(StoreError::MalformedKey {
                input: reference.to_string(),
                reason: "expected <type>@<key>".to_string(),
            });
        };
        if type_name.is_empty() {
            return Err(StoreError::MalformedKey {
                input: reference.to_string(),
                reason: "empty type name".to_string(),
            });
        }
        Ok(Self::create_persistent(
            type_name,
            PrimaryKey::parse_reference_text(kind, key)?,
        ))
    }

    /// 传输编码：保留类型名、主键、暂存主键、前驱与状态
    pub fn encode(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(encoded)?)
    }
}

impl PartialEq for Oid {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.key == other.key
    }
}

impl Eq for Oid {}

impl Hash for Oid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn transient_oid_has_negative_placeholder() {
        let oid = Oid::create_transient("Widget", 3);
        assert!(oid.is_transient());
        assert_eq!(oid.key(), &PrimaryKey::Integer(-3));
        assert!(!oid.has_previous());
    }

    #[test]
    fn promotion_round_trip() {
        let mut oid = Oid::create_transient("Widget", 1);
        oid.set_id(PrimaryKey::Integer(1)).unwrap();
        let before = oid.clone();

        oid.make_persistent().unwrap();

        assert_eq!(oid.state(), OidState::Persistent);
        assert_eq!(oid.key(), &PrimaryKey::Integer(1));
        assert!(oid.has_previous());
        let previous = oid.previous().unwrap();
        assert_eq!(previous, &before);
        assert!(previous.is_transient());
        assert!(!previous.has_previous());

        match oid.make_persistent() {
            Err(StoreError::IllegalState { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }

        oid.clear_previous();
        assert!(!oid.has_previous());
        // 无前驱时清除是空操作
        oid.clear_previous();
    }

    #[test]
    fn make_persistent_without_staged_key_fails() {
        let mut oid = Oid::create_transient("Widget", 1);
        match oid.make_persistent() {
            Err(StoreError::Precondition { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(oid.is_transient());
    }

    #[test]
    fn set_id_on_persistent_fails() {
        let mut oid = Oid::create_persistent("Widget", PrimaryKey::Integer(9));
        match oid.set_id(PrimaryKey::Integer(10)) {
            Err(StoreError::IllegalState { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn equality_ignores_state_and_previous() {
        let mut promoted = Oid::create_transient("Widget", 5);
        promoted.set_id(PrimaryKey::Integer(12)).unwrap();
        promoted.make_persistent().unwrap();
        let plain = Oid::create_persistent("Widget", PrimaryKey::Integer(12));
        assert_eq!(promoted, plain);

        let mut map = HashMap::new();
        map.insert(plain, "cached");
        assert_eq!(map.get(&promoted), Some(&"cached"));

        assert_ne!(plain_of("Widget", 12), plain_of("Gadget", 12));
    }

    fn plain_of(type_name: &str, key: i64) -> Oid {
        Oid::create_persistent(type_name, PrimaryKey::Integer(key))
    }

    #[test]
    fn revert_restores_transient_identity() {
        let mut oid = Oid::create_transient("Widget", 2);
        oid.set_id(PrimaryKey::Integer(40)).unwrap();
        oid.make_persistent().unwrap();
        assert!(oid.revert_promotion());
        assert!(oid.is_transient());
        assert_eq!(oid.key(), &PrimaryKey::Integer(-2));
        assert!(oid.staged_key().is_none());
        assert!(!oid.revert_promotion());
    }

    #[test]
    fn reference_string_round_trips() {
        let oid = Oid::create_persistent("Widget", PrimaryKey::Serial(0xab));
        assert_eq!(oid.reference_string(), "Widget@ab");
        let parsed = Oid::parse_reference("Widget@ab", KeyKind::Serial).unwrap();
        assert_eq!(parsed, oid);
        assert!(Oid::parse_reference("Widget", KeyKind::Serial).is_err());
        assert!(Oid::parse_reference("@1", KeyKind::Integer).is_err());
    }

    #[test]
    fn string_keys_with_delimiters_survive_references() {
        let oid = Oid::create_persistent("Customer", PrimaryKey::String("ann@example.org|50%".into()));
        let reference = oid.reference_string();
        assert_eq!(reference, "Customer@ann%40example.org%7C50%25");
        assert!(!reference.contains('|'));
        assert_eq!(reference.matches('@').count(), 1);

        let parsed = Oid::parse_reference(&reference, KeyKind::String).unwrap();
        assert_eq!(parsed.key(), oid.key());
        assert_eq!(parsed, oid);

        assert!(matches!(
            Oid::parse_reference("Customer@ann%4", KeyKind::String),
            Err(StoreError::MalformedKey { .. })
        ));
        // 不含特殊字符的主键不变
        assert_eq!(
            Oid::create_persistent("Customer", PrimaryKey::String("ann".into())).reference_string(),
            "Customer@ann"
        );
    }

    #[test]
    fn transport_encoding_preserves_everything() {
        let mut oid = Oid::create_transient("Widget", 8);
        oid.set_id(PrimaryKey::Integer(3)).unwrap();
        let staged = Oid::decode(&oid.encode().unwrap()).unwrap();
        assert_eq!(staged.staged_key(), Some(&PrimaryKey::Integer(3)));
        assert!(staged.is_transient());

        oid.make_persistent().unwrap();
        let decoded = Oid::decode(&oid.encode().unwrap()).unwrap();
        assert_eq!(decoded, oid);
        assert_eq!(decoded.state(), OidState::Persistent);
        assert_eq!(decoded.type_name(), "Widget");
        assert_eq!(decoded.previous().unwrap().key(), &PrimaryKey::Integer(-8));
    }
}
