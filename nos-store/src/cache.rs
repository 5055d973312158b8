//! 对象缓存（identity map）
//!
//! 每个标识在一个对象存储内只对应一个适配器实例。创建后提交时，
//! 对象以提升后的标识重新登记，并清除前驱标识。
//!
//! 缓存只保存弱引用：调用方与其他对象的引用字段不再持有某个对象时，它即被释放，
//! 对应条目在下一次清理时移除。清理在登记新条目、条目数到达阈值时进行，阈值随存活条目数翻倍。
//!
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nos_domain::adapter::{ObjectAdapter, ObjectRef};
use nos_domain::oid::Oid;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const MIN_PRUNE_THRESHOLD: usize = 64;

pub struct ObjectCache {
    objects: DashMap<Oid, Weak<ObjectAdapter>>,
    prune_at: AtomicUsize,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            prune_at: AtomicUsize::new(MIN_PRUNE_THRESHOLD),
        }
    }
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记根对象；内嵌对象没有独立标识，忽略
    pub fn add(&self, object: &ObjectRef) {
        if let Some(oid) = object.oid() {
            self.objects.insert(oid, Arc::downgrade(object));
            self.maybe_prune();
        }
    }

    pub fn get(&self, oid: &Oid) -> Option<ObjectRef> {
        let found = self.objects.get(oid).and_then(|o| o.value().upgrade());
        if found.is_none() {
            self.objects.remove_if(oid, |_, o| o.strong_count() == 0);
        }
        found
    }

    /// 存活的实例，或由 `create` 新建并登记的实例
    pub fn get_or_insert_with(&self, oid: Oid, create: impl FnOnce() -> ObjectRef) -> ObjectRef {
        let object = match self.objects.entry(oid) {
            Entry::Occupied(mut entry) => {
                if let Some(object) = entry.get().upgrade() {
                    return object;
                }
                let object = create();
                entry.insert(Arc::downgrade(&object));
                object
            }
            Entry::Vacant(entry) => {
                let object = create();
                entry.insert(Arc::downgrade(&object));
                object
            }
        };
        self.maybe_prune();
        object
    }

    /// 以当前标识重新登记并清除前驱
    pub fn reconcile(&self, object: &ObjectRef) {
        if let Some(previous) = object.previous_oid() {
            self.objects.remove(&previous);
        }
        self.add(object);
        object.clear_previous();
    }

    pub fn remove(&self, oid: &Oid) -> Option<ObjectRef> {
        self.objects.remove(oid).and_then(|(_, o)| o.upgrade())
    }

    /// 移除已释放对象的条目，返回移除数
    pub fn prune(&self) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, o| o.strong_count() > 0);
        let live = self.objects.len();
        self.prune_at
            .store((live * 2).max(MIN_PRUNE_THRESHOLD), Ordering::Relaxed);
        let removed = before.saturating_sub(live);
        if removed > 0 {
            tracing::trace!(target: "nos::store", removed, live, "pruned object cache");
        }
        removed
    }

    fn maybe_prune(&self) {
        if self.objects.len() >= self.prune_at.load(Ordering::Relaxed) {
            self.prune();
        }
    }

    /// 条目数，含尚未清理的已释放条目
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
