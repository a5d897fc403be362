//! 类型化属性键与每通道属性表。
//!
//! # 设计背景（Why）
//! - 引导器与 Handler 需要在通道上携带任意业务状态（会话、配额、标记……），
//!   但不能污染通道结构本身；
//! - 键在进程内按名字全局唯一，值按通道隔离。

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::channel::registry::KeyRegistry;
use crate::error::Result;

static ATTRIBUTE_KEYS: LazyLock<KeyRegistry> = LazyLock::new(KeyRegistry::new);

/// 进程级唯一的类型化属性键。
///
/// # 契约说明（What）
/// - `of` 对同一名字永远返回同一键（取回或登记）；
/// - `new_unique` 要求名字首次出现，重名返回结构化错误；
/// - 同名键以不同值类型再次创建同样按重名冲突处理。
pub struct AttributeKey<T> {
    id: usize,
    name: &'static str,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T: Send + Sync + 'static> AttributeKey<T> {
    /// 取回或登记同名键。
    pub fn of(name: &'static str) -> Result<Self> {
        let id = ATTRIBUTE_KEYS.lookup_or_insert(name, TypeId::of::<T>())?;
        Ok(Self {
            id,
            name,
            _marker: PhantomData,
        })
    }

    /// 独占登记；名字已存在时返回
    /// [`codes::KEY_DUPLICATE`](crate::error::codes::KEY_DUPLICATE)。
    pub fn new_unique(name: &'static str) -> Result<Self> {
        let id = ATTRIBUTE_KEYS.insert_unique(name, TypeId::of::<T>())?;
        Ok(Self {
            id,
            name,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl<T> std::fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

/// 每通道属性表；键级更新并发安全。
#[derive(Default)]
pub struct AttributeMap {
    values: DashMap<usize, Arc<dyn Any + Send + Sync>>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入属性值，返回旧值（若有）。
    pub fn set<T: Send + Sync + 'static>(&self, key: AttributeKey<T>, value: T) -> Option<Arc<T>> {
        self.values
            .insert(key.id(), Arc::new(value))
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// 读取属性值。
    pub fn get<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<Arc<T>> {
        self.values
            .get(&key.id())
            .and_then(|value| Arc::clone(value.value()).downcast::<T>().ok())
    }

    /// 移除属性值，返回被移除的值（若有）。
    pub fn remove<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<Arc<T>> {
        self.values
            .remove(&key.id())
            .and_then(|(_, old)| old.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeMap")
            .field("len", &self.values.len())
            .finish()
    }
}

type AttributeApply = Box<dyn Fn(&AttributeMap) + Send + Sync>;

struct AttributeEntry {
    name: &'static str,
    apply: AttributeApply,
}

/// 引导器使用的属性声明集合：按声明顺序写入目标属性表，`None` 撤销声明。
#[derive(Default)]
pub struct AttributeValues {
    entries: Vec<AttributeEntry>,
}

impl AttributeValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明或撤销一个属性；同名重声明就地替换并保留顺序位。
    pub fn set<T: Clone + Send + Sync + 'static>(
        &mut self,
        key: AttributeKey<T>,
        value: Option<T>,
    ) {
        match value {
            None => self.entries.retain(|entry| entry.name != key.name()),
            Some(value) => {
                let apply: AttributeApply = Box::new(move |attrs| {
                    attrs.set(key, value.clone());
                });
                match self
                    .entries
                    .iter_mut()
                    .find(|entry| entry.name == key.name())
                {
                    Some(entry) => entry.apply = apply,
                    None => self.entries.push(AttributeEntry {
                        name: key.name(),
                        apply,
                    }),
                }
            }
        }
    }

    /// 按声明顺序写入目标属性表。
    pub fn apply(&self, attrs: &AttributeMap) {
        for entry in &self.entries {
            (entry.apply)(attrs);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for AttributeValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_key() {
        let a = AttributeKey::<u32>::of("attr.tests.same").expect("first");
        let b = AttributeKey::<u32>::of("attr.tests.same").expect("second");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn unique_key_rejects_duplicates() {
        AttributeKey::<u32>::new_unique("attr.tests.unique").expect("first definition");
        let err = AttributeKey::<u32>::new_unique("attr.tests.unique")
            .expect_err("duplicate definition must fail");
        assert_eq!(err.code(), crate::error::codes::KEY_DUPLICATE);
    }

    #[test]
    fn mismatched_type_is_a_conflict() {
        AttributeKey::<u32>::of("attr.tests.typed").expect("as u32");
        let err = AttributeKey::<String>::of("attr.tests.typed").expect_err("as String must fail");
        assert_eq!(err.code(), crate::error::codes::KEY_DUPLICATE);
    }

    #[test]
    fn map_roundtrip_and_remove() {
        let key = AttributeKey::<u64>::of("attr.tests.roundtrip").expect("key");
        let map = AttributeMap::new();
        assert!(map.get(key).is_none());
        map.set(key, 42);
        assert_eq!(map.get(key).as_deref(), Some(&42));
        assert_eq!(map.remove(key).as_deref(), Some(&42));
        assert!(map.get(key).is_none());
    }
}
