//! 进程级键注册表：保证同名键全局唯一。
//!
//! # 契约说明（What）
//! - 同名必同键：`lookup_or_insert` 对同一名字永远返回同一序号；
//! - 显式独占创建：`insert_unique` 在重名时返回
//!   [`codes::KEY_DUPLICATE`](crate::error::codes::KEY_DUPLICATE)；
//! - 序号自小临界区内分配，创建后只读，读取路径无锁。

use std::any::TypeId;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{CoreError, Result, codes};

pub(crate) struct KeyRegistry {
    entries: Mutex<HashMap<&'static str, (usize, TypeId)>>,
}

impl KeyRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 取回或登记一个键；类型不一致视作重名冲突。
    pub(crate) fn lookup_or_insert(&self, name: &'static str, ty: TypeId) -> Result<usize> {
        let mut entries = self.entries.lock();
        if let Some((id, existing)) = entries.get(name) {
            if *existing != ty {
                return Err(CoreError::new(
                    codes::KEY_DUPLICATE,
                    format!("key `{name}` already registered with a different value type"),
                ));
            }
            return Ok(*id);
        }
        let id = entries.len();
        entries.insert(name, (id, ty));
        Ok(id)
    }

    /// 独占登记：重名即错，供要求"首次定义"语义的调用方使用。
    pub(crate) fn insert_unique(&self, name: &'static str, ty: TypeId) -> Result<usize> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(CoreError::new(
                codes::KEY_DUPLICATE,
                format!("key `{name}` already exists"),
            ));
        }
        let id = entries.len();
        entries.insert(name, (id, ty));
        Ok(id)
    }
}
