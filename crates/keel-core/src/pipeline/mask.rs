//! 分发掩码计算与按类型缓存。
//!
//! # 核心逻辑（How）
//! - 以 Handler 的动态类型为键，把声明的事件集合裁剪到合法事件全集后缓存；
//! - 缓存是线程局部的 `TypeId → EventMask` 表：反应器线程各自持有一份，
//!   读取无须任何同步。
//!
//! # 契约说明（What）
//! - 掩码位与"类型覆写了该事件"严格一一对应：声明即覆写，未声明即跳过；
//! - 同一类型的声明必须恒定，逐实例变化会命中过期缓存。

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::pipeline::handler::{ChannelHandler, EventMask};

thread_local! {
    static MASK_CACHE: RefCell<HashMap<TypeId, EventMask>> = RefCell::new(HashMap::new());
}

/// 计算（或从缓存取回）Handler 类型的分发掩码。
pub fn mask_for(handler: &dyn ChannelHandler) -> EventMask {
    let type_id = handler.as_any().type_id();
    MASK_CACHE.with(|cache| {
        if let Some(mask) = cache.borrow().get(&type_id) {
            return *mask;
        }
        let mask = handler.handled_events() & EventMask::all();
        cache.borrow_mut().insert(type_id, mask);
        mask
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct ReadOnly;

    impl ChannelHandler for ReadOnly {
        fn handled_events(&self) -> EventMask {
            EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Everything;

    impl ChannelHandler for Everything {
        fn handled_events(&self) -> EventMask {
            EventMask::ALL_INBOUND | EventMask::ALL_OUTBOUND | EventMask::EXCEPTION_CAUGHT
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn mask_reflects_declaration_exactly() {
        let mask = mask_for(&ReadOnly);
        assert!(mask.contains(EventMask::CHANNEL_READ));
        assert!(mask.contains(EventMask::EXCEPTION_CAUGHT));
        assert!(!mask.contains(EventMask::CHANNEL_ACTIVE));
        assert!(!mask.contains(EventMask::WRITE));
    }

    #[test]
    fn full_declaration_covers_all_seventeen_events() {
        let mask = mask_for(&Everything);
        assert_eq!(mask, EventMask::all());
        assert_eq!(mask.bits().count_ones(), 17);
    }

    #[test]
    fn cache_returns_stable_masks_per_type() {
        let first = mask_for(&ReadOnly);
        let second = mask_for(&ReadOnly);
        assert_eq!(first, second);
        assert_ne!(mask_for(&Everything), first);
    }
}
