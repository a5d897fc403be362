//! 就绪选择器契约：反应器消费的 OS 多路复用接口。
//!
//! # 设计背景（Why）
//! - 核心只规定"注册兴趣集、带超时等待、枚举就绪键、跨线程唤醒"四项能力，
//!   具体落在 epoll/kqueue 还是测试桩由传输实现层决定；
//! - 选择器重建路径要求能够随时开出一个全新实例并重放注册，因此工厂
//!   [`SelectorProvider`] 与实例 [`Selector`] 分离。
//!
//! # 契约说明（What）
//! - [`Selector`] 的全部方法仅允许在持有它的反应器工作线程上调用；
//!   [`SelectorWaker`] 是唯一的跨线程入口；
//! - `select` 把就绪键追加进调用方提供的缓冲并返回本轮数量，缓冲由
//!   调用方复用以避免每轮分配。

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// 注册到选择器的兴趣集。
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterestSet: u8 {
        /// 关注可读（对监听套接字即"有连接可接受"）。
        const READABLE = 0b01;
        /// 关注可写。
        const WRITABLE = 0b10;
    }
}

bitflags! {
    /// 选择器报告的就绪操作集。
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ReadyOps: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        /// 对端错误，读写路径都应按失败处理。
        const ERROR = 0b0100;
        /// 对端挂断。
        const HUP = 0b1000;
    }
}

/// 选择键：反应器为每个注册源分配的稳定标识。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectionToken(pub usize);

impl fmt::Debug for SelectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// 一次 `select` 产出的就绪键。
#[derive(Clone, Copy, Debug)]
pub struct ReadyEvent {
    pub token: SelectionToken,
    pub ops: ReadyOps,
}

/// 可注册进选择器的 IO 源。
///
/// # 契约说明（What）
/// - 传输实现通过 `as_any_mut` 向配套的选择器实现暴露底层套接字类型；
///   选择器遇到无法识别的源时返回
///   [`codes::SELECTOR_SOURCE_MISMATCH`](crate::error::codes::SELECTOR_SOURCE_MISMATCH)。
pub trait IoSource: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// 跨线程唤醒句柄；`wake` 必须是可重入且幂等的。
pub trait SelectorWaker: Send + Sync {
    fn wake(&self);
}

/// 就绪选择器。
pub trait Selector: Send {
    /// 以指定兴趣集注册 IO 源。
    fn register(
        &mut self,
        source: &mut dyn IoSource,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()>;

    /// 调整已注册源的兴趣集。
    fn reregister(
        &mut self,
        source: &mut dyn IoSource,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()>;

    /// 取消注册。
    fn deregister(&mut self, source: &mut dyn IoSource, token: SelectionToken) -> Result<()>;

    /// 等待就绪事件，把就绪键追加进 `events` 并返回本轮数量。
    ///
    /// `timeout` 为 `None` 表示无限等待，`Some(0)` 表示非阻塞轮询。
    fn select(&mut self, timeout: Option<Duration>, events: &mut Vec<ReadyEvent>) -> Result<usize>;

    /// 返回可跨线程使用的唤醒句柄。
    fn waker(&self) -> Arc<dyn SelectorWaker>;
}

/// 选择器工厂：反应器构造与重建路径共用的开口。
pub trait SelectorProvider: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn Selector>>;
}
