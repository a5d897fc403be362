//! 通道契约：单个网络端点的抽象与其共享骨架。
//!
//! # 体系定位（Architecture）
//! - [`Channel`] 是传输实现必须满足的对象安全契约：身份、配置、属性表、
//!   管道、反应器归属与 IO 挂接钩子；
//! - [`ChannelCore`] 是所有实现共用的骨架结构，承载状态机、归属绑定与
//!   关闭 Promise，避免每个传输重复实现生命周期细节；
//! - [`Transport`] 是管道头部哨兵消费的底层操作面。
//!
//! # 线程模型（Concurrency）
//! - 出站便捷方法可从任意线程调用，内部经管道（必要时入队）转到归属
//!   反应器；`register_io`/`process_ready` 等钩子仅允许反应器线程调用。

mod attrs;
mod config;
mod registry;

pub use attrs::{AttributeKey, AttributeMap, AttributeValues};
pub use config::{ChannelConfig, ChannelOption, ChannelOptions, options};

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{CoreError, Result, codes};
use crate::executor::{EventExecutor, ImmediateExecutor, Reactor};
use crate::future::{ChannelFuture, ChannelPromise};
use crate::pipeline::Pipeline;
use crate::selector::{InterestSet, ReadyOps, SelectionToken, Selector};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 通道的进程内稳定身份，用于日志关联。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 短文本形式（十六进制序号）。
    pub fn short_text(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 通道生命周期状态，迁移严格单调：
/// `Unregistered → Registered → Active → Closed`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Unregistered = 0,
    Registered = 1,
    Active = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Unregistered,
            1 => ChannelState::Registered,
            2 => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }
}

/// 在管道中流动的消息负载。
///
/// # 契约说明（What）
/// - `Bytes` 是引用计数负载：落到尾哨兵未被消费时，释放即丢弃引用；
/// - `Channel` 仅出现在服务器管道的读事件上，负载是新接受的子通道；
/// - `User` 承载业务自定义负载。
pub enum PipelineMessage {
    Bytes(Bytes),
    Channel(Arc<dyn Channel>),
    User(Box<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 负载的简短描述，用于尾哨兵告警。
    pub fn describe(&self) -> &'static str {
        match self {
            PipelineMessage::Bytes(_) => "bytes",
            PipelineMessage::Channel(_) => "channel",
            PipelineMessage::User(_) => "user",
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            PipelineMessage::Channel(channel) => write!(f, "Channel({})", channel.id()),
            PipelineMessage::User(_) => write!(f, "User(..)"),
        }
    }
}

/// 通道工厂：引导器据此实例化监听通道。
pub trait ChannelFactory: Send + Sync + 'static {
    fn new_channel(&self) -> Result<Arc<dyn Channel>>;
}

/// 管道头部哨兵消费的底层传输操作面。
///
/// # 契约说明（What）
/// - 全部方法仅在通道归属的反应器线程上被调用；
/// - 携带 Promise 的操作必须恰好完成该 Promise 一次（成功或失败）；
/// - 就绪事件经由反应器回流到 [`Channel::process_ready`]，再翻译成
///   入站管道事件。
pub trait Transport: Send + Sync {
    fn bind(&self, addr: SocketAddr, promise: ChannelPromise);
    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise);
    fn disconnect(&self, promise: ChannelPromise);
    fn close(&self, promise: ChannelPromise);
    fn deregister(&self, promise: ChannelPromise);
    /// 请求传输层继续产出入站数据（auto-read 与显式 `read()` 的汇聚点）。
    fn begin_read(&self);
    fn write(&self, msg: PipelineMessage, promise: ChannelPromise);
    fn flush(&self);
}

/// 单个网络端点的对象安全契约。
///
/// # 实现约定（Contract）
/// - 实现者内嵌一个 [`ChannelCore`] 并在构造后调用 [`ChannelCore::adopt`]
///   装配管道；
/// - `register_io` 在通道尚无底层套接字时应当直接返回 `Ok(())`
///   （监听通道在 `bind` 之前就是这种状态），反应器的选择器重建路径
///   依赖该约定重放注册。
pub trait Channel: Send + Sync + 'static {
    /// 共享骨架访问器；默认方法全部建立在它之上。
    fn core(&self) -> &ChannelCore;

    /// 头部哨兵使用的传输操作面。
    fn transport(&self) -> &dyn Transport;

    /// 把底层 IO 源挂到选择器（反应器线程专用）。
    fn register_io(
        &self,
        selector: &mut dyn Selector,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()>;

    /// 调整兴趣集（反应器线程专用）。
    fn reregister_io(
        &self,
        selector: &mut dyn Selector,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()>;

    /// 从选择器摘除（反应器线程专用）。
    fn deregister_io(&self, selector: &mut dyn Selector) -> Result<()>;

    /// 处理一次就绪事件（反应器线程专用）。
    fn process_ready(&self, ops: ReadyOps);

    /// 传输层是否已处于可收发状态（已接受的连接在注册前即为真）。
    fn is_transport_active(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 出站缓冲是否低于高水位。
    fn is_writable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;

    // ------------------------------------------------------------ 默认操作面

    fn id(&self) -> ChannelId {
        self.core().id()
    }

    fn pipeline(&self) -> Arc<Pipeline> {
        self.core().pipeline()
    }

    fn config(&self) -> &ChannelConfig {
        self.core().config()
    }

    fn attrs(&self) -> &AttributeMap {
        self.core().attrs()
    }

    fn reactor(&self) -> Option<Arc<Reactor>> {
        self.core().reactor()
    }

    fn state(&self) -> ChannelState {
        self.core().state()
    }

    fn is_registered(&self) -> bool {
        self.core().state() >= ChannelState::Registered
    }

    fn is_active(&self) -> bool {
        self.core().state() == ChannelState::Active
    }

    /// 通道关闭完成时刻的观察点。
    fn closed_future(&self) -> ChannelFuture {
        self.core().closed_future()
    }

    fn bind(&self, addr: SocketAddr) -> ChannelFuture {
        self.pipeline().bind(addr)
    }

    fn connect(&self, addr: SocketAddr) -> ChannelFuture {
        self.pipeline().connect(addr, None)
    }

    fn disconnect(&self) -> ChannelFuture {
        self.pipeline().disconnect()
    }

    fn close(&self) -> ChannelFuture {
        self.pipeline().close()
    }

    /// 绕过出站链路直接关闭传输。
    ///
    /// 注册失败的通道没有归属反应器，常规 `close` 无处入队；该路径
    /// 在调用线程上直接驱动传输关闭。
    fn force_close(&self) {
        let promise = ChannelPromise::new(Arc::new(ImmediateExecutor));
        self.transport().close(promise);
    }

    fn deregister(&self) -> ChannelFuture {
        self.pipeline().deregister()
    }

    fn read(&self) -> ChannelFuture {
        self.pipeline().read()
    }

    fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline().write(msg)
    }

    fn flush(&self) -> ChannelFuture {
        self.pipeline().flush()
    }

    fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline().write_and_flush(msg)
    }
}

/// 所有通道实现共用的骨架。
///
/// # 设计背景（Why）
/// - 状态机、归属绑定、选择键与关闭 Promise 的规则对每种传输都一样，
///   下沉到公共结构可避免实现间出现语义漂移；
/// - 管道与通道互相引用，骨架用 `OnceLock` + 弱引用在构造后一次性成环，
///   关闭时由管道拆链。
pub struct ChannelCore {
    id: ChannelId,
    config: ChannelConfig,
    attrs: AttributeMap,
    pipeline: OnceLock<Arc<Pipeline>>,
    reactor: Mutex<Option<Arc<Reactor>>>,
    token: Mutex<Option<SelectionToken>>,
    state: AtomicU8,
    close_promise: OnceLock<ChannelPromise>,
}

impl ChannelCore {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            id: ChannelId::next(),
            config,
            attrs: AttributeMap::new(),
            pipeline: OnceLock::new(),
            reactor: Mutex::new(None),
            token: Mutex::new(None),
            state: AtomicU8::new(ChannelState::Unregistered as u8),
            close_promise: OnceLock::new(),
        }
    }

    /// 为刚构造好的通道装配管道（头/尾哨兵就位）。
    ///
    /// # 契约说明（What）
    /// - 每个通道恰好调用一次，且必须在任何事件进入管道之前完成；
    /// - 重复调用是实现缺陷，静默忽略并保留首次装配结果。
    pub fn adopt(channel: &Arc<dyn Channel>) {
        let pipeline = Pipeline::new(Arc::downgrade(channel));
        let _ = channel.core().pipeline.set(pipeline);
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn attrs(&self) -> &AttributeMap {
        &self.attrs
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(
            self.pipeline
                .get()
                .expect("channel must be adopted before pipeline access"),
        )
    }

    pub fn reactor(&self) -> Option<Arc<Reactor>> {
        self.reactor.lock().clone()
    }

    /// 归属反应器的执行器视图；未注册时退化为 `None`。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.reactor
            .lock()
            .as_ref()
            .map(|reactor| reactor.as_executor())
    }

    /// 绑定归属反应器；已绑定时拒绝。
    pub(crate) fn bind_reactor(&self, reactor: Arc<Reactor>) -> Result<()> {
        let mut slot = self.reactor.lock();
        if slot.is_some() {
            return Err(CoreError::new(
                codes::REACTOR_ALREADY_BOUND,
                "channel is already bound to a reactor",
            ));
        }
        *slot = Some(reactor);
        Ok(())
    }

    /// 注册失败时回滚归属，让失败后的重试仍然可能。
    pub(crate) fn unbind_reactor(&self) {
        *self.reactor.lock() = None;
    }

    pub(crate) fn assign_token(&self, token: SelectionToken) {
        *self.token.lock() = Some(token);
    }

    pub fn token(&self) -> Option<SelectionToken> {
        *self.token.lock()
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_registered(&self) {
        let _ = self.advance(ChannelState::Registered);
    }

    /// 进入 `Active`；传输实现于 bind/connect 成功时调用。
    pub fn mark_active(&self) {
        let _ = self.advance(ChannelState::Active);
    }

    /// 终态迁移；返回 `false` 表示早已关闭。
    pub fn mark_closed(&self) -> bool {
        self.state
            .swap(ChannelState::Closed as u8, Ordering::SeqCst)
            != ChannelState::Closed as u8
    }

    fn advance(&self, to: ChannelState) -> Result<()> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if ChannelState::from_u8(current) >= to {
                return Err(CoreError::new(
                    codes::CHANNEL_INVALID_STATE,
                    "channel state may only advance",
                ));
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn init_close_promise(&self, executor: Arc<dyn EventExecutor>) {
        let _ = self.close_promise.set(ChannelPromise::new(executor));
    }

    /// 关闭 Promise 的写端，传输实现在资源回收完毕后完成它。
    pub fn close_promise(&self) -> Option<ChannelPromise> {
        self.close_promise.get().cloned()
    }

    pub fn closed_future(&self) -> ChannelFuture {
        match self.close_promise.get() {
            Some(promise) => promise.future(),
            None => crate::future::KeelFuture::failed(
                Arc::new(crate::executor::ImmediateExecutor),
                CoreError::new(
                    codes::CHANNEL_NOT_REGISTERED,
                    "close future is available after registration",
                ),
            ),
        }
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        let core = ChannelCore::new(ChannelConfig::new());
        assert_eq!(core.state(), ChannelState::Unregistered);
        core.mark_registered();
        assert_eq!(core.state(), ChannelState::Registered);
        core.mark_active();
        assert_eq!(core.state(), ChannelState::Active);
        // 逆向迁移被拒绝。
        assert!(core.advance(ChannelState::Registered).is_err());
        assert!(core.mark_closed());
        assert!(!core.mark_closed());
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[test]
    fn reactor_binding_is_single_shot() {
        let provider = Arc::new(crate::test_stubs::StubSelectorProvider);
        let reactor = Reactor::new("core-test", provider, 50, 512).expect("reactor");
        let core = ChannelCore::new(ChannelConfig::new());
        core.bind_reactor(Arc::clone(&reactor)).expect("first bind");
        let err = core
            .bind_reactor(reactor)
            .expect_err("second bind must fail");
        assert_eq!(err.code(), codes::REACTOR_ALREADY_BOUND);
    }
}
