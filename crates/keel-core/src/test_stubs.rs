//! 测试替身集合：无 IO 的通道与选择器。
//!
//! # 模块职责（Why）
//! - 管道、引导器与反应器的契约测试需要满足 [`Channel`]/[`Selector`] 的
//!   最小实现，但多数场景只关心事件时序而非真实套接字；
//! - 把这些桩集中在一处，接口演进时获得单点编译错误提示，避免各测试
//!   文件重复定义。
//!
//! # 契约说明（What）
//! - [`StubChannel`] 记录传输操作序列供断言；`close` 路径完整执行
//!   状态迁移、`channel_inactive`/`channel_unregistered` 与拆链，
//!   与真实传输保持同构；
//! - [`StubSelectorProvider`] 产出以条件变量模拟阻塞等待的选择器：
//!   没有真实就绪源，但唤醒语义完整，反应器可以照常驱动任务与定时器。

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::{
    Channel, ChannelConfig, ChannelCore, PipelineMessage, Transport,
};
use crate::error::Result;
use crate::future::ChannelPromise;
use crate::selector::{
    InterestSet, IoSource, ReadyEvent, ReadyOps, SelectionToken, Selector, SelectorProvider,
    SelectorWaker,
};

/// 桩通道记录的传输操作。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StubOp {
    Bind(SocketAddr),
    Connect(SocketAddr),
    Disconnect,
    Close,
    Deregister,
    BeginRead,
    Write(&'static str),
    Flush,
}

/// 无 IO 的通道桩。
pub struct StubChannel {
    core: ChannelCore,
    active: AtomicBool,
    ops: Mutex<Vec<StubOp>>,
    local_addr: Mutex<Option<SocketAddr>>,
    io_registrations: std::sync::atomic::AtomicUsize,
}

impl StubChannel {
    /// 构造未激活的桩通道（注册后停留在 `Registered`）。
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// 构造"已接受连接"形态的桩通道（注册时直接进入 `Active`）。
    pub fn accepted() -> Arc<Self> {
        Self::build(true)
    }

    /// 构造"嵌入式"桩通道：不经反应器即视作已注册，回调在调用线程上
    /// 就地执行，适合只关心管道时序的测试。
    pub fn embedded() -> Arc<Self> {
        let channel = Self::build(true);
        channel.core.mark_registered();
        channel.core.pipeline().invoke_handler_added_if_needed();
        channel
    }

    fn build(active: bool) -> Arc<Self> {
        let channel = Arc::new(Self {
            core: ChannelCore::new(ChannelConfig::new()),
            active: AtomicBool::new(active),
            ops: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            io_registrations: std::sync::atomic::AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn Channel> = Arc::clone(&channel) as Arc<dyn Channel>;
        ChannelCore::adopt(&as_dyn);
        channel
    }

    /// 至今记录的传输操作序列。
    pub fn operations(&self) -> Vec<StubOp> {
        self.ops.lock().clone()
    }

    /// 按反应器的注册时序就地完成注册：补发 `handler_added`，
    /// 再从头哨兵广播 `channel_registered`。
    pub fn complete_registration(&self) {
        self.core.mark_registered();
        let pipeline = self.core.pipeline();
        pipeline.invoke_handler_added_if_needed();
        pipeline.fire_channel_registered();
    }

    /// 选择器注册被执行的次数（含重建路径的重放）。
    pub fn io_registrations(&self) -> usize {
        self.io_registrations.load(Ordering::SeqCst)
    }

    fn record(&self, op: StubOp) {
        self.ops.lock().push(op);
    }

    fn do_close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        let was_active = self.active.swap(false, Ordering::SeqCst);
        let pipeline = self.core.pipeline();
        if was_active {
            pipeline.fire_channel_inactive();
        }
        pipeline.fire_channel_unregistered();
        pipeline.teardown();
        if let Some(promise) = self.core.close_promise() {
            promise.try_success(());
        }
    }
}

impl Channel for StubChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn transport(&self) -> &dyn Transport {
        self
    }

    fn register_io(
        &self,
        _selector: &mut dyn Selector,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        self.io_registrations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn reregister_io(
        &self,
        _selector: &mut dyn Selector,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        Ok(())
    }

    fn deregister_io(&self, _selector: &mut dyn Selector) -> Result<()> {
        Ok(())
    }

    fn process_ready(&self, _ops: ReadyOps) {}

    fn is_transport_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Transport for StubChannel {
    fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.record(StubOp::Bind(addr));
        *self.local_addr.lock() = Some(addr);
        self.active.store(true, Ordering::SeqCst);
        self.core.mark_active();
        promise.try_success(());
        self.core.pipeline().fire_channel_active();
    }

    fn connect(&self, remote: SocketAddr, _local: Option<SocketAddr>, promise: ChannelPromise) {
        self.record(StubOp::Connect(remote));
        promise.try_success(());
    }

    fn disconnect(&self, promise: ChannelPromise) {
        self.record(StubOp::Disconnect);
        promise.try_success(());
    }

    fn close(&self, promise: ChannelPromise) {
        self.record(StubOp::Close);
        self.do_close();
        promise.try_success(());
    }

    fn deregister(&self, promise: ChannelPromise) {
        self.record(StubOp::Deregister);
        self.core.pipeline().fire_channel_unregistered();
        promise.try_success(());
    }

    fn begin_read(&self) {
        self.record(StubOp::BeginRead);
    }

    fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.record(StubOp::Write(msg.describe()));
        promise.try_success(());
    }

    fn flush(&self) {
        self.record(StubOp::Flush);
    }
}

// ---------------------------------------------------------------- 选择器桩

struct Signal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }
}

struct StubWaker {
    signal: Arc<Signal>,
}

impl SelectorWaker for StubWaker {
    fn wake(&self) {
        let mut flag = self.signal.flag.lock();
        *flag = true;
        self.signal.condvar.notify_all();
    }
}

/// 条件变量模拟阻塞等待的选择器：永不产出就绪事件，唤醒语义完整。
pub struct StubSelector {
    signal: Arc<Signal>,
}

impl StubSelector {
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }
}

impl Default for StubSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for StubSelector {
    fn register(
        &mut self,
        _source: &mut dyn IoSource,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        Ok(())
    }

    fn reregister(
        &mut self,
        _source: &mut dyn IoSource,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _source: &mut dyn IoSource, _token: SelectionToken) -> Result<()> {
        Ok(())
    }

    fn select(&mut self, timeout: Option<Duration>, _events: &mut Vec<ReadyEvent>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut flag = self.signal.flag.lock();
        while !*flag {
            match deadline {
                None => self.signal.condvar.wait(&mut flag),
                Some(deadline) => {
                    if self
                        .signal
                        .condvar
                        .wait_until(&mut flag, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }
        *flag = false;
        Ok(0)
    }

    fn waker(&self) -> Arc<dyn SelectorWaker> {
        Arc::new(StubWaker {
            signal: Arc::clone(&self.signal),
        })
    }
}

/// 产出 [`StubSelector`] 的工厂。
#[derive(Default)]
pub struct StubSelectorProvider;

impl SelectorProvider for StubSelectorProvider {
    fn open(&self) -> Result<Box<dyn Selector>> {
        Ok(Box::new(StubSelector::new()))
    }
}
