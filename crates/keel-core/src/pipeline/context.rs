//! Handler 上下文：链表节点、分发跳过与执行器亲和。
//!
//! # 核心逻辑（How）
//! - 上下文沿双向链表传播事件：入站沿 `next` 走向尾哨兵，出站沿 `prev`
//!   走向头哨兵；缺少事件位的节点以一次指针跳过略过；
//! - 每次派发前检查目标上下文的执行器：已在其事件循环内就地调用，
//!   否则把派发步骤整体入队并立即返回——同一通道的事件最终都落在同一个
//!   单线程反应器上，顺序因此得以保持；
//! - 前驱用弱引用，后继用强引用：链路由头哨兵锚定，拆除时从头到尾断开
//!   `next` 即可解环。

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::RwLock;
use tracing::warn;

use crate::channel::{Channel, PipelineMessage};
use crate::error::CoreError;
use crate::executor::{EventExecutor, ImmediateExecutor};
use crate::future::ChannelPromise;
use crate::pipeline::handler::{ChannelHandler, EventMask};
use crate::pipeline::Pipeline;

const LIFECYCLE_PENDING: u8 = 0;
const LIFECYCLE_ADDED: u8 = 1;
const LIFECYCLE_REMOVED: u8 = 2;

static FALLBACK_EXECUTOR: LazyLock<Arc<dyn EventExecutor>> =
    LazyLock::new(|| Arc::new(ImmediateExecutor));

/// 管道对单个 Handler 的包装：名字、链接、掩码与执行器。
pub struct HandlerContext {
    name: String,
    handler: Arc<dyn ChannelHandler>,
    mask: EventMask,
    executor_override: Option<Arc<dyn EventExecutor>>,
    pipeline: Weak<Pipeline>,
    prev: RwLock<Weak<HandlerContext>>,
    next: RwLock<Option<Arc<HandlerContext>>>,
    lifecycle: AtomicU8,
    sentinel: bool,
}

impl HandlerContext {
    pub(crate) fn new(
        pipeline: Weak<Pipeline>,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
        mask: EventMask,
        executor_override: Option<Arc<dyn EventExecutor>>,
        sentinel: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
            mask,
            executor_override,
            pipeline,
            prev: RwLock::new(Weak::new()),
            next: RwLock::new(None),
            lifecycle: AtomicU8::new(if sentinel {
                LIFECYCLE_ADDED
            } else {
                LIFECYCLE_PENDING
            }),
            sentinel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// 所属管道；管道已拆除时返回 `None`，后续派发自然熄灭。
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.upgrade()
    }

    /// 所属通道。
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.pipeline().and_then(|pipeline| pipeline.channel())
    }

    /// 本上下文的执行器：覆盖执行器优先，否则取通道的归属反应器。
    pub fn executor(&self) -> Arc<dyn EventExecutor> {
        if let Some(executor) = &self.executor_override {
            return Arc::clone(executor);
        }
        self.channel()
            .and_then(|channel| channel.core().executor())
            .unwrap_or_else(|| Arc::clone(&FALLBACK_EXECUTOR))
    }

    pub(crate) fn set_added(&self) {
        let _ = self.lifecycle.compare_exchange(
            LIFECYCLE_PENDING,
            LIFECYCLE_ADDED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn set_removed(&self) {
        self.lifecycle.store(LIFECYCLE_REMOVED, Ordering::SeqCst);
    }

    pub(crate) fn is_added(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_ADDED
    }

    pub fn is_removed(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_REMOVED
    }

    // ------------------------------------------------------------ 链接维护

    pub(crate) fn next_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.next.read().clone()
    }

    pub(crate) fn prev_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.prev.read().upgrade()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<HandlerContext>>) {
        *self.next.write() = next;
    }

    pub(crate) fn set_prev(&self, prev: Weak<HandlerContext>) {
        *self.prev.write() = prev;
    }

    fn find_next(&self, bit: EventMask) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.next_ctx();
        while let Some(ctx) = cursor {
            if ctx.mask.contains(bit) && ctx.is_added() {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    fn find_prev(&self, bit: EventMask) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.prev_ctx();
        while let Some(ctx) = cursor {
            if ctx.mask.contains(bit) && ctx.is_added() {
                return Some(ctx);
            }
            cursor = ctx.prev_ctx();
        }
        None
    }

    // ------------------------------------------------------------ 入站转发

    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_REGISTERED) {
            invoke::channel_registered(next);
        }
    }

    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_UNREGISTERED) {
            invoke::channel_unregistered(next);
        }
    }

    pub fn fire_channel_active(&self) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_ACTIVE) {
            invoke::channel_active(next);
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_INACTIVE) {
            invoke::channel_inactive(next);
        }
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_READ) {
            invoke::channel_read(next, msg);
        }
    }

    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_READ_COMPLETE) {
            invoke::channel_read_complete(next);
        }
    }

    pub fn fire_user_event_triggered(&self, event: Box<dyn Any + Send + Sync>) {
        if let Some(next) = self.find_next(EventMask::USER_EVENT_TRIGGERED) {
            invoke::user_event_triggered(next, event);
        }
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        if let Some(next) = self.find_next(EventMask::CHANNEL_WRITABILITY_CHANGED) {
            invoke::channel_writability_changed(next, writable);
        }
    }

    pub fn fire_exception_caught(&self, error: CoreError) {
        if let Some(next) = self.find_next(EventMask::EXCEPTION_CAUGHT) {
            invoke::exception_caught(next, error);
        } else {
            warn!(
                target: "keel_core::pipeline",
                context = %self.name,
                error = %error,
                "exception passed the end of the pipeline"
            );
        }
    }

    /// 入站回调失败的统一出口：错误发往链路中的下一个入站节点。
    pub(crate) fn notify_handler_error(&self, error: CoreError) {
        self.fire_exception_caught(error);
    }

    // ------------------------------------------------------------ 出站转发

    pub fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        match self.find_prev(EventMask::BIND) {
            Some(prev) => invoke::bind(prev, addr, promise),
            None => fail_unreachable(promise, "bind"),
        }
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise) {
        match self.find_prev(EventMask::CONNECT) {
            Some(prev) => invoke::connect(prev, remote, local, promise),
            None => fail_unreachable(promise, "connect"),
        }
    }

    pub fn disconnect(&self, promise: ChannelPromise) {
        match self.find_prev(EventMask::DISCONNECT) {
            Some(prev) => invoke::disconnect(prev, promise),
            None => fail_unreachable(promise, "disconnect"),
        }
    }

    pub fn close(&self, promise: ChannelPromise) {
        match self.find_prev(EventMask::CLOSE) {
            Some(prev) => invoke::close(prev, promise),
            None => fail_unreachable(promise, "close"),
        }
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        match self.find_prev(EventMask::DEREGISTER) {
            Some(prev) => invoke::deregister(prev, promise),
            None => fail_unreachable(promise, "deregister"),
        }
    }

    pub fn read(&self, promise: ChannelPromise) {
        match self.find_prev(EventMask::READ) {
            Some(prev) => invoke::read(prev, promise),
            None => fail_unreachable(promise, "read"),
        }
    }

    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        match self.find_prev(EventMask::WRITE) {
            Some(prev) => invoke::write(prev, msg, promise),
            None => fail_unreachable(promise, "write"),
        }
    }

    pub fn flush(&self, promise: ChannelPromise) {
        match self.find_prev(EventMask::FLUSH) {
            Some(prev) => invoke::flush(prev, promise),
            None => fail_unreachable(promise, "flush"),
        }
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("name", &self.name)
            .field("mask", &self.mask)
            .field("sentinel", &self.sentinel)
            .finish()
    }
}

fn fail_unreachable(promise: ChannelPromise, op: &'static str) {
    promise.try_failure(CoreError::new(
        crate::error::codes::CHANNEL_CLOSED,
        format!("pipeline torn down; `{op}` has no remaining target"),
    ));
}

/// 单次派发步骤：先解决执行器亲和，再触达 Handler 回调。
///
/// 每个事件都有一对函数：外层做"就地或入队"的决策，`*_now` 在正确线程上
/// 真正执行。入站回调的 `Err` 在这里转换为发往下一节点的异常事件。
pub(crate) mod invoke {
    use super::*;

    macro_rules! hop {
        ($ctx:ident, $now:ident ( $($arg:ident),* )) => {{
            let executor = $ctx.executor();
            if executor.in_event_loop() {
                $now($ctx, $($arg),*);
            } else {
                executor.execute(Box::new(move || $now($ctx, $($arg),*)));
            }
        }};
    }

    pub(crate) fn channel_registered(ctx: Arc<HandlerContext>) {
        hop!(ctx, channel_registered_now());
    }

    fn channel_registered_now(ctx: Arc<HandlerContext>) {
        if let Err(err) = ctx.handler.channel_registered(&ctx) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_unregistered(ctx: Arc<HandlerContext>) {
        hop!(ctx, channel_unregistered_now());
    }

    fn channel_unregistered_now(ctx: Arc<HandlerContext>) {
        if let Err(err) = ctx.handler.channel_unregistered(&ctx) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_active(ctx: Arc<HandlerContext>) {
        hop!(ctx, channel_active_now());
    }

    fn channel_active_now(ctx: Arc<HandlerContext>) {
        if let Err(err) = ctx.handler.channel_active(&ctx) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_inactive(ctx: Arc<HandlerContext>) {
        hop!(ctx, channel_inactive_now());
    }

    fn channel_inactive_now(ctx: Arc<HandlerContext>) {
        if let Err(err) = ctx.handler.channel_inactive(&ctx) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_read(ctx: Arc<HandlerContext>, msg: PipelineMessage) {
        hop!(ctx, channel_read_now(msg));
    }

    fn channel_read_now(ctx: Arc<HandlerContext>, msg: PipelineMessage) {
        if let Err(err) = ctx.handler.channel_read(&ctx, msg) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_read_complete(ctx: Arc<HandlerContext>) {
        hop!(ctx, channel_read_complete_now());
    }

    fn channel_read_complete_now(ctx: Arc<HandlerContext>) {
        if let Err(err) = ctx.handler.channel_read_complete(&ctx) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn user_event_triggered(ctx: Arc<HandlerContext>, event: Box<dyn Any + Send + Sync>) {
        hop!(ctx, user_event_triggered_now(event));
    }

    fn user_event_triggered_now(ctx: Arc<HandlerContext>, event: Box<dyn Any + Send + Sync>) {
        if let Err(err) = ctx.handler.user_event_triggered(&ctx, event) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn channel_writability_changed(ctx: Arc<HandlerContext>, writable: bool) {
        hop!(ctx, channel_writability_changed_now(writable));
    }

    fn channel_writability_changed_now(ctx: Arc<HandlerContext>, writable: bool) {
        if let Err(err) = ctx.handler.channel_writability_changed(&ctx, writable) {
            ctx.notify_handler_error(err);
        }
    }

    pub(crate) fn exception_caught(ctx: Arc<HandlerContext>, error: CoreError) {
        hop!(ctx, exception_caught_now(error));
    }

    fn exception_caught_now(ctx: Arc<HandlerContext>, error: CoreError) {
        if let Err(err) = ctx.handler.exception_caught(&ctx, error) {
            // 异常处理器自身失败不再回流，否则会在异常路径上成环。
            warn!(
                target: "keel_core::pipeline",
                context = %ctx.name,
                error = %err,
                "exception_caught handler failed"
            );
        }
    }

    pub(crate) fn handler_added(ctx: Arc<HandlerContext>) {
        hop!(ctx, handler_added_now());
    }

    fn handler_added_now(ctx: Arc<HandlerContext>) {
        ctx.set_added();
        if let Err(err) = ctx.handler.handler_added(&ctx) {
            warn!(
                target: "keel_core::pipeline",
                context = %ctx.name,
                error = %err,
                "handler_added failed; removing handler"
            );
            if let Some(pipeline) = ctx.pipeline() {
                let _ = pipeline.remove_context(&ctx);
                pipeline.fire_exception_caught(err);
            }
        }
    }

    pub(crate) fn handler_removed(ctx: Arc<HandlerContext>) {
        hop!(ctx, handler_removed_now());
    }

    fn handler_removed_now(ctx: Arc<HandlerContext>) {
        ctx.handler.handler_removed(&ctx);
    }

    pub(crate) fn bind(ctx: Arc<HandlerContext>, addr: SocketAddr, promise: ChannelPromise) {
        hop!(ctx, bind_now(addr, promise));
    }

    fn bind_now(ctx: Arc<HandlerContext>, addr: SocketAddr, promise: ChannelPromise) {
        ctx.handler.bind(&ctx, addr, promise);
    }

    pub(crate) fn connect(
        ctx: Arc<HandlerContext>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        hop!(ctx, connect_now(remote, local, promise));
    }

    fn connect_now(
        ctx: Arc<HandlerContext>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        ctx.handler.connect(&ctx, remote, local, promise);
    }

    pub(crate) fn disconnect(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        hop!(ctx, disconnect_now(promise));
    }

    fn disconnect_now(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        ctx.handler.disconnect(&ctx, promise);
    }

    pub(crate) fn close(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        hop!(ctx, close_now(promise));
    }

    fn close_now(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        ctx.handler.close(&ctx, promise);
    }

    pub(crate) fn deregister(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        hop!(ctx, deregister_now(promise));
    }

    fn deregister_now(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        ctx.handler.deregister(&ctx, promise);
    }

    pub(crate) fn read(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        hop!(ctx, read_now(promise));
    }

    fn read_now(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        ctx.handler.read(&ctx, promise);
    }

    pub(crate) fn write(ctx: Arc<HandlerContext>, msg: PipelineMessage, promise: ChannelPromise) {
        hop!(ctx, write_now(msg, promise));
    }

    fn write_now(ctx: Arc<HandlerContext>, msg: PipelineMessage, promise: ChannelPromise) {
        ctx.handler.write(&ctx, msg, promise);
    }

    pub(crate) fn flush(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        hop!(ctx, flush_now(promise));
    }

    fn flush_now(ctx: Arc<HandlerContext>, promise: ChannelPromise) {
        ctx.handler.flush(&ctx, promise);
    }
}
