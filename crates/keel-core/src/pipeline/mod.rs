//! 通道管道：带头尾哨兵的 Handler 双向链表。
//!
//! # 设计背景（Why）
//! - 入站事件自头向尾、出站操作自尾向头流经链路；头哨兵把出站操作终结到
//!   底层传输，尾哨兵兜底未被消费的入站事件；
//! - 链表结构只在归属反应器线程上改写：外部线程的变更请求整体入队；
//!   注册前的装配发生在引导线程，此时尚无并发分发，同样安全；
//! - 前驱弱引用、后继强引用，拆链即解环。
//!
//! # 契约说明（What）
//! - 头尾哨兵永不可移除；非哨兵上下文必有非空掩码与唯一名字；
//! - `handler_added` 先于任何可达分发；`handler_removed` 晚于一切在途分发；
//! - 注册前加入的 Handler 其 `handler_added` 推迟到首次注册时按序补发。

mod context;
mod handler;
mod initializer;
mod mask;

pub use context::HandlerContext;
pub use handler::{ChannelHandler, EventMask};
pub use initializer::ChannelInitializer;
pub use mask::mask_for;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::{Channel, PipelineMessage};
use crate::error::{CoreError, Result, codes};
use crate::executor::{EventExecutor, ImmediateExecutor};
use crate::future::{ChannelFuture, ChannelPromise, KeelFuture};
use context::invoke;

const HEAD_NAME: &str = "head";
const TAIL_NAME: &str = "tail";

/// Handler 链的插入位置。
#[derive(Clone, Debug)]
enum Anchor {
    First,
    Last,
    Before(String),
    After(String),
}

/// 通道管道。
pub struct Pipeline {
    channel: Weak<dyn Channel>,
    head: Arc<HandlerContext>,
    tail: Arc<HandlerContext>,
    mutation: Mutex<()>,
    registered: AtomicBool,
    pending_added: Mutex<Vec<Arc<HandlerContext>>>,
    self_ref: Weak<Pipeline>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<dyn Channel>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Pipeline>| {
            let head_handler: Arc<dyn ChannelHandler> = Arc::new(HeadHandler {
                channel: channel.clone(),
            });
            let head_mask = mask_for(head_handler.as_ref());
            let head = HandlerContext::new(
                weak.clone(),
                HEAD_NAME,
                head_handler,
                head_mask,
                None,
                true,
            );
            let tail_handler: Arc<dyn ChannelHandler> = Arc::new(TailHandler);
            let tail_mask = mask_for(tail_handler.as_ref());
            let tail = HandlerContext::new(
                weak.clone(),
                TAIL_NAME,
                tail_handler,
                tail_mask,
                None,
                true,
            );
            head.set_next(Some(Arc::clone(&tail)));
            tail.set_prev(Arc::downgrade(&head));
            Pipeline {
                channel,
                head,
                tail,
                mutation: Mutex::new(()),
                registered: AtomicBool::new(false),
                pending_added: Mutex::new(Vec::new()),
                self_ref: weak.clone(),
            }
        })
    }

    /// 所属通道；通道析构后返回 `None`。
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.upgrade()
    }

    fn channel_executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.channel().and_then(|channel| channel.core().executor())
    }

    // ------------------------------------------------------------ 变更入口

    pub fn add_first(&self, name: &str, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.mutate(Anchor::First, name.to_string(), handler, None)
    }

    pub fn add_last(&self, name: &str, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.mutate(Anchor::Last, name.to_string(), handler, None)
    }

    pub fn add_before(
        &self,
        anchor: &str,
        name: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.mutate(
            Anchor::Before(anchor.to_string()),
            name.to_string(),
            handler,
            None,
        )
    }

    pub fn add_after(
        &self,
        anchor: &str,
        name: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.mutate(
            Anchor::After(anchor.to_string()),
            name.to_string(),
            handler,
            None,
        )
    }

    /// 以覆盖执行器注册 Handler：该上下文的全部回调改在指定执行器上运行，
    /// 与其它执行器上的 Handler 之间不再保序。
    pub fn add_last_with_executor(
        &self,
        name: &str,
        handler: Arc<dyn ChannelHandler>,
        executor: Arc<dyn EventExecutor>,
    ) -> Result<()> {
        self.mutate(Anchor::Last, name.to_string(), handler, Some(executor))
    }

    /// 移除命名 Handler；头尾哨兵被拒绝。
    pub fn remove(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run_mutation(move |pipeline| pipeline.do_remove(&name))
    }

    /// 按上下文身份移除（初始化器自摘除的路径）。
    pub fn remove_context(&self, ctx: &Arc<HandlerContext>) -> Result<()> {
        let ctx = Arc::clone(ctx);
        self.run_mutation(move |pipeline| pipeline.do_remove_context(&ctx))
    }

    /// 原位替换命名 Handler。
    pub fn replace(
        &self,
        old_name: &str,
        new_name: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        let old_name = old_name.to_string();
        let new_name = new_name.to_string();
        self.run_mutation(move |pipeline| pipeline.do_replace(&old_name, &new_name, handler))
    }

    fn mutate(
        &self,
        anchor: Anchor,
        name: String,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<()> {
        self.run_mutation(move |pipeline| pipeline.do_add(anchor, name, handler, executor))
    }

    /// 变更汇入点：注册后的跨线程变更整体转投归属反应器。
    ///
    /// 入队路径上的校验错误无法同步返回，记录告警后丢弃。
    fn run_mutation(
        &self,
        op: impl FnOnce(&Pipeline) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        match self.channel().and_then(|channel| channel.core().reactor()) {
            Some(reactor) if !reactor.in_event_loop() => {
                let pipeline = self.self_ref.clone();
                reactor.execute(Box::new(move || {
                    if let Some(pipeline) = pipeline.upgrade()
                        && let Err(err) = op(&pipeline)
                    {
                        warn!(
                            target: "keel_core::pipeline",
                            error = %err,
                            "deferred pipeline mutation failed"
                        );
                    }
                }));
                Ok(())
            }
            _ => op(self),
        }
    }

    fn do_add(
        &self,
        anchor: Anchor,
        name: String,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<()> {
        // 校验与链接在锁内完成；`handler_added` 回调在锁外触发，
        // 初始化器在回调里继续装配链路时不会遇到重入锁。
        let ctx = {
            let _guard = self.mutation.lock();
            let mask = mask_for(handler.as_ref());
            if mask.is_empty() {
                return Err(CoreError::new(
                    codes::PIPELINE_EMPTY_MASK,
                    format!("handler `{name}` declares no events"),
                ));
            }
            if self.contains_name(&name) {
                return Err(CoreError::new(
                    codes::PIPELINE_DUPLICATE_NAME,
                    format!("handler name `{name}` already in use"),
                ));
            }
            if !handler.is_sharable() && self.contains_instance(&handler) {
                return Err(CoreError::new(
                    codes::PIPELINE_DUPLICATE_HANDLER,
                    format!("non-sharable handler `{name}` added twice"),
                ));
            }
            let ctx =
                HandlerContext::new(self.self_ref.clone(), name, handler, mask, executor, false);
            let (prev, next) = match anchor {
                Anchor::First => {
                    let next = self.head.next_ctx().unwrap_or_else(|| Arc::clone(&self.tail));
                    (Arc::clone(&self.head), next)
                }
                Anchor::Last => {
                    let prev = self.tail.prev_ctx().unwrap_or_else(|| Arc::clone(&self.head));
                    (prev, Arc::clone(&self.tail))
                }
                Anchor::Before(anchor_name) => {
                    let target = self.lookup(&anchor_name).ok_or_else(|| {
                        CoreError::new(
                            codes::PIPELINE_UNKNOWN_ANCHOR,
                            format!("anchor `{anchor_name}` not found"),
                        )
                    })?;
                    let prev = target.prev_ctx().unwrap_or_else(|| Arc::clone(&self.head));
                    (prev, target)
                }
                Anchor::After(anchor_name) => {
                    let target = self.lookup(&anchor_name).ok_or_else(|| {
                        CoreError::new(
                            codes::PIPELINE_UNKNOWN_ANCHOR,
                            format!("anchor `{anchor_name}` not found"),
                        )
                    })?;
                    let next = target.next_ctx().unwrap_or_else(|| Arc::clone(&self.tail));
                    (target, next)
                }
            };
            self.link_between(&ctx, &prev, &next);
            debug!(
                target: "keel_core::pipeline",
                handler = %ctx.name(),
                "handler added to pipeline"
            );
            ctx
        };
        if self.registered.load(Ordering::SeqCst) {
            invoke::handler_added(ctx);
        } else {
            // 注册前的装配：回调推迟到首次注册时按加入顺序补发。
            self.pending_added.lock().push(ctx);
        }
        Ok(())
    }

    fn link_between(
        &self,
        ctx: &Arc<HandlerContext>,
        prev: &Arc<HandlerContext>,
        next: &Arc<HandlerContext>,
    ) {
        ctx.set_prev(Arc::downgrade(prev));
        ctx.set_next(Some(Arc::clone(next)));
        next.set_prev(Arc::downgrade(ctx));
        prev.set_next(Some(Arc::clone(ctx)));
    }

    fn do_remove(&self, name: &str) -> Result<()> {
        let ctx = {
            let _guard = self.mutation.lock();
            let ctx = self.lookup(name).ok_or_else(|| {
                CoreError::new(
                    codes::PIPELINE_UNKNOWN_ANCHOR,
                    format!("handler `{name}` not found"),
                )
            })?;
            self.unlink(&ctx)?;
            ctx
        };
        invoke::handler_removed(ctx);
        Ok(())
    }

    fn do_remove_context(&self, ctx: &Arc<HandlerContext>) -> Result<()> {
        {
            let _guard = self.mutation.lock();
            if ctx.is_removed() {
                return Ok(());
            }
            self.unlink(ctx)?;
        }
        invoke::handler_removed(Arc::clone(ctx));
        Ok(())
    }

    fn do_replace(
        &self,
        old_name: &str,
        new_name: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        let (old_ctx, new_ctx) = {
            let _guard = self.mutation.lock();
            let old_ctx = self.lookup(old_name).ok_or_else(|| {
                CoreError::new(
                    codes::PIPELINE_UNKNOWN_ANCHOR,
                    format!("handler `{old_name}` not found"),
                )
            })?;
            if old_ctx.is_sentinel() {
                return Err(CoreError::new(
                    codes::PIPELINE_SENTINEL,
                    "head/tail sentinels cannot be replaced",
                ));
            }
            let mask = mask_for(handler.as_ref());
            if mask.is_empty() {
                return Err(CoreError::new(
                    codes::PIPELINE_EMPTY_MASK,
                    format!("handler `{new_name}` declares no events"),
                ));
            }
            if new_name != old_name && self.contains_name(new_name) {
                return Err(CoreError::new(
                    codes::PIPELINE_DUPLICATE_NAME,
                    format!("handler name `{new_name}` already in use"),
                ));
            }
            let new_ctx = HandlerContext::new(
                self.self_ref.clone(),
                new_name.to_string(),
                handler,
                mask,
                None,
                false,
            );
            let prev = old_ctx.prev_ctx().unwrap_or_else(|| Arc::clone(&self.head));
            let next = old_ctx.next_ctx().unwrap_or_else(|| Arc::clone(&self.tail));
            self.link_between(&new_ctx, &prev, &next);
            old_ctx.set_removed();
            (old_ctx, new_ctx)
        };
        if self.registered.load(Ordering::SeqCst) {
            invoke::handler_added(Arc::clone(&new_ctx));
        } else {
            self.pending_added.lock().push(new_ctx);
        }
        invoke::handler_removed(old_ctx);
        Ok(())
    }

    fn unlink(&self, ctx: &Arc<HandlerContext>) -> Result<()> {
        if ctx.is_sentinel() {
            return Err(CoreError::new(
                codes::PIPELINE_SENTINEL,
                "head/tail sentinels cannot be removed",
            ));
        }
        let prev = ctx.prev_ctx().unwrap_or_else(|| Arc::clone(&self.head));
        let next = ctx.next_ctx().unwrap_or_else(|| Arc::clone(&self.tail));
        prev.set_next(Some(Arc::clone(&next)));
        next.set_prev(Arc::downgrade(&prev));
        ctx.set_removed();
        // 被摘除节点保留自身链接：正在其回调栈内的转发仍可走到后继。
        self.pending_added
            .lock()
            .retain(|pending| !Arc::ptr_eq(pending, ctx));
        debug!(
            target: "keel_core::pipeline",
            handler = %ctx.name(),
            "handler removed from pipeline"
        );
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Arc<HandlerContext>> {
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(ctx) = cursor {
            if ctx.name() == name {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    fn contains_name(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn contains_instance(&self, handler: &Arc<dyn ChannelHandler>) -> bool {
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(ctx.handler(), handler) {
                return true;
            }
            cursor = ctx.next_ctx();
        }
        false
    }

    /// 链路当前的名字序列（含哨兵），供诊断与测试观察。
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(ctx) = cursor {
            names.push(ctx.name().to_string());
            cursor = ctx.next_ctx();
        }
        names
    }

    /// 查找命名上下文。
    pub fn context(&self, name: &str) -> Option<Arc<HandlerContext>> {
        self.lookup(name).filter(|ctx| !ctx.is_removed())
    }

    // ------------------------------------------------------------ 注册时序

    /// 首次注册时补发全部推迟的 `handler_added` 回调（反应器线程调用）。
    pub fn invoke_handler_added_if_needed(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = std::mem::take(&mut *self.pending_added.lock());
        for ctx in pending {
            if !ctx.is_removed() {
                invoke::handler_added(ctx);
            }
        }
    }

    /// 通道关闭后的拆链：自头向尾摘除剩余 Handler 并逐个回调
    /// `handler_removed`。
    pub fn teardown(&self) {
        loop {
            let ctx = {
                let _guard = self.mutation.lock();
                let mut cursor = self.head.next_ctx();
                let mut found = None;
                while let Some(candidate) = cursor {
                    if !candidate.is_sentinel() {
                        found = Some(candidate);
                        break;
                    }
                    cursor = candidate.next_ctx();
                }
                match found {
                    Some(ctx) => {
                        let _ = self.unlink(&ctx);
                        ctx
                    }
                    None => break,
                }
            };
            invoke::handler_removed(ctx);
        }
    }

    // ------------------------------------------------------------ 入站入口

    pub fn fire_channel_registered(&self) {
        invoke::channel_registered(Arc::clone(&self.head));
    }

    pub fn fire_channel_unregistered(&self) {
        invoke::channel_unregistered(Arc::clone(&self.head));
    }

    pub fn fire_channel_active(&self) {
        invoke::channel_active(Arc::clone(&self.head));
    }

    pub fn fire_channel_inactive(&self) {
        invoke::channel_inactive(Arc::clone(&self.head));
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        invoke::channel_read(Arc::clone(&self.head), msg);
    }

    pub fn fire_channel_read_complete(&self) {
        invoke::channel_read_complete(Arc::clone(&self.head));
    }

    pub fn fire_user_event_triggered(&self, event: Box<dyn Any + Send + Sync>) {
        invoke::user_event_triggered(Arc::clone(&self.head), event);
    }

    pub fn fire_channel_writability_changed(&self, writable: bool) {
        invoke::channel_writability_changed(Arc::clone(&self.head), writable);
    }

    pub fn fire_exception_caught(&self, error: CoreError) {
        invoke::exception_caught(Arc::clone(&self.head), error);
    }

    // ------------------------------------------------------------ 出站入口

    pub fn bind(&self, addr: SocketAddr) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.bind(addr, promise);
                future
            }
            None => self.not_registered_future("bind"),
        }
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.connect(remote, local, promise);
                future
            }
            None => self.not_registered_future("connect"),
        }
    }

    pub fn disconnect(&self) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.disconnect(promise);
                future
            }
            None => self.not_registered_future("disconnect"),
        }
    }

    pub fn close(&self) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.close(promise);
                future
            }
            None => self.not_registered_future("close"),
        }
    }

    pub fn deregister(&self) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.deregister(promise);
                future
            }
            None => self.not_registered_future("deregister"),
        }
    }

    pub fn read(&self) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.read(promise);
                future
            }
            None => self.not_registered_future("read"),
        }
    }

    pub fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.write(msg, promise);
                future
            }
            None => self.not_registered_future("write"),
        }
    }

    pub fn flush(&self) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let promise = ChannelPromise::new(executor);
                let future = promise.future();
                self.tail.flush(promise);
                future
            }
            None => self.not_registered_future("flush"),
        }
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        match self.channel_executor() {
            Some(executor) => {
                let write_promise = ChannelPromise::new(Arc::clone(&executor));
                let future = write_promise.future();
                self.tail.write(msg, write_promise);
                let flush_promise = ChannelPromise::new(executor);
                self.tail.flush(flush_promise);
                future
            }
            None => self.not_registered_future("write_and_flush"),
        }
    }

    fn not_registered_future(&self, op: &'static str) -> ChannelFuture {
        KeelFuture::failed(
            Arc::new(ImmediateExecutor),
            CoreError::new(
                codes::CHANNEL_NOT_REGISTERED,
                format!("`{op}` requires a registered channel"),
            ),
        )
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("names", &self.names()).finish()
    }
}

// ---------------------------------------------------------------- 头哨兵

/// 头哨兵：出站操作的终点、auto-read 的触发者。
///
/// 入站方向上它只是第一跳转发器；`channel_active` 与 `channel_read_complete`
/// 在转发之后按配置补发一次读取请求，这是 auto-read 语义的落点。
struct HeadHandler {
    channel: Weak<dyn Channel>,
}

impl HeadHandler {
    fn read_if_auto(&self) {
        if let Some(channel) = self.channel.upgrade()
            && channel.config().auto_read()
        {
            let _ = channel.read();
        }
    }

    fn with_transport(
        &self,
        promise: &ChannelPromise,
        op: impl FnOnce(&dyn Channel),
    ) {
        match self.channel.upgrade() {
            Some(channel) => op(channel.as_ref()),
            None => {
                promise.try_failure(CoreError::new(
                    codes::CHANNEL_CLOSED,
                    "channel gone before outbound operation reached the transport",
                ));
            }
        }
    }
}

impl ChannelHandler for HeadHandler {
    fn handled_events(&self) -> EventMask {
        EventMask::ALL_INBOUND | EventMask::ALL_OUTBOUND | EventMask::EXCEPTION_CAUGHT
    }

    fn is_sharable(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_active(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        self.read_if_auto();
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        self.read_if_auto();
        Ok(())
    }

    fn bind(&self, _ctx: &HandlerContext, addr: SocketAddr, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| channel.transport().bind(addr, promise.clone()));
    }

    fn connect(
        &self,
        _ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        self.with_transport(&promise, |channel| {
            channel.transport().connect(remote, local, promise.clone())
        });
    }

    fn disconnect(&self, _ctx: &HandlerContext, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| {
            channel.transport().disconnect(promise.clone())
        });
    }

    fn close(&self, _ctx: &HandlerContext, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| channel.transport().close(promise.clone()));
    }

    fn deregister(&self, _ctx: &HandlerContext, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| {
            channel.transport().deregister(promise.clone())
        });
    }

    fn read(&self, _ctx: &HandlerContext, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| {
            channel.transport().begin_read();
            promise.try_success(());
        });
    }

    fn write(&self, _ctx: &HandlerContext, msg: PipelineMessage, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| {
            channel.transport().write(msg, promise.clone())
        });
    }

    fn flush(&self, _ctx: &HandlerContext, promise: ChannelPromise) {
        self.with_transport(&promise, |channel| {
            channel.transport().flush();
            promise.try_success(());
        });
    }
}

// ---------------------------------------------------------------- 尾哨兵

/// 尾哨兵：入站事件的兜底消费者。
///
/// 未被任何 Handler 消费的读负载在这里告警并释放（引用计数负载随释放
/// 归还）；走到尾部的异常以 warn 级别记录。
struct TailHandler;

impl ChannelHandler for TailHandler {
    fn handled_events(&self) -> EventMask {
        EventMask::ALL_INBOUND | EventMask::EXCEPTION_CAUGHT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_registered(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        warn!(
            target: "keel_core::pipeline",
            channel = %ctx.channel().map(|c| c.id().to_string()).unwrap_or_default(),
            payload = msg.describe(),
            "inbound message reached the tail; discarded"
        );
        drop(msg);
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    fn user_event_triggered(
        &self,
        _ctx: &HandlerContext,
        event: Box<dyn Any + Send + Sync>,
    ) -> Result<()> {
        debug!(target: "keel_core::pipeline", "user event reached the tail; discarded");
        drop(event);
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &HandlerContext, _writable: bool) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        warn!(
            target: "keel_core::pipeline",
            channel = %ctx.channel().map(|c| c.id().to_string()).unwrap_or_default(),
            error = %error,
            "unhandled exception reached the tail"
        );
        Ok(())
    }
}
