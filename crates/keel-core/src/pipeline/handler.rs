//! Handler 契约与事件能力掩码。
//!
//! # 设计背景（Why）
//! - 常见部署会在链路上叠多个只关心一两种事件的适配器，分发路径必须能
//!   以 O(1) 代价跳过与事件无关的节点；
//! - 源头框架靠运行时自省加"跳过"标记推导能力集，Rust 侧改为由 Handler
//!   在构造期显式声明 [`EventMask`]：未声明即视作保留默认转发（等价于
//!   带跳过标记），声明了某事件即视作覆写。

use std::any::Any;
use std::net::SocketAddr;

use bitflags::bitflags;

use crate::channel::PipelineMessage;
use crate::error::{CoreError, Result};
use crate::future::ChannelPromise;
use crate::pipeline::HandlerContext;

bitflags! {
    /// 17 个事件位：8 入站 + 8 出站 + 横切的异常事件。
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const CHANNEL_REGISTERED = 1 << 0;
        const CHANNEL_UNREGISTERED = 1 << 1;
        const CHANNEL_ACTIVE = 1 << 2;
        const CHANNEL_INACTIVE = 1 << 3;
        const CHANNEL_READ = 1 << 4;
        const CHANNEL_READ_COMPLETE = 1 << 5;
        const USER_EVENT_TRIGGERED = 1 << 6;
        const CHANNEL_WRITABILITY_CHANGED = 1 << 7;

        const BIND = 1 << 8;
        const CONNECT = 1 << 9;
        const DISCONNECT = 1 << 10;
        const CLOSE = 1 << 11;
        const DEREGISTER = 1 << 12;
        const READ = 1 << 13;
        const WRITE = 1 << 14;
        const FLUSH = 1 << 15;

        const EXCEPTION_CAUGHT = 1 << 16;
    }
}

impl EventMask {
    /// 全部入站事件位。
    pub const ALL_INBOUND: EventMask = EventMask::CHANNEL_REGISTERED
        .union(EventMask::CHANNEL_UNREGISTERED)
        .union(EventMask::CHANNEL_ACTIVE)
        .union(EventMask::CHANNEL_INACTIVE)
        .union(EventMask::CHANNEL_READ)
        .union(EventMask::CHANNEL_READ_COMPLETE)
        .union(EventMask::USER_EVENT_TRIGGERED)
        .union(EventMask::CHANNEL_WRITABILITY_CHANGED);

    /// 全部出站事件位。
    pub const ALL_OUTBOUND: EventMask = EventMask::BIND
        .union(EventMask::CONNECT)
        .union(EventMask::DISCONNECT)
        .union(EventMask::CLOSE)
        .union(EventMask::DEREGISTER)
        .union(EventMask::READ)
        .union(EventMask::WRITE)
        .union(EventMask::FLUSH);
}

/// 管道 Handler 的统一契约。
///
/// # 契约说明（What）
/// - [`handled_events`](Self::handled_events) 声明该类型真正覆写的事件集合；
///   管道据此计算分发掩码，未声明的事件不会派发到该 Handler；
/// - 入站回调返回 `Err` 时，分发上下文把错误转换为 `exception_caught`
///   并派发给链路中**下一个**入站节点——抛错的 Handler 不会收到自己的错误；
/// - 出站回调自行对携带的 Promise 负责：失败路径必须完成该 Promise；
/// - 所有默认实现原样向后（入站）或向前（出站）转发事件。
///
/// # 前置/后置条件（Contract）
/// - 回调在上下文的执行器线程上运行，禁止阻塞；需要阻塞的工作应当带着
///   覆盖执行器注册（见 [`Pipeline::add_last_with_executor`]）；
/// - `handled_events` 必须对同一类型恒定：掩码按类型缓存，逐实例变化的
///   声明不受支持。
///
/// [`Pipeline::add_last_with_executor`]: crate::pipeline::Pipeline::add_last_with_executor
pub trait ChannelHandler: Send + Sync + 'static {
    /// 声明本类型覆写的事件集合。
    fn handled_events(&self) -> EventMask;

    /// 是否允许同一实例加入多条管道（或同一管道多次）。
    fn is_sharable(&self) -> bool {
        false
    }

    /// 掩码缓存与诊断使用的动态类型视图。
    fn as_any(&self) -> &dyn Any;

    /// 上下文装配完成、即将可被分发触达时回调。
    fn handler_added(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// 上下文从链路摘除、不再可被分发触达之后回调。
    fn handler_removed(&self, _ctx: &HandlerContext) {}

    // ---------------------------------------------------------------- 入站

    fn channel_registered(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn user_event_triggered(
        &self,
        ctx: &HandlerContext,
        event: Box<dyn Any + Send + Sync>,
    ) -> Result<()> {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext, writable: bool) -> Result<()> {
        ctx.fire_channel_writability_changed(writable);
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        ctx.fire_exception_caught(error);
        Ok(())
    }

    // ---------------------------------------------------------------- 出站

    fn bind(&self, ctx: &HandlerContext, addr: SocketAddr, promise: ChannelPromise) {
        ctx.bind(addr, promise);
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        ctx.connect(remote, local, promise);
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: ChannelPromise) {
        ctx.disconnect(promise);
    }

    fn close(&self, ctx: &HandlerContext, promise: ChannelPromise) {
        ctx.close(promise);
    }

    fn deregister(&self, ctx: &HandlerContext, promise: ChannelPromise) {
        ctx.deregister(promise);
    }

    fn read(&self, ctx: &HandlerContext, promise: ChannelPromise) {
        ctx.read(promise);
    }

    fn write(&self, ctx: &HandlerContext, msg: PipelineMessage, promise: ChannelPromise) {
        ctx.write(msg, promise);
    }

    fn flush(&self, ctx: &HandlerContext, promise: ChannelPromise) {
        ctx.flush(promise);
    }
}
