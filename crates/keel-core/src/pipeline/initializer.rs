//! 延迟初始化器：注册时装配真实 Handler，然后自我摘除。
//!
//! # 设计背景（Why）
//! - 用户在通道注册到任何反应器之前就要声明管道形态，初始化器把装配动作
//!   推迟到 `channel_registered` 抵达时执行；
//! - `handler_added` 与 `channel_registered` 在"加入时机"上存在竞争：
//!   初始化器加入时通道可能已经注册。两条路径都会尝试装配，
//!   按通道记录的完成集保证 `init_channel` 恰好执行一次。

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::channel::{Channel, ChannelId};
use crate::error::{CoreError, Result};
use crate::pipeline::handler::{ChannelHandler, EventMask};
use crate::pipeline::HandlerContext;

type InitFn = dyn Fn(&Arc<dyn Channel>) -> Result<()> + Send + Sync;

/// 一次性管道装配器。
///
/// # 契约说明（What）
/// - 同一实例可共享给任意多个通道（典型：引导器的子通道初始化器），
///   对每个通道 `init_channel` 至多执行一次；
/// - 装配成功后自我摘除，并从头重放 `channel_registered`，保证新装配的
///   Handler 观察到注册事件；
/// - 装配失败：摘除自身、告警并强制关闭通道。
pub struct ChannelInitializer {
    init: Box<InitFn>,
    done: Mutex<HashSet<ChannelId>>,
}

impl ChannelInitializer {
    pub fn new(
        init: impl Fn(&Arc<dyn Channel>) -> Result<()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            init: Box::new(init),
            done: Mutex::new(HashSet::new()),
        })
    }

    /// 执行装配；返回本次是否真正运行了用户逻辑。
    fn init_channel(&self, ctx: &HandlerContext) -> bool {
        let Some(channel) = ctx.channel() else {
            return false;
        };
        if !self.done.lock().insert(channel.id()) {
            return false;
        }
        if let Err(err) = (self.init)(&channel) {
            warn!(
                target: "keel_core::pipeline",
                channel = %channel.id(),
                error = %err,
                "pipeline initializer failed; closing channel"
            );
            self.remove_self(ctx);
            let _ = channel.close();
            return false;
        }
        true
    }

    fn remove_self(&self, ctx: &HandlerContext) {
        if let Some(pipeline) = ctx.pipeline() {
            let _ = pipeline.remove(ctx.name());
        }
    }
}

impl ChannelHandler for ChannelInitializer {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_REGISTERED | EventMask::EXCEPTION_CAUGHT
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handler_added(&self, ctx: &HandlerContext) -> Result<()> {
        // 加入时通道已注册：注册事件不会再来，装配在此路径完成。
        if let Some(channel) = ctx.channel()
            && channel.is_registered()
            && self.init_channel(ctx)
        {
            self.remove_self(ctx);
        }
        Ok(())
    }

    fn channel_registered(&self, ctx: &HandlerContext) -> Result<()> {
        if self.init_channel(ctx) {
            self.remove_self(ctx);
            // 从头重放注册事件，让刚装配的 Handler 观察到它。
            if let Some(pipeline) = ctx.pipeline() {
                pipeline.fire_channel_registered();
            }
        } else {
            ctx.fire_channel_registered();
        }
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        warn!(
            target: "keel_core::pipeline",
            error = %error,
            "initializer observed an exception; closing channel"
        );
        if let Some(channel) = ctx.channel() {
            let _ = channel.close();
        }
        Ok(())
    }
}
