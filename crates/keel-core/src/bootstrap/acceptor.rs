//! 接受器 Handler：服务器管道的尾端入站消费者。
//!
//! # 核心逻辑（How）
//! - `channel_read` 的负载是一条刚接受的子通道：装入子初始化器、应用
//!   子选项与属性、注册到子反应器池选出的反应器；任一步失败即强制关闭
//!   子通道并告警；
//! - `exception_caught` 是接受风暴的泄压阀：接受侧连续失败（典型为文件
//!   描述符耗尽）时关掉服务器通道的 auto-read 暂停接受，一秒后由定时
//!   任务恢复；异常本身继续向下游传播，应用仍可观察到它。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::channel::{AttributeValues, Channel, ChannelOptions, PipelineMessage};
use crate::error::{CoreError, Result};
use crate::executor::ReactorGroup;
use crate::pipeline::{ChannelHandler, EventMask, HandlerContext};

/// 接受暂停后的恢复延迟。
const ACCEPT_RESUME_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct Acceptor {
    child_group: Arc<ReactorGroup>,
    child_initializer: Arc<dyn ChannelHandler>,
    child_options: Arc<ChannelOptions>,
    child_attrs: Arc<AttributeValues>,
}

impl Acceptor {
    pub(crate) fn new(
        child_group: Arc<ReactorGroup>,
        child_initializer: Arc<dyn ChannelHandler>,
        child_options: Arc<ChannelOptions>,
        child_attrs: Arc<AttributeValues>,
    ) -> Arc<Self> {
        Arc::new(Self {
            child_group,
            child_initializer,
            child_options,
            child_attrs,
        })
    }

    fn init_child(&self, child: Arc<dyn Channel>) {
        if let Err(err) = child
            .pipeline()
            .add_last("child-initializer", Arc::clone(&self.child_initializer))
        {
            warn!(
                target: "keel_core::bootstrap",
                child = %child.id(),
                error = %err,
                "failed to install child initializer; closing child"
            );
            child.force_close();
            return;
        }
        self.child_options.apply(child.config());
        self.child_attrs.apply(child.attrs());

        let reactor = self.child_group.next();
        let child_for_listener = Arc::clone(&child);
        reactor
            .register_channel(child)
            .add_listener(move |outcome| {
                if let Some(err) = outcome.failure() {
                    warn!(
                        target: "keel_core::bootstrap",
                        child = %child_for_listener.id(),
                        error = %err,
                        "child registration failed; closing child"
                    );
                    child_for_listener.force_close();
                }
            });
    }
}

impl ChannelHandler for Acceptor {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        match msg {
            PipelineMessage::Channel(child) => {
                self.init_child(child);
                Ok(())
            }
            other => {
                ctx.fire_channel_read(other);
                Ok(())
            }
        }
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        if let Some(server) = ctx.channel()
            && server.config().auto_read()
        {
            server.config().set_auto_read(false);
            warn!(
                target: "keel_core::bootstrap",
                channel = %server.id(),
                error = %error,
                "accept failure; pausing accepts for {:?}",
                ACCEPT_RESUME_DELAY
            );
            if let Some(reactor) = server.reactor() {
                let server = Arc::clone(&server);
                reactor.schedule(
                    ACCEPT_RESUME_DELAY,
                    Box::new(move || {
                        server.config().set_auto_read(true);
                        let _ = server.read();
                    }),
                );
            }
        }
        ctx.fire_exception_caught(error);
        Ok(())
    }
}
