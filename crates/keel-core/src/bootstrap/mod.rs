//! 服务器引导器：配置面与绑定时序。
//!
//! # 设计背景（Why）
//! - 监听通道与子通道分属两套反应器池（接受 / 服务），各带一份选项与
//!   属性声明；引导器把两者的装配顺序固化成一条可验证的时序；
//! - 接受器必须以"提交任务"的方式追加到服务器管道：若在管道自身初始化
//!   期间内联追加，首个 accept 产生的 `channel_read` 可能在接受器可达
//!   之前派发，连接会落进尾哨兵被丢弃。

mod acceptor;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use acceptor::Acceptor;

use crate::channel::{
    AttributeKey, AttributeValues, Channel, ChannelFactory, ChannelOption, ChannelOptions,
};
use crate::error::{CoreError, Result, codes};
use crate::executor::{EventExecutor, ImmediateExecutor, ReactorGroup};
use crate::future::{FutureOutcome, KeelFuture, Promise};
use crate::pipeline::{ChannelHandler, ChannelInitializer};

/// 服务器引导器。
///
/// # 契约说明（What）
/// - 必填项：父反应器池、通道工厂、子初始化 Handler、绑定地址
///   （`local_addr` 或 `bind` 的实参）；
/// - 子池缺省回落到父池并告警——该回落保留自源头实现，定位是测试便利
///   而非生产形态；
/// - 绑定时序：实例化监听通道 → 应用父选项/属性 → 在管道尾部装入服务器
///   初始化器（先加父 Handler、再以任务追加接受器）→ 注册到父反应器 →
///   注册成功后在该反应器上执行 `bind`。
pub struct ServerBootstrap {
    parent_group: Option<Arc<ReactorGroup>>,
    child_group: Option<Arc<ReactorGroup>>,
    factory: Option<Arc<dyn ChannelFactory>>,
    parent_handler: Option<Arc<dyn ChannelHandler>>,
    child_handler: Option<Arc<dyn ChannelHandler>>,
    parent_options: ChannelOptions,
    child_options: ChannelOptions,
    parent_attrs: AttributeValues,
    child_attrs: AttributeValues,
    local_addr: Option<SocketAddr>,
}

impl Default for ServerBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBootstrap {
    pub fn new() -> Self {
        Self {
            parent_group: None,
            child_group: None,
            factory: None,
            parent_handler: None,
            child_handler: None,
            parent_options: ChannelOptions::new(),
            child_options: ChannelOptions::new(),
            parent_attrs: AttributeValues::new(),
            child_attrs: AttributeValues::new(),
            local_addr: None,
        }
    }

    /// 同时指定接受池与服务池。
    pub fn groups(mut self, parent: Arc<ReactorGroup>, child: Arc<ReactorGroup>) -> Self {
        self.parent_group = Some(parent);
        self.child_group = Some(child);
        self
    }

    /// 只指定父池；子池回落到父池（绑定时告警）。
    pub fn group(mut self, parent: Arc<ReactorGroup>) -> Self {
        self.parent_group = Some(parent);
        self
    }

    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// 安装在服务器管道上的可选父 Handler。
    pub fn handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.parent_handler = Some(handler);
        self
    }

    /// 每条子通道管道的初始化 Handler（必填）。
    pub fn child_handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.child_handler = Some(handler);
        self
    }

    pub fn option<T: Clone + Send + Sync + 'static>(
        mut self,
        option: ChannelOption<T>,
        value: Option<T>,
    ) -> Self {
        self.parent_options.set(option, value);
        self
    }

    pub fn child_option<T: Clone + Send + Sync + 'static>(
        mut self,
        option: ChannelOption<T>,
        value: Option<T>,
    ) -> Self {
        self.child_options.set(option, value);
        self
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(
        mut self,
        key: AttributeKey<T>,
        value: Option<T>,
    ) -> Self {
        self.parent_attrs.set(key, value);
        self
    }

    pub fn child_attr<T: Clone + Send + Sync + 'static>(
        mut self,
        key: AttributeKey<T>,
        value: Option<T>,
    ) -> Self {
        self.child_attrs.set(key, value);
        self
    }

    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// 校验必填配置。
    pub fn validate(&self) -> Result<()> {
        if self.parent_group.is_none() {
            return Err(CoreError::new(
                codes::BOOTSTRAP_INCOMPLETE,
                "parent reactor group not set",
            ));
        }
        if self.factory.is_none() {
            return Err(CoreError::new(
                codes::BOOTSTRAP_INCOMPLETE,
                "channel factory not set",
            ));
        }
        if self.child_handler.is_none() {
            return Err(CoreError::new(
                codes::BOOTSTRAP_INCOMPLETE,
                "child handler not set",
            ));
        }
        Ok(())
    }

    /// 以配置中的 `local_addr` 绑定。
    pub fn bind_configured(self) -> KeelFuture<Arc<dyn Channel>> {
        match self.local_addr {
            Some(addr) => self.bind(addr),
            None => failed_future(CoreError::new(
                codes::BOOTSTRAP_INCOMPLETE,
                "bind address not set",
            )),
        }
    }

    /// 绑定监听通道；成功终态携带服务器通道句柄。
    ///
    /// 引导器被消耗：子选项/属性声明整体移交给接受器。
    pub fn bind(self, addr: SocketAddr) -> KeelFuture<Arc<dyn Channel>> {
        if let Err(err) = self.validate() {
            return failed_future(err);
        }
        let parent_group = self.parent_group.expect("validated parent group");
        let child_group = match self.child_group {
            Some(group) => group,
            None => {
                warn!(
                    target: "keel_core::bootstrap",
                    "child group not set; falling back to the parent group"
                );
                Arc::clone(&parent_group)
            }
        };
        let factory = self.factory.expect("validated factory");
        let channel = match factory.new_channel() {
            Ok(channel) => channel,
            Err(err) => return failed_future(err),
        };

        self.parent_options.apply(channel.config());
        self.parent_attrs.apply(channel.attrs());

        let acceptor = Acceptor::new(
            child_group,
            self.child_handler.expect("validated child handler"),
            Arc::new(self.child_options),
            Arc::new(self.child_attrs),
        );
        let parent_handler = self.parent_handler;
        let server_init = ChannelInitializer::new(move |server: &Arc<dyn Channel>| {
            let pipeline = server.pipeline();
            if let Some(handler) = &parent_handler {
                pipeline.add_last("parent-handler", Arc::clone(handler))?;
            }
            let reactor = server.reactor().ok_or_else(|| {
                CoreError::new(codes::CHANNEL_NOT_REGISTERED, "initializer ran unregistered")
            })?;
            let pipeline_for_task = Arc::clone(&pipeline);
            let acceptor = Arc::clone(&acceptor);
            // 提交任务而非内联追加：服务器管道必须先完成自身初始化，
            // 接受器才能成为 channelRead 的可达目标。
            reactor.execute(Box::new(move || {
                if let Err(err) =
                    pipeline_for_task.add_last("acceptor", acceptor as Arc<dyn ChannelHandler>)
                {
                    warn!(
                        target: "keel_core::bootstrap",
                        error = %err,
                        "failed to install acceptor"
                    );
                }
            }));
            Ok(())
        });
        if let Err(err) = channel
            .pipeline()
            .add_last("server-initializer", server_init as Arc<dyn ChannelHandler>)
        {
            return failed_future(err);
        }

        let reactor = parent_group.next();
        let bind_promise: Promise<Arc<dyn Channel>> = Promise::new(reactor.as_executor());
        let bind_future = bind_promise.future();
        let channel_for_bind = Arc::clone(&channel);
        let reactor_for_bind = Arc::clone(&reactor);
        reactor
            .register_channel(channel)
            .add_listener(move |outcome| match outcome {
                FutureOutcome::Success(()) => {
                    // bind 以任务形式推迟：注册回调（含接受器安装任务）先于
                    // 首次 bind 完成，用户 Handler 还有机会在 channel_registered
                    // 里继续装配管道。
                    let bind_promise = bind_promise.clone();
                    let server = Arc::clone(&channel_for_bind);
                    reactor_for_bind.execute(Box::new(move || {
                        let listener_server = Arc::clone(&server);
                        let bind_promise = bind_promise.clone();
                        server.bind(addr).add_listener(move |outcome| match outcome {
                            FutureOutcome::Success(()) => {
                                bind_promise.try_success(Arc::clone(&listener_server));
                            }
                            other => relay_failure(other, &bind_promise),
                        });
                    }));
                }
                other => relay_failure(other, &bind_promise),
            });
        bind_future
    }
}

impl std::fmt::Debug for ServerBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBootstrap")
            .field("parent_group", &self.parent_group.is_some())
            .field("child_group", &self.child_group.is_some())
            .field("child_handler", &self.child_handler.is_some())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// 把失败/取消终态转写到下游 Promise 上。
fn relay_failure(outcome: &FutureOutcome<()>, promise: &Promise<Arc<dyn Channel>>) {
    match outcome {
        FutureOutcome::Success(()) => {}
        FutureOutcome::Failure(err) => {
            promise.try_failure(err.duplicate());
        }
        FutureOutcome::Cancelled => {
            promise.try_failure(CoreError::new(
                codes::BOOTSTRAP_CHILD_REGISTER,
                "upstream operation cancelled",
            ));
        }
    }
}

fn failed_future(err: CoreError) -> KeelFuture<Arc<dyn Channel>> {
    KeelFuture::failed(Arc::new(ImmediateExecutor), err)
}
