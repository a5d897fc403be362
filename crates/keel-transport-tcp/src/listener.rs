//! TCP 监听通道：绑定、接受循环与接受侧背压。
//!
//! # 核心逻辑（How）
//! - `bind` 用 `socket2` 组装监听套接字（地址重用、接收缓冲、backlog），
//!   转成非阻塞的 `mio` 监听器后挂到归属反应器的选择器上；
//! - 就绪事件驱动接受循环：选择器为边沿触发，必须排空到 `WouldBlock`；
//!   每条连接包装成子通道，以 `channel_read` 负载交给服务器管道（接受器
//!   Handler 是它的消费者）；
//! - auto-read 关闭时摘除 READABLE 兴趣暂停接受；恢复经由显式 `read()`
//!   重新挂接兴趣，内核 backlog 里积压的连接会随即触发新的就绪事件。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::channel::{
    Channel, ChannelConfig, ChannelCore, ChannelFactory, PipelineMessage, Transport,
};
use keel_core::error::{CoreError, Result, codes};
use keel_core::future::ChannelPromise;
use keel_core::selector::{InterestSet, ReadyOps, SelectionToken, Selector};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::channel::TcpStreamChannel;
use crate::error::{self, map_io_error, unsupported};
use crate::selector::TcpListenerSource;

/// TCP 监听通道。
pub struct TcpServerChannel {
    core: ChannelCore,
    io: Mutex<Option<TcpListenerSource>>,
    interest: Mutex<InterestSet>,
    local: Mutex<Option<SocketAddr>>,
}

impl TcpServerChannel {
    pub fn new() -> Arc<dyn Channel> {
        let channel = Arc::new(Self {
            core: ChannelCore::new(ChannelConfig::new()),
            io: Mutex::new(None),
            interest: Mutex::new(InterestSet::empty()),
            local: Mutex::new(None),
        });
        let as_dyn: Arc<dyn Channel> = channel;
        ChannelCore::adopt(&as_dyn);
        as_dyn
    }

    fn lock_io(&self) -> std::sync::MutexGuard<'_, Option<TcpListenerSource>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_interest(&self, interest: InterestSet) {
        {
            let mut current = self.interest.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == interest {
                return;
            }
            *current = interest;
        }
        if let Some(reactor) = self.core.reactor()
            && let Err(err) = reactor.update_interest(self as &dyn Channel, interest)
        {
            warn!(
                target: "keel_transport_tcp::listener",
                channel = %self.core.id(),
                error = %err,
                "interest update failed"
            );
        }
    }

    fn do_bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .set_reuse_address(true)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let config = self.core.config();
        if config.rcvbuf_size() > 0
            && let Err(err) = socket.set_recv_buffer_size(config.rcvbuf_size())
        {
            warn!(
                target: "keel_transport_tcp::listener",
                channel = %self.core.id(),
                error = %err,
                "rcvbuf not applied; skipped"
            );
        }
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        socket
            .bind(&addr.into())
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .listen(config.backlog().min(i32::MAX as usize) as i32)
            .map_err(|err| map_io_error(error::LISTEN, err))?;
        let listener = mio::net::TcpListener::from_std(socket.into());
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        *self.lock_io() = Some(TcpListenerSource(listener));
        *self.local.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        Ok(local)
    }

    /// 接受循环：排空 backlog，把子通道交给管道。
    fn do_accept(&self) {
        let pipeline = self.core.pipeline();
        if !self.core.config().auto_read() {
            // 接受器触发了背压暂停：摘除兴趣，恢复由显式 read() 完成。
            self.set_interest(InterestSet::empty());
            return;
        }
        loop {
            let accepted = {
                let mut io = self.lock_io();
                let Some(source) = io.as_mut() else { return };
                match source.0.accept() {
                    Ok(pair) => Ok(Some(pair)),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => Err(map_io_error(error::ACCEPT, err)),
                }
            };
            match accepted {
                Ok(Some((stream, peer))) => {
                    let local = stream.local_addr().ok();
                    let child = TcpStreamChannel::accepted(stream, local, peer);
                    debug!(
                        target: "keel_transport_tcp::listener",
                        channel = %self.core.id(),
                        child = %child.id(),
                        peer = %peer,
                        "connection accepted"
                    );
                    pipeline.fire_channel_read(PipelineMessage::Channel(child));
                }
                Ok(None) => break,
                Err(err) => {
                    pipeline.fire_exception_caught(err);
                    break;
                }
            }
        }
        pipeline.fire_channel_read_complete();
    }

    fn close_internal(&self) {
        if !self.core.mark_closed() {
            return;
        }
        if let Some(reactor) = self.core.reactor()
            && let Err(err) = reactor.detach_io(self as &dyn Channel)
        {
            warn!(
                target: "keel_transport_tcp::listener",
                channel = %self.core.id(),
                error = %err,
                "selector detach failed during close"
            );
        }
        let io = self.lock_io().take();
        drop(io);
        let pipeline = self.core.pipeline();
        pipeline.fire_channel_inactive();
        pipeline.fire_channel_unregistered();
        pipeline.teardown();
        if let Some(promise) = self.core.close_promise() {
            promise.try_success(());
        }
    }
}

impl Channel for TcpServerChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn transport(&self) -> &dyn Transport {
        self
    }

    fn register_io(
        &self,
        selector: &mut dyn Selector,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()> {
        let mut io = self.lock_io();
        // 绑定之前尚无套接字：注册推迟到 bind 之后由 attach_io 补挂。
        let Some(source) = io.as_mut() else {
            return Ok(());
        };
        selector.register(source, token, interest)
    }

    fn reregister_io(
        &self,
        selector: &mut dyn Selector,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()> {
        let mut io = self.lock_io();
        let Some(source) = io.as_mut() else {
            return Ok(());
        };
        selector.reregister(source, token, interest)
    }

    fn deregister_io(&self, selector: &mut dyn Selector) -> Result<()> {
        let mut io = self.lock_io();
        let (Some(source), Some(token)) = (io.as_mut(), self.core.token()) else {
            return Ok(());
        };
        selector.deregister(source, token)
    }

    fn process_ready(&self, ops: ReadyOps) {
        if self.core.state() == keel_core::channel::ChannelState::Closed {
            return;
        }
        if ops.contains(ReadyOps::ERROR) {
            self.core.pipeline().fire_exception_caught(CoreError::new(
                codes::TRANSPORT_IO,
                "listener error reported by selector",
            ));
            return;
        }
        if ops.intersects(ReadyOps::READABLE | ReadyOps::HUP) {
            self.do_accept();
        }
    }

    fn is_transport_active(&self) -> bool {
        // 监听通道在 bind 成功前未活跃；注册时刻不触发 channel_active。
        false
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Transport for TcpServerChannel {
    fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        if self.lock_io().is_some() {
            promise.try_failure(CoreError::new(
                codes::CHANNEL_INVALID_STATE,
                "server channel already bound",
            ));
            return;
        }
        let local = match self.do_bind(addr) {
            Ok(local) => local,
            Err(err) => {
                promise.try_failure(err);
                return;
            }
        };
        self.core.mark_active();
        if let Some(reactor) = self.core.reactor()
            && let Err(err) = reactor.attach_io(self as &dyn Channel, InterestSet::empty())
        {
            promise.try_failure(err);
            return;
        }
        debug!(
            target: "keel_transport_tcp::listener",
            channel = %self.core.id(),
            local = %local,
            "server channel bound"
        );
        promise.try_success(());
        self.core.pipeline().fire_channel_active();
    }

    fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>, promise: ChannelPromise) {
        promise.try_failure(unsupported("connect"));
    }

    fn disconnect(&self, promise: ChannelPromise) {
        promise.try_failure(unsupported("disconnect"));
    }

    fn close(&self, promise: ChannelPromise) {
        self.close_internal();
        promise.try_success(());
    }

    fn deregister(&self, promise: ChannelPromise) {
        if let Some(reactor) = self.core.reactor()
            && let Err(err) = reactor.detach_io(self as &dyn Channel)
        {
            promise.try_failure(err);
            return;
        }
        self.core.pipeline().fire_channel_unregistered();
        promise.try_success(());
    }

    fn begin_read(&self) {
        self.set_interest(InterestSet::READABLE);
    }

    fn write(&self, _msg: PipelineMessage, promise: ChannelPromise) {
        promise.try_failure(unsupported(error::WRITE));
    }

    fn flush(&self) {}
}

/// 监听通道工厂，供 [`ServerBootstrap`](keel_core::bootstrap::ServerBootstrap)
/// 实例化服务器通道。
#[derive(Default)]
pub struct TcpServerChannelFactory;

impl ChannelFactory for TcpServerChannelFactory {
    fn new_channel(&self) -> Result<Arc<dyn Channel>> {
        Ok(TcpServerChannel::new())
    }
}
