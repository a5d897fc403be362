//! TCP 子通道：已接受连接的读写、水位与关闭。
//!
//! # 核心逻辑（How）
//! - 读路径：就绪事件驱动，按配置容量租借 `BytesMut`，排空到 `WouldBlock`
//!   （选择器为边沿触发），每块数据冻结为引用计数负载进入管道；EOF 走
//!   关闭路径；
//! - 写路径：`write` 仅入队并记账出站字节数，越过高水位立即广播不可写；
//!   `flush` 尽力写出，`WouldBlock` 时挂起 WRITABLE 兴趣，回落到低水位
//!   以下恢复可写并再次广播；
//! - 锁纪律：`outbound → io` 为固定加锁顺序，管道事件一律在释放全部
//!   内部锁之后触发，Handler 在回调中反身读写不会自锁。

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes, BytesMut};
use keel_core::channel::{
    Channel, ChannelConfig, ChannelCore, PipelineMessage, Transport,
};
use keel_core::error::{CoreError, Result, codes};
use keel_core::future::ChannelPromise;
use keel_core::selector::{InterestSet, ReadyOps, SelectionToken, Selector};
use socket2::SockRef;
use tracing::warn;

use crate::error::{self, map_io_error, unsupported};
use crate::selector::TcpStreamSource;

/// 未显式配置接收缓冲时的读租借容量。
const DEFAULT_READ_CAPACITY: usize = 8 * 1024;

struct Outbound {
    queue: VecDeque<(Bytes, ChannelPromise)>,
    buffered: usize,
}

/// 已接受的 TCP 连接通道。
pub struct TcpStreamChannel {
    core: ChannelCore,
    io: Mutex<Option<TcpStreamSource>>,
    interest: Mutex<InterestSet>,
    outbound: Mutex<Outbound>,
    writable: AtomicBool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl TcpStreamChannel {
    /// 把一条刚接受的连接包装为通道；状态停留在 `Unregistered`，
    /// 注册到子反应器时因传输已活跃而直接进入 `Active`。
    pub(crate) fn accepted(
        stream: mio::net::TcpStream,
        local: Option<SocketAddr>,
        peer: SocketAddr,
    ) -> Arc<dyn Channel> {
        let channel = Arc::new(Self {
            core: ChannelCore::new(ChannelConfig::new()),
            io: Mutex::new(Some(TcpStreamSource(stream))),
            interest: Mutex::new(InterestSet::empty()),
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                buffered: 0,
            }),
            writable: AtomicBool::new(true),
            local,
            peer: Some(peer),
        });
        let as_dyn: Arc<dyn Channel> = channel;
        ChannelCore::adopt(&as_dyn);
        as_dyn
    }

    fn lock_io(&self) -> std::sync::MutexGuard<'_, Option<TcpStreamSource>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
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
                target: "keel_transport_tcp::channel",
                channel = %self.core.id(),
                error = %err,
                "interest update failed"
            );
        }
    }

    fn current_interest(&self) -> InterestSet {
        *self.interest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_socket_options(&self, stream: &mio::net::TcpStream) {
        let sock = SockRef::from(stream);
        let config = self.core.config();
        if config.rcvbuf_size() > 0
            && let Err(err) = sock.set_recv_buffer_size(config.rcvbuf_size())
        {
            warn!(
                target: "keel_transport_tcp::channel",
                channel = %self.core.id(),
                error = %err,
                "rcvbuf not applied; skipped"
            );
        }
        if config.sndbuf_size() > 0
            && let Err(err) = sock.set_send_buffer_size(config.sndbuf_size())
        {
            warn!(
                target: "keel_transport_tcp::channel",
                channel = %self.core.id(),
                error = %err,
                "sndbuf not applied; skipped"
            );
        }
    }

    /// 排空内核读缓冲；每块负载在释放 io 锁之后进入管道。
    fn do_read(&self) {
        enum Step {
            Data(Bytes),
            Eof,
            Blocked,
            Failed(CoreError),
        }

        let pipeline = self.core.pipeline();
        let capacity = match self.core.config().rcvbuf_size() {
            0 => DEFAULT_READ_CAPACITY,
            configured => configured,
        };
        let mut eof = false;
        loop {
            let step = {
                let mut io = self.lock_io();
                let Some(source) = io.as_mut() else { return };
                let mut buf = BytesMut::zeroed(capacity);
                match source.0.read(&mut buf[..]) {
                    Ok(0) => Step::Eof,
                    Ok(n) => {
                        buf.truncate(n);
                        Step::Data(buf.freeze())
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Step::Blocked,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => Step::Failed(map_io_error(error::READ, err)),
                }
            };
            match step {
                Step::Data(bytes) => pipeline.fire_channel_read(PipelineMessage::Bytes(bytes)),
                Step::Eof => {
                    eof = true;
                    break;
                }
                Step::Blocked => break,
                Step::Failed(err) => {
                    pipeline.fire_exception_caught(err);
                    self.close_internal();
                    return;
                }
            }
        }
        pipeline.fire_channel_read_complete();
        if eof {
            self.close_internal();
        }
    }

    /// 尽力写出出站队列；Promise 完成与水位广播在锁外执行。
    fn do_flush(&self) {
        let mut completed: Vec<ChannelPromise> = Vec::new();
        let mut failure: Option<CoreError> = None;
        let mut became_writable = false;
        let mut want_writable = false;
        let queue_empty;
        {
            let mut outbound_guard = self.lock_outbound();
            let outbound = &mut *outbound_guard;
            let mut io = self.lock_io();
            let Some(source) = io.as_mut() else { return };
            loop {
                let Some((buf, _)) = outbound.queue.front_mut() else {
                    break;
                };
                match source.0.write(&buf[..]) {
                    Ok(n) => {
                        outbound.buffered -= n;
                        if n == buf.len() {
                            let (_, promise) = outbound
                                .queue
                                .pop_front()
                                .expect("front entry just observed");
                            completed.push(promise);
                        } else {
                            buf.advance(n);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        want_writable = true;
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        failure = Some(map_io_error(error::WRITE, err));
                        break;
                    }
                }
            }
            if outbound.buffered <= self.core.config().write_low_watermark()
                && !self.writable.swap(true, Ordering::SeqCst)
            {
                became_writable = true;
            }
            queue_empty = outbound.queue.is_empty();
        }

        for promise in completed {
            promise.try_success(());
        }
        let pipeline = self.core.pipeline();
        if became_writable {
            pipeline.fire_channel_writability_changed(true);
        }
        if let Some(err) = failure {
            pipeline.fire_exception_caught(err);
            self.close_internal();
            return;
        }
        let base = self.current_interest();
        if want_writable {
            self.set_interest(base | InterestSet::WRITABLE);
        } else if queue_empty {
            self.set_interest(base - InterestSet::WRITABLE);
        }
    }

    fn close_internal(&self) {
        if !self.core.mark_closed() {
            return;
        }
        let pending: Vec<ChannelPromise> = {
            let mut outbound = self.lock_outbound();
            outbound.buffered = 0;
            outbound.queue.drain(..).map(|(_, promise)| promise).collect()
        };
        for promise in pending {
            promise.try_failure(CoreError::new(
                codes::CHANNEL_CLOSED,
                "channel closed before write was flushed",
            ));
        }
        if let Some(reactor) = self.core.reactor()
            && let Err(err) = reactor.detach_io(self as &dyn Channel)
        {
            warn!(
                target: "keel_transport_tcp::channel",
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

impl Channel for TcpStreamChannel {
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
        let Some(source) = io.as_mut() else {
            return Ok(());
        };
        self.apply_socket_options(&source.0);
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
                "socket error reported by selector",
            ));
            self.close_internal();
            return;
        }
        if ops.intersects(ReadyOps::READABLE | ReadyOps::HUP) {
            self.do_read();
        }
        if ops.contains(ReadyOps::WRITABLE) {
            self.do_flush();
        }
    }

    fn is_transport_active(&self) -> bool {
        self.lock_io().is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Transport for TcpStreamChannel {
    fn bind(&self, _addr: SocketAddr, promise: ChannelPromise) {
        promise.try_failure(unsupported(error::BIND));
    }

    fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>, promise: ChannelPromise) {
        // 客户端建连引导不在本传输的范围内。
        promise.try_failure(unsupported("connect"));
    }

    fn disconnect(&self, promise: ChannelPromise) {
        // TCP 没有独立于关闭的断开语义。
        self.close_internal();
        promise.try_success(());
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
        self.set_interest(self.current_interest() | InterestSet::READABLE);
    }

    fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        let PipelineMessage::Bytes(bytes) = msg else {
            promise.try_failure(CoreError::new(
                codes::TRANSPORT_UNSUPPORTED,
                "tcp transport writes byte payloads only",
            ));
            return;
        };
        if self.core.state() == keel_core::channel::ChannelState::Closed {
            promise.try_failure(CoreError::new(codes::CHANNEL_CLOSED, "write on closed channel"));
            return;
        }
        let became_unwritable = {
            let mut outbound = self.lock_outbound();
            outbound.buffered += bytes.len();
            outbound.queue.push_back((bytes, promise));
            outbound.buffered > self.core.config().write_high_watermark()
                && self.writable.swap(false, Ordering::SeqCst)
        };
        if became_unwritable {
            self.core.pipeline().fire_channel_writability_changed(false);
        }
    }

    fn flush(&self) {
        self.do_flush();
    }
}
