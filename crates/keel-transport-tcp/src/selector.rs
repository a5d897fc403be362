//! 基于 `mio::Poll` 的选择器实现。
//!
//! # 核心逻辑（How）
//! - 键 0 预留给内部 `mio::Waker`，与核心侧"选择键自 1 起分配"的约定对齐；
//! - `mio` 拒绝空兴趣集注册，而核心在注册时刻尚未确定兴趣；这里引入
//!   "停驻"状态：空兴趣的注册只记账不落到 `Poll`，首次出现非空兴趣时
//!   才真正注册，回到空兴趣时再摘除；
//! - `mio` 的就绪语义是边沿触发，上层读/写/接受路径必须排空到
//!   `WouldBlock`，传输实现遵守该约定。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keel_core::error::{CoreError, Result, codes};
use keel_core::selector::{
    InterestSet, IoSource, ReadyEvent, ReadyOps, SelectionToken, Selector, SelectorProvider,
    SelectorWaker,
};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::warn;

use crate::error::{self, map_io_error};

const WAKER_TOKEN: Token = Token(0);

/// 可注册进 [`MioSelector`] 的流套接字源。
pub struct TcpStreamSource(pub(crate) mio::net::TcpStream);

impl IoSource for TcpStreamSource {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// 可注册进 [`MioSelector`] 的监听套接字源。
pub struct TcpListenerSource(pub(crate) mio::net::TcpListener);

impl IoSource for TcpListenerSource {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

struct MioWaker {
    waker: Arc<Waker>,
}

impl SelectorWaker for MioWaker {
    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(target: "keel_transport_tcp::selector", error = %err, "selector wakeup failed");
        }
    }
}

/// `mio::Poll` 封装。
pub struct MioSelector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    /// 以空兴趣停驻、尚未落到 `Poll` 的键。
    parked: HashSet<usize>,
}

impl MioSelector {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|err| map_io_error(error::SELECT, err))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|err| map_io_error(error::SELECT, err))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            waker: Arc::new(waker),
            parked: HashSet::new(),
        })
    }

    fn to_mio_interest(interest: InterestSet) -> Option<Interest> {
        let readable = interest.contains(InterestSet::READABLE);
        let writable = interest.contains(InterestSet::WRITABLE);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// 对两类套接字源执行同一注册动作。
    fn with_source<R>(
        source: &mut dyn IoSource,
        on_stream: impl FnOnce(&mut mio::net::TcpStream) -> std::io::Result<R>,
        on_listener: impl FnOnce(&mut mio::net::TcpListener) -> std::io::Result<R>,
    ) -> Result<R> {
        let any = source.as_any_mut();
        if let Some(stream) = any.downcast_mut::<TcpStreamSource>() {
            return on_stream(&mut stream.0).map_err(|err| map_io_error(error::REGISTER, err));
        }
        if let Some(listener) = any.downcast_mut::<TcpListenerSource>() {
            return on_listener(&mut listener.0).map_err(|err| map_io_error(error::REGISTER, err));
        }
        Err(CoreError::new(
            codes::SELECTOR_SOURCE_MISMATCH,
            "mio selector only accepts tcp stream/listener sources",
        ))
    }
}

impl Selector for MioSelector {
    fn register(
        &mut self,
        source: &mut dyn IoSource,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()> {
        match Self::to_mio_interest(interest) {
            None => {
                self.parked.insert(token.0);
                Ok(())
            }
            Some(interest) => {
                let registry = self.poll.registry();
                Self::with_source(
                    source,
                    |stream| registry.register(stream, Token(token.0), interest),
                    |listener| registry.register(listener, Token(token.0), interest),
                )
            }
        }
    }

    fn reregister(
        &mut self,
        source: &mut dyn IoSource,
        token: SelectionToken,
        interest: InterestSet,
    ) -> Result<()> {
        match Self::to_mio_interest(interest) {
            None => {
                // 回到空兴趣：从 Poll 摘除并转入停驻。
                if self.parked.insert(token.0) {
                    let registry = self.poll.registry();
                    Self::with_source(
                        source,
                        |stream| registry.deregister(stream),
                        |listener| registry.deregister(listener),
                    )?;
                }
                Ok(())
            }
            Some(mio_interest) => {
                let was_parked = self.parked.remove(&token.0);
                let registry = self.poll.registry();
                Self::with_source(
                    source,
                    |stream| {
                        if was_parked {
                            registry.register(stream, Token(token.0), mio_interest)
                        } else {
                            registry.reregister(stream, Token(token.0), mio_interest)
                        }
                    },
                    |listener| {
                        if was_parked {
                            registry.register(listener, Token(token.0), mio_interest)
                        } else {
                            registry.reregister(listener, Token(token.0), mio_interest)
                        }
                    },
                )
            }
        }
    }

    fn deregister(&mut self, source: &mut dyn IoSource, token: SelectionToken) -> Result<()> {
        if self.parked.remove(&token.0) {
            return Ok(());
        }
        let registry = self.poll.registry();
        Self::with_source(
            source,
            |stream| registry.deregister(stream),
            |listener| registry.deregister(listener),
        )
    }

    fn select(&mut self, timeout: Option<Duration>, events: &mut Vec<ReadyEvent>) -> Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(map_io_error(error::SELECT, err)),
        }
        let mut produced = 0usize;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let mut ops = ReadyOps::empty();
            if event.is_readable() {
                ops |= ReadyOps::READABLE;
            }
            if event.is_writable() {
                ops |= ReadyOps::WRITABLE;
            }
            if event.is_error() {
                ops |= ReadyOps::ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                ops |= ReadyOps::HUP;
            }
            if ops.is_empty() {
                continue;
            }
            events.push(ReadyEvent {
                token: SelectionToken(event.token().0),
                ops,
            });
            produced += 1;
        }
        Ok(produced)
    }

    fn waker(&self) -> Arc<dyn SelectorWaker> {
        Arc::new(MioWaker {
            waker: Arc::clone(&self.waker),
        })
    }
}

/// 产出 [`MioSelector`] 的工厂；同时服务反应器的初建与重建路径。
#[derive(Default)]
pub struct MioSelectorProvider;

impl SelectorProvider for MioSelectorProvider {
    fn open(&self) -> Result<Box<dyn Selector>> {
        Ok(Box::new(MioSelector::new()?))
    }
}
