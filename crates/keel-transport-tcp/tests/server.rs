//! 端到端服务器测试：真实回环套接字上的绑定、接受、回显与跨线程写。

use std::any::Any;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_core::bootstrap::ServerBootstrap;
use keel_core::channel::{Channel, ChannelFactory, PipelineMessage};
use keel_core::error::Result;
use keel_core::executor::ReactorGroup;
use keel_core::pipeline::{ChannelHandler, ChannelInitializer, EventMask, HandlerContext};
use keel_transport_tcp::{MioSelectorProvider, TcpServerChannelFactory};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn group_of(size: usize, prefix: &str) -> Arc<ReactorGroup> {
    ReactorGroup::builder(Arc::new(MioSelectorProvider))
        .size(size)
        .name_prefix(prefix)
        .build()
        .expect("group")
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 回显 Handler：收到什么写回什么。
struct EchoHandler;

impl ChannelHandler for EchoHandler {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        if let (PipelineMessage::Bytes(bytes), Some(channel)) = (msg, ctx.channel()) {
            channel.write_and_flush(PipelineMessage::Bytes(bytes));
        }
        Ok(())
    }
}

struct ServerFixture {
    server: Arc<dyn Channel>,
    addr: SocketAddr,
    parent_group: Arc<ReactorGroup>,
    child_group: Arc<ReactorGroup>,
    children: Arc<Mutex<Vec<Arc<dyn Channel>>>>,
    init_threads: Arc<Mutex<Vec<Option<String>>>>,
}

impl ServerFixture {
    /// 起一个父 1 / 子 2 的回显服务器，返回实际绑定地址与观测句柄。
    fn start(prefix: &str) -> Self {
        init_tracing();
        let parent_group = group_of(1, &format!("{prefix}-boss"));
        let child_group = group_of(2, &format!("{prefix}-worker"));
        let children: Arc<Mutex<Vec<Arc<dyn Channel>>>> = Arc::new(Mutex::new(Vec::new()));
        let init_threads: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let children_in = Arc::clone(&children);
        let threads_in = Arc::clone(&init_threads);
        let initializer = ChannelInitializer::new(move |child: &Arc<dyn Channel>| {
            children_in.lock().unwrap().push(Arc::clone(child));
            threads_in
                .lock()
                .unwrap()
                .push(thread::current().name().map(str::to_string));
            child.pipeline().add_last("echo", Arc::new(EchoHandler))?;
            Ok(())
        });

        let outcome = ServerBootstrap::new()
            .groups(Arc::clone(&parent_group), Arc::clone(&child_group))
            .channel_factory(Arc::new(TcpServerChannelFactory) as Arc<dyn ChannelFactory>)
            .child_handler(initializer)
            .bind("127.0.0.1:0".parse().expect("addr"))
            .await_outcome(Some(Duration::from_secs(5)))
            .expect("bind settles");
        let server = Arc::clone(outcome.value().expect("bind succeeds"));
        let addr = server.local_addr().expect("bound address");
        Self {
            server,
            addr,
            parent_group,
            child_group,
            children,
            init_threads,
        }
    }

    fn stop(self) {
        let _ = self.server.close();
        let parents = self
            .parent_group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
        self.child_group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .await_outcome(Some(Duration::from_secs(5)))
            .expect("child group terminates");
        parents
            .await_outcome(Some(Duration::from_secs(5)))
            .expect("parent group terminates");
    }
}

fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    client.write_all(payload).expect("send");
    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).expect("echo");
    received
}

#[test]
fn bind_accept_and_round_robin_children() {
    let fixture = ServerFixture::start("s1");

    assert_eq!(roundtrip(fixture.addr, b"first client"), b"first client");
    assert_eq!(roundtrip(fixture.addr, b"second client"), b"second client");

    wait_until("two children initialized", Duration::from_secs(2), || {
        fixture.init_threads.lock().unwrap().len() == 2
    });
    {
        let threads = fixture.init_threads.lock().unwrap();
        let names: Vec<&str> = threads.iter().filter_map(|n| n.as_deref()).collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1], "children land on distinct reactors");
        assert!(names.iter().all(|name| name.starts_with("s1-worker-")));
    }
    assert!(fixture.server.is_active());

    fixture.stop();
}

#[test]
fn inbound_order_matches_the_wire() {
    let fixture = ServerFixture::start("order");

    let mut client = TcpStream::connect(fixture.addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut expected = Vec::new();
    for chunk in [b"alpha".as_slice(), b"beta", b"gamma", b"delta"] {
        client.write_all(chunk).expect("send chunk");
        expected.extend_from_slice(chunk);
    }
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).expect("echo");
    assert_eq!(received, expected, "byte order preserved end to end");

    fixture.stop();
}

#[test]
fn cross_thread_write_completes_on_the_child_reactor() {
    let fixture = ServerFixture::start("s5");

    let mut client = TcpStream::connect(fixture.addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    wait_until("child registered", Duration::from_secs(2), || {
        !fixture.children.lock().unwrap().is_empty()
    });
    let child = Arc::clone(&fixture.children.lock().unwrap()[0]);
    let child_reactor = child.reactor().expect("child bound").name().to_string();

    // 非反应器线程发起写：立即拿到未完成的 Future。
    let future = child.write_and_flush(PipelineMessage::Bytes(Bytes::from_static(b"pushed")));
    let listener_thread: Arc<Mutex<Option<Option<String>>>> = Arc::new(Mutex::new(None));
    let listener_thread_in = Arc::clone(&listener_thread);
    future.add_listener(move |outcome| {
        assert!(outcome.is_success(), "write completes successfully");
        *listener_thread_in.lock().unwrap() =
            Some(thread::current().name().map(str::to_string));
    });

    let mut received = vec![0u8; b"pushed".len()];
    client.read_exact(&mut received).expect("server push");
    assert_eq!(received, b"pushed");

    wait_until("listener ran", Duration::from_secs(2), || {
        listener_thread.lock().unwrap().is_some()
    });
    assert_eq!(
        listener_thread.lock().unwrap().clone().flatten().as_deref(),
        Some(child_reactor.as_str()),
        "listeners attached off-loop still run on the channel reactor"
    );

    fixture.stop();
}

#[test]
fn closing_the_child_completes_its_close_future() {
    let fixture = ServerFixture::start("close");

    let _client = TcpStream::connect(fixture.addr).expect("connect");
    wait_until("child registered", Duration::from_secs(2), || {
        !fixture.children.lock().unwrap().is_empty()
    });
    let child = Arc::clone(&fixture.children.lock().unwrap()[0]);
    child
        .close()
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("close settles");
    child
        .closed_future()
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("closed future settles");
    assert_eq!(child.state(), keel_core::channel::ChannelState::Closed);

    fixture.stop();
}
