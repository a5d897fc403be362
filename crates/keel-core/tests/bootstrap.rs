//! 引导器契约测试：配置校验、绑定时序、子通道移交与接受侧背压。

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use keel_core::bootstrap::ServerBootstrap;
use keel_core::channel::{
    AttributeKey, Channel, ChannelFactory, PipelineMessage, options,
};
use keel_core::error::{CoreError, Result, codes};
use keel_core::executor::ReactorGroup;
use keel_core::pipeline::{ChannelHandler, ChannelInitializer, EventMask, HandlerContext};
use keel_core::test_stubs::{StubChannel, StubOp, StubSelectorProvider};

fn group_of(size: usize, prefix: &str) -> Arc<ReactorGroup> {
    ReactorGroup::builder(Arc::new(StubSelectorProvider))
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

/// 返回桩通道并保留其句柄的工厂。
struct StubServerFactory {
    created: Mutex<Option<Arc<StubChannel>>>,
}

impl StubServerFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(None),
        })
    }

    fn server(&self) -> Arc<StubChannel> {
        self.created
            .lock()
            .unwrap()
            .clone()
            .expect("factory not yet used")
    }
}

impl ChannelFactory for StubServerFactory {
    fn new_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = StubChannel::new();
        *self.created.lock().unwrap() = Some(Arc::clone(&channel));
        Ok(channel as Arc<dyn Channel>)
    }
}

/// 记录异常码的父 Handler。
struct ParentExceptionProbe {
    seen: Arc<Mutex<Vec<&'static str>>>,
}

impl ChannelHandler for ParentExceptionProbe {
    fn handled_events(&self) -> EventMask {
        EventMask::EXCEPTION_CAUGHT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        self.seen.lock().unwrap().push(error.code());
        ctx.fire_exception_caught(error);
        Ok(())
    }
}

struct NoopChildHandler;

impl ChannelHandler for NoopChildHandler {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn validate_reports_missing_required_fields() {
    let err = ServerBootstrap::new().validate().expect_err("no parent group");
    assert_eq!(err.code(), codes::BOOTSTRAP_INCOMPLETE);

    let group = group_of(1, "validate");
    let err = ServerBootstrap::new()
        .group(Arc::clone(&group))
        .validate()
        .expect_err("no factory");
    assert_eq!(err.code(), codes::BOOTSTRAP_INCOMPLETE);

    let err = ServerBootstrap::new()
        .group(Arc::clone(&group))
        .channel_factory(StubServerFactory::new())
        .validate()
        .expect_err("no child handler");
    assert_eq!(err.code(), codes::BOOTSTRAP_INCOMPLETE);

    let outcome = ServerBootstrap::new()
        .group(Arc::clone(&group))
        .channel_factory(StubServerFactory::new())
        .child_handler(ChannelInitializer::new(|_| Ok(())))
        .bind_configured()
        .await_outcome(Some(Duration::from_secs(1)))
        .expect("future settles");
    assert_eq!(
        outcome.failure().map(CoreError::code),
        Some(codes::BOOTSTRAP_INCOMPLETE),
        "missing bind address is a configuration error"
    );
    group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
}

#[test]
fn bind_accept_and_backpressure_flow() {
    let parent_group = group_of(1, "boss");
    let child_group = group_of(2, "worker");

    let factory = StubServerFactory::new();
    let init_threads = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
    let init_runs = Arc::new(AtomicUsize::new(0));
    let exceptions = Arc::new(Mutex::new(Vec::new()));

    let session_key = AttributeKey::<u32>::of("bootstrap.tests.session").expect("key");

    let init_threads_in = Arc::clone(&init_threads);
    let init_runs_in = Arc::clone(&init_runs);
    let child_initializer = ChannelInitializer::new(move |child: &Arc<dyn Channel>| {
        init_runs_in.fetch_add(1, Ordering::SeqCst);
        init_threads_in
            .lock()
            .unwrap()
            .push(thread::current().name().map(str::to_string));
        child.pipeline().add_last("noop", Arc::new(NoopChildHandler))?;
        Ok(())
    });

    let addr = "127.0.0.1:0".parse().expect("addr");
    let server = ServerBootstrap::new()
        .groups(Arc::clone(&parent_group), Arc::clone(&child_group))
        .channel_factory(Arc::clone(&factory) as Arc<dyn ChannelFactory>)
        .handler(Arc::new(ParentExceptionProbe {
            seen: Arc::clone(&exceptions),
        }))
        .child_handler(child_initializer)
        .child_option(*options::AUTO_READ, Some(true))
        .child_attr(session_key, Some(7u32))
        .bind(addr);
    let outcome = server
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("bind settles");
    let server = Arc::clone(outcome.value().expect("bind succeeds"));
    let server_stub = factory.server();

    // 绑定时序：transport.bind 已执行且接受器已就位。
    assert!(server_stub.operations().contains(&StubOp::Bind(addr)));
    wait_until("acceptor installed", Duration::from_secs(2), || {
        server.pipeline().context("acceptor").is_some()
    });
    assert!(
        server.pipeline().context("parent-handler").is_some(),
        "parent handler installed by the server initializer"
    );

    // 移交两条子通道：轮转应当命中两个不同的子反应器。
    let first_child = StubChannel::accepted();
    let second_child = StubChannel::accepted();
    server.pipeline().fire_channel_read(PipelineMessage::Channel(
        Arc::clone(&first_child) as Arc<dyn Channel>,
    ));
    server.pipeline().fire_channel_read(PipelineMessage::Channel(
        Arc::clone(&second_child) as Arc<dyn Channel>,
    ));

    wait_until("children active", Duration::from_secs(2), || {
        first_child.is_active() && second_child.is_active()
    });
    assert_eq!(init_runs.load(Ordering::SeqCst), 2, "one init per child");
    {
        let threads = init_threads.lock().unwrap();
        let names: Vec<&str> = threads.iter().filter_map(|n| n.as_deref()).collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1], "round robin across child reactors");
        assert!(names.iter().all(|name| name.starts_with("worker-")));
    }
    // 子属性按声明落到通道上。
    assert_eq!(first_child.attrs().get(session_key).as_deref(), Some(&7));
    assert_eq!(second_child.attrs().get(session_key).as_deref(), Some(&7));

    // 接受侧背压：异常先关掉 auto-read，一秒后定时任务恢复并补发读取。
    assert!(server.config().auto_read());
    server.pipeline().fire_exception_caught(CoreError::new(
        codes::TRANSPORT_IO,
        "simulated accept failure",
    ));
    wait_until("auto_read paused", Duration::from_secs(2), || {
        !server.config().auto_read()
    });
    assert_eq!(
        *exceptions.lock().unwrap(),
        vec![codes::TRANSPORT_IO],
        "the exception stays observable downstream"
    );
    wait_until("auto_read restored", Duration::from_secs(3), || {
        server.config().auto_read()
    });
    wait_until("read reissued", Duration::from_secs(2), || {
        server_stub
            .operations()
            .iter()
            .filter(|op| **op == StubOp::BeginRead)
            .count()
            >= 2
    });

    let done = parent_group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    child_group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_outcome(Some(Duration::from_secs(5)))
        .expect("child group terminates");
    done.await_outcome(Some(Duration::from_secs(5)))
        .expect("parent group terminates");
}

#[test]
fn child_group_falls_back_to_parent_group() {
    let group = group_of(1, "fallback");
    let factory = StubServerFactory::new();
    let child_ready = Arc::new(AtomicUsize::new(0));
    let child_ready_in = Arc::clone(&child_ready);
    let initializer = ChannelInitializer::new(move |_child| {
        child_ready_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let addr = "127.0.0.1:0".parse().expect("addr");
    let outcome = ServerBootstrap::new()
        .group(Arc::clone(&group))
        .channel_factory(Arc::clone(&factory) as Arc<dyn ChannelFactory>)
        .child_handler(initializer)
        .bind(addr)
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("bind settles");
    let server = Arc::clone(outcome.value().expect("bind succeeds"));
    wait_until("acceptor installed", Duration::from_secs(2), || {
        server.pipeline().context("acceptor").is_some()
    });

    let child = StubChannel::accepted();
    server.pipeline().fire_channel_read(PipelineMessage::Channel(
        Arc::clone(&child) as Arc<dyn Channel>,
    ));
    wait_until("child served by parent group", Duration::from_secs(2), || {
        child_ready.load(Ordering::SeqCst) == 1 && child.is_active()
    });
    assert_eq!(
        child.reactor().expect("child bound").name(),
        "fallback-0",
        "the parent group serves children when no child group is set"
    );

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_outcome(Some(Duration::from_secs(5)))
        .expect("group terminates");
}
