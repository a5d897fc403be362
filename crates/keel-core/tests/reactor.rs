//! 反应器契约测试：线程亲和、定时调度、优雅关闭与选择器重建。

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use keel_core::channel::Channel;
use keel_core::error::{Result, codes};
use keel_core::executor::{EventExecutor, Reactor};
use keel_core::future::Promise;
use keel_core::selector::{
    InterestSet, IoSource, ReadyEvent, SelectionToken, Selector, SelectorProvider, SelectorWaker,
};
use keel_core::test_stubs::{StubChannel, StubSelector, StubSelectorProvider};

fn stub_reactor(name: &str) -> Arc<Reactor> {
    Reactor::new(name, Arc::new(StubSelectorProvider), 50, 512).expect("reactor")
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn tasks_run_on_the_worker_thread() {
    let reactor = stub_reactor("affinity-loop");
    assert!(!reactor.in_event_loop());

    let seen = Arc::new(Mutex::new(None::<(bool, Option<String>)>));
    let seen_in_task = Arc::clone(&seen);
    let reactor_in_task = Arc::clone(&reactor);
    reactor.execute(Box::new(move || {
        *seen_in_task.lock().unwrap() = Some((
            reactor_in_task.in_event_loop(),
            thread::current().name().map(str::to_string),
        ));
    }));

    wait_until("task execution", Duration::from_secs(2), || {
        seen.lock().unwrap().is_some()
    });
    let (in_loop, name) = seen.lock().unwrap().clone().expect("recorded");
    assert!(in_loop, "in_event_loop holds inside the task");
    assert_eq!(name.as_deref(), Some("affinity-loop"));

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

#[test]
fn pipeline_callbacks_run_on_the_channel_reactor() {
    let reactor = stub_reactor("affinity-channel");
    let channel = StubChannel::accepted();
    let thread_names = Arc::new(Mutex::new(Vec::<Option<String>>::new()));

    struct ActiveProbe {
        names: Arc<Mutex<Vec<Option<String>>>>,
    }
    impl keel_core::pipeline::ChannelHandler for ActiveProbe {
        fn handled_events(&self) -> keel_core::pipeline::EventMask {
            keel_core::pipeline::EventMask::CHANNEL_ACTIVE
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn channel_active(
            &self,
            ctx: &keel_core::pipeline::HandlerContext,
        ) -> Result<()> {
            self.names
                .lock()
                .unwrap()
                .push(thread::current().name().map(str::to_string));
            ctx.fire_channel_active();
            Ok(())
        }
    }

    channel
        .core()
        .pipeline()
        .add_last(
            "probe",
            Arc::new(ActiveProbe {
                names: Arc::clone(&thread_names),
            }),
        )
        .expect("install probe");

    let registered = reactor.register_channel(Arc::clone(&channel) as Arc<dyn Channel>);
    registered
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("registration completes");

    wait_until("channel_active dispatch", Duration::from_secs(2), || {
        !thread_names.lock().unwrap().is_empty()
    });
    assert_eq!(
        thread_names.lock().unwrap()[0].as_deref(),
        Some("affinity-channel"),
        "callback thread must be the owning reactor"
    );

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

#[test]
fn scheduled_tasks_fire_near_their_deadline() {
    let reactor = stub_reactor("timer-loop");
    let fired: Promise<Duration> = Promise::new(reactor.as_executor());
    let future = fired.future();
    let started = Instant::now();
    let fired_in_task = fired.clone();
    reactor.schedule(
        Duration::from_millis(60),
        Box::new(move || {
            let _ = fired_in_task.try_success(started.elapsed());
        }),
    );
    let outcome = future
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("timer fires");
    let elapsed = *outcome.value().expect("duration");
    assert!(elapsed >= Duration::from_millis(60), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "fired late: {elapsed:?}");

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

#[test]
fn cancelled_scheduled_tasks_are_discarded_on_pop() {
    let reactor = stub_reactor("timer-cancel");
    let count = Arc::new(AtomicUsize::new(0));
    let count_in_task = Arc::clone(&count);
    let handle = reactor.schedule(
        Duration::from_millis(50),
        Box::new(move || {
            count_in_task.fetch_add(1, Ordering::SeqCst);
        }),
    );
    handle.cancel();
    assert!(handle.is_cancelled());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled timer must not run");

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

#[test]
fn task_panics_do_not_kill_the_loop() {
    let reactor = stub_reactor("panic-loop");
    reactor.execute(Box::new(|| panic!("deliberate test panic")));
    let survived = Arc::new(AtomicUsize::new(0));
    let survived_in_task = Arc::clone(&survived);
    reactor.execute(Box::new(move || {
        survived_in_task.fetch_add(1, Ordering::SeqCst);
    }));
    wait_until("post-panic task", Duration::from_secs(2), || {
        survived.load(Ordering::SeqCst) == 1
    });

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

#[test]
fn graceful_shutdown_completes_within_bounds() {
    let reactor = stub_reactor("shutdown-loop");
    for _ in 0..16 {
        reactor.execute(Box::new(|| {}));
    }
    let quiet = Duration::from_millis(100);
    let timeout = Duration::from_secs(2);
    let started = Instant::now();
    let terminated = reactor.shutdown_gracefully(quiet, timeout);
    terminated
        .await_outcome(Some(timeout + quiet + Duration::from_secs(1)))
        .expect("terminated future completes");
    let elapsed = started.elapsed();
    assert!(
        elapsed <= timeout + quiet + Duration::from_millis(500),
        "shutdown exceeded bound: {elapsed:?}"
    );
    assert!(reactor.is_shutting_down());
    assert!(reactor.is_shutdown());
    assert!(reactor.is_terminated());
}

#[test]
fn shutdown_of_never_started_reactor_is_immediate() {
    let reactor = stub_reactor("idle-loop");
    reactor.shutdown_gracefully(Duration::from_secs(5), Duration::from_secs(5));
    assert!(reactor.is_terminated());
}

#[test]
fn registration_is_rejected_while_shutting_down() {
    let reactor = stub_reactor("closing-loop");
    // 保持循环存活足够久，让注册任务在关闭状态下被处理。
    reactor.execute(Box::new(|| {}));
    reactor.shutdown_gracefully(Duration::from_millis(500), Duration::from_secs(2));
    let channel = StubChannel::new();
    let outcome = reactor
        .register_channel(channel as Arc<dyn Channel>)
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("registration settles");
    assert_eq!(
        outcome.failure().map(keel_core::CoreError::code),
        Some(codes::REACTOR_SHUTTING_DOWN)
    );
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}

// ---------------------------------------------------------------- 选择器重建

/// 首个实例持续空转、后续实例行为正常的选择器工厂。
struct SpinThenBehaveProvider {
    opened: AtomicUsize,
}

struct SpinningSelector;

struct NoopWaker;

impl SelectorWaker for NoopWaker {
    fn wake(&self) {}
}

impl Selector for SpinningSelector {
    fn register(
        &mut self,
        _source: &mut dyn IoSource,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        Ok(())
    }

    fn reregister(
        &mut self,
        _source: &mut dyn IoSource,
        _token: SelectionToken,
        _interest: InterestSet,
    ) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _source: &mut dyn IoSource, _token: SelectionToken) -> Result<()> {
        Ok(())
    }

    fn select(
        &mut self,
        _timeout: Option<Duration>,
        _events: &mut Vec<ReadyEvent>,
    ) -> Result<usize> {
        // 明明被允许阻塞却立即空手而归：典型的失控选择器。
        Ok(0)
    }

    fn waker(&self) -> Arc<dyn SelectorWaker> {
        Arc::new(NoopWaker)
    }
}

impl SelectorProvider for SpinThenBehaveProvider {
    fn open(&self) -> Result<Box<dyn Selector>> {
        if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Box::new(SpinningSelector))
        } else {
            Ok(Box::new(StubSelector::new()))
        }
    }
}

#[test]
fn spinning_selector_triggers_rebuild_and_replays_registrations() {
    let provider = Arc::new(SpinThenBehaveProvider {
        opened: AtomicUsize::new(0),
    });
    let dyn_provider: Arc<dyn SelectorProvider> = Arc::clone(&provider) as Arc<dyn SelectorProvider>;
    let reactor = Reactor::new("rebuild-loop", Arc::clone(&dyn_provider), 50, 16).expect("reactor");
    let channel = StubChannel::accepted();
    reactor
        .register_channel(Arc::clone(&channel) as Arc<dyn Channel>)
        .await_outcome(Some(Duration::from_secs(2)))
        .expect("registration completes");

    wait_until("selector rebuild", Duration::from_secs(5), || {
        provider.opened.load(Ordering::SeqCst) >= 2
    });
    wait_until("registration replay", Duration::from_secs(2), || {
        channel.io_registrations() >= 2
    });

    // 重建之后循环必须照常服务任务与定时器。
    let alive = Arc::new(AtomicUsize::new(0));
    let alive_in_task = Arc::clone(&alive);
    reactor.execute(Box::new(move || {
        alive_in_task.fetch_add(1, Ordering::SeqCst);
    }));
    wait_until("post-rebuild task", Duration::from_secs(2), || {
        alive.load(Ordering::SeqCst) == 1
    });

    reactor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
    reactor
        .terminated_future()
        .await_outcome(Some(Duration::from_secs(3)))
        .expect("terminates");
}
