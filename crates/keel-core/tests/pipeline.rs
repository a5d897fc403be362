//! 管道契约测试：掩码跳过、变更不变量、错误路由与延迟初始化。

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use keel_core::channel::{Channel, PipelineMessage};
use keel_core::error::{CoreError, Result, codes};
use keel_core::pipeline::{ChannelHandler, ChannelInitializer, EventMask, HandlerContext};
use keel_core::test_stubs::StubChannel;

/// 只声明 `channel_read` 的 Handler（S3 的 `X`）。
struct ReadOnlyHandler {
    reads: Arc<AtomicUsize>,
    actives: Arc<AtomicUsize>,
}

impl ChannelHandler for ReadOnlyHandler {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_active(&self, ctx: &HandlerContext) -> Result<()> {
        // 未声明 CHANNEL_ACTIVE：分发器绝不应触达这里。
        self.actives.fetch_add(1, Ordering::SeqCst);
        ctx.fire_channel_active();
        Ok(())
    }
}

/// 记录收到的负载顺序。
struct SequenceRecorder {
    seen: Arc<Mutex<Vec<Bytes>>>,
}

impl ChannelHandler for SequenceRecorder {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_read(&self, _ctx: &HandlerContext, msg: PipelineMessage) -> Result<()> {
        if let PipelineMessage::Bytes(bytes) = msg {
            self.seen.lock().unwrap().push(bytes);
        }
        Ok(())
    }
}

/// 读到消息即报错的 Handler。
struct FailingReader {
    exceptions_seen: Arc<AtomicUsize>,
}

impl ChannelHandler for FailingReader {
    fn handled_events(&self) -> EventMask {
        EventMask::CHANNEL_READ | EventMask::EXCEPTION_CAUGHT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn channel_read(&self, _ctx: &HandlerContext, _msg: PipelineMessage) -> Result<()> {
        Err(CoreError::new(
            codes::PIPELINE_HANDLER_FAILED,
            "deliberate failure",
        ))
    }

    fn exception_caught(&self, ctx: &HandlerContext, error: CoreError) -> Result<()> {
        self.exceptions_seen.fetch_add(1, Ordering::SeqCst);
        ctx.fire_exception_caught(error);
        Ok(())
    }
}

/// 记录异常的 Handler。
struct ExceptionRecorder {
    codes_seen: Arc<Mutex<Vec<&'static str>>>,
}

impl ChannelHandler for ExceptionRecorder {
    fn handled_events(&self) -> EventMask {
        EventMask::EXCEPTION_CAUGHT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn exception_caught(&self, _ctx: &HandlerContext, error: CoreError) -> Result<()> {
        self.codes_seen.lock().unwrap().push(error.code());
        Ok(())
    }
}

/// 可共享的计数 Handler，用于重复加入检查。
struct SharableCounter;

impl ChannelHandler for SharableCounter {
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

/// 空声明 Handler：必须被拒绝加入。
struct DeclaresNothing;

impl ChannelHandler for DeclaresNothing {
    fn handled_events(&self) -> EventMask {
        EventMask::empty()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn mask_skip_dispatches_only_declared_events() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    let reads = Arc::new(AtomicUsize::new(0));
    let actives = Arc::new(AtomicUsize::new(0));
    pipeline
        .add_last(
            "x",
            Arc::new(ReadOnlyHandler {
                reads: Arc::clone(&reads),
                actives: Arc::clone(&actives),
            }),
        )
        .expect("add handler");

    pipeline.fire_channel_active();
    pipeline.fire_channel_read(PipelineMessage::Bytes(Bytes::from_static(b"p")));

    assert_eq!(reads.load(Ordering::SeqCst), 1, "channel_read dispatched once");
    assert_eq!(
        actives.load(Ordering::SeqCst),
        0,
        "undeclared channel_active must be skipped"
    );
}

#[test]
fn reads_preserve_transport_order() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_last(
            "recorder",
            Arc::new(SequenceRecorder {
                seen: Arc::clone(&seen),
            }),
        )
        .expect("add recorder");

    let payloads: Vec<Bytes> = (0..8u8)
        .map(|i| Bytes::copy_from_slice(&[i]))
        .collect();
    for payload in &payloads {
        pipeline.fire_channel_read(PipelineMessage::Bytes(payload.clone()));
    }
    assert_eq!(*seen.lock().unwrap(), payloads);
}

#[test]
fn handler_error_routes_to_next_context_only() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    let own_exceptions = Arc::new(AtomicUsize::new(0));
    let downstream = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_last(
            "failing",
            Arc::new(FailingReader {
                exceptions_seen: Arc::clone(&own_exceptions),
            }),
        )
        .expect("add failing reader");
    pipeline
        .add_last(
            "exceptions",
            Arc::new(ExceptionRecorder {
                codes_seen: Arc::clone(&downstream),
            }),
        )
        .expect("add exception recorder");

    pipeline.fire_channel_read(PipelineMessage::Bytes(Bytes::from_static(b"boom")));

    assert_eq!(
        own_exceptions.load(Ordering::SeqCst),
        0,
        "the failing handler must not observe its own error"
    );
    assert_eq!(
        *downstream.lock().unwrap(),
        vec![codes::PIPELINE_HANDLER_FAILED],
        "the next inbound context observes the converted exception"
    );
}

#[test]
fn mutation_invariants_are_enforced() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    let shared: Arc<dyn ChannelHandler> = Arc::new(SharableCounter);
    pipeline.add_last("a", Arc::clone(&shared)).expect("first add");

    // 名称唯一。
    let err = pipeline
        .add_last("a", Arc::new(SharableCounter))
        .expect_err("duplicate name rejected");
    assert_eq!(err.code(), codes::PIPELINE_DUPLICATE_NAME);

    // 可共享实例允许再次加入。
    pipeline
        .add_last("a2", Arc::clone(&shared))
        .expect("sharable instance may repeat");

    // 非共享实例不允许重复。
    let exclusive: Arc<dyn ChannelHandler> = Arc::new(ReadOnlyHandler {
        reads: Arc::new(AtomicUsize::new(0)),
        actives: Arc::new(AtomicUsize::new(0)),
    });
    pipeline.add_last("b", Arc::clone(&exclusive)).expect("add");
    let err = pipeline
        .add_last("b2", exclusive)
        .expect_err("non-sharable duplicate rejected");
    assert_eq!(err.code(), codes::PIPELINE_DUPLICATE_HANDLER);

    // 头尾哨兵不可移除。
    for sentinel in ["head", "tail"] {
        let err = pipeline.remove(sentinel).expect_err("sentinel protected");
        assert_eq!(err.code(), codes::PIPELINE_SENTINEL);
    }

    // 空声明被拒绝。
    let err = pipeline
        .add_last("empty", Arc::new(DeclaresNothing))
        .expect_err("empty mask rejected");
    assert_eq!(err.code(), codes::PIPELINE_EMPTY_MASK);

    // 未知锚点。
    let err = pipeline
        .add_before("missing", "c", Arc::new(SharableCounter))
        .expect_err("unknown anchor rejected");
    assert_eq!(err.code(), codes::PIPELINE_UNKNOWN_ANCHOR);
}

#[test]
fn replace_keeps_position_and_names() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    pipeline.add_last("first", Arc::new(SharableCounter)).expect("add");
    pipeline.add_last("second", Arc::new(SharableCounter)).expect("add");
    pipeline
        .replace("first", "rewritten", Arc::new(SharableCounter))
        .expect("replace in place");
    assert_eq!(
        pipeline.names(),
        vec!["head", "rewritten", "second", "tail"]
    );
    assert!(pipeline.context("first").is_none());
}

#[test]
fn initializer_populates_then_removes_itself() {
    // 注册之前：链路只有哨兵与初始化器。
    let channel = StubChannel::new();
    let pipeline = channel.core().pipeline();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in_init = Arc::clone(&runs);
    let init = ChannelInitializer::new(move |ch| {
        runs_in_init.fetch_add(1, Ordering::SeqCst);
        let pipeline = ch.pipeline();
        pipeline.add_last("a", Arc::new(SharableCounter))?;
        pipeline.add_last("b", Arc::new(SharableCounter))?;
        Ok(())
    });
    pipeline.add_last("init", init).expect("install initializer");
    assert_eq!(pipeline.names(), vec!["head", "init", "tail"]);

    // 模拟注册：补发 handler_added 并重放注册事件。
    channel.complete_registration();

    assert_eq!(pipeline.names(), vec!["head", "a", "b", "tail"]);
    assert_eq!(runs.load(Ordering::SeqCst), 1, "init ran exactly once");
}

#[test]
fn initializer_runs_at_most_once_per_channel() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in_init = Arc::clone(&runs);
    let init = ChannelInitializer::new(move |ch| {
        runs_in_init.fetch_add(1, Ordering::SeqCst);
        ch.pipeline().add_last("payload", Arc::new(SharableCounter))?;
        Ok(())
    });

    // 通道一：handler_added 路径（加入时已注册）先触发装配，
    // 随后的注册事件不得再次触发。
    let first = StubChannel::embedded();
    first
        .core()
        .pipeline()
        .add_last("init", Arc::clone(&init) as Arc<dyn ChannelHandler>)
        .expect("install on first channel");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    first.core().pipeline().fire_channel_registered();
    assert_eq!(runs.load(Ordering::SeqCst), 1, "registered event is a no-op");

    // 通道二：同一初始化器实例服务第二条通道，再跑恰好一次。
    let second = StubChannel::embedded();
    second
        .core()
        .pipeline()
        .add_last("init", Arc::clone(&init) as Arc<dyn ChannelHandler>)
        .expect("install on second channel");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        second.core().pipeline().names(),
        vec!["head", "payload", "tail"]
    );
}

#[test]
fn unconsumed_inbound_payload_is_discarded_at_tail() {
    let channel = StubChannel::embedded();
    let pipeline = channel.core().pipeline();
    let payload = Bytes::from_static(b"orphan");
    // 没有任何 Handler 消费：负载到尾哨兵被释放，不得惊扰调用方。
    pipeline.fire_channel_read(PipelineMessage::Bytes(payload));
    pipeline.fire_exception_caught(CoreError::new(codes::TRANSPORT_IO, "orphan error"));
}
