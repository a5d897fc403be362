//! 单线程反应器：就绪选择 + 任务队列 + 定时堆。
//!
//! # 设计背景（Why）
//! - 每个反应器独占一个工作线程与一个就绪选择器，所有归属它的通道/管道
//!   状态只在该线程上被改写，外部线程一律通过任务队列进入；
//! - 工作线程在首次提交任务时才启动，空闲的反应器不占线程资源。
//!
//! # 核心逻辑（How）
//! - 主循环每轮：咨询选择策略 → 选择器等待（上限为下一个定时任务截止）→
//!   分发就绪事件 → 按 IO/任务时间配比运行任务；
//! - 选择器在短窗口内连续空转超过阈值时触发重建：开出新选择器、
//!   重放全部存活注册、丢弃已取消的键，期间用户任务最多延迟一轮循环；
//! - 优雅关闭进入静默观察期：静默期内无新任务或总时限耗尽即退出循环，
//!   随后关闭全部注册通道并完成终止 Promise。

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::error::{CoreError, Result, codes};
use crate::executor::{
    DefaultSelectStrategy, EventExecutor, ImmediateExecutor, SelectAction, SelectStrategy, Task,
};
use crate::future::{ChannelFuture, ChannelPromise, KeelFuture, Promise};
use crate::selector::{
    InterestSet, ReadyEvent, SelectionToken, Selector, SelectorProvider, SelectorWaker,
};

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_SHUTDOWN: u8 = 3;
const STATE_TERMINATED: u8 = 4;

/// 每执行 64 个任务检查一次时间预算，摊薄取时成本。
const TASK_DEADLINE_CHECK_INTERVAL: usize = 64;
/// 空转判定窗口。
const SPIN_WINDOW: Duration = Duration::from_secs(1);
/// 选择器等待短于该值且一无所获即视作一次空转。
const PREMATURE_SELECT: Duration = Duration::from_millis(1);

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// 当前线程正在驱动的反应器标识；0 表示非工作线程。
    static CURRENT_REACTOR: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// 定时任务的取消句柄。
///
/// # 契约说明（What）
/// - `cancel` 仅做标记，条目仍留在堆中，反应器在弹出时丢弃；
/// - 已开始执行的任务不受取消影响。
#[derive(Clone, Debug)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct ScheduledEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    /// `BinaryHeap` 是大顶堆，这里反转比较方向使最早截止的条目先弹出。
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Registration {
    channel: Arc<dyn Channel>,
    interest: InterestSet,
}

struct ShutdownPlan {
    quiet: Duration,
    hard_deadline: Instant,
}

/// 单线程事件循环。
///
/// # 契约说明（What）
/// - `execute` 可从任意线程调用；`register_channel` 是通道获得归属的唯一入口；
/// - 归属本反应器的通道、管道与选择键只在工作线程上被改写，
///   `attach_io`/`update_interest`/`detach_io` 均要求在循环内调用；
/// - 终止 Promise 在循环退出且资源回收完毕后恰好完成一次。
pub struct Reactor {
    id: u64,
    name: String,
    provider: Arc<dyn SelectorProvider>,
    io_ratio: u8,
    spin_threshold: u32,
    selector: Mutex<Box<dyn Selector>>,
    waker: Mutex<Arc<dyn SelectorWaker>>,
    wake_pending: AtomicBool,
    tasks: Mutex<VecDeque<Task>>,
    scheduled: Mutex<BinaryHeap<ScheduledEntry>>,
    schedule_seq: AtomicU64,
    registrations: Mutex<HashMap<SelectionToken, Registration>>,
    next_token: AtomicUsize,
    state: AtomicU8,
    shutdown: Mutex<Option<ShutdownPlan>>,
    last_activity: Mutex<Instant>,
    terminated: Promise<()>,
    self_ref: Mutex<Weak<Reactor>>,
}

impl Reactor {
    /// 创建反应器并立即开出选择器；工作线程推迟到首次任务提交。
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn SelectorProvider>,
        io_ratio: u8,
        spin_threshold: u32,
    ) -> Result<Arc<Self>> {
        debug_assert!((1..=100).contains(&io_ratio));
        let selector = provider.open()?;
        let waker = selector.waker();
        let reactor = Arc::new(Self {
            id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            provider,
            io_ratio,
            spin_threshold,
            selector: Mutex::new(selector),
            waker: Mutex::new(waker),
            wake_pending: AtomicBool::new(false),
            tasks: Mutex::new(VecDeque::new()),
            scheduled: Mutex::new(BinaryHeap::new()),
            schedule_seq: AtomicU64::new(0),
            registrations: Mutex::new(HashMap::new()),
            // 键 0 预留给选择器实现的内部唤醒源。
            next_token: AtomicUsize::new(1),
            state: AtomicU8::new(STATE_NOT_STARTED),
            shutdown: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            terminated: Promise::new(Arc::new(ImmediateExecutor)),
            self_ref: Mutex::new(Weak::new()),
        });
        *reactor.self_ref.lock() = Arc::downgrade(&reactor);
        Ok(reactor)
    }

    /// 反应器名称（同时用作工作线程名）。
    pub fn name(&self) -> &str {
        &self.name
    }

    fn upgrade_self(&self) -> Arc<Reactor> {
        self.self_ref
            .lock()
            .upgrade()
            .expect("reactor weak self must be initialized")
    }

    /// 以 `dyn EventExecutor` 形态暴露自身，供 Promise 与管道上下文持有。
    pub fn as_executor(&self) -> Arc<dyn EventExecutor> {
        self.upgrade_self()
    }

    /// 延迟执行一个一次性任务。
    pub fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = ScheduledEntry {
            deadline: Instant::now() + delay,
            seq: self.schedule_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::clone(&cancelled),
            task,
        };
        self.scheduled.lock().push(entry);
        self.start_worker_if_needed();
        if !self.in_event_loop() {
            // 新截止时间可能早于当前选择器等待上限，必须打断一次。
            self.wake();
        }
        ScheduledHandle { cancelled }
    }

    /// 把通道注册到本反应器；成功后归属关系终身不变。
    ///
    /// # 契约说明（What）
    /// - 注册效果顺序：绑定归属 → 选择键分配 → 补发 `handler_added` →
    ///   完成返回的 Future → `channel_registered` → 若通道已活跃则
    ///   `channel_active` 并按 auto-read 发起首次读取；
    /// - 关闭流程中的反应器拒绝新注册。
    pub fn register_channel(&self, channel: Arc<dyn Channel>) -> ChannelFuture {
        let this = self.upgrade_self();
        let promise = ChannelPromise::new(Arc::clone(&this) as Arc<dyn EventExecutor>);
        let future = promise.future();
        self.execute(Box::new(move || this.do_register(channel, promise)));
        future
    }

    fn do_register(&self, channel: Arc<dyn Channel>, promise: ChannelPromise) {
        if self.is_shutting_down() {
            promise.try_failure(CoreError::new(
                codes::REACTOR_SHUTTING_DOWN,
                "reactor is shutting down; registration rejected",
            ));
            return;
        }
        if let Err(err) = channel.core().bind_reactor(self.upgrade_self()) {
            promise.try_failure(err);
            return;
        }
        let token = SelectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        channel.core().assign_token(token);
        {
            let mut selector = self.selector.lock();
            if let Err(err) = channel.register_io(selector.as_mut(), token, InterestSet::empty()) {
                // 注册只在失败时幂等：回滚归属，调用方可另择反应器重试。
                channel.core().unbind_reactor();
                promise.try_failure(err);
                return;
            }
        }
        self.registrations.lock().insert(
            token,
            Registration {
                channel: Arc::clone(&channel),
                interest: InterestSet::empty(),
            },
        );
        channel
            .core()
            .init_close_promise(self.upgrade_self() as Arc<dyn EventExecutor>);
        channel.core().mark_registered();
        let pipeline = channel.pipeline();
        pipeline.invoke_handler_added_if_needed();
        promise.try_success(());
        pipeline.fire_channel_registered();
        if channel.is_transport_active() {
            channel.core().mark_active();
            // auto-read 的首次读取由头哨兵在 channel_active 转发完成后补发。
            pipeline.fire_channel_active();
        }
    }

    /// 把通道的 IO 源挂到选择器上（循环线程专用）。
    ///
    /// 监听通道在 `bind` 之后才真正拥有套接字，所以选择键在注册时分配、
    /// IO 源在这里补挂。
    pub fn attach_io(&self, channel: &dyn Channel, interest: InterestSet) -> Result<()> {
        debug_assert!(self.in_event_loop());
        let token = channel.core().token().ok_or_else(|| {
            CoreError::new(codes::CHANNEL_NOT_REGISTERED, "channel has no selection key")
        })?;
        {
            let mut selector = self.selector.lock();
            channel.register_io(selector.as_mut(), token, interest)?;
        }
        if let Some(registration) = self.registrations.lock().get_mut(&token) {
            registration.interest = interest;
        }
        Ok(())
    }

    /// 调整通道兴趣集（循环线程专用）。
    pub fn update_interest(&self, channel: &dyn Channel, interest: InterestSet) -> Result<()> {
        debug_assert!(self.in_event_loop());
        let token = channel.core().token().ok_or_else(|| {
            CoreError::new(codes::CHANNEL_NOT_REGISTERED, "channel has no selection key")
        })?;
        {
            let mut selector = self.selector.lock();
            channel.reregister_io(selector.as_mut(), token, interest)?;
        }
        if let Some(registration) = self.registrations.lock().get_mut(&token) {
            registration.interest = interest;
        }
        Ok(())
    }

    /// 摘除通道的 IO 源并遗忘其选择键（循环线程专用）。
    pub fn detach_io(&self, channel: &dyn Channel) -> Result<()> {
        debug_assert!(self.in_event_loop());
        let Some(token) = channel.core().token() else {
            return Ok(());
        };
        self.registrations.lock().remove(&token);
        let mut selector = self.selector.lock();
        channel.deregister_io(selector.as_mut())
    }

    /// 请求优雅关闭。
    ///
    /// # 契约说明（What）
    /// - 关闭期间仍受理任务；循环在静默 `quiet` 后退出，`timeout` 为硬上限；
    /// - 返回终止 Future；重复调用共享同一个终止 Promise。
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> KeelFuture<()> {
        let future = self.terminated_future();
        loop {
            let state = self.state.load(Ordering::SeqCst);
            match state {
                STATE_NOT_STARTED => {
                    // 线程从未启动：没有资源需要回收，直接终止。
                    if self
                        .state
                        .compare_exchange(
                            STATE_NOT_STARTED,
                            STATE_TERMINATED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.terminated.try_success(());
                        return future;
                    }
                }
                STATE_RUNNING => {
                    let mut plan = self.shutdown.lock();
                    if self
                        .state
                        .compare_exchange(
                            STATE_RUNNING,
                            STATE_SHUTTING_DOWN,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        *plan = Some(ShutdownPlan {
                            quiet,
                            hard_deadline: Instant::now() + timeout,
                        });
                        drop(plan);
                        info!(target: "keel_core::reactor", reactor = %self.name, "graceful shutdown requested");
                        self.wake();
                        return future;
                    }
                }
                _ => return future,
            }
        }
    }

    /// 终止 Future：循环退出且资源回收完毕后完成。
    pub fn terminated_future(&self) -> KeelFuture<()> {
        self.terminated.future()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_SHUTTING_DOWN
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_SHUTDOWN
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_TERMINATED
    }

    fn wake(&self) {
        self.wake_pending.store(true, Ordering::SeqCst);
        let waker = Arc::clone(&*self.waker.lock());
        waker.wake();
    }

    fn start_worker_if_needed(&self) {
        if self
            .state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let this = self.upgrade_self();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || this.run());
        if let Err(err) = spawned {
            error!(target: "keel_core::reactor", reactor = %name, error = %err, "failed to spawn worker thread");
            self.state.store(STATE_TERMINATED, Ordering::SeqCst);
            self.terminated.try_failure(
                CoreError::new(codes::REACTOR_SELECTOR_FAILED, "worker thread spawn failed")
                    .with_cause(err),
            );
        }
    }

    // ---------------------------------------------------------------- 主循环

    fn run(self: Arc<Self>) {
        CURRENT_REACTOR.with(|current| current.set(self.id));
        debug!(target: "keel_core::reactor", reactor = %self.name, "event loop started");

        let mut strategy = DefaultSelectStrategy;
        let mut events: Vec<ReadyEvent> = Vec::with_capacity(256);
        let mut spin_count: u32 = 0;
        let mut spin_window = Instant::now();
        let mut failure: Option<CoreError> = None;

        loop {
            let pending = self.tasks.lock().len();
            let timeout = match strategy.next_action(pending) {
                SelectAction::RunTasksFirst => {
                    self.run_tasks(None);
                    continue;
                }
                SelectAction::PollNow => Some(Duration::ZERO),
                SelectAction::BlockUntilDeadline => self.wait_timeout(),
            };

            events.clear();
            let select_started = Instant::now();
            let selected = {
                let mut selector = self.selector.lock();
                selector.select(timeout, &mut events)
            };
            let select_elapsed = select_started.elapsed();

            match selected {
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "keel_core::reactor", reactor = %self.name, error = %err, "selector wait failed; rebuilding");
                    if !self.rebuild_selector() {
                        failure = Some(CoreError::new(
                            codes::REACTOR_SELECTOR_FAILED,
                            "selector failed and could not be rebuilt",
                        ));
                        break;
                    }
                    continue;
                }
            }

            // 空转检测：明明允许阻塞却立刻空手而归，且并非被唤醒。
            let woken = self.wake_pending.swap(false, Ordering::SeqCst);
            let intended_block = timeout.is_none_or(|t| t > Duration::ZERO);
            if events.is_empty()
                && intended_block
                && !woken
                && select_elapsed < PREMATURE_SELECT
                && self.tasks.lock().is_empty()
            {
                if spin_window.elapsed() >= SPIN_WINDOW {
                    spin_count = 0;
                    spin_window = Instant::now();
                }
                spin_count += 1;
                if spin_count >= self.spin_threshold {
                    warn!(
                        target: "keel_core::reactor",
                        reactor = %self.name,
                        spins = spin_count,
                        "selector spinning without events; rebuilding"
                    );
                    if !self.rebuild_selector() {
                        failure = Some(CoreError::new(
                            codes::REACTOR_SELECTOR_FAILED,
                            "selector spin rebuild failed",
                        ));
                        break;
                    }
                    spin_count = 0;
                    spin_window = Instant::now();
                }
            } else {
                spin_count = 0;
            }

            let io_started = Instant::now();
            for event in events.drain(..) {
                let channel = self
                    .registrations
                    .lock()
                    .get(&event.token)
                    .map(|registration| Arc::clone(&registration.channel));
                match channel {
                    Some(channel) => channel.process_ready(event.ops),
                    // 键已在本轮内被取消（如前一个事件关闭了通道）。
                    None => debug!(target: "keel_core::reactor", token = ?event.token, "ready key without registration"),
                }
            }
            let io_elapsed = io_started.elapsed();

            self.promote_scheduled();
            self.run_tasks(self.task_budget(io_elapsed));

            if self.is_shutting_down() && self.confirm_shutdown() {
                break;
            }
        }

        self.state.store(STATE_SHUTDOWN, Ordering::SeqCst);
        self.close_all_channels();
        self.run_tasks(None);
        CURRENT_REACTOR.with(|current| current.set(0));
        self.state.store(STATE_TERMINATED, Ordering::SeqCst);
        match failure {
            None => {
                info!(target: "keel_core::reactor", reactor = %self.name, "event loop terminated");
                self.terminated.try_success(());
            }
            Some(err) => {
                error!(target: "keel_core::reactor", reactor = %self.name, error = %err, "event loop terminated abnormally");
                self.terminated.try_failure(err);
            }
        }
    }

    /// IO 时间换算任务预算：默认 50 配比下两者获得相同的墙钟份额。
    fn task_budget(&self, io_elapsed: Duration) -> Option<Duration> {
        if self.io_ratio >= 100 {
            return None;
        }
        Some(io_elapsed * u32::from(100 - self.io_ratio) / u32::from(self.io_ratio))
    }

    fn wait_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut deadline: Option<Instant> = self
            .scheduled
            .lock()
            .peek()
            .map(|entry| entry.deadline);
        if let Some(plan) = self.shutdown.lock().as_ref() {
            let quiet_deadline = *self.last_activity.lock() + plan.quiet;
            let cap = quiet_deadline.min(plan.hard_deadline);
            deadline = Some(deadline.map_or(cap, |d| d.min(cap)));
        }
        deadline.map(|d| d.saturating_duration_since(now))
    }

    fn promote_scheduled(&self) {
        let now = Instant::now();
        loop {
            let entry = {
                let mut scheduled = self.scheduled.lock();
                match scheduled.peek() {
                    Some(entry) if entry.deadline <= now => scheduled.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            // 已取消的条目到点即丢弃。
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            self.tasks.lock().push_back(entry.task);
        }
    }

    fn run_tasks(&self, budget: Option<Duration>) -> usize {
        let deadline = budget.map(|b| Instant::now() + b);
        let mut executed = 0usize;
        loop {
            let task = self.tasks.lock().pop_front();
            let Some(task) = task else { break };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(target: "keel_core::reactor", reactor = %self.name, panic = %detail, "task panicked; loop continues");
            }
            executed += 1;
            if executed % TASK_DEADLINE_CHECK_INTERVAL == 0
                && deadline.is_some_and(|d| Instant::now() >= d)
            {
                break;
            }
        }
        if executed > 0 {
            *self.last_activity.lock() = Instant::now();
        }
        executed
    }

    fn confirm_shutdown(&self) -> bool {
        if self.run_tasks(None) > 0 {
            return false;
        }
        let plan = self.shutdown.lock();
        let Some(plan) = plan.as_ref() else {
            return true;
        };
        let now = Instant::now();
        now >= plan.hard_deadline || now >= *self.last_activity.lock() + plan.quiet
    }

    /// 重建选择器：开出新实例并重放全部存活注册。
    fn rebuild_selector(&self) -> bool {
        let mut fresh = match self.provider.open() {
            Ok(selector) => selector,
            Err(err) => {
                error!(target: "keel_core::reactor", reactor = %self.name, error = %err, "selector rebuild: open failed");
                return false;
            }
        };
        let mut dropped: Vec<SelectionToken> = Vec::new();
        {
            let registrations = self.registrations.lock();
            for (token, registration) in registrations.iter() {
                if registration.channel.core().state() == crate::channel::ChannelState::Closed {
                    dropped.push(*token);
                    continue;
                }
                if let Err(err) =
                    registration
                        .channel
                        .register_io(fresh.as_mut(), *token, registration.interest)
                {
                    warn!(
                        target: "keel_core::reactor",
                        reactor = %self.name,
                        channel = %registration.channel.id(),
                        error = %err,
                        "selector rebuild: re-register failed; channel will be closed"
                    );
                    let channel = Arc::clone(&registration.channel);
                    self.execute(Box::new(move || {
                        let _ = channel.close();
                    }));
                    dropped.push(*token);
                }
            }
        }
        let waker = fresh.waker();
        *self.selector.lock() = fresh;
        *self.waker.lock() = waker;
        if !dropped.is_empty() {
            let mut registrations = self.registrations.lock();
            for token in dropped {
                registrations.remove(&token);
            }
        }
        info!(target: "keel_core::reactor", reactor = %self.name, "selector rebuilt");
        true
    }

    fn close_all_channels(&self) {
        let channels: Vec<Arc<dyn Channel>> = self
            .registrations
            .lock()
            .values()
            .map(|registration| Arc::clone(&registration.channel))
            .collect();
        for channel in channels {
            let _ = channel.close();
        }
    }
}

impl EventExecutor for Reactor {
    fn execute(&self, task: Task) {
        if self.is_terminated() {
            warn!(target: "keel_core::reactor", reactor = %self.name, "task submitted after termination; dropped");
            return;
        }
        self.tasks.lock().push_back(task);
        *self.last_activity.lock() = Instant::now();
        self.start_worker_if_needed();
        if !self.in_event_loop() {
            self.wake();
        }
    }

    fn in_event_loop(&self) -> bool {
        CURRENT_REACTOR.with(|current| current.get()) == self.id
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}
