//! 写一次结果容器：`Promise` / `KeelFuture`。
//!
//! # 设计背景（Why）
//! - 出站操作（bind/write/close……）与注册流程都需要一个可跨线程传递、
//!   在指定执行器上回调监听器的结果容器；
//! - 状态必须是写一次的：完成之后的再次完成在宽松入口下是空操作，
//!   在严格入口下返回结构化错误，杜绝"谁先写谁算"的竞态语义。
//!
//! # 契约说明（What）
//! - 监听器始终在关联执行器上运行，且按注册顺序回调；完成后追加的监听器
//!   立即以同样的执行器调度；
//! - 取消只对显式声明可取消的实例生效；
//! - 阻塞等待入口拒绝在关联执行器的事件循环线程上调用，避免自死锁。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result, codes};
use crate::executor::EventExecutor;

/// 完成后的终态。
///
/// # 契约说明（What）
/// - 三个变体互斥且不可逆；`Failure` 携带根因错误，调用方通过 `Arc` 共享读取。
#[derive(Debug)]
pub enum FutureOutcome<T> {
    /// 操作成功，附带结果值。
    Success(T),
    /// 操作失败，附带结构化错误。
    Failure(CoreError),
    /// 操作在开始前被取消。
    Cancelled,
}

impl<T> FutureOutcome<T> {
    /// 是否成功完成。
    pub fn is_success(&self) -> bool {
        matches!(self, FutureOutcome::Success(_))
    }

    /// 是否以失败终结。
    pub fn is_failure(&self) -> bool {
        matches!(self, FutureOutcome::Failure(_))
    }

    /// 是否被取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FutureOutcome::Cancelled)
    }

    /// 读取失败原因（若处于失败态）。
    pub fn failure(&self) -> Option<&CoreError> {
        match self {
            FutureOutcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// 读取成功值（若处于成功态）。
    pub fn value(&self) -> Option<&T> {
        match self {
            FutureOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&FutureOutcome<T>) + Send + 'static>;

struct State<T> {
    outcome: Option<Arc<FutureOutcome<T>>>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    executor: Arc<dyn EventExecutor>,
    cancellable: bool,
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// 写入终态；返回 `false` 表示已有终态，本次为一次空操作。
    fn complete(&self, outcome: FutureOutcome<T>) -> bool {
        let (outcome, listeners) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            let outcome = Arc::new(outcome);
            state.outcome = Some(Arc::clone(&outcome));
            let listeners = std::mem::take(&mut state.listeners);
            self.done.notify_all();
            (outcome, listeners)
        };
        if !listeners.is_empty() {
            self.dispatch(outcome, listeners);
        }
        true
    }

    /// 在关联执行器上按注册顺序回调监听器。
    ///
    /// 已在事件循环内时就地执行，同循环内的完成对监听器即时可见；
    /// 否则整批入队，依赖执行器任务队列的 FIFO 语义维持顺序。
    fn dispatch(&self, outcome: Arc<FutureOutcome<T>>, listeners: Vec<Listener<T>>) {
        if self.executor.in_event_loop() {
            for listener in listeners {
                listener(&outcome);
            }
        } else {
            self.executor.execute(Box::new(move || {
                for listener in listeners {
                    listener(&outcome);
                }
            }));
        }
    }
}

/// 写端句柄：完成、失败或取消一个尚未终结的结果。
///
/// # 设计背景（Why）
/// - 与读端 [`KeelFuture`] 共享同一份状态，写端通常由传输实现或反应器持有，
///   读端交给调用方；两端都可克隆，真正的互斥由内部状态锁保证。
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// 创建绑定到指定执行器的不可取消 Promise。
    pub fn new(executor: Arc<dyn EventExecutor>) -> Self {
        Self::with_cancellable(executor, false)
    }

    /// 创建可取消的 Promise。
    pub fn cancellable(executor: Arc<dyn EventExecutor>) -> Self {
        Self::with_cancellable(executor, true)
    }

    fn with_cancellable(executor: Arc<dyn EventExecutor>, cancellable: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor,
                cancellable,
                state: Mutex::new(State {
                    outcome: None,
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// 返回共享同一状态的读端。
    pub fn future(&self) -> KeelFuture<T> {
        KeelFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 宽松完成：已有终态时返回 `false`。
    pub fn try_success(&self, value: T) -> bool {
        self.shared.complete(FutureOutcome::Success(value))
    }

    /// 宽松失败：已有终态时返回 `false`。
    pub fn try_failure(&self, error: CoreError) -> bool {
        self.shared.complete(FutureOutcome::Failure(error))
    }

    /// 严格完成：重复完成返回 [`codes::PROMISE_ALREADY_COMPLETE`]。
    pub fn succeed(&self, value: T) -> Result<()> {
        if self.try_success(value) {
            Ok(())
        } else {
            Err(CoreError::new(
                codes::PROMISE_ALREADY_COMPLETE,
                "promise completed more than once",
            ))
        }
    }

    /// 严格失败：重复完成返回 [`codes::PROMISE_ALREADY_COMPLETE`]。
    pub fn fail(&self, error: CoreError) -> Result<()> {
        if self.try_failure(error) {
            Ok(())
        } else {
            Err(CoreError::new(
                codes::PROMISE_ALREADY_COMPLETE,
                "promise completed more than once",
            ))
        }
    }

    /// 尝试取消；仅对声明可取消且尚未终结的实例生效。
    pub fn try_cancel(&self) -> bool {
        if !self.shared.cancellable {
            return false;
        }
        self.shared.complete(FutureOutcome::Cancelled)
    }

    /// 是否已有终态。
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }
}

/// 读端句柄：查询终态、注册监听器或阻塞等待。
pub struct KeelFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for KeelFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> KeelFuture<T> {
    /// 构造一个已成功完成的 Future，用于同步快路径。
    pub fn succeeded(executor: Arc<dyn EventExecutor>, value: T) -> Self {
        let promise = Promise::new(executor);
        let _ = promise.try_success(value);
        promise.future()
    }

    /// 构造一个已失败的 Future。
    pub fn failed(executor: Arc<dyn EventExecutor>, error: CoreError) -> Self {
        let promise = Promise::new(executor);
        let _ = promise.try_failure(error);
        promise.future()
    }

    /// 是否已有终态。
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// 是否成功（未完成视为 `false`）。
    pub fn is_success(&self) -> bool {
        self.shared
            .state
            .lock()
            .outcome
            .as_ref()
            .is_some_and(|outcome| outcome.is_success())
    }

    /// 读取当前终态快照。
    pub fn outcome(&self) -> Option<Arc<FutureOutcome<T>>> {
        self.shared.state.lock().outcome.clone()
    }

    /// 注册完成监听器。
    ///
    /// # 契约说明（What）
    /// - 未完成时入队，完成时按注册顺序在关联执行器上回调；
    /// - 已完成时立即调度（同循环就地执行，跨线程经执行器入队）。
    pub fn add_listener(&self, listener: impl FnOnce(&FutureOutcome<T>) + Send + 'static) {
        let mut state = self.shared.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(state);
                self.shared.dispatch(outcome, vec![Box::new(listener)]);
            }
            None => {
                state.listeners.push(Box::new(listener));
            }
        }
    }

    /// 阻塞等待终态。
    ///
    /// # 契约说明（What）
    /// - `timeout` 为 `None` 表示无限等待；
    /// - 在关联执行器的事件循环线程上调用将直接返回
    ///   [`codes::PROMISE_BLOCKING_IN_LOOP`]，这是对自死锁的硬性防护。
    pub fn await_outcome(&self, timeout: Option<Duration>) -> Result<Arc<FutureOutcome<T>>> {
        if self.shared.executor.in_event_loop() {
            return Err(CoreError::new(
                codes::PROMISE_BLOCKING_IN_LOOP,
                "blocking await on the owning event loop would deadlock",
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Ok(Arc::clone(outcome));
            }
            match deadline {
                None => self.shared.done.wait(&mut state),
                Some(deadline) => {
                    if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                        return Err(CoreError::new(
                            codes::PROMISE_TIMEOUT,
                            "await_outcome timed out",
                        ));
                    }
                }
            }
        }
    }
}

/// 通道操作共用的无值写端。
pub type ChannelPromise = Promise<()>;
/// 通道操作共用的无值读端。
pub type ChannelFuture = KeelFuture<()>;
