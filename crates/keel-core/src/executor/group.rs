//! 反应器池与轮转分配。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::executor::{ImmediateExecutor, Reactor};
use crate::future::{KeelFuture, Promise};
use crate::selector::SelectorProvider;

/// 固定规模的反应器池。
///
/// # 设计背景（Why）
/// - 池在构造时即开出全部反应器（线程仍按需启动），规模终身不变，
///   这样分配器可以用纯算术实现严格公平；
/// - 任意窗口内 `N·k` 次 `next()` 恰好把每个反应器命中 `k` 次。
///
/// # 核心逻辑（How）
/// - `N` 为 2 的幂时用掩码自增选取下标，否则取模；两者都满足公平性，
///   前者在热路径上省去一次除法。
pub struct ReactorGroup {
    reactors: Vec<Arc<Reactor>>,
    next: AtomicUsize,
    mask: Option<usize>,
}

impl ReactorGroup {
    /// 以默认参数构建 `size` 个反应器的池。
    pub fn new(
        size: usize,
        provider: Arc<dyn SelectorProvider>,
        name_prefix: &str,
    ) -> Result<Arc<Self>> {
        Self::builder(provider).size(size).name_prefix(name_prefix).build()
    }

    pub fn builder(provider: Arc<dyn SelectorProvider>) -> ReactorGroupBuilder {
        ReactorGroupBuilder {
            provider,
            size: 1,
            name_prefix: "keel-reactor".to_string(),
            io_ratio: 50,
            spin_threshold: 512,
        }
    }

    /// 轮转选出下一个反应器。
    pub fn next(&self) -> Arc<Reactor> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        let index = match self.mask {
            Some(mask) => index & mask,
            None => index % self.reactors.len(),
        };
        Arc::clone(&self.reactors[index])
    }

    /// 遍历池内全部反应器。
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Reactor>> {
        self.reactors.iter()
    }

    /// 池规模。
    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// 向全部成员扇出优雅关闭，返回聚合终止 Future。
    ///
    /// 个别成员异常终止不阻塞聚合完成，异常在成员自身的终止 Promise 上体现。
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> KeelFuture<()> {
        let aggregate: Promise<()> = Promise::new(Arc::new(ImmediateExecutor));
        let future = aggregate.future();
        let remaining = Arc::new(AtomicUsize::new(self.reactors.len()));
        for reactor in &self.reactors {
            let member = reactor.shutdown_gracefully(quiet, timeout);
            let aggregate = aggregate.clone();
            let remaining = Arc::clone(&remaining);
            let name = reactor.name().to_string();
            member.add_listener(move |outcome| {
                if !outcome.is_success() {
                    debug!(target: "keel_core::reactor", reactor = %name, "member terminated abnormally");
                }
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    aggregate.try_success(());
                }
            });
        }
        future
    }

    /// 阻塞等待池终止；超时返回 `false`。
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        for reactor in &self.reactors {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if reactor
                .terminated_future()
                .await_outcome(Some(remaining))
                .is_err()
            {
                return false;
            }
        }
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.reactors.iter().all(|r| r.is_shutting_down())
    }

    pub fn is_shutdown(&self) -> bool {
        self.reactors.iter().all(|r| r.is_shutdown())
    }

    pub fn is_terminated(&self) -> bool {
        self.reactors.iter().all(|r| r.is_terminated())
    }
}

impl std::fmt::Debug for ReactorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorGroup")
            .field("size", &self.reactors.len())
            .finish()
    }
}

/// 池构造参数。
///
/// # 契约说明（What）
/// - `size ≥ 1`；`io_ratio ∈ [1, 100]`；`spin_threshold` 为一秒窗口内触发
///   选择器重建的空转次数。
pub struct ReactorGroupBuilder {
    provider: Arc<dyn SelectorProvider>,
    size: usize,
    name_prefix: String,
    io_ratio: u8,
    spin_threshold: u32,
}

impl ReactorGroupBuilder {
    pub fn size(mut self, size: usize) -> Self {
        assert!(size >= 1, "reactor group requires at least one member");
        self.size = size;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn io_ratio(mut self, ratio: u8) -> Self {
        assert!((1..=100).contains(&ratio), "io_ratio must be in 1..=100");
        self.io_ratio = ratio;
        self
    }

    pub fn spin_threshold(mut self, threshold: u32) -> Self {
        self.spin_threshold = threshold.max(1);
        self
    }

    pub fn build(self) -> Result<Arc<ReactorGroup>> {
        let mut reactors = Vec::with_capacity(self.size);
        for index in 0..self.size {
            reactors.push(Reactor::new(
                format!("{}-{index}", self.name_prefix),
                Arc::clone(&self.provider),
                self.io_ratio,
                self.spin_threshold,
            )?);
        }
        let mask = self.size.is_power_of_two().then(|| self.size - 1);
        Ok(Arc::new(ReactorGroup {
            reactors,
            next: AtomicUsize::new(0),
            mask,
        }))
    }
}
