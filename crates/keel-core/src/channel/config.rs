//! 通道配置与类型化选项键。
//!
//! # 设计背景（Why）
//! - 选项键进程级唯一并可携带校验谓词；配置对象承载框架识别的核心选项
//!   （接收/发送缓冲、auto-read、连接超时、写水位、backlog），其余键值
//!   进入可扩展侧表；
//! - 引导器按声明顺序应用选项，后声明的选项可以参照先前的取值做交叉校验
//!   （典型：低水位不得高于高水位）。

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

use crate::channel::registry::KeyRegistry;
use crate::error::{CoreError, Result, codes};

static OPTION_KEYS: LazyLock<KeyRegistry> = LazyLock::new(KeyRegistry::new);

type ErasedValidator = Box<dyn Fn(&dyn Any) -> bool + Send + Sync>;
static VALIDATORS: LazyLock<DashMap<usize, ErasedValidator>> = LazyLock::new(DashMap::new);

/// 进程级唯一的类型化选项键。
///
/// # 契约说明（What）
/// - `of` 取回或登记同名键；`of_validated` 额外登记校验谓词，
///   [`ChannelConfig::set_option`] 在写入前执行它；
/// - 同名不同类型按重名冲突处理。
pub struct ChannelOption<T> {
    id: usize,
    name: &'static str,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for ChannelOption<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ChannelOption<T> {}

impl<T: Send + Sync + 'static> ChannelOption<T> {
    /// 取回或登记同名键。
    pub fn of(name: &'static str) -> Result<Self> {
        let id = OPTION_KEYS.lookup_or_insert(name, TypeId::of::<T>())?;
        Ok(Self {
            id,
            name,
            _marker: PhantomData,
        })
    }

    /// 登记携带校验谓词的键；谓词失败的写入被拒绝。
    pub fn of_validated(name: &'static str, validate: fn(&T) -> bool) -> Result<Self> {
        let option = Self::of(name)?;
        VALIDATORS.entry(option.id).or_insert_with(|| {
            Box::new(move |value: &dyn Any| value.downcast_ref::<T>().is_some_and(validate))
        });
        Ok(option)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl<T> std::fmt::Debug for ChannelOption<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelOption({})", self.name)
    }
}

/// 框架识别的核心选项键。
pub mod options {
    use super::*;

    /// 读完成后是否自动请求下一批数据。
    pub static AUTO_READ: LazyLock<ChannelOption<bool>> =
        LazyLock::new(|| ChannelOption::of("channel.auto_read").expect("builtin option key"));
    /// 套接字接收缓冲（字节）；0 表示沿用内核默认。
    pub static RCVBUF_SIZE: LazyLock<ChannelOption<usize>> =
        LazyLock::new(|| ChannelOption::of("channel.rcvbuf_size").expect("builtin option key"));
    /// 套接字发送缓冲（字节）；0 表示沿用内核默认。
    pub static SNDBUF_SIZE: LazyLock<ChannelOption<usize>> =
        LazyLock::new(|| ChannelOption::of("channel.sndbuf_size").expect("builtin option key"));
    /// 建连超时。
    pub static CONNECT_TIMEOUT: LazyLock<ChannelOption<Duration>> =
        LazyLock::new(|| ChannelOption::of("channel.connect_timeout").expect("builtin option key"));
    /// 出站缓冲高水位：超过后通道进入不可写状态。
    pub static WRITE_HIGH_WATERMARK: LazyLock<ChannelOption<usize>> = LazyLock::new(|| {
        ChannelOption::of_validated("channel.write_high_watermark", |v| *v > 0)
            .expect("builtin option key")
    });
    /// 出站缓冲低水位：回落到该值以下后恢复可写。
    pub static WRITE_LOW_WATERMARK: LazyLock<ChannelOption<usize>> =
        LazyLock::new(|| ChannelOption::of("channel.write_low_watermark").expect("builtin option key"));
    /// 监听队列长度。
    pub static BACKLOG: LazyLock<ChannelOption<usize>> = LazyLock::new(|| {
        ChannelOption::of_validated("channel.backlog", |v| *v > 0).expect("builtin option key")
    });
}

/// 单个通道的配置视图。
///
/// # 契约说明（What）
/// - 读取全部无锁；写入按键原子生效；
/// - 未被识别的键进入侧表，由具体传输实现自行解释或忽略。
pub struct ChannelConfig {
    auto_read: AtomicBool,
    rcvbuf_size: AtomicUsize,
    sndbuf_size: AtomicUsize,
    connect_timeout_ms: AtomicU64,
    write_high_watermark: AtomicUsize,
    write_low_watermark: AtomicUsize,
    backlog: AtomicUsize,
    extra: DashMap<usize, Arc<dyn Any + Send + Sync>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_read: AtomicBool::new(true),
            rcvbuf_size: AtomicUsize::new(0),
            sndbuf_size: AtomicUsize::new(0),
            connect_timeout_ms: AtomicU64::new(30_000),
            write_high_watermark: AtomicUsize::new(64 * 1024),
            write_low_watermark: AtomicUsize::new(32 * 1024),
            backlog: AtomicUsize::new(128),
            extra: DashMap::new(),
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::SeqCst)
    }

    /// 切换 auto-read；接受端用它实施接受风暴背压。
    pub fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::SeqCst);
    }

    /// 套接字接收缓冲；0 表示未显式配置。
    pub fn rcvbuf_size(&self) -> usize {
        self.rcvbuf_size.load(Ordering::SeqCst)
    }

    pub fn sndbuf_size(&self) -> usize {
        self.sndbuf_size.load(Ordering::SeqCst)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn write_high_watermark(&self) -> usize {
        self.write_high_watermark.load(Ordering::SeqCst)
    }

    pub fn write_low_watermark(&self) -> usize {
        self.write_low_watermark.load(Ordering::SeqCst)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// 写入一个选项。
    ///
    /// # 契约说明（What）
    /// - 先执行键登记的校验谓词，失败返回
    ///   [`codes::OPTION_INVALID_VALUE`]；
    /// - 识别的核心键映射到专用字段并做交叉校验（低水位 ≤ 高水位）；
    /// - 其余键写入侧表供传输实现读取。
    pub fn set_option<T: Send + Sync + 'static>(
        &self,
        option: ChannelOption<T>,
        value: T,
    ) -> Result<()> {
        let rejected = VALIDATORS
            .get(&option.id())
            .is_some_and(|validate| !(validate.value())(&value as &dyn Any));
        if rejected {
            return Err(CoreError::new(
                codes::OPTION_INVALID_VALUE,
                format!("value rejected by validator of `{}`", option.name()),
            ));
        }
        let id = option.id();
        if id == options::AUTO_READ.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<bool>() {
                self.auto_read.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::RCVBUF_SIZE.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<usize>() {
                self.rcvbuf_size.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::SNDBUF_SIZE.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<usize>() {
                self.sndbuf_size.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::CONNECT_TIMEOUT.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<Duration>() {
                self.connect_timeout_ms
                    .store(v.as_millis().min(u128::from(u64::MAX)) as u64, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::WRITE_HIGH_WATERMARK.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<usize>() {
                if *v < self.write_low_watermark() {
                    return Err(CoreError::new(
                        codes::OPTION_INVALID_VALUE,
                        "write_high_watermark below write_low_watermark",
                    ));
                }
                self.write_high_watermark.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::WRITE_LOW_WATERMARK.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<usize>() {
                if *v > self.write_high_watermark() {
                    return Err(CoreError::new(
                        codes::OPTION_INVALID_VALUE,
                        "write_low_watermark above write_high_watermark",
                    ));
                }
                self.write_low_watermark.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else if id == options::BACKLOG.id() {
            if let Some(v) = (&value as &dyn Any).downcast_ref::<usize>() {
                self.backlog.store(*v, Ordering::SeqCst);
                return Ok(());
            }
        } else {
            self.extra.insert(id, Arc::new(value));
            return Ok(());
        }
        // 能走到这里说明键序号与类型对不上，按无效值处理。
        Err(CoreError::new(
            codes::OPTION_INVALID_VALUE,
            format!("type mismatch for option `{}`", option.name()),
        ))
    }

    /// 读取扩展键的取值。
    pub fn option<T: Send + Sync + 'static>(&self, option: ChannelOption<T>) -> Option<Arc<T>> {
        self.extra
            .get(&option.id())
            .and_then(|value| Arc::clone(value.value()).downcast::<T>().ok())
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("auto_read", &self.auto_read())
            .field("backlog", &self.backlog())
            .field("write_high_watermark", &self.write_high_watermark())
            .field("write_low_watermark", &self.write_low_watermark())
            .finish()
    }
}

type OptionApply = Box<dyn Fn(&ChannelConfig) -> Result<()> + Send + Sync>;

struct OptionEntry {
    name: &'static str,
    apply: OptionApply,
}

/// 引导器使用的选项集合：按声明顺序应用，`None` 值表示移除既有声明。
#[derive(Default)]
pub struct ChannelOptions {
    entries: Vec<OptionEntry>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明或撤销一个选项。
    ///
    /// 同名重声明就地替换并保留原有顺序位，维持"后声明可参照先声明"的
    /// 交叉校验语义。
    pub fn set<T: Clone + Send + Sync + 'static>(
        &mut self,
        option: ChannelOption<T>,
        value: Option<T>,
    ) {
        match value {
            None => self.entries.retain(|entry| entry.name != option.name()),
            Some(value) => {
                let apply: OptionApply =
                    Box::new(move |config| config.set_option(option, value.clone()));
                match self
                    .entries
                    .iter_mut()
                    .find(|entry| entry.name == option.name())
                {
                    Some(entry) => entry.apply = apply,
                    None => self.entries.push(OptionEntry {
                        name: option.name(),
                        apply,
                    }),
                }
            }
        }
    }

    /// 按声明顺序应用到目标配置；不受支持的选项告警后跳过。
    pub fn apply(&self, config: &ChannelConfig) {
        for entry in &self.entries {
            if let Err(err) = (entry.apply)(config) {
                warn!(
                    target: "keel_core::channel",
                    option = entry.name,
                    error = %err,
                    "channel option not supported; skipped"
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_options_route_to_fields() {
        let config = ChannelConfig::new();
        config
            .set_option(*options::AUTO_READ, false)
            .expect("auto_read");
        config
            .set_option(*options::BACKLOG, 256usize)
            .expect("backlog");
        assert!(!config.auto_read());
        assert_eq!(config.backlog(), 256);
    }

    #[test]
    fn watermarks_cross_validate() {
        let config = ChannelConfig::new();
        let err = config
            .set_option(*options::WRITE_LOW_WATERMARK, 1 << 20)
            .expect_err("low above high must fail");
        assert_eq!(err.code(), codes::OPTION_INVALID_VALUE);
    }

    #[test]
    fn validator_rejects_bad_values() {
        let config = ChannelConfig::new();
        let err = config
            .set_option(*options::BACKLOG, 0usize)
            .expect_err("zero backlog rejected");
        assert_eq!(err.code(), codes::OPTION_INVALID_VALUE);
    }

    #[test]
    fn unknown_options_land_in_side_table() {
        let marker = ChannelOption::<u32>::of("config.tests.marker").expect("key");
        let config = ChannelConfig::new();
        config.set_option(marker, 7).expect("set extension option");
        assert_eq!(config.option(marker).as_deref(), Some(&7));
    }

    #[test]
    fn option_set_applies_in_declaration_order() {
        let mut declared = ChannelOptions::new();
        declared.set(*options::WRITE_HIGH_WATERMARK, Some(128 * 1024));
        declared.set(*options::WRITE_LOW_WATERMARK, Some(96 * 1024));
        let config = ChannelConfig::new();
        declared.apply(&config);
        assert_eq!(config.write_high_watermark(), 128 * 1024);
        assert_eq!(config.write_low_watermark(), 96 * 1024);
    }

    #[test]
    fn none_value_removes_declaration() {
        let mut declared = ChannelOptions::new();
        declared.set(*options::BACKLOG, Some(512usize));
        declared.set(*options::BACKLOG, None);
        assert!(declared.is_empty());
    }
}
