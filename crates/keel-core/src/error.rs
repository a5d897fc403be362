use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// `CoreError` 表示 `keel-core` 跨层共享的稳定错误域，是所有可观察错误的最终形态。
///
/// # 设计背景（Why）
/// - 反应器、管道与传输实现在不同层次产生的故障需要合流为统一的错误码，
///   以便日志与告警系统能够执行精确的自动化治理；
/// - 错误码 `code` 始终为 `'static` 字符串并遵循 `<域>.<语义>` 约定，
///   `message` 面向排障人员，`cause` 暴露底层根因链路。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块或遵循同一命名约定的自定义码值；
/// - **后置条件**：构造出的错误拥有独立所有权，可安全跨线程移动（`Send + Sync + 'static`）。
///
/// # 风险提示（Trade-offs）
/// - 采用 `Cow<'static, str>` 保存消息，在静态文案场景零分配，动态拼接时牺牲一次堆分配。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取面向排障人员的描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因（若有）。
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// 复制码值与消息；底层原因不可克隆，降格为文本并入消息。
    ///
    /// 监听器只能借用终态里的错误，跨 Promise 转发时用它制作拥有所有权
    /// 的副本。
    pub fn duplicate(&self) -> CoreError {
        let message = match &self.cause {
            Some(cause) => format!("{}: {cause}", self.message),
            None => self.message.clone().into_owned(),
        };
        CoreError::new(self.code, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// 统一的结果别名，约束错误通道只承载 [`CoreError`]。
pub type Result<T> = core::result::Result<T, CoreError>;

/// 稳定错误码注册表。
///
/// # 契约说明（What）
/// - 码值遵循 `<域>.<语义>` 命名：`reactor.*` 归事件循环，`channel.*` 归通道生命周期，
///   `pipeline.*` 归链路装配与分发，`bootstrap.*` 归引导配置，`promise.*` 归结果容器；
/// - 新增码值必须在此登记，禁止在调用点散落裸字符串。
pub mod codes {
    /// 事件循环已进入关闭流程，拒绝继续受理注册。
    pub const REACTOR_SHUTTING_DOWN: &str = "reactor.shutting_down";
    /// 事件循环因选择器持续故障而终止。
    pub const REACTOR_SELECTOR_FAILED: &str = "reactor.selector_failed";
    /// 通道已绑定到某个事件循环，重复注册被拒绝。
    pub const REACTOR_ALREADY_BOUND: &str = "reactor.already_bound";
    /// 选择器注册/轮询失败。
    pub const SELECTOR_IO: &str = "selector.io";
    /// 向选择器传入了其不认识的 IO 源类型。
    pub const SELECTOR_SOURCE_MISMATCH: &str = "selector.source_mismatch";

    /// 操作要求通道先完成注册。
    pub const CHANNEL_NOT_REGISTERED: &str = "channel.not_registered";
    /// 通道已关闭，后续操作一律失败。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 通道状态机拒绝了逆向迁移。
    pub const CHANNEL_INVALID_STATE: &str = "channel.invalid_state";
    /// 传输层 IO 失败。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 该通道不支持请求的传输操作（如对已接受连接执行 bind）。
    pub const TRANSPORT_UNSUPPORTED: &str = "transport.unsupported";

    /// 管道内 Handler 名称冲突。
    pub const PIPELINE_DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    /// 非共享 Handler 被重复加入。
    pub const PIPELINE_DUPLICATE_HANDLER: &str = "pipeline.duplicate_handler";
    /// 指定锚点不存在于链路中。
    pub const PIPELINE_UNKNOWN_ANCHOR: &str = "pipeline.unknown_anchor";
    /// 试图移除头/尾哨兵。
    pub const PIPELINE_SENTINEL: &str = "pipeline.sentinel";
    /// Handler 声明的事件掩码为空，无法参与分发。
    pub const PIPELINE_EMPTY_MASK: &str = "pipeline.empty_mask";
    /// Handler 回调主动上报的失败。
    pub const PIPELINE_HANDLER_FAILED: &str = "pipeline.handler_failed";
    /// 初始化器执行用户装配逻辑失败。
    pub const PIPELINE_INIT_FAILED: &str = "pipeline.init_failed";

    /// 引导器缺少必填配置。
    pub const BOOTSTRAP_INCOMPLETE: &str = "bootstrap.incomplete";
    /// 子通道注册失败，已强制关闭。
    pub const BOOTSTRAP_CHILD_REGISTER: &str = "bootstrap.child_register_failed";

    /// Promise 已完成，严格模式下的重复完成被拒绝。
    pub const PROMISE_ALREADY_COMPLETE: &str = "promise.already_complete";
    /// 在事件循环线程上发起阻塞等待。
    pub const PROMISE_BLOCKING_IN_LOOP: &str = "promise.blocking_in_event_loop";
    /// 等待超时。
    pub const PROMISE_TIMEOUT: &str = "promise.timeout";

    /// 键注册表检测到重名键。
    pub const KEY_DUPLICATE: &str = "key.duplicate";
    /// 选项值未通过校验谓词。
    pub const OPTION_INVALID_VALUE: &str = "option.invalid_value";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_cause() {
        let io = std::io::Error::other("boom");
        let err = CoreError::new(codes::TRANSPORT_IO, "write failed").with_cause(io);
        let rendered = err.to_string();
        assert!(rendered.contains("transport.io"));
        assert!(rendered.contains("write failed"));
        assert!(rendered.contains("boom"));
        assert!(err.cause().is_some());
    }
}
