//! 运行时统一错误域。
//!
//! ## 设计目标（Why）
//! - 协议违规、上游故障、操作符计算失败与背压溢出需要合流为统一的错误形态，
//!   下游、全局错误钩子与测试断言才能按稳定错误码进行精确分类。
//! - 终止信号会被多播给任意数量的订阅者（Subject、publish 枢纽、分组流），
//!   因此错误对象必须可以廉价克隆并跨线程传递。
//!
//! ## 契约说明（What）
//! - [`RillError`] 以 `Arc` 共享内部状态，`Clone` 为 O(1)；
//! - 错误码为 `'static` 字符串，集中登记在 [`codes`] 模块，遵循 `<域>.<语义>` 约定；
//! - [`ErrorKind`] 决定传播面：`Protocol` 只进全局钩子，其余分支走下游终止信号。
//!
//! ## 风险提示（Trade-offs）
//! - 被抑制原因列表在构造时固定，运行期不可追加；合并错误需通过
//!   [`RillError::composite`] 或 [`RillError::with_suppressed`] 重建实例。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// 稳定错误码登记处。
///
/// # 契约说明（What）
/// - 命名遵循 `<域>.<语义>`，一经发布不可变更含义；
/// - 新增错误码时必须同步补充对应的构造函数或调用点注释，避免裸字符串散落。
pub mod codes {
    /// `request(0)`：背压协议禁止非正数需求。
    pub const PROTOCOL_REQUEST_ZERO: &str = "protocol.request_non_positive";
    /// 同一阶段收到第二个 `on_subscribe`。
    pub const PROTOCOL_HANDLE_ALREADY_SET: &str = "protocol.handle_already_set";
    /// `produced` 扣减超过累计请求量。
    pub const PROTOCOL_PRODUCED_OVERFLOW: &str = "protocol.produced_overflow";
    /// 时间或容量型操作符无法入队，下游需求不足。
    pub const BACKPRESSURE_MISSING: &str = "backpressure.missing";
    /// 单播主体（unicast）收到第二个订阅者。
    pub const SUBJECT_ALREADY_SUBSCRIBED: &str = "subject.already_subscribed";
    /// 序列为空却被要求产出唯一元素。
    pub const SEQUENCE_NO_ELEMENT: &str = "sequence.no_element";
    /// 序列包含多个元素，违反 `single` 契约。
    pub const SEQUENCE_TOO_MANY: &str = "sequence.too_many";
    /// `dematerialize` 在终止通知之后又收到信号。
    pub const SEQUENCE_MALFORMED: &str = "sequence.malformed_notifications";
    /// 多个错误合并后的复合错误。
    pub const COMPOSITE: &str = "error.composite";
    /// 已释放的调度器 Worker 拒绝新任务。
    pub const SCHEDULER_WORKER_DISPOSED: &str = "scheduler.worker_disposed";
    /// 上游故障的缺省错误码（调用方未提供更精确的码值时使用）。
    pub const UPSTREAM_FAILURE: &str = "upstream.failure";
}

/// 错误分类，决定传播面与合并策略。
///
/// # 契约说明（What）
/// - `Protocol`：协议违规，只允许进入全局错误钩子（下游可能已终止）；
/// - `Upstream`：上游 `on_error` 携带的业务故障，经排空策略后送往下游；
/// - `Operator`：操作符自身计算失败（如 `single` 遇到第二个元素）；
/// - `Backpressure`：下游需求不足导致无法入队；
/// - `Composite`：多个错误按发生顺序合并；
/// - `Fatal`：不可恢复错误，必须立即透传、不得包装。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Protocol,
    Upstream,
    Operator,
    Backpressure,
    Composite,
    Fatal,
}

#[derive(Debug)]
struct ErrorInner {
    code: &'static str,
    message: Cow<'static, str>,
    kind: ErrorKind,
    cause: Option<Box<dyn StdError + Send + Sync>>,
    suppressed: Vec<RillError>,
}

/// 运行时共享的错误值。
///
/// # 设计背景（Why）
/// - 终止信号在 Subject 与多播操作符中被重放给晚到订阅者，错误必须可克隆；
/// - `no-throw` 的 Rust 世界里，错误只经由 `on_error` 信号传播，故以携带稳定
///   错误码的数据对象表达，而非枚举每一种可能的故障形态。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 必须来自 [`codes`] 或遵循同一命名约定；
/// - **后置条件**：实例满足 `Send + Sync + 'static`，可在任意线程克隆与传递；
/// - 被抑制原因（suppressed）按插入顺序保存，复合错误经 [`RillError::composite`] 构造。
#[derive(Clone, Debug)]
pub struct RillError {
    inner: Arc<ErrorInner>,
}

impl RillError {
    /// 构造携带稳定错误码的上游故障错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(code, message, ErrorKind::Upstream)
    }

    /// 构造指定分类的错误。
    pub fn with_kind(
        code: &'static str,
        message: impl Into<Cow<'static, str>>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            inner: Arc::new(ErrorInner {
                code,
                message: message.into(),
                kind,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    /// 构造协议违规错误；该类错误只应送往全局钩子。
    pub fn protocol(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(code, message, ErrorKind::Protocol)
    }

    /// 构造操作符计算失败错误。
    pub fn operator(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(code, message, ErrorKind::Operator)
    }

    /// 构造背压缺失错误，语义对应传统实现中的 `MissingBackpressureException`。
    pub fn missing_backpressure(context: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind(codes::BACKPRESSURE_MISSING, context.into(), ErrorKind::Backpressure)
    }

    /// 构造不可恢复错误；传播路径上不得对其包装或合并。
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::with_kind("fatal.unrecoverable", message, ErrorKind::Fatal)
    }

    /// 按插入顺序合并多个错误。
    ///
    /// # 契约说明（What）
    /// - **输入**：至少一个错误；单元素时原样返回，不产生复合层；
    /// - **后置条件**：首个错误充当主错误，其余进入被抑制列表；
    /// - 空列表属调用方缺陷，返回一个标记 `error.composite` 的占位错误。
    pub fn composite(mut errors: Vec<RillError>) -> Self {
        match errors.len() {
            0 => Self::with_kind(codes::COMPOSITE, "composite of zero errors", ErrorKind::Composite),
            1 => errors.pop().expect("len checked"),
            _ => {
                let rest = errors.split_off(1);
                let first = errors.pop().expect("len checked");
                Self {
                    inner: Arc::new(ErrorInner {
                        code: codes::COMPOSITE,
                        message: Cow::Borrowed("multiple errors occurred"),
                        kind: ErrorKind::Composite,
                        cause: Some(Box::new(first.clone())),
                        suppressed: {
                            let mut all = Vec::with_capacity(rest.len() + 1);
                            all.push(first);
                            all.extend(rest);
                            all
                        },
                    }),
                }
            }
        }
    }

    /// 在现有错误上追加一个被抑制原因，返回新实例。
    pub fn with_suppressed(&self, suppressed: RillError) -> Self {
        let mut list = self.inner.suppressed.clone();
        list.push(suppressed);
        Self {
            inner: Arc::new(ErrorInner {
                code: self.inner.code,
                message: self.inner.message.clone(),
                kind: self.inner.kind,
                cause: None,
                suppressed: list,
            }),
        }
    }

    /// 附带底层原因并返回新实例。
    pub fn with_cause(self, cause: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ErrorInner {
                code: self.inner.code,
                message: self.inner.message.clone(),
                kind: self.inner.kind,
                cause: Some(Box::new(cause)),
                suppressed: self.inner.suppressed.clone(),
            }),
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.inner.code
    }

    /// 获取描述文本。
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// 获取错误分类。
    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// 是否为不可恢复错误。
    pub fn is_fatal(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Fatal)
    }

    /// 按插入顺序返回被抑制原因。
    pub fn suppressed(&self) -> &[RillError] {
        &self.inner.suppressed
    }
}

// 错误携带动态原因链，语义相等按稳定错误码比较即可满足通知对比与测试需求。
impl PartialEq for RillError {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl fmt::Display for RillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.inner.code, self.inner.message)?;
        if !self.inner.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.inner.suppressed.len())?;
        }
        Ok(())
    }
}

impl StdError for RillError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 复合错误必须保持插入顺序，且主错误同时出现在抑制列表首位。
    #[test]
    fn composite_keeps_insertion_order() {
        let a = RillError::new("upstream.failure", "a");
        let b = RillError::operator(codes::SEQUENCE_TOO_MANY, "b");
        let c = RillError::missing_backpressure("c");
        let merged = RillError::composite(vec![a.clone(), b.clone(), c.clone()]);

        assert_eq!(merged.code(), codes::COMPOSITE);
        assert_eq!(merged.kind(), ErrorKind::Composite);
        let codes: Vec<&str> = merged.suppressed().iter().map(RillError::code).collect();
        assert_eq!(
            codes,
            vec![a.code(), b.code(), c.code()],
            "被抑制原因必须按发生顺序排列"
        );
    }

    /// 单元素合并不得引入复合层。
    #[test]
    fn composite_of_one_is_identity() {
        let only = RillError::new("upstream.failure", "solo");
        let merged = RillError::composite(vec![only.clone()]);
        assert_eq!(merged.code(), only.code());
        assert!(merged.suppressed().is_empty());
    }

    /// 克隆共享同一内部状态，错误码与抑制列表保持一致。
    #[test]
    fn clone_is_cheap_and_consistent() {
        let err = RillError::protocol(codes::PROTOCOL_REQUEST_ZERO, "n == 0")
            .with_suppressed(RillError::new("upstream.failure", "later"));
        let cloned = err.clone();
        assert_eq!(cloned.code(), err.code());
        assert_eq!(cloned.suppressed().len(), 1);
        assert!(cloned.kind() == ErrorKind::Protocol, "克隆不得改变分类");
    }

    /// 致命错误必须可被调用方识别，以便跳过包装路径。
    #[test]
    fn fatal_flag_is_visible() {
        assert!(RillError::fatal("vm level").is_fatal());
        assert!(!RillError::new("upstream.failure", "plain").is_fatal());
    }

    /// 底层原因经 `source()` 链路完整暴露。
    #[test]
    fn cause_chain_is_reachable() {
        #[derive(Debug, thiserror::Error)]
        #[error("socket closed by peer")]
        struct TransportBroken;

        let err = RillError::new(codes::UPSTREAM_FAILURE, "read failed")
            .with_cause(TransportBroken);
        let source = StdError::source(&err).expect("必须暴露底层原因");
        assert_eq!(source.to_string(), "socket closed by peer");
    }
}
