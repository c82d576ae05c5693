//! 流协议原语：两种风味的信号契约与校验辅助。
//!
//! ## 设计目标（Why）
//! - 每个流水线阶段都必须遵守同一份信号语法
//!   `on_subscribe (on_next)* (on_error | on_complete)?`；把契约集中在此，
//!   操作符与 Subject 只需组合这些原语即可继承正确性。
//! - 背压风味（F）与非背压风味（N）共享终止语义，但控制句柄不同：
//!   前者暴露 `request/cancel`，后者仅暴露 `dispose`。
//!
//! ## 契约说明（What）
//! - 订阅方（[`Sink`]/[`SinkN`]）以 `Arc` 共享、方法取 `&self`；
//!   串行投递是协议保证而非借用保证，实现内部以原子状态维持一致性。
//! - [`Handle::request`] 的参数为 `u64`，`0` 属协议违规：经 [`validate_request`]
//!   上报全局钩子且不得改变需求计数；负数在类型层面不可表达。
//! - [`Handle::cancel`] 与 [`Disposable::dispose`] 均幂等，可在任意线程并发调用。
//!
//! ## 风险提示（Trade-offs）
//! - 信号方法不返回 `Result`：终止只能经由 `on_error`，这是协议的刻意选择，
//!   任何实现不得以 panic 替代错误信号。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RillError, codes};
use crate::hook;

/// 无界需求哨兵；一旦请求达到该值，源可以停止计数。
pub const UNBOUNDED: u64 = u64::MAX;

/// 背压风味的上游控制句柄。
pub trait Handle: Send + Sync {
    /// 追加 `n` 个需求；`n == 0` 属协议违规，实现必须调用 [`validate_request`] 过滤。
    fn request(&self, n: u64);

    /// 幂等取消；尽力释放上游资源，取消后不得再开始新的投递。
    fn cancel(&self);
}

/// 共享句柄引用。
pub type HandleRef = Arc<dyn Handle>;

/// 背压风味的下游信号接收端。
///
/// # 契约说明（What）
/// - 每个实例最多收到一次 `on_subscribe`，之后才允许任何其他信号；
/// - `on_next` 的次数不得超过句柄上累计请求的需求量（请求过 [`UNBOUNDED`] 除外）；
/// - `on_error` 与 `on_complete` 互斥且最多一次，此后实例永久关闭。
pub trait Sink<T>: Send + Sync {
    fn on_subscribe(&self, handle: HandleRef);
    fn on_next(&self, value: T);
    fn on_error(&self, error: RillError);
    fn on_complete(&self);
}

/// 共享 Sink 引用。
pub type SinkRef<T> = Arc<dyn Sink<T>>;

/// 非背压风味与调度资源共用的释放句柄。
pub trait Disposable: Send + Sync {
    /// 幂等释放。
    fn dispose(&self);

    /// 查询是否已释放。
    fn is_disposed(&self) -> bool;
}

/// 共享释放句柄引用。
pub type DisposableRef = Arc<dyn Disposable>;

/// 非背压风味的下游信号接收端；源按自身节奏发射，下游自行吸收或丢弃。
pub trait SinkN<T>: Send + Sync {
    fn on_subscribe(&self, handle: DisposableRef);
    fn on_next(&self, value: T);
    fn on_error(&self, error: RillError);
    fn on_complete(&self);
}

/// 共享 SinkN 引用。
pub type SinkNRef<T> = Arc<dyn SinkN<T>>;

/// 信号的具象化表示，供 `materialize`/`dematerialize` 与内部队列哨兵使用。
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<T> {
    Next(T),
    Error(RillError),
    Complete,
}

impl<T> Notification<T> {
    /// 是否为终止通知。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next(_))
    }
}

/// 校验请求量；`0` 上报协议违规并返回 `false`，调用方此时不得改动需求计数。
pub fn validate_request(n: u64) -> bool {
    if n == 0 {
        hook::on_error(RillError::protocol(
            codes::PROTOCOL_REQUEST_ZERO,
            "request amount must be positive",
        ));
        return false;
    }
    true
}

/// 上报“句柄已设置”协议违规，并取消晚到的句柄。
pub fn report_handle_already_set(late: &dyn Handle) {
    late.cancel();
    hook::on_error(RillError::protocol(
        codes::PROTOCOL_HANDLE_ALREADY_SET,
        "on_subscribe delivered twice to the same stage",
    ));
}

/// 永不产生需求转发的占位句柄；用于“订阅即终止”的路径（empty/error/晚到订阅者）。
#[derive(Debug, Default)]
pub struct NoopHandle {
    cancelled: AtomicBool,
}

impl NoopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以共享引用形式构造，便于直接传给 `on_subscribe`。
    pub fn shared() -> HandleRef {
        Arc::new(Self::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Handle for NoopHandle {
    fn request(&self, n: u64) {
        let _ = validate_request(n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// 已释放状态的占位 Disposable，供 N 风味的空源与错误源使用。
#[derive(Debug, Default)]
pub struct NoopDisposable {
    disposed: AtomicBool,
}

impl NoopDisposable {
    pub fn shared() -> DisposableRef {
        Arc::new(Self::default())
    }
}

impl Disposable for NoopDisposable {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{ErrorHandler, set_error_handler};
    use parking_lot::Mutex;

    /// `request(0)` 必须上报协议违规且不得视为合法请求。
    #[test]
    fn zero_request_reports_protocol_violation() {
        let _guard = crate::testkit::exclusive_hook_access();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_error_handler(Some(ErrorHandler::new(move |err| {
            sink.lock().push(err.code());
        })));

        assert!(!validate_request(0), "零需求必须被拒绝");
        assert!(validate_request(1), "正数需求必须放行");
        let violations = seen
            .lock()
            .iter()
            .filter(|code| **code == codes::PROTOCOL_REQUEST_ZERO)
            .count();
        assert_eq!(violations, 1, "零需求恰好上报一次");
        set_error_handler(None);
    }

    /// 晚到句柄必须被取消，违规进入钩子而非下游。
    #[test]
    fn duplicate_handle_is_cancelled() {
        let _guard = crate::testkit::exclusive_hook_access();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_error_handler(Some(ErrorHandler::new(move |err| {
            sink.lock().push(err.code());
        })));

        let late = NoopHandle::new();
        report_handle_already_set(&late);
        assert!(late.is_cancelled(), "晚到句柄必须立即取消");
        assert!(
            seen.lock().contains(&codes::PROTOCOL_HANDLE_ALREADY_SET),
            "违规必须进入钩子"
        );
        set_error_handler(None);
    }

    /// 终止通知判定覆盖三种形态。
    #[test]
    fn notification_terminal_classification() {
        assert!(!Notification::Next(1).is_terminal());
        assert!(Notification::<i32>::Complete.is_terminal());
        assert!(Notification::<i32>::Error(RillError::new("upstream.failure", "x")).is_terminal());
    }
}
