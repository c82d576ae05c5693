//! 进程级错误钩子。
//!
//! ## 设计目标（Why）
//! - 协议违规发生时下游往往已经终止，按契约不得再向其投递任何信号；
//!   这类“无处投递”的错误需要一个稳定的全局出口，供运维与测试捕获。
//! - 钩子必须可替换：测试希望断言违规发生，宿主应用希望接入自己的上报链路。
//!
//! ## 契约说明（What）
//! - [`on_error`] 将错误交给当前注册的处理器；未注册时写入标准错误输出；
//! - [`set_error_handler`] 原子替换处理器，传入 `None` 恢复默认行为；
//! - 处理器自身不得 panic；钩子不会对错误做任何排序或去重。
//!
//! ## 风险提示（Trade-offs）
//! - 钩子是进程级单例，并行测试共享同一处理器；测试内替换处理器时应使用
//!   捕获型处理器并在断言后恢复默认值。

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use crate::error::RillError;

/// 错误处理器的包装体；`arc-swap` 需要定长类型，故对 trait 对象加一层盒装。
pub struct ErrorHandler(Box<dyn Fn(&RillError) + Send + Sync>);

impl ErrorHandler {
    /// 由闭包构造处理器。
    pub fn new(f: impl Fn(&RillError) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

static HANDLER: ArcSwapOption<ErrorHandler> = ArcSwapOption::const_empty();

/// 注册（或清除）全局错误处理器。
pub fn set_error_handler(handler: Option<ErrorHandler>) {
    HANDLER.store(handler.map(Arc::new));
}

/// 将无法投递给下游的错误交给全局钩子。
///
/// # 契约说明（What）
/// - **输入**：任何不再允许走 `on_error` 信号的错误（协议违规、次生终止信号）；
/// - **后置条件**：错误被当前处理器消费；默认处理器写入 stderr，不会 panic。
pub fn on_error(error: RillError) {
    if let Some(handler) = HANDLER.load_full() {
        (handler.0)(&error);
    } else {
        eprintln!("rill: undeliverable error: {error}");
    }
}
