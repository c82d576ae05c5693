//! 测试桩集合：记录型 Sink 与断言辅助。
//!
//! ## 设计定位（Why）
//! - 协议断言（信号语法、需求记账、终止唯一性）在各测试文件间高度重复，
//!   统一出口可避免各处手写记录逻辑并在接口调整时获得集中编译错误。
//!
//! ## 使用方式（How）
//! - [`TestSink::unbounded`] 订阅即请求无界需求；[`TestSink::with_request`]
//!   限定初始需求，之后用 [`TestSink::request`] 手动补充；
//! - 异步场景以 [`TestSink::await_terminal`] / [`TestSink::await_count`]
//!   阻塞等待，超时返回 `false` 而非 panic，由调用方断言。
//!
//! ## 契约说明（What）
//! - 记录器自身线程安全；断言方法只读不清空，可多次调用；
//! - [`TestSink::assert_protocol_clean`] 校验恰好一次 `on_subscribe`、
//!   至多一个终止信号、终止后再无任何信号。

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::arbiter::SingleAssignmentArbiter;
use crate::error::RillError;
use crate::protocol::{DisposableRef, Handle, HandleRef, Sink, SinkN};

/// 串行化对全局错误钩子的独占访问。
///
/// # 契约说明（What）
/// - 替换全局错误处理器的测试必须先持有该守卫，避免并行测试互相覆盖；
/// - 钩子是进程级单例，未持守卫的测试仍可能向处理器投递自己的错误，
///   断言时应按错误码过滤而非比较全量。
pub fn exclusive_hook_access() -> parking_lot::MutexGuard<'static, ()> {
    static HOOK_GUARD: Mutex<()> = Mutex::new(());
    HOOK_GUARD.lock()
}

/// 记录型背压 Sink。
pub struct TestSink<T> {
    values: Mutex<Vec<T>>,
    error: Mutex<Option<RillError>>,
    completed: AtomicBool,
    terminal_count: AtomicUsize,
    signals_after_terminal: AtomicUsize,
    subscribe_count: AtomicUsize,
    upstream: SingleAssignmentArbiter,
    initial_request: u64,
    progress: Mutex<u64>,
    wakeup: Condvar,
}

impl<T: Send + 'static> TestSink<T> {
    /// 订阅即请求无界需求。
    pub fn unbounded() -> Arc<Self> {
        Self::with_request(crate::demand::UNBOUNDED)
    }

    /// 限定初始需求；`0` 表示订阅后不自动请求。
    pub fn with_request(initial: u64) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            completed: AtomicBool::new(false),
            terminal_count: AtomicUsize::new(0),
            signals_after_terminal: AtomicUsize::new(0),
            subscribe_count: AtomicUsize::new(0),
            upstream: SingleAssignmentArbiter::new(),
            initial_request: initial,
            progress: Mutex::new(0),
            wakeup: Condvar::new(),
        })
    }

    /// 向上游追加需求。
    pub fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    /// 取消上游订阅。
    pub fn cancel(&self) {
        self.upstream.cancel();
    }

    /// 当前已收到的值快照。
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.values.lock().clone()
    }

    /// 已收到的值数量。
    pub fn value_count(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.lock().as_ref().map(RillError::code)
    }

    /// 等待终止信号；超时返回 `false`。
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        let mut guard = self.progress.lock();
        let deadline = std::time::Instant::now() + timeout;
        while self.terminal_count.load(Ordering::Acquire) == 0 {
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };
            if self.wakeup.wait_for(&mut guard, remaining).timed_out() {
                return self.terminal_count.load(Ordering::Acquire) > 0;
            }
        }
        true
    }

    /// 等待累计收到 `n` 个值；超时返回 `false`。
    pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
        let mut guard = self.progress.lock();
        let deadline = std::time::Instant::now() + timeout;
        while self.values.lock().len() < n {
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };
            if self.wakeup.wait_for(&mut guard, remaining).timed_out() {
                return self.values.lock().len() >= n;
            }
        }
        true
    }

    fn notify(&self) {
        let mut guard = self.progress.lock();
        *guard += 1;
        self.wakeup.notify_all();
    }

    fn record_terminal(&self) -> bool {
        self.terminal_count.fetch_add(1, Ordering::AcqRel) == 0
    }

    // ---- 断言 ----

    pub fn assert_values(&self, expected: &[T])
    where
        T: Clone + PartialEq + std::fmt::Debug,
    {
        assert_eq!(self.values.lock().as_slice(), expected, "值序列与期望不符");
    }

    pub fn assert_no_values(&self) {
        assert!(self.values.lock().is_empty(), "不应收到任何值");
    }

    pub fn assert_completed(&self) {
        assert!(self.completed.load(Ordering::Acquire), "应收到完成信号");
        self.assert_no_errors();
    }

    pub fn assert_not_terminated(&self) {
        assert_eq!(
            self.terminal_count.load(Ordering::Acquire),
            0,
            "不应收到终止信号"
        );
    }

    pub fn assert_no_errors(&self) {
        let error = self.error.lock();
        assert!(error.is_none(), "不应收到错误，实际 {:?}", *error);
    }

    pub fn assert_error_code(&self, code: &str) {
        match self.error.lock().as_ref() {
            Some(error) => assert_eq!(error.code(), code, "错误码与期望不符"),
            None => panic!("应收到错误码 {code}，实际无错误"),
        }
    }

    /// 校验信号语法 `on_subscribe (on_next)* (on_error | on_complete)?`。
    pub fn assert_protocol_clean(&self) {
        assert_eq!(
            self.subscribe_count.load(Ordering::Acquire),
            1,
            "on_subscribe 必须恰好一次"
        );
        assert!(
            self.terminal_count.load(Ordering::Acquire) <= 1,
            "终止信号至多一次"
        );
        assert_eq!(
            self.signals_after_terminal.load(Ordering::Acquire),
            0,
            "终止后不得再有任何信号"
        );
    }
}

impl<T: Send + 'static> Sink<T> for TestSink<T> {
    fn on_subscribe(&self, handle: HandleRef) {
        self.subscribe_count.fetch_add(1, Ordering::AcqRel);
        if self.upstream.set(handle) && self.initial_request > 0 {
            self.upstream.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        if self.terminal_count.load(Ordering::Acquire) > 0 {
            self.signals_after_terminal.fetch_add(1, Ordering::AcqRel);
        }
        self.values.lock().push(value);
        self.notify();
    }

    fn on_error(&self, error: RillError) {
        if self.record_terminal() {
            *self.error.lock() = Some(error);
        } else {
            self.signals_after_terminal.fetch_add(1, Ordering::AcqRel);
        }
        self.notify();
    }

    fn on_complete(&self) {
        if self.record_terminal() {
            self.completed.store(true, Ordering::Release);
        } else {
            self.signals_after_terminal.fetch_add(1, Ordering::AcqRel);
        }
        self.notify();
    }
}

/// 记录型非背压 Sink。
pub struct TestSinkN<T> {
    values: Mutex<Vec<T>>,
    error: Mutex<Option<RillError>>,
    completed: AtomicBool,
    handle: Mutex<Option<DisposableRef>>,
}

impl<T: Send + 'static> TestSinkN<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            completed: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn dispose(&self) {
        if let Some(handle) = self.handle.lock().clone() {
            handle.dispose();
        }
    }

    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.values.lock().clone()
    }

    pub fn assert_values(&self, expected: &[T])
    where
        T: Clone + PartialEq + std::fmt::Debug,
    {
        assert_eq!(self.values.lock().as_slice(), expected, "值序列与期望不符");
    }

    pub fn assert_completed(&self) {
        assert!(self.completed.load(Ordering::Acquire), "应收到完成信号");
        assert!(self.error.lock().is_none(), "不应收到错误");
    }

    pub fn assert_error_code(&self, code: &str) {
        match self.error.lock().as_ref() {
            Some(error) => assert_eq!(error.code(), code, "错误码与期望不符"),
            None => panic!("应收到错误码 {code}，实际无错误"),
        }
    }
}

impl<T: Send + 'static> SinkN<T> for TestSinkN<T> {
    fn on_subscribe(&self, handle: DisposableRef) {
        *self.handle.lock() = Some(handle);
    }

    fn on_next(&self, value: T) {
        self.values.lock().push(value);
    }

    fn on_error(&self, error: RillError) {
        *self.error.lock() = Some(error);
    }

    fn on_complete(&self) {
        self.completed.store(true, Ordering::Release);
    }
}
