//! 资源释放句柄的组合容器。
//!
//! ## 契约说明（What）
//! - [`CompositeDisposable`]：集合语义；自身释放时保证释放全部成员，
//!   释放之后的 `add` 会立即释放新成员并返回 `false`；
//! - [`SerialDisposable`]：单槽位；替换时释放旧成员；
//! - [`ArrayCompositeDisposable`]：固定 N 槽位，整体释放；
//! - [`MultipleAssignmentDisposable`]：替换时不释放旧成员，责任归操作符。
//!
//! ## 并发语义
//! - 所有容器的释放均幂等，可与 `add`/`set` 并发；临界区只做指针交换，
//!   真正的 `dispose` 调用在锁外执行，避免用户回调持锁。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::protocol::{Disposable, DisposableRef};

/// 由闭包构成的一次性释放句柄。
pub struct FnDisposable {
    disposed: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FnDisposable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn shared(action: impl FnOnce() + Send + 'static) -> DisposableRef {
        Arc::new(Self::new(action))
    }
}

impl Disposable for FnDisposable {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            if let Some(action) = self.action.lock().take() {
                action();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// 纯标志位释放句柄；无资源可释放，仅记录状态。
#[derive(Debug, Default)]
pub struct BooleanDisposable {
    disposed: AtomicBool,
}

impl BooleanDisposable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Disposable for BooleanDisposable {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct CompositeState {
    disposed: bool,
    members: Vec<DisposableRef>,
}

/// 集合语义的组合释放容器。
pub struct CompositeDisposable {
    state: Mutex<CompositeState>,
}

impl Default for CompositeDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeDisposable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompositeState {
                disposed: false,
                members: Vec::new(),
            }),
        }
    }

    /// 加入成员；容器已释放时立即释放新成员并返回 `false`。
    pub fn add(&self, member: DisposableRef) -> bool {
        {
            let mut state = self.state.lock();
            if !state.disposed {
                state.members.push(member);
                return true;
            }
        }
        member.dispose();
        false
    }

    /// 移除并释放指定成员（按指针同一性匹配）。
    pub fn remove(&self, member: &DisposableRef) -> bool {
        let found = {
            let mut state = self.state.lock();
            match state
                .members
                .iter()
                .position(|m| Arc::ptr_eq(m, member))
            {
                Some(index) => Some(state.members.swap_remove(index)),
                None => None,
            }
        };
        match found {
            Some(removed) => {
                removed.dispose();
                true
            }
            None => false,
        }
    }

    /// 当前成员数量；仅用于诊断与测试。
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Disposable for CompositeDisposable {
    fn dispose(&self) {
        let members = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.members)
        };
        for member in members {
            member.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

struct SlotState {
    disposed: bool,
    current: Option<DisposableRef>,
}

/// 单槽位容器；替换即释放旧成员。
pub struct SerialDisposable {
    state: Mutex<SlotState>,
}

impl Default for SerialDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialDisposable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                disposed: false,
                current: None,
            }),
        }
    }

    /// 放入新成员并释放旧成员；容器已释放时立即释放新成员并返回 `false`。
    pub fn set(&self, member: DisposableRef) -> bool {
        let (accepted, evicted) = {
            let mut state = self.state.lock();
            if state.disposed {
                (false, None)
            } else {
                (true, state.current.replace(member.clone()))
            }
        };
        if !accepted {
            member.dispose();
            return false;
        }
        if let Some(old) = evicted {
            old.dispose();
        }
        true
    }

    /// 读取当前成员。
    pub fn get(&self) -> Option<DisposableRef> {
        self.state.lock().current.clone()
    }
}

impl Disposable for SerialDisposable {
    fn dispose(&self) {
        let evicted = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.current.take()
        };
        if let Some(member) = evicted {
            member.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// 固定槽位数的组合容器；`skip_until`、超时组合等双订阅场景使用。
pub struct ArrayCompositeDisposable {
    state: Mutex<ArrayState>,
}

struct ArrayState {
    disposed: bool,
    slots: Vec<Option<DisposableRef>>,
}

impl ArrayCompositeDisposable {
    pub fn new(slots: usize) -> Self {
        Self {
            state: Mutex::new(ArrayState {
                disposed: false,
                slots: (0..slots).map(|_| None).collect(),
            }),
        }
    }

    /// 写入指定槽位，释放旧值；容器已释放时立即释放新值并返回 `false`。
    pub fn set(&self, index: usize, member: DisposableRef) -> bool {
        let (accepted, evicted) = {
            let mut state = self.state.lock();
            if state.disposed {
                (false, None)
            } else {
                (true, state.slots[index].replace(member.clone()))
            }
        };
        if !accepted {
            member.dispose();
            return false;
        }
        if let Some(old) = evicted {
            old.dispose();
        }
        true
    }
}

impl Disposable for ArrayCompositeDisposable {
    fn dispose(&self) {
        let slots = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.slots)
        };
        for member in slots.into_iter().flatten() {
            member.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// 可反复赋值的单槽位容器；替换时不释放旧成员。
pub struct MultipleAssignmentDisposable {
    state: Mutex<SlotState>,
}

impl Default for MultipleAssignmentDisposable {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipleAssignmentDisposable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                disposed: false,
                current: None,
            }),
        }
    }

    /// 替换当前成员；旧成员的释放责任归调用方。
    pub fn set(&self, member: DisposableRef) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            member.dispose();
            return false;
        }
        state.current = Some(member);
        true
    }

    pub fn get(&self) -> Option<DisposableRef> {
        self.state.lock().current.clone()
    }
}

impl Disposable for MultipleAssignmentDisposable {
    fn dispose(&self) {
        let evicted = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.current.take()
        };
        if let Some(member) = evicted {
            member.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}
