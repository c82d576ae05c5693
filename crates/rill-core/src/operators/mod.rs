//! 操作符状态机集合。
//!
//! ## 组织方式（How）
//! - 每个文件一个操作符家族：源结构（持有上游与参数）加订阅者状态机；
//! - [`Stream`](crate::stream::Stream) 的组合方法只负责封参并委托到这里的
//!   构造函数；
//! - 所有带内部缓冲的状态机复用 `drain`/`queue`/`demand` 三件套，
//!   订阅切换复用 `arbiter`，资源成对释放复用 `disposable`。

pub(crate) mod aggregate;
pub(crate) mod basic;
pub(crate) mod combine_latest;
pub(crate) mod concat;
pub(crate) mod connectable;
pub(crate) mod debounce;
pub(crate) mod group_by;
pub(crate) mod materialize;
pub(crate) mod merge;
pub(crate) mod observe_on;
pub(crate) mod resume;
pub(crate) mod take_until;
pub(crate) mod using;
pub(crate) mod window_boundary;
pub(crate) mod window_timed;
pub(crate) mod with_latest_from;
