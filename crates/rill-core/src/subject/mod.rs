//! 多播主体（Subject）家族：一对多的流枢纽。
//!
//! ## 契约说明（What）
//! - [`PublishSubject`]：只向在场订阅者转发实时值；终止信号对晚到订阅者重放；
//! - [`ReplaySubject`]：按无界 / 定量 / 定时策略缓存历史值，晚到订阅者
//!   先补课再跟播；
//! - [`AsyncSubject`]：只保留最后一个值，完成时一次性发射；
//! - [`UnicastSubject`]：恰好一个订阅者的缓冲主体，第二个订阅者收到
//!   `subject.already_subscribed`；`window`/`group_by` 以它为构件。
//!
//! ## 并发语义
//! - 信号端（`on_next`/`on_error`/`on_complete`）要求调用方串行投递，
//!   与协议对 Sink 的约束一致；订阅与取消可从任意线程并发发起；
//! - 订阅者登记表采用写侧加锁、读侧无锁的写时复制结构。

mod async_subject;
mod publish;
mod replay;
mod unicast;

pub use async_subject::AsyncSubject;
pub use publish::PublishSubject;
pub use replay::ReplaySubject;
pub use unicast::UnicastSubject;
