//! 生产者/消费者边界上的无锁队列族。
//!
//! ## 设计目标（Why）
//! - 每个带内部缓冲的操作符都要跨越一次生产者/消费者边界；
//!   队列与 WIP 排空循环共同构成排空惯用法的底座。
//!
//! ## 契约说明（What）
//! - [`spsc::SpscLinkedArrayQueue`]：分块链接、块容量为二的幂、无界；
//! - [`spsc::SpscArrayQueue`]：有界环形队列，基于槽位序号戳，`offer` 满时返回 `false`；
//! - [`mpsc::MpscLinkedQueue`]：Vyukov 侵入式链表，任意生产者、单一消费者。
//!
//! ## 使用纪律（How）
//! - 单消费者纪律由调用方的串行化机制保证：排空循环经 WIP 计数当选唯一排空者，
//!   生产侧由上游串行投递或 MPSC 结构自身保证；
//! - 违反纪律属实现缺陷：SPSC 变体在消费侧竞争下可能访问已回收的块。
//!   因此本模块仅在 crate 内部可见，不作为公共 API 暴露。

pub(crate) mod mpsc;
pub(crate) mod spsc;

pub(crate) use mpsc::MpscLinkedQueue;
pub(crate) use spsc::{SpscArrayQueue, SpscLinkedArrayQueue};
