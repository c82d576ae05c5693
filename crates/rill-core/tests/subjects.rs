//! 多播主体的跨类型行为套件。
//!
//! # 教案级导览
//! - **Why**：四种主体共享“终止重放、逐订阅者需求、登记表一致性”契约，
//!   集中在一个套件里做跨类型对照，防止实现各自漂移；
//! - **How**：以记录器逐步驱动订阅/发射/终止的交错；
//! - **What**：覆盖晚到订阅、需求暂停、取消移除与并发发射。

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rill_core::prelude::*;
use rill_core::testkit::TestSink;

/// publish 主体在多线程发射下仍维持每个订阅者的串行投递。
///
/// 信号端契约要求串行投递，这里由单一发射线程驱动、多个订阅者消费。
#[test]
fn publish_subject_single_emitter_many_subscribers() {
    let subject = PublishSubject::new();
    let sinks: Vec<_> = (0..4).map(|_| TestSink::unbounded()).collect();
    for sink in &sinks {
        subject.stream().subscribe(sink.clone());
    }

    let emitter = {
        let subject = Arc::clone(&subject);
        thread::spawn(move || {
            for i in 0..500u64 {
                subject.on_next(i);
            }
            subject.on_complete();
        })
    };
    emitter.join().expect("发射线程必须平稳退出");

    for sink in &sinks {
        assert!(sink.await_terminal(Duration::from_secs(5)));
        sink.assert_values(&(0..500).collect::<Vec<u64>>());
        sink.assert_completed();
        sink.assert_protocol_clean();
    }
}

/// replay(size) 与 replay(unbounded) 对晚到订阅者的可见窗口不同。
#[test]
fn replay_policies_differ_on_visibility() {
    let unbounded = ReplaySubject::unbounded();
    let sized = ReplaySubject::with_size(2);
    for i in 1..=4 {
        unbounded.on_next(i);
        sized.on_next(i);
    }

    let all = TestSink::unbounded();
    unbounded.stream().subscribe(all.clone());
    all.assert_values(&[1, 2, 3, 4]);

    let recent = TestSink::unbounded();
    sized.stream().subscribe(recent.clone());
    recent.assert_values(&[3, 4]);
}

/// 主体的终止重放对任何订阅时刻一致。
#[test]
fn terminal_replay_is_uniform() {
    let publish = PublishSubject::<i32>::new();
    let replay = ReplaySubject::<i32>::unbounded();
    let last = AsyncSubject::<i32>::new();

    publish.on_error(RillError::new("test.subject_boom", "boom"));
    replay.on_error(RillError::new("test.subject_boom", "boom"));
    last.on_error(RillError::new("test.subject_boom", "boom"));

    let p = TestSink::unbounded();
    publish.stream().subscribe(p.clone());
    p.assert_error_code("test.subject_boom");

    let r = TestSink::unbounded();
    replay.stream().subscribe(r.clone());
    r.assert_error_code("test.subject_boom");

    let a = TestSink::unbounded();
    last.stream().subscribe(a.clone());
    a.assert_error_code("test.subject_boom");
}

/// unicast 作为操作符构件：积压 → 订阅 → 按需排空 → 终止。
#[test]
fn unicast_buffers_for_single_consumer() {
    let subject = UnicastSubject::new();
    for i in 0..10 {
        subject.on_next(i);
    }
    subject.on_complete();

    let sink = TestSink::with_request(4);
    subject.stream().subscribe(sink.clone());
    sink.assert_values(&[0, 1, 2, 3]);
    sink.request(100);
    sink.assert_values(&(0..10).collect::<Vec<i32>>());
    sink.assert_completed();
}

/// async 主体在并发订阅与完成交错下只发射一次末值。
#[test]
fn async_subject_emits_once_under_races() {
    let subject = AsyncSubject::new();
    let sinks: Vec<_> = (0..4).map(|_| TestSink::unbounded()).collect();
    for sink in &sinks {
        subject.stream().subscribe(sink.clone());
    }
    subject.on_next(1);
    subject.on_next(2);

    let completer = {
        let subject = Arc::clone(&subject);
        thread::spawn(move || subject.on_complete())
    };
    completer.join().expect("完成线程必须平稳退出");

    for sink in &sinks {
        assert!(sink.await_terminal(Duration::from_secs(5)));
        sink.assert_values(&[2]);
        sink.assert_completed();
        sink.assert_protocol_clean();
    }
}
