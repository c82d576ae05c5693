//! 端到端场景套件。
//!
//! # 教案级导览
//! - **Why**：逐条覆盖运行时的代表性使用路径——工厂、聚合、线程切换、
//!   多播主体、分组、组合与去抖，确保各层协同下的可观察行为稳定；
//! - **How**：同步场景直接断言记录器内容，异步场景以闭锁等待，
//!   时间场景在虚拟时钟上推进；
//! - **What**：每个测试对应一条具名场景，失败信息指明违反的契约。

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rill_core::prelude::*;
use rill_core::scheduler::computation;
use rill_core::testkit::TestSink;

/// 场景一：range(1..=10) → take(5) → to_list 产出 [1,2,3,4,5]。
#[test]
fn scenario_range_take_to_list() {
    let sink = TestSink::unbounded();
    Stream::range(1, 10).take(5).to_list().subscribe(sink.clone());
    sink.assert_values(&[vec![1, 2, 3, 4, 5]]);
    sink.assert_completed();
    sink.assert_protocol_clean();
}

/// 场景二：just(1,2,3).all(x < 5) 产出 true。
#[test]
fn scenario_all_holds() {
    let sink = TestSink::unbounded();
    Stream::from_iter(vec![1, 2, 3]).all(|x| *x < 5).subscribe(sink.clone());
    sink.assert_values(&[true]);
    sink.assert_completed();
}

/// 场景三：just(1,2,3).all(x < 3) 产出 false。
#[test]
fn scenario_all_fails() {
    let sink = TestSink::unbounded();
    Stream::from_iter(vec![1, 2, 3]).all(|x| *x < 3).subscribe(sink.clone());
    sink.assert_values(&[false]);
    sink.assert_completed();
}

/// 场景四：empty().take_last(1) 无值完成。
#[test]
fn scenario_empty_take_last() {
    let sink = TestSink::<i64>::unbounded();
    Stream::<i64>::empty().take_last(1).subscribe(sink.clone());
    sink.assert_no_values();
    sink.assert_completed();
}

/// 场景五：observe_on(computation) 之后 map 在池内线程执行，结果保序。
#[test]
fn scenario_observe_on_switches_thread() {
    let caller = thread::current().id();
    let observed = Arc::new(Mutex::new(None));
    let probe = Arc::clone(&observed);
    let sink = TestSink::unbounded();
    Stream::from_iter(vec![1, 2, 3, 4])
        .observe_on(computation())
        .map(move |x| {
            *probe.lock() = Some(thread::current().id());
            2 * x
        })
        .to_list()
        .subscribe(sink.clone());

    assert!(sink.await_terminal(Duration::from_secs(5)), "必须在限期内完成");
    sink.assert_values(&[vec![2, 4, 6, 8]]);
    sink.assert_completed();
    let map_thread = observed.lock().expect("map 必须执行");
    assert_ne!(map_thread, caller, "map 必须运行在调度器线程");
}

/// 场景六：publish 主体——A 看到 [42, 4711]，晚到的 B 只看到 [4711]。
#[test]
fn scenario_publish_subject_timing() {
    let subject = PublishSubject::new();
    let a = TestSink::unbounded();
    subject.stream().subscribe(a.clone());
    subject.on_next(42);

    let b = TestSink::unbounded();
    subject.stream().subscribe(b.clone());
    subject.on_next(4711);
    subject.on_complete();

    a.assert_values(&[42, 4711]);
    a.assert_completed();
    b.assert_values(&[4711]);
    b.assert_completed();
}

/// 场景七：replay 主体——任意数量的晚到订阅者都能补齐 [1,2,3] 与完成。
#[test]
fn scenario_replay_subject_late_subscribers() {
    let subject = ReplaySubject::unbounded();
    subject.on_next(1);
    subject.on_next(2);
    subject.on_next(3);
    subject.on_complete();

    for _ in 0..2 {
        let late = TestSink::unbounded();
        subject.stream().subscribe(late.clone());
        late.assert_values(&[1, 2, 3]);
        late.assert_completed();
    }
}

/// 场景八：group_by(x % 2) 奇组 [1,3,5]、偶组 [2,4,6]，随源完成。
#[test]
fn scenario_group_by_parity() {
    let outer = TestSink::unbounded();
    Stream::range(1, 6).group_by(|x| x % 2).subscribe(outer.clone());

    let mut seen = 0;
    for group in outer.values() {
        let sink = TestSink::unbounded();
        let key = *group.key();
        group.stream().subscribe(sink.clone());
        match key {
            1 => sink.assert_values(&[1, 3, 5]),
            0 => sink.assert_values(&[2, 4, 6]),
            other => panic!("意外的组键 {other}"),
        }
        sink.assert_completed();
        seen += 1;
    }
    assert_eq!(seen, 2, "恰好两组");
    outer.assert_completed();
}

/// 场景九：combine_latest(just(10), just(20), a+b) 产出 [30] 后完成。
#[test]
fn scenario_combine_latest_scalars() {
    let sink = TestSink::unbounded();
    Stream::combine_latest(
        vec![Stream::just(10), Stream::just(20)],
        |row: &[i32]| row.iter().sum::<i32>(),
    )
    .subscribe(sink.clone());
    sink.assert_values(&[30]);
    sink.assert_completed();
}

/// 场景十：debounce(100ms) 时间线。
///
/// 输入 (0ms,1) (50ms,2) (200ms,3) (350ms,4) (500ms,complete)：
/// 2 在 150ms 发射，3 在 300ms 发射，4 随完成冲刷，最后完成。
#[test]
fn scenario_debounce_timeline() {
    let clock = TestScheduler::new();
    let scheduler: SchedulerRef = Arc::new(clock.clone());
    let source = PublishSubject::new();
    let sink = TestSink::unbounded();
    source
        .stream()
        .debounce(Duration::from_millis(100), scheduler)
        .subscribe(sink.clone());

    source.on_next(1); // t = 0ms
    clock.advance_time_by(Duration::from_millis(50));
    source.on_next(2); // t = 50ms
    clock.advance_time_by(Duration::from_millis(100)); // t = 150ms
    sink.assert_values(&[2]);

    clock.advance_time_by(Duration::from_millis(50)); // t = 200ms
    source.on_next(3);
    clock.advance_time_by(Duration::from_millis(100)); // t = 300ms
    sink.assert_values(&[2, 3]);

    clock.advance_time_by(Duration::from_millis(50)); // t = 350ms
    source.on_next(4);
    clock.advance_time_by(Duration::from_millis(50)); // t = 400ms，静默期未满
    sink.assert_values(&[2, 3]);

    // 完成先于 4 的静默期满到达：挂起值随完成冲刷。
    source.on_complete();
    sink.assert_values(&[2, 3, 4]);
    sink.assert_completed();

    clock.advance_time_to(Duration::from_millis(500));
    sink.assert_values(&[2, 3, 4]);
    sink.assert_protocol_clean();
}
