use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_wait::recovery::SqliteCheckpointStore;
use async_wait::*;
use chrono::TimeZone;
use chrono::Utc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Uppercases after sleeping `delay_ms` from the input's suffix.
fn delayed_upper(rt: &Runtime) -> impl AsyncFunction<String, String> {
    FutureFunction::new(rt.handle().clone(), |input: String| async move {
        let delay_ms: u64 = input
            .rsplit(':')
            .next()
            .and_then(|ms| ms.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok::<_, InvocationError>(vec![input.to_uppercase()])
    })
}

fn rec(value: &str) -> StreamRecord<String> {
    StreamRecord::new(value.to_owned())
}

#[test]
fn ordered_stage_keeps_input_order() {
    let rt = runtime();
    let config = AsyncWaitConfig::new("ordered", OutputMode::Ordered).with_capacity(4);
    let mut op = AsyncWaitBuilder::new(config)
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();

    for input in ["a:60", "b:30", "c:0", "d:10"] {
        op.process_element(rec(input)).unwrap();
    }
    op.finish().unwrap();

    let found: Vec<_> = op.output().values().into_iter().cloned().collect();
    assert_eq!(found, vec!["A:60", "B:30", "C:0", "D:10"]);
}

#[test]
fn unordered_stage_never_crosses_watermarks() {
    let rt = runtime();
    let config = AsyncWaitConfig::new("unordered", OutputMode::Unordered).with_capacity(8);
    let mut op = AsyncWaitBuilder::new(config)
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();

    let wm = Watermark(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
    op.process_element(rec("slow:80")).unwrap();
    op.process_element(rec("fast:0")).unwrap();
    op.process_watermark(wm).unwrap();
    op.process_element(rec("after:0")).unwrap();
    op.finish().unwrap();

    let elements = &op.output().elements;
    assert_eq!(elements.len(), 4);
    assert_eq!(elements[2], StreamElement::Watermark(wm));
    assert_eq!(elements[3], StreamElement::Record(rec("AFTER:0")));
    assert_eq!(op.output().watermarks(), vec![wm]);
}

#[test]
fn blocking_admission_bounds_in_flight() {
    let rt = runtime();
    let config = AsyncWaitConfig::new("bounded", OutputMode::Unordered).with_capacity(2);
    let mut op = AsyncWaitBuilder::new(config)
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();

    let start = Instant::now();
    for n in 0..6 {
        op.process_element(rec(&format!("{n}:20"))).unwrap();
        assert!(op.len() <= 2);
    }
    op.finish().unwrap();

    assert_eq!(op.output().len(), 6);
    // Three waves of two 20ms calls.
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn timeout_falls_back_without_waiting_for_the_call() {
    let rt = runtime();
    let config = AsyncWaitConfig::new("deadline", OutputMode::Ordered)
        .with_timeout(Duration::from_millis(50));
    let mut op = AsyncWaitBuilder::new(config)
        .with_fallback(|input: &String, err| {
            assert!(err.is_timeout());
            vec![format!("late {input}")]
        })
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();

    let start = Instant::now();
    op.process_element(rec("x:10000")).unwrap();
    op.finish().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    let found: Vec<_> = op.output().values().into_iter().cloned().collect();
    assert_eq!(found, vec!["late x:10000"]);
}

#[test]
fn retries_errors_from_json_config() {
    let rt = runtime();
    let calls = Arc::new(AtomicU32::new(0));
    let flaky_calls = calls.clone();
    let flaky = FutureFunction::new(rt.handle().clone(), move |input: String| {
        let calls = flaky_calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(InvocationError::new("try again"))
            } else {
                Ok(vec![input.len()])
            }
        }
    });

    let config = AsyncWaitConfig::from_json(
        r#"{"step_id": "flaky", "timeout_ms": 5000,
            "retry": {"type": "exponential_backoff", "max_attempts": 3,
                      "initial_delay_ms": 5, "max_delay_ms": 20, "multiplier": 2.0,
                      "retry_on": {"error": true}}}"#,
    )
    .unwrap();
    let mut op = AsyncWaitBuilder::new(config)
        .build(flaky, CollectingOutput::new())
        .unwrap();

    op.process_element(rec("hello")).unwrap();
    // Finishing stops retries, so wait for the result first.
    let start = Instant::now();
    while op.output().is_empty() && start.elapsed() < Duration::from_secs(5) {
        op.poll().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    op.finish().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(op.output().values(), vec![&5]);
}

#[test]
fn restore_from_sqlite_checkpoint() {
    let rt = runtime();
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
    let config = AsyncWaitConfig::new("restored", OutputMode::Ordered).with_capacity(10);

    let mut op = AsyncWaitBuilder::new(config.clone())
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();
    op.process_element(rec("a:0")).unwrap();
    op.process_element(rec("b:10000")).unwrap();
    op.process_element(rec("c:0")).unwrap();
    op.checkpoint(CheckpointId(1), &mut store).unwrap();
    // Crash with the slow call still in flight.
    drop(op);

    let instant = FutureFunction::new(rt.handle().clone(), |input: String| async move {
        Ok::<_, InvocationError>(vec![input.to_uppercase()])
    });
    let mut restored = AsyncWaitBuilder::new(config)
        .restore_from(&mut store, instant, CollectingOutput::new())
        .unwrap();
    restored.finish().unwrap();

    let found: Vec<_> = restored.into_output().values().into_iter().cloned().collect();
    assert_eq!(found, vec!["A:0", "B:10000", "C:0"]);
}

#[test]
fn checkpoint_skips_emitted_entries() {
    let rt = runtime();
    let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
    let config = AsyncWaitConfig::new("partial", OutputMode::Unordered).with_capacity(10);

    let mut op = AsyncWaitBuilder::new(config.clone())
        .build(delayed_upper(&rt), CollectingOutput::new())
        .unwrap();
    op.process_element(rec("done:0")).unwrap();
    op.process_element(rec("pending:10000")).unwrap();
    let start = Instant::now();
    while op.output().is_empty() && start.elapsed() < Duration::from_secs(5) {
        op.poll().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    op.checkpoint(CheckpointId(7), &mut store).unwrap();
    drop(op);

    let (checkpoint, state) = store
        .read_latest(&StepId::new("partial"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint, CheckpointId(7));
    let pending = recovery::PendingElements::<String>::from_state_bytes(&state).unwrap();
    assert_eq!(pending.0, vec![StreamElement::Record(rec("pending:10000"))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drives_from_inside_multi_thread_runtime() {
    let upper = FutureFunction::new(tokio::runtime::Handle::current(), |input: String| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, InvocationError>(vec![input.to_uppercase()])
    });
    let config = AsyncWaitConfig::new("in_runtime", OutputMode::Ordered).with_capacity(1);
    let mut op = AsyncWaitBuilder::new(config)
        .build(upper, CollectingOutput::new())
        .unwrap();

    // Capacity one makes every admission after the first park.
    for input in ["a", "b", "c"] {
        op.process_element(rec(input)).unwrap();
    }
    op.finish().unwrap();

    let found: Vec<_> = op.output().values().into_iter().cloned().collect();
    assert_eq!(found, vec!["A", "B", "C"]);
    drop(op);
}

#[tokio::test]
async fn current_thread_runtime_reports_instead_of_panicking() {
    let upper = FutureFunction::new(tokio::runtime::Handle::current(), |input: String| async move {
        Ok::<_, InvocationError>(vec![input.to_uppercase()])
    });
    let config = AsyncWaitConfig::new("single", OutputMode::Ordered).with_capacity(1);
    let mut op = AsyncWaitBuilder::new(config)
        .build(upper, CollectingOutput::new())
        .unwrap();

    op.process_element(rec("a")).unwrap();
    // The spawned call can't run until this task yields, so the
    // second admission has to park.
    assert!(matches!(
        op.process_element(rec("b")),
        Err(AsyncWaitError::CurrentThreadRuntime)
    ));
    drop(op);
}
