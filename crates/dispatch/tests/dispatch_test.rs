//! End-to-end dispatch properties.
//!
//! Exercises the full path — normalization, cost-informed partitioning,
//! pool execution, ordered assembly — through both retrieval conventions,
//! with isolated registries so tests can run concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use spindle_core::{ArrayBuffer, Value};
use spindle_dispatch::{
    collect_ordered, delayed, Arg, BackendRegistry, Callable, DispatchInput, Mode, Parallel,
    PerfRegistry, TaskError,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn square() -> Callable {
    Callable::new("square", |args| {
        let x = args.int(0)?;
        Ok(Value::Int(x * x))
    })
}

fn scal() -> Callable {
    Callable::new("scal", |args| {
        let factor = args.float(0)?;
        let slice = args.slice(1)?;
        slice.with_mut(|t| {
            for x in t.iter_mut() {
                *x *= factor;
            }
        })?;
        Ok(Value::Unit)
    })
}

/// A dispatcher wired to fresh registries.
fn isolated(n_jobs: usize) -> Parallel {
    Parallel::new(n_jobs)
        .registry(Arc::new(PerfRegistry::new()))
        .backends(Arc::new(BackendRegistry::new()))
}

#[test]
fn five_squares_over_three_jobs() {
    let f = square();
    // Lazy single-pass producer, drained by the normalizer before dispatch.
    let input = DispatchInput::calls((0..5).map(|i| delayed(&f).arg(i).build()));
    let results = isolated(3).run(input).unwrap();
    let expected: Vec<Value> = [0, 1, 4, 9, 16].into_iter().map(Value::Int).collect();
    assert_eq!(results, expected);
}

#[test]
fn slot_count_matches_input_even_out_of_order() {
    // Uneven per-element sleeps force completions out of submission order.
    let f = Callable::new("staggered", |args| {
        let x = args.int(0)?;
        std::thread::sleep(Duration::from_millis((x % 3) as u64 * 5));
        Ok(Value::Int(x))
    });
    let calls: Vec<_> = (0..40).map(|i| delayed(&f).arg(i).build()).collect();
    let results = isolated(4).run(calls).unwrap();
    assert_eq!(results.len(), 40);
    for (i, v) in results.iter().enumerate() {
        assert_eq!(*v, Value::Int(i as i64));
    }
}

#[test]
fn slot_count_matches_axis_expansion_length() {
    let f = square();
    let call = delayed(&f).arg(Arg::stream(0..17i64)).build();
    let handle = isolated(4).submit(call).unwrap();
    assert_eq!(handle.len(), 17);
    assert_eq!(handle.wait().unwrap().len(), 17);
}

#[tokio::test]
async fn blocking_and_future_modes_agree() {
    let f = square();
    let build = || (0..64).map(|i| delayed(&f).arg(i).build()).collect::<Vec<_>>();

    let blocking = isolated(3).run(build()).unwrap();

    let handle = isolated(3).mode(Mode::Future).submit(build()).unwrap();
    let slots = timeout(TIMEOUT, handle.future()).await.expect("timed out");
    let awaited = collect_ordered(slots).unwrap();

    assert_eq!(blocking, awaited);
}

#[test]
fn in_place_mutation_matches_sequential_execution() {
    // Axis expansion over one shared buffer: every element owns a
    // disjoint length-1 range, so the parallel result must equal the
    // sequential one.
    let n = 256;
    let buf = ArrayBuffer::new((0..n).map(|i| i as f64).collect());
    let call = delayed(&scal()).arg(3.0).arg(&buf).build();
    isolated(4).run(call).unwrap();

    let expected: Vec<f64> = (0..n).map(|i| i as f64 * 3.0).collect();
    assert_eq!(buf.to_vec().unwrap(), expected);
}

#[test]
fn independent_scal_calls_do_not_interfere() {
    let a = ArrayBuffer::new(vec![1.0, 2.0, 3.0]);
    let b = ArrayBuffer::new(vec![1.0, 2.0, 3.0]);
    let f = scal();
    let calls = vec![
        delayed(&f).arg(2.0).arg(a.slice_all()).build(),
        delayed(&f).arg(3.0).arg(b.slice_all()).build(),
    ];
    isolated(2).run(calls).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![2.0, 4.0, 6.0]);
    assert_eq!(b.to_vec().unwrap(), vec![3.0, 6.0, 9.0]);
}

#[test]
fn empty_batch_blocking_mode() {
    let handle = isolated(2).submit(DispatchInput::Calls(Vec::new())).unwrap();
    assert!(handle.is_ready());
    assert!(handle.wait().unwrap().is_empty());
}

#[tokio::test]
async fn empty_batch_future_mode() {
    let handle = isolated(2)
        .mode(Mode::Future)
        .submit(DispatchInput::Calls(Vec::new()))
        .unwrap();
    assert!(handle.is_ready());
    let slots = timeout(TIMEOUT, handle.future()).await.expect("timed out");
    assert!(slots.is_empty());
}

#[test]
fn one_failing_slot_of_five_stays_in_position() {
    let f = Callable::new("third-fails", |args| {
        let x = args.int(0)?;
        if x == 3 {
            Err(TaskError::Failed("third element".into()))
        } else {
            Ok(Value::Int(x * 10))
        }
    });
    let calls: Vec<_> = (0..5).map(|i| delayed(&f).arg(i).build()).collect();
    let slots = isolated(2).submit(calls).unwrap().wait_all();

    assert_eq!(slots.len(), 5);
    for (i, slot) in slots.iter().enumerate() {
        if i == 3 {
            assert_eq!(*slot, Err(TaskError::Failed("third element".into())));
        } else {
            assert_eq!(*slot, Ok(Value::Int(i as i64 * 10)));
        }
    }

    // The blocking convenience path raises that same slot first.
    let calls: Vec<_> = (0..5).map(|i| delayed(&f).arg(i).build()).collect();
    let err = isolated(2).run(calls).unwrap_err();
    assert!(err.to_string().contains("third element"));
}

#[test]
fn warm_model_changes_grouping_without_changing_results() {
    // First dispatch calibrates the model, second uses its predictions;
    // results must be identical either way.
    let registry = Arc::new(PerfRegistry::new());
    let dispatcher = Parallel::new(3)
        .registry(registry.clone())
        .backends(Arc::new(BackendRegistry::new()))
        .perfmodel("warm");

    let f = square();
    let cold: Vec<_> = (0..50).map(|i| delayed(&f).arg(i).build()).collect();
    let first = dispatcher.run(cold).unwrap();

    let warm: Vec<_> = (0..50).map(|i| delayed(&f).arg(i).build()).collect();
    let second = dispatcher.run(warm).unwrap();

    assert_eq!(first, second);
    // Both passes recorded: one observation per element.
    let class = spindle_dispatch::SizeClass::for_element_count(1);
    assert_eq!(registry.observation_count("warm", class), 100);
}

#[tokio::test]
async fn future_mode_with_shared_buffer_mutation() {
    let n = 64;
    let buf = ArrayBuffer::new(vec![1.0; n]);
    let call = delayed(&scal()).arg(5.0).arg(&buf).build();
    let handle = isolated(4).mode(Mode::Future).submit(call).unwrap();
    timeout(TIMEOUT, handle.future()).await.expect("timed out");
    assert_eq!(buf.to_vec().unwrap(), vec![5.0; n]);
}
