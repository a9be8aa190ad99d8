//! spindle-demo — replays the classic dispatch workloads against the
//! engine.
//!
//! Runs, in order:
//! - a scalar sweep (`sqrt(i^2)` over a range) with a named model
//! - zipped scalar streams (`multi(a_i, b_i)`)
//! - in-place array scaling (`scal(2, A)`) where the mutated buffer is
//!   the result
//! - a custom counting backend activated for one scoped block
//! - the same sweep through the future-mode handle under tokio

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use spindle_core::{load_dotenv, ArrayBuffer, DispatchConfig, Value};
use spindle_dispatch::{
    collect_ordered, delayed, global_registry, parallel_backend, register_parallel_backend, Arg,
    Callable, Mode, Parallel, ParallelBackend, SizeClass,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Cost-model-driven task dispatch demo.
#[derive(Parser, Debug)]
#[command(name = "spindle-demo", version, about)]
struct Cli {
    /// Number of elements per sweep.
    #[arg(long, env = "SPINDLE_DEMO_N", default_value_t = 10_000)]
    n: usize,

    /// Worker budget.
    #[arg(long, env = "SPINDLE_DEMO_JOBS", default_value_t = 3)]
    jobs: usize,
}

// ── Counting backend ────────────────────────────────────────────────

/// Backend that counts every batch it sees; the dispatch itself is
/// unchanged.
struct CountingBackend {
    count: Arc<AtomicU64>,
}

impl ParallelBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_batch_start(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Workloads ───────────────────────────────────────────────────────

fn sqrt_callable() -> Callable {
    Callable::new("sqrt", |args| {
        let x = args.float(0)?;
        Ok(Value::Float(x.sqrt()))
    })
}

fn scalar_sweep(config: &DispatchConfig, n: usize, jobs: usize) -> Result<()> {
    let sqrt = sqrt_callable();
    let calls: Vec<_> = (0..n as i64)
        .map(|i| delayed(&sqrt).arg((i * i) as f64).build())
        .collect();
    let results = Parallel::new(jobs)
        .config(config.clone())
        .perfmodel("sqrt")
        .run(calls)?;
    info!(results = results.len(), "scalar sweep done");
    Ok(())
}

fn zipped_streams(config: &DispatchConfig, n: usize, jobs: usize) -> Result<()> {
    let multi = Callable::new("multi", |args| {
        Ok(Value::Int(args.int(0)? * args.int(1)?))
    });
    let n = n as i64;
    let call = delayed(&multi)
        .arg(Arg::stream(0..n))
        .arg(Arg::stream(n..2 * n))
        .build();
    let results = Parallel::new(jobs)
        .config(config.clone())
        .perfmodel("multi")
        .run(call)?;
    info!(results = results.len(), "zipped stream sweep done");
    Ok(())
}

fn in_place_scaling(config: &DispatchConfig, n: usize, jobs: usize) -> Result<()> {
    let scal = Callable::new("scal", |args| {
        let factor = args.float(0)?;
        let slice = args.slice(1)?;
        slice.with_mut(|t| {
            for x in t.iter_mut() {
                *x *= factor;
            }
        })?;
        Ok(Value::Unit)
    });
    let buf = ArrayBuffer::new((0..n).map(|i| i as f64).collect());
    Parallel::new(jobs)
        .config(config.clone())
        .perfmodel("scal")
        .run(delayed(&scal).arg(2.0).arg(&buf).build())?;
    let scaled = buf.to_vec()?;
    info!(first = scaled.first().copied(), last = scaled.last().copied(), "in-place scaling done");
    Ok(())
}

fn counting_backend_block(jobs: usize) -> Result<()> {
    let count = Arc::new(AtomicU64::new(0));
    let c = count.clone();
    register_parallel_backend(
        "counting",
        Arc::new(move || Arc::new(CountingBackend { count: c.clone() }) as Arc<dyn ParallelBackend>),
    )?;

    let guard = parallel_backend("counting", jobs)?;
    info!(
        backend = guard.backend().name(),
        worker_budget = guard.worker_budget(),
        "scoped backend active"
    );
    let sqrt = sqrt_callable();
    let calls: Vec<_> = (0..100i64).map(|i| delayed(&sqrt).arg(i as f64).build()).collect();
    Parallel::new(jobs).run(calls)?;
    drop(guard);

    info!(batches = count.load(Ordering::Relaxed), "counting backend saw the batch");
    Ok(())
}

async fn future_mode_sweep(config: &DispatchConfig, n: usize, jobs: usize) -> Result<()> {
    let sqrt = sqrt_callable();
    let calls: Vec<_> = (0..n as i64)
        .map(|i| delayed(&sqrt).arg((i * i) as f64).build())
        .collect();
    let handle = Parallel::new(jobs)
        .config(config.clone())
        .mode(Mode::Future)
        .perfmodel("sqrt")
        .submit(calls)?;
    let results = collect_ordered(handle.future().await)?;
    info!(results = results.len(), "future-mode sweep done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DispatchConfig::from_env();
    config.log_summary();

    scalar_sweep(&config, cli.n, cli.jobs)?;
    zipped_streams(&config, cli.n, cli.jobs)?;
    in_place_scaling(&config, cli.n, cli.jobs)?;
    counting_backend_block(cli.jobs)?;
    future_mode_sweep(&config, cli.n, cli.jobs).await?;

    // The sweeps above seeded the named models; a real deployment hands
    // this snapshot to the persistence layer on shutdown.
    let registry = global_registry();
    for model in registry.model_names() {
        let class = SizeClass::for_element_count(1);
        info!(
            model = %model,
            observations = registry.observation_count(&model, class),
            predicted_us = registry
                .predict(&model, class)
                .map(|d| d.as_micros() as u64),
            "model history"
        );
    }
    Ok(())
}
