//! Publish throughput benchmark.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabled::Tabled;

use ripple_core::config::RippleConfig;
use ripple_core::prelude::*;
use ripple_core::telemetry::MetricsRegistry;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct BenchArgs {
    /// Total events to publish
    #[arg(short, long, default_value = "100000")]
    events: u64,

    /// Concurrent producer threads
    #[arg(short, long, default_value = "1")]
    producers: usize,

    /// Counting handlers registered in parallel
    #[arg(long, default_value = "1")]
    handlers: usize,

    /// Number of distinct contexts events are spread over
    #[arg(long, default_value = "16")]
    contexts: usize,

    /// Print the Prometheus metrics snapshot afterwards
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct BenchRow {
    #[tabled(rename = "Events")]
    events: u64,
    #[tabled(rename = "Producers")]
    producers: usize,
    #[tabled(rename = "Handlers")]
    handlers: usize,
    #[tabled(rename = "Ring")]
    ring_capacity: usize,
    #[tabled(rename = "Elapsed (ms)")]
    elapsed_ms: u64,
    #[tabled(rename = "Events/s")]
    events_per_sec: u64,
    #[tabled(rename = "Handler errors")]
    handler_errors: u64,
}

pub async fn execute(
    args: BenchArgs,
    settings: RippleConfig,
    metrics: &MetricsRegistry,
    format: OutputFormat,
) -> Result<()> {
    if args.producers == 0 || args.handlers == 0 || args.contexts == 0 {
        bail!("--producers, --handlers and --contexts must be at least 1");
    }

    let row = tokio::task::spawn_blocking(move || run(&args, settings))
        .await
        .context("Benchmark thread panicked")??;
    output::rows(&[row], format)?;

    if metrics.is_enabled() {
        output::section("Metrics");
        println!("{}", metrics.render());
    }
    Ok(())
}

fn run(args: &BenchArgs, settings: RippleConfig) -> Result<BenchRow> {
    let producer_type = if args.producers > 1 {
        ProducerType::Multi
    } else {
        ProducerType::Single
    };
    let store = EventStore::builder()
        .from_config(&settings.store)
        .producer_type(producer_type)
        .build()?;

    let seen = Arc::new(AtomicU64::new(0));
    let handlers: Vec<Arc<dyn EventHandler>> = (0..args.handlers)
        .map(|i| {
            let seen = seen.clone();
            handler_fn(format!("count-{}", i), move |_, _, _| {
                seen.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .collect();
    store.register(handlers)?;
    store.start(true)?;

    let contexts: Vec<String> = (0..args.contexts).map(|i| format!("ctx-{}", i)).collect();
    let per_producer = args.events / args.producers as u64;
    let remainder = args.events % args.producers as u64;
    let started = Instant::now();

    std::thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..args.producers as u64)
            .map(|p| {
                let store = &store;
                let contexts = &contexts;
                let count = per_producer + u64::from(p < remainder);
                scope.spawn(move || -> ripple_core::Result<()> {
                    for i in 0..count {
                        let context = &contexts[(i as usize) % contexts.len()];
                        store.publish(Payload::new(i), context)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("Producer thread panicked"),
            }
        }
        Ok(())
    })?;

    let expected = args.events * args.handlers as u64;
    let deadline = Instant::now() + Duration::from_secs(30);
    while seen.load(Ordering::Relaxed) < expected {
        if Instant::now() > deadline {
            bail!("Handlers saw {} of {} events", seen.load(Ordering::Relaxed), expected);
        }
        std::thread::yield_now();
    }
    let elapsed = started.elapsed();
    store.stop();

    let stats = store.stats();
    Ok(BenchRow {
        events: args.events,
        producers: args.producers,
        handlers: args.handlers,
        ring_capacity: stats.ring_capacity,
        elapsed_ms: elapsed.as_millis() as u64,
        events_per_sec: (args.events as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        handler_errors: stats.handler_errors,
    })
}
