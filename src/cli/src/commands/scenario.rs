//! Built-in scenarios exercising the aggregator and the context history.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Args, ValueEnum};
use crossbeam::channel;
use serde::Serialize;
use std::time::{Duration, Instant};
use tabled::Tabled;

use ripple_core::config::RippleConfig;
use ripple_core::prelude::*;

use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScenarioKind {
    /// Three devices report three readings each: three complete groups
    Ordinary,
    /// One of three devices never reports: every group times out
    Missing,
    /// More keys than workers: the oldest claims are forced out
    Starvation,
    /// More contexts than the cache holds: the oldest history is evicted
    History,
}

#[derive(Args)]
pub struct ScenarioArgs {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: ScenarioKind,

    /// Override the aggregation timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Override the number of aggregation workers
    #[arg(short, long)]
    workers: Option<usize>,
}

/// Payload published by every scenario.
#[derive(Debug, Clone)]
struct Reading {
    device: String,
    index: u32,
}

impl Reading {
    fn label(&self) -> String {
        format!("{}{}", self.device, self.index)
    }
}

#[derive(Debug, Serialize, Tabled)]
struct AggregateRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Events")]
    events: String,
    #[tabled(rename = "Elapsed (ms)")]
    elapsed_ms: u64,
}

impl From<&Aggregate> for AggregateRow {
    fn from(aggregate: &Aggregate) -> Self {
        let events: Vec<String> = aggregate
            .events
            .iter()
            .filter_map(|e| e.payload_as::<Reading>())
            .map(Reading::label)
            .collect();
        Self {
            key: aggregate.key.clone(),
            outcome: aggregate.outcome.to_string(),
            events: events.join(","),
            elapsed_ms: aggregate.elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct HistoryRow {
    #[tabled(rename = "Context")]
    context: String,
    #[tabled(rename = "Entries")]
    entries: usize,
    #[tabled(rename = "Newest first")]
    readings: String,
    #[tabled(rename = "Last published")]
    last_published: String,
}

#[derive(Debug, Serialize)]
struct ScenarioReport {
    scenario: String,
    aggregates: Vec<AggregateRow>,
    history: Vec<HistoryRow>,
    aggregator: Option<AggregatorStats>,
    store: StoreStats,
}

pub async fn execute(args: ScenarioArgs, mut settings: RippleConfig, format: OutputFormat) -> Result<()> {
    if let Some(timeout_ms) = args.timeout_ms {
        settings.aggregator.timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(workers) = args.workers {
        settings.aggregator.workers = workers;
    }
    let kind = args.scenario;

    let report = tokio::task::spawn_blocking(move || run(kind, settings))
        .await
        .context("Scenario thread panicked")??;

    match format {
        OutputFormat::Table => {
            output::section(&format!("Scenario: {}", report.scenario));
            if !report.aggregates.is_empty() {
                output::rows(&report.aggregates, format)?;
            }
            if !report.history.is_empty() {
                output::rows(&report.history, format)?;
            }
            if let Some(stats) = &report.aggregator {
                output::section("Aggregator");
                output::aggregator_counters(stats);
            }
            output::section("Store");
            output::store_counters(&report.store);
        }
        _ => output::document(&report, format)?,
    }
    Ok(())
}

fn run(kind: ScenarioKind, mut settings: RippleConfig) -> Result<ScenarioReport> {
    let readings: Vec<(&str, u32)> = match kind {
        ScenarioKind::Ordinary => grid(&["a", "b", "c"], 3),
        ScenarioKind::Missing => grid(&["a", "b"], 3),
        ScenarioKind::Starvation => {
            settings.aggregator.workers = settings.aggregator.workers.min(2);
            settings.aggregator.dedup_capacity = settings.aggregator.dedup_capacity.max(2);
            (1..=6).map(|i| ("a", i)).collect()
        }
        ScenarioKind::History => return run_history(settings),
    };
    let expected_keys = readings
        .iter()
        .map(|(_, index)| *index)
        .collect::<std::collections::BTreeSet<_>>()
        .len();

    let store = EventStore::builder()
        .with_filter::<EventTypeFilter>()
        .from_config(&settings.store)
        .build()?;
    let aggregator = DemuxAggregator::new(settings.aggregator.clone(), |env: &Envelope| {
        env.payload_as::<Reading>().map(|r| r.index.to_string())
    })?;

    let (tx, rx) = channel::unbounded();
    aggregator.register(&store)?.then([handler_fn("collector", move |env, _, _| {
        if let Some(aggregate) = env.payload_as::<Aggregate>() {
            let _ = tx.send(aggregate.clone());
        }
        Ok(())
    })])?;
    store.start(true)?;

    for (device, index) in readings {
        let reading = Reading {
            device: device.to_string(),
            index,
        };
        store.publish(Payload::new(reading), device)?;
    }

    // every key resolves within a timeout of its claim; claims queue behind
    // busy workers
    let rounds = expected_keys.div_ceil(settings.aggregator.workers) as u32 + 1;
    let deadline = Instant::now() + settings.aggregator.timeout * rounds + Duration::from_secs(2);
    let mut aggregates = Vec::with_capacity(expected_keys);
    while aggregates.len() < expected_keys {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(aggregate) => aggregates.push(aggregate),
            Err(_) => {
                output::status(
                    output::Status::Note,
                    &format!("Gave up waiting after {} of {} aggregates", aggregates.len(), expected_keys),
                );
                break;
            }
        }
    }
    let stats = store.stats();
    store.stop();
    aggregates.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(ScenarioReport {
        scenario: format!("{:?}", kind).to_lowercase(),
        aggregates: aggregates.iter().map(AggregateRow::from).collect(),
        history: Vec::new(),
        aggregator: Some(aggregator.stats()),
        store: stats,
    })
}

fn run_history(mut settings: RippleConfig) -> Result<ScenarioReport> {
    settings.store.context_capacity = 2;
    let store = EventStore::builder().from_config(&settings.store).build()?;
    store.start(true)?;

    let contexts = ["c0", "c1", "c2"];
    let mut last = -1;
    for context in contexts {
        for index in 1..=3 {
            let reading = Reading {
                device: context.to_string(),
                index,
            };
            last = store.publish(Payload::new(reading), context)?;
        }
    }
    // the fan-out stage has copied everything once the newest context holds
    // the last sequence
    let deadline = Instant::now() + Duration::from_secs(2);
    while store
        .get_last("c2", |e| e.parent_sequence() == last)
        .is_none()
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(1));
    }

    let history = contexts
        .iter()
        .map(|context| {
            let entries = store.get_history(context, i64::MAX, |_| true, settings.store.history_length);
            let readings: Vec<String> = entries
                .iter()
                .filter_map(|e| e.payload_as::<Reading>())
                .map(Reading::label)
                .collect();
            HistoryRow {
                context: context.to_string(),
                entries: entries.len(),
                readings: readings.join(","),
                last_published: entries
                    .first()
                    .and_then(|e| e.published_at())
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                    .unwrap_or_else(|| "evicted".to_string()),
            }
        })
        .collect();
    let stats = store.stats();
    store.stop();

    Ok(ScenarioReport {
        scenario: "history".to_string(),
        aggregates: Vec::new(),
        history,
        aggregator: None,
        store: stats,
    })
}

fn grid(devices: &[&'static str], rounds: u32) -> Vec<(&'static str, u32)> {
    (1..=rounds)
        .flat_map(|index| devices.iter().map(move |device| (*device, index)))
        .collect()
}
