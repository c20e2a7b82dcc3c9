//! Terminal rendering for scenario reports, benchmark rows and config.

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ripple_core::prelude::{AggregatorStats, StoreStats};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human readable tables
    #[default]
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Serialize `value` for the machine readable formats. `None` for tables.
    fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Option<String>> {
        let encoded = match self {
            Self::Table => return Ok(None),
            Self::Json => serde_json::to_string_pretty(value).context("Failed to encode JSON")? + "\n",
            Self::Yaml => serde_yaml::to_string(value).context("Failed to encode YAML")?,
        };
        Ok(Some(encoded))
    }
}

/// Outcome tag of a one-line message.
#[derive(Debug, Clone, Copy)]
pub enum Status {
    Done,
    Note,
    Failed,
}

pub fn status(status: Status, msg: &str) {
    match status {
        Status::Done => println!("{} {}", "done".green().bold(), msg),
        Status::Note => println!("{} {}", "note".yellow().bold(), msg),
        Status::Failed => eprintln!("{} {}", "fail".red().bold(), msg),
    }
}

pub fn section(title: &str) {
    println!("\n{}", title.bold().underline());
}

/// Rows as a table, or the whole slice as one JSON/YAML document.
pub fn rows<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<()> {
    if let Some(encoded) = format.encode(items)? {
        print!("{}", encoded);
    } else if items.is_empty() {
        println!("{}", "(none)".dimmed());
    } else {
        println!("{}", Table::new(items).with(Style::sharp()));
    }
    Ok(())
}

/// A serializable document. Tables fall back to JSON.
pub fn document<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<()> {
    let format = match format {
        OutputFormat::Table => OutputFormat::Json,
        other => other,
    };
    if let Some(encoded) = format.encode(value)? {
        print!("{}", encoded);
    }
    Ok(())
}

/// Right-aligned `name value` lines.
pub fn counters<V: std::fmt::Display>(entries: &[(&str, V)]) {
    let width = entries.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in entries {
        let name = format!("{:>width$}", name, width = width);
        println!("  {}  {}", name.cyan(), value);
    }
}

pub fn aggregator_counters(stats: &AggregatorStats) {
    counters(&[
        ("claimed", stats.claimed),
        ("completed", stats.completed),
        ("timed out", stats.timed_out),
        ("forced", stats.forced_timeouts),
        ("duplicates", stats.dropped_duplicates),
        ("abandoned", stats.abandoned),
    ]);
}

pub fn store_counters(stats: &StoreStats) {
    counters(&[
        ("published", stats.published),
        ("contexts", stats.contexts as u64),
        ("evictions", stats.context_evictions),
        ("handler errors", stats.handler_errors),
        ("republish drops", stats.republish_dropped),
    ]);
}
