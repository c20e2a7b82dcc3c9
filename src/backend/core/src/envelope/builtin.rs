//! Filters shipped with the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::filter::Filter;
use crate::error::{Result, RippleError};

/// Context key of an event. Always present in a store's layout; written by
/// [`EventStore::publish`](crate::store::EventStore::publish) and read by the
/// default mux function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextFilter {
    pub context: String,
}

impl ContextFilter {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

impl Filter for ContextFilter {
    fn clear(&mut self) {
        // keep the allocation for the next publish into this slot
        self.context.clear();
    }
}

/// Coarse classification of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[default]
    Unknown,
    Data,
    Aggregate,
    Timeout,
    Control,
}

/// Whether an event carries a full or partial update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    #[default]
    Unknown,
    Full,
    Partial,
    Meta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeFilter {
    pub event_type: EventType,
    pub update: UpdateKind,
}

impl EventTypeFilter {
    pub fn new(event_type: EventType, update: UpdateKind) -> Self {
        Self { event_type, update }
    }
}

impl Filter for EventTypeFilter {}

// ═══════════════════════════════════════════════════════════════════════════════
// Timing context
// ═══════════════════════════════════════════════════════════════════════════════

pub const SELECTOR_PREFIX: &str = "FAIR.SELECTOR.";
pub const SELECTOR_ALL: &str = "FAIR.SELECTOR.ALL";

/// Wildcard value for the numeric timing ids.
pub const WILDCARD: i32 = -1;

/// Timing context of an event: cycle (`C`), sequence (`S`), process (`P`) and
/// timing group (`T`) ids plus the beam-production-chain timestamp.
///
/// Selector syntax: `FAIR.SELECTOR.ALL` or
/// `FAIR.SELECTOR.C=1:S=2:P=3:T=4` with any subset of components in any
/// order. Missing components are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingCtx {
    pub selector: String,
    pub cid: i32,
    pub sid: i32,
    pub pid: i32,
    pub gid: i32,
    /// Beam production chain timestamp (µs)
    pub bpcts: i64,
}

impl Default for TimingCtx {
    fn default() -> Self {
        Self {
            selector: String::new(),
            cid: WILDCARD,
            sid: WILDCARD,
            pid: WILDCARD,
            gid: WILDCARD,
            bpcts: -1,
        }
    }
}

impl Filter for TimingCtx {}

impl TimingCtx {
    /// Parse a selector and attach a timestamp.
    pub fn new(selector: &str, bpcts: i64) -> Result<Self> {
        let mut ctx = Self::default();
        ctx.set_selector(selector, bpcts)?;
        Ok(ctx)
    }

    /// Replace the selector in place. On error the context is left cleared.
    pub fn set_selector(&mut self, selector: &str, bpcts: i64) -> Result<()> {
        Filter::clear(self);
        let trimmed = selector.trim();
        let upper = trimmed.to_ascii_uppercase();

        if upper.is_empty() || upper == SELECTOR_ALL {
            self.selector = SELECTOR_ALL.to_string();
            self.bpcts = bpcts;
            return Ok(());
        }

        let body = upper
            .strip_prefix(SELECTOR_PREFIX)
            .ok_or_else(|| RippleError::invalid_selector(selector, "missing FAIR.SELECTOR. prefix"))?;

        let (mut cid, mut sid, mut pid, mut gid) = (WILDCARD, WILDCARD, WILDCARD, WILDCARD);
        for part in body.split(':').filter(|p| !p.is_empty()) {
            let (tag, value) = part
                .split_once('=')
                .ok_or_else(|| RippleError::invalid_selector(selector, format!("'{}' is not TAG=value", part)))?;
            let value: i32 = value
                .trim()
                .parse()
                .map_err(|e| RippleError::invalid_selector(selector, format!("{}: {}", part, e)))?;
            if value < WILDCARD {
                return Err(RippleError::invalid_selector(selector, format!("{} is negative", part)));
            }
            match tag.trim() {
                "C" => cid = value,
                "S" => sid = value,
                "P" => pid = value,
                "T" => gid = value,
                other => {
                    return Err(RippleError::invalid_selector(
                        selector,
                        format!("unknown component '{}'", other),
                    ))
                }
            }
        }

        self.selector = upper;
        self.cid = cid;
        self.sid = sid;
        self.pid = pid;
        self.gid = gid;
        self.bpcts = bpcts;
        Ok(())
    }

    /// Returns `true` if every id is a wildcard.
    pub fn is_all(&self) -> bool {
        [self.cid, self.sid, self.pid, self.gid]
            .iter()
            .all(|&id| id == WILDCARD)
    }

    /// Symmetric wildcard match on the numeric ids; timestamps are ignored.
    pub fn matches(&self, other: &TimingCtx) -> bool {
        fn id_matches(a: i32, b: i32) -> bool {
            a == WILDCARD || b == WILDCARD || a == b
        }
        id_matches(self.cid, other.cid)
            && id_matches(self.sid, other.sid)
            && id_matches(self.pid, other.pid)
            && id_matches(self.gid, other.gid)
    }
}

impl FromStr for TimingCtx {
    type Err = RippleError;

    fn from_str(s: &str) -> Result<Self> {
        TimingCtx::new(s, -1)
    }
}

impl fmt::Display for TimingCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.selector.is_empty() {
            write!(f, "{}", SELECTOR_ALL)
        } else {
            write!(f, "{}", self.selector)
        }
    }
}
