//! Temporal retrieval planning.
//!
//! Retrieval splits every query across three recency bands measured back from
//! now: HOT (last few hours), WORKING (days), LONG_TERM (months). Anything
//! older is EXPIRED and only reachable through explicit window requests or
//! archival tooling. Equal per-window allocation keeps the result set spread
//! across recency bands instead of letting the nearest neighbors crowd in
//! from HOT alone.

use serde::{Deserialize, Serialize};

use crate::chunker::CHARS_PER_TOKEN;
use crate::config::AppConfig;

pub const WINDOW_HOT: &str = "hot";
pub const WINDOW_WORKING: &str = "working";
pub const WINDOW_LONGTERM: &str = "longterm";

const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_DAY: f64 = 86_400_000.0;

/// One timestamp-bounded search request against a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSpec {
    pub name: String,
    pub k: usize,
    #[serde(rename = "minTimestamp")]
    pub min_ts: f64,
    #[serde(rename = "maxTimestamp")]
    pub max_ts: f64,
}

/// The three spans, configured in hours/days back from now.
#[derive(Debug, Clone, Copy)]
pub struct TemporalWindows {
    pub hot_hours: f64,
    pub working_days: f64,
    pub longterm_days: f64,
}

impl TemporalWindows {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            hot_hours: config.hot_window_hours,
            working_days: config.working_window_days,
            longterm_days: config.longterm_window_days,
        }
    }

    /// Build the three window specs for a query at `now_ms`. Adjacent windows
    /// meet at millisecond granularity: each older window ends 1 ms before
    /// the newer one begins, so the three spans partition `[now - L, now]`.
    pub fn plan(&self, now_ms: f64, per_window_k: usize) -> Vec<WindowSpec> {
        let hot_min = now_ms - self.hot_hours * MS_PER_HOUR;
        let working_min = now_ms - self.working_days * MS_PER_DAY;
        let longterm_min = now_ms - self.longterm_days * MS_PER_DAY;

        vec![
            WindowSpec {
                name: WINDOW_HOT.to_string(),
                k: per_window_k,
                min_ts: hot_min,
                max_ts: now_ms,
            },
            WindowSpec {
                name: WINDOW_WORKING.to_string(),
                k: per_window_k,
                min_ts: working_min,
                max_ts: hot_min - 1.0,
            },
            WindowSpec {
                name: WINDOW_LONGTERM.to_string(),
                k: per_window_k,
                min_ts: longterm_min,
                max_ts: working_min - 1.0,
            },
        ]
    }

    /// Which window a timestamp falls into, if any (None = EXPIRED or future).
    pub fn classify(&self, now_ms: f64, ts: f64) -> Option<&'static str> {
        if ts > now_ms {
            return None;
        }
        let hot_min = now_ms - self.hot_hours * MS_PER_HOUR;
        let working_min = now_ms - self.working_days * MS_PER_DAY;
        let longterm_min = now_ms - self.longterm_days * MS_PER_DAY;
        if ts >= hot_min {
            Some(WINDOW_HOT)
        } else if ts >= working_min {
            Some(WINDOW_WORKING)
        } else if ts >= longterm_min {
            Some(WINDOW_LONGTERM)
        } else {
            None
        }
    }
}

/// Per-vault result budget: `ceil(k * allocation)`.
pub fn vault_budget(k: usize, allocation: f64) -> usize {
    ((k as f64) * allocation).ceil() as usize
}

/// Per-window budget inside one vault: `ceil(vault_k / 3)`.
pub fn per_window_budget(vault_k: usize) -> usize {
    vault_k.div_ceil(3)
}

/// A retrieval candidate from any source (vault window, replica, buffer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub content: String,
    pub role: String,
    pub score: f32,
    pub timestamp: f64,
    pub window: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowBreakdown {
    pub hot: usize,
    pub working: usize,
    pub longterm: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedResults {
    pub results: Vec<ScoredChunk>,
    pub window_breakdown: WindowBreakdown,
    pub token_count: usize,
}

/// Merge candidates from every window and vault: near-duplicates collapse on
/// the first 100 characters of content, survivors rank by score descending,
/// and the set truncates to `k`.
pub fn merge(candidates: Vec<ScoredChunk>, k: usize) -> MergedResults {
    let mut seen = std::collections::HashSet::new();
    let mut merged: Vec<ScoredChunk> = Vec::with_capacity(candidates.len());

    let mut sorted = candidates;
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    for chunk in sorted {
        let key: String = chunk.content.chars().take(100).collect();
        if seen.insert(key) {
            merged.push(chunk);
        }
    }
    merged.truncate(k);

    let mut breakdown = WindowBreakdown::default();
    let mut chars = 0usize;
    for chunk in &merged {
        chars += chunk.content.chars().count();
        match chunk.window.as_str() {
            WINDOW_HOT => breakdown.hot += 1,
            WINDOW_WORKING => breakdown.working += 1,
            WINDOW_LONGTERM => breakdown.longterm += 1,
            _ => {}
        }
    }

    MergedResults {
        results: merged,
        window_breakdown: breakdown,
        token_count: chars.div_ceil(CHARS_PER_TOKEN),
    }
}
