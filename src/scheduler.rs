//! Merge scheduling - pure functions deciding what a lane does next
//!
//! This module contains no I/O. The lane gathers its queued records, calls
//! [`plan_cycle`], and executes the returned [`CycleDecision`].

use crate::types::{MergeRequestRecord, MrKey, MrStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when fewer than `batch_size` MRs are queued and the queue
/// delay has elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialBatchPolicy {
    /// Batch whatever is queued
    #[default]
    PartialBatch,
    /// Merge the head of the queue on its own
    SingleMerges,
    /// Keep waiting for a full batch
    WaitForFullBatch,
}

/// Scheduling knobs for one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// MRs per batch (also the priority window)
    pub batch_size: usize,
    /// Partial queue wait
    pub max_queue_delay: Duration,
    /// Partial queue policy
    pub partial: PartialBatchPolicy,
}

/// Decision for one scheduler cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleDecision {
    /// Nothing to do
    Idle,
    /// Partial queue; re-plan at or after this instant
    Wait {
        /// When the queue delay elapses
        until: DateTime<Utc>,
    },
    /// Merge one MR through the executor
    Single(MrKey),
    /// Batch these MRs, in order
    Batch(Vec<MrKey>),
}

impl std::fmt::Display for CycleDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Wait { until } => write!(f, "wait until {}", until.to_rfc3339()),
            Self::Single(key) => write!(f, "single merge {key}"),
            Self::Batch(keys) => {
                let list: Vec<String> = keys.iter().map(|k| format!("!{}", k.number)).collect();
                write!(f, "batch of {}: {}", keys.len(), list.join(", "))
            }
        }
    }
}

/// Order queued MRs for a lane (PURE).
///
/// Baseline order is first-come-first-served by `recognized_at`, so a strike
/// never costs an MR its place in line.
/// Priority reorders only within a sliding window: each output slot takes the
/// highest-priority MR among the first `window` remaining MRs in FCFS order,
/// earliest first on ties. An MR can therefore never jump more than `window`
/// places ahead of where FCFS would put it.
pub fn order_queue(records: &[MergeRequestRecord], window: usize) -> Vec<&MergeRequestRecord> {
    let mut remaining: Vec<&MergeRequestRecord> = records.iter().collect();
    remaining.sort_by(|a, b| {
        a.recognized_at
            .cmp(&b.recognized_at)
            .then_with(|| a.key.number.cmp(&b.key.number))
    });

    let window = window.max(1);
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let end = window.min(remaining.len());
        let mut best = 0;
        for (idx, candidate) in remaining[..end].iter().enumerate().skip(1) {
            if candidate.priority > remaining[best].priority {
                best = idx;
            }
        }
        ordered.push(remaining.remove(best));
    }
    ordered
}

/// Plan one scheduler cycle (PURE - no I/O, easily testable).
///
/// # Arguments
/// * `queued` - records of this lane in `Queued` status (others are ignored)
/// * `lane_busy` - an operation (batch or single merge) is in flight
/// * `now` - current time, used for the partial-queue deadline
/// * `policy` - batch size, queue delay and partial policy
pub fn plan_cycle(
    queued: &[MergeRequestRecord],
    lane_busy: bool,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> CycleDecision {
    if lane_busy {
        return CycleDecision::Idle;
    }

    let ready: Vec<MergeRequestRecord> = queued
        .iter()
        .filter(|r| r.status == MrStatus::Queued)
        .cloned()
        .collect();
    let ordered = order_queue(&ready, policy.batch_size);

    let Some(first) = ordered.first() else {
        return CycleDecision::Idle;
    };

    if ordered.len() == 1 || policy.batch_size <= 1 {
        return CycleDecision::Single(first.key.clone());
    }

    if ordered.len() >= policy.batch_size {
        return CycleDecision::Batch(
            ordered
                .iter()
                .take(policy.batch_size)
                .map(|r| r.key.clone())
                .collect(),
        );
    }

    // 1 < queued < batch_size: wait for the oldest MR's delay to run out
    let oldest = ordered
        .iter()
        .map(|r| r.waiting_since())
        .min()
        .unwrap_or(now);
    let delay = chrono::Duration::from_std(policy.max_queue_delay)
        .unwrap_or_else(|_| chrono::Duration::MAX);
    let until = oldest.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

    if now < until {
        return CycleDecision::Wait { until };
    }

    match policy.partial {
        PartialBatchPolicy::PartialBatch => {
            CycleDecision::Batch(ordered.iter().map(|r| r.key.clone()).collect())
        }
        PartialBatchPolicy::SingleMerges => CycleDecision::Single(first.key.clone()),
        PartialBatchPolicy::WaitForFullBatch => CycleDecision::Idle,
    }
}
