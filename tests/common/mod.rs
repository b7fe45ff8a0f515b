//! Shared test fixtures

#![allow(dead_code)]

pub mod mock_platform;

pub use mock_platform::{BATCH_PREFIX, BOT, Call, MockPlatformService};

use chrono::{Duration as ChronoDuration, Utc};
use merge_assist::config::LaneSettings;
use merge_assist::lane::{Lane, LaneContext};
use merge_assist::store::{MemoryStore, Store};
use merge_assist::types::{
    LaneKey, MergeRequestRecord, MrKey, MrSnapshot, MrStatus, PipelineInfo, PipelineStatus,
    PrState,
};
use merge_assist::wait::CancelToken;
use std::sync::Arc;
use std::time::Duration;

/// Project path used by every fixture
pub const PROJECT: &str = "group/app";

/// Key of MR `number` in the fixture project
pub fn key(number: u64) -> MrKey {
    MrKey::new(PROJECT, number)
}

/// The fixture lane
pub fn lane_key() -> LaneKey {
    LaneKey::new(PROJECT, "main")
}

/// Snapshot of an MR that passes every readiness check
pub fn ready_mr(number: u64) -> MrSnapshot {
    let sha = format!("head{number}");
    MrSnapshot {
        number,
        title: format!("Add feature {number}"),
        web_url: format!("https://gitlab.example.com/group/app/-/merge_requests/{number}"),
        state: PrState::Open,
        is_draft: false,
        source_branch: format!("feature-{number}"),
        target_branch: "main".to_string(),
        head_sha: sha.clone(),
        pipeline: Some(PipelineInfo {
            id: number * 10,
            status: PipelineStatus::Success,
            sha,
        }),
        approvals_satisfied: true,
        assignees: vec![BOT.to_string()],
        has_conflicts: false,
        unresolved_discussions: false,
        behind_target: false,
        rebase_in_progress: false,
        rebase_error: None,
        labels: vec![],
    }
}

/// Lane settings with short waits
pub fn settings(batch_size: usize) -> LaneSettings {
    LaneSettings {
        automation_user: BOT.to_string(),
        batch_size,
        max_queue_delay: Duration::from_secs(600),
        pipeline_timeout: Duration::from_secs(300),
        proof_timeout: Duration::from_secs(300),
        poll_interval: Duration::from_secs(5),
        tick_interval: Duration::from_secs(30),
        ..LaneSettings::default()
    }
}

/// Everything a lane test needs
pub struct Harness {
    pub mock: Arc<MockPlatformService>,
    pub store: Arc<MemoryStore>,
    pub lane: Lane,
}

impl Harness {
    /// Lane over a fresh mock remote and memory store
    pub fn new(settings: LaneSettings) -> Self {
        let mock = Arc::new(MockPlatformService::new());
        let store = Arc::new(MemoryStore::new());
        let ctx = LaneContext::new(lane_key(), mock.clone(), store.clone(), settings);
        Self {
            mock,
            store,
            lane: Lane::new(ctx, CancelToken::never()),
        }
    }

    /// Add ready MRs to the remote and evaluate them in order
    pub async fn queue_ready(&self, numbers: &[u64]) {
        for &n in numbers {
            self.mock.add_mr(ready_mr(n));
            self.lane.evaluate(&key(n)).await.unwrap();
        }
    }

    /// Current record for an MR (active or archived)
    pub fn record(&self, number: u64) -> MergeRequestRecord {
        self.store.load_mr(&key(number)).unwrap().unwrap()
    }
}

/// A record already queued, bypassing evaluation. It was recognized
/// `recognized_age` seconds ago and last became ready `queued_age` seconds ago.
pub fn queued_record(
    number: u64,
    recognized_age: i64,
    queued_age: i64,
    strikes: u32,
) -> MergeRequestRecord {
    let now = Utc::now();
    let recognized_at = now - ChronoDuration::seconds(recognized_age);
    let mut record = MergeRequestRecord::recognize(PROJECT, &ready_mr(number), recognized_at);
    record.status = MrStatus::Queued;
    record.queued_at = Some(now - ChronoDuration::seconds(queued_age));
    record.strikes = strikes;
    record
}
