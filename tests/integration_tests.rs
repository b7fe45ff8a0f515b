//! Integration tests for merge-assist

#![allow(deprecated)] // cargo_bin is the standard way to test CLI binaries

mod common;

use assert_cmd::Command;
use common::{BATCH_PREFIX, BOT, Call, Harness, PROJECT, key, lane_key, queued_record, ready_mr, settings};
use merge_assist::batch::{BatchManager, prepare_batch_branch};
use merge_assist::config::{Config, Labels};
use merge_assist::engine::{Engine, Submission};
use merge_assist::lane::{Evaluation, Lane, LaneContext};
use merge_assist::platform::{PlatformService, RetryPolicy, RetryingPlatform};
use merge_assist::scheduler::CycleDecision;
use merge_assist::store::{MemoryStore, Store};
use merge_assist::strikes::StrikeOutcome;
use merge_assist::types::{
    AuditAction, BatchOperation, BatchStatus, LaneKey, MrEvent, MrStatus, PipelineStatus,
    PrState,
};
use merge_assist::wait::{CancelToken, Shutdown};
use predicates::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn batch_branch() -> String {
    format!("{BATCH_PREFIX}/main")
}

fn audit_actions(store: &MemoryStore) -> Vec<AuditAction> {
    store
        .audit_log(None)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_a_single_ready_mr_merges() {
    let h = Harness::new(settings(5));
    let mut mr = ready_mr(1);
    mr.behind_target = true;
    h.mock.add_mr(mr);

    let evaluation = h.lane.evaluate(&key(1)).await.unwrap();
    assert_eq!(
        evaluation,
        Evaluation::Verdict(StrikeOutcome::Cleared { newly_queued: true })
    );
    let labels = Labels::default();
    assert!(h.mock.mr(1).labels.contains(&labels.ready_to_merge));

    let decision = h.lane.run_cycle().await.unwrap();
    assert_eq!(decision, CycleDecision::Single(key(1)));

    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Merged);
    assert!(record.merged_at.is_some());
    assert!(h.store.active_mrs().unwrap().is_empty());

    let remote = h.mock.mr(1);
    assert_eq!(remote.state, PrState::Merged);
    assert!(!remote.labels.contains(&labels.ready_to_merge));
    assert!(!remote.labels.contains(&labels.recognized));

    let calls = h.mock.calls();
    assert!(calls.contains(&Call::Rebase(1)));
    let comments = h.mock.comments(1);
    assert!(comments.last().unwrap().contains("Successfully Merged"));
    assert!(audit_actions(&h.store).contains(&AuditAction::Merged));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_full_batch_completes() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1, 2, 3, 4, 5]).await;

    let decision = h.lane.run_cycle().await.unwrap();
    assert_eq!(
        decision,
        CycleDecision::Batch(vec![key(1), key(2), key(3), key(4), key(5)])
    );

    for n in 1..=5 {
        assert_eq!(h.record(n).status, MrStatus::Merged, "MR {n}");
    }
    assert_eq!(h.mock.merged(), vec![1, 2, 3, 4, 5]);

    let state = h.store.snapshot();
    assert!(state.batches.is_empty());
    assert_eq!(state.archived_batches.len(), 1);
    let batch = &state.archived_batches[0];
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.members, vec![key(1), key(2), key(3), key(4), key(5)]);

    // Proof MR was opened as a labelled draft, closed, and never merged
    let proofs = h.mock.proof_mrs();
    assert_eq!(proofs.len(), 1);
    let proof = &proofs[0];
    assert_eq!(proof.title, "[Merge Assist Batch] !1, !2, !3, !4, !5");
    assert!(proof.is_draft);
    assert_eq!(proof.state, PrState::Closed);
    assert!(proof.labels.contains(&Labels::default().batch_mr));
    assert!(!h.mock.merged().contains(&proof.number));
    assert!(!h.mock.has_branch(&batch_branch()));

    // Member branches were merged with CI suppressed
    let branch_merges: Vec<Call> = h
        .mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::MergeBranch { .. }))
        .collect();
    assert_eq!(branch_merges.len(), 5);
    assert!(
        branch_merges
            .iter()
            .all(|c| matches!(c, Call::MergeBranch { skip_ci: true, .. }))
    );

    for n in 1..=5 {
        let comments = h.mock.comments(n);
        assert!(comments.iter().any(|c| c.contains("Batch Validated")));
        assert!(comments.last().unwrap().contains("Successfully Merged (Batch)"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_proof_failure_requeues_without_strikes() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1, 2, 3, 4, 5]).await;
    h.mock.set_proof_result(Some(PipelineStatus::Failed));
    let queued_at: Vec<_> = (1..=5).map(|n| h.record(n).queued_at).collect();

    h.lane.run_cycle().await.unwrap();

    for n in 1..=5u64 {
        let record = h.record(n);
        assert_eq!(record.status, MrStatus::Queued, "MR {n}");
        assert_eq!(record.strikes, 0);
        assert!(record.batch_id.is_none());
        assert_eq!(record.queued_at, queued_at[(n - 1) as usize]);
        assert!(h.mock.comments(n).last().unwrap().contains("Batch Merge Failed"));
    }
    assert!(h.mock.merged().is_empty());

    let state = h.store.snapshot();
    assert!(state.batches.is_empty());
    let batch = &state.archived_batches[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.pipeline_status, Some(PipelineStatus::Failed));
    assert!(batch.error.as_deref().unwrap().contains("failed"));

    assert!(!h.mock.has_branch(&batch_branch()));
    assert_eq!(h.mock.proof_mrs()[0].state, PrState::Closed);

    let actions = audit_actions(&h.store);
    assert!(actions.contains(&AuditAction::ProofFailed));
    assert!(actions.contains(&AuditAction::BatchFailed));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_member_finalize_failure_is_isolated() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1, 2, 3, 4, 5]).await;
    h.mock.set_rebase_result(3, PipelineStatus::Failed);

    h.lane.run_cycle().await.unwrap();

    let failed = h.record(3);
    assert_eq!(failed.strikes, 1);
    assert_eq!(failed.status, MrStatus::NotReady);
    assert_eq!(failed.last_reasons, vec!["Merge pipeline failed"]);
    assert!(
        h.mock
            .mr(3)
            .labels
            .contains(&Labels::default().not_ready)
    );

    for n in [1, 2, 4, 5] {
        let record = h.record(n);
        assert_eq!(record.status, MrStatus::Merged, "MR {n}");
        assert_eq!(record.strikes, 0);
    }
    assert_eq!(h.mock.merged(), vec![1, 2, 4, 5]);

    let batch = &h.store.snapshot().archived_batches[0];
    assert_eq!(batch.status, BatchStatus::Completed);
}

// =============================================================================
// Batch mechanics
// =============================================================================

#[tokio::test]
async fn test_creating_is_idempotent() {
    let h = Harness::new(settings(5));
    let branch = batch_branch();

    // Leftovers from an interrupted run
    h.mock.add_branch(&branch);
    h.mock.add_mr(ready_mr(1));
    h.mock
        .merge_branch_into_branch("feature-1", &branch, true)
        .await
        .unwrap();
    let stale = h
        .mock
        .create_mr(&branch, "main", "[Merge Assist Batch] !1", "", true)
        .await
        .unwrap();

    prepare_batch_branch(h.mock.as_ref(), &branch, "main").await.unwrap();
    let first = h.mock.branch_contents(&branch);
    assert_eq!(first, Some(vec![]));
    assert_eq!(h.mock.mr(stale.number).state, PrState::Closed);

    prepare_batch_branch(h.mock.as_ref(), &branch, "main").await.unwrap();
    assert_eq!(h.mock.branch_contents(&branch), first);
    assert!(
        h.mock
            .find_open_mr(&branch, "main")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn test_excluded_member_keeps_strikes() {
    let h = Harness::new(settings(5));
    for (n, age, strikes) in [(1, 50, 0), (2, 40, 2), (3, 30, 0)] {
        h.mock.add_mr(ready_mr(n));
        h.store.save_mr(&queued_record(n, age, age, strikes)).unwrap();
    }
    h.mock.add_conflict("feature-2");
    let cancel = CancelToken::never();

    let report = BatchManager::new(h.lane.context(), &cancel)
        .run(vec![key(1), key(2), key(3)])
        .await
        .unwrap();

    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.excluded, vec![key(2)]);
    assert_eq!(report.merged, vec![key(1), key(3)]);

    let excluded = h.record(2);
    assert_eq!(excluded.status, MrStatus::Queued);
    assert_eq!(excluded.strikes, 2);
    assert!(excluded.batch_id.is_none());
    assert!(
        h.mock
            .comments(2)
            .iter()
            .any(|c| c.contains("Removed from Batch"))
    );
    assert_eq!(h.mock.proof_mrs()[0].title, "[Merge Assist Batch] !1, !3");
    assert!(audit_actions(&h.store).contains(&AuditAction::MemberExcluded));
}

#[tokio::test(start_paused = true)]
async fn test_batch_fails_when_every_member_conflicts() {
    let h = Harness::new(settings(2));
    h.queue_ready(&[1, 2]).await;
    h.mock.add_conflict("feature-1");
    h.mock.add_conflict("feature-2");
    let cancel = CancelToken::never();

    let report = BatchManager::new(h.lane.context(), &cancel)
        .run(vec![key(1), key(2)])
        .await
        .unwrap();

    assert_eq!(report.status, BatchStatus::Failed);
    assert!(report.error.unwrap().contains("no member"));
    assert!(h.mock.proof_mrs().is_empty());
    assert!(!h.mock.has_branch(&batch_branch()));
    assert_eq!(h.record(1).status, MrStatus::Queued);
    assert_eq!(h.record(2).status, MrStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_proof_timeout_fails_batch() {
    let h = Harness::new(settings(3));
    h.queue_ready(&[1, 2, 3]).await;
    h.mock.set_proof_result(None);

    h.lane.run_cycle().await.unwrap();

    let batch = &h.store.snapshot().archived_batches[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error.as_deref().unwrap().contains("timed out"));
    for n in 1..=3 {
        assert_eq!(h.record(n).status, MrStatus::Queued);
        assert_eq!(h.record(n).strikes, 0);
    }
    assert!(!h.mock.has_branch(&batch_branch()));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_is_recovered() {
    let h = Harness::new(settings(2));
    h.queue_ready(&[1, 2]).await;
    h.mock.set_proof_result(None);

    let shutdown = Shutdown::new();
    let cancel = shutdown.token();
    let manager = BatchManager::new(h.lane.context(), &cancel);
    let (result, ()) = tokio::join!(manager.run(vec![key(1), key(2)]), async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown.trigger();
    });

    assert!(matches!(result, Err(merge_assist::Error::Cancelled)));
    let active = h.store.active_batch(&lane_key()).unwrap().unwrap();
    assert_eq!(active.status, BatchStatus::ProofPipelineWait);
    assert!(!h.mock.has_branch(&batch_branch()));

    h.lane.recover().await.unwrap();

    assert!(h.store.active_batch(&lane_key()).unwrap().is_none());
    let archived = &h.store.snapshot().archived_batches[0];
    assert_eq!(archived.status, BatchStatus::Failed);
    assert_eq!(h.record(1).status, MrStatus::Queued);
    assert_eq!(h.record(2).status, MrStatus::Queued);
    assert!(audit_actions(&h.store).contains(&AuditAction::BatchRecovered));
}

#[tokio::test]
async fn test_recovery_tears_down_leftover_batch() {
    let h = Harness::new(settings(5));
    let branch = batch_branch();
    h.mock.add_branch(&branch);
    let proof = h
        .mock
        .create_mr(&branch, "main", "[Merge Assist Batch] !1, !2", "", true)
        .await
        .unwrap();

    let mut batch = BatchOperation::new(
        lane_key(),
        branch.clone(),
        vec![key(1), key(2)],
        chrono::Utc::now(),
    );
    batch.proof_mr = Some(proof.number);
    h.store.begin_batch(&batch).unwrap();
    batch.transition(BatchStatus::ProofPipelineWait);
    h.store.save_batch(&batch).unwrap();
    for n in [1, 2] {
        let mut record = queued_record(n, 10, 10, 0);
        record.status = MrStatus::InBatch;
        record.batch_id = Some(batch.id);
        h.store.save_mr(&record).unwrap();
    }
    // Single merge interrupted mid-flight
    let mut merging = queued_record(3, 5, 5, 1);
    merging.status = MrStatus::Merging;
    h.store.save_mr(&merging).unwrap();

    h.lane.recover().await.unwrap();

    assert!(h.store.active_batches().unwrap().is_empty());
    let archived = &h.store.snapshot().archived_batches[0];
    assert_eq!(archived.status, BatchStatus::Failed);
    assert_eq!(archived.error.as_deref(), Some("interrupted before completion"));
    for n in 1..=3 {
        assert_eq!(h.record(n).status, MrStatus::Queued, "MR {n}");
    }
    assert_eq!(h.record(3).strikes, 1);
    assert!(!h.mock.has_branch(&branch));
    assert_eq!(h.mock.mr(proof.number).state, PrState::Closed);
}

// =============================================================================
// Single merge failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_pipeline_failure_adds_strike() {
    let h = Harness::new(settings(5));
    let mut mr = ready_mr(1);
    mr.behind_target = true;
    h.mock.add_mr(mr);
    h.mock.set_rebase_result(1, PipelineStatus::Failed);
    h.lane.evaluate(&key(1)).await.unwrap();

    h.lane.run_cycle().await.unwrap();

    let record = h.record(1);
    assert_eq!(record.status, MrStatus::NotReady);
    assert_eq!(record.strikes, 1);
    assert!(h.mock.comments(1).last().unwrap().contains("Merge Pipeline Failed"));
}

#[tokio::test(start_paused = true)]
async fn test_refused_merge_adds_strike() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;
    h.mock.refuse_merge(1);

    h.lane.run_cycle().await.unwrap();

    let record = h.record(1);
    assert_eq!(record.strikes, 1);
    assert_eq!(record.status, MrStatus::NotReady);
    assert!(h.mock.comments(1).last().unwrap().contains("Merge Failed"));
}

#[tokio::test(start_paused = true)]
async fn test_api_error_during_merge_requeues_without_strike() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;
    h.mock.fail_transiently("merge_mr", 1);

    h.lane.run_cycle().await.unwrap();

    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Queued);
    assert_eq!(record.strikes, 0);
    assert!(h.mock.comments(1).last().unwrap().contains("Error Occurred"));

    // The next cycle goes through
    h.lane.run_cycle().await.unwrap();
    assert_eq!(h.record(1).status, MrStatus::Merged);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let mock = Arc::new(common::MockPlatformService::new());
    let store = Arc::new(MemoryStore::new());
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    };
    let platform = Arc::new(RetryingPlatform::new(mock.clone(), policy));
    let lane = Lane::new(
        LaneContext::new(lane_key(), platform, store.clone(), settings(5)),
        CancelToken::never(),
    );
    mock.add_mr(ready_mr(1));
    mock.fail_transiently("get_mr_snapshot", 2);

    let evaluation = lane.evaluate(&key(1)).await.unwrap();
    assert_eq!(
        evaluation,
        Evaluation::Verdict(StrikeOutcome::Cleared { newly_queued: true })
    );
}

// =============================================================================
// Evaluation lifecycle
// =============================================================================

#[tokio::test]
async fn test_rejection_is_idempotent_until_reinstated() {
    let h = Harness::new(settings(5));
    let mut mr = ready_mr(1);
    mr.assignees.clear();
    h.mock.add_mr(mr);

    for count in 1..=3 {
        let evaluation = h.lane.evaluate(&key(1)).await.unwrap();
        assert_eq!(evaluation, Evaluation::Verdict(StrikeOutcome::Struck { count }));
    }
    let evaluation = h.lane.evaluate(&key(1)).await.unwrap();
    assert_eq!(
        evaluation,
        Evaluation::Verdict(StrikeOutcome::Rejected { count: 4 })
    );

    let labels = Labels::default();
    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Rejected);
    assert!(h.store.active_mrs().unwrap().is_empty());
    assert!(h.mock.mr(1).labels.contains(&labels.rejected));
    let comments = h.mock.comments(1);
    assert_eq!(comments.len(), 4);
    assert!(comments[0].contains("Attempt 1/3"));
    assert!(comments[3].contains("MR Rejected"));

    // Further events change nothing
    assert_eq!(h.lane.evaluate(&key(1)).await.unwrap(), Evaluation::Skipped);
    assert_eq!(h.record(1), record);
    assert_eq!(h.mock.comments(1).len(), 4);

    // Operator clears it once the MR is fixed
    h.mock.update_mr(1, |m| m.assignees = vec![BOT.to_string()]);
    let evaluation = h.lane.reinstate(&key(1)).await.unwrap();
    assert_eq!(
        evaluation,
        Evaluation::Verdict(StrikeOutcome::Cleared { newly_queued: true })
    );
    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Queued);
    assert_eq!(record.strikes, 0);
    assert!(!h.mock.mr(1).labels.contains(&labels.rejected));
    assert!(audit_actions(&h.store).contains(&AuditAction::Reinstated));
}

#[tokio::test]
async fn test_reinstate_requires_rejection() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;

    let err = h.lane.reinstate(&key(1)).await.unwrap_err();
    assert!(matches!(err, merge_assist::Error::InvalidState(_)));
}

#[tokio::test]
async fn test_closed_mr_is_archived_and_reopen_recognized() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;

    h.mock.update_mr(1, |m| m.state = PrState::Closed);
    assert_eq!(h.lane.evaluate(&key(1)).await.unwrap(), Evaluation::Closed);
    assert_eq!(h.record(1).status, MrStatus::Closed);
    assert!(h.store.active_mrs().unwrap().is_empty());

    h.mock.update_mr(1, |m| m.state = PrState::Open);
    assert_eq!(
        h.lane.evaluate(&key(1)).await.unwrap(),
        Evaluation::Verdict(StrikeOutcome::Cleared { newly_queued: true })
    );
    assert_eq!(h.record(1).status, MrStatus::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_retarget_during_merge_archives_record() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;
    h.mock
        .update_mr(1, |m| m.target_branch = "release".to_string());

    h.lane.run_cycle().await.unwrap();

    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Closed);
    assert_eq!(record.target_branch, "main");
    assert_eq!(record.strikes, 0);
    assert!(h.store.active_mrs().unwrap().is_empty());
    assert!(h.mock.merged().is_empty());

    // The lane for the new target picks it up as a fresh MR
    let release = Lane::new(
        LaneContext::new(
            LaneKey::new(PROJECT, "release"),
            h.mock.clone(),
            h.store.clone(),
            settings(5),
        ),
        CancelToken::never(),
    );
    assert_eq!(
        release.evaluate(&key(1)).await.unwrap(),
        Evaluation::Verdict(StrikeOutcome::Cleared { newly_queued: true })
    );
    let record = h.record(1);
    assert_eq!(record.status, MrStatus::Queued);
    assert_eq!(record.target_branch, "release");
}

#[tokio::test(start_paused = true)]
async fn test_retargeted_mr_is_not_reclaimed_by_old_lane() {
    let h = Harness::new(settings(5));
    h.queue_ready(&[1]).await;
    h.mock
        .update_mr(1, |m| m.target_branch = "release".to_string());
    h.lane.run_cycle().await.unwrap();

    assert_eq!(h.lane.evaluate(&key(1)).await.unwrap(), Evaluation::Skipped);
    assert_eq!(h.record(1).status, MrStatus::Closed);

    // No lane manages release, so the engine lets the MR go
    let mut platforms: HashMap<String, Arc<dyn PlatformService>> = HashMap::new();
    platforms.insert(PROJECT.to_string(), h.mock.clone());
    let engine = Engine::start(&engine_config(5, ""), platforms, h.store.clone());
    let submission = engine
        .submit(&MrEvent {
            project: PROJECT.to_string(),
            mr: 1,
        })
        .await
        .unwrap();
    assert!(matches!(submission, Submission::Ignored(_)));
    engine.shutdown().await;
    assert!(h.store.active_mrs().unwrap().is_empty());
}

#[tokio::test]
async fn test_proof_mrs_are_not_evaluated() {
    let h = Harness::new(settings(5));
    let mut proof = ready_mr(50);
    proof.source_branch = batch_branch();
    h.mock.add_mr(proof);

    assert_eq!(h.lane.evaluate(&key(50)).await.unwrap(), Evaluation::Skipped);
    assert!(h.store.load_mr(&key(50)).unwrap().is_none());
}

#[tokio::test]
async fn test_missing_target_branch_halts_lane() {
    let mut h = Harness::new(settings(5));
    h.mock.remove_branch("main");

    h.lane.startup().await.unwrap();

    assert!(h.lane.is_halted());
    assert!(h.lane.halted().unwrap().contains("does not exist"));
    assert_eq!(h.lane.run_cycle().await.unwrap(), CycleDecision::Idle);
    assert!(audit_actions(&h.store).contains(&AuditAction::LaneHalted));
}

// =============================================================================
// Engine
// =============================================================================

fn engine_config(batch_size: usize, extra: &str) -> Config {
    Config::parse(&format!(
        r#"
automation_user = "{BOT}"

[engine]
batch_size = {batch_size}
poll_interval_secs = 5
tick_interval_secs = 30
pipeline_timeout_secs = 300
proof_timeout_secs = 300

[[projects]]
platform = "gitlab"
owner = "group"
repo = "app"
target_branches = ["main"]
{extra}
"#
    ))
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_engine_burst_never_overlaps_batches() {
    let mock = Arc::new(common::MockPlatformService::new());
    let store = Arc::new(MemoryStore::new());
    for n in 1..=7 {
        mock.add_mr(ready_mr(n));
    }
    let mut platforms: HashMap<String, Arc<dyn PlatformService>> = HashMap::new();
    platforms.insert(PROJECT.to_string(), mock.clone());

    let engine = Engine::start(&engine_config(3, ""), platforms, store.clone());
    assert_eq!(engine.lanes(), vec![lane_key()]);

    for _ in 0..2 {
        for n in 1..=7 {
            let event = MrEvent {
                project: PROJECT.to_string(),
                mr: n,
            };
            let submission = engine.submit(&event).await.unwrap();
            assert!(matches!(
                submission,
                Submission::Routed(_) | Submission::Coalesced(_)
            ));
        }
    }
    engine.drain().await;

    assert!(mock.max_open_proofs() <= 1);
    assert!(store.active_batches().unwrap().is_empty());
    let mut merged = mock.merged();
    merged.sort_unstable();
    assert_eq!(merged, (1..=7).collect::<Vec<_>>());
    for n in 1..=7 {
        let record = store.load_mr(&key(n)).unwrap().unwrap();
        assert_eq!(record.status, MrStatus::Merged);
    }
}

#[tokio::test]
async fn test_engine_ignores_unknown_and_halted_projects() {
    let extra = r#"
[[projects]]
platform = "github"
owner = "acme"
repo = "widgets"
target_branches = ["main"]
"#;
    let mock = Arc::new(common::MockPlatformService::new());
    mock.add_mr(ready_mr(1));
    let mut platforms: HashMap<String, Arc<dyn PlatformService>> = HashMap::new();
    platforms.insert(PROJECT.to_string(), mock.clone());

    let engine = Engine::start(
        &engine_config(5, extra),
        platforms,
        Arc::new(MemoryStore::new()),
    );
    assert!(engine.halted_projects().contains_key("acme/widgets"));

    let halted = engine
        .submit(&MrEvent {
            project: "acme/widgets".to_string(),
            mr: 1,
        })
        .await
        .unwrap();
    assert!(matches!(halted, Submission::Ignored(_)));

    let unknown = engine
        .submit(&MrEvent {
            project: "other/repo".to_string(),
            mr: 1,
        })
        .await
        .unwrap();
    assert!(matches!(unknown, Submission::Ignored(_)));

    mock.update_mr(1, |m| m.target_branch = "release".to_string());
    let unmanaged = engine
        .submit(&MrEvent {
            project: PROJECT.to_string(),
            mr: 1,
        })
        .await
        .unwrap();
    assert!(matches!(unmanaged, Submission::Ignored(_)));

    engine.shutdown().await;
}

// =============================================================================
// CLI Tests
// =============================================================================

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let state_dir = dir.path().join("state");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        format!(
            r#"
automation_user = "{BOT}"
state_dir = "{}"

[[projects]]
platform = "gitlab"
owner = "group"
repo = "app"
target_branches = ["main"]
"#,
            state_dir.display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Merge queue orchestration"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_status_lists_lanes() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--config").arg(&config).arg("status");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("group/app@main"))
        .stdout(predicate::str::contains("no MRs"));
}

#[test]
fn test_audit_empty() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--config").arg(&config).args(["audit", "--limit", "5"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Audit log is empty."));
}

#[test]
fn test_reinstate_unknown_mr_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--config")
        .arg(&config)
        .args(["reinstate", "--project", "group/app", "42"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("no record for group/app!42"));
}

#[test]
fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("merge-assist").unwrap();
    cmd.arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}
