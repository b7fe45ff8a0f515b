//! Comment templates posted on MRs
//!
//! Every comment ends with the same signature so users can tell engine
//! comments from human ones.

use crate::types::{MrKey, PipelineStatus};
use std::fmt::Write as _;

/// Footer appended to every comment
pub const SIGNATURE: &str = "\n\n---\n*Posted by Merge Assist* 🤖";

fn sign(message: &str) -> String {
    format!("{message}{SIGNATURE}")
}

fn bullets(items: &[String]) -> String {
    items.iter().fold(String::new(), |mut out, item| {
        let _ = writeln!(out, "- {item}");
        out
    })
}

fn mr_refs(keys: &[MrKey]) -> String {
    keys.iter()
        .map(|k| format!("!{}", k.number))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Not-ready verdict with the attempt counter
pub fn not_ready(reasons: &[String], strikes: u32, threshold: u32) -> String {
    sign(&format!(
        "## ⚠️ MR Not Ready for Merge\n\n\
         **Attempt {strikes}/{threshold}**\n\n\
         This merge request is not ready to be merged. Please address the following issues:\n\n\
         {}\n\
         Once these issues are resolved, I will automatically attempt to merge again.",
        bullets(reasons)
    ))
}

/// Terminal rejection
pub fn rejected(reasons: &[String], strikes: u32) -> String {
    sign(&format!(
        "## ❌ MR Rejected\n\n\
         This merge request has been rejected after {strikes} attempts due to persistent issues:\n\n\
         {}\n\
         **Action Required**: Please fix the issues and ask an operator to reinstate this MR.",
        bullets(reasons)
    ))
}

/// Member added to a batch whose proof MR is now running
pub fn batch_in_progress(proof_mr: u64) -> String {
    sign(&format!(
        "## 🔄 Batch Merge in Progress\n\n\
         This MR is part of a batch merge operation.\n\n\
         **Batch MR**: !{proof_mr}\n\n\
         I'm waiting for the batch pipeline to complete. Once successful, this MR will be merged automatically."
    ))
}

/// Proof pipeline passed
pub fn batch_validated(proof_mr: u64) -> String {
    sign(&format!(
        "## ✅ Batch Validated\n\n\
         The batch pipeline on !{proof_mr} passed. This MR will now be rebased and merged individually."
    ))
}

/// Member dropped from a batch before the proof pipeline
pub fn batch_excluded(reason: &str) -> String {
    sign(&format!(
        "## ↩️ Removed from Batch\n\n\
         This MR could not be added to the current batch:\n\n\
         **Reason**: {reason}\n\n\
         It stays in the merge queue and will be picked up again. No attempt was counted against it."
    ))
}

/// Batch failed for reasons shared by all members
pub fn batch_failed(reason: &str, proof_mr: Option<u64>) -> String {
    let proof = proof_mr.map_or_else(String::new, |n| format!("**Batch MR**: !{n}\n\n"));
    sign(&format!(
        "## ⚠️ Batch Merge Failed\n\n\
         {proof}The batch this MR was part of failed:\n\n\
         **Reason**: {reason}\n\n\
         This MR has been returned to the merge queue. No attempt was counted against it."
    ))
}

/// Merged, alone or as a batch member
pub fn merged(batch: bool) -> String {
    if batch {
        sign(
            "## ✅ Successfully Merged (Batch)\n\n\
             This MR has been merged as part of a batch merge operation.",
        )
    } else {
        sign("## ✅ Successfully Merged\n\nThis MR has been automatically merged.")
    }
}

/// Rebase reported an error
pub fn rebase_failed(error: &str) -> String {
    sign(&format!(
        "## ⚠️ Rebase Failed\n\n\
         Automatic rebase with the target branch failed.\n\n\
         **Error**: {error}\n\n\
         **Action Required**: Please manually rebase this MR with the target branch."
    ))
}

/// Pipeline after the rebase did not pass
pub fn pipeline_failed(status: Option<PipelineStatus>, timed_out: bool) -> String {
    let detail = if timed_out {
        "The pipeline did not finish before the timeout.".to_string()
    } else {
        match status {
            Some(status) => format!("The pipeline finished with status `{status}`."),
            None => "No pipeline ran for the rebased commit.".to_string(),
        }
    };
    sign(&format!(
        "## ⚠️ Merge Pipeline Failed\n\n\
         {detail}\n\n\
         The MR was not merged."
    ))
}

/// The merge call itself was refused
pub fn merge_refused(message: &str) -> String {
    sign(&format!(
        "## ⚠️ Merge Failed\n\n\
         The merge was refused by the server:\n\n\
         ```\n{message}\n```"
    ))
}

/// Unexpected error while processing the MR
pub fn error(message: &str) -> String {
    sign(&format!(
        "## ⚠️ Error Occurred\n\n\
         An error occurred while processing this MR:\n\n\
         ```\n{message}\n```\n\n\
         The MR stays in the merge queue and will be retried."
    ))
}

/// Description of a proof MR
pub fn proof_description(members: &[MrKey]) -> String {
    let list: Vec<String> = members.iter().map(|k| format!("!{}", k.number)).collect();
    sign(&format!(
        "Batch validation for:\n\n{}\n\
         This merge request only runs the combined pipeline. It will never be merged.",
        bullets(&list)
    ))
}

/// Title of a proof MR
pub fn proof_title(members: &[MrKey]) -> String {
    format!("[Merge Assist Batch] {}", mr_refs(members))
}
