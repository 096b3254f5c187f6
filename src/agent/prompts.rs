//! Phase instructions handed to the coding agent.

use crate::board::{ChangeRequest, ItemDetail, Status, WorkItem};

use super::Phase;

fn item_context(item: &WorkItem, detail: &ItemDetail) -> String {
    let mut out = format!("## Issue #{}: {}\n\n", item.id, detail.title);
    if !detail.labels.is_empty() {
        out.push_str(&format!("Labels: {}\n\n", detail.labels.join(", ")));
    }
    if detail.body.trim().is_empty() {
        out.push_str("(no description)\n");
    } else {
        out.push_str(detail.body.trim());
        out.push('\n');
    }
    if !detail.comments.is_empty() {
        out.push_str("\n## Recent comments\n\n");
        for comment in &detail.comments {
            out.push_str(&format!("**{}**: {}\n\n", comment.author, comment.body.trim()));
        }
    }
    out
}

fn result_contract(phase: Phase, meanings: &[(&str, &str)]) -> String {
    let key = phase.marker_key().unwrap_or("RESULT");
    let mut out = String::from("\n## Reporting your result\n\nFinish with a line `RATIONALE: <one sentence>` followed by exactly one result line:\n\n");
    for (value, meaning) in meanings {
        out.push_str(&format!("- `{}={}`: {}\n", key, value, meaning));
    }
    out.push_str("\nEmit the result line once, on its own line, with nothing else on it.\n");
    out
}

pub fn triage(item: &WorkItem, detail: &ItemDetail) -> String {
    format!(
        "You are triaging a newly reported issue for this repository. Read the issue, inspect the \
         relevant code, and decide where it goes next. Do not change any files.\n\n{}{}",
        item_context(item, detail),
        result_contract(
            Phase::Triage,
            &[
                ("TODO", "clear and small enough to implement directly"),
                ("PLANNING", "valid but needs design or breaking down first"),
                ("NEED_HUMAN", "needs a product decision or information only a human has"),
                ("CLOSED", "duplicate, already fixed, or not actionable"),
            ],
        )
    )
}

pub fn planning(item: &WorkItem, detail: &ItemDetail) -> String {
    format!(
        "You are planning an issue before implementation. Investigate the code, then rewrite the \
         issue body as a concrete plan (files to touch, approach, acceptance criteria) using \
         `gh issue edit {}`. Split it into follow-up issues if it is too large for one change.\n\n{}{}",
        item.id,
        item_context(item, detail),
        result_contract(
            Phase::Planning,
            &[
                ("REVISED", "the issue now holds an implementable plan"),
                ("CLOSED", "the work is unnecessary or has been split into other issues"),
                ("ESCALATE", "a human must decide before anyone can proceed"),
            ],
        )
    )
}

pub fn implement(item: &WorkItem, detail: &ItemDetail, branch: &str, change_request: &ChangeRequest) -> String {
    let rework = if item.status == Status::Rejected {
        format!(
            "\nThis change was rejected in review. Read the review comments on change request #{} \
             and address every point before anything else.\n",
            change_request.number
        )
    } else {
        String::new()
    };
    format!(
        "You are implementing an issue. You are on branch `{}`, which backs draft change request \
         #{}. Make the change, add or update tests, run them, commit, and push. When the work is \
         complete and tests pass, mark the change request ready with `gh pr ready {}`.\n{}\n{}{}",
        branch,
        change_request.number,
        change_request.number,
        rework,
        item_context(item, detail),
        result_contract(
            Phase::Implement,
            &[
                ("IMPLEMENTED", "the change is pushed and the change request is ready for review"),
                ("UNNECESSARY", "nothing needs to change"),
                ("NEEDS_PLANNING", "the issue is too unclear or too large to implement as written"),
            ],
        )
    )
}

pub fn review(item: &WorkItem, detail: &ItemDetail, change_request: &ChangeRequest, base_ref: &str, bounces: u32) -> String {
    let history = if bounces > 0 {
        format!("\nThis change has already been rejected {} time(s).\n", bounces)
    } else {
        String::new()
    };
    format!(
        "You are reviewing change request #{} for the issue below. The working copy holds the \
         change rebased onto `{}`; review `git diff {}...HEAD` only. Check correctness, tests, and \
         that the issue is fully addressed. Do not push.\n{}\n{}{}",
        change_request.number,
        base_ref,
        base_ref,
        history,
        item_context(item, detail),
        result_contract(
            Phase::Review,
            &[
                ("APPROVED", "ready to merge as is"),
                ("REJECTED", "must change; the rationale is sent back to the implementer"),
            ],
        )
    )
}

/// Audit prompt with the current titles per status so the agent does not
/// file duplicates.
pub fn audit(board: &[(Status, Vec<String>)]) -> String {
    let mut snapshot = String::new();
    for (status, titles) in board {
        if titles.is_empty() {
            continue;
        }
        snapshot.push_str(&format!("### {}\n", status));
        for title in titles {
            snapshot.push_str(&format!("- {}\n", title));
        }
        snapshot.push('\n');
    }
    if snapshot.is_empty() {
        snapshot.push_str("(the board is empty)\n");
    }
    format!(
        "You are auditing this repository for bugs, missing tests, and risky code. File at most \
         three new issues with `gh issue create`, each specific and actionable. Do not file \
         anything that duplicates an existing item:\n\n{}",
        snapshot
    )
}
