//! Result contract between a phase and the coding agent.
//!
//! Each phase owns one marker key. The agent ends its transcript with a line
//! `KEY=VALUE` naming one value from the phase's vocabulary, optionally
//! preceded by `RATIONALE: <text>`. Anything else is `Unclear`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*([A-Z][A-Z_]*)[ \t]*=[ \t]*([A-Za-z_]+)[ \t]*$").unwrap());

static RATIONALE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*RATIONALE:[ \t]*(.+?)[ \t]*$").unwrap());

/// Pipeline stage backed by an agent pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Triage,
    Planning,
    Implement,
    Review,
    Audit,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Triage,
        Phase::Planning,
        Phase::Implement,
        Phase::Review,
        Phase::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Triage => "triage",
            Phase::Planning => "planning",
            Phase::Implement => "implement",
            Phase::Review => "review",
            Phase::Audit => "audit",
        }
    }

    /// Marker key the agent must emit; audit has none.
    pub fn marker_key(&self) -> Option<&'static str> {
        match self {
            Phase::Triage => Some("TRIAGE_RESULT"),
            Phase::Planning => Some("PLAN_RESULT"),
            Phase::Implement => Some("RESULT"),
            Phase::Review => Some("REVIEW_RESULT"),
            Phase::Audit => None,
        }
    }

    /// Values accepted for this phase's marker.
    pub fn vocabulary(&self) -> &'static [Marker] {
        match self {
            Phase::Triage => &[Marker::Todo, Marker::Planning, Marker::NeedHuman, Marker::Closed],
            Phase::Planning => &[Marker::Closed, Marker::Revised, Marker::Escalate],
            Phase::Implement => &[Marker::Implemented, Marker::Unnecessary, Marker::NeedsPlanning],
            Phase::Review => &[Marker::Approved, Marker::Rejected],
            Phase::Audit => &[],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown phase '{}'", s))
    }
}

/// Terminal marker values across all phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    Todo,
    Planning,
    NeedHuman,
    Closed,
    Revised,
    Escalate,
    Implemented,
    Unnecessary,
    NeedsPlanning,
    Approved,
    Rejected,
}

impl Marker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::Todo => "TODO",
            Marker::Planning => "PLANNING",
            Marker::NeedHuman => "NEED_HUMAN",
            Marker::Closed => "CLOSED",
            Marker::Revised => "REVISED",
            Marker::Escalate => "ESCALATE",
            Marker::Implemented => "IMPLEMENTED",
            Marker::Unnecessary => "UNNECESSARY",
            Marker::NeedsPlanning => "NEEDS_PLANNING",
            Marker::Approved => "APPROVED",
            Marker::Rejected => "REJECTED",
        }
    }
}

/// What the transcript said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Recognized {
        marker: Marker,
        rationale: Option<String>,
    },
    /// No value, several different values, or a value outside the vocabulary.
    Unclear { reason: String },
}

impl AgentOutcome {
    pub fn marker(&self) -> Option<Marker> {
        match self {
            AgentOutcome::Recognized { marker, .. } => Some(*marker),
            AgentOutcome::Unclear { .. } => None,
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match self {
            AgentOutcome::Recognized { rationale, .. } => rationale.as_deref(),
            AgentOutcome::Unclear { .. } => None,
        }
    }
}

/// Extract the outcome of a `phase` invocation from its transcript.
pub fn parse_outcome(phase: Phase, transcript: &str) -> AgentOutcome {
    let Some(key) = phase.marker_key() else {
        return AgentOutcome::Unclear {
            reason: format!("{} has no result vocabulary", phase),
        };
    };

    let mut values: Vec<String> = Vec::new();
    for cap in MARKER_REGEX.captures_iter(transcript) {
        if &cap[1] != key {
            continue;
        }
        let value = cap[2].to_ascii_uppercase();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    match values.as_slice() {
        [] => AgentOutcome::Unclear {
            reason: format!("no {} marker", key),
        },
        [value] => match phase.vocabulary().iter().find(|m| m.as_str() == value) {
            Some(marker) => AgentOutcome::Recognized {
                marker: *marker,
                rationale: RATIONALE_REGEX
                    .captures_iter(transcript)
                    .last()
                    .map(|cap| cap[1].to_string()),
            },
            None => AgentOutcome::Unclear {
                reason: format!("unknown {} value {}", key, value),
            },
        },
        many => AgentOutcome::Unclear {
            reason: format!("conflicting {} values: {}", key, many.join(", ")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_a_single_marker() {
        let transcript = "Looked at the code.\nAll tests pass.\nRESULT=IMPLEMENTED\n";
        assert_eq!(
            parse_outcome(Phase::Implement, transcript),
            AgentOutcome::Recognized {
                marker: Marker::Implemented,
                rationale: None
            }
        );
    }

    #[test]
    fn carries_rationale() {
        let transcript = "RATIONALE: Missing null check in handler\nREVIEW_RESULT=REJECTED";
        let outcome = parse_outcome(Phase::Review, transcript);
        assert_eq!(outcome.marker(), Some(Marker::Rejected));
        assert_eq!(outcome.rationale(), Some("Missing null check in handler"));
    }

    #[test]
    fn missing_marker_is_unclear() {
        let outcome = parse_outcome(Phase::Triage, "I think this should be done soon.");
        assert!(matches!(outcome, AgentOutcome::Unclear { .. }));
    }

    #[test]
    fn conflicting_markers_are_unclear() {
        let outcome = parse_outcome(Phase::Review, "REVIEW_RESULT=APPROVED\nREVIEW_RESULT=REJECTED\n");
        match outcome {
            AgentOutcome::Unclear { reason } => assert!(reason.contains("conflicting")),
            other => panic!("expected unclear, got {:?}", other),
        }
    }

    #[test]
    fn repeated_identical_marker_is_accepted() {
        let outcome = parse_outcome(Phase::Planning, "PLAN_RESULT=REVISED\n...\nPLAN_RESULT=REVISED\n");
        assert_eq!(outcome.marker(), Some(Marker::Revised));
    }

    #[test]
    fn other_phases_markers_are_ignored() {
        // A review marker inside an implement transcript does not count.
        let outcome = parse_outcome(Phase::Implement, "REVIEW_RESULT=APPROVED\n");
        assert!(matches!(outcome, AgentOutcome::Unclear { .. }));
    }

    #[test]
    fn value_outside_vocabulary_is_unclear() {
        let outcome = parse_outcome(Phase::Triage, "TRIAGE_RESULT=APPROVED\n");
        match outcome {
            AgentOutcome::Unclear { reason } => assert!(reason.contains("unknown")),
            other => panic!("expected unclear, got {:?}", other),
        }
    }

    #[test]
    fn marker_must_be_on_its_own_line() {
        let outcome = parse_outcome(Phase::Implement, "I would write RESULT=IMPLEMENTED here\n");
        assert!(matches!(outcome, AgentOutcome::Unclear { .. }));
    }

    #[test]
    fn value_case_is_normalized() {
        let outcome = parse_outcome(Phase::Triage, "  TRIAGE_RESULT = need_human  \n");
        assert_eq!(outcome.marker(), Some(Marker::NeedHuman));
    }

    #[test]
    fn audit_has_no_vocabulary() {
        assert!(Phase::Audit.marker_key().is_none());
        assert!(matches!(parse_outcome(Phase::Audit, "RESULT=IMPLEMENTED"), AgentOutcome::Unclear { .. }));
    }

    #[test]
    fn phase_parse() {
        assert_eq!("Review".parse::<Phase>().unwrap(), Phase::Review);
        assert!("promote".parse::<Phase>().is_err());
    }
}
