//! Legal status transitions on the board.

use super::models::Status;

/// Targets reachable from `from` in a single move.
pub fn allowed_targets(from: Status) -> &'static [Status] {
    use Status::*;
    match from {
        NoStatus => &[Triage],
        Triage => &[Todo, Planning, NeedHuman, Done],
        Planning => &[Todo, NeedHuman, Done],
        Todo => &[InProgress],
        InProgress => &[AiReview, Planning, Done],
        AiReview => &[InReview, Done, Rejected, NeedHuman],
        Rejected => &[InProgress, NeedHuman],
        InReview => &[Done, Rejected],
        Done => &[],
        NeedHuman => &[Triage, Todo, Planning, Done],
    }
}

/// Whether `from → to` is a legal edge. Staying put is always legal.
pub fn is_valid(from: Status, to: Status) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_phase_outcome_is_a_legal_edge() {
        // triage
        for to in [Status::Todo, Status::Planning, Status::NeedHuman, Status::Done] {
            assert!(is_valid(Status::Triage, to));
        }
        // planning
        for to in [Status::Done, Status::Todo, Status::NeedHuman] {
            assert!(is_valid(Status::Planning, to));
        }
        // implement dispatch and outcomes
        assert!(is_valid(Status::Todo, Status::InProgress));
        assert!(is_valid(Status::Rejected, Status::InProgress));
        assert!(is_valid(Status::InProgress, Status::Done));
        assert!(is_valid(Status::InProgress, Status::Planning));
        // promote
        assert!(is_valid(Status::InProgress, Status::AiReview));
        // review
        for to in [Status::Done, Status::Rejected, Status::NeedHuman] {
            assert!(is_valid(Status::AiReview, to));
        }
    }

    #[test]
    fn done_is_terminal() {
        assert!(allowed_targets(Status::Done).is_empty());
        assert!(!is_valid(Status::Done, Status::Todo));
    }

    #[test]
    fn skipping_stages_is_rejected() {
        assert!(!is_valid(Status::Todo, Status::AiReview));
        assert!(!is_valid(Status::Triage, Status::InProgress));
        assert!(!is_valid(Status::NoStatus, Status::Todo));
    }

    #[test]
    fn self_transition_is_a_noop() {
        for status in Status::ALL {
            assert!(is_valid(status, status));
        }
    }
}
