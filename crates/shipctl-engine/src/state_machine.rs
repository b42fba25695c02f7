//! JobRow state machine (§3 JobRow, §4.2.1). Mirrors the durable transitions
//! C1 enforces at the SQL layer, but checked in-process first so an illegal
//! transition halts the batch before a bad write ever reaches the store.
//!
//! Idempotent replay: `apply` accepts an optional `event_id`; a repeat of
//! an already-applied event is a silent no-op, so replaying the same event
//! log after a crash converges to the same state.

use std::collections::HashSet;

use shipctl_schemas::RowStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum RowEvent {
    Checkpoint,
    Complete { tracking: String },
    Fail { code: String },
    MarkAmbiguous,
    Skip,
    MarkNeedsReview,
    /// Resets a `completed`/`failed`/`needs_review` row back to `pending`.
    /// Only reachable through an operator-confirmed restart (§4.2.8); never
    /// emitted by ordinary row processing.
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTransitionError {
    pub from: RowStatus,
    pub event: String,
}

impl std::fmt::Display for RowTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal job_row transition: {:?} + {}", self.from, self.event)
    }
}

impl std::error::Error for RowTransitionError {}

#[derive(Debug, Clone)]
pub struct JobRowMachine {
    pub status: RowStatus,
    applied: HashSet<String>,
}

impl JobRowMachine {
    pub fn new(status: RowStatus) -> Self {
        Self {
            status,
            applied: HashSet::new(),
        }
    }

    pub fn apply(&mut self, event: &RowEvent, event_id: Option<&str>) -> Result<(), RowTransitionError> {
        if let Some(id) = event_id {
            if self.applied.contains(id) {
                return Ok(());
            }
        }

        self.do_transition(event)?;

        if let Some(id) = event_id {
            self.applied.insert(id.to_string());
        }
        Ok(())
    }

    fn do_transition(&mut self, event: &RowEvent) -> Result<(), RowTransitionError> {
        use RowEvent::*;
        use RowStatus::*;

        match (self.status, event) {
            (Pending, Checkpoint) => self.status = InFlight,

            (InFlight, Complete { .. }) => self.status = Completed,
            (InFlight, Fail { .. }) => self.status = Failed,
            (InFlight, MarkAmbiguous) => {} // stays in_flight; recovery coordinator resolves it

            (Pending, Skip) => self.status = Skipped,

            (InFlight, MarkNeedsReview) => self.status = NeedsReview,

            // Operator-confirmed restart: the one transition not reachable
            // through ordinary row lifecycle (§4.2.8).
            (Completed | Failed | NeedsReview, Restart) => self.status = Pending,

            (state, ev) => {
                return Err(RowTransitionError {
                    from: state,
                    event: format!("{ev:?}"),
                })
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_in_flight_to_completed() {
        let mut m = JobRowMachine::new(RowStatus::Pending);
        m.apply(&RowEvent::Checkpoint, Some("e1")).unwrap();
        assert_eq!(m.status, RowStatus::InFlight);
        m.apply(&RowEvent::Complete { tracking: "1Z1".into() }, Some("e2")).unwrap();
        assert_eq!(m.status, RowStatus::Completed);
    }

    #[test]
    fn checkpoint_is_idempotent_under_replay() {
        let mut m = JobRowMachine::new(RowStatus::Pending);
        m.apply(&RowEvent::Checkpoint, Some("e1")).unwrap();
        m.apply(&RowEvent::Checkpoint, Some("e1")).unwrap();
        assert_eq!(m.status, RowStatus::InFlight);
    }

    #[test]
    fn completed_row_cannot_be_checkpointed_again() {
        let mut m = JobRowMachine::new(RowStatus::Completed);
        let err = m.apply(&RowEvent::Checkpoint, Some("e2")).unwrap_err();
        assert_eq!(err.from, RowStatus::Completed);
    }

    #[test]
    fn restart_resets_completed_row_to_pending() {
        let mut m = JobRowMachine::new(RowStatus::Completed);
        m.apply(&RowEvent::Restart, Some("r1")).unwrap();
        assert_eq!(m.status, RowStatus::Pending);
    }

    #[test]
    fn restart_is_not_legal_from_pending() {
        let mut m = JobRowMachine::new(RowStatus::Pending);
        let err = m.apply(&RowEvent::Restart, Some("r1")).unwrap_err();
        assert_eq!(err.from, RowStatus::Pending);
    }
}
