//! Job lifecycle state machine (§4.1). Checked in-process before every
//! status write so an illegal transition never reaches the store.

use shipctl_schemas::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidJobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl std::fmt::Display for InvalidJobTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job transition: {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidJobTransition {}

/// Validates `from -> to` against the allowed-transitions table (§4.1).
/// Pure and synchronous; callers persist the new status themselves on `Ok`.
pub fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), InvalidJobTransition> {
    use JobStatus::*;

    let allowed = matches!(
        (from, to),
        (Pending, Running) | (Pending, Cancelled) | (Pending, Failed)
            | (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
            | (Paused, Running) | (Paused, Cancelled)
    );

    if allowed {
        Ok(())
    } else {
        Err(InvalidJobTransition { from, to })
    }
}

pub fn is_terminal(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_running_is_allowed() {
        check_transition(JobStatus::Pending, JobStatus::Running).unwrap();
    }

    #[test]
    fn terminal_states_accept_no_further_transition() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(check_transition(terminal, JobStatus::Running).is_err());
        }
    }

    #[test]
    fn paused_cannot_go_straight_to_completed() {
        let err = check_transition(JobStatus::Paused, JobStatus::Completed).unwrap_err();
        assert_eq!(err.from, JobStatus::Paused);
    }
}
