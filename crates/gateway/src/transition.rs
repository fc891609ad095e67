//! Pure session runtime-status transition function.
//!
//! No IO, no locking — the session actor calls this and then persists/
//! publishes the result. Fully unit-testable in isolation.

use harness_protocol::RuntimeStatus;

/// What can drive a runtime-status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A telemetry event resolved to one of the three live statuses.
    StatusHint(RuntimeStatus),
    /// The PTY adapter reported the child process exited.
    AdapterExited,
}

/// Applies one transition. Exit is terminal: once `Exited`, no `StatusHint`
/// moves the session until the id is recycled by a fresh `pty.start`.
pub fn transition(current: RuntimeStatus, input: Input) -> RuntimeStatus {
    if current == RuntimeStatus::Exited {
        return current;
    }
    match input {
        Input::AdapterExited => RuntimeStatus::Exited,
        Input::StatusHint(hint) => hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_moves_to_needs_input_on_hint() {
        let next = transition(RuntimeStatus::Running, Input::StatusHint(RuntimeStatus::NeedsInput));
        assert_eq!(next, RuntimeStatus::NeedsInput);
    }

    #[test]
    fn needs_input_moves_back_to_running() {
        let next = transition(RuntimeStatus::NeedsInput, Input::StatusHint(RuntimeStatus::Running));
        assert_eq!(next, RuntimeStatus::Running);
    }

    #[test]
    fn completed_moves_to_running_on_next_input() {
        let next = transition(RuntimeStatus::Completed, Input::StatusHint(RuntimeStatus::Running));
        assert_eq!(next, RuntimeStatus::Running);
    }

    #[test]
    fn adapter_exit_is_terminal() {
        let next = transition(RuntimeStatus::Running, Input::AdapterExited);
        assert_eq!(next, RuntimeStatus::Exited);
    }

    #[test]
    fn exited_ignores_further_status_hints() {
        let next = transition(RuntimeStatus::Exited, Input::StatusHint(RuntimeStatus::Running));
        assert_eq!(next, RuntimeStatus::Exited);
    }
}
