//! The machine lifecycle state machine. Every status write in the crate
//! flows through [`validate`]; nothing else may touch the stored status.

use crate::{
    error::{Error, Result},
    resources::machine::MachineStatus,
};

/// Terminal states admit no outgoing transitions.
pub fn is_terminal(status: MachineStatus) -> bool {
    matches!(status, MachineStatus::Failed | MachineStatus::Completed)
}

/// A settled machine is anything a waiter should stop blocking on: the
/// health check has resolved (running or failed) or an operator has already
/// intervened (stopped).
pub fn is_settled(status: MachineStatus) -> bool {
    !matches!(status, MachineStatus::Pending)
}

/// Check one transition against the legal set. `from` is `None` when no
/// record exists yet for the machine.
///
/// Creation commits `Pending` on boot success and `Failed` on boot failure;
/// the supervisor resolves `Pending` to `Running` or `Failed`; operators
/// move machines between `Running` and `Stopped`. A start request on an
/// already-running machine is a legal re-entrant write.
pub fn validate(from: Option<MachineStatus>, to: MachineStatus) -> Result<()> {
    use MachineStatus::*;

    let legal = match (from, to) {
        (None, Pending) | (None, Failed) => true,
        (Some(Pending), Running) | (Some(Pending), Failed) => true,
        (Some(Running), Running) | (Some(Running), Stopped) => true,
        (Some(Stopped), Running) => true,
        _ => false,
    };

    if legal {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}
