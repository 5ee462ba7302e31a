//! Request status transition table
use super::error::RequestError;
use super::ledger::EventType;
use super::request::RequestStatus::{self, *};
use super::types::ActorRole;

/// Statuses reachable in one step from `from`. Terminal statuses reach nothing.
pub fn allowed_targets(from: RequestStatus) -> &'static [RequestStatus] {
    match from {
        Submitted => &[AdminApproved, Rejected, Cancelled],
        AdminApproved => &[Matched, Rejected, Cancelled],
        Matched => &[Completed, Cancelled],
        Completed | Rejected | Cancelled => &[],
    }
}

pub fn is_allowed(from: RequestStatus, to: RequestStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// What the state machine should do for a requested move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Already in the target status: succeed without writing.
    Replay,
    Apply { from: RequestStatus, to: RequestStatus },
}

pub fn plan(actual: RequestStatus, target: RequestStatus) -> Result<Plan, RequestError> {
    if actual == target {
        return Ok(Plan::Replay);
    }
    if actual.is_terminal() {
        return Err(RequestError::Terminal(actual));
    }
    if !is_allowed(actual, target) {
        return Err(RequestError::InvalidTransition {
            from: actual,
            to: target,
        });
    }
    Ok(Plan::Apply {
        from: actual,
        to: target,
    })
}

/// Ledger event recorded when a request enters `to`.
pub fn event_for(to: RequestStatus) -> EventType {
    match to {
        AdminApproved => EventType::AdminApprovedRequest,
        Rejected => EventType::AdminRejectedRequest,
        Completed => EventType::AdminMarkedCompleted,
        Cancelled => EventType::RequestCancelled,
        Matched => EventType::CardholderAccepted,
        Submitted => EventType::StatusChanged,
    }
}

/// Statuses from which `role` may cancel. Ownership is checked separately.
pub fn cancel_window(role: ActorRole) -> &'static [RequestStatus] {
    match role {
        ActorRole::Buyer => &[Submitted, AdminApproved],
        ActorRole::Cardholder => &[Matched],
        ActorRole::Admin => &[Submitted, AdminApproved, Matched],
    }
}
