//! Appointment state machine.
//!
//! Every status change goes through [`apply`], so the only reachable edges are
//! the ones listed in [`Transition::sources`]:
//!
//! ```text
//! pending   -> confirmed | rejected | cancelled
//! confirmed -> finalized | cancelled
//! ```
//!
//! `rejected`, `cancelled` and `finalized` are terminal. Timing rules take the
//! current instant as a parameter so callers and tests control the clock.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::AppointmentStatus;

/// How far ahead a client must be when cancelling their own booking.
pub const CLIENT_CANCEL_MIN_HOURS: i64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Reject,
    Cancel,
    Finalize,
}

impl Transition {
    pub const ALL: [Transition; 4] = [
        Transition::Confirm,
        Transition::Reject,
        Transition::Cancel,
        Transition::Finalize,
    ];

    pub fn target(self) -> AppointmentStatus {
        match self {
            Transition::Confirm => AppointmentStatus::Confirmed,
            Transition::Reject => AppointmentStatus::Rejected,
            Transition::Cancel => AppointmentStatus::Cancelled,
            Transition::Finalize => AppointmentStatus::Finalized,
        }
    }

    pub fn sources(self) -> &'static [AppointmentStatus] {
        match self {
            Transition::Confirm | Transition::Reject => &[AppointmentStatus::Pending],
            Transition::Cancel => &[AppointmentStatus::Pending, AppointmentStatus::Confirmed],
            Transition::Finalize => &[AppointmentStatus::Confirmed],
        }
    }

    /// The transition that moves an appointment into `status`, if any.
    pub fn into_status(status: AppointmentStatus) -> Option<Transition> {
        Transition::ALL
            .into_iter()
            .find(|transition| transition.target() == status)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot move an appointment from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Appointments can only be cancelled at least {min_hours} hours in advance")]
    CancellationWindowClosed { min_hours: i64 },

    #[error("The appointment time must be in the future")]
    NotInFuture,
}

pub fn apply(
    current: AppointmentStatus,
    transition: Transition,
) -> Result<AppointmentStatus, LifecycleError> {
    if transition.sources().contains(&current) {
        Ok(transition.target())
    } else {
        Err(LifecycleError::InvalidTransition {
            from: current,
            to: transition.target(),
        })
    }
}

/// Whether an edge `from -> to` exists. Staying in place is not an edge.
pub fn can_move(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    Transition::into_status(to).is_some_and(|transition| apply(from, transition).is_ok())
}

pub fn ensure_in_future(
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    if scheduled_at > now {
        Ok(())
    } else {
        Err(LifecycleError::NotInFuture)
    }
}

pub fn ensure_client_may_cancel(
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    if scheduled_at - now >= Duration::hours(CLIENT_CANCEL_MIN_HOURS) {
        Ok(())
    } else {
        Err(LifecycleError::CancellationWindowClosed {
            min_hours: CLIENT_CANCEL_MIN_HOURS,
        })
    }
}
