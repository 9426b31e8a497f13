//! Request status and its transition rules
//!
//! A request only ever moves forward: Queued -> Processing -> Done. Status
//! writers in every store go through [`Status::transition`] so that an
//! out-of-order update is rejected rather than silently applied.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Processing,
    Done,
}

/// Result of applying a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved forward.
    Applied,
    /// The record was already in the target state; nothing was written.
    Unchanged,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done)
    }

    /// Check a move from `self` to `to` for the given request.
    pub fn transition(self, request_id: Uuid, to: Status) -> Result<Transition> {
        match self.cmp(&to) {
            std::cmp::Ordering::Less => Ok(Transition::Applied),
            std::cmp::Ordering::Equal => Ok(Transition::Unchanged),
            std::cmp::Ordering::Greater => Err(Error::InvalidTransition {
                request_id,
                from: self,
                to,
            }),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "done" => Ok(Status::Done),
            other => Err(Error::Invariant(format!("unknown status '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_apply() {
        let id = Uuid::new_v4();
        assert_eq!(
            Status::Queued.transition(id, Status::Processing).unwrap(),
            Transition::Applied
        );
        assert_eq!(
            Status::Processing.transition(id, Status::Done).unwrap(),
            Transition::Applied
        );
        assert_eq!(
            Status::Queued.transition(id, Status::Done).unwrap(),
            Transition::Applied
        );
    }

    #[test]
    fn test_same_state_is_unchanged() {
        let id = Uuid::new_v4();
        for status in [Status::Queued, Status::Processing, Status::Done] {
            assert_eq!(status.transition(id, status).unwrap(), Transition::Unchanged);
        }
    }

    #[test]
    fn test_regression_is_rejected() {
        let id = Uuid::new_v4();
        let err = Status::Done.transition(id, Status::Queued).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Status::Done,
                to: Status::Queued,
                ..
            }
        ));
        assert!(Status::Done.transition(id, Status::Processing).is_err());
        assert!(Status::Processing.transition(id, Status::Queued).is_err());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [Status::Queued, Status::Processing, Status::Done] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("failed".parse::<Status>().is_err());
        assert_eq!(serde_json::to_string(&Status::Processing).unwrap(), "\"processing\"");
    }
}
