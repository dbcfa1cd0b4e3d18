//! Booking lifecycle. The transition table below is the only authority on
//! which status may follow which; the store consults it before every write.

use serde::Serialize;

use crate::model::BookingStatus;

use BookingStatus::*;

/// Legal targets per source status. Every row includes itself.
pub fn allowed_targets(from: BookingStatus) -> &'static [BookingStatus] {
    match from {
        Pending => &[Pending, PendingAllocation, Confirmed, Cancelled],
        PendingAllocation => &[PendingAllocation, Confirmed, Cancelled],
        Confirmed => &[Confirmed, CheckedIn, Cancelled, NoShow],
        CheckedIn => &[CheckedIn, Completed, NoShow],
        Completed => &[Completed],
        Cancelled => &[Cancelled],
        NoShow => &[NoShow, Confirmed],
    }
}

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    allowed_targets(from).contains(&to)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionCheck {
    pub allowed: bool,
    /// `TRANSITION_NOT_ALLOWED` when refused.
    pub code: Option<&'static str>,
    pub allowed_targets: Vec<BookingStatus>,
}

pub fn validate_transition(from: BookingStatus, to: BookingStatus) -> TransitionCheck {
    let allowed = can_transition(from, to);
    TransitionCheck {
        allowed,
        code: (!allowed).then_some("TRANSITION_NOT_ALLOWED"),
        allowed_targets: allowed_targets(from).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus::*;

    /// The full expected table, written out independently of `allowed_targets`.
    fn expected(from: BookingStatus, to: BookingStatus) -> bool {
        matches!(
            (from, to),
            (Pending, Pending)
                | (Pending, PendingAllocation)
                | (Pending, Confirmed)
                | (Pending, Cancelled)
                | (PendingAllocation, PendingAllocation)
                | (PendingAllocation, Confirmed)
                | (PendingAllocation, Cancelled)
                | (Confirmed, Confirmed)
                | (Confirmed, CheckedIn)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (CheckedIn, CheckedIn)
                | (CheckedIn, Completed)
                | (CheckedIn, NoShow)
                | (Completed, Completed)
                | (Cancelled, Cancelled)
                | (NoShow, NoShow)
                | (NoShow, Confirmed)
        )
    }

    #[test]
    fn every_pair_matches_table() {
        for from in BookingStatus::ALL {
            for to in BookingStatus::ALL {
                let check = validate_transition(from, to);
                assert_eq!(check.allowed, expected(from, to), "{from} -> {to}");
                if check.allowed {
                    assert_eq!(check.code, None);
                } else {
                    assert_eq!(check.code, Some("TRANSITION_NOT_ALLOWED"));
                }
                let reported: Vec<BookingStatus> = BookingStatus::ALL
                    .into_iter()
                    .filter(|s| expected(from, *s))
                    .collect();
                let mut actual = check.allowed_targets.clone();
                actual.sort_by_key(|s| s.as_str());
                let mut reported = reported;
                reported.sort_by_key(|s| s.as_str());
                assert_eq!(actual, reported, "targets of {from}");
            }
        }
    }

    #[test]
    fn terminal_states_only_accept_self() {
        for terminal in [Completed, Cancelled] {
            for to in BookingStatus::ALL {
                assert_eq!(can_transition(terminal, to), to == terminal);
            }
        }
    }

    #[test]
    fn no_show_can_be_corrected() {
        assert!(validate_transition(NoShow, Confirmed).allowed);
        assert!(!validate_transition(NoShow, CheckedIn).allowed);
    }
}
