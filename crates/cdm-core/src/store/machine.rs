//! The download state machine.
//!
//! The transition table is closed: anything not listed here is rejected by
//! `Store::transition_state` and the row is left untouched.

use super::types::DownloadState;

/// True iff the edge `from -> to` is a legal transition.
pub fn transition_allowed(from: DownloadState, to: DownloadState) -> bool {
    use DownloadState::*;
    match from {
        Queued => matches!(to, Starting | Cancelled | Paused),
        Starting => matches!(to, Downloading | Failed | Cancelled | NeedsConfirmation),
        Downloading => matches!(to, Paused | Completed | Failed | Cancelled),
        Paused => matches!(to, Queued | Cancelled),
        Failed => matches!(to, Queued),
        Cancelled => matches!(to, Queued),
        // User-initiated re-download.
        Completed => matches!(to, Queued),
        NeedsConfirmation => matches!(to, Queued | Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DownloadState::*;

    const ALL: [DownloadState; 8] = [
        Queued,
        Starting,
        Downloading,
        Paused,
        Completed,
        Failed,
        Cancelled,
        NeedsConfirmation,
    ];

    /// The exact edge set from the design table; everything else is illegal.
    fn expected_edges() -> Vec<(DownloadState, DownloadState)> {
        vec![
            (Queued, Starting),
            (Queued, Cancelled),
            (Queued, Paused),
            (Starting, Downloading),
            (Starting, Failed),
            (Starting, Cancelled),
            (Starting, NeedsConfirmation),
            (Downloading, Paused),
            (Downloading, Completed),
            (Downloading, Failed),
            (Downloading, Cancelled),
            (Paused, Queued),
            (Paused, Cancelled),
            (Failed, Queued),
            (Cancelled, Queued),
            (Completed, Queued),
            (NeedsConfirmation, Queued),
            (NeedsConfirmation, Cancelled),
        ]
    }

    #[test]
    fn table_matches_design_exactly() {
        let edges = expected_edges();
        for from in ALL {
            for to in ALL {
                let expected = edges.contains(&(from, to));
                assert_eq!(
                    transition_allowed(from, to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn no_self_transitions() {
        for s in ALL {
            assert!(!transition_allowed(s, s), "{:?} -> {:?} must be illegal", s, s);
        }
    }

    #[test]
    fn completed_can_only_requeue() {
        for to in ALL {
            let ok = transition_allowed(Completed, to);
            assert_eq!(ok, to == Queued);
        }
    }
}
