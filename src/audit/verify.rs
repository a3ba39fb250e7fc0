//! Pure hash chain verification

use crate::crypto::compute_entry_hash;
use crate::domain::{AuditEntry, ChainFault, ChainVerification, Hash256};

/// Verify `entries`, expected to cover `from..=to` and to follow an entry
/// whose hash is `anchor`. Stops at the first fault and never repairs.
pub fn verify_entries(
    entries: &[AuditEntry],
    from: u64,
    to: u64,
    anchor: Hash256,
) -> ChainVerification {
    let mut result = ChainVerification {
        from_sequence: from,
        to_sequence: to,
        entries_checked: 0,
        intact: true,
        first_broken: None,
        fault: None,
    };

    let mut expected_sequence = from;
    let mut prev_hash = anchor;

    for entry in entries {
        if entry.sequence > to {
            break;
        }
        if entry.sequence != expected_sequence {
            return broken(
                result,
                expected_sequence,
                ChainFault::SequenceGap {
                    expected: expected_sequence,
                    found: entry.sequence,
                },
            );
        }
        if entry.prev_hash != prev_hash {
            return broken(result, entry.sequence, ChainFault::BrokenLink);
        }

        let recomputed = compute_entry_hash(
            entry.sequence,
            &entry.prev_hash,
            &entry.actor,
            entry.action,
            &entry.recorded_at,
            &entry.payload,
        );
        let hash_ok = matches!(recomputed, Ok(hash) if hash == entry.entry_hash);
        // The stored action must agree with the payload it labels.
        if !hash_ok || entry.action != entry.payload.action() {
            return broken(result, entry.sequence, ChainFault::HashMismatch);
        }

        result.entries_checked += 1;
        prev_hash = entry.entry_hash;
        expected_sequence += 1;
    }

    if expected_sequence <= to {
        return broken(
            result,
            expected_sequence,
            ChainFault::Missing {
                expected: expected_sequence,
            },
        );
    }

    result
}

fn broken(mut result: ChainVerification, sequence: u64, fault: ChainFault) -> ChainVerification {
    result.intact = false;
    result.first_broken = Some(sequence);
    result.fault = Some(fault);
    result
}
