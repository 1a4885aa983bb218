//! Payout amounts for closed circuits.
//!
//! The initiator pays its first hop for the whole circuit. Every relay
//! keeps `2 * base` (one unit up, one down) and forwards the remainder;
//! the exit keeps the final `base`.

use super::circuit::CircuitType;
use crate::constants::PAYOUT_THRESHOLD;

/// Amount and base the initiator owes when it closes a circuit.
///
/// Returns `None` for circuit types that do not pay, or when less than
/// [`PAYOUT_THRESHOLD`] bytes came down.
pub fn initial_payout(ctype: CircuitType, bytes_down: u64, goal_hops: u8) -> Option<(u64, u32)> {
    if !ctype.pays_out() || bytes_down < PAYOUT_THRESHOLD {
        return None;
    }
    let hops = u64::from(goal_hops);
    let multiplier = match ctype {
        CircuitType::Data => (2 * hops).checked_sub(1)?,
        _ => 2 * hops + 1,
    };
    // The wire carries the base as u32; larger circuits are paid at the cap.
    let base = u32::try_from(bytes_down).unwrap_or(u32::MAX);
    Some((u64::from(base) * multiplier, base))
}

/// Remainder a relay passes on after keeping its share.
pub fn forward_amount(received: u64, base_amount: u32) -> Option<u64> {
    let kept = 2 * u64::from(base_amount);
    (received > kept).then(|| received - kept)
}

/// Amounts each hop receives along a circuit of `hops` relays.
pub fn payout_chain(amount: u64, base_amount: u32, hops: usize) -> Vec<u64> {
    let mut chain = Vec::with_capacity(hops);
    let mut next = Some(amount);
    while let Some(received) = next
        && chain.len() < hops
    {
        chain.push(received);
        next = forward_amount(received, base_amount);
    }
    chain
}
