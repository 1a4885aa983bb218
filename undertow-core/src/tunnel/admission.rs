//! Relay admission slots.
//!
//! Random slots are handed out first-come. Once they are full, joining
//! circuits compete on the initiator's ledger balance for the competing
//! slots; a richer newcomer evicts the poorest holder.

/// Outcome of a balance auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Competition {
    /// Slot taken; `evicted` must be destroyed by the caller.
    Accepted { evicted: Option<u32> },
    Rejected,
}

#[derive(Debug, Clone)]
pub struct SlotAllocator {
    random_slots: Vec<Option<u32>>,
    competing_slots: Vec<(i64, Option<u32>)>,
}

impl SlotAllocator {
    pub fn new(random: usize, competing: usize) -> Self {
        Self {
            random_slots: vec![None; random],
            competing_slots: vec![(0, None); competing],
        }
    }

    /// Occupies a free random slot.
    pub fn try_random(&mut self, circuit_id: u32) -> bool {
        match self.random_slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(circuit_id);
                true
            }
            None => false,
        }
    }

    pub fn has_free_random(&self) -> bool {
        self.random_slots.iter().any(Option::is_none)
    }

    /// Runs the auction for a circuit whose initiator reported `balance`.
    pub fn compete(&mut self, circuit_id: u32, balance: i64) -> Competition {
        if let Some(slot) = self.competing_slots.iter_mut().find(|(_, cid)| cid.is_none()) {
            *slot = (balance, Some(circuit_id));
            return Competition::Accepted { evicted: None };
        }
        let Some(poorest) = self
            .competing_slots
            .iter_mut()
            .min_by_key(|(stored, _)| *stored)
        else {
            return Competition::Rejected;
        };
        if balance > poorest.0 {
            let evicted = poorest.1.replace(circuit_id);
            poorest.0 = balance;
            Competition::Accepted { evicted }
        } else {
            Competition::Rejected
        }
    }

    /// Frees every slot held by `circuit_id`.
    pub fn release(&mut self, circuit_id: u32) {
        for slot in &mut self.random_slots {
            if *slot == Some(circuit_id) {
                *slot = None;
            }
        }
        for slot in &mut self.competing_slots {
            if slot.1 == Some(circuit_id) {
                *slot = (0, None);
            }
        }
    }

    pub fn contains(&self, circuit_id: u32) -> bool {
        self.random_slots.contains(&Some(circuit_id))
            || self.competing_slots.iter().any(|(_, cid)| *cid == Some(circuit_id))
    }

    pub fn random_slots(&self) -> &[Option<u32>] {
        &self.random_slots
    }

    pub fn competing_slots(&self) -> &[(i64, Option<u32>)] {
        &self.competing_slots
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_random_slots_first_come() {
        let mut slots = SlotAllocator::new(2, 0);
        assert!(slots.try_random(1));
        assert!(slots.try_random(2));
        assert!(!slots.has_free_random());
        assert!(!slots.try_random(3));
        slots.release(1);
        assert!(slots.try_random(3));
    }

    #[test]
    fn test_auction_evicts_poorest() {
        let mut slots = SlotAllocator::new(2, 2);
        slots.try_random(10);
        slots.try_random(11);
        assert_eq!(slots.compete(1, 100), Competition::Accepted { evicted: None });
        assert_eq!(slots.compete(2, 50), Competition::Accepted { evicted: None });

        assert_eq!(slots.compete(3, 70), Competition::Accepted { evicted: Some(2) });
        assert_eq!(slots.compete(4, 30), Competition::Rejected);
        assert_eq!(slots.competing_slots(), &[(100, Some(1)), (70, Some(3))]);
        // Equal balance does not evict.
        assert_eq!(slots.compete(5, 70), Competition::Rejected);
    }

    #[test]
    fn test_no_competing_slots_rejects() {
        let mut slots = SlotAllocator::new(0, 0);
        assert_eq!(slots.compete(1, i64::MAX), Competition::Rejected);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Random(u32),
        Compete(u32, i64),
        Release(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..40).prop_map(Op::Random),
            (0u32..40, -100i64..100).prop_map(|(c, b)| Op::Compete(c, b)),
            (0u32..40).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_slots_are_exclusive(ops in proptest::collection::vec(op(), 1..80)) {
            let mut slots = SlotAllocator::new(3, 4);
            for op in ops {
                match op {
                    Op::Random(cid) | Op::Compete(cid, _) if slots.contains(cid) => continue,
                    Op::Random(cid) => {
                        slots.try_random(cid);
                    }
                    Op::Compete(cid, balance) => {
                        slots.compete(cid, balance);
                    }
                    Op::Release(cid) => slots.release(cid),
                }
                for cid in slots.random_slots().iter().flatten() {
                    prop_assert!(!slots.competing_slots().iter().any(|(_, c)| *c == Some(*cid)));
                }
            }
        }
    }
}
