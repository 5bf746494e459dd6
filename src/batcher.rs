//! # Address Batching for FC04 Reads
//!
//! Coalesces the descriptors of a [`RegisterSet`] into contiguous read groups
//! so that one FC04 request fetches several floats at once.
//!
//! ## How It Works
//!
//! Descriptors are sorted by address (ties broken by key). Walking that list,
//! a descriptor joins the open group when:
//! - its address is exactly `start + 2 * group_len` (no gap), and
//! - the span after adding it stays within the configured maximum.
//!
//! Otherwise the open group is emitted and a new one starts. Groups are
//! computed once per engine, not per cycle.
//!
//! ## Example
//!
//! ```rust
//! use sdm630_poller::{build_groups, RegisterSet, RegisterTier};
//!
//! let set = RegisterSet::tier(RegisterTier::Basic);
//! let groups = build_groups(&set, 4).unwrap();
//!
//! assert_eq!(groups[0].start_address, 0);
//! assert_eq!(groups[0].keys, vec!["phase_1_l_n_volts", "phase_2_l_n_volts"]);
//! assert!(groups.iter().all(|g| g.register_count() <= 4));
//! ```

use crate::catalog::{RegisterDescriptor, RegisterSet};
use crate::constants::{MAX_READ_REGISTERS, REGISTERS_PER_FLOAT};
use crate::error::{ModbusError, ModbusResult};

/// Smallest usable batch: one float.
pub const MIN_REGISTERS_PER_READ: u16 = REGISTERS_PER_FLOAT;

/// One contiguous FC04 read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroup {
    /// First register of the read.
    pub start_address: u16,
    /// Keys in ascending address order; key `i` sits at `start_address + 2i`.
    pub keys: Vec<String>,
}

impl AddressGroup {
    fn open(descriptor: &RegisterDescriptor) -> Self {
        Self {
            start_address: descriptor.address,
            keys: vec![descriptor.key.clone()],
        }
    }

    /// Number of registers to request.
    #[inline]
    pub fn register_count(&self) -> u16 {
        // Bounded by MAX_READ_REGISTERS at construction.
        (self.keys.len() as u16) * REGISTERS_PER_FLOAT
    }

    /// Address just past the last register of the group.
    #[inline]
    pub fn end_address(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.register_count())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Partition `set` into read groups of at most `max_registers_per_read`
/// registers.
///
/// # Errors
///
/// [`ModbusError::Configuration`] when `max_registers_per_read` is outside
/// `2..=125`.
pub fn build_groups(set: &RegisterSet, max_registers_per_read: u16) -> ModbusResult<Vec<AddressGroup>> {
    if !(MIN_REGISTERS_PER_READ..=MAX_READ_REGISTERS).contains(&max_registers_per_read) {
        return Err(ModbusError::configuration(format!(
            "max_registers_per_read must be {}-{}, got {}",
            MIN_REGISTERS_PER_READ, MAX_READ_REGISTERS, max_registers_per_read
        )));
    }

    // Sort references, the set keeps ownership
    let mut ordered: Vec<&RegisterDescriptor> = set.iter().collect();
    ordered.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.key.cmp(&b.key)));

    let max_span = u32::from(max_registers_per_read);
    let mut groups = Vec::new();
    let mut current: Option<AddressGroup> = None;

    for descriptor in ordered {
        current = match current.take() {
            Some(mut group) => {
                let extended_span = u32::from(group.register_count()) + u32::from(REGISTERS_PER_FLOAT);
                if u32::from(descriptor.address) == group.end_address() && extended_span <= max_span {
                    group.keys.push(descriptor.key.clone());
                    Some(group)
                } else {
                    groups.push(group);
                    Some(AddressGroup::open(descriptor))
                }
            }
            None => Some(AddressGroup::open(descriptor)),
        };
    }

    if let Some(group) = current {
        groups.push(group);
    }

    Ok(groups)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::WordOrder;
    use crate::catalog::{RegisterTier, StateClass};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn descriptor(key: &str, address: u16) -> RegisterDescriptor {
        RegisterDescriptor {
            key: key.to_string(),
            address,
            name: key.to_string(),
            unit: None,
            device_class: None,
            state_class: StateClass::Measurement,
            precision: 2,
            word_order: WordOrder::AB,
        }
    }

    fn set_of(pairs: &[(&str, u16)]) -> RegisterSet {
        let registers = pairs.iter().map(|(k, a)| descriptor(k, *a)).collect();
        RegisterSet::new("test", registers).unwrap()
    }

    #[test]
    fn test_gap_and_limit_split() {
        let set = set_of(&[("k0", 0), ("k1", 2), ("k2", 4), ("k3", 8)]);
        let groups = build_groups(&set, 4).unwrap();

        assert_eq!(
            groups,
            vec![
                AddressGroup { start_address: 0, keys: vec!["k0".into(), "k1".into()] },
                AddressGroup { start_address: 4, keys: vec!["k2".into()] },
                AddressGroup { start_address: 8, keys: vec!["k3".into()] },
            ]
        );
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let set = set_of(&[("c", 4), ("a", 0), ("b", 2)]);
        let groups = build_groups(&set, 6).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keys, vec!["a", "b", "c"]);
        assert_eq!(groups[0].register_count(), 6);
    }

    #[test]
    fn test_max_of_one_float_gives_singletons() {
        let set = set_of(&[("a", 0), ("b", 2), ("c", 4)]);
        let groups = build_groups(&set, 2).unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn test_odd_max_rounds_down_to_whole_floats() {
        let set = set_of(&[("a", 0), ("b", 2), ("c", 4)]);
        let groups = build_groups(&set, 5).unwrap();
        assert_eq!(groups[0].keys, vec!["a", "b"]);
        assert_eq!(groups[1].keys, vec!["c"]);
    }

    #[test]
    fn test_rejects_invalid_max() {
        let set = set_of(&[("a", 0)]);
        assert!(matches!(build_groups(&set, 0), Err(ModbusError::Configuration { .. })));
        assert!(build_groups(&set, 1).is_err());
        assert!(build_groups(&set, 126).is_err());
        assert!(build_groups(&set, 125).is_ok());
    }

    #[test]
    fn test_empty_set() {
        let set = RegisterSet::new("empty", Vec::new()).unwrap();
        assert!(build_groups(&set, 4).unwrap().is_empty());
    }

    #[test]
    fn test_basic_tier_grouping() {
        let set = RegisterSet::tier(RegisterTier::Basic);
        let groups = build_groups(&set, 4).unwrap();
        let starts: Vec<u16> = groups.iter().map(|g| g.start_address).collect();
        // 0..16 in pairs, then 52, 70+72, 74, 342
        assert_eq!(starts, vec![0, 4, 8, 12, 16, 52, 70, 74, 342]);
    }

    #[test]
    fn test_full_tier_with_max_batch() {
        let set = RegisterSet::tier(RegisterTier::Full);
        let groups = build_groups(&set, MAX_READ_REGISTERS).unwrap();
        let total: usize = groups.iter().map(AddressGroup::len).sum();
        assert_eq!(total, set.len());
        // 0..=42 is one unbroken run of 22 floats
        assert_eq!(groups[0].start_address, 0);
        assert_eq!(groups[0].len(), 22);
    }

    // Unique even addresses with matching keys
    fn arb_set() -> impl Strategy<Value = RegisterSet> {
        prop::collection::btree_set(0u16..400, 0..60).prop_map(|slots: BTreeSet<u16>| {
            let registers = slots
                .into_iter()
                .rev()
                .map(|slot| descriptor(&format!("r{slot}"), slot * 2))
                .collect();
            RegisterSet::new("prop", registers).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_groups_are_a_partition(set in arb_set(), max in 2u16..=125) {
            let groups = build_groups(&set, max).unwrap();
            let mut seen: Vec<&str> = groups.iter().flat_map(|g| g.keys.iter().map(String::as_str)).collect();
            prop_assert_eq!(seen.len(), set.len());
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), set.len());
        }

        #[test]
        fn prop_groups_are_contiguous_and_bounded(set in arb_set(), max in 2u16..=125) {
            let groups = build_groups(&set, max).unwrap();
            for group in &groups {
                prop_assert!(!group.is_empty());
                prop_assert!(group.register_count() <= max);
                for (i, key) in group.keys.iter().enumerate() {
                    let address = set.get(key).unwrap().address;
                    prop_assert_eq!(u32::from(address), u32::from(group.start_address) + 2 * i as u32);
                }
            }
        }

        #[test]
        fn prop_groups_are_ordered_and_maximal(set in arb_set(), max in 2u16..=125) {
            let groups = build_groups(&set, max).unwrap();
            for pair in groups.windows(2) {
                prop_assert!(pair[0].end_address() <= u32::from(pair[1].start_address));
                // Adjacent groups only split because the earlier one was full.
                if pair[0].end_address() == u32::from(pair[1].start_address) {
                    prop_assert!(pair[0].register_count() + REGISTERS_PER_FLOAT > max);
                }
            }
        }
    }
}
