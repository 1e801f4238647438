// Copyright 2026 Oxide Computer Company

use serde::{Deserialize, Serialize};

use crate::array_def::{ArrayDefinition, RaidLevel};

/*
 * The address mapper: pure functions from an array-relative (logical)
 * sector to the stripe row, data slot, and parity slot(s) that hold it,
 * and back again.
 *
 * These are called both forward (on submission) and backward (when
 * verifying where a reconstructed block came from), and the two
 * directions must agree bit for bit.  Everything here is side-effect
 * free, so agreement is structural: the inverse is a position lookup in
 * the same per-stripe layout the forward direction used.
 */

/// Parity rotation algorithm.
///
/// The first six apply to RAID-4/5 (and to RAID-6, where Q follows P in
/// the rotation).  The `Rotating*` variants are the DDF-style RAID-6
/// placements, and the `*6` variants are RAID-5-shaped layouts with Q
/// pinned on the last disk, kept for 6-disk legacy arrays.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    LeftAsymmetric,
    RightAsymmetric,
    LeftSymmetric,
    RightSymmetric,
    Parity0,
    ParityN,

    RotatingZeroRestart,
    RotatingNRestart,
    RotatingNContinue,

    LeftAsymmetric6,
    RightAsymmetric6,
    LeftSymmetric6,
    RightSymmetric6,
    Parity06,
}

impl Algorithm {
    pub const ALL: [Algorithm; 14] = [
        Algorithm::LeftAsymmetric,
        Algorithm::RightAsymmetric,
        Algorithm::LeftSymmetric,
        Algorithm::RightSymmetric,
        Algorithm::Parity0,
        Algorithm::ParityN,
        Algorithm::RotatingZeroRestart,
        Algorithm::RotatingNRestart,
        Algorithm::RotatingNContinue,
        Algorithm::LeftAsymmetric6,
        Algorithm::RightAsymmetric6,
        Algorithm::LeftSymmetric6,
        Algorithm::RightSymmetric6,
        Algorithm::Parity06,
    ];

    pub fn valid_for(&self, level: RaidLevel) -> bool {
        use Algorithm::*;
        match level {
            RaidLevel::Raid4 => matches!(self, Parity0 | ParityN),
            RaidLevel::Raid5 => matches!(
                self,
                LeftAsymmetric
                    | RightAsymmetric
                    | LeftSymmetric
                    | RightSymmetric
                    | Parity0
                    | ParityN
            ),
            RaidLevel::Raid6 => true,
        }
    }
}

/// Where one logical sector lands: the per-disk sector of its stripe
/// row, the slot holding the data, and the slot(s) holding redundancy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StripeAddress {
    /// Offset on each member disk of this stripe row.
    pub stripe_sector: u64,

    /// Slot (member disk index) holding the data block.
    pub dd_idx: usize,

    /// Slot holding P.
    pub pd_idx: usize,

    /// Slot holding Q; None below RAID-6.
    pub qd_idx: Option<usize>,
}

/// The full slot assignment for one stripe row.
///
/// `data_slots[i]` is the member disk holding the i-th data block of
/// the row; this order is also the syndrome order — Q generation and
/// dual-erasure recovery must walk data blocks in exactly this order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeLayout {
    pub pd_idx: usize,
    pub qd_idx: Option<usize>,
    pub data_slots: Vec<usize>,
}

impl StripeLayout {
    pub fn is_parity(&self, slot: usize) -> bool {
        slot == self.pd_idx || self.qd_idx == Some(slot)
    }

    /// Position of `slot` in syndrome order, if it holds data.
    pub fn raw_index(&self, slot: usize) -> Option<usize> {
        self.data_slots.iter().position(|&s| s == slot)
    }
}

/// Compute the slot assignment for stripe row `stripe` of the array.
pub fn layout_stripe(
    def: &ArrayDefinition,
    stripe: u64,
    previous: bool,
) -> StripeLayout {
    let disks = def.disks(previous);
    let data_disks = def.data_disks(previous);
    let algorithm = def.algorithm(previous);

    match def.level() {
        RaidLevel::Raid4 | RaidLevel::Raid5 => {
            let (pd, slot_of): (usize, Box<dyn Fn(usize) -> usize>) =
                match algorithm {
                    Algorithm::LeftAsymmetric => {
                        let pd = disks - 1 - (stripe % disks as u64) as usize;
                        (pd, Box::new(move |r| if r < pd { r } else { r + 1 }))
                    }
                    Algorithm::RightAsymmetric => {
                        let pd = (stripe % disks as u64) as usize;
                        (pd, Box::new(move |r| if r < pd { r } else { r + 1 }))
                    }
                    Algorithm::LeftSymmetric => {
                        let pd = disks - 1 - (stripe % disks as u64) as usize;
                        (pd, Box::new(move |r| (pd + 1 + r) % disks))
                    }
                    Algorithm::RightSymmetric => {
                        let pd = (stripe % disks as u64) as usize;
                        (pd, Box::new(move |r| (pd + 1 + r) % disks))
                    }
                    Algorithm::Parity0 => (0, Box::new(|r| r + 1)),
                    Algorithm::ParityN => (disks - 1, Box::new(|r| r)),
                    _ => panic!(
                        "algorithm {:?} is not valid below RAID-6",
                        algorithm
                    ),
                };
            StripeLayout {
                pd_idx: pd,
                qd_idx: None,
                data_slots: (0..data_disks).map(|r| slot_of(r)).collect(),
            }
        }
        RaidLevel::Raid6 => layout_stripe_raid6(algorithm, stripe, disks),
    }
}

fn layout_stripe_raid6(
    algorithm: Algorithm,
    stripe: u64,
    disks: usize,
) -> StripeLayout {
    let data_disks = disks - 2;

    // The four rotating layouts (and the DDF restarts) share the
    // "Q directly follows P, wrapping" shape; only the P position
    // differs.
    let asymmetric = |pd: usize| -> StripeLayout {
        if pd == disks - 1 {
            // P on the last disk wraps Q around to slot 0.
            StripeLayout {
                pd_idx: pd,
                qd_idx: Some(0),
                data_slots: (0..data_disks).map(|r| r + 1).collect(),
            }
        } else {
            StripeLayout {
                pd_idx: pd,
                qd_idx: Some(pd + 1),
                data_slots: (0..data_disks)
                    .map(|r| if r < pd { r } else { r + 2 })
                    .collect(),
            }
        }
    };
    let symmetric = |pd: usize| -> StripeLayout {
        StripeLayout {
            pd_idx: pd,
            qd_idx: Some((pd + 1) % disks),
            data_slots: (0..data_disks)
                .map(|r| (pd + 2 + r) % disks)
                .collect(),
        }
    };
    // RAID-5-shaped rotation over the first disks-1 slots, Q pinned on
    // the last disk.
    let ring = disks - 1;
    let asymmetric6 = |pd: usize| -> StripeLayout {
        StripeLayout {
            pd_idx: pd,
            qd_idx: Some(disks - 1),
            data_slots: (0..data_disks)
                .map(|r| if r < pd { r } else { r + 1 })
                .collect(),
        }
    };
    let symmetric6 = |pd: usize| -> StripeLayout {
        StripeLayout {
            pd_idx: pd,
            qd_idx: Some(disks - 1),
            data_slots: (0..data_disks)
                .map(|r| (pd + 1 + r) % ring)
                .collect(),
        }
    };

    match algorithm {
        Algorithm::LeftAsymmetric => {
            asymmetric(disks - 1 - (stripe % disks as u64) as usize)
        }
        Algorithm::RightAsymmetric => {
            asymmetric((stripe % disks as u64) as usize)
        }
        Algorithm::LeftSymmetric => {
            symmetric(disks - 1 - (stripe % disks as u64) as usize)
        }
        Algorithm::RightSymmetric => {
            symmetric((stripe % disks as u64) as usize)
        }
        Algorithm::Parity0 => StripeLayout {
            pd_idx: 0,
            qd_idx: Some(1),
            data_slots: (0..data_disks).map(|r| r + 2).collect(),
        },
        Algorithm::ParityN => StripeLayout {
            pd_idx: disks - 2,
            qd_idx: Some(disks - 1),
            data_slots: (0..data_disks).collect(),
        },

        // DDF: same shell as right-asymmetric, restarting at slot 0.
        Algorithm::RotatingZeroRestart => {
            asymmetric((stripe % disks as u64) as usize)
        }
        // DDF: left-asymmetric shifted so the first row is D..D P Q.
        Algorithm::RotatingNRestart => {
            asymmetric(disks - 1 - ((stripe + 1) % disks as u64) as usize)
        }
        // DDF: like left-symmetric, but Q sits just before P.
        Algorithm::RotatingNContinue => {
            let pd = disks - 1 - (stripe % disks as u64) as usize;
            StripeLayout {
                pd_idx: pd,
                qd_idx: Some((pd + disks - 1) % disks),
                data_slots: (0..data_disks)
                    .map(|r| (pd + 1 + r) % disks)
                    .collect(),
            }
        }

        Algorithm::LeftAsymmetric6 => {
            asymmetric6(data_disks - (stripe % ring as u64) as usize)
        }
        Algorithm::RightAsymmetric6 => {
            asymmetric6((stripe % ring as u64) as usize)
        }
        Algorithm::LeftSymmetric6 => {
            symmetric6(data_disks - (stripe % ring as u64) as usize)
        }
        Algorithm::RightSymmetric6 => {
            symmetric6((stripe % ring as u64) as usize)
        }
        Algorithm::Parity06 => StripeLayout {
            pd_idx: 0,
            qd_idx: Some(disks - 1),
            data_slots: (0..data_disks).map(|r| r + 1).collect(),
        },
    }
}

/// Map a logical sector to its stripe row and slots.
pub fn map_sector(
    def: &ArrayDefinition,
    logical: u64,
    previous: bool,
) -> StripeAddress {
    let data_disks = def.data_disks(previous) as u64;
    let chunk = def.chunk_sectors(previous);

    let chunk_offset = logical % chunk;
    let chunk_number = logical / chunk;
    let raw = (chunk_number % data_disks) as usize;
    let stripe = chunk_number / data_disks;

    let layout = layout_stripe(def, stripe, previous);
    StripeAddress {
        stripe_sector: stripe * chunk + chunk_offset,
        dd_idx: layout.data_slots[raw],
        pd_idx: layout.pd_idx,
        qd_idx: layout.qd_idx,
    }
}

/// The exact inverse of [`map_sector`]: which logical sector does the
/// block at `(stripe_sector, slot)` hold?  None if `slot` carries
/// parity for that row.
pub fn compute_source_sector(
    def: &ArrayDefinition,
    stripe_sector: u64,
    slot: usize,
    previous: bool,
) -> Option<u64> {
    let data_disks = def.data_disks(previous) as u64;
    let chunk = def.chunk_sectors(previous);

    let stripe = stripe_sector / chunk;
    let chunk_offset = stripe_sector % chunk;

    let layout = layout_stripe(def, stripe, previous);
    let raw = layout.raw_index(slot)? as u64;
    Some((stripe * data_disks + raw) * chunk + chunk_offset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::units::STRIPE_SECTORS;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn def(
        level: RaidLevel,
        disks: usize,
        chunk: u64,
        algorithm: Algorithm,
    ) -> ArrayDefinition {
        ArrayDefinition::new(level, disks, chunk, algorithm, 1 << 16).unwrap()
    }

    /// Every stripe's layout must be a permutation: each member disk
    /// appears exactly once as data, P, or Q.
    fn assert_permutation(layout: &StripeLayout, disks: usize) {
        let mut seen = vec![false; disks];
        seen[layout.pd_idx] = true;
        if let Some(qd) = layout.qd_idx {
            assert!(!seen[qd], "Q collides with P: {:?}", layout);
            seen[qd] = true;
        }
        for &s in &layout.data_slots {
            assert!(!seen[s], "slot {} assigned twice: {:?}", s, layout);
            seen[s] = true;
        }
        assert!(seen.iter().all(|&b| b), "unassigned slot: {:?}", layout);
    }

    #[test]
    fn test_left_symmetric_rotation() {
        let d = def(RaidLevel::Raid5, 4, STRIPE_SECTORS, Algorithm::LeftSymmetric);

        // Stripe 0: parity on the last disk, data starts at slot 0.
        let l = layout_stripe(&d, 0, false);
        assert_eq!(l.pd_idx, 3);
        assert_eq!(l.data_slots, vec![0, 1, 2]);

        // Stripe 1: parity moves left, data follows it around.
        let l = layout_stripe(&d, 1, false);
        assert_eq!(l.pd_idx, 2);
        assert_eq!(l.data_slots, vec![3, 0, 1]);

        // The rotation has period equal to the disk count.
        let l = layout_stripe(&d, 4, false);
        assert_eq!(l.pd_idx, 3);
    }

    #[test]
    fn test_raid4_parity_fixed() {
        let d = def(RaidLevel::Raid4, 5, STRIPE_SECTORS, Algorithm::ParityN);
        for stripe in 0..20 {
            assert_eq!(layout_stripe(&d, stripe, false).pd_idx, 4);
        }
    }

    #[test]
    fn test_raid6_q_follows_p() {
        let d = def(RaidLevel::Raid6, 5, STRIPE_SECTORS, Algorithm::LeftSymmetric);
        let l = layout_stripe(&d, 0, false);
        assert_eq!(l.pd_idx, 4);
        assert_eq!(l.qd_idx, Some(0));
        assert_eq!(l.data_slots, vec![1, 2, 3]);
    }

    #[test]
    fn test_raid6_wrap_case() {
        // Right-asymmetric with P on the last disk puts Q on slot 0.
        let d =
            def(RaidLevel::Raid6, 5, STRIPE_SECTORS, Algorithm::RightAsymmetric);
        let l = layout_stripe(&d, 4, false);
        assert_eq!(l.pd_idx, 4);
        assert_eq!(l.qd_idx, Some(0));
        assert_eq!(l.data_slots, vec![1, 2, 3]);
    }

    #[test]
    fn test_rotating_n_continue_q_before_p() {
        let d = def(
            RaidLevel::Raid6,
            6,
            STRIPE_SECTORS,
            Algorithm::RotatingNContinue,
        );
        for stripe in 0..12 {
            let l = layout_stripe(&d, stripe, false);
            let qd = l.qd_idx.unwrap();
            assert_eq!((qd + 1) % 6, l.pd_idx);
            assert_permutation(&l, 6);
        }
    }

    #[test]
    fn test_legacy6_q_pinned_last() {
        for alg in [
            Algorithm::LeftAsymmetric6,
            Algorithm::RightAsymmetric6,
            Algorithm::LeftSymmetric6,
            Algorithm::RightSymmetric6,
            Algorithm::Parity06,
        ] {
            let d = def(RaidLevel::Raid6, 6, STRIPE_SECTORS, alg);
            for stripe in 0..12 {
                let l = layout_stripe(&d, stripe, false);
                assert_eq!(l.qd_idx, Some(5), "{:?}", alg);
                assert_permutation(&l, 6);
            }
        }
    }

    #[test]
    fn test_map_sector_basic() {
        let d = def(RaidLevel::Raid5, 4, STRIPE_SECTORS, Algorithm::LeftSymmetric);

        let a = map_sector(&d, 0, false);
        assert_eq!(a.stripe_sector, 0);
        assert_eq!(a.dd_idx, 0);
        assert_eq!(a.pd_idx, 3);
        assert_eq!(a.qd_idx, None);

        // Third chunk of the first row.
        let a = map_sector(&d, 2 * STRIPE_SECTORS + 5, false);
        assert_eq!(a.stripe_sector, 5);
        assert_eq!(a.dd_idx, 2);

        // First chunk of the second row wraps past the parity slot.
        let a = map_sector(&d, 3 * STRIPE_SECTORS, false);
        assert_eq!(a.stripe_sector, STRIPE_SECTORS);
        assert_eq!(a.dd_idx, 3);
        assert_eq!(a.pd_idx, 2);
    }

    #[test]
    fn test_inverse_rejects_parity_slots() {
        let d = def(RaidLevel::Raid6, 5, STRIPE_SECTORS, Algorithm::LeftSymmetric);
        let l = layout_stripe(&d, 0, false);
        assert_eq!(compute_source_sector(&d, 0, l.pd_idx, false), None);
        assert_eq!(
            compute_source_sector(&d, 0, l.qd_idx.unwrap(), false),
            None
        );
        for &s in &l.data_slots {
            assert!(compute_source_sector(&d, 0, s, false).is_some());
        }
    }

    // Proptest time

    fn valid_combos() -> Vec<(RaidLevel, Algorithm, usize)> {
        let mut v = Vec::new();
        for level in [RaidLevel::Raid4, RaidLevel::Raid5, RaidLevel::Raid6] {
            for alg in Algorithm::ALL {
                if !alg.valid_for(level) {
                    continue;
                }
                for disks in (level.redundancy() + 1)..=10 {
                    v.push((level, alg, disks));
                }
            }
        }
        v
    }

    fn combo_strategy() -> impl Strategy<Value = (RaidLevel, Algorithm, usize)>
    {
        proptest::sample::select(valid_combos())
    }

    #[proptest]
    fn layouts_are_permutations(
        #[strategy(combo_strategy())] combo: (RaidLevel, Algorithm, usize),
        #[strategy(0u64..10_000)] stripe: u64,
    ) {
        let (level, alg, disks) = combo;
        let d = def(level, disks, STRIPE_SECTORS, alg);
        assert_permutation(&layout_stripe(&d, stripe, false), disks);
    }

    #[proptest]
    fn map_round_trips(
        #[strategy(combo_strategy())] combo: (RaidLevel, Algorithm, usize),
        #[strategy(0u64..(1 << 20))] logical: u64,
        #[strategy(proptest::sample::select(vec![8u64, 16, 64, 512]))]
        chunk: u64,
    ) {
        let (level, alg, disks) = combo;
        let d = ArrayDefinition::new(level, disks, chunk, alg, 1 << 20)
            .unwrap();
        prop_assume!(logical < d.capacity_sectors());

        let a = map_sector(&d, logical, false);
        prop_assert_eq!(
            compute_source_sector(&d, a.stripe_sector, a.dd_idx, false),
            Some(logical)
        );
    }

    #[proptest]
    fn inverse_then_forward_agrees(
        #[strategy(combo_strategy())] combo: (RaidLevel, Algorithm, usize),
        #[strategy(0u64..10_000)] stripe: u64,
    ) {
        let (level, alg, disks) = combo;
        let d = def(level, disks, STRIPE_SECTORS, alg);
        let chunk = d.chunk_sectors(false);
        let stripe_sector = stripe * chunk;
        prop_assume!(
            stripe * chunk < d.disk_sectors()
        );

        for slot in 0..disks {
            if let Some(logical) =
                compute_source_sector(&d, stripe_sector, slot, false)
            {
                prop_assume!(logical < d.capacity_sectors());
                let a = map_sector(&d, logical, false);
                prop_assert_eq!(a.stripe_sector, stripe_sector);
                prop_assert_eq!(a.dd_idx, slot);
            }
        }
    }

    #[proptest]
    fn previous_geometry_is_independent(
        #[strategy(0u64..(1 << 16))] logical: u64,
    ) {
        let mut d =
            def(RaidLevel::Raid5, 4, STRIPE_SECTORS, Algorithm::LeftSymmetric);
        d.begin_reshape(5, STRIPE_SECTORS, Algorithm::LeftSymmetric)
            .unwrap();
        prop_assume!(logical < d.capacity_sectors());

        // Old-geometry mapping must still round-trip mid-reshape.
        let a = map_sector(&d, logical, true);
        prop_assert_eq!(
            compute_source_sector(&d, a.stripe_sector, a.dd_idx, true),
            Some(logical)
        );

        // And the new geometry round-trips with more disks.
        let a = map_sector(&d, logical, false);
        prop_assert_eq!(
            compute_source_sector(&d, a.stripe_sector, a.dd_idx, false),
            Some(logical)
        );
    }
}
