//! Stage 1 — Continuity Filter: a cheap, bit-packed multi-row hash table
//! that promotes a flow once it has been seen in enough consecutive
//! windows. See spec §4.2.

use crate::consts::STAGE1_ROWS;
use crate::flow::FlowId;
use crate::hashing::{index_in_range, murmur3_x86_32, stage1_row_seed};

/// One byte, packed by hand (not `bitfield!` syntax — spec §9 requires the
/// layout to be an explicit contract, not a language feature):
/// bits 0-3 `continuity`, bit 4 `arrival`, bit 5 `jump`.
#[derive(Clone, Copy, Default)]
struct Stage1Bucket(u8);

const CONTINUITY_MASK: u8 = 0b0000_1111;
const ARRIVAL_BIT: u8 = 0b0001_0000;
const JUMP_BIT: u8 = 0b0010_0000;

impl Stage1Bucket {
    #[inline]
    fn continuity(self) -> u8 {
        self.0 & CONTINUITY_MASK
    }

    #[inline]
    fn set_continuity(&mut self, v: u8) {
        debug_assert!(v <= 15);
        self.0 = (self.0 & !CONTINUITY_MASK) | v;
    }

    #[inline]
    fn arrival(self) -> u8 {
        (self.0 & ARRIVAL_BIT != 0) as u8
    }

    #[inline]
    fn set_arrival(&mut self, cur: u8) {
        if cur != 0 {
            self.0 |= ARRIVAL_BIT;
        } else {
            self.0 &= !ARRIVAL_BIT;
        }
    }

    #[inline]
    fn jump(self) -> bool {
        self.0 & JUMP_BIT != 0
    }

    #[inline]
    fn set_jump(&mut self) {
        self.0 |= JUMP_BIT;
    }

    #[inline]
    fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Multi-row hash table over `Stage1Bucket`s. `STAGE1_ROWS` rows, each sized
/// from a memory budget in bytes (spec §4.2): `⌊bytes / rows / 1⌋` buckets
/// per row (a bucket is one byte), minimum 1.
pub struct Stage1Filter {
    rows: [Vec<Stage1Bucket>; STAGE1_ROWS],
    row_seeds: [u32; STAGE1_ROWS],
}

impl Stage1Filter {
    pub fn new(memory_bytes: usize) -> Self {
        let per_row_bytes = memory_bytes / STAGE1_ROWS;
        let buckets_per_row = per_row_bytes.max(1);

        let rows = std::array::from_fn(|_| vec![Stage1Bucket::default(); buckets_per_row]);
        let row_seeds = std::array::from_fn(stage1_row_seed);

        Self { rows, row_seeds }
    }

    #[inline]
    fn index_for_row(&self, flow: &FlowId, row: usize) -> usize {
        let h = murmur3_x86_32(flow.as_bytes(), self.row_seeds[row]);
        index_in_range(h, self.rows[row].len() as u32)
    }

    fn indices(&self, flow: &FlowId) -> [usize; STAGE1_ROWS] {
        std::array::from_fn(|row| self.index_for_row(flow, row))
    }

    /// Feed one `(flowID, windowSeq)` arrival. Returns whether the flow is
    /// (now, or already) promoted to Stage 2. See spec §4.2 steps 1-4.
    pub fn process_packet(&mut self, flow: &FlowId, window_seq: u32) -> bool {
        let cur = (window_seq % 2) as u8;
        let indices = self.indices(flow);

        let all_jumped = (0..STAGE1_ROWS).all(|row| self.rows[row][indices[row]].jump());
        if all_jumped {
            for row in 0..STAGE1_ROWS {
                self.rows[row][indices[row]].set_arrival(cur);
            }
            tracing::trace!(?flow, window_seq, "stage1 fast-path promoted arrival");
            return true;
        }

        let mut all_continuous = true;
        for row in 0..STAGE1_ROWS {
            let b = &mut self.rows[row][indices[row]];
            if b.is_empty() {
                b.set_continuity(1);
                b.set_arrival(cur);
                all_continuous = false;
            } else if b.arrival() == cur {
                if b.continuity() != 15 {
                    all_continuous = false;
                }
            } else {
                if b.continuity() < 15 {
                    b.set_continuity(b.continuity() + 1);
                }
                b.set_arrival(cur);
                if b.continuity() != 15 {
                    all_continuous = false;
                }
            }
        }

        if all_continuous {
            for row in 0..STAGE1_ROWS {
                self.rows[row][indices[row]].set_jump();
            }
            tracing::debug!(?flow, window_seq, "stage1 promoted flow");
            true
        } else {
            false
        }
    }

    /// Window-boundary sweep: zero every non-empty bucket whose `arrival`
    /// doesn't match the just-closed window's parity. Fires on every window
    /// transition and once more at `finalize` with the last observed
    /// window (spec §4.2 / §9).
    pub fn reset_buckets(&mut self, window_seq: u32) {
        let cur = (window_seq % 2) as u8;
        tracing::trace!(window_seq, "stage1 window boundary sweep");
        for row in self.rows.iter_mut() {
            for b in row.iter_mut() {
                if !b.is_empty() && b.arrival() != cur {
                    b.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::KEY_LEN;

    fn flow(b: u8) -> FlowId {
        FlowId::from_bytes(&[b; KEY_LEN])
    }

    #[test]
    fn bucket_fits_in_one_byte_and_empty_iff_all_fields_zero() {
        assert_eq!(std::mem::size_of::<Stage1Bucket>(), 1);
        let b = Stage1Bucket::default();
        assert!(b.is_empty());
        assert_eq!(b.continuity(), 0);
        assert_eq!(b.arrival(), 0);
        assert!(!b.jump());
    }

    #[test]
    fn single_packet_never_promotes() {
        let mut s1 = Stage1Filter::new(4096);
        assert!(!s1.process_packet(&flow(1), 0));
    }

    #[test]
    fn promotion_requires_full_continuity_across_window_transitions() {
        // Feed the same flow once per window. continuity saturates at 15
        // only after 15 *distinct* window values have been observed with
        // alternating parity (each transition bumps continuity by one,
        // since arrival flips every window).
        let mut s1 = Stage1Filter::new(4096);
        let f = flow(42);
        let mut promoted_at = None;
        for w in 0..20u32 {
            if s1.process_packet(&f, w) {
                promoted_at = Some(w);
                break;
            }
            s1.reset_buckets(w);
        }
        let w = promoted_at.expect("flow should eventually be promoted");
        assert!(w >= 14, "promotion too early: {w}");
    }

    #[test]
    fn promoted_flow_takes_fast_path_on_every_later_packet() {
        let mut s1 = Stage1Filter::new(4096);
        let f = flow(7);
        let mut w = 0u32;
        while !s1.process_packet(&f, w) {
            s1.reset_buckets(w);
            w += 1;
        }
        for next in (w + 1)..(w + 10) {
            assert!(s1.process_packet(&f, next));
        }
    }

    #[test]
    fn reset_buckets_clears_only_stale_arrivals() {
        let mut s1 = Stage1Filter::new(4096);
        let a = flow(1);
        let b = flow(2);
        s1.process_packet(&a, 0);
        s1.reset_buckets(0);
        // `a` was seen in window 0 (parity 0); sweeping window 0 again
        // should leave it untouched since its arrival parity matches.
        let idx = s1.indices(&a);
        assert!(!s1.rows[0][idx[0]].is_empty());
        // `b` was never seen, so it stays empty regardless.
        let idx_b = s1.indices(&b);
        assert!(s1.rows[0][idx_b[0]].is_empty());
    }
}
