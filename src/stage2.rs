//! Stage 2 — Stability Monitor: tracks recent per-window arrival counts per
//! flow and applies the relative-rebirth algorithm to decide when a run of
//! windows is "stable enough" to hand to Stage 3. See spec §4.3 — the
//! hardest of the three stages.

use crate::consts::{ALPHA_THRESHOLD, COUNTER_BITS, STABLE_THRESHOLD, STAGE2_ROWS, SUBFLOW_WINDOWS};
use crate::flow::FlowId;
use crate::hashing::{index_in_range, stage2_row_hash};

/// `R = SUBFLOW_WINDOWS + 1`: one rotating slot per subflow window, plus one
/// extra so a full subflow's worth of history is never entirely overwritten
/// by the window currently being filled.
const R: usize = SUBFLOW_WINDOWS + 1;

/// One bucket's worth of rotating counters plus the alternating-parity CK
/// aging fields. `ck`'s bits are packed by hand (spec §9): bits 0-2 `ck1`,
/// bit 3 `ck1_is_null`, bits 4-6 `ck2`, bit 7 `ck2_is_null`.
#[derive(Clone, Copy)]
struct Stage2Bucket {
    cx: [u8; R],
    initialized_flags: u8,
    ck: u8,
}

const CK1_MASK: u8 = 0b0000_0111;
const CK1_NULL_BIT: u8 = 0b0000_1000;
const CK2_SHIFT: u8 = 4;
const CK2_MASK: u8 = 0b0111_0000;
const CK2_NULL_BIT: u8 = 0b1000_0000;

impl Default for Stage2Bucket {
    fn default() -> Self {
        // ck1 = ck2 = 1, both "is_null" flags clear, matching the source's
        // constructor. Emptiness is tracked solely by `initialized_flags`,
        // so these defaults never observably matter until a slot is used.
        Self { cx: [0; R], initialized_flags: 0, ck: 0b0001_0001 }
    }
}

impl Stage2Bucket {
    #[inline]
    fn empty(&self) -> bool {
        self.initialized_flags == 0
    }

    #[inline]
    fn is_counter_null(&self, y: u8) -> bool {
        self.initialized_flags & (1 << y) == 0
    }

    #[inline]
    fn count_window_number(&self) -> u32 {
        self.initialized_flags.count_ones()
    }

    #[inline]
    fn ck1(&self) -> u8 {
        self.ck & CK1_MASK
    }
    #[inline]
    fn set_ck1(&mut self, v: u8) {
        self.ck = (self.ck & !CK1_MASK) | (v & CK1_MASK);
    }
    #[inline]
    fn ck1_is_null(&self) -> bool {
        self.ck & CK1_NULL_BIT != 0
    }
    #[inline]
    fn set_ck1_is_null(&mut self, b: bool) {
        if b {
            self.ck |= CK1_NULL_BIT;
        } else {
            self.ck &= !CK1_NULL_BIT;
        }
    }
    #[inline]
    fn ck2(&self) -> u8 {
        (self.ck & CK2_MASK) >> CK2_SHIFT
    }
    #[inline]
    fn set_ck2(&mut self, v: u8) {
        self.ck = (self.ck & !CK2_MASK) | ((v << CK2_SHIFT) & CK2_MASK);
    }
    #[inline]
    fn ck2_is_null(&self) -> bool {
        self.ck & CK2_NULL_BIT != 0
    }
    #[inline]
    fn set_ck2_is_null(&mut self, b: bool) {
        if b {
            self.ck |= CK2_NULL_BIT;
        } else {
            self.ck &= !CK2_NULL_BIT;
        }
    }

    fn reset(&mut self) {
        self.cx = [0; R];
        self.initialized_flags = 0;
        self.ck = 0b0001_0001;
    }

    fn initialize_new_window(&mut self, window: u8, absolute_window: u32) {
        self.cx[window as usize] = 1;
        self.initialized_flags |= 1 << window;

        if absolute_window % 2 == 0 {
            self.set_ck1(1);
            self.set_ck1_is_null(false);
        } else {
            self.set_ck2(1);
            self.set_ck2_is_null(false);
        }
    }

    /// Relative-rebirth stability check (spec §4.3). `y1`/`y2` are
    /// `y_prev`/`y_prev2`.
    fn check_stability(&self, y1: u8, y2: u8, absolute_window: u32) -> bool {
        let base = 1u32 << COUNTER_BITS;
        if self.is_counter_null(y1) || self.is_counter_null(y2) {
            return false;
        }
        let cx1 = self.cx[y1 as usize] as u32;
        let cx2 = self.cx[y2 as usize] as u32;

        let diff_abs = (cx2 as i64 - cx1 as i64).unsigned_abs() as u32;

        if absolute_window % 2 == 0 {
            if self.ck1_is_null() {
                return false;
            }
            match self.ck1() {
                v if v > 2 => false,
                2 => (cx1 + base - cx2) % base <= ALPHA_THRESHOLD,
                1 => diff_abs <= ALPHA_THRESHOLD,
                _ => (cx2 + base - cx1) % base <= ALPHA_THRESHOLD,
            }
        } else {
            if self.ck2_is_null() {
                return false;
            }
            match self.ck2() {
                v if v > 2 => false,
                2 => (cx1 + base - cx2) % base <= ALPHA_THRESHOLD,
                1 => diff_abs <= ALPHA_THRESHOLD,
                _ => (cx1 + base - cx2) % base <= ALPHA_THRESHOLD,
            }
        }
    }

    /// Ages the CK fields on a counter wrap-around (spec §4.3). Returns
    /// `false` once the non-active CK has itself gone null, signalling the
    /// bucket's history is too stale to trust.
    fn update_ck_on_rebirth(&mut self, absolute_window: u32) -> bool {
        let use_ck1 = absolute_window % 2 == 0;
        tracing::trace!(absolute_window, use_ck1, "stage2 ck rebirth");

        if use_ck1 {
            if !self.ck1_is_null() && self.ck1() < 6 {
                self.set_ck1(self.ck1() + 1);
            }
        } else if !self.ck2_is_null() && self.ck2() < 6 {
            self.set_ck2(self.ck2() + 1);
        }

        if self.count_window_number() != 1 {
            if use_ck1 {
                if !self.ck2_is_null() {
                    if self.ck2() != 0 {
                        self.set_ck2(self.ck2() - 1);
                    } else {
                        self.set_ck2_is_null(true);
                        return false;
                    }
                } else {
                    return false;
                }
            } else if !self.ck1_is_null() {
                if self.ck1() != 0 {
                    self.set_ck1(self.ck1() - 1);
                } else {
                    self.set_ck1_is_null(true);
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    }
}

/// Output-sink capability Stage 2 emits stable subflows through. Stage 3
/// implements it; Stage 2 never holds a reference back to Stage 3 (spec
/// §9) — the sink is threaded through the call instead, avoiding a
/// self-referential owner struct while keeping emission synchronous.
pub trait StableFlowSink {
    fn process_steady_subflow(&mut self, flow: &FlowId, start_window: u32, variance: f64, mean_freq: f64);
}

fn calculate_consecutive_windows(bucket: &Stage2Bucket, current_window: u32) -> u32 {
    let mut count = 0;
    for i in 1..=(SUBFLOW_WINDOWS as u32) {
        if current_window < i {
            break;
        }
        let window = current_window - i;
        let y = (window as usize % R) as u8;
        if bucket.is_counter_null(y) {
            break;
        }
        count += 1;
    }
    count
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::INFINITY;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    ss / (values.len() - 1) as f64
}

fn calculate_mean_frequency(bucket: &Stage2Bucket, start_window: u32) -> f64 {
    let mut sum = 0.0;
    for i in 0..SUBFLOW_WINDOWS as u32 {
        let y = ((start_window + i) as usize % R) as u8;
        if bucket.is_counter_null(y) {
            return f64::INFINITY;
        }
        sum += bucket.cx[y as usize] as f64;
    }
    sum / SUBFLOW_WINDOWS as f64
}

fn calculate_direct_variance(bucket: &Stage2Bucket, start_window: u32) -> f64 {
    let mut values = Vec::with_capacity(SUBFLOW_WINDOWS);
    for i in 0..SUBFLOW_WINDOWS as u32 {
        let y = ((start_window + i) as usize % R) as u8;
        if bucket.is_counter_null(y) {
            return f64::INFINITY;
        }
        values.push(bucket.cx[y as usize] as f64);
    }
    sample_variance(&values)
}

fn calculate_offset_variance(bucket: &Stage2Bucket, start_window: u32) -> f64 {
    let base = (1u32 << COUNTER_BITS) as f64;
    let half = base / 2.0;
    let mut values = Vec::with_capacity(SUBFLOW_WINDOWS);
    for i in 0..SUBFLOW_WINDOWS as u32 {
        let y = ((start_window + i) as usize % R) as u8;
        if bucket.is_counter_null(y) {
            break;
        }
        let adj = (bucket.cx[y as usize] as f64 + half) % base;
        values.push(adj);
    }
    sample_variance(&values)
}

/// Multi-row hash table of [`Stage2Bucket`]s.
pub struct Stage2Monitor {
    rows: [Vec<Stage2Bucket>; STAGE2_ROWS],
}

impl Stage2Monitor {
    pub fn new(memory_bytes: usize) -> Self {
        let bucket_size = std::mem::size_of::<Stage2Bucket>().max(1);
        let per_row_bytes = memory_bytes / STAGE2_ROWS;
        let buckets_per_row = (per_row_bytes / bucket_size).max(1);
        let rows = std::array::from_fn(|_| vec![Stage2Bucket::default(); buckets_per_row]);
        Self { rows }
    }

    #[inline]
    fn index_for_row(&self, flow: &FlowId, row: usize) -> usize {
        let h = stage2_row_hash(flow.as_bytes(), row);
        index_in_range(h, self.rows[row].len() as u32)
    }

    fn indices(&self, flow: &FlowId) -> [usize; STAGE2_ROWS] {
        std::array::from_fn(|row| self.index_for_row(flow, row))
    }

    /// Feed one promoted-flow arrival at absolute window `current_window`.
    /// Emits at most one stable subflow per call, via `sink`. See spec
    /// §4.3 for the empty/counting/mixed path classification.
    pub fn process_potential_flow<S: StableFlowSink>(
        &mut self,
        flow: &FlowId,
        current_window: u32,
        sink: &mut S,
    ) {
        let y_current = (current_window as usize % R) as u8;
        let y_prev = (current_window.wrapping_sub(1) as usize % R) as u8;
        let y_prev2 = (current_window.wrapping_sub(2) as usize % R) as u8;

        let idx = self.indices(flow);

        let mut has_empty = false;
        let mut has_current_null = false;
        for row in 0..STAGE2_ROWS {
            let b = &self.rows[row][idx[row]];
            if b.empty() {
                has_empty = true;
            }
            if b.is_counter_null(y_current) {
                has_current_null = true;
            }
        }

        // (A) Empty path.
        if has_empty {
            for row in 0..STAGE2_ROWS {
                if self.rows[row][idx[row]].empty() {
                    self.rows[row][idx[row]].initialize_new_window(y_current, current_window);
                }
            }
            return;
        }

        // (B) Counting path: every selected bucket already has y_current.
        if !has_current_null {
            for row in 0..STAGE2_ROWS {
                let b = &mut self.rows[row][idx[row]];
                let max = ((1u32 << COUNTER_BITS) - 1) as u8;
                if b.cx[y_current as usize] < max {
                    b.cx[y_current as usize] += 1;
                } else {
                    b.cx[y_current as usize] = 0;
                    if !b.update_ck_on_rebirth(current_window) {
                        b.reset();
                        b.initialize_new_window(y_current, current_window);
                    }
                }
            }
            return;
        }

        // (C) Mixed path.
        let null_rows: Vec<usize> = (0..STAGE2_ROWS)
            .filter(|&row| self.rows[row][idx[row]].is_counter_null(y_current))
            .collect();
        if null_rows.is_empty() {
            return;
        }

        let mut havepassed = false;

        for row in null_rows {
            let n = self.rows[row][idx[row]].count_window_number();

            if n > 2
                && (self.rows[row][idx[row]].is_counter_null(y_prev)
                    || self.rows[row][idx[row]].is_counter_null(y_prev2))
            {
                let b = &mut self.rows[row][idx[row]];
                b.reset();
                b.initialize_new_window(y_current, current_window);
                continue;
            }
            if n <= 2 && self.rows[row][idx[row]].is_counter_null(y_prev) {
                let b = &mut self.rows[row][idx[row]];
                b.reset();
                b.initialize_new_window(y_current, current_window);
                continue;
            }
            if n <= 2 && !self.rows[row][idx[row]].is_counter_null(y_prev) {
                self.rows[row][idx[row]].initialize_new_window(y_current, current_window);
                continue;
            }

            // Stability check.
            if !self.rows[row][idx[row]].check_stability(y_prev, y_prev2, current_window) {
                let b = &mut self.rows[row][idx[row]];
                b.reset();
                b.initialize_new_window(y_current, current_window);
                continue;
            }

            let consecutive = calculate_consecutive_windows(&self.rows[row][idx[row]], current_window);
            if consecutive == SUBFLOW_WINDOWS as u32 {
                if !havepassed {
                    let w0 = current_window - SUBFLOW_WINDOWS as u32;
                    let bucket = &self.rows[row][idx[row]];
                    let mean_freq = calculate_mean_frequency(bucket, w0);
                    let var_direct = calculate_direct_variance(bucket, w0);
                    let var_offset = calculate_offset_variance(bucket, w0);
                    let variance = var_direct.min(var_offset);

                    if variance <= STABLE_THRESHOLD {
                        sink.process_steady_subflow(flow, w0, variance, mean_freq);
                        havepassed = true;
                        tracing::debug!(?flow, w0, variance, mean_freq, "stage2 emitted stable subflow");
                    }
                }
                let b = &mut self.rows[row][idx[row]];
                b.reset();
                b.initialize_new_window(y_current, current_window);
            } else {
                self.rows[row][idx[row]].initialize_new_window(y_current, current_window);
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

    #[derive(Default)]
    struct RecordingSink {
        reports: Vec<(FlowId, u32, f64, f64)>,
    }
    impl StableFlowSink for RecordingSink {
        fn process_steady_subflow(&mut self, flow: &FlowId, start_window: u32, variance: f64, mean_freq: f64) {
            self.reports.push((*flow, start_window, variance, mean_freq));
        }
    }

    #[test]
    fn bucket_packs_ck_fields_into_one_byte() {
        assert_eq!(std::mem::size_of::<u8>(), 1);
        let mut b = Stage2Bucket::default();
        assert_eq!(b.ck1(), 1);
        assert_eq!(b.ck2(), 1);
        assert!(!b.ck1_is_null());
        assert!(!b.ck2_is_null());
        b.set_ck1(6);
        b.set_ck2(3);
        b.set_ck1_is_null(true);
        assert_eq!(b.ck1(), 6);
        assert_eq!(b.ck2(), 3);
        assert!(b.ck1_is_null());
        assert!(!b.ck2_is_null());
    }

    #[test]
    fn uniform_arrivals_report_one_stable_subflow() {
        let mut s2 = Stage2Monitor::new(16 * 1024);
        let mut sink = RecordingSink::default();
        let f = flow(9);

        // Six windows of identical counts are enough to complete one
        // subflow of SUBFLOW_WINDOWS=5 consecutive windows with near-zero
        // variance: feed 7 arrivals per window across windows 15..=20,
        // exactly as in the end-to-end scenario in spec §8.
        for w in 15u32..=20 {
            for _ in 0..7 {
                s2.process_potential_flow(&f, w, &mut sink);
            }
        }

        assert_eq!(sink.reports.len(), 1);
        let (_, w0, variance, mean) = sink.reports[0];
        assert_eq!(w0, 15);
        assert!(variance <= STABLE_THRESHOLD);
        assert!((mean - 7.0).abs() < 1e-6);
    }

    #[test]
    fn highly_variable_arrivals_suppress_report() {
        let mut s2 = Stage2Monitor::new(16 * 1024);
        let mut sink = RecordingSink::default();
        let f = flow(11);

        let counts = [1u32, 50, 1, 50, 1, 50];
        for (i, &n) in counts.iter().enumerate() {
            let w = i as u32;
            for _ in 0..n {
                s2.process_potential_flow(&f, w, &mut sink);
            }
        }
        assert!(sink.reports.is_empty());
    }
}
