//! Stage 3 — Merger: concatenates consecutive stable subflows of the same
//! flow into a bucketed store, incrementally tracking a merged (mean,
//! variance) estimator and evicting cells under a probabilistic
//! replacement policy. See spec §4.4.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::consts::{MIN_SUBFLOWS, P, Q, STABLE_THRESHOLD, STAGE3_BUCKETS};
use crate::flow::FlowId;
use crate::hashing::{index_in_range, murmur3_x86_32, STAGE3_SEED};
use crate::stage2::StableFlowSink;

#[derive(Clone, Copy)]
struct Stage3Cell {
    id: FlowId,
    window: u16,
    number: u16,
    mean: f64,
    variance: f64,
}

impl Default for Stage3Cell {
    fn default() -> Self {
        Self { id: FlowId::default(), window: 0, number: 0, mean: 0.0, variance: 0.0 }
    }
}

impl Stage3Cell {
    #[inline]
    fn is_empty(&self) -> bool {
        self.id.is_zero()
    }
}

/// Observer invoked from `clearCell` for any evicted cell that accumulated
/// at least `Q` merged subflows — the source computes this data and
/// discards it (spec §9's dead reporting path); PlacidSketch externalizes
/// it as a pluggable observer instead, defaulting to a no-op.
pub trait EvictionObserver {
    fn on_stable_flow_evicted(
        &mut self,
        flow: &FlowId,
        start_window: u32,
        end_window: u32,
        subflow_count: u16,
        mean: f64,
        variance: f64,
    );
}

fn merged_stats(count: u16, mean_star: f64, var_star: f64, new_mean: f64, new_var: f64) -> (f64, f64) {
    let c = count as f64;
    let mu_star = (c * mean_star + new_mean) / (c + 1.0);
    let term1 = c * (var_star + (mean_star - mu_star).powi(2)) / (c + 1.0);
    let term2 = (new_var + (new_mean - mu_star).powi(2)) / (c + 1.0);
    (mu_star, term1 + term2)
}

/// `STAGE3_BUCKETS` buckets, each of `⌊STAGE3_MEMORY_BYTES / l / sizeof(Cell)⌋`
/// cells, minimum 1.
pub struct Stage3Merger {
    buckets: [Vec<Stage3Cell>; STAGE3_BUCKETS],
    rng: StdRng,
    observer: Option<Box<dyn EvictionObserver>>,
}

impl Stage3Merger {
    pub fn new(memory_bytes: usize) -> Self {
        Self::with_rng(memory_bytes, StdRng::from_entropy())
    }

    /// Construct with a seeded RNG so Case D's probabilistic replacement is
    /// reproducible in tests (spec §9's design note).
    pub fn with_seed(memory_bytes: usize, seed: u64) -> Self {
        Self::with_rng(memory_bytes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(memory_bytes: usize, rng: StdRng) -> Self {
        let cell_size = std::mem::size_of::<Stage3Cell>().max(1);
        let per_bucket_bytes = memory_bytes / STAGE3_BUCKETS;
        let cells_per_bucket = (per_bucket_bytes / cell_size).max(1);
        let buckets = std::array::from_fn(|_| vec![Stage3Cell::default(); cells_per_bucket]);
        Self { buckets, rng, observer: None }
    }

    pub fn with_observer(mut self, observer: impl EvictionObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    fn clear_cell(&mut self, bucket_idx: usize, idx: usize) {
        let cell = self.buckets[bucket_idx][idx];
        if !cell.is_empty() {
            tracing::trace!(bucket_idx, idx, number = cell.number, "stage3 cell evicted");
        }
        if !cell.is_empty() && cell.number >= 1 && cell.number >= Q && cell.variance <= STABLE_THRESHOLD {
            let end_window = cell.window as u32 + cell.number as u32 * MIN_SUBFLOWS - 1;
            tracing::debug!(flow = ?cell.id, start_window = cell.window as u32, end_window, "stage3 reporting stable flow");
            if let Some(observer) = self.observer.as_mut() {
                observer.on_stable_flow_evicted(
                    &cell.id,
                    cell.window as u32,
                    end_window,
                    cell.number,
                    cell.mean,
                    cell.variance,
                );
            }
        }
        self.buckets[bucket_idx][idx] = Stage3Cell::default();
    }

    fn init_new_cell(&mut self, bucket_idx: usize, idx: usize, flow: &FlowId, start_w: u32, variance: f64, mean: f64) {
        let cell = &mut self.buckets[bucket_idx][idx];
        cell.id = *flow;
        cell.window = start_w as u16;
        cell.mean = mean;
        cell.variance = variance;
        cell.number = 1;
    }

    fn merge_cell(&mut self, bucket_idx: usize, idx: usize, new_variance: f64, new_mean: f64) {
        let cell = &mut self.buckets[bucket_idx][idx];
        if cell.number < P {
            let (mu, v) = merged_stats(cell.number, cell.mean, cell.variance, new_mean, new_variance);
            cell.number += 1;
            cell.mean = mu;
            cell.variance = v;
            tracing::trace!(bucket_idx, idx, number = cell.number, mean = mu, variance = v, "stage3 cell merged");
        }
    }

    fn handle_steady_subflow(&mut self, flow: &FlowId, start_w: u32, variance: f64, mean: f64) {
        let h = murmur3_x86_32(flow.as_bytes(), STAGE3_SEED);
        let bucket_idx = index_in_range(h, STAGE3_BUCKETS as u32);
        let bucket_len = self.buckets[bucket_idx].len();

        let mut empty_index: Option<usize> = None;
        let mut target_index: Option<usize> = None;
        let mut discontinuous: Vec<usize> = Vec::new();

        for i in 0..bucket_len {
            let cell = &self.buckets[bucket_idx][i];
            if cell.is_empty() {
                if empty_index.is_none() {
                    empty_index = Some(i);
                }
                continue;
            }
            if cell.id.0 == flow.0 {
                target_index = Some(i);
            } else {
                let last_win = cell.window as u32 + cell.number as u32 * MIN_SUBFLOWS;
                if start_w != last_win {
                    discontinuous.push(i);
                }
            }
        }

        if let Some(ti) = target_index {
            let target = self.buckets[bucket_idx][ti];
            let last_win = target.window as u32 + target.number as u32 * MIN_SUBFLOWS;

            if start_w != last_win {
                // Case B, discontinuous: report (if long enough) and reset.
                self.clear_cell(bucket_idx, ti);
                self.init_new_cell(bucket_idx, ti, flow, start_w, variance, mean);
            } else {
                let (_, merged_variance) = merged_stats(target.number, target.mean, target.variance, mean, variance);
                if merged_variance <= STABLE_THRESHOLD {
                    self.merge_cell(bucket_idx, ti, variance, mean);
                    if self.buckets[bucket_idx][ti].number >= P {
                        self.clear_cell(bucket_idx, ti);
                        self.init_new_cell(bucket_idx, ti, flow, start_w, variance, mean);
                    }
                } else {
                    self.clear_cell(bucket_idx, ti);
                    self.init_new_cell(bucket_idx, ti, flow, start_w, variance, mean);
                }
            }
            return;
        }

        // Case A: no match, an empty slot is available.
        if let Some(ei) = empty_index {
            self.init_new_cell(bucket_idx, ei, flow, start_w, variance, mean);
            return;
        }

        // Case C: no match, no empty slot, some discontinuous cells —
        // evict the discontinuous cell with the smallest `number` (ties:
        // first found).
        if !discontinuous.is_empty() {
            let mut victim = discontinuous[0];
            for &i in &discontinuous {
                if self.buckets[bucket_idx][i].number < self.buckets[bucket_idx][victim].number {
                    victim = i;
                }
            }
            self.clear_cell(bucket_idx, victim);
            self.init_new_cell(bucket_idx, victim, flow, start_w, variance, mean);
            return;
        }

        // Case D: every cell in the bucket is still continuous — evict the
        // smallest-`number` cell with probability `1 / max(1, number*MIN_SUBFLOWS - MIN_SUBFLOWS + 1)`.
        let mut victim = 0usize;
        let mut min_number = u16::MAX;
        for i in 0..bucket_len {
            let n = self.buckets[bucket_idx][i].number;
            if n < min_number {
                min_number = n;
                victim = i;
            }
        }
        let total_stable_windows = min_number as i64 * MIN_SUBFLOWS as i64;
        let denom = (total_stable_windows - MIN_SUBFLOWS as i64 + 1).max(1) as f64;
        let replace_prob = 1.0 / denom;
        let roll: f64 = self.rng.gen();
        if roll <= replace_prob {
            self.clear_cell(bucket_idx, victim);
            self.init_new_cell(bucket_idx, victim, flow, start_w, variance, mean);
        } else {
            tracing::trace!(?flow, start_w, "stage3 dropped subflow under replacement policy");
        }
    }

    pub fn process_steady_subflow(&mut self, flow: &FlowId, start_w: u32, variance: f64, mean: f64) {
        self.handle_steady_subflow(flow, start_w, variance, mean);
    }

    /// Flush every cell, reporting any that qualify (spec §4.4's single
    /// flush point). Idempotent: calling it again on an already-cleared
    /// store is a no-op per cell.
    pub fn finalize(&mut self) {
        for bucket_idx in 0..STAGE3_BUCKETS {
            for idx in 0..self.buckets[bucket_idx].len() {
                self.clear_cell(bucket_idx, idx);
            }
        }
    }
}

impl StableFlowSink for Stage3Merger {
    fn process_steady_subflow(&mut self, flow: &FlowId, start_window: u32, variance: f64, mean_freq: f64) {
        self.handle_steady_subflow(flow, start_window, variance, mean_freq);
    }
}
