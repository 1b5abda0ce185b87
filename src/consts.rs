//! Global constants from spec §3. These are fixed at construction (unlike
//! the per-stage memory budgets in [`crate::config::SketchConfig`], which a
//! host can size to its own memory budget) — they define the shape of the
//! algorithm itself, not how much RAM it gets.

/// Flow fingerprint width, in bytes.
pub const KEY_LEN: usize = 16;

/// Stage 1 hash rows.
pub const STAGE1_ROWS: usize = 3;

/// Stage 2 hash rows.
pub const STAGE2_ROWS: usize = 2;

/// Stage 3 bucket count (`l`).
pub const STAGE3_BUCKETS: usize = 4;

/// Windows per candidate subflow.
pub const SUBFLOW_WINDOWS: usize = 5;

/// Stage 2 per-window counter width, in bits.
pub const COUNTER_BITS: u32 = 8;

/// Rebirth tolerance used by the stability check.
pub const ALPHA_THRESHOLD: u32 = 10;

/// Maximum variance accepted as "stable".
pub const STABLE_THRESHOLD: f64 = 5.0;

/// Stage 3: max merged subflows per cell.
pub const P: u16 = 400;

/// Stage 3: "long-enough" reporting threshold.
pub const Q: u16 = 40;

/// Windows covered by one reported subflow (== `SUBFLOW_WINDOWS`).
pub const MIN_SUBFLOWS: u32 = SUBFLOW_WINDOWS as u32;
