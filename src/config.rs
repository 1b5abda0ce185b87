//! User-facing options with sensible defaults and builder chaining, mirroring
//! the teacher's `ETLOptions` shape: one struct, a `Default` with documented
//! values, and a `with_*` method per knob.

/// Per-stage memory budgets (bytes) and the Stage 3 RNG seed. Defaults
/// reproduce the source's fixed memory plan: 600 KiB split 50/550 between
/// Stage 1 and Stage 2, plus a separate 200 KiB for Stage 3.
#[derive(Clone, Copy, Debug)]
pub struct SketchConfig {
    pub stage1_memory_bytes: usize,
    pub stage2_memory_bytes: usize,
    pub stage3_memory_bytes: usize,
    /// `None` seeds Stage 3's replacement RNG from OS entropy. Set this for
    /// reproducible runs (tests, replay debugging).
    pub rng_seed: Option<u64>,
}

const STAGE1_2_TOTAL_MEMORY_BYTES: usize = 600 * 1024;
const STAGE1_MEMORY_NUMERATOR: usize = 50;
const STAGE1_MEMORY_DENOMINATOR: usize = 600;
const STAGE3_MEMORY_BYTES_DEFAULT: usize = 200 * 1024;

impl Default for SketchConfig {
    fn default() -> Self {
        let stage1 = STAGE1_2_TOTAL_MEMORY_BYTES * STAGE1_MEMORY_NUMERATOR / STAGE1_MEMORY_DENOMINATOR;
        let stage2 = STAGE1_2_TOTAL_MEMORY_BYTES - stage1;
        Self {
            stage1_memory_bytes: stage1,
            stage2_memory_bytes: stage2,
            stage3_memory_bytes: STAGE3_MEMORY_BYTES_DEFAULT,
            rng_seed: None,
        }
    }
}

impl SketchConfig {
    pub fn with_stage1_memory_bytes(mut self, bytes: usize) -> Self {
        self.stage1_memory_bytes = bytes.max(1);
        self
    }
    pub fn with_stage2_memory_bytes(mut self, bytes: usize) -> Self {
        self.stage2_memory_bytes = bytes.max(1);
        self
    }
    pub fn with_stage3_memory_bytes(mut self, bytes: usize) -> Self {
        self.stage3_memory_bytes = bytes.max(1);
        self
    }
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_memory_plan_matches_source_ratios() {
        let cfg = SketchConfig::default();
        assert_eq!(cfg.stage1_memory_bytes, 50 * 1024);
        assert_eq!(cfg.stage2_memory_bytes, 550 * 1024);
        assert_eq!(cfg.stage3_memory_bytes, 200 * 1024);
        assert!(cfg.rng_seed.is_none());
    }

    #[test]
    fn builder_methods_chain_and_override() {
        let cfg = SketchConfig::default()
            .with_stage1_memory_bytes(4096)
            .with_stage2_memory_bytes(8192)
            .with_stage3_memory_bytes(2048)
            .with_rng_seed(42);
        assert_eq!(cfg.stage1_memory_bytes, 4096);
        assert_eq!(cfg.stage2_memory_bytes, 8192);
        assert_eq!(cfg.stage3_memory_bytes, 2048);
        assert_eq!(cfg.rng_seed, Some(42));
    }
}
