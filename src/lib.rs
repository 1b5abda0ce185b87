mod config;
mod consts;
mod csv_source;
mod flow;
mod hashing;
mod sketch;
mod stage1;
mod stage2;
mod stage3;
mod util;

pub use crate::config::SketchConfig;
pub use crate::consts::{
    ALPHA_THRESHOLD, COUNTER_BITS, KEY_LEN, MIN_SUBFLOWS, P, Q, STABLE_THRESHOLD, STAGE1_ROWS, STAGE2_ROWS,
    STAGE3_BUCKETS, SUBFLOW_WINDOWS,
};
pub use crate::csv_source::CsvDirectorySource;
pub use crate::flow::FlowId;
pub use crate::sketch::PlacidSketch;
pub use crate::stage2::StableFlowSink;
pub use crate::stage3::EvictionObserver;
pub use crate::util::init_tracing_once;
