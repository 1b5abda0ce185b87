use std::path::PathBuf;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use placidsketch::{CsvDirectorySource, EvictionObserver, FlowId, PlacidSketch, SketchConfig};

const DATA_ROOT: &str = "./data";

/// Prints every flow Stage 3 judges stable enough to report at eviction or
/// `finalize` time.
struct StdoutReporter;

impl EvictionObserver for StdoutReporter {
    fn on_stable_flow_evicted(
        &mut self,
        flow: &FlowId,
        start_window: u32,
        end_window: u32,
        subflow_count: u16,
        mean: f64,
        variance: f64,
    ) {
        println!(
            "{flow:?} stable [{start_window}..{end_window}] subflows={subflow_count} mean={mean:.3} variance={variance:.3}"
        );
    }
}

fn main() -> Result<()> {
    placidsketch::init_tracing_once();

    let dir = PathBuf::from(DATA_ROOT);
    let source = CsvDirectorySource::discover(&dir).with_context(|| format!("scanning {}", dir.display()))?;
    if source.is_empty() {
        println!("no CSV files found under {}", dir.display());
        return Ok(());
    }

    let pb = ProgressBar::new(source.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  elapsed: {elapsed_precise}",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message("windows processed");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let mut sketch = PlacidSketch::new(SketchConfig::default()).with_eviction_observer(StdoutReporter);

    let mut last_window = None;
    source.for_each_event(|flow, window| {
        if last_window != Some(window) {
            pb.set_position(window as u64);
            last_window = Some(window);
        }
        sketch.process_packet(&flow, window);
    })?;

    sketch.finalize();
    pb.finish_with_message("done");

    Ok(())
}
