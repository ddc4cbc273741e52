use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::config::Config;
use super::error::ProcessorError;
use super::event::{RawEvent, RunInput};
use super::event_builder::EventBuilder;
use super::reco_writer::OutputWriter;
use super::reconstruction::Reconstructor;
use super::worker_status::{Stage, WorkerStatus};

/// Fraction of a run between progress messages
const FLUSH_FRACTION: f32 = 0.01;

/// Counts events and reports progress of one run
struct RunState<'a> {
    tx: &'a Sender<WorkerStatus>,
    run_number: i32,
    worker_id: usize,
    events_written: u64,
    events_skipped: u64,
}

impl RunState<'_> {
    fn send(&self, progress: f32, stage: Stage) -> Result<(), ProcessorError> {
        self.tx.send(WorkerStatus::new(
            progress,
            self.run_number,
            self.worker_id,
            stage,
        ))?;
        Ok(())
    }

    fn handle_event(
        &mut self,
        reco: &Reconstructor,
        raw: RawEvent,
        writer: &mut OutputWriter,
    ) -> Result<(), ProcessorError> {
        match reco.reconstruct_event(&raw, self.worker_id) {
            Ok(event) => {
                writer.write_event(&event)?;
                self.events_written += 1;
            }
            Err(e) => {
                log::warn!("Skipping event {} of run {}: {e}", raw.event_number, self.run_number);
                self.events_skipped += 1;
            }
        }
        Ok(())
    }
}

/// The main loop of faser_reco.
///
/// Reads the run's input fragments, builds events, reconstructs them and writes the output.
/// Progress is reported through `tx`.
pub fn process_run(
    config: &Config,
    reco: &Reconstructor,
    run_number: i32,
    tx: &Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<(), ProcessorError> {
    let mut state = RunState {
        tx,
        run_number,
        worker_id,
        events_written: 0,
        events_skipped: 0,
    };
    state.send(0.0, Stage::Loading)?;
    let run_file = config.get_run_file(run_number);
    let input_size = std::fs::metadata(&run_file)?.len();
    log::info!(
        "Total run size: {}",
        human_bytes::human_bytes(input_size as f64)
    );
    let input = RunInput::read(&run_file)?;
    if input.run_number != run_number {
        log::warn!(
            "Run file {run_file:?} says it holds run {}, expected {run_number}",
            input.run_number
        );
    }
    state.send(1.0, Stage::Loading)?;

    let output_path = config.get_output_file(run_number)?;
    let mut writer = OutputWriter::new(&output_path, config.output_format)?;
    let mut evb = EventBuilder::new();

    let total = input.fragments.len().max(1);
    let flush_val = ((total as f32 * FLUSH_FRACTION) as usize).max(1);
    let mut progress: f32 = 0.0;
    state.send(progress, Stage::Reconstructing)?;
    for (count, fragment) in input.fragments.into_iter().enumerate() {
        if (count + 1) % flush_val == 0 {
            progress = (count + 1) as f32 / total as f32;
            state.send(progress, Stage::Reconstructing)?;
        }
        if let Some(raw) = evb.append_fragment(fragment)? {
            state.handle_event(reco, raw, &mut writer)?;
        }
    }
    // The final event of the EventBuilder needs a manual flush
    if let Some(raw) = evb.flush_final_event() {
        state.handle_event(reco, raw, &mut writer)?;
    } else {
        log::warn!("Run {run_number} had no events");
    }
    state.send(1.0, Stage::Reconstructing)?;

    state.send(0.0, Stage::Writing)?;
    writer.close()?;
    state.send(1.0, Stage::Writing)?;
    log::info!(
        "Run {run_number}: {} events reconstructed, {} skipped",
        state.events_written,
        state.events_skipped
    );
    Ok(())
}

/// The function to be called by a separate thread. Processes the whole run range of the
/// configuration.
pub fn process(
    config: Config,
    reco: Arc<Reconstructor>,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<(), ProcessorError> {
    let runs = (config.first_run_number..(config.last_run_number + 1)).collect();
    process_subset(config, reco, tx, worker_id, runs)
}

/// Process a subset of runs
pub fn process_subset(
    config: Config,
    reco: Arc<Reconstructor>,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
    subset: Vec<i32>,
) -> Result<(), ProcessorError> {
    for run in subset {
        if config.does_run_exist(run) {
            log::info!("Processing run {}...", run);
            process_run(&config, &reco, run, &tx, worker_id)?;
            log::info!("Finished processing run {}.", run);
        } else {
            log::info!("Run {} does not exist, skipping...", run);
        }
    }
    Ok(())
}

/// Divide a run range in to a set of subranges (per thread/worker)
pub fn create_subsets(config: &Config) -> Vec<Vec<i32>> {
    let mut subsets: Vec<Vec<i32>> = vec![Vec::new(); config.n_threads.max(1) as usize];
    let n_subsets = subsets.len();

    for (idx, run) in (config.first_run_number..(config.last_run_number + 1)).enumerate() {
        subsets[idx % n_subsets].push(run)
    }

    subsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::ChannelMap;
    use crate::event::InputFragment;
    use crate::waveform::RawWaveform;
    use std::sync::mpsc;

    #[test]
    fn test_create_subsets() {
        let config = Config {
            first_run_number: 1,
            last_run_number: 5,
            n_threads: 2,
            ..Default::default()
        };
        assert_eq!(create_subsets(&config), vec![vec![1, 3, 5], vec![2, 4]]);
    }

    #[test]
    fn test_process_run() {
        let dir = std::env::temp_dir().join("faser_reco_process_test");
        std::fs::create_dir_all(&dir).unwrap();
        let config = Config {
            input_path: dir.clone(),
            output_path: dir.clone(),
            first_run_number: 2,
            last_run_number: 3,
            ..Default::default()
        };
        let fragments = (0..3)
            .map(|event_number| InputFragment::Digitizer {
                event_number,
                waveforms: vec![RawWaveform::new(0, vec![8000; 600], 2.0)],
            })
            .collect();
        let input = RunInput {
            run_number: 2,
            fragments,
        };
        std::fs::write(
            config.get_run_file(2),
            serde_yaml::to_string(&input).unwrap(),
        )
        .unwrap();
        std::fs::remove_file(config.get_run_file(3)).ok();

        let reco = Arc::new(Reconstructor::new(
            &config,
            ChannelMap::new(None).unwrap(),
            None,
            1,
        ));
        let (tx, rx) = mpsc::channel();
        process(config.clone(), reco, tx, 0).unwrap();
        let statuses: Vec<WorkerStatus> = rx.try_iter().collect();
        assert!(statuses.iter().all(|s| s.run_number == 2));
        assert!(statuses
            .iter()
            .any(|s| s.stage == Stage::Writing && s.progress == 1.0));

        let output = std::fs::read_to_string(config.get_output_file(2).unwrap()).unwrap();
        assert_eq!(output.matches("event_number:").count(), 3);
    }
}
