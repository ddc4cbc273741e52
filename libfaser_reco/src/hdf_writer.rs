use hdf5::types::VarLenUnicode;
use hdf5::File;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::WriterError;
use super::event::RecoEvent;

const EVENTS_NAME: &str = "events";
const HITS_NAME: &str = "hits";
const HIT_STATUS_NAME: &str = "hit_status";
const CALO_NAME: &str = "calo_hits";
const SPACE_POINTS_NAME: &str = "space_points";
const OVERLAP_NAME: &str = "overlap_space_points";
const SEEDS_NAME: &str = "seeds";
const TRACKS_NAME: &str = "tracks";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// Columns of the hits dataset
const HIT_COLUMNS: usize = 14;

/// A simple struct which wraps around the hdf5-rust library.
///
/// Opens an HDF5 file and writes one group per reconstructed event:
///
/// ```text
/// run_0001_reco.h5
/// events - min_event, max_event, version
/// |---- event_#  - event_number, clock_frequency, clock_phase
/// |    |---- hits(dset) - channel, baseline_mean, baseline_rms, raw_peak, raw_integral,
/// |    |                  peak, mean, width, integral, localtime, chi2ndf, bcid_time,
/// |    |                  trigger_time, alpha
/// |    |---- hit_status(dset)
/// |    |---- calo_hits(dset) - channel, nmip, e_dep, e_em, fit_to_raw_ratio
/// |    |---- space_points(dset) - x, y, z, station, layer
/// |    |---- overlap_space_points(dset)
/// |    |---- seeds(dset) - p0, p1, p2, p3, chi2, station, n_points
/// |    |---- tracks(dset) - px, py, pz, p, charge
/// ```
/// Datasets with no rows are not written.
#[derive(Debug)]
pub struct HDFWriter {
    file_handle: File,
    path: PathBuf,
    events_group: hdf5::Group,
    first_event: Option<u64>,
    last_event: u64,
    events_written: u64,
}

impl HDFWriter {
    /// Create the writer, opening a file at path and creating the events group
    pub fn new(path: &Path) -> Result<Self, WriterError> {
        let file_handle = File::create(path)?;
        let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);
        let version = VarLenUnicode::from_str(&version)
            .map_err(|e| hdf5::Error::from(e.to_string()))?;

        let events_group = file_handle.create_group(EVENTS_NAME)?;
        events_group.new_attr::<u64>().create("min_event")?;
        events_group.new_attr::<u64>().create("max_event")?;
        events_group
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&version)?;

        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
            events_group,
            first_event: None,
            last_event: 0,
            events_written: 0,
        })
    }

    fn write_rows(
        group: &hdf5::Group,
        name: &str,
        columns: usize,
        rows: Vec<Vec<f64>>,
    ) -> Result<(), WriterError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut matrix = Array2::<f64>::zeros([rows.len(), columns]);
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().take(columns).enumerate() {
                matrix[[i, j]] = *value;
            }
        }
        group.new_dataset_builder().with_data(&matrix).create(name)?;
        Ok(())
    }

    /// Write one event as a group of data matrices
    pub fn write_event(&mut self, event: &RecoEvent) -> Result<(), WriterError> {
        self.first_event.get_or_insert(event.event_number);
        self.last_event = self.last_event.max(event.event_number);
        self.events_written += 1;

        let group = self
            .events_group
            .create_group(&format!("event_{}", event.event_number))?;
        group
            .new_attr::<u64>()
            .create("event_number")?
            .write_scalar(&event.event_number)?;
        let clock = event.clock.unwrap_or_default();
        group
            .new_attr::<f64>()
            .create("clock_frequency")?
            .write_scalar(&clock.frequency)?;
        group
            .new_attr::<f64>()
            .create("clock_phase")?
            .write_scalar(&clock.phase)?;

        let hits = event
            .hits
            .iter()
            .map(|h| {
                vec![
                    h.channel as f64,
                    h.baseline_mean,
                    h.baseline_rms,
                    h.raw_peak,
                    h.raw_integral,
                    h.peak,
                    h.mean,
                    h.width,
                    h.integral,
                    h.localtime,
                    h.chi2ndf,
                    h.bcid_time,
                    h.trigger_time,
                    h.alpha,
                ]
            })
            .collect();
        Self::write_rows(&group, HITS_NAME, HIT_COLUMNS, hits)?;
        if !event.hits.is_empty() {
            let status: Vec<u32> = event.hits.iter().map(|h| h.status.bits()).collect();
            group
                .new_dataset_builder()
                .with_data(status.as_slice())
                .create(HIT_STATUS_NAME)?;
        }

        let calo = event
            .calo_hits
            .iter()
            .map(|c| vec![c.channel as f64, c.nmip, c.e_dep, c.e_em, c.fit_to_raw_ratio])
            .collect();
        Self::write_rows(&group, CALO_NAME, 5, calo)?;

        for (name, points) in [
            (SPACE_POINTS_NAME, &event.space_points),
            (OVERLAP_NAME, &event.overlap_space_points),
        ] {
            let rows = points
                .iter()
                .map(|sp| {
                    vec![
                        sp.position.x,
                        sp.position.y,
                        sp.position.z,
                        sp.station as f64,
                        sp.layer as f64,
                    ]
                })
                .collect();
            Self::write_rows(&group, name, 5, rows)?;
        }

        let seeds = event
            .seeds
            .iter()
            .map(|s| {
                let mut row = s.params.to_vec();
                row.push(s.fit.map_or(-1.0, |f| f.chi2));
                row.push(s.station as f64);
                row.push(s.space_points.len() as f64);
                row
            })
            .collect();
        Self::write_rows(&group, SEEDS_NAME, 7, seeds)?;

        let tracks = event
            .tracks
            .iter()
            .map(|t| {
                let m = &t.estimate.momentum;
                vec![m.x, m.y, m.z, t.estimate.p, t.estimate.charge]
            })
            .collect();
        Self::write_rows(&group, TRACKS_NAME, 5, tracks)?;
        Ok(())
    }

    /// Write meta information on first and last events, consume the writer
    pub fn close(self) -> Result<(), WriterError> {
        self.events_group
            .attr("min_event")?
            .write_scalar(&self.first_event.unwrap_or(0))?;
        self.events_group
            .attr("max_event")?
            .write_scalar(&self.last_event)?;
        self.file_handle.flush()?;
        let size = std::fs::metadata(&self.path)?.len();
        log::info!(
            "{} events written to {:?} ({})",
            self.events_written,
            self.path,
            human_bytes::human_bytes(size as f64)
        );
        Ok(())
    }
}
