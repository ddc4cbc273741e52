use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::baseline::{AdvancedBaseline, BaselineEstimator, SimpleBaseline};
use super::calorimeter::CalorimeterHitMaker;
use super::clock::ClockPhaseExtractor;
use super::constants::{DEFAULT_BASELINE_SAMPLES, MAX_SCT_GAP_PARAMETER, SENSOR_WIDTH_MARGIN};
use super::error::ConfigError;
use super::hit_reco::{HitReconstructor, Polarity, StaticTiming};
use super::momentum::{ChargeSign, MomentumEstimator};
use super::peak_fitter::PeakFitter;
use super::seed::SeedBuilder;
use super::space_point::{IntersectionMode, SpacePointMaker};

/// Format of the per-run output file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Hdf5,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yml",
            Self::Hdf5 => "h5",
        }
    }
}

/// Waveform reconstruction controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    /// Only meaningful for digitization; read so that shared job options parse
    pub advanced_timing: bool,
    pub use_simple_baseline: bool,
    pub baseline_samples: usize,
    pub baseline_range_start: usize,
    pub baseline_range_end: Option<usize>,
    pub primary_peak_threshold: f64,
    pub secondary_peak_threshold: f64,
    pub fit_window_start: i64,
    pub fit_window_width: usize,
    pub remove_overflow: bool,
    pub timing_peak_fraction: f64,
    pub find_secondary_before: bool,
    pub find_secondary_after: bool,
    pub max_secondary_hits: usize,
    pub polarity: Polarity,
    pub refine_clock: bool,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        let reco = HitReconstructor::default();
        let fitter = PeakFitter::default();
        Self {
            advanced_timing: false,
            use_simple_baseline: false,
            baseline_samples: DEFAULT_BASELINE_SAMPLES,
            baseline_range_start: 0,
            baseline_range_end: None,
            primary_peak_threshold: reco.primary_peak_threshold,
            secondary_peak_threshold: reco.secondary_peak_threshold,
            fit_window_start: reco.fit_window_start,
            fit_window_width: reco.fit_window_width,
            remove_overflow: fitter.remove_overflow,
            timing_peak_fraction: fitter.timing_peak_fraction,
            find_secondary_before: reco.find_secondary_before,
            find_secondary_after: reco.find_secondary_after,
            max_secondary_hits: reco.max_secondary_hits,
            polarity: reco.polarity,
            refine_clock: reco.clock.refine_with_fit,
        }
    }
}

impl WaveformConfig {
    pub fn hit_reconstructor(&self) -> HitReconstructor {
        let baseline = if self.use_simple_baseline {
            BaselineEstimator::Simple(SimpleBaseline {
                n_samples: self.baseline_samples,
            })
        } else {
            BaselineEstimator::Advanced(AdvancedBaseline {
                range_start: self.baseline_range_start,
                range_end: self.baseline_range_end,
                ..Default::default()
            })
        };
        HitReconstructor {
            baseline,
            peak_fitter: PeakFitter {
                timing_peak_fraction: self.timing_peak_fraction,
                remove_overflow: self.remove_overflow,
                ..Default::default()
            },
            primary_peak_threshold: self.primary_peak_threshold,
            secondary_peak_threshold: self.secondary_peak_threshold,
            fit_window_start: self.fit_window_start,
            fit_window_width: self.fit_window_width,
            find_secondary_before: self.find_secondary_before,
            find_secondary_after: self.find_secondary_after,
            max_secondary_hits: self.max_secondary_hits,
            polarity: self.polarity,
            clock: ClockPhaseExtractor {
                refine_with_fit: self.refine_clock,
                ..Default::default()
            },
        }
    }
}

/// Space point, seed and momentum controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub overlap_limit_opposite: f64,
    pub overlap_limit_phi: f64,
    pub overlap_limit_eta_min: f64,
    pub overlap_limit_eta_max: f64,
    pub sct_gap_parameter: f64,
    pub strip_length_tolerance: f64,
    pub sensor_width_margin: f64,
    pub process_overlaps: bool,
    pub all_clusters: bool,
    pub intersection: IntersectionMode,
    pub max_chi2: f64,
    pub use_biased_residual: bool,
    pub make_doublets: bool,
    pub seed_sigma_x: f64,
    pub seed_sigma_y: f64,
    pub cross_stations: (u8, u8),
    pub field_tesla: f64,
    pub charge: ChargeSign,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let sp = SpacePointMaker::default();
        let seeds = SeedBuilder::default();
        let momentum = MomentumEstimator::default();
        Self {
            overlap_limit_opposite: sp.overlap_limit_opposite,
            overlap_limit_phi: sp.overlap_limit_phi,
            overlap_limit_eta_min: sp.overlap_limit_eta_min,
            overlap_limit_eta_max: sp.overlap_limit_eta_max,
            sct_gap_parameter: sp.sct_gap_parameter,
            strip_length_tolerance: sp.strip_length_tolerance,
            sensor_width_margin: SENSOR_WIDTH_MARGIN,
            process_overlaps: sp.process_overlaps,
            all_clusters: sp.all_clusters,
            intersection: sp.mode,
            max_chi2: seeds.max_chi2,
            use_biased_residual: seeds.use_biased_residual,
            make_doublets: seeds.make_doublets,
            seed_sigma_x: seeds.sigma_x,
            seed_sigma_y: seeds.sigma_y,
            cross_stations: seeds.cross_stations,
            field_tesla: momentum.field_tesla,
            charge: momentum.charge,
        }
    }
}

impl TrackerConfig {
    pub fn space_point_maker(&self) -> SpacePointMaker {
        SpacePointMaker {
            overlap_limit_opposite: self.overlap_limit_opposite,
            overlap_limit_phi: self.overlap_limit_phi,
            overlap_limit_eta_min: self.overlap_limit_eta_min,
            overlap_limit_eta_max: self.overlap_limit_eta_max,
            strip_length_tolerance: self.strip_length_tolerance,
            process_overlaps: self.process_overlaps,
            all_clusters: self.all_clusters,
            mode: self.intersection,
            ..Default::default()
        }
        .with_gap_parameter(self.sct_gap_parameter)
    }

    pub fn seed_builder(&self) -> SeedBuilder {
        SeedBuilder {
            max_chi2: self.max_chi2,
            use_biased_residual: self.use_biased_residual,
            make_doublets: self.make_doublets,
            sigma_x: self.seed_sigma_x,
            sigma_y: self.seed_sigma_y,
            cross_stations: self.cross_stations,
            ..Default::default()
        }
    }

    pub fn momentum_estimator(&self) -> MomentumEstimator {
        MomentumEstimator {
            field_tesla: self.field_tesla,
            charge: self.charge,
        }
    }
}

/// Structure representing the application configuration. Contains pathing, run information
/// and the algorithm controls.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub input_path: PathBuf,
    /// None runs without the tracker: clusters are ignored
    #[serde(default)]
    pub geometry_path: Option<PathBuf>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub channel_map_path: Option<PathBuf>,
    pub first_run_number: i32,
    pub last_run_number: i32,
    pub n_threads: i32,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub waveform: WaveformConfig,
    #[serde(default)]
    pub timing: StaticTiming,
    #[serde(default)]
    pub calorimeter: CalorimeterHitMaker,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for Config {
    /// Generate a new Config object. Paths are placeholders and must be filled in.
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("None"),
            geometry_path: None,
            output_path: PathBuf::from("None"),
            channel_map_path: None,
            first_run_number: 0,
            last_run_number: 0,
            n_threads: 1,
            output_format: OutputFormat::default(),
            waveform: WaveformConfig::default(),
            timing: StaticTiming::default(),
            calorimeter: CalorimeterHitMaker::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration as YAML
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Fatal checks done before any run is touched
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.input_path.exists() {
            return Err(ConfigError::BadFilePath(self.input_path.clone()));
        }
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        if let Some(path) = &self.geometry_path {
            if !path.exists() {
                return Err(ConfigError::BadFilePath(path.clone()));
            }
        }
        if !self.is_n_threads_valid() {
            return Err(ConfigError::InvalidValue(
                "n_threads",
                format!("{} (must be at least 1)", self.n_threads),
            ));
        }
        if self.first_run_number > self.last_run_number {
            return Err(ConfigError::InvalidValue(
                "first_run_number",
                format!(
                    "{} is after last_run_number {}",
                    self.first_run_number, self.last_run_number
                ),
            ));
        }
        if self.waveform.fit_window_width == 0 {
            return Err(ConfigError::MissingValue("fit_window_width"));
        }
        let fraction = self.waveform.timing_peak_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::InvalidValue(
                "timing_peak_fraction",
                format!("{fraction} (must be between 0 and 1)"),
            ));
        }
        if self.waveform.use_simple_baseline && self.waveform.baseline_samples == 0 {
            return Err(ConfigError::MissingValue("baseline_samples"));
        }
        if self.tracker.max_chi2 <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "max_chi2",
                format!("{} (must be positive)", self.tracker.max_chi2),
            ));
        }
        if self.tracker.sct_gap_parameter > MAX_SCT_GAP_PARAMETER {
            log::warn!(
                "sct_gap_parameter {} will be clamped to {MAX_SCT_GAP_PARAMETER}",
                self.tracker.sct_gap_parameter
            );
        }
        if self.output_format == OutputFormat::Hdf5 && !cfg!(feature = "hdf5") {
            return Err(ConfigError::Hdf5Unavailable);
        }
        Ok(())
    }

    /// Check if a specific run exists by evaluating the existance of its input file
    pub fn does_run_exist(&self, run_number: i32) -> bool {
        self.get_run_file(run_number).exists()
    }

    /// Get the path to a run's input file
    pub fn get_run_file(&self, run_number: i32) -> PathBuf {
        self.input_path
            .join(format!("{}.yml", self.get_run_str(run_number)))
    }

    /// Get the path to the output file
    pub fn get_output_file(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        Ok(self.output_path.join(format!(
            "{}_reco.{}",
            self.get_run_str(run_number),
            self.output_format.extension()
        )))
    }

    /// Construct the run string, run_NNNN
    fn get_run_str(&self, run_number: i32) -> String {
        format!("run_{run_number:0>4}")
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }
}
