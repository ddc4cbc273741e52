// Digitizer
/// Fixed sampling period of the digitizer boards
pub const SAMPLE_PERIOD_NS: f64 = 2.0;
/// Full scale of the 14-bit ADC
pub const ADC_FULL_SCALE_COUNTS: f64 = 16384.0;
/// Maximum number of channels on a digitizer board
pub const MAX_CHANNELS: u32 = 32;
/// Termination of the PMT readout, used to turn mV*ns into pC
pub const INPUT_IMPEDANCE_OHM: f64 = 50.0;

// Baseline
pub const DEFAULT_BASELINE_SAMPLES: usize = 40;
pub const COARSE_HIST_BINS: usize = 320;
pub const COARSE_HIST_MIN: f64 = 0.0;
pub const COARSE_HIST_MAX: f64 = 16000.0;
pub const FINE_HIST_WIDTH: usize = 200;
/// Occupied fine bins needed for the pedestal gaussian fit
pub const MIN_BASELINE_FIT_BINS: usize = 4;

// Peak fitting
pub const DEFAULT_RAW_SIGMA_NS: f64 = 2.0;
pub const GAUSS_SIGMA_MAX_NS: f64 = 20.0;
pub const CB_N_INITIAL: f64 = 2.0;
pub const CB_N_MAX: f64 = 1000.0;
pub const CB_ALPHA_INITIAL: f64 = -0.25;
pub const CB_ALPHA_MIN: f64 = -10.0;
pub const CB_ALPHA_MAX: f64 = 0.0;
/// Step used when integrating the fitted Crystal Ball shape
pub const CB_INTEGRATION_STEP_NS: f64 = 0.1;
/// Candidates closer than this to a claimed window are ignored
pub const SECONDARY_EDGE_SAMPLES: usize = 5;

// Clock
pub const DEFAULT_CLOCK_MIN_SAMPLES: usize = 40;
pub const LHC_CLOCK_MIN_MHZ: f64 = 40.0;
pub const LHC_CLOCK_MAX_MHZ: f64 = 40.1;

// Tracker
/// Number of layers in one tracker station
pub const LAYERS_PER_STATION: usize = 3;
/// Default safety margin added to a sensor half-width
pub const SENSOR_WIDTH_MARGIN: f64 = 0.02;
/// Upper bound accepted for the gap parameter
pub const MAX_SCT_GAP_PARAMETER: f64 = 0.002;
/// Fixed widening (mm) of the first phi-overlap window whenever the gap parameter is set.
/// This does not follow the computed gap offset.
pub const PHI_OVERLAP_GAP_WIDENING: f64 = 20.0;
/// Stations with at least this many space points are skipped by the seed builder
pub const MAX_STATION_SPACE_POINTS: usize = 100;
/// Stations need at least this many space points to be seeded
pub const MIN_STATION_SPACE_POINTS: usize = 2;

// Physics
/// p[GeV] = 0.3 * B[T] * R[m]
pub const MOMENTUM_PER_TESLA_METER: f64 = 0.3;
