//! # faser_reco
//!
//! faser_reco is an offline reconstruction for FASER, written in Rust. It takes decoded
//! readout fragments (digitizer waveforms and tracker strip clusters), builds events from
//! them and reconstructs waveform hits, calorimeter energies, the LHC clock phase, tracker
//! space points, track seeds and momentum estimates.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! To build and install the CLI use `cargo install --path ./faser_reco_cli` from the top
//! level repository. The binary is installed to your cargo install location (typically
//! `~/.cargo/bin/`).
//!
//! ### HDF5
//!
//! HDF5 output is optional and enabled with the `hdf5` feature
//! (`cargo install --path ./faser_reco_cli --features hdf5`). HDF5 must then be installed.
//! If it lives in a custom location, write the following into `.cargo/config.toml`:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ## Configuration
//!
//! `faser_reco_cli --path config.yml new` writes a template. The run controls are:
//!
//! - `input_path`: directory holding one `run_NNNN.yml` input file per run
//! - `geometry_path`: tracker geometry YAML file. If `null`, tracker reconstruction is
//! disabled and clusters are ignored.
//! - `output_path`: directory the `run_NNNN_reco.yml` (or `.h5`) files are written to
//! - `channel_map_path`: digitizer channel map CSV. If `null`, the bundled map is used.
//! - `first_run_number`, `last_run_number`: the run range (inclusive)
//! - `n_threads`: number of workers. Runs are dealt round-robin to the workers; workers
//! that would get no run are not started.
//! - `output_format`: `yaml` or `hdf5`
//!
//! The `waveform`, `timing`, `calorimeter` and `tracker` sections hold the algorithm
//! controls; every key has a default and may be left out.
//!
//! ### Channel Map Format
//!
//! The channel map is a CSV file with *no* whitespaces and a header line:
//!
//! ```csv
//! channel,keyword,a,b,c
//! ```
//!
//! Supported keywords and their indices are `calo` (row, module), `preshower`
//! (station, plate), `trigger` (station, plate, pmt), `veto` (station, plate),
//! `vetonu` (station, plate) and `clock` (no indices).
//!
//! ### Run Input Format
//!
//! ```yml
//! run_number: 12
//! fragments:
//!   - type: digitizer
//!     event_number: 0
//!     waveforms:
//!       - { channel: 0, n_samples: 600, adc_counts: [...], range: 2.0 }
//!   - type: tracker
//!     event_number: 0
//!     clusters:
//!       - sensor: { station: 1, layer: 0, phi: 0, eta: 1, side: 0 }
//!         local_position: 4.5
//!         width: 0.08
//! ```
//!
//! Fragments must be ordered by event number.
//!
//! ## Output
//!
//! The YAML output holds one document per event with the waveform hits, calorimeter hits,
//! clock, space points, overlap space points, seeds and track candidates. The HDF5 layout
//! is documented in the `hdf_writer` module.
pub mod baseline;
pub mod cache;
pub mod calorimeter;
pub mod channel_map;
pub mod clock;
pub mod config;
pub mod constants;
pub mod detector_id;
pub mod error;
pub mod event;
pub mod event_builder;
pub mod fit;
pub mod geometry;
#[cfg(feature = "hdf5")]
pub mod hdf_writer;
pub mod hit;
pub mod hit_reco;
pub mod momentum;
pub mod neighbour_table;
pub mod peak_fitter;
pub mod process;
pub mod reco_writer;
pub mod reconstruction;
pub mod seed;
pub mod space_point;
pub mod tracker_id;
pub mod waveform;
pub mod worker_status;
