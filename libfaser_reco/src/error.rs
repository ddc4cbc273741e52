use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Found invalid detector keyword: {0}")]
    InvalidKeyword(String),
    #[error("Detector was given {0} indices; expected {1}")]
    BadIndexCount(usize, usize),
}

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("ChannelMap failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChannelMap failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("ChannelMap failed to parse a detector keyword: {0}")]
    BadDetKeyword(#[from] DetectorError),
    #[error("ChannelMap was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
    #[error("ChannelMap was given digitizer channel {0}, which does not exist")]
    BadChannel(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is missing a required value: {0}")]
    MissingValue(&'static str),
    #[error("Config value {0} is invalid: {1}")]
    InvalidValue(&'static str, String),
    #[error("Config requested HDF5 output but the library was built without the hdf5 feature")]
    Hdf5Unavailable,
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("Failed to load geometry as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Geometry failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Geometry failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Geometry contains sensor {0} more than once")]
    DuplicateSensor(u32),
    #[error("Geometry sensor {0} has a degenerate frame (axes must be non-zero and orthogonal)")]
    BadSensorFrame(u32),
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Could not open run input because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Run input failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run input failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum EventBuilderError {
    #[error("EventBuilder failed due a fragment that was out of order -- fragment event ID: {0} event builder event ID: {1}")]
    EventOutOfOrder(u64, u64),
}

#[derive(Debug, Error)]
pub enum RecoError {
    #[error("Event {0} has clusters on sensor {1}, which is not in the geometry")]
    UnknownSensor(u64, u32),
    #[error("Event {0} has a cluster at local position {2} outside of sensor {1}")]
    ClusterOutsideSensor(u64, u32, f64),
}

#[derive(Debug, Error)]
pub enum MomentumError {
    #[error("Momentum estimate needs two stations of three points, found {0} and {1}")]
    WrongPointCount(usize, usize),
    #[error("Station direction has no extent in the bending plane")]
    DegenerateDirection,
    #[error("Trajectory is straight in the bending plane; curvature cannot be estimated")]
    StraightTrajectory,
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Writer failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[cfg(feature = "hdf5")]
    #[error("Writer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to ChannelMap error: {0}")]
    MapError(#[from] ChannelMapError),
    #[error("Processor failed due to Geometry error: {0}")]
    GeometryError(#[from] GeometryError),
    #[error("Processor failed due to run input error: {0}")]
    InputError(#[from] InputError),
    #[error("Processor failed due to EventBuilder error: {0}")]
    EVBError(#[from] EventBuilderError),
    #[error("Processor failed due to Writer error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
