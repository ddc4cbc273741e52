use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::config::OutputFormat;
use super::error::WriterError;
use super::event::RecoEvent;
#[cfg(feature = "hdf5")]
use super::hdf_writer::HDFWriter;

/// Writes reconstructed events as a stream of YAML documents, one per event
#[derive(Debug)]
pub struct YamlWriter {
    file: BufWriter<File>,
    path: PathBuf,
    events_written: u64,
    first_event: Option<u64>,
    last_event: Option<u64>,
}

impl YamlWriter {
    pub fn new(path: &Path) -> Result<Self, WriterError> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            path: path.to_path_buf(),
            events_written: 0,
            first_event: None,
            last_event: None,
        })
    }

    pub fn write_event(&mut self, event: &RecoEvent) -> Result<(), WriterError> {
        self.file.write_all(b"---\n")?;
        self.file
            .write_all(serde_yaml::to_string(event)?.as_bytes())?;
        self.first_event.get_or_insert(event.event_number);
        self.last_event = Some(event.event_number);
        self.events_written += 1;
        Ok(())
    }

    /// Flush to disk and report, consuming the writer
    pub fn close(mut self) -> Result<(), WriterError> {
        self.file.flush()?;
        let size = std::fs::metadata(&self.path)?.len();
        log::info!(
            "{} events written to {:?} ({}), event numbers {:?} to {:?}",
            self.events_written,
            self.path,
            human_bytes::human_bytes(size as f64),
            self.first_event,
            self.last_event
        );
        Ok(())
    }
}

/// The writer picked by the output format of the configuration
#[derive(Debug)]
pub enum OutputWriter {
    Yaml(YamlWriter),
    #[cfg(feature = "hdf5")]
    Hdf5(HDFWriter),
}

impl OutputWriter {
    pub fn new(path: &Path, format: OutputFormat) -> Result<Self, WriterError> {
        match format {
            OutputFormat::Yaml => Ok(Self::Yaml(YamlWriter::new(path)?)),
            #[cfg(feature = "hdf5")]
            OutputFormat::Hdf5 => Ok(Self::Hdf5(HDFWriter::new(path)?)),
            #[cfg(not(feature = "hdf5"))]
            OutputFormat::Hdf5 => {
                log::warn!("Built without HDF5 support, writing YAML to {path:?}");
                Ok(Self::Yaml(YamlWriter::new(path)?))
            }
        }
    }

    pub fn write_event(&mut self, event: &RecoEvent) -> Result<(), WriterError> {
        match self {
            Self::Yaml(w) => w.write_event(event),
            #[cfg(feature = "hdf5")]
            Self::Hdf5(w) => w.write_event(event),
        }
    }

    pub fn close(self) -> Result<(), WriterError> {
        match self {
            Self::Yaml(w) => w.close(),
            #[cfg(feature = "hdf5")]
            Self::Hdf5(w) => w.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::WaveformHit;
    use serde::Deserialize;

    #[test]
    fn test_yaml_stream() {
        let path = std::env::temp_dir().join("faser_reco_writer_test.yml");
        let mut writer = OutputWriter::new(&path, OutputFormat::Yaml).unwrap();
        for event_number in [4, 5] {
            let event = RecoEvent {
                event_number,
                hits: vec![WaveformHit::new(2, None)],
                ..Default::default()
            };
            writer.write_event(&event).unwrap();
        }
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<RecoEvent> = serde_yaml::Deserializer::from_str(&text)
            .map(|doc| RecoEvent::deserialize(doc).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_number, 5);
        assert_eq!(events[0].hits[0].channel, 2);
        assert_eq!(events[0].hits[0].bcid_time, -1.0);
        std::fs::remove_file(&path).ok();
    }
}
