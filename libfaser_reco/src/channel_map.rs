// The digitizer map is small: one board, up to 32 channels. Each row of the CSV maps a
// digitizer channel to a detector keyword plus the indices that keyword needs.
//
// channel -> DetectorId(kind, indices)
//
// Clock channels carry no indices. The reconstruction iterates the map in channel order so
// that hit output is stable from run to run.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::constants::MAX_CHANNELS;
use super::detector_id::{DetectorId, DetectorKind};
use super::error::ChannelMapError;

const MIN_ENTRIES_PER_LINE: usize = 2; //Min number of elements (channel, keyword)

/// Load the default map for windows
#[cfg(target_family = "windows")]
fn load_default_map() -> String {
    String::from(include_str!("data\\default_channel_map.csv"))
}

/// Load the default map for macos and linux
#[cfg(target_family = "unix")]
fn load_default_map() -> String {
    String::from(include_str!("data/default_channel_map.csv"))
}

/// ChannelMap contains the mapping of digitizer channels to FASER detector identifiers.
///
/// This can change from run period to run period, so ChannelMap reads in a CSV file where each row
/// contains the channel, a detector keyword and the indices for that keyword.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    map: FxHashMap<u32, DetectorId>,
}

impl ChannelMap {
    /// Create a new ChannelMap
    /// If the path is None, we load the default that is bundled with the library
    pub fn new(path: Option<&Path>) -> Result<Self, ChannelMapError> {
        let mut contents = String::new();
        if let Some(p) = path {
            let mut file = File::open(p)?;
            file.read_to_string(&mut contents)?;
        } else {
            contents = load_default_map();
        }
        Self::from_csv(&contents)
    }

    /// Parse the CSV contents of a channel map. The first line is a header.
    pub fn from_csv(contents: &str) -> Result<Self, ChannelMapError> {
        let mut cm = ChannelMap::default();

        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').map(|e| e.trim()).collect();
            if entries.len() < MIN_ENTRIES_PER_LINE {
                return Err(ChannelMapError::BadFileFormat);
            }

            let channel: u32 = entries[0].parse()?;
            if channel >= MAX_CHANNELS {
                return Err(ChannelMapError::BadChannel(channel));
            }
            let kind: DetectorKind = entries[1].parse()?;
            if entries.len() != MIN_ENTRIES_PER_LINE + kind.n_indices() {
                return Err(ChannelMapError::BadFileFormat);
            }
            let mut indices = Vec::with_capacity(kind.n_indices());
            for entry in entries[MIN_ENTRIES_PER_LINE..].iter() {
                indices.push(entry.parse::<u8>()?);
            }
            cm.map
                .insert(channel, DetectorId::new(entries[1], &indices)?);
        }

        Ok(cm)
    }

    /// Get the DetectorId for a given digitizer channel.
    ///
    /// If returns None the channel is not connected
    pub fn get_detector_id(&self, channel: u32) -> Option<&DetectorId> {
        self.map.get(&channel)
    }

    /// The first channel connected to the clock, if any
    pub fn get_clock_channel(&self) -> Option<u32> {
        self.channels().into_iter().find(|ch| self.map[ch].is_clock())
    }

    /// All mapped channels in ascending order
    pub fn channels(&self) -> Vec<u32> {
        let mut channels: Vec<u32> = self.map.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// All mapped channels which carry PMT signals (i.e. everything except the clock)
    pub fn signal_channels(&self) -> Vec<(u32, DetectorId)> {
        self.channels()
            .into_iter()
            .filter_map(|ch| {
                let id = self.map[&ch];
                (!id.is_clock()).then_some((ch, id))
            })
            .collect()
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_map() {
        let map = match ChannelMap::new(None) {
            Ok(m) => m,
            Err(_) => {
                panic!();
            }
        };
        let expected_id = DetectorId::new("trigger", &[0, 1, 0]).unwrap();
        let given_id = match map.get_detector_id(10) {
            Some(id) => id,
            None => panic!(),
        };
        assert_eq!(expected_id, *given_id);
        assert_eq!(map.get_clock_channel(), Some(15));
        assert_eq!(map.signal_channels().len(), 15);
    }

    #[test]
    fn test_bad_map() {
        let bad_columns = "channel,keyword,a,b\n0,calo,0\n";
        assert!(matches!(
            ChannelMap::from_csv(bad_columns),
            Err(ChannelMapError::BadFileFormat)
        ));
        let bad_channel = "channel,keyword,a,b\n40,calo,0,0\n";
        assert!(matches!(
            ChannelMap::from_csv(bad_channel),
            Err(ChannelMapError::BadChannel(40))
        ));
        let bad_keyword = "channel,keyword,a,b\n1,pad,0,0\n";
        assert!(ChannelMap::from_csv(bad_keyword).is_err());
    }
}
