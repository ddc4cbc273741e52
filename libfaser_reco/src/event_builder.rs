use super::error::EventBuilderError;
use super::event::{InputFragment, RawEvent};

/// EventBuilder takes InputFragments and composes them into RawEvents.
///
/// Fragments arrive in event number order. All fragments sharing an event number make up one
/// event; the first fragment of a later event completes the event being built.
#[derive(Debug, Default)]
pub struct EventBuilder {
    current_event: Option<u64>,
    fragment_stack: Vec<InputFragment>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment to the event.
    ///
    /// Returns `Ok(Some(event))` when the fragment belongs to a later event, in which case the
    /// previous event is complete and a new one is started for the fragment. A fragment from
    /// an earlier event is an error.
    #[allow(clippy::comparison_chain)]
    pub fn append_fragment(
        &mut self,
        fragment: InputFragment,
    ) -> Result<Option<RawEvent>, EventBuilderError> {
        let event_number = fragment.event_number();
        let Some(current) = self.current_event else {
            self.current_event = Some(event_number);
            self.fragment_stack.push(fragment);
            return Ok(None);
        };
        if event_number < current {
            Err(EventBuilderError::EventOutOfOrder(event_number, current))
        } else if event_number > current {
            let event = RawEvent::new(current, std::mem::take(&mut self.fragment_stack));
            self.current_event = Some(event_number);
            self.fragment_stack.push(fragment);
            Ok(Some(event))
        } else {
            self.fragment_stack.push(fragment);
            Ok(None)
        }
    }

    /// Takes any remaining fragments and flushes them to an event.
    ///
    /// Used at the end of a run. Returns None if nothing was left over.
    pub fn flush_final_event(&mut self) -> Option<RawEvent> {
        let current = self.current_event.take()?;
        if self.fragment_stack.is_empty() {
            return None;
        }
        Some(RawEvent::new(
            current,
            std::mem::take(&mut self.fragment_stack),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::RawWaveform;

    fn digitizer(event_number: u64, channel: u32) -> InputFragment {
        InputFragment::Digitizer {
            event_number,
            waveforms: vec![RawWaveform::new(channel, vec![8000; 4], 2.0)],
        }
    }

    #[test]
    fn test_build_events() {
        let mut evb = EventBuilder::new();
        assert!(evb.append_fragment(digitizer(1, 0)).unwrap().is_none());
        assert!(evb.append_fragment(digitizer(1, 1)).unwrap().is_none());
        let first = evb.append_fragment(digitizer(2, 0)).unwrap().unwrap();
        assert_eq!(first.event_number, 1);
        assert_eq!(first.waveforms.len(), 2);

        assert!(matches!(
            evb.append_fragment(digitizer(1, 2)),
            Err(EventBuilderError::EventOutOfOrder(1, 2))
        ));

        let last = evb.flush_final_event().unwrap();
        assert_eq!(last.event_number, 2);
        assert_eq!(last.waveforms.len(), 1);
        assert!(evb.flush_final_event().is_none());
    }
}
