use std::collections::BTreeMap;

use serde::Serialize;

use crate::codec::{META_TEMPO, TrackChunk};

pub const DEFAULT_SECONDS_PER_QUARTER: f64 = 0.5;

/// Absolute tick to seconds-per-quarter table, always anchored at tick 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempoMap {
    ticks_per_quarter: u16,
    entries: BTreeMap<u64, f64>,
}

impl TempoMap {
    #[must_use]
    pub fn new(ticks_per_quarter: u16) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, DEFAULT_SECONDS_PER_QUARTER);
        Self {
            ticks_per_quarter,
            entries,
        }
    }

    /// Collects set-tempo meta events from every track. The first event seen
    /// at a given tick wins; zero-microsecond tempos are ignored.
    #[must_use]
    pub fn from_tracks(tracks: &[TrackChunk], ticks_per_quarter: u16) -> Self {
        let mut entries = BTreeMap::new();
        for event in tracks.iter().flat_map(|track| &track.events) {
            if !event.is_meta(META_TEMPO) {
                continue;
            }
            let Some(micros) = event.meta_payload().and_then(tempo_micros) else {
                continue;
            };
            if micros == 0 {
                continue;
            }
            entries
                .entry(event.absolute_ticks)
                .or_insert(f64::from(micros) * 1e-6);
        }
        entries.entry(0).or_insert(DEFAULT_SECONDS_PER_QUARTER);

        Self {
            ticks_per_quarter,
            entries,
        }
    }

    pub fn insert(&mut self, tick: u64, seconds_per_quarter: f64) {
        if seconds_per_quarter > 0.0 && seconds_per_quarter.is_finite() {
            self.entries.insert(tick, seconds_per_quarter);
        }
    }

    #[must_use]
    pub fn ticks_per_quarter(&self) -> u16 {
        self.ticks_per_quarter
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.entries.iter().map(|(&tick, &spq)| (tick, spq))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn seconds_per_quarter_at(&self, tick: u64) -> f64 {
        self.entries
            .range(..=tick)
            .next_back()
            .map_or(DEFAULT_SECONDS_PER_QUARTER, |(_, &spq)| spq)
    }

    /// Integrates every tempo segment below `tick`, then the partial segment
    /// from the last change up to `tick`.
    #[must_use]
    pub fn ticks_to_seconds(&self, tick: u64) -> f64 {
        if tick == 0 || self.ticks_per_quarter == 0 {
            return 0.0;
        }

        let ppq = f64::from(self.ticks_per_quarter);
        let mut seconds = 0.0;
        let mut segment_start = 0_u64;
        let mut segment_spq = DEFAULT_SECONDS_PER_QUARTER;

        for (&entry_tick, &spq) in self.entries.range(..tick) {
            seconds += (entry_tick - segment_start) as f64 / ppq * segment_spq;
            segment_start = entry_tick;
            segment_spq = spq;
        }

        seconds + (tick - segment_start) as f64 / ppq * segment_spq
    }

    #[must_use]
    pub fn bpm_at(&self, tick: u64) -> f64 {
        60.0 / self.seconds_per_quarter_at(tick)
    }
}

fn tempo_micros(payload: &[u8]) -> Option<u32> {
    match payload {
        [a, b, c] => Some(u32::from_be_bytes([0, *a, *b, *c])),
        _ => None,
    }
}
