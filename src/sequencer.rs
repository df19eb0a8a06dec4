//! Per-sequencer state and the waveform table (§3 "Sequencer state",
//! "Waveform table"; §4.4 steps 4-6).

use indexmap::IndexMap;
use ndarray::Array1;

use crate::mapping::MixerCorrections;
use crate::schedule::OpInfo;

/// One entry of a waveform table: a pair of real sample arrays stored
/// under `<fingerprint>_I` / `<fingerprint>_Q` with consecutive indices.
#[derive(Debug, Clone)]
pub struct WaveformEntry {
    pub i_name: String,
    pub q_name: String,
    pub i_index: usize,
    pub q_index: usize,
    pub i_data: Vec<f64>,
    pub q_data: Vec<f64>,
}

/// Ordered, fingerprint-deduplicated waveform table (invariants 2-3 of
/// §8: dense even/odd index pairs in insertion order, identical
/// fingerprints share one entry).
#[derive(Debug, Clone, Default)]
pub struct WaveformTable {
    entries: IndexMap<String, WaveformEntry>,
    next_index: usize,
}

impl WaveformTable {
    /// Returns the existing (I, Q) index pair for `fingerprint`, or
    /// inserts a new entry from `re`/`im` and returns its fresh indices.
    pub fn get_or_insert(&mut self, fingerprint: &str, re: &Array1<f64>, im: &Array1<f64>) -> (usize, usize) {
        if let Some(existing) = self.entries.get(fingerprint) {
            return (existing.i_index, existing.q_index);
        }
        let i_index = self.next_index;
        let q_index = i_index + 1;
        self.next_index += 2;
        self.entries.insert(
            fingerprint.to_string(),
            WaveformEntry {
                i_name: format!("{fingerprint}_I"),
                q_name: format!("{fingerprint}_Q"),
                i_index,
                q_index,
                i_data: re.to_vec(),
                q_data: im.to_vec(),
            },
        );
        (i_index, q_index)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn indices_of(&self, fingerprint: &str) -> Option<(usize, usize)> {
        self.entries.get(fingerprint).map(|e| (e.i_index, e.q_index))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &WaveformEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Everything the Q1ASM emitter needs for one sequencer: its assigned
/// (port, clock), resolved IF, mixer corrections, and the pulse and
/// acquisition lists the distributor routed to it.
#[derive(Debug, Clone)]
pub struct SequencerState {
    pub device: String,
    pub output: String,
    pub seq_slot: String,
    pub port: String,
    pub clock: String,
    pub if_hz: f64,
    pub nco_en: bool,
    pub mixer: Option<MixerCorrections>,
    pub pulses: Vec<OpInfo>,
    pub acquisitions: Vec<OpInfo>,
}

impl SequencerState {
    pub fn has_data(&self) -> bool {
        !self.pulses.is_empty() || !self.acquisitions.is_empty()
    }

    /// `true` if any acquisition on this sequencer requests a raw-trace
    /// ("scope mode") protocol (§4.6, open question: scope-mode duration
    /// is the number of weighting samples, decided in DESIGN.md).
    pub fn is_scope_mode(&self) -> bool {
        self.acquisitions
            .iter()
            .any(|op| op.acquisition.as_ref().map(|a| a.protocol == "trace").unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn dedup_reuses_indices() {
        let mut table = WaveformTable::default();
        let re = array![0.1, 0.2];
        let im = array![0.0, 0.0];
        let (i1, q1) = table.get_or_insert("fp1", &re, &im);
        let (i2, q2) = table.get_or_insert("fp1", &re, &im);
        assert_eq!((i1, q1), (i2, q2));
        assert_eq!(i1, 0);
        assert_eq!(q1, 1);
    }

    #[test]
    fn distinct_fingerprints_get_disjoint_indices() {
        let mut table = WaveformTable::default();
        let re = array![0.1];
        let im = array![0.0];
        let (i1, q1) = table.get_or_insert("fp1", &re, &im);
        let (i2, q2) = table.get_or_insert("fp2", &re, &im);
        assert_eq!((i1, q1), (0, 1));
        assert_eq!((i2, q2), (2, 3));
    }
}
