//! Artifact assembler (§4.6): gathers per-sequencer bundles and per-
//! module/per-LO settings into the compiled-schedule mapping (§6).

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::CompileError;
use crate::q1asm::Program;
use crate::sequencer::WaveformTable;

/// One waveform-table entry as emitted in the per-sequencer JSON blob.
#[derive(Debug, Clone, Serialize)]
pub struct WaveformJson {
    pub data: Vec<f64>,
    pub index: usize,
}

fn waveform_table_to_json(table: &WaveformTable) -> IndexMap<String, WaveformJson> {
    let mut out = IndexMap::new();
    for (_, entry) in table.entries() {
        out.insert(
            entry.i_name.clone(),
            WaveformJson {
                data: entry.i_data.clone(),
                index: entry.i_index,
            },
        );
        out.insert(
            entry.q_name.clone(),
            WaveformJson {
                data: entry.q_data.clone(),
                index: entry.q_index,
            },
        );
    }
    out
}

/// The per-sequencer JSON blob (§6): program text, waveform table and
/// acquisition-weights table.
#[derive(Debug, Clone, Serialize)]
pub struct SequencerBlob {
    pub program: String,
    pub waveforms: IndexMap<String, WaveformJson>,
    pub weights: IndexMap<String, WaveformJson>,
}

impl SequencerBlob {
    pub fn new(program: &Program, waveforms: &WaveformTable, weights: &WaveformTable) -> Self {
        SequencerBlob {
            program: program.to_text(),
            waveforms: waveform_table_to_json(waveforms),
            weights: waveform_table_to_json(weights),
        }
    }
}

/// Sequencer-level settings (§6).
#[derive(Debug, Clone, Serialize)]
pub struct SequencerSettings {
    pub nco_en: bool,
    pub sync_en: bool,
    pub modulation_freq: f64,
    pub awg_offset_path_0: f64,
    pub awg_offset_path_1: f64,
    pub duration: usize,
}

/// One sequencer's contribution to a device's artifact entry: the blob
/// (in place of a path to a JSON file on disk — writing it out is a
/// caller concern, see DESIGN.md) plus its settings.
#[derive(Debug, Clone, Serialize)]
pub struct SequencerBundle {
    pub blob: SequencerBlob,
    pub settings: SequencerSettings,
}

/// Per-device settings (§6): reference source, hardware-average count,
/// the scope-mode sequencer if any, and any LO frequencies owned
/// directly by this device's outputs.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSettings {
    #[serde(rename = "ref")]
    pub reference: String,
    pub hardware_averages: u64,
    pub scope_mode_sequencer: Option<String>,
    #[serde(flatten)]
    pub lo_freqs: IndexMap<String, f64>,
}

/// One device's full artifact entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceArtifact {
    pub settings: DeviceSettings,
    #[serde(flatten)]
    pub sequencers: IndexMap<String, SequencerBundle>,
}

/// A standalone local-oscillator's artifact entry.
#[derive(Debug, Clone, Serialize)]
pub struct LoArtifact {
    pub lo_freq: f64,
}

/// Tags an artifact entry as either a sequencer-bearing device or a
/// standalone local oscillator, matching the two shapes the external
/// interface allows at the top level (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ArtifactEntry {
    Device(DeviceArtifact),
    LocalOscillator(LoArtifact),
}

/// The full compiled-schedule mapping, keyed by device/LO name.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CompiledArtifact {
    #[serde(flatten)]
    pub entries: IndexMap<String, ArtifactEntry>,
}

impl CompiledArtifact {
    pub fn to_json_string(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self).map_err(|e| CompileError::MalformedDocument(e.to_string()))
    }
}
