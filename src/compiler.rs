//! Top-level orchestrator: chains the five pipeline stages (§2) the way
//! the device layer this crate is grounded on chains per-device compile
//! calls from one top-level entry point.

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::Value;

use crate::artifact::{
    ArtifactEntry, CompiledArtifact, DeviceArtifact, DeviceSettings, LoArtifact, SequencerBlob, SequencerBundle,
    SequencerSettings,
};
use crate::distributor::distribute;
use crate::error::{CompileError, Warning};
use crate::frequency::resolve_frequencies;
use crate::mapping::build_index;
use crate::module::{descriptor_for, ModuleDescriptor};
use crate::q1asm::{emit_program, natural_length_ns, CompiledPulse};
use crate::schedule::Schedule;
use crate::sequencer::{SequencerState, WaveformTable};
use crate::utils::fingerprint_of;
use crate::waveform::{is_staircase, sample_pulse, sample_weight, SamplerRegistry};

/// Compiles a hardware-mapping document and a schedule document into a
/// compiled artifact, returning any non-fatal warnings alongside it.
pub fn compile_schedule(
    mapping_doc: &Value,
    schedule: &Schedule,
) -> Result<(CompiledArtifact, Vec<Warning>), CompileError> {
    let index = build_index(mapping_doc)?;
    info!("hardware mapping indexed: {} port/clock pairs", index.port_clock.len());

    let buckets = distribute(schedule, &index)?;
    debug!("operations distributed across {} sequencers", buckets.len());

    let clock_freqs: IndexMap<String, (f64, Option<f64>)> = schedule
        .resources
        .iter()
        .map(|(clock, res)| (clock.clone(), (res.freq, res.downconverter_freq)))
        .collect();

    let active: Vec<(String, String)> = buckets
        .iter()
        .filter(|(_, ops)| !ops.pulses.is_empty() || !ops.acquisitions.is_empty())
        .map(|(key, _)| key.clone())
        .collect();

    let (if_by_portclock, lo_by_name, mut warnings) = resolve_frequencies(&index, &clock_freqs, &active)?;
    info!("frequencies resolved for {} active port/clock pairs", active.len());

    let registry = SamplerRegistry::default();
    let mut artifact = CompiledArtifact::default();

    for (device_name, device_meta) in &index.devices {
        let Some(descriptor) = descriptor_for(&device_meta.instrument_type) else {
            continue;
        };
        if device_meta.seq_slots.len() > descriptor.max_sequencers {
            return Err(CompileError::TooManySequencers {
                device: device_name.clone(),
                found: device_meta.seq_slots.len(),
                max: descriptor.max_sequencers,
            });
        }

        let mut sequencer_states: Vec<SequencerState> = Vec::new();
        for (key, location) in index.port_clock.iter().filter(|(_, loc)| &loc.device == device_name) {
            let Some(ops) = buckets.get(key) else { continue };
            let output_meta = device_meta.outputs.get(&location.output);
            let if_hz = if_by_portclock.get(key).copied().unwrap_or(0.0);
            sequencer_states.push(SequencerState {
                device: device_name.clone(),
                output: location.output.clone(),
                seq_slot: location.seq_slot.clone(),
                port: key.0.clone(),
                clock: key.1.clone(),
                if_hz,
                nco_en: location.nco_en,
                mixer: output_meta.and_then(|o| o.mixer),
                pulses: ops.pulses.clone(),
                acquisitions: ops.acquisitions.clone(),
            });
        }

        let mut bundles: IndexMap<String, SequencerBundle> = IndexMap::new();
        let mut scope_mode_seq: Option<String> = None;

        // First pass: sample waveforms and compute each sequencer's
        // natural (unpadded) body length, so the global total_play_time
        // can be derived before any program is actually emitted.
        let mut per_seq_compiled: Vec<(IndexMap<String, CompiledPulse>, WaveformTable, WaveformTable, i64)> =
            Vec::new();
        let mut total_play_time_ns: i64 = 0;

        for seq in &sequencer_states {
            if !seq.has_data() {
                per_seq_compiled.push((IndexMap::new(), WaveformTable::default(), WaveformTable::default(), 0));
                continue;
            }
            let (compiled_pulses, waveform_table) = build_waveform_table(&registry, seq, descriptor)?;
            let weight_table = build_weight_table(&registry, seq)?;
            let natural = natural_length_ns(seq, &compiled_pulses);
            total_play_time_ns = total_play_time_ns.max(natural);
            per_seq_compiled.push((compiled_pulses, waveform_table, weight_table, natural));
        }

        // Round the global play time up to the grid, as every other
        // timing quantity in the pipeline is (invariant 5).
        if total_play_time_ns % crate::utils::GRID_NS != 0 {
            total_play_time_ns += crate::utils::GRID_NS - (total_play_time_ns % crate::utils::GRID_NS);
        }

        for (seq, (compiled_pulses, waveform_table, weight_table, _natural)) in
            sequencer_states.iter().zip(per_seq_compiled.into_iter())
        {
            if !seq.has_data() {
                continue;
            }
            if seq.is_scope_mode() {
                if let Some(existing) = &scope_mode_seq {
                    return Err(CompileError::ScopeModeConflict {
                        device: device_name.clone(),
                        first_seq: existing.clone(),
                        second_seq: seq.seq_slot.clone(),
                    });
                }
                scope_mode_seq = Some(seq.seq_slot.clone());
            }

            let (program, mut seq_warnings) =
                emit_program(seq, &descriptor, &compiled_pulses, schedule.repetitions, total_play_time_ns)?;
            warnings.append(&mut seq_warnings);

            let duration_samples = if seq.is_scope_mode() {
                scope_mode_duration_samples(seq)
            } else {
                total_play_time_ns as usize
            };

            let (offset_0, offset_1) = match &seq.mixer {
                Some(m) => (m.offset_i / descriptor.peak_voltage_v, m.offset_q / descriptor.peak_voltage_v),
                None => (0.0, 0.0),
            };

            let settings = SequencerSettings {
                nco_en: seq.nco_en,
                sync_en: true,
                modulation_freq: seq.if_hz,
                awg_offset_path_0: offset_0,
                awg_offset_path_1: offset_1,
                duration: duration_samples,
            };
            let blob = SequencerBlob::new(&program, &waveform_table, &weight_table);
            bundles.insert(seq.seq_slot.clone(), SequencerBundle { blob, settings });
        }

        if bundles.is_empty() {
            continue;
        }

        let mut lo_freqs = IndexMap::new();
        for (output_name, output_meta) in &device_meta.outputs {
            if let Some(lo_name) = &output_meta.lo_name {
                if let Some(freq) = lo_by_name.get(lo_name) {
                    let k = trailing_number(output_name).unwrap_or(0);
                    lo_freqs.insert(format!("lo{k}_freq"), *freq);
                }
            }
        }

        let device_settings = DeviceSettings {
            reference: device_meta.reference.clone(),
            hardware_averages: schedule.repetitions,
            scope_mode_sequencer: scope_mode_seq,
            lo_freqs,
        };
        artifact.entries.insert(
            device_name.clone(),
            ArtifactEntry::Device(DeviceArtifact {
                settings: device_settings,
                sequencers: bundles,
            }),
        );
    }

    for (lo_name, device_meta) in &index.devices {
        if device_meta.instrument_type != "LocalOscillator" {
            continue;
        }
        if let Some(freq) = lo_by_name.get(lo_name) {
            artifact
                .entries
                .insert(lo_name.clone(), ArtifactEntry::LocalOscillator(LoArtifact { lo_freq: *freq }));
        } else {
            warn!("local oscillator {lo_name} is unreferenced and dropped from the artifact");
        }
    }

    // Local oscillators referenced only via an output's `lo_name` (never
    // declared as a top-level `instrument_type: LocalOscillator` device)
    // still need a resolved-frequency entry of their own (§4.3/§6).
    for (lo_name, freq) in &lo_by_name {
        artifact
            .entries
            .entry(lo_name.clone())
            .or_insert_with(|| ArtifactEntry::LocalOscillator(LoArtifact { lo_freq: *freq }));
    }

    Ok((artifact, warnings))
}

fn trailing_number(name: &str) -> Option<u32> {
    let digits: String = name.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

fn scope_mode_duration_samples(seq: &SequencerState) -> usize {
    for op in &seq.acquisitions {
        if let Some(acq) = &op.acquisition {
            if acq.protocol == "trace" {
                if let Some(weight) = acq.waveforms.first() {
                    return crate::utils::seconds_to_samples(weight.duration);
                }
                return crate::utils::seconds_to_samples(acq.duration);
            }
        }
    }
    0
}

fn build_waveform_table(
    registry: &SamplerRegistry,
    seq: &SequencerState,
    descriptor: ModuleDescriptor,
) -> Result<(IndexMap<String, CompiledPulse>, WaveformTable), CompileError> {
    let mut table = WaveformTable::default();
    let mut compiled: IndexMap<String, CompiledPulse> = IndexMap::new();

    for op in &seq.pulses {
        let Some(pulse) = &op.pulse else { continue };
        if pulse.wf_func.is_none() || is_staircase(pulse) {
            continue;
        }
        if compiled.contains_key(&op.fingerprint) {
            continue;
        }
        let sampled = sample_pulse(registry, pulse, op.timing_ns, seq.if_hz, seq.mixer.as_ref())?
            .expect("non-idle, non-staircase pulses always sample");

        let peak = sampled.gain_i.max(sampled.gain_q);
        if peak > descriptor.peak_voltage_v {
            return Err(CompileError::AmplitudeOutOfRange {
                device: seq.device.clone(),
                fingerprint: op.fingerprint.clone(),
                value: peak,
                limit: descriptor.peak_voltage_v,
            });
        }

        let (i_index, q_index) = table.get_or_insert(&op.fingerprint, &sampled.re, &sampled.im);
        compiled.insert(
            op.fingerprint.clone(),
            CompiledPulse {
                i_index,
                q_index,
                gain_i: sampled.gain_i,
                gain_q: sampled.gain_q,
                stitch: sampled.stitch,
            },
        );
    }

    Ok((compiled, table))
}

fn build_weight_table(registry: &SamplerRegistry, seq: &SequencerState) -> Result<WaveformTable, CompileError> {
    let mut table = WaveformTable::default();
    for op in &seq.acquisitions {
        let Some(acq) = &op.acquisition else { continue };
        for weight in &acq.waveforms {
            let value = serde_json::to_value(weight).map_err(|e| CompileError::MalformedDocument(e.to_string()))?;
            let fingerprint = fingerprint_of(&crate::utils::without_key(&value, "t0"));
            if table.contains(&fingerprint) {
                continue;
            }
            if let Some((re, im)) = sample_weight(registry, weight)? {
                table.get_or_insert(&fingerprint, &re, &im);
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{AcquisitionInfo, ClockResource, OperationData, PulseInfo, Schedulable};
    use serde_json::json;

    fn s1_mapping() -> Value {
        json!({
            "backend": "qblox",
            "qcm0": {
                "instrument_type": "QCM",
                "ref": "internal",
                "complex_output_0": {
                    "lo_name": "lo0",
                    "lo_freq": null,
                    "seq0": { "port": "q0:mw", "clock": "q0.01", "interm_freq": 50.0e6, "nco_en": true }
                }
            },
            "qrm0": {
                "instrument_type": "QRM",
                "ref": "internal",
                "complex_output_0": {
                    "lo_name": "lo1",
                    "lo_freq": 7.0e9,
                    "seq0": { "port": "q0:res", "clock": "q0.ro", "interm_freq": null, "nco_en": true }
                }
            }
        })
    }

    fn s1_schedule() -> Schedule {
        let mut operations = IndexMap::new();
        operations.insert(
            "drag_op".to_string(),
            OperationData {
                pulse_info: vec![PulseInfo {
                    wf_func: Some("quantify.scheduler.waveforms.drag".to_string()),
                    duration: 2.0e-8,
                    t0: 0.0,
                    clock: "q0.01".to_string(),
                    port: Some("q0:mw".to_string()),
                    params: IndexMap::from([
                        ("G_amp".to_string(), json!(0.2)),
                        ("D_amp".to_string(), json!(0.05)),
                        ("phase".to_string(), json!(0.0)),
                        ("nr_sigma".to_string(), json!(4.0)),
                    ]),
                }],
                acquisition_info: vec![],
            },
        );
        operations.insert(
            "readout_op".to_string(),
            OperationData {
                pulse_info: vec![PulseInfo {
                    wf_func: Some("quantify.scheduler.waveforms.square".to_string()),
                    duration: 3.0e-7,
                    t0: 0.0,
                    clock: "q0.ro".to_string(),
                    port: Some("q0:res".to_string()),
                    params: IndexMap::from([("amp".to_string(), json!(0.1))]),
                }],
                acquisition_info: vec![AcquisitionInfo {
                    duration: 3.0e-7,
                    t0: 0.0,
                    clock: "q0.ro".to_string(),
                    port: Some("q0:res".to_string()),
                    acq_channel: json!(0),
                    acq_index: json!(0),
                    bin_mode: "average".to_string(),
                    protocol: "ssb_integration_complex".to_string(),
                    waveforms: vec![],
                }],
            },
        );
        Schedule {
            operations,
            schedulables: vec![
                Schedulable {
                    operation_hash: "drag_op".to_string(),
                    abs_time: 200.0e-6,
                },
                Schedulable {
                    operation_hash: "readout_op".to_string(),
                    abs_time: 200.02e-6,
                },
            ],
            resources: IndexMap::from([
                (
                    "q0.01".to_string(),
                    ClockResource {
                        freq: 5.0e9,
                        downconverter_freq: None,
                    },
                ),
                (
                    "q0.ro".to_string(),
                    ClockResource {
                        freq: 7.04e9,
                        downconverter_freq: None,
                    },
                ),
            ]),
            repetitions: 1000,
        }
    }

    #[test]
    fn s1_single_qubit_x_then_measure() {
        let mapping = s1_mapping();
        let schedule = s1_schedule();
        let (artifact, _warnings) = compile_schedule(&mapping, &schedule).unwrap();

        let lo0 = artifact.entries.get("lo0");
        assert!(matches!(lo0, Some(ArtifactEntry::LocalOscillator(lo)) if (lo.lo_freq - 4.95e9).abs() < 1.0));

        match artifact.entries.get("qrm0") {
            Some(ArtifactEntry::Device(dev)) => {
                let seq0 = &dev.sequencers["seq0"];
                assert!((seq0.settings.modulation_freq - 40.0e6).abs() < 1.0);
                assert!(seq0.blob.program.contains("acquire"));
                assert!(seq0.blob.program.contains("play"));
            }
            _ => panic!("expected qrm0 device artifact"),
        }

        let qcm_duration = match artifact.entries.get("qcm0") {
            Some(ArtifactEntry::Device(dev)) => dev.sequencers["seq0"].settings.duration,
            _ => panic!("expected qcm0 device artifact"),
        };
        let qrm_duration = match artifact.entries.get("qrm0") {
            Some(ArtifactEntry::Device(dev)) => dev.sequencers["seq0"].settings.duration,
            _ => panic!("expected qrm0 device artifact"),
        };
        assert_eq!(qcm_duration, qrm_duration);
    }

    #[test]
    fn s2_duplicate_drag_pulses_share_one_waveform_pair() {
        let mapping = s1_mapping();
        let mut schedule = s1_schedule();
        schedule.schedulables = vec![
            Schedulable {
                operation_hash: "drag_op".to_string(),
                abs_time: 200.0e-6,
            },
            Schedulable {
                operation_hash: "drag_op".to_string(),
                abs_time: 300.0e-6,
            },
        ];
        let (artifact, _warnings) = compile_schedule(&mapping, &schedule).unwrap();
        match artifact.entries.get("qcm0") {
            Some(ArtifactEntry::Device(dev)) => {
                let seq0 = &dev.sequencers["seq0"];
                assert_eq!(seq0.blob.waveforms.len(), 2);
                let play_count = seq0.blob.program.matches("play").count();
                assert_eq!(play_count, 2);
            }
            _ => panic!("expected qcm0 device artifact"),
        }
    }
}
