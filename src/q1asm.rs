//! Q1ASM emitter (§4.5): turns one sequencer's sorted operation list into
//! a grid-aligned Q1 assembly program.

use serde_json::Value;

use crate::error::{CompileError, Warning};
use crate::module::ModuleDescriptor;
use crate::schedule::OpInfo;
use crate::sequencer::SequencerState;
use crate::utils::{to_signed_immediate, GRID_NS, MAX_IMMEDIATE, MIN_ACQUISITION_GAP_NS};
use crate::waveform::{is_staircase, StitchPlan};

/// One row of an emitted program: an optional label, an opcode, its
/// operands (already stringified), and an optional trailing comment.
#[derive(Debug, Clone)]
pub struct ProgramRow {
    pub label: Option<String>,
    pub opcode: String,
    pub operands: Vec<String>,
    pub comment: Option<String>,
}

/// A full Q1 assembly program for one sequencer.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub rows: Vec<ProgramRow>,
}

impl Program {
    fn push(&mut self, opcode: &str, operands: Vec<String>) {
        self.rows.push(ProgramRow {
            label: None,
            opcode: opcode.to_string(),
            operands,
            comment: None,
        });
    }

    fn push_commented(&mut self, opcode: &str, operands: Vec<String>, comment: &str) {
        self.rows.push(ProgramRow {
            label: None,
            opcode: opcode.to_string(),
            operands,
            comment: Some(comment.to_string()),
        });
    }

    fn push_labeled(&mut self, label: &str, opcode: &str, operands: Vec<String>) {
        self.rows.push(ProgramRow {
            label: Some(label.to_string()),
            opcode: opcode.to_string(),
            operands,
            comment: None,
        });
    }

    /// Renders the program as Q1ASM text, one instruction per line, with
    /// labels on their own column and comments right-aligned.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            let label_col = match &row.label {
                Some(l) => format!("{l}:"),
                None => String::new(),
            };
            let body = if row.operands.is_empty() {
                row.opcode.clone()
            } else {
                format!("{} {}", row.opcode, row.operands.join(", "))
            };
            out.push_str(&format!("{label_col:<10}{body}"));
            if let Some(comment) = &row.comment {
                out.push_str(&format!("  ; {comment}"));
            }
            out.push('\n');
        }
        out
    }
}

fn push_wait(program: &mut Program, mut remaining_ns: i64) {
    while remaining_ns > MAX_IMMEDIATE {
        program.push("wait", vec![MAX_IMMEDIATE.to_string()]);
        remaining_ns -= MAX_IMMEDIATE;
    }
    if remaining_ns > 0 {
        program.push("wait", vec![remaining_ns.to_string()]);
    }
}

/// Everything the emitter needs about one already-sampled pulse
/// fingerprint: its waveform-table indices, per-axis runtime gain, and
/// (if applicable) its stitch plan.
#[derive(Debug, Clone)]
pub struct CompiledPulse {
    pub i_index: usize,
    pub q_index: usize,
    pub gain_i: f64,
    pub gain_q: f64,
    pub stitch: Option<StitchPlan>,
}

struct QueuedOp<'a> {
    op: &'a OpInfo,
}

fn value_as_i64(v: &Value) -> i64 {
    v.as_i64().unwrap_or_else(|| v.as_f64().unwrap_or(0.0).round() as i64)
}

fn staircase_plan(op: &OpInfo) -> (f64, f64, u64, i64) {
    let pulse = op.pulse.as_ref().expect("staircase op always carries pulse_info");
    let start_amp = pulse.params.get("start_amp").and_then(Value::as_f64).unwrap_or(0.0);
    let final_amp = pulse.params.get("final_amp").and_then(Value::as_f64).unwrap_or(0.0);
    let num_steps = pulse.params.get("num_steps").and_then(Value::as_u64).unwrap_or(1).max(1);
    let step_duration_ns = pulse
        .params
        .get("step_duration")
        .and_then(Value::as_f64)
        .map(|s| (s * 1.0e9).round() as i64)
        .unwrap_or_else(|| ((pulse.duration * 1.0e9 / num_steps as f64).round() as i64).max(GRID_NS));
    (start_amp, final_amp, num_steps, step_duration_ns)
}

fn staircase_total_ns(op: &OpInfo) -> i64 {
    let (_, _, num_steps, step_ns) = staircase_plan(op);
    num_steps as i64 * step_ns
}

/// The number of nanoseconds one operation consumes from `elapsed_time`
/// once emitted, used both by the emitter's own bookkeeping and by the
/// caller computing the shared `total_play_time` across sequencers.
pub fn op_consumption_ns(op: &OpInfo, compiled: Option<&CompiledPulse>) -> i64 {
    if op.is_acquisition {
        return GRID_NS;
    }
    let pulse = op.pulse.as_ref().expect("pulse ops always carry pulse_info");
    if pulse.wf_func.is_none() {
        // A true idle gap (concrete port) costs nothing; a clock-only
        // virtual operation still commits with `upd_param GRID`.
        return if pulse.port.is_some() { 0 } else { GRID_NS };
    }
    if is_staircase(pulse) {
        return staircase_total_ns(op);
    }
    match compiled.and_then(|c| c.stitch) {
        Some(stitch) => stitch.repeats as i64 * stitch.unit_ns + stitch.residual_ns,
        None => GRID_NS,
    }
}

/// Computes the sequencer's natural body length (no trailing pad), the
/// basis for the shared `total_play_time` across all sequencers
/// (invariant 7: cycle equality).
///
/// Mirrors `emit_program`'s own sequential accumulation rather than
/// taking each op's end time independently: ops scheduled at the same
/// `timing_ns` (a pulse and its acquisition, say) execute back-to-back on
/// real hardware, each still consuming its own GRID, so their costs add
/// rather than collapse to a single max.
pub fn natural_length_ns(
    seq: &SequencerState,
    compiled_pulses: &indexmap::IndexMap<String, CompiledPulse>,
) -> i64 {
    let mut ops: Vec<&OpInfo> = seq
        .pulses
        .iter()
        .filter(|op| {
            op.pulse
                .as_ref()
                .map(|p| p.wf_func.is_some() || p.port.is_none())
                .unwrap_or(true)
        })
        .chain(seq.acquisitions.iter())
        .collect();
    ops.sort_by_key(|op| (op.timing_ns, op.is_acquisition as u8));

    let mut elapsed: i64 = 0;
    for op in ops {
        let wait = (op.timing_ns - elapsed).max(0);
        elapsed += wait;
        let compiled = compiled_pulses.get(&op.fingerprint);
        elapsed += op_consumption_ns(op, compiled);
    }
    elapsed
}

/// Emits the full Q1ASM program for one sequencer with data.
pub fn emit_program(
    seq: &SequencerState,
    descriptor: &ModuleDescriptor,
    compiled_pulses: &indexmap::IndexMap<String, CompiledPulse>,
    repetitions: u64,
    total_play_time_ns: i64,
) -> Result<(Program, Vec<Warning>), CompileError> {
    let mut program = Program::default();
    let mut warnings = Vec::new();

    program.push_commented("wait_sync", vec![GRID_NS.to_string()], "align to reference clock");
    program.push(
        "set_mrk",
        vec![descriptor.marker.start.to_string()],
    );
    program.push("move", vec![repetitions.to_string(), "R0".to_string()]);

    // A pulse with no waveform function and a concrete port is a true
    // idle gap and produces no instruction; the same shape with no port
    // is a clock-only virtual operation (phase reset, etc.) and is kept
    // so the branch below can emit its `set_ph_delta`.
    let mut ops: Vec<QueuedOp> = seq
        .pulses
        .iter()
        .filter(|op| {
            op.pulse
                .as_ref()
                .map(|p| p.wf_func.is_some() || p.port.is_none())
                .unwrap_or(true)
        })
        .map(|op| QueuedOp { op })
        .chain(seq.acquisitions.iter().map(|op| QueuedOp { op }))
        .collect();
    ops.sort_by_key(|q| (q.op.timing_ns, q.op.is_acquisition as u8));

    let mut elapsed: i64 = 0;
    let mut last_acquisition_end: Option<(i64, String)> = None;
    let mut first_row_labeled = false;

    if ops.is_empty() {
        program.push_labeled("start", "wait", vec!["0".to_string()]);
        first_row_labeled = true;
    }

    for (idx, queued) in ops.iter().enumerate() {
        let op = queued.op;
        let w = op.timing_ns - elapsed;
        let rows_before_wait = program.rows.len();
        if w < 0 {
            // A negative wait happens whenever a pulse and an acquisition
            // (or two pulses) are scheduled at the identical `timing_ns`:
            // the first of the pair already advanced `elapsed` by the
            // GRID it consumed, so the second's nominal start looks like
            // it is in the past. That's not a real conflict, just two
            // operations in the same commit group — emit the second
            // immediately with no wait instead of erroring.
            let same_group = idx > 0 && ops[idx - 1].op.timing_ns == op.timing_ns;
            if !same_group {
                return Err(CompileError::TimingConflict {
                    port: seq.port.clone(),
                    clock: seq.clock.clone(),
                    fingerprint: op.fingerprint.clone(),
                    elapsed_ns: elapsed,
                    required_ns: w,
                });
            }
        } else if w > 0 {
            push_wait(&mut program, w);
            elapsed += w;
        }

        if !first_row_labeled {
            if program.rows.len() > rows_before_wait {
                program.rows[rows_before_wait].label = Some("start".to_string());
            } else {
                program.push_labeled("start", "wait", vec!["0".to_string()]);
            }
            first_row_labeled = true;
        }

        if op.is_acquisition {
            let acq = op.acquisition.as_ref().expect("is_acquisition implies acquisition_info");
            if !descriptor.supports_acquisition {
                return Err(CompileError::UnsupportedAcquisition {
                    device: seq.device.clone(),
                    fingerprint: op.fingerprint.clone(),
                });
            }
            if let Some((prev_end, prev_fp)) = &last_acquisition_end {
                let gap = op.timing_ns - prev_end;
                if gap < MIN_ACQUISITION_GAP_NS {
                    return Err(CompileError::AcquisitionTooClose {
                        port: seq.port.clone(),
                        clock: seq.clock.clone(),
                        first_fingerprint: prev_fp.clone(),
                        second_fingerprint: op.fingerprint.clone(),
                        gap_ns: gap,
                        min_gap_ns: MIN_ACQUISITION_GAP_NS,
                    });
                }
            }
            let channel = value_as_i64(&acq.acq_channel);
            let index = value_as_i64(&acq.acq_index);
            program.push("acquire", vec![channel.to_string(), index.to_string(), GRID_NS.to_string()]);
            elapsed += GRID_NS;
            last_acquisition_end = Some((elapsed, op.fingerprint.clone()));
            continue;
        }

        let pulse = op.pulse.as_ref().expect("non-acquisition ops carry pulse_info");

        if is_staircase(pulse) {
            emit_staircase(&mut program, op, descriptor)?;
            elapsed += staircase_total_ns(op);
            continue;
        }

        if pulse.port.is_none() {
            // Virtual, clock-only operation: phase commit, no waveform.
            let phase_deg = pulse.params.get("phase").and_then(Value::as_f64).unwrap_or(0.0);
            let phase_units = ((phase_deg / 360.0) * 1_000_000_000.0).round() as i64;
            program.push("set_ph_delta", vec![phase_units.to_string()]);
            let fuse_with_next = ops
                .get(idx + 1)
                .map(|next| next.op.timing_ns == op.timing_ns && next.op.pulse.as_ref().map(|p| p.port.is_none()).unwrap_or(false))
                .unwrap_or(false);
            if !fuse_with_next {
                program.push("upd_param", vec![GRID_NS.to_string()]);
                elapsed += GRID_NS;
            }
            continue;
        }

        let compiled = compiled_pulses.get(&op.fingerprint).ok_or_else(|| CompileError::UnknownSampler {
            name: pulse.wf_func.clone().unwrap_or_default(),
        })?;
        let gain_i_imm = to_signed_immediate(compiled.gain_i / descriptor.peak_voltage_v);
        let gain_q_imm = to_signed_immediate(compiled.gain_q / descriptor.peak_voltage_v);
        program.push("set_awg_gain", vec![gain_i_imm.to_string(), gain_q_imm.to_string()]);

        match compiled.stitch {
            Some(stitch) => {
                program.push("move", vec![stitch.repeats.to_string(), "R1".to_string()]);
                program.push_labeled(
                    &format!("stitch_{idx}"),
                    "play",
                    vec![compiled.i_index.to_string(), compiled.q_index.to_string(), stitch.unit_ns.to_string()],
                );
                program.push("loop", vec!["R1".to_string(), format!("@stitch_{idx}")]);
                if stitch.residual_ns > 0 {
                    program.push(
                        "play",
                        vec![compiled.i_index.to_string(), compiled.q_index.to_string(), stitch.residual_ns.to_string()],
                    );
                    warnings.push(Warning::StitchResidual {
                        fingerprint: op.fingerprint.clone(),
                        residual_ns: stitch.residual_ns,
                    });
                }
                program.push("set_awg_gain", vec!["0".to_string(), "0".to_string()]);
                elapsed += stitch.repeats as i64 * stitch.unit_ns + stitch.residual_ns;
            }
            None => {
                program.push(
                    "play",
                    vec![compiled.i_index.to_string(), compiled.q_index.to_string(), GRID_NS.to_string()],
                );
                elapsed += GRID_NS;
            }
        }
    }

    if total_play_time_ns < elapsed {
        return Err(CompileError::TimingConflict {
            port: seq.port.clone(),
            clock: seq.clock.clone(),
            fingerprint: String::new(),
            elapsed_ns: elapsed,
            required_ns: total_play_time_ns - elapsed,
        });
    }
    let tail = total_play_time_ns - elapsed;
    if tail > 0 {
        push_wait(&mut program, tail);
    }

    program.push("loop", vec!["R0".to_string(), "@start".to_string()]);
    program.push("set_mrk", vec![descriptor.marker.end.to_string()]);
    program.push("upd_param", vec![GRID_NS.to_string()]);
    program.push("stop", vec![]);

    Ok((program, warnings))
}

fn emit_staircase(program: &mut Program, op: &OpInfo, _descriptor: &ModuleDescriptor) -> Result<(), CompileError> {
    let (start_amp, final_amp, num_steps, step_ns) = staircase_plan(op);
    if step_ns <= GRID_NS {
        return Err(CompileError::GridViolation {
            fingerprint: op.fingerprint.clone(),
            time_ns: step_ns,
            grid_ns: GRID_NS,
        });
    }
    let start_imm = to_signed_immediate(start_amp);
    let final_imm = to_signed_immediate(final_amp);
    let step_imm = if num_steps > 1 { (final_imm - start_imm) / (num_steps as i64 - 1) } else { 0 };

    program.push("move", vec![start_imm.to_string(), "R2".to_string()]);
    program.push("move", vec![num_steps.to_string(), "R3".to_string()]);
    program.push_labeled(
        &format!("staircase_{}", op.fingerprint),
        "set_awg_offs",
        vec!["R2".to_string(), "R2".to_string()],
    );
    program.push("upd_param", vec![GRID_NS.to_string()]);
    push_wait(program, step_ns - GRID_NS);
    if step_imm >= 0 {
        program.push("add", vec!["R2".to_string(), step_imm.to_string(), "R2".to_string()]);
    } else {
        program.push("sub", vec!["R2".to_string(), (-step_imm).to_string(), "R2".to_string()]);
    }
    program.push("loop", vec!["R3".to_string(), format!("@staircase_{}", op.fingerprint)]);
    program.push("set_awg_offs", vec!["0".to_string(), "0".to_string()]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::QCM;
    use crate::schedule::PulseInfo;
    use indexmap::IndexMap;
    use serde_json::json;

    fn seq_with(pulses: Vec<OpInfo>) -> SequencerState {
        SequencerState {
            device: "qcm0".to_string(),
            output: "complex_output_0".to_string(),
            seq_slot: "seq0".to_string(),
            port: "q0:mw".to_string(),
            clock: "q0.01".to_string(),
            if_hz: 50.0e6,
            nco_en: true,
            mixer: None,
            pulses,
            acquisitions: vec![],
        }
    }

    fn simple_pulse_op(fingerprint: &str, timing_ns: i64) -> OpInfo {
        OpInfo {
            timing_ns,
            fingerprint: fingerprint.to_string(),
            port: Some("q0:mw".to_string()),
            clock: "q0.01".to_string(),
            is_acquisition: false,
            pulse: Some(PulseInfo {
                wf_func: Some("quantify.scheduler.waveforms.drag".to_string()),
                duration: 2.0e-8,
                t0: 0.0,
                clock: "q0.01".to_string(),
                port: Some("q0:mw".to_string()),
                params: IndexMap::from([
                    ("G_amp".to_string(), json!(0.2)),
                    ("D_amp".to_string(), json!(0.05)),
                ]),
            }),
            acquisition: None,
        }
    }

    #[test]
    fn single_pulse_program_ends_at_expected_time() {
        let op = simple_pulse_op("fpA", 200_000);
        let seq = seq_with(vec![op]);
        let mut compiled = indexmap::IndexMap::new();
        compiled.insert(
            "fpA".to_string(),
            CompiledPulse {
                i_index: 0,
                q_index: 1,
                gain_i: 0.2,
                gain_q: 0.05,
                stitch: None,
            },
        );
        let natural = natural_length_ns(&seq, &compiled);
        assert_eq!(natural, 200_000 + GRID_NS);
        let (program, warnings) = emit_program(&seq, &QCM, &compiled, 1, natural).unwrap();
        assert!(warnings.is_empty());
        assert!(program.rows.iter().any(|r| r.opcode == "play"));
        assert!(program.to_text().contains("stop"));
    }

    #[test]
    fn acquisition_too_close_is_rejected() {
        let mut seq = seq_with(vec![]);
        seq.acquisitions = vec![
            OpInfo {
                timing_ns: 0,
                fingerprint: "acq1".to_string(),
                port: Some("q0:res".to_string()),
                clock: "q0.ro".to_string(),
                is_acquisition: true,
                pulse: None,
                acquisition: Some(crate::schedule::AcquisitionInfo {
                    duration: 3.0e-7,
                    t0: 0.0,
                    clock: "q0.ro".to_string(),
                    port: Some("q0:res".to_string()),
                    acq_channel: json!(0),
                    acq_index: json!(0),
                    bin_mode: "average".to_string(),
                    protocol: "ssb_integration_complex".to_string(),
                    waveforms: vec![],
                }),
            },
            OpInfo {
                timing_ns: 100,
                fingerprint: "acq2".to_string(),
                port: Some("q0:res".to_string()),
                clock: "q0.ro".to_string(),
                is_acquisition: true,
                pulse: None,
                acquisition: Some(crate::schedule::AcquisitionInfo {
                    duration: 3.0e-7,
                    t0: 0.0,
                    clock: "q0.ro".to_string(),
                    port: Some("q0:res".to_string()),
                    acq_channel: json!(0),
                    acq_index: json!(1),
                    bin_mode: "average".to_string(),
                    protocol: "ssb_integration_complex".to_string(),
                    waveforms: vec![],
                }),
            },
        ];
        let compiled = indexmap::IndexMap::new();
        let err = emit_program(&seq, &crate::module::QRM, &compiled, 1, 10_000).unwrap_err();
        assert!(matches!(err, CompileError::AcquisitionTooClose { .. }));
    }
}
