//! Types modelling the schedule document (§3, §6): a read-only, already
//! fully-timed description of the operations the core must compile.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{fingerprint_of, seconds_to_ns, without_key};

/// A weighting-function waveform record nested inside an acquisition's
/// `waveforms` list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WeightWaveform {
    pub wf_func: Option<String>,
    #[serde(default)]
    pub t0: f64,
    pub duration: f64,
    #[serde(flatten)]
    pub params: IndexMap<String, Value>,
}

/// One `pulse_info[]` entry. `wf_func = None` denotes an idle pulse.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PulseInfo {
    pub wf_func: Option<String>,
    pub duration: f64,
    #[serde(default)]
    pub t0: f64,
    pub clock: String,
    pub port: Option<String>,
    /// Every waveform-specific parameter (`amp`, `G_amp`, `D_amp`,
    /// `phase`, `nr_sigma`, staircase step count, ...). Kept untyped
    /// because the set of legal keys is determined by `wf_func`, which is
    /// only known at sampling time (§9: registry of named samplers).
    #[serde(flatten)]
    pub params: IndexMap<String, Value>,
}

/// One `acquisition_info[]` entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AcquisitionInfo {
    pub duration: f64,
    #[serde(default)]
    pub t0: f64,
    pub clock: String,
    pub port: Option<String>,
    pub acq_channel: Value,
    pub acq_index: Value,
    pub bin_mode: String,
    pub protocol: String,
    #[serde(default)]
    pub waveforms: Vec<WeightWaveform>,
}

/// An entry in the schedule's operations table.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OperationData {
    #[serde(default)]
    pub pulse_info: Vec<PulseInfo>,
    #[serde(default)]
    pub acquisition_info: Vec<AcquisitionInfo>,
}

impl OperationData {
    pub fn is_empty(&self) -> bool {
        self.pulse_info.is_empty() && self.acquisition_info.is_empty()
    }
}

/// One entry in the schedule's `schedulables` list: a reference to an
/// operation plus its absolute start time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Schedulable {
    pub operation_hash: String,
    pub abs_time: f64,
}

/// A clock resource: a named carrier frequency, optionally transformed by
/// a downconverter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClockResource {
    pub freq: f64,
    #[serde(default)]
    pub downconverter_freq: Option<f64>,
}

/// The full, already-lowered input schedule (§3, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Schedule {
    pub operations: IndexMap<String, OperationData>,
    pub schedulables: Vec<Schedulable>,
    pub resources: IndexMap<String, ClockResource>,
    pub repetitions: u64,
}

/// An immutable, distributor-produced view of one pulse or acquisition
/// record: its data, absolute timing, and deduplication fingerprint.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub timing_ns: i64,
    pub fingerprint: String,
    pub port: Option<String>,
    pub clock: String,
    pub is_acquisition: bool,
    pub pulse: Option<PulseInfo>,
    pub acquisition: Option<AcquisitionInfo>,
}

impl OpInfo {
    pub fn from_pulse(pulse: PulseInfo, abs_time_s: f64) -> Self {
        let timing_ns = seconds_to_ns(abs_time_s + pulse.t0);
        let fingerprint = fingerprint_of(&without_key(&pulse_to_value(&pulse), "t0"));
        OpInfo {
            timing_ns,
            fingerprint,
            port: pulse.port.clone(),
            clock: pulse.clock.clone(),
            is_acquisition: false,
            pulse: Some(pulse),
            acquisition: None,
        }
    }

    pub fn from_acquisition(acq: AcquisitionInfo, abs_time_s: f64) -> Self {
        let timing_ns = seconds_to_ns(abs_time_s + acq.t0);
        let fingerprint = fingerprint_of(&acquisition_fingerprint_value(&acq));
        OpInfo {
            timing_ns,
            fingerprint,
            port: acq.port.clone(),
            clock: acq.clock.clone(),
            is_acquisition: true,
            pulse: None,
            acquisition: Some(acq),
        }
    }
}

fn pulse_to_value(pulse: &PulseInfo) -> Value {
    serde_json::to_value(pulse).expect("PulseInfo always serialises")
}

/// Builds the JSON value an acquisition's fingerprint is computed over:
/// the record with its own `t0` stripped, and each nested weighting
/// waveform with its `t0` stripped too (§4.2 step 4).
fn acquisition_fingerprint_value(acq: &AcquisitionInfo) -> Value {
    let mut value = serde_json::to_value(acq).expect("AcquisitionInfo always serialises");
    if let Value::Object(ref mut map) = value {
        map.remove("t0");
        if let Some(Value::Array(waveforms)) = map.get_mut("waveforms") {
            for wf in waveforms.iter_mut() {
                if let Value::Object(wf_map) = wf {
                    wf_map.remove("t0");
                }
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_pulse() -> PulseInfo {
        PulseInfo {
            wf_func: Some("square".to_string()),
            duration: 2.0e-8,
            t0: 0.0,
            clock: "q0.01".to_string(),
            port: Some("q0:mw".to_string()),
            params: IndexMap::from([("amp".to_string(), json!(0.3))]),
        }
    }

    #[test]
    fn identical_pulses_share_fingerprint_regardless_of_timing() {
        let mut a = sample_pulse();
        let mut b = sample_pulse();
        a.t0 = 0.0;
        b.t0 = 4.0e-9;
        let op_a = OpInfo::from_pulse(a, 200.0e-6);
        let op_b = OpInfo::from_pulse(b, 300.0e-6);
        assert_eq!(op_a.fingerprint, op_b.fingerprint);
        assert_ne!(op_a.timing_ns, op_b.timing_ns);
    }

    #[test]
    fn acquisition_fingerprint_ignores_weight_t0() {
        let base = AcquisitionInfo {
            duration: 3.0e-7,
            t0: 0.0,
            clock: "q0.ro".to_string(),
            port: Some("q0:res".to_string()),
            acq_channel: json!(0),
            acq_index: json!(0),
            bin_mode: "average".to_string(),
            protocol: "ssb_integration_complex".to_string(),
            waveforms: vec![WeightWaveform {
                wf_func: Some("square".to_string()),
                t0: 0.0,
                duration: 3.0e-7,
                params: IndexMap::new(),
            }],
        };
        let mut shifted = base.clone();
        shifted.waveforms[0].t0 = 1.0e-8;
        let fp_a = fingerprint_of(&acquisition_fingerprint_value(&base));
        let fp_b = fingerprint_of(&acquisition_fingerprint_value(&shifted));
        assert_eq!(fp_a, fp_b);
    }
}
