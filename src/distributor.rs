//! Operation distributor (§4.2): walks the schedule's schedulables and
//! routes each pulse/acquisition record to the sequencer owning its
//! (port, clock), or fans clock-only records out to every sequencer on
//! that clock.

use indexmap::IndexMap;

use crate::error::CompileError;
use crate::mapping::HardwareIndex;
use crate::schedule::{OpInfo, Schedule};
use crate::utils::{is_grid_aligned, seconds_to_ns};

/// Per-(port, clock) bucket of operations assigned during distribution.
#[derive(Debug, Clone, Default)]
pub struct SequencerOps {
    pub pulses: Vec<OpInfo>,
    pub acquisitions: Vec<OpInfo>,
}

/// Distributes every schedulable's operation to the sequencer that owns
/// its (port, clock), keyed by that pair exactly as the mapping indexer
/// keys its PortClock index.
pub fn distribute(
    schedule: &Schedule,
    index: &HardwareIndex,
) -> Result<IndexMap<(String, String), SequencerOps>, CompileError> {
    let mut buckets: IndexMap<(String, String), SequencerOps> = IndexMap::new();
    for key in index.port_clock.keys() {
        buckets.insert(key.clone(), SequencerOps::default());
    }

    for schedulable in &schedule.schedulables {
        let abs_time = schedulable.abs_time;
        if !is_grid_aligned(seconds_to_ns(abs_time)) {
            return Err(CompileError::GridViolation {
                fingerprint: schedulable.operation_hash.clone(),
                time_ns: seconds_to_ns(abs_time),
                grid_ns: crate::utils::GRID_NS,
            });
        }

        let data = schedule.operations.get(&schedulable.operation_hash).ok_or_else(|| {
            CompileError::InvalidOperation {
                fingerprint: schedulable.operation_hash.clone(),
            }
        })?;
        if data.is_empty() {
            return Err(CompileError::InvalidOperation {
                fingerprint: schedulable.operation_hash.clone(),
            });
        }

        for pulse in &data.pulse_info {
            let op = OpInfo::from_pulse(pulse.clone(), abs_time);
            route_pulse(op, index, &mut buckets)?;
        }
        for acq in &data.acquisition_info {
            let op = OpInfo::from_acquisition(acq.clone(), abs_time);
            route_acquisition(op, index, &mut buckets)?;
        }
    }

    Ok(buckets)
}

fn route_pulse(
    op: OpInfo,
    index: &HardwareIndex,
    buckets: &mut IndexMap<(String, String), SequencerOps>,
) -> Result<(), CompileError> {
    match &op.port {
        Some(port) => {
            let key = (port.clone(), op.clock.clone());
            if !index.port_clock.contains_key(&key) {
                return Err(CompileError::UnknownPortClock {
                    port: port.clone(),
                    clock: op.clock.clone(),
                    fingerprint: op.fingerprint.clone(),
                });
            }
            buckets.get_mut(&key).expect("bucket pre-populated for every port/clock").pulses.push(op);
        }
        None => {
            // Clock-only operation: fan out to every sequencer sharing the clock.
            for (key, bucket) in buckets.iter_mut() {
                if key.1 == op.clock {
                    bucket.pulses.push(op.clone());
                }
            }
        }
    }
    Ok(())
}

fn route_acquisition(
    op: OpInfo,
    index: &HardwareIndex,
    buckets: &mut IndexMap<(String, String), SequencerOps>,
) -> Result<(), CompileError> {
    let port = op.port.clone().ok_or_else(|| CompileError::InvalidOperation {
        fingerprint: op.fingerprint.clone(),
    })?;
    let key = (port.clone(), op.clock.clone());
    let location = index.port_clock.get(&key).ok_or_else(|| CompileError::UnknownPortClock {
        port: port.clone(),
        clock: op.clock.clone(),
        fingerprint: op.fingerprint.clone(),
    })?;
    let descriptor = index
        .devices
        .get(&location.device)
        .and_then(|d| crate::module::descriptor_for(&d.instrument_type));
    let supports_acquisition = descriptor.map(|d| d.supports_acquisition).unwrap_or(false);
    if !supports_acquisition {
        return Err(CompileError::UnsupportedAcquisition {
            device: location.device.clone(),
            fingerprint: op.fingerprint.clone(),
        });
    }
    buckets.get_mut(&key).expect("bucket pre-populated for every port/clock").acquisitions.push(op);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::build_index;
    use crate::schedule::{ClockResource, OperationData, Schedulable};
    use serde_json::json;

    fn mapping() -> serde_json::Value {
        json!({
            "qcm0": {
                "instrument_type": "QCM",
                "ref": "internal",
                "complex_output_0": {
                    "seq0": { "port": "q0:mw", "clock": "q0.01", "interm_freq": 50.0e6, "nco_en": true }
                }
            }
        })
    }

    fn schedule_with(op_hash: &str, data: OperationData, abs_time: f64) -> Schedule {
        let mut operations = IndexMap::new();
        operations.insert(op_hash.to_string(), data);
        Schedule {
            operations,
            schedulables: vec![Schedulable {
                operation_hash: op_hash.to_string(),
                abs_time,
            }],
            resources: IndexMap::from([(
                "q0.01".to_string(),
                ClockResource {
                    freq: 5.0e9,
                    downconverter_freq: None,
                },
            )]),
            repetitions: 1,
        }
    }

    #[test]
    fn grid_violation_is_caught() {
        let idx = build_index(&mapping()).unwrap();
        let data = OperationData {
            pulse_info: vec![crate::schedule::PulseInfo {
                wf_func: Some("square".into()),
                duration: 2.0e-8,
                t0: 0.0,
                clock: "q0.01".into(),
                port: Some("q0:mw".into()),
                params: IndexMap::new(),
            }],
            acquisition_info: vec![],
        };
        let schedule = schedule_with("op1", data, 200.002e-6);
        let err = distribute(&schedule, &idx).unwrap_err();
        assert!(matches!(err, CompileError::GridViolation { .. }));
    }

    #[test]
    fn unknown_portclock_is_caught() {
        let idx = build_index(&mapping()).unwrap();
        let data = OperationData {
            pulse_info: vec![crate::schedule::PulseInfo {
                wf_func: Some("square".into()),
                duration: 2.0e-8,
                t0: 0.0,
                clock: "q0.99".into(),
                port: Some("q0:mw".into()),
                params: IndexMap::new(),
            }],
            acquisition_info: vec![],
        };
        let schedule = schedule_with("op1", data, 200.0e-6);
        let err = distribute(&schedule, &idx).unwrap_err();
        assert!(matches!(err, CompileError::UnknownPortClock { .. }));
    }
}
