//! Frequency resolver (§4.3), grounded on quantify-scheduler's
//! `determine_clock_lo_interm_freqs`/`Frequencies`: for every active
//! (port, clock), derives (RF, LO, IF) from whichever two are given, and
//! applies an optional downconverter transform to the clock frequency
//! first.

use indexmap::IndexMap;

use crate::error::{CompileError, Warning};
use crate::mapping::HardwareIndex;
use crate::utils::FREQ_TOLERANCE_HZ;

/// The resolved (RF, LO, IF) triple for one active (port, clock).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frequencies {
    pub rf: f64,
    pub lo: f64,
    pub interm: f64,
    pub mixing_enabled: bool,
}

/// Applies the downconverter transform to a clock's original RF
/// frequency, in the order the source validates it: warn on exactly
/// zero, error if negative, error if below the original frequency.
fn apply_downconverter(
    clock: &str,
    downconverter_freq: f64,
    original_rf: f64,
    warnings: &mut Vec<Warning>,
) -> Result<f64, CompileError> {
    if downconverter_freq == 0.0 {
        warnings.push(Warning::DownconverterZero {
            clock: clock.to_string(),
        });
        return Ok(original_rf);
    }
    if downconverter_freq < 0.0 || downconverter_freq < original_rf {
        return Err(CompileError::DownconverterInvalid {
            clock: clock.to_string(),
            downconverter_freq,
            original_rf,
        });
    }
    Ok(downconverter_freq - original_rf)
}

/// Resolves frequencies for every (port, clock) pair present in `active`
/// (those that received at least one operation), returning the per-
/// sequencer IF map and the per-LO frequency map, plus any warnings.
pub fn resolve_frequencies(
    index: &HardwareIndex,
    clock_freqs: &IndexMap<String, (f64, Option<f64>)>,
    active: &[(String, String)],
) -> Result<(IndexMap<(String, String), f64>, IndexMap<String, f64>, Vec<Warning>), CompileError> {
    let mut if_by_portclock = IndexMap::new();
    let mut lo_by_name: IndexMap<String, f64> = IndexMap::new();
    let mut warnings = Vec::new();

    for key in active {
        let location = index
            .port_clock
            .get(key)
            .ok_or_else(|| CompileError::UnknownPortClock {
                port: key.0.clone(),
                clock: key.1.clone(),
                fingerprint: String::new(),
            })?;

        let (original_rf, downconverter) = clock_freqs.get(&key.1).copied().unwrap_or((0.0, None));
        let rf = match downconverter {
            Some(d) => apply_downconverter(&key.1, d, original_rf, &mut warnings)?,
            None => original_rf,
        };

        let output_meta = index
            .devices
            .get(&location.device)
            .and_then(|d| d.outputs.get(&location.output));
        let lo_name = output_meta.and_then(|o| o.lo_name.clone());
        let declared_lo_freq = lo_name.as_ref().and_then(|n| index.lo_freq.get(n).copied().flatten());
        let interm_freq = location.interm_freq;
        let mixing_enabled = lo_name.is_some();

        let freqs = if !mixing_enabled {
            Frequencies {
                rf,
                lo: rf,
                interm: 0.0,
                mixing_enabled: false,
            }
        } else {
            match (declared_lo_freq, interm_freq) {
                (Some(lo), Some(interm)) => {
                    let expected = lo + interm;
                    if (expected - rf).abs() > FREQ_TOLERANCE_HZ {
                        return Err(CompileError::OverConstrainedFrequency {
                            port: key.0.clone(),
                            clock: key.1.clone(),
                            lo_freq: lo,
                            interm_freq: interm,
                            clock_freq: rf,
                        });
                    }
                    Frequencies {
                        rf,
                        lo,
                        interm,
                        mixing_enabled: true,
                    }
                }
                (None, Some(interm)) => Frequencies {
                    rf,
                    lo: rf - interm,
                    interm,
                    mixing_enabled: true,
                },
                (Some(lo), None) => Frequencies {
                    rf,
                    lo,
                    interm: rf - lo,
                    mixing_enabled: true,
                },
                (None, None) => {
                    return Err(CompileError::UnderConstrainedFrequency {
                        port: key.0.clone(),
                        clock: key.1.clone(),
                    });
                }
            }
        };

        if_by_portclock.insert(key.clone(), freqs.interm);

        if let Some(name) = lo_name {
            match lo_by_name.get(&name).copied() {
                Some(existing) if (existing - freqs.lo).abs() > FREQ_TOLERANCE_HZ => {
                    return Err(CompileError::FrequencyConflict {
                        kind: "local oscillator",
                        name,
                        existing_hz: existing,
                        new_hz: freqs.lo,
                    });
                }
                _ => {
                    lo_by_name.insert(name, freqs.lo);
                }
            }
        }
    }

    Ok((if_by_portclock, lo_by_name, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::build_index;
    use serde_json::json;

    fn mapping_with_lo_and_if() -> serde_json::Value {
        json!({
            "qcm0": {
                "instrument_type": "QCM",
                "ref": "internal",
                "complex_output_0": {
                    "lo_name": "lo0",
                    "lo_freq": null,
                    "seq0": { "port": "q0:mw", "clock": "q0.01", "interm_freq": 50.0e6, "nco_en": true }
                }
            }
        })
    }

    #[test]
    fn lo_only_derives_if() {
        let idx = build_index(&mapping_with_lo_and_if()).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.0e9, None))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let (if_map, lo_map, warnings) = resolve_frequencies(&idx, &clocks, &active).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(if_map[&("q0:mw".to_string(), "q0.01".to_string())], 50.0e6);
        assert_eq!(lo_map["lo0"], 5.0e9 - 50.0e6);
    }

    #[test]
    fn both_given_consistent_passes() {
        let mut doc = mapping_with_lo_and_if();
        doc["qcm0"]["complex_output_0"]["lo_freq"] = json!(4.95e9);
        let idx = build_index(&doc).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.0e9, None))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let (if_map, lo_map, _) = resolve_frequencies(&idx, &clocks, &active).unwrap();
        assert_eq!(if_map[&("q0:mw".to_string(), "q0.01".to_string())], 50.0e6);
        assert_eq!(lo_map["lo0"], 4.95e9);
    }

    #[test]
    fn over_constrained_is_rejected() {
        let mut doc = mapping_with_lo_and_if();
        doc["qcm0"]["complex_output_0"]["lo_freq"] = json!(5.0e9);
        let idx = build_index(&doc).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.01e9, None))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let err = resolve_frequencies(&idx, &clocks, &active).unwrap_err();
        assert!(matches!(err, CompileError::OverConstrainedFrequency { .. }));
    }

    #[test]
    fn under_constrained_is_rejected() {
        let mut doc = mapping_with_lo_and_if();
        doc["qcm0"]["complex_output_0"]["seq0"]["interm_freq"] = json!(null);
        let idx = build_index(&doc).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.0e9, None))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let err = resolve_frequencies(&idx, &clocks, &active).unwrap_err();
        assert!(matches!(err, CompileError::UnderConstrainedFrequency { .. }));
    }

    #[test]
    fn downconverter_zero_warns_and_keeps_original() {
        let idx = build_index(&mapping_with_lo_and_if()).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.0e9, Some(0.0)))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let (if_map, _, warnings) = resolve_frequencies(&idx, &clocks, &active).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(if_map[&("q0:mw".to_string(), "q0.01".to_string())], 50.0e6);
    }

    #[test]
    fn downconverter_below_clock_is_invalid() {
        let idx = build_index(&mapping_with_lo_and_if()).unwrap();
        let clocks = IndexMap::from([("q0.01".to_string(), (5.0e9, Some(4.0e9)))]);
        let active = vec![("q0:mw".to_string(), "q0.01".to_string())];
        let err = resolve_frequencies(&idx, &clocks, &active).unwrap_err();
        assert!(matches!(err, CompileError::DownconverterInvalid { .. }));
    }
}
