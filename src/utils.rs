//! Grid/timing constants and small stand-alone helpers shared across the
//! pipeline stages.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The quantum of all timing on the target, in nanoseconds.
pub const GRID_NS: i64 = 4;

/// Sample rate of the target's waveform memory, in samples/second.
pub const SAMPLE_RATE_HZ: f64 = 1.0e9;

/// Largest value that fits an immediate operand (gain, wait, offset).
pub const MAX_IMMEDIATE: i64 = 65_535;

/// Largest value a 32-bit sequencer register can hold.
pub const MAX_REGISTER: u64 = 0xFFFF_FFFF;

/// Minimum spacing between two acquisitions on the same sequencer.
pub const MIN_ACQUISITION_GAP_NS: i64 = 1_000;

/// Length of one playback unit used to stitch long flat pulses.
pub const STITCH_UNIT_NS: i64 = 1_000;

/// Floating point tolerance used for frequency-law and equality checks.
pub const FREQ_TOLERANCE_HZ: f64 = 1.0e-6;

/// Returns `true` if `value_ns` lands exactly on the grid.
pub fn is_grid_aligned(value_ns: i64) -> bool {
    value_ns % GRID_NS == 0
}

/// Converts a duration in seconds to whole nanoseconds, rounding to the
/// nearest integer the way the source's `round(duration * sampling_rate)`
/// does for sample counts.
pub fn seconds_to_ns(seconds: f64) -> i64 {
    (seconds * 1.0e9).round() as i64
}

/// Converts a duration in seconds to a 1 GS/s sample count.
pub fn seconds_to_samples(seconds: f64) -> usize {
    (seconds * SAMPLE_RATE_HZ).round() as usize
}

/// Clamp a real-valued gain/offset (already normalised to the module's
/// peak voltage) to a signed 16-bit immediate.
pub fn to_signed_immediate(normalised: f64) -> i64 {
    let raw = (normalised * 32768.0).floor() as i64;
    raw.clamp(-32768, 32767)
}

/// Computes a stable content hash of a JSON value, used as the
/// deduplication fingerprint for pulse and acquisition records. `t0`
/// (and, for acquisitions, each weighting waveform's own `t0`) must
/// already have been stripped by the caller before calling this.
///
/// Hashing is process-local (not stable across Rust versions or
/// processes), matching the source's own reliance on Python's
/// process-local `hash()` for the same purpose; this is sufficient
/// because fingerprints are only ever compared within one compilation.
pub fn fingerprint_of(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("wf{:016x}", hasher.finish())
}

/// Serialises a JSON value with sorted object keys so semantically equal
/// documents hash identically regardless of field order.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:?}:{}", k, canonicalize(&map[*k])));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(item));
            }
            out.push(']');
            out
        }
        other => other.to_string(),
    }
}

/// Strips the given top-level key from a cloned JSON object, a no-op if
/// the value is not an object or the key is absent. Used to exclude `t0`
/// from fingerprint inputs.
pub fn without_key(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(key);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = json!({"wf_func": "square", "amp": 0.3, "duration": 2.05e-5});
        let b = json!({"duration": 2.05e-5, "amp": 0.3, "wf_func": "square"});
        assert_eq!(fingerprint_of(&a), fingerprint_of(&b));
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = json!({"wf_func": "square", "amp": 0.3});
        let b = json!({"wf_func": "square", "amp": 0.31});
        assert_ne!(fingerprint_of(&a), fingerprint_of(&b));
    }

    #[test]
    fn without_key_strips_t0() {
        let v = json!({"wf_func": "square", "t0": 1.0e-7, "amp": 0.1});
        let stripped = without_key(&v, "t0");
        assert_eq!(stripped, json!({"wf_func": "square", "amp": 0.1}));
    }

    #[test]
    fn grid_alignment() {
        assert!(is_grid_aligned(0));
        assert!(is_grid_aligned(200_000));
        assert!(!is_grid_aligned(200_002));
    }

    #[test]
    fn immediate_clamping() {
        assert_eq!(to_signed_immediate(1.0), 32767);
        assert_eq!(to_signed_immediate(-1.0), -32768);
        assert_eq!(to_signed_immediate(0.0), 0);
    }
}
