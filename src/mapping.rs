//! Hardware-mapping indexer (§4.1): walks the nested mapping document and
//! builds the PortClock index and the reverse device index.
//!
//! Cyclic references between an output and the local oscillator it names
//! are avoided the way §9 prescribes: the PortClock index and the LO
//! registry are built in the same recursive walk but cross-linked only by
//! name, never by direct reference.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::CompileError;
use crate::utils::FREQ_TOLERANCE_HZ;

/// Mixer-skew and DC-offset corrections declared on an output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerCorrections {
    pub amp_ratio: f64,
    pub phase_error_deg: f64,
    pub offset_i: f64,
    pub offset_q: f64,
}

/// Where one (port, clock) pair lives in the mapping tree.
#[derive(Debug, Clone, PartialEq)]
pub struct PortClockLocation {
    pub device: String,
    pub output: String,
    pub seq_slot: String,
    pub interm_freq: Option<f64>,
    pub nco_en: bool,
}

/// Static facts about one output sub-tree, gathered during the walk.
#[derive(Debug, Clone, Default)]
pub struct OutputMeta {
    pub lo_name: Option<String>,
    pub mixer: Option<MixerCorrections>,
}

/// Static facts about one device, gathered during the walk.
#[derive(Debug, Clone, Default)]
pub struct DeviceMeta {
    pub instrument_type: String,
    pub reference: String,
    pub outputs: IndexMap<String, OutputMeta>,
    pub seq_slots: Vec<String>,
}

/// The result of indexing a hardware-mapping document: a bijective
/// (port, clock) -> location map, the reverse device index, and the
/// registry of local oscillators referenced anywhere in the tree.
#[derive(Debug, Clone, Default)]
pub struct HardwareIndex {
    pub port_clock: IndexMap<(String, String), PortClockLocation>,
    pub devices: IndexMap<String, DeviceMeta>,
    pub lo_freq: IndexMap<String, Option<f64>>,
    pub latency_corrections: IndexMap<String, f64>,
}

const RESERVED_TOP_KEYS: [&str; 3] = ["backend", "latency_corrections", "distortion_corrections"];

/// Indexes a full hardware-mapping document.
pub fn build_index(doc: &Value) -> Result<HardwareIndex, CompileError> {
    let mut index = HardwareIndex::default();

    if let Some(corrections) = doc.get("latency_corrections").and_then(Value::as_object) {
        for (k, v) in corrections {
            if let Some(seconds) = v.as_f64() {
                index.latency_corrections.insert(k.clone(), seconds);
            }
        }
    }

    let top = doc
        .as_object()
        .ok_or_else(|| CompileError::MalformedDocument("hardware mapping root must be an object".into()))?;

    for (device_name, device_doc) in top {
        if RESERVED_TOP_KEYS.contains(&device_name.as_str()) {
            continue;
        }
        let Some(device_obj) = device_doc.as_object() else {
            continue;
        };
        let mut meta = DeviceMeta {
            instrument_type: device_obj
                .get("instrument_type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            reference: device_obj
                .get("ref")
                .and_then(Value::as_str)
                .unwrap_or("internal")
                .to_string(),
            ..Default::default()
        };
        index_device_children(device_doc, device_name, device_name, &mut meta, &mut index)?;
        index.devices.insert(device_name.clone(), meta);
    }

    Ok(index)
}

/// Recurses through one device's sub-tree. `output_name` tracks the
/// nearest enclosing output-level node so seq-slots can be attributed to
/// it; it starts out equal to the device name and is overwritten the
/// first time we descend into a genuine output node.
fn index_device_children(
    node: &Value,
    device_name: &str,
    path: &str,
    meta: &mut DeviceMeta,
    index: &mut HardwareIndex,
) -> Result<(), CompileError> {
    let Some(obj) = node.as_object() else {
        return Ok(());
    };

    if let (Some(port), clock) = (obj.get("port"), obj.get("clock")) {
        let port_str = port
            .as_str()
            .ok_or_else(|| CompileError::MalformedDocument(format!("{path}: `port` must be a string or null")))?;
        let Some(clock) = clock else {
            return Err(CompileError::MissingClock {
                path: path.to_string(),
                port: port_str.to_string(),
            });
        };
        let clock_str = clock
            .as_str()
            .ok_or_else(|| CompileError::MalformedDocument(format!("{path}: `clock` must be a string")))?;

        let (output_name, seq_slot) = split_output_and_slot(path, device_name);
        let interm_freq = match obj.get("interm_freq") {
            None | Some(Value::Null) => None,
            Some(v) => v.as_f64(),
        };
        let nco_en = obj.get("nco_en").and_then(Value::as_bool).unwrap_or(true);

        let key = (port_str.to_string(), clock_str.to_string());
        if let Some(existing) = index.port_clock.get(&key) {
            return Err(CompileError::DuplicatePortClock {
                port: port_str.to_string(),
                clock: clock_str.to_string(),
                first_path: format!("{}/{}/{}", existing.device, existing.output, existing.seq_slot),
                second_path: format!("{device_name}/{output_name}/{seq_slot}"),
            });
        }
        index.port_clock.insert(
            key,
            PortClockLocation {
                device: device_name.to_string(),
                output: output_name.clone(),
                seq_slot: seq_slot.clone(),
                interm_freq,
                nco_en,
            },
        );
        meta.seq_slots.push(format!("{output_name}/{seq_slot}"));
        return Ok(());
    }

    if let Some(lo_name) = obj.get("lo_name").and_then(Value::as_str) {
        let entry = index.lo_freq.entry(lo_name.to_string()).or_insert(None);
        if let Some(freq) = obj.get("lo_freq").and_then(Value::as_f64) {
            match *entry {
                None => *entry = Some(freq),
                Some(existing) if (existing - freq).abs() > FREQ_TOLERANCE_HZ => {
                    return Err(CompileError::FrequencyConflict {
                        kind: "local oscillator",
                        name: lo_name.to_string(),
                        existing_hz: existing,
                        new_hz: freq,
                    });
                }
                Some(_) => {}
            }
        }
        let mixer = obj.get("mixer_corrections").and_then(Value::as_object).map(|m| MixerCorrections {
            amp_ratio: m.get("amp_ratio").and_then(Value::as_f64).unwrap_or(1.0),
            phase_error_deg: m.get("phase_error").and_then(Value::as_f64).unwrap_or(0.0),
            offset_i: m.get("offset_I").and_then(Value::as_f64).unwrap_or(0.0),
            offset_q: m.get("offset_Q").and_then(Value::as_f64).unwrap_or(0.0),
        });
        let output_name = output_name_from_path(path, device_name);
        let output_entry = meta.outputs.entry(output_name).or_default();
        output_entry.lo_name = Some(lo_name.to_string());
        if mixer.is_some() {
            output_entry.mixer = mixer;
        }
    }

    for (key, child) in obj {
        if RESERVED_TOP_KEYS.contains(&key.as_str()) {
            continue;
        }
        match child {
            Value::Object(_) => {
                index_device_children(child, device_name, &format!("{path}/{key}"), meta, index)?;
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if item.is_object() {
                        index_device_children(item, device_name, &format!("{path}/{key}[{i}]"), meta, index)?;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn split_output_and_slot(path: &str, device_name: &str) -> (String, String) {
    let rel = path.strip_prefix(device_name).unwrap_or(path);
    let parts: Vec<&str> = rel.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        [output, slot] => (output.to_string(), slot.to_string()),
        [slot] => ("default".to_string(), slot.to_string()),
        _ => (
            parts.first().copied().unwrap_or("default").to_string(),
            parts.last().copied().unwrap_or("seq0").to_string(),
        ),
    }
}

fn output_name_from_path(path: &str, device_name: &str) -> String {
    let rel = path.strip_prefix(device_name).unwrap_or(path);
    rel.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("default")
        .to_string()
}
