//! Module descriptors: the data-driven replacement for a QCM/QRM/QCM-RF/
//! QRM-RF/Cluster inheritance hierarchy. One descriptor parameterises the
//! single Q1ASM emitter and the single settings-assembly function.

/// Marker bits written by `set_mrk` at the start and end of a sequencer's
/// program; device-specific (§6 of the external-interfaces section).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerConfig {
    pub start: u32,
    pub end: u32,
}

/// Static per-instrument-type facts the rest of the pipeline is
/// parameterised by, instead of branching on a type tag or a class
/// hierarchy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleDescriptor {
    pub instrument_type: &'static str,
    pub max_sequencers: usize,
    pub peak_voltage_v: f64,
    pub marker: MarkerConfig,
    pub supports_acquisition: bool,
    pub has_rf_frontend: bool,
}

pub const QCM: ModuleDescriptor = ModuleDescriptor {
    instrument_type: "QCM",
    max_sequencers: 6,
    peak_voltage_v: 2.5,
    marker: MarkerConfig { start: 1, end: 0 },
    supports_acquisition: false,
    has_rf_frontend: false,
};

pub const QRM: ModuleDescriptor = ModuleDescriptor {
    instrument_type: "QRM",
    max_sequencers: 6,
    peak_voltage_v: 0.5,
    marker: MarkerConfig { start: 1, end: 0 },
    supports_acquisition: true,
    has_rf_frontend: false,
};

pub const QCM_RF: ModuleDescriptor = ModuleDescriptor {
    instrument_type: "QCM_RF",
    max_sequencers: 6,
    peak_voltage_v: 0.25,
    marker: MarkerConfig { start: 6, end: 8 },
    supports_acquisition: false,
    has_rf_frontend: true,
};

pub const QRM_RF: ModuleDescriptor = ModuleDescriptor {
    instrument_type: "QRM_RF",
    max_sequencers: 6,
    peak_voltage_v: 0.25,
    marker: MarkerConfig { start: 1, end: 4 },
    supports_acquisition: true,
    has_rf_frontend: true,
};

/// Looks up the static descriptor for a mapping document's
/// `instrument_type` tag. `Cluster` and `LocalOscillator` are structural
/// container/LO tags, not sequencer-bearing modules, and have no
/// descriptor of their own.
pub fn descriptor_for(instrument_type: &str) -> Option<ModuleDescriptor> {
    match instrument_type {
        "QCM" => Some(QCM),
        "QRM" => Some(QRM),
        "QCM_RF" => Some(QCM_RF),
        "QRM_RF" => Some(QRM_RF),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_resolve() {
        assert_eq!(descriptor_for("QCM"), Some(QCM));
        assert_eq!(descriptor_for("QRM_RF"), Some(QRM_RF));
    }

    #[test]
    fn unknown_types_are_none() {
        assert_eq!(descriptor_for("Cluster"), None);
        assert_eq!(descriptor_for("LocalOscillator"), None);
        assert_eq!(descriptor_for("bogus"), None);
    }
}
