//! Structured error and warning types for the compiler pipeline.
//!
//! Every fallible stage returns `Result<T, CompileError>`. Internal
//! invariants that indicate a bug in the compiler itself (not bad input)
//! still use `assert!`/`unreachable!`, matching how the upstream device
//! layer reserves `panic!` for genuinely-internal contract violations and
//! uses a real return type for anything traceable to input data.

use thiserror::Error;

/// All ways a compilation can fail, with the structured context needed to
/// point a caller at the offending mapping path, port/clock pair, or
/// operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    // --- Structural ---
    #[error("port/clock pair ({port}, {clock}) is declared by more than one sequencer (first at {first_path}, again at {second_path})")]
    DuplicatePortClock {
        port: String,
        clock: String,
        first_path: String,
        second_path: String,
    },

    #[error("mapping node at {path} declares `port` = {port:?} without a `clock`")]
    MissingClock { path: String, port: String },

    #[error("operation with fingerprint {fingerprint} references unknown port/clock ({port}, {clock})")]
    UnknownPortClock {
        port: String,
        clock: String,
        fingerprint: String,
    },

    #[error("acquisition with fingerprint {fingerprint} routed to device {device} which does not support acquisition")]
    UnsupportedAcquisition { device: String, fingerprint: String },

    #[error("device {device} output {output} declares unsupported output mode {mode}")]
    UnsupportedOutputMode {
        device: String,
        output: String,
        mode: String,
    },

    #[error("device {device} declares {found} sequencer slots, exceeding the module limit of {max}")]
    TooManySequencers {
        device: String,
        found: usize,
        max: usize,
    },

    // --- Semantic ---
    #[error("operation {fingerprint} carries neither valid pulse_info nor valid acquisition_info")]
    InvalidOperation { fingerprint: String },

    #[error("operation {fingerprint} starts at {time_ns} ns, which is not a multiple of the {grid_ns} ns grid")]
    GridViolation {
        fingerprint: String,
        time_ns: i64,
        grid_ns: i64,
    },

    #[error("sequencer for ({port}, {clock}) cannot emit operation {fingerprint}: required wait is {required_ns} ns but elapsed time is already {elapsed_ns} ns")]
    TimingConflict {
        port: String,
        clock: String,
        fingerprint: String,
        elapsed_ns: i64,
        required_ns: i64,
    },

    #[error("acquisitions {first_fingerprint} and {second_fingerprint} on ({port}, {clock}) are only {gap_ns} ns apart, below the minimum gap of {min_gap_ns} ns")]
    AcquisitionTooClose {
        port: String,
        clock: String,
        first_fingerprint: String,
        second_fingerprint: String,
        gap_ns: i64,
        min_gap_ns: i64,
    },

    #[error("device {device} nominates more than one scope-mode sequencer ({first_seq} and {second_seq})")]
    ScopeModeConflict {
        device: String,
        first_seq: String,
        second_seq: String,
    },

    // --- Numeric ---
    #[error("frequency for ({port}, {clock}) is under-constrained: neither `lo_freq` nor `interm_freq` is given")]
    UnderConstrainedFrequency { port: String, clock: String },

    #[error("frequency for ({port}, {clock}) is over-constrained: lo_freq={lo_freq} Hz, interm_freq={interm_freq} Hz, clock_freq={clock_freq} Hz do not satisfy RF = LO + IF within tolerance")]
    OverConstrainedFrequency {
        port: String,
        clock: String,
        lo_freq: f64,
        interm_freq: f64,
        clock_freq: f64,
    },

    #[error("{kind} {name} is assigned frequency {new_hz} Hz but already carries {existing_hz} Hz")]
    FrequencyConflict {
        kind: &'static str,
        name: String,
        existing_hz: f64,
        new_hz: f64,
    },

    #[error("pulse {fingerprint} on device {device} has peak amplitude {value} which exceeds the module's {limit} V range")]
    AmplitudeOutOfRange {
        device: String,
        fingerprint: String,
        value: f64,
        limit: f64,
    },

    #[error("downconverter_freq {downconverter_freq} Hz is invalid for clock {clock} with original RF {original_rf} Hz")]
    DownconverterInvalid {
        clock: String,
        downconverter_freq: f64,
        original_rf: f64,
    },

    // --- Environmental (never raised by this crate; modelled for callers) ---
    #[error("connected driver version {found} does not satisfy required version {required}")]
    DriverVersionMismatch { found: String, required: String },

    // --- Glue ---
    #[error("waveform function {name:?} is not registered in the sampler registry")]
    UnknownSampler { name: String },

    #[error("waveform function {name} requires parameter {param:?} which is missing from the record")]
    MissingParameter { name: String, param: String },

    #[error("malformed hardware mapping or schedule document: {0}")]
    MalformedDocument(String),
}

/// Non-fatal conditions surfaced alongside a successful compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A stitched long pulse's duration was not an exact multiple of the
    /// stitch unit; the residual is still played correctly but is worth
    /// flagging.
    StitchResidual {
        fingerprint: String,
        residual_ns: i64,
    },
    /// `downconverter_freq` was explicitly given as zero.
    DownconverterZero { clock: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::StitchResidual {
                fingerprint,
                residual_ns,
            } => write!(
                f,
                "pulse {fingerprint} stitched with a {residual_ns} ns residual play"
            ),
            Warning::DownconverterZero { clock } => {
                write!(f, "downconverter_freq for clock {clock} is explicitly 0")
            }
        }
    }
}
