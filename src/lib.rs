//! Compiles device-agnostic pulse schedules into per-sequencer Q1ASM
//! programs, waveform tables and settings for Qblox pulse-generator and
//! readout modules.
//!
//! The crate is organised as a five-stage pipeline, leaves first:
//! [`mapping`] indexes the hardware-mapping document into a PortClock
//! index; [`distributor`] routes each schedule operation to the
//! sequencer owning its (port, clock); [`frequency`] resolves the
//! RF/LO/IF triple for every active pair; [`waveform`] samples,
//! modulates and mixer-corrects each distinct pulse; [`q1asm`] emits the
//! Q1 assembly program; [`artifact`] assembles everything into the final
//! compiled-schedule mapping. [`compiler::compile_schedule`] chains all
//! five stages.

pub mod artifact;
pub mod compiler;
pub mod distributor;
pub mod error;
pub mod frequency;
pub mod mapping;
pub mod module;
pub mod q1asm;
pub mod schedule;
pub mod sequencer;
pub mod utils;
pub mod waveform;

pub use artifact::CompiledArtifact;
pub use compiler::compile_schedule;
pub use error::{CompileError, Warning};
pub use schedule::Schedule;

#[cfg(feature = "python")]
mod python {
    use pyo3::exceptions::PyValueError;
    use pyo3::prelude::*;

    /// Compiles a hardware mapping and schedule, both given as JSON
    /// strings, and returns the compiled artifact as a JSON string.
    ///
    /// Thin wrapper around [`crate::compile_schedule`] for callers on the
    /// Python side of a `quantify-scheduler`-style stack; the core
    /// pipeline itself has no Python dependency.
    #[pyfunction]
    fn compile_schedule(mapping_json: &str, schedule_json: &str) -> PyResult<String> {
        let mapping: serde_json::Value =
            serde_json::from_str(mapping_json).map_err(|e| PyValueError::new_err(e.to_string()))?;
        let schedule: crate::Schedule =
            serde_json::from_str(schedule_json).map_err(|e| PyValueError::new_err(e.to_string()))?;
        let (artifact, warnings) =
            crate::compile_schedule(&mapping, &schedule).map_err(|e| PyValueError::new_err(e.to_string()))?;
        for warning in &warnings {
            log::warn!("{warning}");
        }
        artifact.to_json_string().map_err(|e| PyValueError::new_err(e.to_string()))
    }

    #[pymodule]
    fn qblox_backend(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(compile_schedule, m)?)?;
        Ok(())
    }
}
