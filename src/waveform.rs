//! Waveform pipeline (§4.4). Analytic waveform functions are looked up by
//! name in a `SamplerRegistry` (§9: the re-architected replacement for
//! dynamic dispatch on a function-name string), sampled at 1 GS/s,
//! modulated by the sequencer's IF, mixer-corrected, normalised, and
//! range-checked before being registered in the waveform table.

use std::f64::consts::PI;

use indexmap::IndexMap;
use ndarray::Array1;
use serde_json::Value;

use crate::error::CompileError;
use crate::mapping::MixerCorrections;
use crate::schedule::{PulseInfo, WeightWaveform};
use crate::utils::{seconds_to_samples, STITCH_UNIT_NS};

/// A named analytic waveform function: samples `n` points at 1 GS/s from
/// the record's parameter bag, returning separate real/imaginary arrays.
pub type SamplerFn = fn(&IndexMap<String, Value>, usize) -> Result<(Array1<f64>, Array1<f64>), CompileError>;

/// Registry of named samplers, keyed by the unqualified function name
/// (the part after the last `.` of `wf_func`).
pub struct SamplerRegistry {
    samplers: IndexMap<&'static str, SamplerFn>,
}

impl Default for SamplerRegistry {
    fn default() -> Self {
        let mut samplers: IndexMap<&'static str, SamplerFn> = IndexMap::new();
        samplers.insert("square", sample_square);
        samplers.insert("soft_square", sample_soft_square);
        samplers.insert("ramp", sample_ramp);
        samplers.insert("drag", sample_drag);
        samplers.insert("chirp", sample_chirp);
        SamplerRegistry { samplers }
    }
}

impl SamplerRegistry {
    pub fn sample(
        &self,
        name: &str,
        params: &IndexMap<String, Value>,
        n: usize,
    ) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
        let f = self
            .samplers
            .get(name)
            .ok_or_else(|| CompileError::UnknownSampler { name: name.to_string() })?;
        f(params, n)
    }
}

/// Extracts the unqualified function name from a fully-qualified
/// `wf_func` string such as `quantify.scheduler.waveforms.drag`.
pub fn short_name(wf_func: &str) -> &str {
    wf_func.rsplit('.').next().unwrap_or(wf_func)
}

fn required_f64(params: &IndexMap<String, Value>, name: &str, key: &str) -> Result<f64, CompileError> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| CompileError::MissingParameter {
            name: name.to_string(),
            param: key.to_string(),
        })
}

fn optional_f64(params: &IndexMap<String, Value>, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn sample_square(params: &IndexMap<String, Value>, n: usize) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
    let amp = required_f64(params, "square", "amp")?;
    Ok((Array1::from_elem(n, amp), Array1::zeros(n)))
}

fn sample_soft_square(params: &IndexMap<String, Value>, n: usize) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
    let amp = required_f64(params, "soft_square", "amp")?;
    if n == 0 {
        return Ok((Array1::zeros(0), Array1::zeros(0)));
    }
    // Square envelope convolved with a Hann window, approximated directly
    // by windowing the flat amplitude with a raised-cosine taper across
    // the whole pulse (matches the qualitative "smoothened square" shape
    // the source produces via an explicit convolution).
    let mut re = Array1::zeros(n);
    for k in 0..n {
        let x = k as f64 / (n.max(1) as f64 - 1.0).max(1.0);
        let window = 0.5 - 0.5 * (2.0 * PI * x).cos();
        re[k] = amp * window;
    }
    Ok((re, Array1::zeros(n)))
}

fn sample_ramp(params: &IndexMap<String, Value>, n: usize) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
    let amp = required_f64(params, "ramp", "amp")?;
    let mut re = Array1::zeros(n);
    for k in 0..n {
        re[k] = if n <= 1 { amp } else { amp * (k as f64) / ((n - 1) as f64) };
    }
    Ok((re, Array1::zeros(n)))
}

fn sample_drag(params: &IndexMap<String, Value>, n: usize) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
    let g_amp = required_f64(params, "drag", "G_amp")?;
    let d_amp = required_f64(params, "drag", "D_amp")?;
    let phase_deg = optional_f64(params, "phase", 0.0);
    let nr_sigma = optional_f64(params, "nr_sigma", 4.0);
    let duration_samples = n as f64;
    if duration_samples == 0.0 {
        return Ok((Array1::zeros(0), Array1::zeros(0)));
    }
    let sigma = duration_samples / nr_sigma;
    let mu = duration_samples / 2.0;
    let phase = phase_deg.to_radians();

    let mut re = Array1::zeros(n);
    let mut im = Array1::zeros(n);
    for k in 0..n {
        let t = k as f64;
        let gauss = (-((t - mu).powi(2)) / (2.0 * sigma * sigma)).exp();
        let gauss_0 = (-((0.0 - mu).powi(2)) / (2.0 * sigma * sigma)).exp();
        // Subtract the edge value so the envelope starts and ends at zero,
        // matching the source's DRAG envelope normalisation.
        let envelope = (gauss - gauss_0) / (1.0 - gauss_0).max(1.0e-12);
        let derivative = -(t - mu) / (sigma * sigma) * gauss;
        let i_component = g_amp * envelope;
        let q_component = d_amp * derivative;
        // Apply the requested carrier phase as a static rotation of the
        // (G, D) envelope pair.
        let (s, c) = phase.sin_cos();
        re[k] = i_component * c - q_component * s;
        im[k] = i_component * s + q_component * c;
    }
    Ok((re, im))
}

fn sample_chirp(params: &IndexMap<String, Value>, n: usize) -> Result<(Array1<f64>, Array1<f64>), CompileError> {
    let amp = required_f64(params, "chirp", "amp")?;
    let start_freq = optional_f64(params, "start_freq", 0.0);
    let end_freq = required_f64(params, "chirp", "end_freq")?;
    let duration_s = n as f64 / crate::utils::SAMPLE_RATE_HZ;
    let mut re = Array1::zeros(n);
    let mut im = Array1::zeros(n);
    for k in 0..n {
        let t = k as f64 / crate::utils::SAMPLE_RATE_HZ;
        let sweep_rate = if duration_s > 0.0 { (end_freq - start_freq) / duration_s } else { 0.0 };
        let phase = 2.0 * PI * (start_freq * t + 0.5 * sweep_rate * t * t);
        let (s, c) = phase.sin_cos();
        re[k] = amp * c;
        im[k] = amp * s;
    }
    Ok((re, im))
}

/// A long flat pulse replayed from a single stored unit instead of a full
/// sample array (§4.5 "Long-pulse stitching").
#[derive(Debug, Clone, Copy)]
pub struct StitchPlan {
    pub unit_ns: i64,
    pub repeats: u64,
    pub residual_ns: i64,
}

/// The result of sampling, modulating, mixer-correcting and normalising
/// one pulse fingerprint.
#[derive(Debug, Clone)]
pub struct SampledWaveform {
    pub re: Array1<f64>,
    pub im: Array1<f64>,
    pub gain_i: f64,
    pub gain_q: f64,
    pub stitch: Option<StitchPlan>,
}

fn is_idle(pulse: &PulseInfo) -> bool {
    pulse.wf_func.is_none()
}

pub fn is_staircase(pulse: &PulseInfo) -> bool {
    pulse
        .wf_func
        .as_deref()
        .map(|f| short_name(f) == "staircase")
        .unwrap_or(false)
}

/// Samples, modulates and mixer-corrects one pulse. Returns `Ok(None)`
/// for idle pulses and staircases, both of which are handled directly by
/// the emitter without a waveform-table entry.
pub fn sample_pulse(
    registry: &SamplerRegistry,
    pulse: &PulseInfo,
    timing_ns: i64,
    if_hz: f64,
    mixer: Option<&MixerCorrections>,
) -> Result<Option<SampledWaveform>, CompileError> {
    if is_idle(pulse) || is_staircase(pulse) {
        return Ok(None);
    }
    let wf_func = pulse.wf_func.as_deref().expect("checked non-idle above");
    let name = short_name(wf_func);

    let full_samples = seconds_to_samples(pulse.duration);
    let full_ns = (pulse.duration * 1.0e9).round() as i64;
    let stitched = name == "square" && if_hz == 0.0 && full_ns > STITCH_UNIT_NS;
    let n = if stitched { STITCH_UNIT_NS as usize } else { full_samples };

    let (mut re, mut im) = registry.sample(name, &pulse.params, n)?;

    if if_hz != 0.0 {
        modulate(&mut re, &mut im, timing_ns, if_hz);
    }

    if let Some(m) = mixer {
        mixer_correct(&mut re, &mut im, m);
    }

    let gain_i = re.iter().cloned().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let gain_q = im.iter().cloned().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if gain_i > 0.0 {
        re.mapv_inplace(|v| v / gain_i);
    }
    if gain_q > 0.0 {
        im.mapv_inplace(|v| v / gain_q);
    }

    let stitch = if stitched {
        let repeats = (full_ns / STITCH_UNIT_NS) as u64;
        let residual_ns = full_ns % STITCH_UNIT_NS;
        Some(StitchPlan {
            unit_ns: STITCH_UNIT_NS,
            repeats,
            residual_ns,
        })
    } else {
        None
    };

    Ok(Some(SampledWaveform {
        re,
        im,
        gain_i,
        gain_q,
        stitch,
    }))
}

/// Samples an acquisition's weighting waveform: same sampler lookup, no
/// modulation, no mixer correction (§4.4).
pub fn sample_weight(
    registry: &SamplerRegistry,
    weight: &WeightWaveform,
) -> Result<Option<(Array1<f64>, Array1<f64>)>, CompileError> {
    let Some(wf_func) = weight.wf_func.as_deref() else {
        return Ok(None);
    };
    let n = seconds_to_samples(weight.duration);
    let name = short_name(wf_func);
    registry.sample(name, &weight.params, n).map(Some)
}

/// Multiplies the (re, im) pair elementwise by `exp(2*pi*i*f*(t + t0))`
/// using the pulse's absolute timing as the phase origin, so the
/// NCO-equivalent phase stays continuous across the whole schedule
/// instead of resetting at each pulse's own local time.
fn modulate(re: &mut Array1<f64>, im: &mut Array1<f64>, timing_ns: i64, if_hz: f64) {
    let t0 = timing_ns as f64 * 1.0e-9;
    for k in 0..re.len() {
        let t = t0 + (k as f64) / crate::utils::SAMPLE_RATE_HZ;
        let phase = 2.0 * PI * if_hz * t;
        let (s, c) = phase.sin_cos();
        let (i0, q0) = (re[k], im[k]);
        re[k] = i0 * c - q0 * s;
        im[k] = i0 * s + q0 * c;
    }
}

/// Standard IQ-skew predistortion: leaves the I axis untouched and shears
/// the Q axis by the phase error, then rescales it by the amplitude
/// ratio, so that after the real mixer's own imperfection the two axes
/// recombine into the intended signal.
fn mixer_correct(re: &mut Array1<f64>, im: &mut Array1<f64>, mixer: &MixerCorrections) {
    let phi = mixer.phase_error_deg.to_radians();
    let (tan_phi, cos_phi) = (phi.tan(), phi.cos());
    let ratio = if mixer.amp_ratio.abs() > 1.0e-12 { mixer.amp_ratio } else { 1.0 };
    for k in 0..re.len() {
        let (i0, q0) = (re[k], im[k]);
        im[k] = i0 * tan_phi + q0 / (ratio * cos_phi);
        re[k] = i0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn square_pulse_samples_constant_amplitude() {
        let registry = SamplerRegistry::default();
        let params = IndexMap::from([("amp".to_string(), json!(0.3))]);
        let (re, im) = registry.sample("square", &params, 5).unwrap();
        assert!(re.iter().all(|&v| (v - 0.3).abs() < 1e-12));
        assert!(im.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn long_square_pulse_is_stitched() {
        let registry = SamplerRegistry::default();
        let pulse = PulseInfo {
            wf_func: Some("quantify.scheduler.waveforms.square".to_string()),
            duration: 20.5e-6,
            t0: 0.0,
            clock: "baseband".to_string(),
            port: Some("q0:fl".to_string()),
            params: IndexMap::from([("amp".to_string(), json!(0.3))]),
        };
        let sampled = sample_pulse(&registry, &pulse, 0, 0.0, None).unwrap().unwrap();
        let stitch = sampled.stitch.expect("should stitch");
        assert_eq!(stitch.repeats, 20);
        assert_eq!(stitch.residual_ns, 500);
        assert_eq!(sampled.re.len(), STITCH_UNIT_NS as usize);
        assert!(sampled.re.iter().all(|&v| (v - 1.0).abs() < 1e-9));
    }

    #[test]
    fn idle_and_staircase_are_skipped() {
        let registry = SamplerRegistry::default();
        let idle = PulseInfo {
            wf_func: None,
            duration: 1.0e-7,
            t0: 0.0,
            clock: "baseband".to_string(),
            port: None,
            params: IndexMap::new(),
        };
        assert!(sample_pulse(&registry, &idle, 0, 0.0, None).unwrap().is_none());

        let staircase = PulseInfo {
            wf_func: Some("staircase".to_string()),
            duration: 1.0e-6,
            t0: 0.0,
            clock: "baseband".to_string(),
            port: Some("q0:fl".to_string()),
            params: IndexMap::new(),
        };
        assert!(sample_pulse(&registry, &staircase, 0, 0.0, None).unwrap().is_none());
    }

    #[test]
    fn unknown_sampler_is_an_error() {
        let registry = SamplerRegistry::default();
        let pulse = PulseInfo {
            wf_func: Some("mystery".to_string()),
            duration: 1.0e-8,
            t0: 0.0,
            clock: "baseband".to_string(),
            port: Some("q0:fl".to_string()),
            params: IndexMap::new(),
        };
        let err = sample_pulse(&registry, &pulse, 0, 0.0, None).unwrap_err();
        assert!(matches!(err, CompileError::UnknownSampler { .. }));
    }
}
