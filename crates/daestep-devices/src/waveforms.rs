//! Time-varying source waveforms and their discontinuity times.

use std::f64::consts::PI;

use crate::error::{Error, Result};

/// A time-varying waveform specification.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Waveform {
    /// Constant value.
    Dc(f64),

    /// PULSE(V1 V2 TD TR TF PW PER); `per = 0` means a single pulse.
    Pulse {
        v1: f64,
        v2: f64,
        td: f64,
        tr: f64,
        tf: f64,
        pw: f64,
        per: f64,
    },

    /// SIN(VO VA FREQ TD THETA PHASE), phase in degrees.
    Sin {
        vo: f64,
        va: f64,
        freq: f64,
        td: f64,
        theta: f64,
        phase: f64,
    },

    /// PWL(T1 V1 T2 V2 ...), times ascending.
    Pwl { points: Vec<(f64, f64)> },
}

impl Waveform {
    pub fn dc(value: f64) -> Self {
        Waveform::Dc(value)
    }

    pub fn pulse(v1: f64, v2: f64, td: f64, tr: f64, tf: f64, pw: f64, per: f64) -> Self {
        Waveform::Pulse {
            v1,
            v2,
            td,
            tr,
            tf,
            pw,
            per,
        }
    }

    pub fn sin(vo: f64, va: f64, freq: f64) -> Self {
        Waveform::Sin {
            vo,
            va,
            freq,
            td: 0.0,
            theta: 0.0,
            phase: 0.0,
        }
    }

    pub fn pwl(points: Vec<(f64, f64)>) -> Self {
        Waveform::Pwl { points }
    }

    /// Reject shapes that cannot be evaluated or stepped through.
    pub fn validate(&self) -> Result<()> {
        match self {
            Waveform::Dc(v) if !v.is_finite() => {
                Err(Error::InvalidWaveform(format!("non-finite DC value {v}")))
            }
            Waveform::Pulse {
                td, tr, tf, pw, per, ..
            } => {
                if [*td, *tr, *tf, *pw, *per].iter().any(|v| *v < 0.0 || !v.is_finite()) {
                    return Err(Error::InvalidWaveform(
                        "pulse times must be finite and non-negative".into(),
                    ));
                }
                if *per > 0.0 && per < &(tr + pw + tf) {
                    return Err(Error::InvalidWaveform(
                        "pulse period shorter than rise + width + fall".into(),
                    ));
                }
                Ok(())
            }
            Waveform::Sin { freq, .. } if *freq < 0.0 => {
                Err(Error::InvalidWaveform(format!("negative frequency {freq}")))
            }
            Waveform::Pwl { points } => {
                if points.windows(2).any(|w| w[1].0 <= w[0].0) {
                    return Err(Error::InvalidWaveform(
                        "PWL times must be strictly increasing".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Evaluate the waveform at `time`.
    pub fn value_at(&self, time: f64) -> f64 {
        match self {
            Waveform::Dc(v) => *v,
            Waveform::Pulse {
                v1,
                v2,
                td,
                tr,
                tf,
                pw,
                per,
            } => eval_pulse(*v1, *v2, *td, *tr, *tf, *pw, *per, time),
            Waveform::Sin {
                vo,
                va,
                freq,
                td,
                theta,
                phase,
            } => eval_sin(*vo, *va, *freq, *td, *theta, *phase, time),
            Waveform::Pwl { points } => eval_pwl(points, time),
        }
    }

    /// True for a constant zero output.
    pub fn is_zero(&self) -> bool {
        matches!(self, Waveform::Dc(v) if *v == 0.0)
    }

    /// Corner times in `(from, to]`, ascending.
    pub fn breakpoints(&self, from: f64, to: f64) -> Vec<f64> {
        let in_window = |t: f64| t > from && t <= to;
        match self {
            Waveform::Dc(_) => Vec::new(),
            Waveform::Pulse {
                td,
                tr,
                tf,
                pw,
                per,
                ..
            } => {
                let corners = [0.0, *tr, tr + pw, tr + pw + tf];
                let mut times = Vec::new();
                if *per > 0.0 {
                    let first = ((from - td) / per).floor().max(0.0) as u64;
                    let mut k = first;
                    loop {
                        let start = td + k as f64 * per;
                        if start > to {
                            break;
                        }
                        times.extend(corners.iter().map(|c| start + c).filter(|t| in_window(*t)));
                        k += 1;
                    }
                } else {
                    times.extend(corners.iter().map(|c| td + c).filter(|t| in_window(*t)));
                }
                times.dedup();
                times
            }
            Waveform::Sin { td, .. } => {
                if in_window(*td) {
                    vec![*td]
                } else {
                    Vec::new()
                }
            }
            Waveform::Pwl { points } => points
                .iter()
                .map(|(t, _)| *t)
                .filter(|t| in_window(*t))
                .collect(),
        }
    }

    /// Step cap needed to resolve the waveform shape, if any.
    pub fn max_step(&self) -> Option<f64> {
        match self {
            Waveform::Sin { freq, .. } if *freq > 0.0 => Some(0.1 / freq),
            _ => None,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn eval_pulse(v1: f64, v2: f64, td: f64, tr: f64, tf: f64, pw: f64, per: f64, t: f64) -> f64 {
    if t < td {
        return v1;
    }

    let t_rel = if per > 0.0 { (t - td) % per } else { t - td };

    if t_rel < tr {
        v1 + (v2 - v1) * t_rel / tr
    } else if t_rel < tr + pw {
        v2
    } else if t_rel < tr + pw + tf {
        v2 - (v2 - v1) * (t_rel - tr - pw) / tf
    } else {
        v1
    }
}

fn eval_sin(vo: f64, va: f64, freq: f64, td: f64, theta: f64, phase: f64, t: f64) -> f64 {
    let phase_rad = phase * PI / 180.0;
    if t < td {
        return vo + va * phase_rad.sin();
    }

    let t_rel = t - td;
    let damping = if theta > 0.0 {
        (-theta * t_rel).exp()
    } else {
        1.0
    };

    vo + va * damping * (2.0 * PI * freq * t_rel + phase_rad).sin()
}

fn eval_pwl(points: &[(f64, f64)], t: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if t <= first.0 {
        return first.1;
    }
    if t >= last.0 {
        return last.1;
    }

    let k = points.partition_point(|(pt, _)| *pt <= t);
    let (t0, v0) = points[k - 1];
    let (t1, v1) = points[k];
    v0 + (t - t0) / (t1 - t0) * (v1 - v0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_waveform() {
        // PULSE(0 5 1m 0.1m 0.1m 1m 5m)
        let w = Waveform::pulse(0.0, 5.0, 1e-3, 0.1e-3, 0.1e-3, 1e-3, 5e-3);

        assert_eq!(w.value_at(0.5e-3), 0.0);
        assert!((w.value_at(1.05e-3) - 2.5).abs() < 1e-10);
        assert!((w.value_at(1.5e-3) - 5.0).abs() < 1e-10);
        assert!((w.value_at(2.5e-3) - 0.0).abs() < 1e-10);
        // Second period
        assert!((w.value_at(6.5e-3) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_pulse_breakpoints_single() {
        let w = Waveform::pulse(0.0, 1.0, 1.0, 0.5, 0.5, 2.0, 0.0);
        assert_eq!(w.breakpoints(0.0, 10.0), vec![1.0, 1.5, 3.5, 4.0]);
        // Window is half-open on the left
        assert_eq!(w.breakpoints(1.5, 3.5), vec![3.5]);
    }

    #[test]
    fn test_pulse_breakpoints_periodic() {
        let w = Waveform::pulse(0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 4.0);
        let bps = w.breakpoints(3.5, 9.0);
        assert_eq!(bps, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_sin_waveform() {
        let w = Waveform::sin(0.0, 1.0, 1000.0);
        assert!((w.value_at(0.25e-3) - 1.0).abs() < 1e-10);
        assert!((w.value_at(0.75e-3) + 1.0).abs() < 1e-10);
        let cap = w.max_step().unwrap();
        assert!((cap - 1e-4).abs() < 1e-18, "cap = {}", cap);
        assert!(w.breakpoints(0.0, 1.0).is_empty());
    }

    #[test]
    fn test_pwl_waveform() {
        let w = Waveform::pwl(vec![(0.0, 0.0), (1e-3, 5.0), (2e-3, 5.0), (3e-3, 0.0)]);
        assert_eq!(w.value_at(0.0), 0.0);
        assert!((w.value_at(0.5e-3) - 2.5).abs() < 1e-10);
        assert!((w.value_at(2.5e-3) - 2.5).abs() < 1e-10);
        assert!((w.value_at(5e-3) - 0.0).abs() < 1e-10);
        assert_eq!(w.breakpoints(0.0, 2e-3), vec![1e-3, 2e-3]);
    }

    #[test]
    fn test_validate() {
        assert!(Waveform::dc(1.0).validate().is_ok());
        assert!(Waveform::pulse(0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 2.0).validate().is_err());
        assert!(Waveform::pwl(vec![(1.0, 0.0), (1.0, 1.0)]).validate().is_err());
        assert!(Waveform::dc(0.0).is_zero());
    }
}
