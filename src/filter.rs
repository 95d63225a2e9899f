//! Signal conditioning for EEG channels: detrending, Butterworth IIR filters
//! and analysis windows.
//!
//! All filters work in place on a slice of samples. Butterworth filters are
//! designed from the analog prototype, moved to the requested band and
//! discretised with a prewarped bilinear transform, then run as a cascade of
//! second-order sections.

use std::f64::consts::PI;

use rustfft::num_complex::Complex64;

use crate::error::{Error, Result};

/// Highest supported filter order.
pub const MAX_FILTER_ORDER: usize = 8;

/// Tolerance below which a root's imaginary part counts as zero.
const REAL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetrendOperation {
    #[default]
    None,
    /// Subtract the mean
    Constant,
    /// Subtract the least-squares line
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// Causal, single pass
    #[default]
    Butterworth,
    /// Forward-backward pass, no phase shift and squared magnitude response
    ButterworthZeroPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowOperation {
    #[default]
    None,
    Hanning,
    Hamming,
    BlackmanHarris,
}

/// Removes a trend from `data` in place.
pub fn detrend(data: &mut [f64], operation: DetrendOperation) {
    if data.is_empty() {
        return;
    }
    let n = data.len() as f64;
    match operation {
        DetrendOperation::None => {}
        DetrendOperation::Constant => {
            let mean = data.iter().sum::<f64>() / n;
            data.iter_mut().for_each(|x| *x -= mean);
        }
        DetrendOperation::Linear => {
            let mean_x = (n - 1.0) / 2.0;
            let mean_y = data.iter().sum::<f64>() / n;
            let (cov, var) = data.iter().enumerate().fold((0.0, 0.0), |(cov, var), (i, y)| {
                let dx = i as f64 - mean_x;
                (cov + dx * (y - mean_y), var + dx * dx)
            });
            let slope = if var > 0.0 { cov / var } else { 0.0 };
            data.iter_mut()
                .enumerate()
                .for_each(|(i, y)| *y -= mean_y + slope * (i as f64 - mean_x));
        }
    }
}

/// Coefficients of `window` over `len` points (symmetric).
pub fn get_window(window: WindowOperation, len: usize) -> Vec<f64> {
    if len < 2 {
        return vec![1.0; len];
    }
    let m = (len - 1) as f64;
    (0..len)
        .map(|i| {
            let phase = 2.0 * PI * i as f64 / m;
            match window {
                WindowOperation::None => 1.0,
                WindowOperation::Hanning => 0.5 - 0.5 * phase.cos(),
                WindowOperation::Hamming => 0.54 - 0.46 * phase.cos(),
                WindowOperation::BlackmanHarris => {
                    0.35875 - 0.48829 * phase.cos() + 0.14128 * (2.0 * phase).cos()
                        - 0.01168 * (3.0 * phase).cos()
                }
            }
        })
        .collect()
}

/// Multiplies `data` by `window` in place.
pub fn window_data(data: &mut [f64], window: WindowOperation) {
    get_window(window, data.len())
        .iter()
        .zip(data.iter_mut())
        .for_each(|(w, x)| *x *= w);
}

/// The power of two closest to `value`; ties go up.
pub fn get_nearest_power_of_two(value: usize) -> usize {
    if value <= 1 {
        return 1;
    }
    let upper = value.next_power_of_two();
    let lower = upper / 2;
    if value - lower < upper - value {
        lower
    } else {
        upper
    }
}

/// Zeros, poles and gain of a transfer function.
#[derive(Debug, Clone)]
struct Zpk {
    zeros: Vec<Complex64>,
    poles: Vec<Complex64>,
    gain: f64,
}

impl Zpk {
    /// Analog Butterworth lowpass prototype with a cutoff of 1 rad/s.
    fn prototype(order: usize) -> Self {
        let poles = (0..order)
            .map(|k| {
                let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
                Complex64::from_polar(1.0, theta)
            })
            .collect();
        Self {
            zeros: Vec::new(),
            poles,
            gain: 1.0,
        }
    }

    fn inverse_gain(poles: &[Complex64]) -> f64 {
        (Complex64::new(1.0, 0.0) / poles.iter().map(|p| -*p).product::<Complex64>()).re
    }

    fn to_lowpass(self, wc: f64) -> Self {
        let order = self.poles.len() as i32;
        Self {
            zeros: Vec::new(),
            poles: self.poles.iter().map(|p| *p * wc).collect(),
            gain: self.gain * wc.powi(order),
        }
    }

    fn to_highpass(self, wc: f64) -> Self {
        Self {
            zeros: vec![Complex64::new(0.0, 0.0); self.poles.len()],
            gain: self.gain * Self::inverse_gain(&self.poles),
            poles: self.poles.iter().map(|p| wc / *p).collect(),
        }
    }

    fn to_bandpass(self, w0: f64, bw: f64) -> Self {
        let order = self.poles.len() as i32;
        let poles = self
            .poles
            .iter()
            .flat_map(|p| {
                let half = *p * (bw / 2.0);
                let root = (half * half - w0 * w0).sqrt();
                [half + root, half - root]
            })
            .collect();
        Self {
            zeros: vec![Complex64::new(0.0, 0.0); self.poles.len()],
            poles,
            gain: self.gain * bw.powi(order),
        }
    }

    fn to_bandstop(self, w0: f64, bw: f64) -> Self {
        let order = self.poles.len();
        let poles = self
            .poles
            .iter()
            .flat_map(|p| {
                let half = (bw / 2.0) / *p;
                let root = (half * half - w0 * w0).sqrt();
                [half + root, half - root]
            })
            .collect();
        let zeros = (0..order)
            .flat_map(|_| [Complex64::new(0.0, w0), Complex64::new(0.0, -w0)])
            .collect();
        Self {
            zeros,
            gain: self.gain * Self::inverse_gain(&self.poles),
            poles,
        }
    }

    /// Bilinear transform at sampling rate `fs`.
    fn bilinear(self, fs: f64) -> Self {
        let fs2 = Complex64::new(2.0 * fs, 0.0);
        let map = |s: &Complex64| (fs2 + *s) / (fs2 - *s);
        let mut zeros: Vec<Complex64> = self.zeros.iter().map(map).collect();
        zeros.resize(self.poles.len(), Complex64::new(-1.0, 0.0));
        let num: Complex64 = self.zeros.iter().map(|z| fs2 - *z).product();
        let den: Complex64 = self.poles.iter().map(|p| fs2 - *p).product();
        Self {
            zeros,
            poles: self.poles.iter().map(map).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    /// Groups roots into second-order sections: conjugate pairs first, then
    /// real roots two at a time.
    fn quadratics(roots: &[Complex64]) -> Vec<[f64; 3]> {
        let mut sections: Vec<[f64; 3]> = roots
            .iter()
            .filter(|r| r.im > REAL_TOLERANCE)
            .map(|r| [1.0, -2.0 * r.re, r.norm_sqr()])
            .collect();
        let reals: Vec<f64> = roots
            .iter()
            .filter(|r| r.im.abs() <= REAL_TOLERANCE)
            .map(|r| r.re)
            .collect();
        sections.extend(reals.chunks(2).map(|pair| match pair {
            [a, b] => [1.0, -(a + b), a * b],
            [a] => [1.0, -a, 0.0],
            _ => unreachable!(),
        }));
        sections
    }

    fn into_sections(self) -> Vec<Biquad> {
        let den = Self::quadratics(&self.poles);
        let num = Self::quadratics(&self.zeros);
        den.into_iter()
            .enumerate()
            .map(|(i, a)| {
                let mut b = num.get(i).copied().unwrap_or([1.0, 0.0, 0.0]);
                if i == 0 {
                    b.iter_mut().for_each(|c| *c *= self.gain);
                }
                Biquad { b, a }
            })
            .collect()
    }
}

/// Second-order section in transposed direct form II, `a[0] == 1`.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 3],
}

impl Biquad {
    fn process(&self, data: &mut [f64]) {
        let (mut s1, mut s2) = (0.0, 0.0);
        for x in data.iter_mut() {
            let input = *x;
            let y = self.b[0] * input + s1;
            s1 = self.b[1] * input - self.a[1] * y + s2;
            s2 = self.b[2] * input - self.a[2] * y;
            *x = y;
        }
    }
}

fn run(sections: &[Biquad], data: &mut [f64], filter_type: FilterType) {
    sections.iter().for_each(|s| s.process(data));
    if filter_type == FilterType::ButterworthZeroPhase {
        data.reverse();
        sections.iter().for_each(|s| s.process(data));
        data.reverse();
    }
}

fn prewarp(freq: f64, fs: f64) -> f64 {
    2.0 * fs * (PI * freq / fs).tan()
}

fn check_args(data: &[f64], fs: f64, freqs: &[f64], order: usize) -> Result<()> {
    if data.is_empty() {
        return Err(Error::invalid("no samples to filter"));
    }
    if !(fs.is_finite() && fs > 0.0) {
        return Err(Error::invalid(format!("invalid sampling rate {fs}")));
    }
    if order == 0 || order > MAX_FILTER_ORDER {
        return Err(Error::invalid(format!(
            "filter order must be between 1 and {MAX_FILTER_ORDER}, got {order}"
        )));
    }
    if let Some(f) = freqs.iter().find(|f| !(**f > 0.0 && **f < fs / 2.0)) {
        return Err(Error::invalid(format!(
            "frequency {f} must be between 0 and {}",
            fs / 2.0
        )));
    }
    if freqs.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::invalid("start frequency must be below stop frequency"));
    }
    Ok(())
}

pub fn perform_lowpass(
    data: &mut [f64],
    sampling_rate: f64,
    cutoff: f64,
    order: usize,
    filter_type: FilterType,
) -> Result<()> {
    check_args(data, sampling_rate, &[cutoff], order)?;
    let sections = Zpk::prototype(order)
        .to_lowpass(prewarp(cutoff, sampling_rate))
        .bilinear(sampling_rate)
        .into_sections();
    run(&sections, data, filter_type);
    Ok(())
}

pub fn perform_highpass(
    data: &mut [f64],
    sampling_rate: f64,
    cutoff: f64,
    order: usize,
    filter_type: FilterType,
) -> Result<()> {
    check_args(data, sampling_rate, &[cutoff], order)?;
    let sections = Zpk::prototype(order)
        .to_highpass(prewarp(cutoff, sampling_rate))
        .bilinear(sampling_rate)
        .into_sections();
    run(&sections, data, filter_type);
    Ok(())
}

/// Keeps `start_freq..stop_freq`. The resulting filter has `2 * order` poles.
pub fn perform_bandpass(
    data: &mut [f64],
    sampling_rate: f64,
    start_freq: f64,
    stop_freq: f64,
    order: usize,
    filter_type: FilterType,
) -> Result<()> {
    check_args(data, sampling_rate, &[start_freq, stop_freq], order)?;
    let (w1, w2) = (
        prewarp(start_freq, sampling_rate),
        prewarp(stop_freq, sampling_rate),
    );
    let sections = Zpk::prototype(order)
        .to_bandpass((w1 * w2).sqrt(), w2 - w1)
        .bilinear(sampling_rate)
        .into_sections();
    run(&sections, data, filter_type);
    Ok(())
}

/// Removes `start_freq..stop_freq`, e.g. mains interference.
pub fn perform_bandstop(
    data: &mut [f64],
    sampling_rate: f64,
    start_freq: f64,
    stop_freq: f64,
    order: usize,
    filter_type: FilterType,
) -> Result<()> {
    check_args(data, sampling_rate, &[start_freq, stop_freq], order)?;
    let (w1, w2) = (
        prewarp(start_freq, sampling_rate),
        prewarp(stop_freq, sampling_rate),
    );
    let sections = Zpk::prototype(order)
        .to_bandstop((w1 * w2).sqrt(), w2 - w1)
        .bilinear(sampling_rate)
        .into_sections();
    run(&sections, data, filter_type);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 250.0;

    fn sine(freq: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f64 / FS).sin())
            .collect()
    }

    /// Peak amplitude over the second half, after the transient settled.
    fn settled_amplitude(data: &[f64]) -> f64 {
        data[data.len() / 2..]
            .iter()
            .fold(0.0_f64, |acc, x| acc.max(x.abs()))
    }

    #[test]
    fn test_detrend_constant() {
        let mut data = vec![3.0, 5.0, 7.0, 9.0];
        detrend(&mut data, DetrendOperation::Constant);
        assert_eq!(data, vec![-3.0, -1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_detrend_linear() {
        let mut data: Vec<f64> = (0..50).map(|i| 2.0 * i as f64 + 10.0).collect();
        detrend(&mut data, DetrendOperation::Linear);
        assert!(data.iter().all(|x| x.abs() < 1e-9));
    }

    #[test]
    fn test_nearest_power_of_two() {
        assert_eq!(get_nearest_power_of_two(250), 256);
        assert_eq!(get_nearest_power_of_two(100), 128);
        assert_eq!(get_nearest_power_of_two(90), 64);
        assert_eq!(get_nearest_power_of_two(96), 128);
        assert_eq!(get_nearest_power_of_two(1), 1);
    }

    #[test]
    fn test_windows_are_symmetric() {
        for window in [
            WindowOperation::Hanning,
            WindowOperation::Hamming,
            WindowOperation::BlackmanHarris,
        ] {
            let w = get_window(window, 65);
            assert!((w[32] - 1.0).abs() < 1e-3, "{window:?} peak {}", w[32]);
            assert!((w[10] - w[54]).abs() < 1e-12);
        }
        assert_eq!(get_window(WindowOperation::None, 4), vec![1.0; 4]);
    }

    #[test]
    fn test_window_data_tapers_edges() {
        let mut data = vec![2.0; 5];
        window_data(&mut data, WindowOperation::Hanning);
        assert!(data[0].abs() < 1e-12 && data[4].abs() < 1e-12);
        assert!((data[1] - 1.0).abs() < 1e-12);
        assert!((data[2] - 2.0).abs() < 1e-12);

        let mut untouched = vec![3.0, -1.0];
        window_data(&mut untouched, WindowOperation::None);
        assert_eq!(untouched, vec![3.0, -1.0]);
    }

    #[test]
    fn test_bandpass_keeps_band() {
        let mut inside = sine(10.0, 2000);
        perform_bandpass(&mut inside, FS, 3.0, 45.0, 2, FilterType::Butterworth).unwrap();
        let gain = settled_amplitude(&inside);
        assert!((0.9..1.05).contains(&gain), "in-band gain {gain}");

        let mut above = sine(100.0, 2000);
        perform_bandpass(&mut above, FS, 3.0, 45.0, 2, FilterType::Butterworth).unwrap();
        assert!(settled_amplitude(&above) < 0.1);

        let mut below = sine(0.5, 4000);
        perform_bandpass(&mut below, FS, 3.0, 45.0, 2, FilterType::Butterworth).unwrap();
        assert!(settled_amplitude(&below) < 0.1);
    }

    #[test]
    fn test_bandstop_removes_mains() {
        let mut mains = sine(50.0, 5000);
        perform_bandstop(&mut mains, FS, 48.0, 52.0, 4, FilterType::Butterworth).unwrap();
        assert!(settled_amplitude(&mains) < 0.05);

        let mut alpha = sine(10.0, 5000);
        perform_bandstop(&mut alpha, FS, 48.0, 52.0, 4, FilterType::Butterworth).unwrap();
        assert!((settled_amplitude(&alpha) - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_lowpass_and_highpass() {
        let mut slow = sine(5.0, 2000);
        perform_highpass(&mut slow, FS, 30.0, 4, FilterType::Butterworth).unwrap();
        assert!(settled_amplitude(&slow) < 0.01);

        let mut fast = sine(80.0, 2000);
        perform_lowpass(&mut fast, FS, 30.0, 4, FilterType::Butterworth).unwrap();
        assert!(settled_amplitude(&fast) < 0.05);
    }

    #[test]
    fn test_zero_phase_has_no_lag() {
        let original = sine(5.0, 2000);
        let mut filtered = original.clone();
        perform_lowpass(&mut filtered, FS, 30.0, 4, FilterType::ButterworthZeroPhase).unwrap();
        let max_diff = original[500..1500]
            .iter()
            .zip(&filtered[500..1500])
            .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs()));
        assert!(max_diff < 0.02, "max deviation {max_diff}");
    }

    #[test]
    fn test_invalid_arguments() {
        let mut data = sine(10.0, 100);
        let invalid = |r: Result<()>| matches!(r, Err(Error::InvalidArguments(_)));
        assert!(invalid(perform_bandpass(&mut data, FS, 45.0, 3.0, 2, FilterType::Butterworth)));
        assert!(invalid(perform_bandpass(&mut data, FS, 3.0, 130.0, 2, FilterType::Butterworth)));
        assert!(invalid(perform_lowpass(&mut data, FS, 30.0, 0, FilterType::Butterworth)));
        assert!(invalid(perform_lowpass(&mut data, FS, 30.0, 9, FilterType::Butterworth)));
        assert!(invalid(perform_highpass(&mut [], FS, 30.0, 2, FilterType::Butterworth)));
    }
}
