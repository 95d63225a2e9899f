//! Frequency-domain summaries of EEG channels: Welch power spectral density,
//! band power and the power of the classic EEG bands averaged across
//! channels, either relative to the total or absolute for the live readout.

use rustfft::{FftPlanner, num_complex::Complex64};

use crate::error::{Error, Result};
use crate::filter::{
    DetrendOperation, FilterType, WindowOperation, detrend, get_nearest_power_of_two,
    get_window, perform_bandpass, perform_bandstop,
};

/// Delta, theta, alpha, beta and gamma limits in Hz.
pub const EEG_BANDS: [(f64, f64); 5] = [
    (2.0, 4.0),
    (4.0, 8.0),
    (8.0, 13.0),
    (13.0, 30.0),
    (30.0, 50.0),
];

/// One-sided power spectral density.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Psd {
    /// Power density per bin (uV^2/Hz)
    pub amplitudes: Vec<f64>,
    /// Bin frequencies (Hz)
    pub frequencies: Vec<f64>,
}

impl Psd {
    /// Integrates the density between `start_freq` and `stop_freq` with the
    /// trapezoidal rule over the bins inside the range.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` if the range is empty or holds fewer than two bins.
    pub fn band_power(&self, start_freq: f64, stop_freq: f64) -> Result<f64> {
        if start_freq >= stop_freq {
            return Err(Error::invalid("start frequency must be below stop frequency"));
        }
        let bins: Vec<(f64, f64)> = self
            .frequencies
            .iter()
            .zip(&self.amplitudes)
            .filter(|(f, _)| (start_freq..=stop_freq).contains(*f))
            .map(|(f, a)| (*f, *a))
            .collect();
        if bins.len() < 2 {
            return Err(Error::invalid(format!(
                "band {start_freq}-{stop_freq} Hz covers fewer than two bins"
            )));
        }
        Ok(bins
            .windows(2)
            .map(|w| 0.5 * (w[0].1 + w[1].1) * (w[1].0 - w[0].0))
            .sum())
    }

    /// Frequency of the strongest bin.
    pub fn peak_frequency(&self) -> Option<f64> {
        self.amplitudes
            .iter()
            .zip(&self.frequencies)
            .max_by(|a, b| a.0.total_cmp(b.0))
            .map(|(_, f)| *f)
    }
}

/// Average and spread of relative band powers across channels, in
/// [`EEG_BANDS`] order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandPowers {
    pub avg: [f64; 5],
    pub stddev: [f64; 5],
}

/// Periodogram of a single windowed segment, `data.len()` bins wide.
pub fn get_psd(data: &[f64], sampling_rate: f64, window: WindowOperation) -> Result<Psd> {
    get_psd_welch(data, data.len(), 0, sampling_rate, window)
}

/// Welch estimate: `nfft`-long windowed segments advancing by
/// `nfft - overlap` samples, averaged.
///
/// # Errors
///
/// `InvalidArguments` if `nfft` is odd, zero or longer than `data`, if
/// `overlap >= nfft` or if the sampling rate is not positive.
pub fn get_psd_welch(
    data: &[f64],
    nfft: usize,
    overlap: usize,
    sampling_rate: f64,
    window: WindowOperation,
) -> Result<Psd> {
    if nfft == 0 || nfft % 2 != 0 {
        return Err(Error::invalid(format!("nfft must be even and positive, got {nfft}")));
    }
    if nfft > data.len() {
        return Err(Error::invalid(format!(
            "nfft {nfft} is longer than the {} samples available",
            data.len()
        )));
    }
    if overlap >= nfft {
        return Err(Error::invalid("overlap must be smaller than nfft"));
    }
    if !(sampling_rate.is_finite() && sampling_rate > 0.0) {
        return Err(Error::invalid(format!("invalid sampling rate {sampling_rate}")));
    }

    let coefficients = get_window(window, nfft);
    let scale = 1.0 / (sampling_rate * coefficients.iter().map(|w| w * w).sum::<f64>());
    let fft = FftPlanner::new().plan_fft_forward(nfft);
    let bins = nfft / 2 + 1;
    let step = nfft - overlap;

    let mut amplitudes = vec![0.0; bins];
    let mut segments = 0;
    let mut buffer = vec![Complex64::default(); nfft];
    for start in (0..=data.len() - nfft).step_by(step) {
        buffer
            .iter_mut()
            .zip(&data[start..start + nfft])
            .zip(&coefficients)
            .for_each(|((c, x), w)| *c = Complex64::new(x * w, 0.0));
        fft.process(&mut buffer);
        amplitudes
            .iter_mut()
            .zip(&buffer)
            .enumerate()
            .for_each(|(k, (a, c))| {
                let one_sided = if k == 0 || k == nfft / 2 { 1.0 } else { 2.0 };
                *a += one_sided * c.norm_sqr() * scale;
            });
        segments += 1;
    }
    amplitudes.iter_mut().for_each(|a| *a /= segments as f64);

    let frequencies = (0..bins)
        .map(|k| k as f64 * sampling_rate / nfft as f64)
        .collect();
    Ok(Psd {
        amplitudes,
        frequencies,
    })
}

fn select_row(data: &[Vec<f64>], ch: usize) -> Result<Vec<f64>> {
    data.get(ch)
        .cloned()
        .ok_or_else(|| Error::invalid(format!("channel {ch} is out of range")))
}

/// Absolute power of every band in [`EEG_BANDS`] from a Welch estimate with
/// `nfft / 2` overlap and a Blackman-Harris window.
fn band_powers(row: &[f64], sampling_rate: f64, nfft: usize) -> Result<[f64; 5]> {
    let psd = get_psd_welch(row, nfft, nfft / 2, sampling_rate, WindowOperation::BlackmanHarris)?;
    let mut bands = [0.0; 5];
    for (power, (start, stop)) in bands.iter_mut().zip(EEG_BANDS) {
        *power = psd.band_power(start, stop)?;
    }
    Ok(bands)
}

/// Relative powers of [`EEG_BANDS`] for the given rows of a board table,
/// averaged across rows.
///
/// With `apply_filters` every row is detrended, band-passed to 2-45 Hz and
/// notched at 48-52 Hz and 58-62 Hz first.
///
/// # Errors
///
/// `InvalidArguments` if no channel is given, a channel index is out of
/// range or a row is shorter than the PSD segment.
pub fn get_avg_band_powers(
    data: &[Vec<f64>],
    channels: &[usize],
    sampling_rate: usize,
    apply_filters: bool,
) -> Result<BandPowers> {
    if channels.is_empty() {
        return Err(Error::invalid("no channels selected"));
    }
    let fs = sampling_rate as f64;
    let nfft = get_nearest_power_of_two(sampling_rate);

    let mut relative = Vec::with_capacity(channels.len());
    for &ch in channels {
        let mut row = select_row(data, ch)?;
        if apply_filters {
            detrend(&mut row, DetrendOperation::Constant);
            perform_bandpass(&mut row, fs, 2.0, 45.0, 4, FilterType::Butterworth)?;
            perform_bandstop(&mut row, fs, 48.0, 52.0, 4, FilterType::Butterworth)?;
            perform_bandstop(&mut row, fs, 58.0, 62.0, 4, FilterType::Butterworth)?;
        }
        let mut bands = band_powers(&row, fs, nfft)?;
        let total: f64 = bands.iter().sum();
        if total > 0.0 {
            bands.iter_mut().for_each(|b| *b /= total);
        }
        relative.push(bands);
    }

    let n = relative.len() as f64;
    let mut powers = BandPowers::default();
    for band in 0..EEG_BANDS.len() {
        let mean = relative.iter().map(|r| r[band]).sum::<f64>() / n;
        let var = relative.iter().map(|r| (r[band] - mean).powi(2)).sum::<f64>() / n;
        powers.avg[band] = mean;
        powers.stddev[band] = var.sqrt();
    }
    Ok(powers)
}

/// Absolute powers of [`EEG_BANDS`] in uV^2, summed over the given rows,
/// times 100 and divided by the number of rows. This is the scale of the
/// live band power readout.
///
/// Every row is detrended, band-passed to 3-45 Hz and notched at 48-52 Hz
/// and 58-62 Hz with second-order Butterworth filters first.
///
/// # Errors
///
/// `InvalidArguments` if no channel is given, a channel index is out of
/// range or a row is shorter than the PSD segment.
pub fn get_live_band_powers(
    data: &[Vec<f64>],
    channels: &[usize],
    sampling_rate: usize,
) -> Result<[f64; 5]> {
    if channels.is_empty() {
        return Err(Error::invalid("no channels selected"));
    }
    let fs = sampling_rate as f64;
    let nfft = get_nearest_power_of_two(sampling_rate);

    let mut sums = [0.0; 5];
    for &ch in channels {
        let mut row = select_row(data, ch)?;
        detrend(&mut row, DetrendOperation::Constant);
        perform_bandpass(&mut row, fs, 3.0, 45.0, 2, FilterType::Butterworth)?;
        perform_bandstop(&mut row, fs, 48.0, 52.0, 2, FilterType::Butterworth)?;
        perform_bandstop(&mut row, fs, 58.0, 62.0, 2, FilterType::Butterworth)?;
        for (sum, power) in sums.iter_mut().zip(band_powers(&row, fs, nfft)?) {
            *sum += power;
        }
    }
    Ok(sums.map(|sum| sum * 100.0 / channels.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const FS: f64 = 250.0;

    fn tone(freq: f64, amplitude: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / FS).sin())
            .collect()
    }

    #[test]
    fn test_welch_peak_at_tone() {
        let data = tone(10.0, 1.0, 2500);
        let psd = get_psd_welch(&data, 256, 128, FS, WindowOperation::BlackmanHarris).unwrap();
        assert_eq!(psd.amplitudes.len(), 129);
        assert_eq!(psd.frequencies[128], 125.0);
        let peak = psd.peak_frequency().unwrap();
        assert!((peak - 10.0).abs() < FS / 256.0, "peak at {peak}");
    }

    #[test]
    fn test_total_power_matches_variance() {
        let data = tone(20.0, 2.0, 4096);
        let psd = get_psd_welch(&data, 512, 256, FS, WindowOperation::Hanning).unwrap();
        let power = psd.band_power(0.0, FS / 2.0).unwrap();
        assert!((power - 2.0).abs() < 0.2, "total power {power}");
    }

    #[test]
    fn test_welch_argument_checks() {
        let data = tone(10.0, 1.0, 100);
        let invalid = |r: Result<Psd>| matches!(r, Err(Error::InvalidArguments(_)));
        assert!(invalid(get_psd_welch(&data, 128, 64, FS, WindowOperation::None)));
        assert!(invalid(get_psd_welch(&data, 63, 10, FS, WindowOperation::None)));
        assert!(invalid(get_psd_welch(&data, 64, 64, FS, WindowOperation::None)));
        assert!(get_psd(&data, FS, WindowOperation::None).is_ok());
    }

    #[test]
    fn test_band_power_needs_two_bins() {
        let psd = Psd {
            amplitudes: vec![1.0, 1.0, 1.0],
            frequencies: vec![0.0, 1.0, 2.0],
        };
        assert_eq!(psd.band_power(0.0, 2.0).unwrap(), 2.0);
        assert!(psd.band_power(0.5, 1.5).is_err());
        assert!(psd.band_power(2.0, 1.0).is_err());
    }

    #[test]
    fn test_avg_band_powers_find_alpha() {
        let alpha = tone(10.0, 20.0, 1250);
        let beta: Vec<f64> = tone(20.0, 20.0, 1250)
            .iter()
            .zip(tone(10.0, 1.0, 1250))
            .map(|(a, b)| a + b)
            .collect();
        let data = vec![vec![0.0; 1250], alpha, beta];

        let powers = get_avg_band_powers(&data, &[1, 2], 250, true).unwrap();
        assert!((powers.avg.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(powers.avg[2] > 0.4, "alpha {:?}", powers.avg);
        assert!(powers.avg[3] > 0.4, "beta {:?}", powers.avg);
        assert!(powers.stddev[2] > 0.3);
    }

    #[test]
    fn test_live_band_powers_follow_amplitude() {
        let small = vec![tone(10.0, 2.0, 2000), tone(10.0, 2.0, 2000)];
        let large = vec![tone(10.0, 200.0, 2000), tone(10.0, 200.0, 2000)];

        let small_powers = get_live_band_powers(&small, &[0, 1], 250).unwrap();
        let large_powers = get_live_band_powers(&large, &[0, 1], 250).unwrap();
        let ratio = large_powers[2] / small_powers[2];
        assert!((ratio - 1e4).abs() < 1.0, "alpha ratio {ratio}");

        // A 200 uV tone carries 20000 uV^2, mostly inside the alpha band
        let alpha = large_powers[2] / 100.0;
        assert!((10_000.0..21_000.0).contains(&alpha), "alpha power {alpha}");
        assert!(large_powers.iter().enumerate().all(|(i, p)| i == 2 || *p < large_powers[2]));

        // Relative powers cannot tell the two apart
        let relative_small = get_avg_band_powers(&small, &[0, 1], 250, true).unwrap();
        let relative_large = get_avg_band_powers(&large, &[0, 1], 250, true).unwrap();
        assert!((relative_small.avg[2] - relative_large.avg[2]).abs() < 1e-9);
    }

    #[test]
    fn test_live_band_powers_check_channels() {
        let data = vec![tone(10.0, 1.0, 500)];
        assert!(get_live_band_powers(&data, &[], 250).is_err());
        assert!(get_live_band_powers(&data, &[1], 250).is_err());
    }

    #[test]
    fn test_avg_band_powers_checks_channels() {
        let data = vec![tone(10.0, 1.0, 500)];
        assert!(get_avg_band_powers(&data, &[], 250, false).is_err());
        assert!(get_avg_band_powers(&data, &[3], 250, false).is_err());
        assert!(get_avg_band_powers(&[tone(10.0, 1.0, 100)], &[0], 250, false).is_err());
    }
}
