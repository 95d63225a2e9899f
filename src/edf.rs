//! EDF export of recorded channels.
//!
//! Files are written as EDF+ with one-second data records through the
//! `edfplus` writer. The writer stores patient identification and
//! annotations; technician, equipment and the free-text fields of
//! [`RecordingHeader`] travel with the measurement summary.

use std::path::Path;

use chrono::{Local, NaiveDate, NaiveDateTime};
use edfplus::{EdfWriter, SignalParam};
use log::debug;

use crate::error::{Error, Result};

/// Physical range used for EEG channels unless told otherwise (uV).
pub const DEFAULT_PHYSICAL_MAX: f64 = 300_000.0;
pub const DEFAULT_PHYSICAL_MIN: f64 = -300_000.0;

fn edf_error(e: impl std::fmt::Display) -> Error {
    Error::Edf(e.to_string())
}

/// Description of one stored signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHeader {
    pub label: String,
    /// Samples per second, equal to the samples of one data record
    pub sample_frequency: usize,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
    pub dimension: String,
    pub prefilter: String,
    pub transducer: String,
}

impl SignalHeader {
    pub fn new(label: impl Into<String>, sample_frequency: usize) -> Self {
        Self {
            label: label.into(),
            sample_frequency,
            physical_min: DEFAULT_PHYSICAL_MIN,
            physical_max: DEFAULT_PHYSICAL_MAX,
            digital_min: -32768,
            digital_max: 32767,
            dimension: "uV".to_string(),
            prefilter: String::new(),
            transducer: String::new(),
        }
    }

    fn to_param(&self) -> SignalParam {
        SignalParam {
            label: self.label.clone(),
            samples_in_file: 0,
            physical_max: self.physical_max,
            physical_min: self.physical_min,
            digital_max: self.digital_max as _,
            digital_min: self.digital_min as _,
            samples_per_record: self.sample_frequency as _,
            physical_dimension: self.dimension.clone(),
            prefilter: self.prefilter.clone(),
            transducer: self.transducer.clone(),
        }
    }
}

/// One signal header per label, all sharing frequency and physical range.
pub fn make_signal_headers<S: AsRef<str>>(
    labels: &[S],
    sample_frequency: usize,
    physical_min: f64,
    physical_max: f64,
) -> Vec<SignalHeader> {
    labels
        .iter()
        .map(|label| SignalHeader {
            physical_min,
            physical_max,
            ..SignalHeader::new(label.as_ref(), sample_frequency)
        })
        .collect()
}

/// Timed event stored alongside the signals.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Seconds since the start of the recording
    pub onset: f64,
    pub duration: Option<f64>,
    pub text: String,
}

/// Patient and recording identification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingHeader {
    pub patient_name: String,
    pub patient_code: String,
    pub sex: String,
    pub birthdate: Option<NaiveDate>,
    pub patient_additional: String,
    pub technician: String,
    pub equipment: String,
    pub recording_additional: String,
    pub startdate: NaiveDateTime,
    pub annotations: Vec<Annotation>,
}

impl Default for RecordingHeader {
    fn default() -> Self {
        Self {
            patient_name: String::new(),
            patient_code: String::new(),
            sex: String::new(),
            birthdate: None,
            patient_additional: String::new(),
            technician: String::new(),
            equipment: "Geenie".to_string(),
            recording_additional: String::new(),
            startdate: Local::now().naive_local(),
            annotations: Vec::new(),
        }
    }
}

impl RecordingHeader {
    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self
    }

    pub fn with_patient_code(mut self, code: impl Into<String>) -> Self {
        self.patient_code = code.into();
        self
    }

    /// `M`, `F` or empty when unknown.
    pub fn with_sex(mut self, sex: impl Into<String>) -> Self {
        self.sex = sex.into();
        self
    }

    pub fn with_birthdate(mut self, birthdate: NaiveDate) -> Self {
        self.birthdate = Some(birthdate);
        self
    }

    pub fn with_technician(mut self, technician: impl Into<String>) -> Self {
        self.technician = technician.into();
        self
    }

    pub fn with_equipment(mut self, equipment: impl Into<String>) -> Self {
        self.equipment = equipment.into();
        self
    }

    pub fn with_startdate(mut self, startdate: NaiveDateTime) -> Self {
        self.startdate = startdate;
        self
    }

    pub fn with_annotation(mut self, onset: f64, duration: Option<f64>, text: impl Into<String>) -> Self {
        self.annotations.push(Annotation {
            onset,
            duration,
            text: text.into(),
        });
        self
    }

    /// EDF+ subfields are space separated, so spaces become underscores and
    /// unknown values become `X`.
    fn subfield(value: &str) -> String {
        match value.trim() {
            "" => "X".to_string(),
            v => v.replace(' ', "_"),
        }
    }

    fn birthdate_field(&self) -> String {
        self.birthdate
            .map(|d| d.format("%d-%b-%Y").to_string().to_uppercase())
            .unwrap_or_else(|| "X".to_string())
    }
}

/// Writes `signals` (one row per signal header) to `path`.
///
/// Every row must hold the same whole number of seconds of samples at its
/// header's frequency.
///
/// # Errors
///
/// `InvalidArguments` when the shapes disagree, `Edf` when the writer fails.
pub fn write_edf(
    path: impl AsRef<Path>,
    signals: &[Vec<f64>],
    signal_headers: &[SignalHeader],
    header: &RecordingHeader,
) -> Result<()> {
    let path = path.as_ref();
    let records = check_shapes(signals, signal_headers)?;
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::invalid(format!("path {} is not valid UTF-8", path.display())))?;

    let mut writer = EdfWriter::create(path_str).map_err(edf_error)?;
    writer
        .set_patient_info(
            &RecordingHeader::subfield(&header.patient_code),
            &RecordingHeader::subfield(&header.sex),
            &header.birthdate_field(),
            &RecordingHeader::subfield(&header.patient_name),
        )
        .map_err(edf_error)?;
    writer.set_datarecord_duration(1.0).map_err(edf_error)?;
    for signal in signal_headers {
        writer.add_signal(signal.to_param()).map_err(edf_error)?;
    }
    for annotation in &header.annotations {
        writer
            .add_annotation(annotation.onset, annotation.duration, &annotation.text)
            .map_err(edf_error)?;
    }

    for record in 0..records {
        let chunk: Vec<Vec<f64>> = signals
            .iter()
            .zip(signal_headers)
            .map(|(samples, signal)| {
                let n = signal.sample_frequency;
                samples[record * n..(record + 1) * n].to_vec()
            })
            .collect();
        writer.write_samples(&chunk).map_err(edf_error)?;
    }
    writer.finalize().map_err(edf_error)?;

    debug!(
        "Wrote {records} records of {} signals to {} (equipment {}, technician {})",
        signals.len(),
        path.display(),
        header.equipment,
        header.technician
    );
    Ok(())
}

/// Number of one-second records the signals fill.
fn check_shapes(signals: &[Vec<f64>], signal_headers: &[SignalHeader]) -> Result<usize> {
    if signals.is_empty() {
        return Err(Error::invalid("no signals to write"));
    }
    if signals.len() != signal_headers.len() {
        return Err(Error::invalid(format!(
            "{} signals but {} signal headers",
            signals.len(),
            signal_headers.len()
        )));
    }
    let mut records = None;
    for (samples, signal) in signals.iter().zip(signal_headers) {
        let n = signal.sample_frequency;
        if n == 0 || samples.len() % n != 0 {
            return Err(Error::invalid(format!(
                "signal {} has {} samples, not a whole number of seconds at {n} Hz",
                signal.label,
                samples.len()
            )));
        }
        match records {
            None => records = Some(samples.len() / n),
            Some(r) if r != samples.len() / n => {
                return Err(Error::invalid("signals cover different durations"));
            }
            Some(_) => {}
        }
    }
    match records {
        Some(0) | None => Err(Error::EmptyBuffer("signals hold no complete second".to_string())),
        Some(r) => Ok(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edfplus::EdfReader;

    #[test]
    fn test_make_signal_headers() {
        let headers = make_signal_headers(&["ch1", "ch2"], 250, -300_000.0, 300_000.0);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].label, "ch2");
        assert_eq!(headers[0].sample_frequency, 250);
        assert_eq!(headers[0].dimension, "uV");
        assert_eq!(headers[0].digital_max, 32767);
    }

    #[test]
    fn test_shape_checks() {
        let headers = make_signal_headers(&["a", "b"], 10, -1.0, 1.0);
        assert!(check_shapes(&[vec![0.0; 20]], &headers).is_err());
        assert!(check_shapes(&[vec![0.0; 20], vec![0.0; 15]], &headers).is_err());
        assert!(check_shapes(&[vec![0.0; 20], vec![0.0; 30]], &headers).is_err());
        assert!(matches!(
            check_shapes(&[vec![], vec![]], &headers),
            Err(Error::EmptyBuffer(_))
        ));
        assert_eq!(check_shapes(&[vec![0.0; 20], vec![0.0; 20]], &headers).unwrap(), 2);
    }

    #[test]
    fn test_header_fields() {
        let header = RecordingHeader::default()
            .with_patient_name("Patient One")
            .with_birthdate(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap());
        assert_eq!(RecordingHeader::subfield(&header.patient_name), "Patient_One");
        assert_eq!(RecordingHeader::subfield(&header.sex), "X");
        assert_eq!(header.birthdate_field(), "01-JAN-1990");
        assert_eq!(header.equipment, "Geenie");
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.edf");
        let signals: Vec<Vec<f64>> = (0..2)
            .map(|ch| (0..500).map(|i| (i % 50) as f64 * 10.0 + ch as f64 * 1000.0).collect())
            .collect();
        let headers = make_signal_headers(&["ch1", "ch2"], 250, -300_000.0, 300_000.0);
        let header = RecordingHeader::default()
            .with_patient_name("Patient1")
            .with_annotation(0.0, None, "Recording start");

        write_edf(&path, &signals, &headers, &header).unwrap();

        let mut reader = EdfReader::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reader.header().signals.len(), 2);
        assert_eq!(reader.header().signals[0].label.trim(), "ch1");
        assert_eq!(reader.header().datarecords_in_file, 2);
        let samples = reader.read_physical_samples(1, 100).unwrap();
        // One digital step is 600000 / 65535 uV
        assert!((samples[10] - signals[1][10]).abs() < 10.0);
    }
}
