//! Fixed-length recordings that end in an EDF file.
//!
//! A [`Measurement`] sizes its buffer from the recording duration and the
//! sampling rate, fills it until the sample counter reaches the target and
//! then writes the channels out with [`crate::edf`]. It is filled either
//! packet by packet from a [`DataReader`], or in one go from the buffer of a
//! streaming [`Session`].
//!
//! # Example
//!
//! ```rust,no_run
//! use geenie::{comm::DataReader, device::DeviceConfig, edf::RecordingHeader};
//! use geenie::measurement::{Measurement, MeasurementConfig, Preprocessing};
//!
//! #[tokio::main]
//! async fn main() -> geenie::Result<()> {
//!     let stream = DeviceConfig::default().with_serial_port("COM6").open().await?;
//!     let mut reader = DataReader::new(stream);
//!     let mut measurement = Measurement::new(MeasurementConfig {
//!         header: RecordingHeader::default().with_patient_name("Patient1"),
//!         recording_minutes: 1,
//!         preprocessing: Preprocessing::eeg(),
//!         ..Default::default()
//!     })?;
//!     measurement.record(&mut reader).await?;
//!     measurement.save_file()?;
//!     Ok(())
//! }
//! ```

use std::future::{Future, pending};
use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::io::AsyncRead;

use crate::board::{SAMPLING_RATE, Session};
use crate::comm::{DataReader, EEG_CHANNELS, Packet};
use crate::edf::{
    DEFAULT_PHYSICAL_MAX, DEFAULT_PHYSICAL_MIN, RecordingHeader, SignalHeader,
    make_signal_headers, write_edf,
};
use crate::error::{Error, Result};
use crate::filter::{DetrendOperation, FilterType, detrend, perform_bandpass, perform_bandstop};

/// Filtering applied to every channel right before export.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Preprocessing {
    pub detrend: DetrendOperation,
    /// Pass band in Hz
    pub bandpass: Option<(f64, f64)>,
    /// Stop band in Hz
    pub bandstop: Option<(f64, f64)>,
    pub order: usize,
    pub filter_type: FilterType,
}

impl Preprocessing {
    /// Raw samples are exported untouched.
    pub fn none() -> Self {
        Self::default()
    }

    /// Mean removal, 3-45 Hz band-pass and a 48-52 Hz mains notch, second
    /// order Butterworth.
    pub fn eeg() -> Self {
        Self {
            detrend: DetrendOperation::Constant,
            bandpass: Some((3.0, 45.0)),
            bandstop: Some((48.0, 52.0)),
            order: 2,
            filter_type: FilterType::Butterworth,
        }
    }

    pub fn apply(&self, data: &mut [f64], sampling_rate: f64) -> Result<()> {
        detrend(data, self.detrend);
        if let Some((start, stop)) = self.bandpass {
            perform_bandpass(data, sampling_rate, start, stop, self.order, self.filter_type)?;
        }
        if let Some((start, stop)) = self.bandstop {
            perform_bandstop(data, sampling_rate, start, stop, self.order, self.filter_type)?;
        }
        Ok(())
    }
}

/// Parameters of a new measurement.
#[derive(Debug, Clone)]
pub struct MeasurementConfig {
    pub header: RecordingHeader,
    pub recording_minutes: u32,
    pub sampling_rate: usize,
    pub number_of_channels: usize,
    /// Defaults to `ch1..chN`
    pub channel_names: Option<Vec<String>>,
    /// Defaults to the start date, `%d_%m_%Y__%H_%M_%S.edf`
    pub edf_filename: Option<PathBuf>,
    pub physical_min: f64,
    pub physical_max: f64,
    pub preprocessing: Preprocessing,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            header: RecordingHeader::default(),
            recording_minutes: 1,
            sampling_rate: SAMPLING_RATE,
            number_of_channels: EEG_CHANNELS,
            channel_names: None,
            edf_filename: None,
            physical_min: DEFAULT_PHYSICAL_MIN,
            physical_max: DEFAULT_PHYSICAL_MAX,
            preprocessing: Preprocessing::none(),
        }
    }
}

/// A recording in progress.
#[derive(Debug)]
pub struct Measurement {
    header: RecordingHeader,
    sampling_rate: usize,
    edf_filename: PathBuf,
    signal_headers: Vec<SignalHeader>,
    preprocessing: Preprocessing,
    points_length: usize,
    counter: usize,
    data: Vec<Vec<f64>>,
}

impl Measurement {
    /// Allocates the sample buffer and logs a summary of the measurement.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` for zero duration or rate, more channels than the
    /// board has, or a channel name count that differs from the channel
    /// count.
    pub fn new(config: MeasurementConfig) -> Result<Self> {
        let MeasurementConfig {
            header,
            recording_minutes,
            sampling_rate,
            number_of_channels,
            channel_names,
            edf_filename,
            physical_min,
            physical_max,
            preprocessing,
        } = config;
        if recording_minutes == 0 || sampling_rate == 0 {
            return Err(Error::invalid("recording duration and sampling rate must be positive"));
        }
        if number_of_channels == 0 || number_of_channels > EEG_CHANNELS {
            return Err(Error::invalid(format!(
                "number of channels must be between 1 and {EEG_CHANNELS}, got {number_of_channels}"
            )));
        }
        let channel_names = channel_names
            .unwrap_or_else(|| (1..=number_of_channels).map(|n| format!("ch{n}")).collect());
        if channel_names.len() != number_of_channels {
            return Err(Error::invalid(format!(
                "{} channel names for {number_of_channels} channels",
                channel_names.len()
            )));
        }
        let edf_filename = edf_filename.unwrap_or_else(|| {
            PathBuf::from(header.startdate.format("%d_%m_%Y__%H_%M_%S.edf").to_string())
        });
        let points_length = sampling_rate * 60 * recording_minutes as usize;

        info!("New measurement starting:");
        info!("\tPatient Name: {}", header.patient_name);
        if let Some(birthdate) = header.birthdate {
            info!("\tBirth Date: {birthdate}");
        }
        info!("\tDevice: {}", header.equipment);
        info!("\tNumber of Channels: {number_of_channels}");
        info!("\tSampling Rate: {sampling_rate}");
        info!("\tStart Date: {}", header.startdate);
        info!("\tTechnician: {}", header.technician);
        info!("\tDuration: {recording_minutes} minutes");
        info!("\tFile name: {}", edf_filename.display());

        Ok(Self {
            signal_headers: make_signal_headers(
                channel_names.as_slice(),
                sampling_rate,
                physical_min,
                physical_max,
            ),
            header,
            sampling_rate,
            edf_filename,
            preprocessing,
            points_length,
            counter: 0,
            data: vec![vec![0.0; points_length]; number_of_channels],
        })
    }

    /// Number of samples per channel the measurement waits for.
    pub fn points_length(&self) -> usize {
        self.points_length
    }

    /// Number of samples stored so far.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn is_complete(&self) -> bool {
        self.counter >= self.points_length
    }

    pub fn edf_filename(&self) -> &Path {
        &self.edf_filename
    }

    /// Channel rows, zero past [`Self::counter`].
    pub fn data(&self) -> &[Vec<f64>] {
        &self.data
    }

    /// Stores one packet. Returns `false` once the measurement is complete;
    /// packets arriving after that are ignored.
    pub fn push(&mut self, packet: &Packet) -> bool {
        if self.is_complete() {
            return false;
        }
        for (row, value) in self.data.iter_mut().zip(packet.eeg) {
            row[self.counter] = value;
        }
        self.counter += 1;
        !self.is_complete()
    }

    /// Reads packets until the measurement is complete.
    ///
    /// # Errors
    ///
    /// `Io` if the stream fails first; samples stored so far are kept.
    pub async fn record<R: AsyncRead + Unpin>(&mut self, reader: &mut DataReader<R>) -> Result<()> {
        self.record_until(reader, pending()).await
    }

    /// Reads packets until the measurement is complete or `shutdown`
    /// resolves, whichever comes first.
    ///
    /// # Errors
    ///
    /// `Io` if the stream fails first; samples stored so far are kept.
    pub async fn record_until<R, F>(&mut self, reader: &mut DataReader<R>, shutdown: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        info!("Measurement ongoing...");
        tokio::pin!(shutdown);
        while !self.is_complete() {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!("Measurement interrupted after {} of {} samples", self.counter, self.points_length);
                    break;
                }
                packet = reader.poll_next() => {
                    self.push(&packet?);
                }
            }
        }
        Ok(())
    }

    /// Replaces the recorded samples with the latest `points_length` columns
    /// of a board table. Measurement channel `n` is taken from row
    /// `eeg_channels[n]`.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` if there are fewer EEG rows than measurement
    /// channels or a row index is out of range. Nothing is replaced then.
    pub fn load_board_data(&mut self, table: &[Vec<f64>], eeg_channels: &[usize]) -> Result<()> {
        if eeg_channels.len() < self.data.len() {
            return Err(Error::invalid(format!(
                "{} EEG rows for {} channels",
                eeg_channels.len(),
                self.data.len()
            )));
        }
        let rows = eeg_channels[..self.data.len()]
            .iter()
            .map(|&ch| {
                table
                    .get(ch)
                    .ok_or_else(|| Error::invalid(format!("board row {ch} is out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        let available = rows.iter().map(|row| row.len()).min().unwrap_or(0);
        let length = available.min(self.points_length);

        for (target, source) in self.data.iter_mut().zip(rows) {
            target[..length].copy_from_slice(&source[source.len() - length..]);
            target[length..].fill(0.0);
        }
        self.counter = length;
        Ok(())
    }

    /// Takes the latest `points_length` samples buffered by `session`
    /// without draining its buffer.
    ///
    /// # Errors
    ///
    /// See [`Self::load_board_data`].
    pub fn capture_session(&mut self, session: &Session) -> Result<()> {
        let table = session.get_current_board_data(self.points_length);
        self.load_board_data(&table, &session.description().eeg_channels())?;
        info!("Captured {} samples from the session", self.counter);
        Ok(())
    }

    /// Preprocesses the complete seconds recorded so far and writes them to
    /// the EDF file. Returns the path written.
    ///
    /// # Errors
    ///
    /// `EmptyBuffer` if not a single second was recorded, otherwise the
    /// errors of preprocessing and [`write_edf`].
    pub fn save_file(&self) -> Result<PathBuf> {
        let length = self.counter - self.counter % self.sampling_rate;
        if length == 0 {
            return Err(Error::EmptyBuffer(format!(
                "{} samples recorded, less than one second",
                self.counter
            )));
        }
        if length < self.counter {
            warn!("Dropping {} samples of an incomplete second", self.counter - length);
        }
        let mut signals: Vec<Vec<f64>> = self.data.iter().map(|row| row[..length].to_vec()).collect();
        for row in signals.iter_mut() {
            self.preprocessing.apply(row, self.sampling_rate as f64)?;
        }
        write_edf(&self.edf_filename, &signals, &self.signal_headers, &self.header)?;
        info!("File saved to {}", self.edf_filename.display());
        Ok(self.edf_filename.clone())
    }
}
