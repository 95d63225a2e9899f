//! Session lifecycle for a Geenie board: prepare, start streaming into a ring
//! buffer from a background task, poll the buffered data, stop and release.
//!
//! Buffered data is returned as a 2D table, one row per board channel and one
//! column per sample. Use [`BoardDescription`] to find which rows hold EEG
//! data, the package counter, the auxiliary bytes and the timestamps.
//!
//! # Example
//!
//! ```rust,no_run
//! use geenie::{board::Session, device::DeviceConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> geenie::Result<()> {
//!     let mut session = Session::new(DeviceConfig::default().with_serial_port("COM4"));
//!     session.prepare_session().await?;
//!     session.start_stream(450_000)?;
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     let data = session.get_board_data();
//!     session.stop_stream().await?;
//!     session.release_session().await;
//!     println!("{} rows, {} samples", data.len(), data[0].len());
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::comm::{AUX_BYTES, DataReader, EEG_CHANNELS, Packet};
use crate::device::{ByteStream, DeviceConfig};
use crate::error::{Error, Result};

/// Sampling rate of the board in Hz.
pub const SAMPLING_RATE: usize = 250;

const PACKAGE_NUM_ROW: usize = 0;
const EEG_FIRST_ROW: usize = 1;
const AUX_FIRST_ROW: usize = EEG_FIRST_ROW + EEG_CHANNELS;
const TIMESTAMP_ROW: usize = AUX_FIRST_ROW + AUX_BYTES;
const NUM_ROWS: usize = TIMESTAMP_ROW + 1;

/// One buffered sample in board row order.
type Row = [f64; NUM_ROWS];

/// Describes the row layout of the data a [`Session`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardDescription;

impl BoardDescription {
    pub fn sampling_rate(&self) -> usize {
        SAMPLING_RATE
    }

    pub fn num_rows(&self) -> usize {
        NUM_ROWS
    }

    pub fn package_num_channel(&self) -> usize {
        PACKAGE_NUM_ROW
    }

    /// Rows holding EEG samples in microvolts.
    pub fn eeg_channels(&self) -> Vec<usize> {
        (EEG_FIRST_ROW..EEG_FIRST_ROW + EEG_CHANNELS).collect()
    }

    /// Rows holding the unprocessed auxiliary bytes.
    pub fn other_channels(&self) -> Vec<usize> {
        (AUX_FIRST_ROW..AUX_FIRST_ROW + AUX_BYTES).collect()
    }

    pub fn timestamp_channel(&self) -> usize {
        TIMESTAMP_ROW
    }
}

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn to_row(packet: &Packet, timestamp: f64) -> Row {
    let mut row = [0.0; NUM_ROWS];
    row[PACKAGE_NUM_ROW] = f64::from(packet.sample_number);
    row[EEG_FIRST_ROW..AUX_FIRST_ROW].copy_from_slice(&packet.eeg);
    row[AUX_FIRST_ROW..TIMESTAMP_ROW]
        .iter_mut()
        .zip(packet.aux)
        .for_each(|(value, byte)| *value = f64::from(byte));
    row[TIMESTAMP_ROW] = timestamp;
    row
}

/// Fixed-capacity buffer that drops the oldest samples on overflow.
#[derive(Debug)]
struct RingBuffer {
    rows: VecDeque<Row>,
    capacity: usize,
    overflowing: bool,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            rows: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
            overflowing: false,
        }
    }

    fn push(&mut self, row: Row) {
        if self.rows.len() == self.capacity {
            if !self.overflowing {
                warn!("Board buffer is full, dropping oldest samples");
                self.overflowing = true;
            }
            self.rows.pop_front();
        }
        self.rows.push_back(row);
    }

    /// Transposes the last `count` rows into one vector per board channel.
    fn table(&self, count: usize) -> Vec<Vec<f64>> {
        let skip = self.rows.len() - count.min(self.rows.len());
        (0..NUM_ROWS)
            .map(|ch| self.rows.iter().skip(skip).map(|row| row[ch]).collect())
            .collect()
    }

    fn drain(&mut self) -> Vec<Vec<f64>> {
        let table = self.table(self.rows.len());
        self.rows.clear();
        self.overflowing = false;
        table
    }
}

/// A background acquisition task and the handles to stop it.
struct Streaming {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<DataReader<ByteStream>>,
}

/// Acquisition session of one board.
pub struct Session {
    config: DeviceConfig,
    reader: Option<DataReader<ByteStream>>,
    streaming: Option<Streaming>,
    buffer: Arc<Mutex<RingBuffer>>,
    alive: Arc<AtomicBool>,
}

impl Session {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            reader: None,
            streaming: None,
            buffer: Arc::new(Mutex::new(RingBuffer::new(1))),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds an already prepared session reading from `stream`.
    pub fn from_stream(config: DeviceConfig, stream: ByteStream) -> Self {
        let mut session = Self::new(config);
        session.reader = Some(DataReader::new(stream).with_gains(session.config.gains));
        session
    }

    pub fn description(&self) -> BoardDescription {
        BoardDescription
    }

    /// Whether a byte source is attached.
    pub fn is_prepared(&self) -> bool {
        self.reader.is_some() || self.streaming.is_some()
    }

    /// Whether the background task is still reading.
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some() && self.alive.load(Ordering::Acquire)
    }

    /// Opens the configured byte source. Calling it on a prepared session
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of [`DeviceConfig::open`].
    pub async fn prepare_session(&mut self) -> Result<()> {
        if self.is_prepared() {
            info!("Session already prepared");
            return Ok(());
        }
        let stream = self.config.open().await?;
        self.reader = Some(DataReader::new(stream).with_gains(self.config.gains));
        Ok(())
    }

    /// Starts reading packets into a ring buffer of `buffer_size` samples.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` for a zero `buffer_size`, `StreamAlreadyRunning`
    /// while a stream runs and `SessionNotPrepared` without a byte source.
    pub fn start_stream(&mut self, buffer_size: usize) -> Result<()> {
        if buffer_size == 0 {
            return Err(Error::invalid("buffer size must be positive"));
        }
        if self.streaming.is_some() {
            error!("Streaming thread already running");
            return Err(Error::StreamAlreadyRunning);
        }
        let mut reader = self.reader.take().ok_or(Error::SessionNotPrepared)?;

        let buffer = Arc::new(Mutex::new(RingBuffer::new(buffer_size)));
        self.buffer = Arc::clone(&buffer);
        let alive = Arc::new(AtomicBool::new(true));
        self.alive = Arc::clone(&alive);
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    packet = reader.poll_next() => match packet {
                        Ok(packet) => buffer.lock().push(to_row(&packet, timestamp())),
                        Err(e) => {
                            warn!("Board stream ended: {e}");
                            break;
                        }
                    },
                }
            }
            alive.store(false, Ordering::Release);
            reader
        });
        self.streaming = Some(Streaming { stop, handle });
        debug!("Streaming started with a buffer of {buffer_size} samples");
        Ok(())
    }

    /// Stops the background task and keeps the byte source for a later
    /// `start_stream`. Buffered data stays available, and so do the bytes of
    /// a frame that was only partly received when the task stopped.
    ///
    /// # Errors
    ///
    /// `StreamNotRunning` if no stream was started.
    pub async fn stop_stream(&mut self) -> Result<()> {
        let Streaming { stop, handle } = self.streaming.take().ok_or(Error::StreamNotRunning)?;
        // The task may have ended on its own already
        let _ = stop.send(());
        match handle.await {
            Ok(reader) => self.reader = Some(reader),
            Err(e) => error!("Streaming task failed: {e}"),
        }
        debug!("Streaming stopped");
        Ok(())
    }

    /// Stops streaming if needed and drops the byte source and all buffered
    /// data.
    pub async fn release_session(&mut self) {
        if self.streaming.is_some() {
            let _ = self.stop_stream().await;
        }
        self.reader = None;
        self.buffer = Arc::new(Mutex::new(RingBuffer::new(1)));
        debug!("Session released");
    }

    /// Number of buffered samples.
    pub fn get_board_data_count(&self) -> usize {
        self.buffer.lock().rows.len()
    }

    /// Latest `count` samples or fewer. The buffer is left untouched.
    pub fn get_current_board_data(&self, count: usize) -> Vec<Vec<f64>> {
        self.buffer.lock().table(count)
    }

    /// All buffered samples. The buffer is emptied.
    pub fn get_board_data(&self) -> Vec<Vec<f64>> {
        self.buffer.lock().drain()
    }
}
