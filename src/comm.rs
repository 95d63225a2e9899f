//! Provides functionality to read data from a Geenie board over its serial
//! line. It defines the `DataReader` struct which reads frames from any byte
//! stream and decodes them into a `Packet` struct.
//!
//! # Frame layout
//!
//! | offset   | content                                              |
//! |----------|------------------------------------------------------|
//! | `0`      | start byte `0x41`                                    |
//! | `1`      | sample number (rolling `u8`)                         |
//! | `2..26`  | 8 channels, 24-bit big-endian two's complement each  |
//! | `26..30` | auxiliary bytes                                      |
//! | `30`     | footer byte, `0xC0` to `0xC6`                        |
//!
//! # Structs
//!
//! - `Packet`: Represents one decoded sample of all EEG channels.
//! - `DataReader`: Reads and decodes frames from the bytes stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use geenie::{comm::DataReader, device::DeviceConfig};
//!
//! #[tokio::main]
//! async fn main() -> geenie::Result<()> {
//!     let stream = DeviceConfig::default().with_serial_port("/dev/ttyUSB0").open_serial()?;
//!     let mut reader = DataReader::new(stream);
//!
//!     while let Ok(packet) = reader.poll_next().await {
//!         println!("{:?}", packet);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! The `poll_next` method in `DataReader` returns an `Error` if there is an
//! issue reading from the stream. Corrupted frames are dropped and never
//! surface as errors.

use std::io::{Error, ErrorKind};

use futures::{
    executor::block_on,
    stream::{self, Stream},
};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of one frame on the wire, start and footer bytes included.
pub const FRAME_LENGTH: usize = 31;
/// Number of EEG channels carried by each frame.
pub const EEG_CHANNELS: usize = 8;
/// Number of auxiliary bytes carried by each frame.
pub const AUX_BYTES: usize = 4;
/// Programmable gain the ADC runs with unless configured otherwise.
pub const DEFAULT_GAIN: f64 = 24.0;

/// ADC reference voltage used for the microvolt conversion.
const ADS_VREF: f64 = 4.5;
const EEG_OFFSET: usize = 2;
const AUX_OFFSET: usize = EEG_OFFSET + 3 * EEG_CHANNELS;

const START_BYTE: u8 = 0x41;
const FOOTER_FIRST: u8 = 0xC0;
const FOOTER_LAST: u8 = 0xC6;

/// Marker bytes of the Geenie framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Code {
    /// Start of a frame, `0x41`
    Start,
    /// Any valid end byte, `0xC0` to `0xC6`
    Footer,
    /// Anything else
    Unknown,
}

impl From<u8> for Code {
    fn from(value: u8) -> Self {
        match value {
            START_BYTE => Code::Start,
            FOOTER_FIRST..=FOOTER_LAST => Code::Footer,
            _ => Code::Unknown,
        }
    }
}

/// Represents one sample of every EEG channel received from the board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    /// Rolling sample counter (0 ~ 255)
    pub sample_number: u8,
    /// Channel values (uV)
    pub eeg: [f64; EEG_CHANNELS],
    /// Unprocessed auxiliary bytes
    pub aux: [u8; AUX_BYTES],
    /// End byte of the frame (0xC0 ~ 0xC6)
    pub footer: u8,
}

/// Sign-extends a 24-bit big-endian value.
///
/// # Panics
///
/// Panics if `bytes` is shorter than three bytes.
pub fn cast_24bit_to_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8
}

/// Microvolts per ADC count at the given gain.
pub fn eeg_scale(gain: f64) -> f64 {
    ADS_VREF / f64::from((1 << 23) - 1) / gain * 1_000_000.
}

/// Decodes one complete frame. Returns `None` when the start byte or the
/// footer do not match the framing.
pub fn decode_frame(frame: &[u8; FRAME_LENGTH], gains: &[f64; EEG_CHANNELS]) -> Option<Packet> {
    if Code::from(frame[0]) != Code::Start || Code::from(frame[FRAME_LENGTH - 1]) != Code::Footer {
        return None;
    }
    let mut packet = Packet {
        sample_number: frame[1],
        footer: frame[FRAME_LENGTH - 1],
        ..Default::default()
    };
    packet.eeg.iter_mut().enumerate().for_each(|(ch, value)| {
        let offset = EEG_OFFSET + 3 * ch;
        *value = eeg_scale(gains[ch]) * f64::from(cast_24bit_to_i32(&frame[offset..offset + 3]));
    });
    packet
        .aux
        .copy_from_slice(&frame[AUX_OFFSET..AUX_OFFSET + AUX_BYTES]);
    Some(packet)
}

/// Represents a data reader that reads and decodes frames from the board.
pub struct DataReader<R> {
    /// The byte stream to read data from
    stream: R,
    /// Per-channel ADC gains
    gains: [f64; EEG_CHANNELS],
    /// Bytes read but not decoded yet, at most one frame long
    pending: Vec<u8>,
}

impl<R> DataReader<R> {
    pub fn new(stream: R) -> DataReader<R> {
        DataReader {
            stream,
            gains: [DEFAULT_GAIN; EEG_CHANNELS],
            pending: Vec::with_capacity(FRAME_LENGTH),
        }
    }

    /// Replaces the per-channel gains used for the microvolt conversion.
    pub fn with_gains(mut self, gains: [f64; EEG_CHANNELS]) -> Self {
        self.gains = gains;
        self
    }

    /// Drops pending bytes in front of the next start byte.
    fn skip_to_start(&mut self) {
        let start = self
            .pending
            .iter()
            .position(|&b| b == START_BYTE)
            .unwrap_or(self.pending.len());
        self.pending.drain(..start);
    }

    /// Decodes the pending frame if one is complete. A frame with a wrong
    /// footer loses its start byte only, so the search for the next start
    /// byte continues inside the dropped frame.
    fn take_frame(&mut self) -> Option<Packet> {
        loop {
            self.skip_to_start();
            let frame: &[u8; FRAME_LENGTH] = self.pending.get(..FRAME_LENGTH)?.try_into().ok()?;
            if let Some(packet) = decode_frame(frame, &self.gains) {
                self.pending.drain(..FRAME_LENGTH);
                return Some(packet);
            }
            warn!("Wrong end byte 0x{:02X}", frame[FRAME_LENGTH - 1]);
            self.pending.remove(0);
        }
    }
}

impl<R: AsyncRead + Unpin> DataReader<R> {
    /// Reads the next packet from the stream. It synchronizes on the start
    /// byte, reads the rest of the frame and verifies the footer. If the
    /// footer is wrong the frame is dropped and the search for a start byte
    /// continues inside the dropped bytes, so no data is skipped twice.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. Bytes of a partially received frame stay
    /// in the reader, so dropping the future inside `tokio::select!` and
    /// calling it again later loses nothing.
    pub async fn poll_next(&mut self) -> Result<Packet, Error> {
        let mut chunk = [0u8; FRAME_LENGTH];
        loop {
            if let Some(packet) = self.take_frame() {
                return Ok(packet);
            }
            let missing = FRAME_LENGTH - self.pending.len();
            let n = self.stream.read(&mut chunk[..missing]).await?;
            if n == 0 {
                return Err(ErrorKind::UnexpectedEof.into());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Turns the reader into a stream of packets. The stream ends at the
    /// first read error, end of input included.
    pub fn into_stream(self) -> impl Stream<Item = Packet> {
        stream::unfold(self, |mut reader| async move {
            match reader.poll_next().await {
                Ok(packet) => Some((packet, reader)),
                Err(e) => {
                    debug!("Packet stream ended: {e}");
                    None
                }
            }
        })
    }
}

impl<R: AsyncRead + Unpin> Iterator for DataReader<R> {
    type Item = Packet;

    /// Polls the next packet from the stream. It blocks until a valid packet
    /// is received. If an error occurs while reading the packet, it stops
    /// the iterator.
    fn next(&mut self) -> Option<Self::Item> {
        match block_on(self.poll_next()) {
            Ok(packet) => Some(packet),
            Err(_) => None, // Stop the iterator if an error occurs
        }
    }
}
