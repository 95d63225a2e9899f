//! Provides functionality to configure and open the connection to a Geenie
//! board. It includes a `DeviceConfig` struct for specifying the serial port,
//! line speed, read timeout and channel gains, as well as methods for listing
//! serial ports and opening the byte stream the board writes to.
//!
//! A raw capture file can stand in for the serial port, which replays a
//! previously dumped byte stream through the same decoding path.
//!
//! # Examples
//!
//! ```rust,no_run
//! use geenie::device::DeviceConfig;
//!
//! #[tokio::main]
//! async fn main() -> geenie::Result<()> {
//!     let config = DeviceConfig::default()
//!         .with_serial_port("/dev/ttyUSB0")
//!         .with_baud_rate(115_200);
//!
//!     let stream = config.open().await?;
//!     // Hand the stream to a `DataReader`
//!
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! Methods in this module return `Error::InvalidArguments` for unusable
//! configurations, `Error::UnableToOpenPort` when the serial port cannot be
//! opened and `Error::Io` when a capture file cannot be read.

use std::path::PathBuf;
use std::time::Duration;

use log::{info, trace};
use tokio::io::AsyncRead;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

use crate::comm::{DEFAULT_GAIN, EEG_CHANNELS};
use crate::error::{Error, Result};

/// Byte stream a `DataReader` can decode from.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Configuration for connecting to a Geenie board.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Serial port the board is attached to, e.g. `/dev/ttyUSB0` or `COM4`.
    pub serial_port: String,
    /// Line speed. Default: 115200.
    pub baud_rate: u32,
    /// Read timeout of the serial port. Default: 1s.
    pub timeout: Duration,
    /// ADC gain of every EEG channel. Default: 24.
    pub gains: [f64; EEG_CHANNELS],
    /// Raw capture to replay instead of reading the serial port.
    pub file: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(1000),
            gains: [DEFAULT_GAIN; EEG_CHANNELS],
            file: None,
        }
    }
}

impl DeviceConfig {
    /// Updates the serial port name.
    ///
    /// # Arguments
    ///
    /// * `port` - The port name, such as `/dev/ttyUSB0` or `COM4`.
    ///
    /// # Returns
    ///
    /// * `Self` - The updated configuration.
    pub fn with_serial_port(mut self, port: impl Into<String>) -> Self {
        self.serial_port = port.into();
        self
    }

    /// Updates the line speed.
    /// If not provided, the default is 115200 baud.
    ///
    /// # Arguments
    ///
    /// * `baud_rate` - The line speed in baud.
    ///
    /// # Returns
    ///
    /// * `Self` - The updated configuration.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Updates the serial read timeout.
    /// If not provided, the default is one second.
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long a read waits for the board.
    ///
    /// # Returns
    ///
    /// * `Self` - The updated configuration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Updates the gain of every channel.
    /// If not provided, every channel runs at a gain of 24.
    ///
    /// # Arguments
    ///
    /// * `gains` - The ADC gain of each EEG channel.
    ///
    /// # Returns
    ///
    /// * `Self` - The updated configuration.
    pub fn with_gains(mut self, gains: [f64; EEG_CHANNELS]) -> Self {
        self.gains = gains;
        self
    }

    /// Replays a raw capture file instead of opening the serial port.
    /// The file takes precedence over the serial port when both are set.
    ///
    /// # Arguments
    ///
    /// * `file` - Path to bytes recorded from the board.
    ///
    /// # Returns
    ///
    /// * `Self` - The updated configuration.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Checks that the configuration can be opened.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArguments` if neither a serial port nor a file
    /// is set, if the baud rate is zero or if a gain is not a positive number.
    pub fn validate(&self) -> Result<()> {
        if self.file.is_none() && self.serial_port.is_empty() {
            return Err(Error::invalid("serial port is empty"));
        }
        if self.baud_rate == 0 {
            return Err(Error::invalid("baud rate must be positive"));
        }
        if let Some(gain) = self.gains.iter().find(|g| !(g.is_finite() && **g > 0.0)) {
            return Err(Error::invalid(format!("invalid channel gain {gain}")));
        }
        Ok(())
    }

    /// Opens the serial port with 8N1 framing and no flow control, and
    /// discards whatever the driver buffered before.
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration is invalid or
    /// the port cannot be opened or configured.
    pub fn open_serial(&self) -> Result<SerialStream> {
        self.validate()?;
        let port_error = |source| Error::UnableToOpenPort {
            port: self.serial_port.clone(),
            source,
        };
        info!("Opening port {}", self.serial_port);
        let port = tokio_serial::new(&self.serial_port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(port_error)?;
        port.clear(ClearBuffer::Input).map_err(port_error)?;
        trace!("Port {} is open", self.serial_port);
        Ok(port)
    }

    /// One-liner to open whichever source is configured: the capture file if
    /// one is set, the serial port otherwise.
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration is invalid or
    /// the source cannot be opened.
    pub async fn open(&self) -> Result<ByteStream> {
        self.validate()?;
        match &self.file {
            Some(path) => {
                info!("Replaying capture {}", path.display());
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(tokio::io::BufReader::new(file)))
            }
            None => Ok(Box::new(self.open_serial()?)),
        }
    }
}

/// Lists the names of the serial ports present on this machine.
///
/// # Errors
///
/// Returns `Error::UnableToOpenPort` if the ports cannot be enumerated.
pub fn available_ports() -> Result<Vec<String>> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|source| Error::UnableToOpenPort {
            port: "*".to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_defaults_match_board_settings() {
        let config = DeviceConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.gains, [24.0; EEG_CHANNELS]);
    }

    #[test]
    fn test_empty_serial_port_is_rejected() {
        let err = DeviceConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
        assert!(DeviceConfig::default().with_serial_port("COM4").validate().is_ok());
    }

    #[test]
    fn test_bad_gain_is_rejected() {
        let mut gains = [DEFAULT_GAIN; EEG_CHANNELS];
        gains[3] = 0.0;
        let config = DeviceConfig::default().with_serial_port("COM4").with_gains(gains);
        assert!(matches!(config.validate(), Err(Error::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_open_replays_file() {
        let mut capture = tempfile::NamedTempFile::new().unwrap();
        capture.write_all(&[1, 2, 3]).unwrap();
        let mut stream = DeviceConfig::default()
            .with_file(capture.path())
            .open()
            .await
            .unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let result = DeviceConfig::default()
            .with_file("/nonexistent/capture.bin")
            .open()
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
