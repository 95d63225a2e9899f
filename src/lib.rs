//! geenie is a library for streaming EEG data from Geenie boards over a
//! serial line. It provides functionality to configure and open the
//! connection, to read and decode data frames from the byte stream, to run a
//! buffered acquisition session, to filter and summarise the signals and to
//! record measurements into EDF files.

pub mod board;
pub mod comm;
pub mod device;
pub mod edf;
pub mod error;
pub mod filter;
pub mod measurement;
pub mod psd;

pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;

    /// Doing an all-in-one test to open the serial port, read a packet, and
    /// decode it.
    ///
    /// NOTE: This test requires a Geenie board attached to the port named by
    /// the `GEENIE_SERIAL_PORT` environment variable.
    #[tokio::test]
    #[ignore]
    async fn test_open_port_and_decode() {
        let port = std::env::var("GEENIE_SERIAL_PORT").expect("GEENIE_SERIAL_PORT is not set");
        let config = device::DeviceConfig::default().with_serial_port(port);
        let stream = config.open().await.expect("Failed to open serial port");
        let mut data_reader = comm::DataReader::new(stream);
        let packet = data_reader
            .poll_next()
            .await
            .expect("Failed to poll next packet");
        println!("{:?}", packet);
    }
}
