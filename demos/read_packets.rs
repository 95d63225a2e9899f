use geenie::{comm::DataReader, device::DeviceConfig};

use std::time::Instant;

#[tokio::main]
async fn main() -> geenie::Result<()> {
    // The port comes from the first argument, e.g. /dev/ttyUSB0 or COM4
    let port = std::env::args().nth(1).unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let config = DeviceConfig::default().with_serial_port(port);
    // Open the port (make sure the board is powered and streaming)
    let stream = config.open().await?;
    // Create a data reader
    let mut data_reader = DataReader::new(stream).with_gains(config.gains);
    // Poll data packets asynchronously
    let start_time = Instant::now();
    while let Ok(packet) = data_reader.poll_next().await {
        println!(
            "[{:.02?}s] #{:03}: {:?}",
            start_time.elapsed().as_secs_f64(),
            packet.sample_number,
            packet.eeg
        );
    }
    Ok(())
}
