use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};

use geenie::{
    board::Session,
    comm::{DataReader, EEG_CHANNELS},
    device::{self, DeviceConfig},
    edf::RecordingHeader,
    filter::get_nearest_power_of_two,
    measurement::{Measurement, MeasurementConfig, Preprocessing},
    psd::{get_avg_band_powers, get_live_band_powers},
};

#[derive(Parser)]
#[command(
    name = "geenie",
    version,
    about = "Stream, monitor and record EEG data from Geenie boards"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Serial port the board is attached to
    #[arg(long, env = "GEENIE_SERIAL_PORT", default_value = "")]
    serial_port: String,

    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Serial read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,

    /// Raw capture file to replay instead of the serial port
    #[arg(long)]
    file: Option<PathBuf>,

    /// ADC gain of every channel
    #[arg(long, default_value_t = 24.0)]
    gain: f64,
}

impl ConnectionArgs {
    fn device_config(&self) -> DeviceConfig {
        let config = DeviceConfig::default()
            .with_serial_port(self.serial_port.clone())
            .with_baud_rate(self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout))
            .with_gains([self.gain; EEG_CHANNELS]);
        match &self.file {
            Some(file) => config.with_file(file),
            None => config,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// Stream for a while and print what was collected
    Stream(StreamArgs),
    /// Log the average EEG band powers until interrupted, optionally saving
    /// a measurement from the session buffer
    Monitor(MonitorArgs),
    /// Record a measurement into an EDF file
    Record(RecordArgs),
}

#[derive(Args)]
struct StreamArgs {
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Samples kept by the session buffer
    #[arg(long, default_value_t = 450_000)]
    buffer_size: usize,
}

#[derive(Args)]
struct MonitorArgs {
    /// Time between two updates in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Seconds of signal each update looks at
    #[arg(long, default_value_t = 4)]
    window_seconds: usize,

    #[arg(long, default_value_t = 450_000)]
    buffer_size: usize,

    /// Save a measurement once the session buffer holds enough samples
    #[arg(long)]
    record: bool,

    #[command(flatten)]
    measurement: MeasurementArgs,
}

#[derive(Args)]
struct RecordArgs {
    #[command(flatten)]
    measurement: MeasurementArgs,
}

#[derive(Args)]
struct MeasurementArgs {
    #[arg(long, default_value = "Patient1")]
    patient_name: String,

    #[arg(long, default_value = "")]
    patient_code: String,

    /// M, F or empty
    #[arg(long, default_value = "")]
    sex: String,

    /// YYYY-MM-DD
    #[arg(long)]
    birthdate: Option<chrono::NaiveDate>,

    #[arg(long, default_value = "")]
    technician: String,

    #[arg(long, default_value = "Geenie")]
    equipment: String,

    #[arg(long, default_value_t = 10)]
    recording_minutes: u32,

    #[arg(long, default_value_t = EEG_CHANNELS)]
    channels: usize,

    /// Channel labels, one per channel
    #[arg(long, num_args = 1..)]
    channel_names: Option<Vec<String>>,

    /// Output file, named after the start time by default
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Detrend, band-pass 3-45 Hz and notch 48-52 Hz before saving
    #[arg(long)]
    filter: bool,
}

impl MeasurementArgs {
    fn into_measurement(self) -> geenie::Result<Measurement> {
        let mut header = RecordingHeader::default()
            .with_patient_name(self.patient_name)
            .with_patient_code(self.patient_code)
            .with_sex(self.sex)
            .with_technician(self.technician)
            .with_equipment(self.equipment)
            .with_annotation(0.0, None, "Recording start");
        if let Some(birthdate) = self.birthdate {
            header = header.with_birthdate(birthdate);
        }
        Measurement::new(MeasurementConfig {
            header,
            recording_minutes: self.recording_minutes,
            number_of_channels: self.channels,
            channel_names: self.channel_names,
            edf_filename: self.output,
            preprocessing: if self.filter {
                Preprocessing::eeg()
            } else {
                Preprocessing::none()
            },
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let config = cli.connection.device_config();
    let result = match cli.command {
        Command::Ports => ports(),
        Command::Stream(args) => stream(config, args).await,
        Command::Monitor(args) => monitor(config, args).await,
        Command::Record(args) => record(config, args).await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn ports() -> Result<()> {
    for port in device::available_ports()? {
        println!("{port}");
    }
    Ok(())
}

async fn stream(config: DeviceConfig, args: StreamArgs) -> Result<()> {
    let mut session = Session::new(config);
    let result = async {
        session.prepare_session().await?;
        session.start_stream(args.buffer_size)?;
        tokio::time::sleep(Duration::from_secs(args.seconds)).await;
        let data = session.get_board_data();
        session.stop_stream().await?;
        Ok::<_, geenie::Error>(data)
    }
    .await;
    // Best-effort release, whatever happened above
    session.release_session().await;

    let data = result.context("streaming failed")?;
    let description = session.description();
    info!("Collected {} samples of {} rows", data[0].len(), data.len());
    for ch in description.eeg_channels() {
        println!("{ch}: {:?}", &data[ch][..data[ch].len().min(10)]);
    }
    Ok(())
}

async fn monitor(config: DeviceConfig, args: MonitorArgs) -> Result<()> {
    let mut measurement = if args.record {
        let measurement = args.measurement.into_measurement()?;
        if measurement.points_length() > args.buffer_size {
            anyhow::bail!(
                "a buffer of {} samples cannot hold a measurement of {}",
                args.buffer_size,
                measurement.points_length()
            );
        }
        Some(measurement)
    } else {
        None
    };

    let mut session = Session::new(config);
    let description = session.description();
    let fs = description.sampling_rate();
    let eeg_channels = description.eeg_channels();
    let window = args.window_seconds * fs;
    let nfft = get_nearest_power_of_two(fs);

    let result = async {
        session.prepare_session().await?;
        session.start_stream(args.buffer_size)?;
        let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {}
            }
            if !session.is_streaming() {
                warn!("Board stopped streaming");
                break;
            }
            let target_reached = measurement
                .as_ref()
                .is_some_and(|m| session.get_board_data_count() >= m.points_length());
            if target_reached {
                if let Some(mut m) = measurement.take() {
                    m.capture_session(&session)?;
                    m.save_file()?;
                }
            }
            let data = session.get_current_board_data(window);
            if data[0].len() <= nfft {
                continue;
            }
            let bands = get_live_band_powers(&data, &eeg_channels, fs)?;
            info!(
                "delta {:.0} theta {:.0} alpha {:.0} beta {:.0} gamma {:.0}",
                bands[0], bands[1], bands[2], bands[3], bands[4]
            );
            let relative = get_avg_band_powers(&data, &eeg_channels, fs, true)?;
            debug!(
                "relative delta {:.2} theta {:.2} alpha {:.2} beta {:.2} gamma {:.2}",
                relative.avg[0], relative.avg[1], relative.avg[2], relative.avg[3], relative.avg[4]
            );
        }
        // Interrupted before the target, keep what the buffer holds
        if let Some(mut m) = measurement.take() {
            m.capture_session(&session)?;
            m.save_file()?;
        }
        Ok::<_, geenie::Error>(())
    }
    .await;
    session.release_session().await;
    result.context("monitoring failed")
}

async fn record(config: DeviceConfig, args: RecordArgs) -> Result<()> {
    let mut measurement = args.measurement.into_measurement()?;

    let stream = config.open().await.context("unable to open the board")?;
    let mut reader = DataReader::new(stream).with_gains(config.gains);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(e) = measurement.record_until(&mut reader, shutdown).await {
        error!("Reading stopped early: {e}");
    }
    let path = measurement.save_file().context("unable to save the measurement")?;
    println!("{}", path.display());
    Ok(())
}
