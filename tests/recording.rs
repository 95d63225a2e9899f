use std::f64::consts::PI;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use edfplus::EdfReader;
use geenie::{
    Error,
    board::Session,
    comm::{DataReader, EEG_CHANNELS, eeg_scale},
    device::DeviceConfig,
    edf::RecordingHeader,
    measurement::{Measurement, MeasurementConfig, Preprocessing},
};

fn frame(sample_number: u8, counts: [i32; EEG_CHANNELS]) -> Vec<u8> {
    let mut frame = vec![0x41, sample_number];
    for count in counts {
        frame.extend_from_slice(&count.to_be_bytes()[1..]);
    }
    frame.extend_from_slice(&[0, 0, 0, 0, 0xC0]);
    frame
}

/// Writes `samples` frames to a capture file, channel `ch` of sample `i`
/// holding `counts(i, ch)`.
fn capture(dir: &Path, samples: usize, counts: impl Fn(usize, usize) -> i32) -> std::path::PathBuf {
    let path = dir.join("capture.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..samples {
        let values = std::array::from_fn(|ch| counts(i, ch));
        file.write_all(&frame(i as u8, values)).unwrap();
    }
    path
}

fn header() -> RecordingHeader {
    RecordingHeader::default()
        .with_patient_name("Patient1")
        .with_annotation(0.0, None, "Recording start")
}

#[tokio::test]
async fn test_record_capture_to_edf() {
    let dir = tempfile::tempdir().unwrap();
    let counts = |i: usize, ch: usize| ((i % 100) * 1000 * (ch + 1)) as i32;
    let config = DeviceConfig::default().with_file(capture(dir.path(), 300, counts));
    let mut reader = DataReader::new(config.open().await.unwrap());

    let output = dir.path().join("out.edf");
    let mut measurement = Measurement::new(MeasurementConfig {
        header: header(),
        sampling_rate: 5,
        edf_filename: Some(output.clone()),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(measurement.points_length(), 300);

    measurement.record(&mut reader).await.unwrap();
    assert!(measurement.is_complete());
    assert_eq!(measurement.save_file().unwrap(), output);

    let mut edf = EdfReader::open(output.to_str().unwrap()).unwrap();
    assert_eq!(edf.header().signals.len(), EEG_CHANNELS);
    assert_eq!(edf.header().datarecords_in_file, 60);
    let scale = eeg_scale(24.0);
    let samples = edf.read_physical_samples(2, 300).unwrap();
    for i in [0, 37, 150, 299] {
        let expected = f64::from(counts(i, 2)) * scale;
        assert!((samples[i] - expected).abs() < 10.0, "sample {i}: {} vs {expected}", samples[i]);
    }
}

#[tokio::test]
async fn test_record_with_preprocessing() {
    let dir = tempfile::tempdir().unwrap();
    let scale = eeg_scale(24.0);
    let counts = |i: usize, _ch: usize| {
        let t = i as f64 / 250.0;
        // 100 uV alpha on a large offset, plus mains hum
        let uv = 5000.0 + 100.0 * (2.0 * PI * 10.0 * t).sin() + 50.0 * (2.0 * PI * 50.0 * t).sin();
        (uv / scale).round() as i32
    };
    let config = DeviceConfig::default().with_file(capture(dir.path(), 15_000, counts));
    let mut reader = DataReader::new(config.open().await.unwrap());

    let output = dir.path().join("filtered.edf");
    let mut measurement = Measurement::new(MeasurementConfig {
        header: header(),
        number_of_channels: 1,
        edf_filename: Some(output.clone()),
        preprocessing: Preprocessing::eeg(),
        ..Default::default()
    })
    .unwrap();
    measurement.record(&mut reader).await.unwrap();
    measurement.save_file().unwrap();

    let mut edf = EdfReader::open(output.to_str().unwrap()).unwrap();
    let samples = edf.read_physical_samples(0, 15_000).unwrap();
    let settled = &samples[5_000..];
    let peak = settled.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    assert!((85.0..120.0).contains(&peak), "peak {peak}");
}

#[tokio::test]
async fn test_preprocessing_rejects_low_rate() {
    let dir = tempfile::tempdir().unwrap();
    let config = DeviceConfig::default().with_file(capture(dir.path(), 300, |_, _| 0));
    let mut reader = DataReader::new(config.open().await.unwrap());
    let mut measurement = Measurement::new(MeasurementConfig {
        sampling_rate: 5,
        edf_filename: Some(dir.path().join("never.edf")),
        preprocessing: Preprocessing::eeg(),
        ..Default::default()
    })
    .unwrap();
    measurement.record(&mut reader).await.unwrap();
    assert!(matches!(measurement.save_file(), Err(Error::InvalidArguments(_))));
    assert!(!dir.path().join("never.edf").exists());
}

#[tokio::test]
async fn test_session_replays_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = capture(dir.path(), 50, |i, ch| (i * 10 + ch) as i32);
    let mut session = Session::new(DeviceConfig::default().with_file(path));

    assert!(matches!(session.start_stream(100), Err(Error::SessionNotPrepared)));
    session.prepare_session().await.unwrap();
    session.prepare_session().await.unwrap();
    session.start_stream(100).unwrap();
    for _ in 0..200 {
        if !session.is_streaming() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let description = session.description();
    let data = session.get_board_data();
    assert_eq!(data[description.package_num_channel()].len(), 50);
    let eeg = description.eeg_channels();
    let scale = eeg_scale(24.0);
    assert!((data[eeg[3]][7] - 73.0 * scale).abs() < 1e-9);

    session.stop_stream().await.unwrap();
    session.release_session().await;
    assert!(matches!(session.stop_stream().await, Err(Error::StreamNotRunning)));
}

#[tokio::test]
async fn test_session_buffer_to_edf() {
    let dir = tempfile::tempdir().unwrap();
    let counts = |i: usize, ch: usize| (i * 1000 + ch * 100) as i32;
    let path = capture(dir.path(), 400, counts);
    let mut session = Session::new(DeviceConfig::default().with_file(path));
    session.prepare_session().await.unwrap();
    session.start_stream(450).unwrap();
    for _ in 0..200 {
        if !session.is_streaming() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.get_board_data_count(), 400);

    let output = dir.path().join("session.edf");
    let mut measurement = Measurement::new(MeasurementConfig {
        header: header(),
        sampling_rate: 5,
        number_of_channels: 4,
        edf_filename: Some(output.clone()),
        ..Default::default()
    })
    .unwrap();
    measurement.capture_session(&session).unwrap();
    assert!(measurement.is_complete());
    // The session buffer is left untouched
    assert_eq!(session.get_board_data_count(), 400);
    session.release_session().await;
    measurement.save_file().unwrap();

    let mut edf = EdfReader::open(output.to_str().unwrap()).unwrap();
    assert_eq!(edf.header().signals.len(), 4);
    assert_eq!(edf.header().datarecords_in_file, 60);
    let scale = eeg_scale(24.0);
    let samples = edf.read_physical_samples(2, 300).unwrap();
    for j in [0, 150, 299] {
        let expected = f64::from(counts(100 + j, 2)) * scale;
        assert!((samples[j] - expected).abs() < 10.0, "sample {j}: {} vs {expected}", samples[j]);
    }
}
