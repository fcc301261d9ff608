use ptcal_rs::{
    fit_channel, AcquisitionBuffer, HistoryPoint, MockLink, RetryPolicy, SessionConfig,
    SweepDriver,
};
use std::sync::Arc;

const PRESSURES: [f64; 3] = [0.0, 50.0, 100.0];

// Three frames of plausible transducer voltages per pressure point.
const FRAMES: [[&str; 3]; 3] = [
    ["0.498, 0.512, 0.489", "0.502, 0.509, 0.493", "0.500, 0.515, 0.491"],
    ["2.497, 2.391, 2.612", "2.503, 2.388, 2.607", "2.501, 2.396, 2.615"],
    ["4.499, 4.270, 4.730", "4.505, 4.281, 4.722", "4.496, 4.275, 4.738"],
];

fn config() -> SessionConfig {
    SessionConfig::builder("mock", 3)
        .samples_per_point(3)
        .calibration_points(3)
        .session_name("bench-sweep")
        .retry(RetryPolicy::immediate(10))
        .build()
        .unwrap()
}

fn mean_of(frames: &[&str], channel: usize) -> f64 {
    let values: Vec<f64> = frames
        .iter()
        .map(|line| line.split(", ").nth(channel).unwrap().parse().unwrap())
        .collect();
    values.iter().sum::<f64>() / values.len() as f64
}

fn manual_least_squares(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let slope = sxy / sxx;
    (slope, mean_y - slope * mean_x)
}

#[test]
fn test_three_channel_sweep_with_buffer() {
    let link = MockLink::new();
    let buffer = AcquisitionBuffer::with_transport(link.clone(), &config());

    for (pressure, frames) in PRESSURES.iter().zip(FRAMES.iter()) {
        // A line from the previous point is still waiting in the input buffer.
        link.push_stale("9.9, 9.9, 9.9");
        for line in frames {
            link.push_line(line);
        }

        for i in 0..frames.len() {
            buffer.read_one_frame(i == 0).unwrap();
        }
        assert!(buffer.is_ready_for_average().unwrap());

        let averages = buffer.commit_average(*pressure).unwrap();
        for (channel, average) in averages.iter().enumerate() {
            assert!((average - mean_of(frames, channel)).abs() < 1e-12);
        }
        assert_eq!(buffer.buffered_samples(), 0);
    }

    let table = buffer.fit_all().unwrap();
    assert_eq!(table.len(), 3);

    for channel in 0..3 {
        let points: Vec<(f64, f64)> = PRESSURES
            .iter()
            .zip(FRAMES.iter())
            .map(|(&p, frames)| (p, mean_of(frames, channel)))
            .collect();
        let (slope, intercept) = manual_least_squares(&points);

        let fitted = table.channel(channel).unwrap();
        assert!((fitted.slope - slope).abs() < 1e-9, "channel {}", channel);
        assert!((fitted.intercept - intercept).abs() < 1e-9, "channel {}", channel);
    }

    let history = buffer.all_calibration_data();
    assert_eq!(history.points(), 3);
    assert_eq!(history.pressures(), PRESSURES.to_vec());

    let df = buffer.history_frame().unwrap();
    assert_eq!(df.height(), 3);
    assert_eq!(df.width(), 4);
}

#[test]
fn test_three_channel_sweep_with_driver() {
    let link = MockLink::new();
    for (index, frames) in FRAMES.iter().enumerate() {
        for line in frames {
            link.push_line(line);
        }
        if index == 1 {
            // Noise the next point has to ride out.
            link.push_line("4.499, 4.270");
            link.push_line("4.499, x, 4.730");
        }
    }
    let config = config();
    let buffer = Arc::new(AcquisitionBuffer::with_transport(link.clone(), &config));
    let mut sweep = SweepDriver::new(Arc::clone(&buffer), config.calibration_points).unwrap();

    for (index, pressure) in PRESSURES.iter().enumerate() {
        sweep.begin_point(*pressure).unwrap();
        let point = sweep.wait_point().unwrap();
        assert_eq!(point.index, index);
        assert_eq!(point.averages.len(), 3);
    }
    assert!(sweep.is_complete());

    let table = sweep.finish().unwrap();
    let history = buffer.all_calibration_data();
    for channel in 0..3 {
        let expected = fit_channel(history.channel(channel).unwrap()).unwrap();
        assert_eq!(table.channel(channel), Some(&expected));
    }

    let df = table.to_dataframe(buffer.channel_names()).unwrap();
    assert_eq!(df.height(), 3);
    assert_eq!(df.column("channel").unwrap().str().unwrap().get(2), Some("PT3"));
}

#[test]
fn test_garbled_lines_between_good_frames() {
    let link = MockLink::new();
    link.push_line("0.5, 0.5, 0.5");
    link.push_line("0.5, 0.5");
    link.push_line("0.5, 0.5, 0.50.5, 0.5, 0.5");
    link.push_timeout("0.6, 0.");
    link.push_line("6, 0.6");
    link.push_line("0.7, 0.7, 0.7");
    link.push_line("0.9, 0.9, 0.9");

    let buffer = AcquisitionBuffer::with_transport(link.clone(), &config());
    buffer.read_one_frame(true).unwrap();
    buffer.read_one_frame(false).unwrap();
    buffer.read_one_frame(false).unwrap();

    let averages = buffer.commit_average(10.0).unwrap();
    assert!((averages[1] - 0.7).abs() < 1e-12);
    assert_eq!(link.remaining(), 0);
    assert_eq!(
        buffer.all_calibration_data().channel(0),
        Some(&[HistoryPoint::new(10.0, averages[0])][..])
    );
}

#[test]
fn test_single_channel_cut_lines_are_not_averaged() {
    let config = SessionConfig::builder("mock", 1)
        .samples_per_point(2)
        .calibration_points(2)
        .retry(RetryPolicy::immediate(10))
        .build()
        .unwrap();

    let link = MockLink::new();
    // A flush lands inside "0.7501", then the board stalls inside "0.5123".
    link.push_stale_partial("0.75");
    link.push_line("01");
    link.push_line("0.5000");
    link.push_timeout("0.5");
    link.push_line("123");
    link.push_line("0.5200");

    let buffer = Arc::new(AcquisitionBuffer::with_transport(link.clone(), &config));
    let mut sweep = SweepDriver::new(Arc::clone(&buffer), config.calibration_points).unwrap();
    sweep.begin_point(0.0).unwrap();
    let point = sweep.wait_point().unwrap();

    assert!((point.averages[0] - 0.51).abs() < 1e-12);
    assert_eq!(link.remaining(), 0);
}
