// Manual calibration sweep
//
// Walks an operator through a pressure sweep on a real sensor board and prints
// the calibration line of every channel.

use clap::Parser;
use ptcal_rs::{AcquisitionBuffer, PointEvent, RetryPolicy, SessionConfig, SweepDriver, SweepError};
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "manual_sweep")]
#[command(about = "Calibrate pressure transducers against operator-set reference pressures")]
struct Args {
    /// Serial port of the sensor board
    port: String,

    #[arg(short, long, default_value_t = 115_200, help = "Serial baud rate")]
    baud: u32,

    #[arg(short, long, default_value_t = 3, help = "Number of transducer channels")]
    channels: usize,

    #[arg(short = 'k', long, default_value_t = 10, help = "Readings averaged per pressure point")]
    readings: usize,

    #[arg(short, long, default_value_t = 3, help = "Number of calibration points")]
    points: usize,

    #[arg(long, default_value = "calibration", help = "Session name")]
    session: String,

    #[arg(long, default_value_t = 50, help = "Backoff step between malformed lines in milliseconds")]
    backoff_ms: u64,

    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = SessionConfig::builder(&args.port, args.channels)
        .baud_rate(args.baud)
        .samples_per_point(args.readings)
        .calibration_points(args.points)
        .session_name(&args.session)
        .retry(RetryPolicy::new(
            RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(args.backoff_ms),
            RetryPolicy::DEFAULT_BACKOFF_CEILING,
        ))
        .build()?;

    println!("PT Calibration: {}", config.session_name);
    println!("================\n");

    let buffer = Arc::new(AcquisitionBuffer::open(&config)?);
    println!("Connected to {} at {} baud\n", config.port, config.baud_rate);

    let mut sweep = SweepDriver::new(Arc::clone(&buffer), config.calibration_points)?;

    while !sweep.is_complete() {
        let pressure = prompt_pressure(sweep.points_completed() + 1, config.calibration_points)?;
        sweep.begin_point(pressure)?;

        match wait_with_progress(&mut sweep) {
            Ok(averages) => {
                let row: Vec<String> = averages.iter().map(|v| format!("{:.4}", v)).collect();
                println!("   ✓ {} -> {}", pressure, row.join(", "));
            }
            Err(SweepError::Acquisition(e)) => {
                println!("   ⚠ Point failed: {}", e);
                println!("   Please retake this pressure point.");
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("\nCollected data:");
    println!("{}", buffer.history_frame()?);

    match sweep.finish() {
        Ok(table) => {
            println!("\nCalibration:");
            println!("{}", table.to_dataframe(buffer.channel_names())?);
        }
        Err(SweepError::Calibration(e)) => {
            println!("\n⚠ {}", e);
            println!("Re-run the sweep for channels {:?}.", e.failed_channels());
        }
        Err(e) => return Err(e.into()),
    }

    buffer.close();
    Ok(())
}

fn wait_with_progress(sweep: &mut SweepDriver) -> Result<Vec<f64>, SweepError> {
    loop {
        match sweep.poll()? {
            Some(PointEvent::Progress { collected, required }) => {
                print!("\r   Reading pressure... {}/{}", collected, required);
                let _ = io::stdout().flush();
            }
            Some(PointEvent::Completed(result)) => {
                println!();
                return Ok(result.averages);
            }
            Some(PointEvent::Failed(e)) => return Err(e.into()),
            None => thread::sleep(Duration::from_millis(20)),
        }
    }
}

fn prompt_pressure(point: usize, total: usize) -> io::Result<f64> {
    loop {
        print!("Point {}/{}: set the reference pressure and enter its value: ", point, total);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        match input.trim().parse::<f64>() {
            Ok(pressure) if pressure.is_finite() => return Ok(pressure),
            _ => println!("   Pressure should be a number!"),
        }
    }
}
