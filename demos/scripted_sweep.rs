// Scripted calibration sweep
//
// Runs a full sweep against a simulated sensor board, including the garbled
// lines real firmware occasionally emits. No hardware required.

use clap::Parser;
use ptcal_rs::{AcquisitionBuffer, MockLink, RetryPolicy, SessionConfig, SweepDriver};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scripted_sweep")]
#[command(about = "Simulated pressure transducer calibration sweep")]
struct Args {
    #[arg(short, long, default_value_t = 3, help = "Number of transducer channels")]
    channels: usize,

    #[arg(short = 'k', long, default_value_t = 5, help = "Readings averaged per pressure point")]
    readings: usize,

    #[arg(short, long, num_args = 2.., default_values_t = vec![0.0, 50.0, 100.0], help = "Reference pressures")]
    pressures: Vec<f64>,

    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

// Volts at zero pressure and volts per pressure unit of each simulated channel.
fn sensor_response(channel: usize) -> (f64, f64) {
    let channel = channel as f64;
    (0.5 + 0.01 * channel, 0.04 - 0.002 * channel)
}

fn simulated_line(channels: usize, pressure: f64, sample: usize) -> String {
    (0..channels)
        .map(|channel| {
            let (offset, gain) = sensor_response(channel);
            let noise = ((sample * 7 + channel * 3) % 5) as f64 * 0.001 - 0.002;
            format!("{:.4}", offset + gain * pressure + noise)
        })
        .collect::<Vec<_>>()
        .join(", ")
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

    let config = SessionConfig::builder("simulated", args.channels)
        .samples_per_point(args.readings)
        .calibration_points(args.pressures.len())
        .session_name("scripted")
        .retry(RetryPolicy::immediate(RetryPolicy::DEFAULT_MAX_ATTEMPTS))
        .build()?;

    let link = MockLink::new();
    let buffer = Arc::new(AcquisitionBuffer::with_transport(link.clone(), &config));
    let mut sweep = SweepDriver::new(Arc::clone(&buffer), config.calibration_points)?;

    println!("Scripted PT Calibration");
    println!("=======================\n");

    for &pressure in &args.pressures {
        link.push_stale(simulated_line(args.channels, -1.0, 0));
        for sample in 0..args.readings {
            if sample == 1 {
                // The board stalls half way through a line, then doubles one.
                let line = simulated_line(args.channels, pressure, sample);
                let (head, tail) = line.split_at(line.len() / 2);
                link.push_timeout(head);
                link.push_line(tail);
                link.push_line(format!("{}{}", line, line));
            }
            link.push_line(simulated_line(args.channels, pressure, sample));
        }

        sweep.begin_point(pressure)?;
        let point = sweep.wait_point()?;
        let row: Vec<String> = point.averages.iter().map(|v| format!("{:.4}", v)).collect();
        println!("{:>8.2} -> {}", point.pressure, row.join(", "));
    }

    let table = sweep.finish()?;
    println!("\n{}", table.to_dataframe(buffer.channel_names())?);

    for (channel, line) in table.iter().enumerate() {
        let (offset, gain) = sensor_response(channel);
        println!(
            "{}: fitted slope {:.5} (simulated {:.5}), intercept {:.5} (simulated {:.5})",
            buffer.channel_names()[channel],
            line.slope,
            gain,
            line.intercept,
            offset
        );
    }

    Ok(())
}
