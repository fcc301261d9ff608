//! # PTCal RS
//!
//! Acquisition and calibration engine for manual pressure-transducer (PT)
//! calibration sweeps.
//!
//! An operator sets a reference pressure, the sensor board streams one line of
//! comma separated voltages per sample over a serial link, and this crate
//! collects and averages those readings per channel. After the sweep, every
//! channel gets a least-squares calibration line.
//!
//! ## Features
//!
//! - **Robust framing**: partial or doubled lines are re-read with linear backoff,
//!   and the tail of a line cut by a flush or a stall is never taken for a reading
//! - **Thread-safe buffer**: one worker reads from the device while a UI thread
//!   polls progress without waiting on serial I/O
//! - **Background sweeps**: point acquisition on a worker thread, results over a
//!   channel
//! - **Least-squares fit**: per-channel slope and intercept with precise errors
//! - **DataFrame output**: history and coefficient tables as `polars` frames
//!
//! ## Examples
//!
//! ### Reading and averaging a point
//!
//! ```rust
//! use ptcal_rs::{AcquisitionBuffer, MockLink, RetryPolicy, SessionConfig};
//!
//! let config = SessionConfig::builder("/dev/ttyUSB0", 2)
//!     .samples_per_point(2)
//!     .retry(RetryPolicy::immediate(10))
//!     .build()?;
//!
//! let link = MockLink::with_lines(["0.50, 1.00", "0.52, 1.04"]);
//! let buffer = AcquisitionBuffer::with_transport(link, &config);
//!
//! buffer.read_one_frame(true)?;
//! buffer.read_one_frame(false)?;
//! assert!(buffer.is_ready_for_average()?);
//!
//! let averages = buffer.commit_average(50.0)?;
//! assert!((averages[0] - 0.51).abs() < 1e-12);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Sweeping a real device
//!
//! ```rust,no_run
//! use ptcal_rs::{AcquisitionBuffer, SessionConfig, SweepDriver};
//! use std::sync::Arc;
//!
//! let config = SessionConfig::builder("/dev/ttyUSB0", 3)
//!     .samples_per_point(10)
//!     .calibration_points(3)
//!     .build()?;
//! let buffer = Arc::new(AcquisitionBuffer::open(&config)?);
//! let mut sweep = SweepDriver::new(buffer, config.calibration_points)?;
//!
//! for pressure in [0.0, 50.0, 100.0] {
//!     sweep.begin_point(pressure)?;
//!     let point = sweep.wait_point()?;
//!     println!("{} psi: {:?}", point.pressure, point.averages);
//! }
//!
//! for (channel, line) in sweep.finish()?.iter().enumerate() {
//!     println!("PT{}: slope={} intercept={}", channel + 1, line.slope, line.intercept);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod frame;
pub mod mock_link;
pub mod serial_link;
pub mod sweep;

// Re-export the main types for convenience
pub use acquisition::{AcquisitionBuffer, AcquisitionError, StateError};

pub use calibration::{
    fit_all, fit_channel, CalibrationCoefficients, CalibrationError, CalibrationTable,
    ChannelFitFailure, ChannelHistory, FitError, HistoryPoint,
};

pub use config::{ConfigError, RetryPolicy, SessionConfig, SessionConfigBuilder};

pub use frame::{Frame, FrameError};

pub use mock_link::MockLink;

pub use serial_link::{LineTransport, SerialLink, SerialLinkError};

pub use sweep::{PointEvent, PointResult, PointWorker, SweepDriver, SweepError};
