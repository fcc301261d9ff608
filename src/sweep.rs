//! Background acquisition of pressure points.
//!
//! A [`PointWorker`] runs the blocking read loop for one pressure point on its
//! own thread and reports back over a channel. [`SweepDriver`] walks a whole
//! sweep, keeping at most one worker alive per buffer.

use crate::acquisition::{AcquisitionBuffer, AcquisitionError};
use crate::calibration::{CalibrationError, CalibrationTable};
use crate::config::ConfigError;
use crate::serial_link::{LineTransport, SerialLink};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Averages of one completed pressure point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    pub index: usize,
    pub pressure: f64,
    pub averages: Vec<f64>,
}

#[derive(Debug)]
pub enum PointEvent {
    Progress { collected: usize, required: usize },
    Completed(PointResult),
    Failed(AcquisitionError),
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("An acquisition is already running on this buffer")]
    AcquisitionInFlight,

    #[error("No acquisition is running")]
    Idle,

    #[error("All {points} calibration points have been taken")]
    SweepComplete { points: usize },

    #[error("Sweep incomplete: {completed} of {required} calibration points taken")]
    SweepIncomplete { completed: usize, required: usize },

    #[error("Acquisition worker stopped without reporting a result")]
    WorkerDisconnected,

    #[error("Failed to start acquisition worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct PointWorker {
    index: usize,
    pressure: f64,
    events: Receiver<PointEvent>,
    handle: JoinHandle<()>,
}

impl PointWorker {
    /// Start collecting one pressure point on a new thread.
    ///
    /// Leftover readings of an earlier, failed attempt are dropped before the
    /// first frame is read.
    pub fn spawn<T: LineTransport + 'static>(
        buffer: Arc<AcquisitionBuffer<T>>,
        index: usize,
        pressure: f64,
    ) -> std::io::Result<Self> {
        let (tx, events) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(format!("ptcal-point-{}", index))
            .spawn(move || {
                let event = match collect_point(&buffer, pressure, &tx) {
                    Ok(averages) => PointEvent::Completed(PointResult {
                        index,
                        pressure,
                        averages,
                    }),
                    Err(e) => {
                        log::warn!("Point {} at {} failed: {}", index, pressure, e);
                        PointEvent::Failed(e)
                    }
                };
                // The driver may have given up on this point already.
                let _ = tx.send(event);
            })?;

        Ok(Self {
            index,
            pressure,
            events,
            handle,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn events(&self) -> &Receiver<PointEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn join(self) {
        if self.handle.join().is_err() {
            log::error!("Acquisition worker for point {} panicked", self.index);
        }
    }
}

fn collect_point<T: LineTransport>(
    buffer: &AcquisitionBuffer<T>,
    pressure: f64,
    tx: &Sender<PointEvent>,
) -> Result<Vec<f64>, AcquisitionError> {
    let required = buffer.required_samples();
    let max_decode_failures = buffer.retry_policy().max_attempts;

    let leftover = buffer.discard_point();
    if leftover > 0 {
        log::debug!("Dropped {} readings left from an earlier attempt", leftover);
    }

    let mut collected = 0;
    let mut decode_failures = 0;
    while collected < required {
        match buffer.read_one_frame(collected == 0) {
            Ok(()) => {
                collected += 1;
                decode_failures = 0;
                let _ = tx.send(PointEvent::Progress {
                    collected,
                    required,
                });
            }
            Err(e) if e.is_recoverable() => {
                decode_failures += 1;
                if decode_failures >= max_decode_failures {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(buffer.commit_average(pressure)?)
}

/// Walks the configured number of pressure points and fits the result.
pub struct SweepDriver<T: LineTransport + 'static = SerialLink> {
    buffer: Arc<AcquisitionBuffer<T>>,
    calibration_points: usize,
    active: Option<PointWorker>,
    results: Vec<PointResult>,
}

impl<T: LineTransport + 'static> SweepDriver<T> {
    pub fn new(
        buffer: Arc<AcquisitionBuffer<T>>,
        calibration_points: usize,
    ) -> Result<Self, SweepError> {
        if buffer.required_samples() == 0 {
            return Err(ConfigError::ZeroSamplesPerPoint.into());
        }
        if calibration_points < 2 {
            return Err(ConfigError::TooFewCalibrationPoints {
                points: calibration_points,
            }
            .into());
        }

        Ok(Self {
            buffer,
            calibration_points,
            active: None,
            results: Vec::new(),
        })
    }

    pub fn buffer(&self) -> &Arc<AcquisitionBuffer<T>> {
        &self.buffer
    }

    /// Start acquiring the next point at `pressure` in the background.
    pub fn begin_point(&mut self, pressure: f64) -> Result<(), SweepError> {
        if self.active.is_some() {
            return Err(SweepError::AcquisitionInFlight);
        }
        if self.is_complete() {
            return Err(SweepError::SweepComplete {
                points: self.calibration_points,
            });
        }

        let index = self.results.len();
        log::debug!(
            "Point {}/{} at pressure {}",
            index + 1,
            self.calibration_points,
            pressure
        );
        self.active = Some(PointWorker::spawn(Arc::clone(&self.buffer), index, pressure)?);
        Ok(())
    }

    /// Non-blocking check for news from the running point.
    ///
    /// A failed point is reported as an error and has to be retaken with
    /// [`begin_point`](Self::begin_point).
    pub fn poll(&mut self) -> Result<Option<PointEvent>, SweepError> {
        let worker = self.active.as_ref().ok_or(SweepError::Idle)?;
        let received = worker.events().try_recv();
        match received {
            Ok(event) => self.handle_event(event).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.finish_worker();
                Err(SweepError::WorkerDisconnected)
            }
        }
    }

    /// Block until the running point completes or fails.
    pub fn wait_point(&mut self) -> Result<PointResult, SweepError> {
        loop {
            let worker = self.active.as_ref().ok_or(SweepError::Idle)?;
            let received = worker.events().recv();
            let Ok(event) = received else {
                self.finish_worker();
                return Err(SweepError::WorkerDisconnected);
            };
            if let PointEvent::Completed(result) = self.handle_event(event)? {
                return Ok(result);
            }
        }
    }

    fn handle_event(&mut self, event: PointEvent) -> Result<PointEvent, SweepError> {
        match event {
            PointEvent::Completed(result) => {
                self.finish_worker();
                self.results.push(result.clone());
                Ok(PointEvent::Completed(result))
            }
            PointEvent::Failed(e) => {
                self.finish_worker();
                self.buffer.discard_point();
                Err(e.into())
            }
            progress @ PointEvent::Progress { .. } => Ok(progress),
        }
    }

    fn finish_worker(&mut self) {
        if let Some(worker) = self.active.take() {
            worker.join();
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.calibration_points
    }

    pub fn points_completed(&self) -> usize {
        self.results.len()
    }

    pub fn remaining_points(&self) -> usize {
        self.calibration_points.saturating_sub(self.results.len())
    }

    pub fn results(&self) -> &[PointResult] {
        &self.results
    }

    /// Fit all channels once every point has been taken.
    pub fn finish(&self) -> Result<CalibrationTable, SweepError> {
        if self.active.is_some() {
            return Err(SweepError::AcquisitionInFlight);
        }
        if !self.is_complete() {
            return Err(SweepError::SweepIncomplete {
                completed: self.results.len(),
                required: self.calibration_points,
            });
        }
        Ok(self.buffer.fit_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, SessionConfig};
    use crate::mock_link::MockLink;
    use std::time::Duration;

    fn driver(link: &MockLink, samples: usize, retry: RetryPolicy) -> SweepDriver<MockLink> {
        let config = SessionConfig::builder("mock", 2)
            .samples_per_point(samples)
            .calibration_points(2)
            .retry(retry)
            .build()
            .unwrap();
        let buffer = Arc::new(AcquisitionBuffer::with_transport(link.clone(), &config));
        SweepDriver::new(buffer, config.calibration_points).unwrap()
    }

    #[test]
    fn test_two_point_sweep() {
        let link = MockLink::with_lines(["1.0, 2.0", "1.0, 2.0", "3.0, 2.0", "3.0, 2.0"]);
        let mut sweep = driver(&link, 2, RetryPolicy::immediate(10));

        sweep.begin_point(0.0).unwrap();
        let first = sweep.wait_point().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.averages, vec![1.0, 2.0]);
        assert!(!sweep.is_acquiring());

        sweep.begin_point(10.0).unwrap();
        let second = sweep.wait_point().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.pressure, 10.0);
        assert!(sweep.is_complete());
        assert_eq!(link.discards(), 2);

        assert!(matches!(
            sweep.begin_point(20.0),
            Err(SweepError::SweepComplete { points: 2 })
        ));

        // The second channel never moves with pressure.
        let table = sweep.finish().unwrap();
        assert!((table.channel(0).unwrap().slope - 0.2).abs() < 1e-12);
        assert!(table.channel(1).unwrap().slope.abs() < 1e-12);
    }

    #[test]
    fn test_one_worker_at_a_time() {
        // An empty script keeps the worker in its backoff sleeps for a while.
        let link = MockLink::new();
        let retry = RetryPolicy::new(10, Duration::from_millis(40), Duration::from_millis(40));
        let mut sweep = driver(&link, 1, retry);

        sweep.begin_point(0.0).unwrap();
        assert!(sweep.is_acquiring());
        assert!(matches!(
            sweep.begin_point(5.0),
            Err(SweepError::AcquisitionInFlight)
        ));
        assert!(matches!(
            sweep.finish(),
            Err(SweepError::AcquisitionInFlight)
        ));

        assert!(matches!(
            sweep.wait_point(),
            Err(SweepError::Acquisition(AcquisitionError::Framing { .. }))
        ));
        assert!(!sweep.is_acquiring());
        assert_eq!(sweep.points_completed(), 0);
    }

    #[test]
    fn test_failed_point_can_be_retaken() {
        let link = MockLink::with_lines(["9.0, 9.0"]);
        link.push_io_failure();
        let mut sweep = driver(&link, 2, RetryPolicy::immediate(3));

        sweep.begin_point(0.0).unwrap();
        assert!(matches!(
            sweep.wait_point(),
            Err(SweepError::Acquisition(AcquisitionError::Transport(_)))
        ));
        assert_eq!(sweep.buffer().buffered_samples(), 0);

        link.push_line("1.0, 1.0");
        link.push_line("3.0, 3.0");
        sweep.begin_point(0.0).unwrap();
        let result = sweep.wait_point().unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.averages, vec![2.0, 2.0]);
    }

    #[test]
    fn test_decode_noise_is_retried_by_the_worker() {
        let link = MockLink::new();
        link.push_line("1.0, x");
        link.push_bytes(&[0xff]);
        link.push_line("4.0, 4.0");
        let mut sweep = driver(&link, 1, RetryPolicy::immediate(3));

        sweep.begin_point(1.0).unwrap();
        assert_eq!(sweep.wait_point().unwrap().averages, vec![4.0, 4.0]);
    }

    #[test]
    fn test_persistent_decode_noise_fails_the_point() {
        let link = MockLink::with_lines(["x, 1.0", "x, 1.0", "x, 1.0", "1.0, 1.0"]);
        let mut sweep = driver(&link, 1, RetryPolicy::immediate(3));

        sweep.begin_point(1.0).unwrap();
        assert!(matches!(
            sweep.wait_point(),
            Err(SweepError::Acquisition(AcquisitionError::FrameDecode(_)))
        ));
        assert_eq!(link.remaining(), 1);
    }

    #[test]
    fn test_poll_reports_progress() {
        let link = MockLink::with_lines(["1.0, 1.0", "1.0, 1.0"]);
        let mut sweep = driver(&link, 2, RetryPolicy::immediate(3));
        assert!(matches!(sweep.poll(), Err(SweepError::Idle)));

        sweep.begin_point(0.0).unwrap();
        let mut progress = Vec::new();
        loop {
            match sweep.poll().unwrap() {
                Some(PointEvent::Progress { collected, required }) => {
                    progress.push((collected, required));
                }
                Some(PointEvent::Completed(result)) => {
                    assert_eq!(result.averages, vec![1.0, 1.0]);
                    break;
                }
                Some(PointEvent::Failed(e)) => unreachable!("unexpected failure: {e}"),
                None => thread::yield_now(),
            }
        }
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_finish_before_sweep_is_done() {
        let link = MockLink::with_lines(["1.0, 1.0"]);
        let mut sweep = driver(&link, 1, RetryPolicy::immediate(3));
        sweep.begin_point(0.0).unwrap();
        sweep.wait_point().unwrap();

        assert!(matches!(
            sweep.finish(),
            Err(SweepError::SweepIncomplete {
                completed: 1,
                required: 2
            })
        ));
        assert_eq!(sweep.remaining_points(), 1);
    }

    #[test]
    fn test_driver_rejects_zero_samples_per_point() {
        let config = SessionConfig::builder("mock", 1)
            .samples_per_point(0)
            .build()
            .unwrap();
        let buffer = Arc::new(AcquisitionBuffer::with_transport(MockLink::new(), &config));
        assert!(matches!(
            SweepDriver::new(buffer, 3),
            Err(SweepError::Config(ConfigError::ZeroSamplesPerPoint))
        ));
    }
}
