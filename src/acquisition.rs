use crate::calibration::{fit_all, CalibrationError, CalibrationTable, ChannelHistory};
use crate::config::{RetryPolicy, SessionConfig};
use crate::frame::{max_line_len, Frame, FrameError};
use crate::serial_link::{LineTransport, SerialLink, SerialLinkError};
use polars::prelude::{DataFrame, PolarsError};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("No readings recorded on some channels, sample counts are out of step: {lengths:?}")]
    Ragged { lengths: Vec<usize> },

    #[error("Not ready for averaging: {have} of {required} readings collected")]
    NotReady { have: usize, required: usize },

    #[error("Zero readings per point configured, the average of no samples is undefined")]
    NoSamplesRequired,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Serial link error: {0}")]
    Transport(#[from] SerialLinkError),

    #[error("Unreadable frame: {0}")]
    FrameDecode(FrameError),

    #[error("No well-formed frame after {attempts} attempts, last received '{last_raw}'")]
    Framing { attempts: u32, last_raw: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl AcquisitionError {
    /// Decode noise that a caller may simply retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FrameDecode(_))
    }
}

#[derive(Debug)]
struct SampleState {
    // One sequence per channel, always of equal length.
    raw: Vec<Vec<f64>>,
    history: ChannelHistory,
}

impl SampleState {
    fn uniform_len(&self) -> Result<usize, StateError> {
        let first = self.raw.first().map_or(0, Vec::len);
        if self.raw.iter().any(|samples| samples.len() != first) {
            return Err(StateError::Ragged {
                lengths: self.raw.iter().map(Vec::len).collect(),
            });
        }
        Ok(first)
    }

    fn clear_raw(&mut self) {
        for samples in &mut self.raw {
            samples.clear();
        }
    }
}

/// Collects multi-channel sensor frames from one serial device and turns them
/// into per-pressure-point averages.
///
/// The transport sits behind its own lock, so only one [`read_one_frame`] runs
/// at a time, while status queries such as [`is_ready_for_average`] and
/// [`buffered_samples`] only touch the sample state and never wait on serial
/// I/O. Share the buffer between a worker thread and a display thread with an
/// `Arc`.
///
/// [`read_one_frame`]: AcquisitionBuffer::read_one_frame
/// [`is_ready_for_average`]: AcquisitionBuffer::is_ready_for_average
/// [`buffered_samples`]: AcquisitionBuffer::buffered_samples
#[derive(Debug)]
pub struct AcquisitionBuffer<T: LineTransport = SerialLink> {
    link: Mutex<Option<T>>,
    state: RwLock<SampleState>,
    num_channels: usize,
    required_samples: usize,
    session_name: String,
    channel_names: Vec<String>,
    retry: RetryPolicy,
}

impl AcquisitionBuffer<SerialLink> {
    /// Open the configured serial port and start an empty session
    pub fn open(config: &SessionConfig) -> Result<Self, AcquisitionError> {
        let link = SerialLink::open(&config.port, config.baud_rate, config.read_timeout)?
            .with_max_line_len(max_line_len(config.num_channels));
        Ok(Self::with_transport(link, config))
    }
}

impl<T: LineTransport> AcquisitionBuffer<T> {
    /// Start an empty session reading from an already open transport
    pub fn with_transport(transport: T, config: &SessionConfig) -> Self {
        log::debug!(
            "Session '{}': {} channels, {} readings per point",
            config.session_name,
            config.num_channels,
            config.samples_per_point
        );

        Self {
            link: Mutex::new(Some(transport)),
            state: RwLock::new(SampleState {
                raw: vec![Vec::new(); config.num_channels],
                history: ChannelHistory::new(config.num_channels),
            }),
            num_channels: config.num_channels,
            required_samples: config.samples_per_point,
            session_name: config.session_name.clone(),
            channel_names: config.channel_names.clone(),
            retry: config.retry,
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<T>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SampleState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SampleState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one multi-channel sample from the device.
    ///
    /// With `is_first_of_point` set, anything the device sent before this call
    /// is dropped first, so a line from the previous pressure point cannot be
    /// counted towards the new one. The transport skips the rest of any line
    /// cut by that flush.
    ///
    /// Lines with the wrong number of readings, that time out half way or that
    /// run past the length limit are re-read up to the retry policy's attempt budget, sleeping with a linear
    /// backoff between attempts. Exhausting the budget is a
    /// [`AcquisitionError::Framing`] error. A line that is not valid text or
    /// holds a non-numeric reading is returned as the recoverable
    /// [`AcquisitionError::FrameDecode`] and nothing is recorded.
    ///
    /// Blocks on serial I/O and backoff sleeps; call it from a worker thread.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.session_name))]
    pub fn read_one_frame(&self, is_first_of_point: bool) -> Result<(), AcquisitionError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("read_one_frame"), 0));

        let mut guard = self.link();
        let link = guard.as_mut().ok_or(SerialLinkError::Closed)?;

        if is_first_of_point {
            log::debug!("New pressure point, discarding pending input");
            link.discard_pending()?;
        }

        let max_attempts = self.retry.max_attempts;
        let mut last_raw = String::new();

        for attempt in 1..=max_attempts {
            match link.read_line() {
                Ok(raw) => match Frame::parse(&raw, self.num_channels) {
                    Ok(frame) => {
                        self.push_frame(frame);
                        return Ok(());
                    }
                    Err(e) if e.is_malformed_frame() => {
                        log::warn!("Attempt {}/{}: {}", attempt, max_attempts, e);
                        last_raw = String::from_utf8_lossy(&raw).trim().to_string();
                    }
                    Err(e) => {
                        log::warn!("Error decoding current sequence, continuing: {}", e);
                        return Err(AcquisitionError::FrameDecode(e));
                    }
                },
                Err(
                    SerialLinkError::Timeout { partial, .. }
                    | SerialLinkError::Overrun { partial, .. },
                ) => {
                    log::warn!(
                        "Attempt {}/{}: line cut short after {} bytes",
                        attempt,
                        max_attempts,
                        partial.len()
                    );
                    last_raw = String::from_utf8_lossy(&partial).into_owned();
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < max_attempts {
                thread::sleep(self.retry.backoff_after(attempt));
            }
        }

        Err(AcquisitionError::Framing {
            attempts: max_attempts,
            last_raw,
        })
    }

    fn push_frame(&self, frame: Frame) {
        let mut state = self.write_state();
        for (samples, value) in state.raw.iter_mut().zip(frame.into_values()) {
            samples.push(value);
        }
    }

    /// Whether every channel holds exactly the required number of readings.
    ///
    /// Out of step channels are reported as [`StateError::Ragged`] instead of
    /// being averaged.
    pub fn is_ready_for_average(&self) -> Result<bool, StateError> {
        let have = self.read_state().uniform_len()?;
        Ok(have == self.required_samples)
    }

    /// Average the current point's readings and record them at `pressure`.
    ///
    /// Returns one average per channel, in channel order, and always leaves the
    /// raw buffer empty on success. If more readings than required were
    /// collected only the most recent ones are averaged. Nothing is changed when
    /// the point is not ready.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.session_name))]
    pub fn commit_average(&self, pressure: f64) -> Result<Vec<f64>, StateError> {
        let required = self.required_samples;
        if required == 0 {
            return Err(StateError::NoSamplesRequired);
        }

        let mut state = self.write_state();
        let have = state.uniform_len()?;
        if have < required {
            return Err(StateError::NotReady { have, required });
        }
        if have > required {
            log::warn!(
                "{} readings buffered for {} required, averaging the most recent",
                have,
                required
            );
        }

        let averages: Vec<f64> = state
            .raw
            .iter()
            .map(|samples| mean(&samples[have - required..]))
            .collect();

        state.history.record(pressure, &averages);
        state.clear_raw();

        log::debug!("Committed point at {}: {:?}", pressure, averages);
        Ok(averages)
    }

    /// Drop the readings of the current point so it can be retaken.
    ///
    /// Returns how many frames were dropped.
    pub fn discard_point(&self) -> usize {
        let mut state = self.write_state();
        let dropped = state.raw.iter().map(Vec::len).max().unwrap_or(0);
        state.clear_raw();
        if dropped > 0 {
            log::debug!("Discarded {} readings of the current point", dropped);
        }
        dropped
    }

    /// Frames collected for the current point, for progress display.
    pub fn buffered_samples(&self) -> usize {
        self.read_state().raw.iter().map(Vec::len).min().unwrap_or(0)
    }

    pub fn points_committed(&self) -> usize {
        self.read_state().history.points()
    }

    /// Snapshot of the per-channel (pressure, average) history.
    pub fn all_calibration_data(&self) -> ChannelHistory {
        self.read_state().history.clone()
    }

    /// Fit every channel's history collected so far.
    pub fn fit_all(&self) -> Result<CalibrationTable, CalibrationError> {
        fit_all(&self.read_state().history)
    }

    /// History as a table with one column per named channel.
    pub fn history_frame(&self) -> Result<DataFrame, PolarsError> {
        self.read_state().history.to_dataframe(&self.channel_names)
    }

    /// Release the transport. Later reads fail with [`SerialLinkError::Closed`].
    pub fn close(&self) {
        if self.link().take().is_some() {
            log::debug!("Session '{}': serial link closed", self.session_name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.link().is_some()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn required_samples(&self) -> usize {
        self.required_samples
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}
