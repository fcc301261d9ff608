use serialport::SerialPort;
use std::io::Read;
use std::time::{Duration, Instant};

/// How long a single line may take to arrive before the read gives up.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest line accepted when no channel count is known.
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

// Per-byte poll interval of the underlying port.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SerialLinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Timeout error: no line terminator within {timeout:?}, received '{}'",
        String::from_utf8_lossy(partial)
    )]
    Timeout { timeout: Duration, partial: Vec<u8> },

    #[error(
        "Line overrun: no line terminator within {limit} bytes, received '{}'",
        String::from_utf8_lossy(partial)
    )]
    Overrun { limit: usize, partial: Vec<u8> },

    #[error("Serial link is closed")]
    Closed,
}

/// A byte stream that yields newline-terminated lines.
///
/// The acquisition buffer only ever talks to the device through this trait, so a
/// scripted transport can stand in for the real serial port.
///
/// Implementations never hand out the tail of a line whose head was lost. After
/// a flush, a timeout or an overrun the bytes up to the next `\n` are skipped.
pub trait LineTransport: Send {
    /// Drop everything the device sent that has not been read yet.
    fn discard_pending(&mut self) -> Result<(), SerialLinkError>;

    /// Read bytes up to the next `\n`. The terminator (and a preceding `\r`) is
    /// not part of the returned line.
    ///
    /// A line that does not complete in time is reported as
    /// [`SerialLinkError::Timeout`], one that grows past the length limit as
    /// [`SerialLinkError::Overrun`]. Both carry whatever arrived.
    fn read_line(&mut self) -> Result<Vec<u8>, SerialLinkError>;
}

/// Outcome of feeding one byte to a [`LineAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Assembled {
    Pending,
    Line(Vec<u8>),
    Overrun(Vec<u8>),
}

/// Splits a byte stream into lines.
///
/// Once the head of a line is lost, everything up to its terminator is skipped
/// rather than returned as a line of its own.
#[derive(Debug, Clone)]
pub(crate) struct LineAssembler {
    line: Vec<u8>,
    max_len: usize,
    // Inside a line whose start was not seen.
    skipping: bool,
}

impl LineAssembler {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            line: Vec::new(),
            max_len,
            skipping: false,
        }
    }

    pub(crate) fn max_len(&self) -> usize {
        self.max_len
    }

    /// The next bytes may continue a line that was cut off.
    pub(crate) fn resync(&mut self) {
        self.line.clear();
        self.skipping = true;
    }

    pub(crate) fn push(&mut self, byte: u8) -> Assembled {
        if byte == b'\n' {
            let line = std::mem::take(&mut self.line);
            if std::mem::replace(&mut self.skipping, false) {
                log::debug!("Skipped the rest of a cut line");
                return Assembled::Pending;
            }
            return Assembled::Line(trim_line_ending(line));
        }
        if self.skipping {
            return Assembled::Pending;
        }

        self.line.push(byte);
        if self.line.len() > self.max_len {
            self.skipping = true;
            return Assembled::Overrun(std::mem::take(&mut self.line));
        }
        Assembled::Pending
    }

    /// Give up on the line in progress and return what arrived of it.
    pub(crate) fn abandon(&mut self) -> Vec<u8> {
        let partial = std::mem::take(&mut self.line);
        if !partial.is_empty() {
            self.skipping = true;
        }
        partial
    }
}

#[derive(Debug)]
pub struct SerialLink {
    serial: Box<dyn SerialPort>,
    port: String,
    read_timeout: Duration,
    assembler: LineAssembler,
}

impl SerialLink {
    /// Open the sensor's serial port at the given baud rate
    pub fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, SerialLinkError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(POLL_TIMEOUT)
            .open()?;
        log::debug!("Opened serial link on {} at {} baud", port, baud_rate);

        Ok(Self {
            serial,
            port: port.to_string(),
            read_timeout,
            assembler: LineAssembler::new(DEFAULT_MAX_LINE_LEN),
        })
    }

    /// Treat lines longer than `max_line_len` bytes as garbage.
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.assembler = LineAssembler::new(max_line_len);
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn max_line_len(&self) -> usize {
        self.assembler.max_len()
    }
}

impl LineTransport for SerialLink {
    fn discard_pending(&mut self) -> Result<(), SerialLinkError> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        // The flush may land anywhere in a line the board is still sending.
        self.assembler.resync();
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, SerialLinkError> {
        read_line_from(&mut self.serial, &mut self.assembler, self.read_timeout)
    }
}

/// Read one line from a port polled byte by byte, giving up once `timeout` has
/// passed whether or not bytes are still arriving.
fn read_line_from(
    reader: &mut impl Read,
    assembler: &mut LineAssembler,
    timeout: Duration,
) -> Result<Vec<u8>, SerialLinkError> {
    let now = Instant::now();

    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => match assembler.push(byte[0]) {
                Assembled::Pending => {}
                Assembled::Line(line) => return Ok(line),
                Assembled::Overrun(partial) => {
                    return Err(SerialLinkError::Overrun {
                        limit: assembler.max_len(),
                        partial,
                    })
                }
            },
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => {
                assembler.abandon();
                return Err(e.into());
            }
        }

        if now.elapsed() >= timeout {
            return Err(SerialLinkError::Timeout {
                timeout,
                partial: assembler.abandon(),
            });
        }
    }
}

fn is_poll_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

/// Strip a trailing carriage return left by `\r\n` terminated firmware.
pub(crate) fn trim_line_ending(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // Bytes the board has sent so far. Reads past the end poll out like an
    // idle port.
    #[derive(Default)]
    struct Trickle(VecDeque<u8>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                Some(byte) => {
                    buf[0] = byte;
                    Ok(1)
                }
                None => Err(std::io::ErrorKind::TimedOut.into()),
            }
        }
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"1.0, 2.0\r".to_vec()), b"1.0, 2.0".to_vec());
        assert_eq!(trim_line_ending(b"1.0, 2.0".to_vec()), b"1.0, 2.0".to_vec());
        assert!(trim_line_ending(b"\r".to_vec()).is_empty());
    }

    #[test]
    fn test_open_missing_port() {
        let result = SerialLink::open("/dev/ptcal-no-such-port", 115_200, DEFAULT_READ_TIMEOUT);
        assert!(matches!(result, Err(SerialLinkError::SerialPort(_))));
    }

    #[test]
    fn test_timeout_message_shows_partial_line() {
        let error = SerialLinkError::Timeout {
            timeout: Duration::from_secs(2),
            partial: b"0.51, 0.4".to_vec(),
        };
        assert!(error.to_string().contains("'0.51, 0.4'"));
    }

    #[test]
    fn test_lines_split_across_reads() {
        let mut reader = Trickle::default();
        reader.0.extend(b"0.5, 0.6\r\n0.7, 0.8\n");
        let mut assembler = LineAssembler::new(64);

        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"0.5, 0.6".to_vec()
        );
        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"0.7, 0.8".to_vec()
        );
    }

    #[test]
    fn test_rest_of_timed_out_line_is_skipped() {
        let mut reader = Trickle::default();
        reader.0.extend(b"0.");
        let mut assembler = LineAssembler::new(64);

        let err = read_line_from(&mut reader, &mut assembler, SHORT).unwrap_err();
        assert!(matches!(err, SerialLinkError::Timeout { partial, .. } if partial == b"0."));

        reader.0.extend(b"5, 0.6, 0.7\n0.5, 0.6, 0.7\n");
        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"0.5, 0.6, 0.7".to_vec()
        );
    }

    #[test]
    fn test_idle_timeout_keeps_line_alignment() {
        let mut reader = Trickle::default();
        let mut assembler = LineAssembler::new(64);

        let err = read_line_from(&mut reader, &mut assembler, SHORT).unwrap_err();
        assert!(matches!(err, SerialLinkError::Timeout { partial, .. } if partial.is_empty()));

        reader.0.extend(b"1.0, 2.0\n");
        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"1.0, 2.0".to_vec()
        );
    }

    #[test]
    fn test_first_line_after_flush_is_skipped() {
        let mut reader = Trickle::default();
        reader.0.extend(b"9, 0.9\n1.0, 2.0\n");
        let mut assembler = LineAssembler::new(64);
        assembler.resync();

        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"1.0, 2.0".to_vec()
        );
    }

    #[test]
    fn test_endless_line_overruns() {
        let mut assembler = LineAssembler::new(64);
        let err =
            read_line_from(&mut std::io::repeat(b'7'), &mut assembler, DEFAULT_READ_TIMEOUT)
                .unwrap_err();
        match err {
            SerialLinkError::Overrun { limit, partial } => {
                assert_eq!(limit, 64);
                assert_eq!(partial.len(), 65);
            }
            other => unreachable!("unexpected error: {other}"),
        }

        let mut reader = Trickle::default();
        reader.0.extend(b"77\n1.0\n");
        assert_eq!(
            read_line_from(&mut reader, &mut assembler, SHORT).unwrap(),
            b"1.0".to_vec()
        );
    }

    #[test]
    fn test_streaming_bytes_still_time_out() {
        let mut assembler = LineAssembler::new(64);
        assembler.resync();

        let started = Instant::now();
        let err = read_line_from(&mut std::io::repeat(b'7'), &mut assembler, SHORT).unwrap_err();
        assert!(matches!(err, SerialLinkError::Timeout { .. }));
        assert!(started.elapsed() < DEFAULT_READ_TIMEOUT);
    }
}
