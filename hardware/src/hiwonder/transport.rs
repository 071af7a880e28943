//! Byte transport for the servo bus.
//!
//! A [`Transport`] moves whole frames on and off the wire. [`SerialTransport`]
//! drives a USB-serial adapter through the `serialport` crate; the simulated
//! bus in [`super::sim`] implements the same trait in-process.
//!
//! [`LinkSession`] wraps a transport with its negotiated parameters and owns
//! link-health escalation: three consecutive read timeouts, or any OS-level
//! I/O error, mark the session failed. A failed session refuses further use
//! and must be replaced by opening a new one.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use super::protocol::{HEADER, MAX_LENGTH, MIN_LENGTH};

/// Default bus baud rate for the HX-35.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-exchange reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive timeouts after which the link is declared unavailable.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Errors raised by a transport or link session.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port could not be opened, or the session has failed and needs a reconnect.
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),

    /// No complete frame arrived before the timeout.
    #[error("timeout waiting for reply")]
    Timeout,

    /// OS-level I/O failure on the handle.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Frame-level access to a servo bus.
pub trait Transport: Send {
    /// Write one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()>;

    /// Read one frame, synchronizing on the header.
    ///
    /// Returns whatever the `Length` byte describes; structural validation is
    /// left to the codec.
    fn read_frame(&mut self, timeout: Duration) -> TransportResult<Vec<u8>>;

    /// Drop any unread input.
    fn clear_input(&mut self) -> TransportResult<()>;

    /// Release the underlying handle.
    fn close(&mut self) {}
}

/// Parameters a link session was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl LinkParams {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// USB-serial transport.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Open the serial port described by `params`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LinkUnavailable`] if the port cannot be opened.
    pub fn open(params: &LinkParams) -> TransportResult<Self> {
        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(params.timeout)
            .open()
            .map_err(|e| {
                TransportError::LinkUnavailable(format!("failed to open {}: {e}", params.port))
            })?;

        debug!(
            "Opened servo bus on {} at {} baud",
            params.port, params.baud_rate
        );
        Ok(Self { port })
    }

    fn read_byte(&mut self, deadline: Instant) -> TransportResult<u8> {
        let mut buf = [0u8; 1];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            self.port
                .set_timeout(remaining)
                .map_err(|e| TransportError::Io(e.into()))?;

            match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(_) => return Ok(buf[0]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        read_frame_with(|| self.read_byte(deadline))
    }

    fn clear_input(&mut self) -> TransportResult<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.into()))
    }
}

/// Assemble a frame from a byte source.
///
/// Skips bytes until two consecutive header bytes are seen, then reads the
/// ID and length bytes and the `length - 1` bytes that follow. A length byte
/// outside the protocol's range ends the frame early so the codec can reject
/// it instead of this reader blocking on bytes that will never come.
pub fn read_frame_with<F>(mut next_byte: F) -> TransportResult<Vec<u8>>
where
    F: FnMut() -> TransportResult<u8>,
{
    let mut previous = next_byte()?;
    loop {
        let current = next_byte()?;
        if previous == HEADER[0] && current == HEADER[1] {
            break;
        }
        previous = current;
    }

    let mut frame = HEADER.to_vec();
    let id = next_byte()?;
    let length = next_byte()?;
    frame.push(id);
    frame.push(length);

    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return Ok(frame);
    }

    for _ in 0..(length - 1) {
        frame.push(next_byte()?);
    }
    Ok(frame)
}

/// Open transport plus its parameters and link-health bookkeeping.
pub struct LinkSession {
    transport: Box<dyn Transport>,
    params: LinkParams,
    consecutive_timeouts: u32,
    failure: Option<String>,
}

impl LinkSession {
    /// Wrap an already opened transport.
    pub fn new(transport: Box<dyn Transport>, params: LinkParams) -> Self {
        Self {
            transport,
            params,
            consecutive_timeouts: 0,
            failure: None,
        }
    }

    /// Open a serial link.
    pub fn open_serial(params: LinkParams) -> TransportResult<Self> {
        let transport = SerialTransport::open(&params)?;
        Ok(Self::new(Box::new(transport), params))
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    /// Whether the session has escalated to a fatal failure.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Reason the session failed, if it has.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    fn check_usable(&self) -> TransportResult<()> {
        match &self.failure {
            Some(reason) => Err(TransportError::LinkUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, reason: String) -> TransportError {
        error!("Servo bus link failed: {}", reason);
        self.failure = Some(reason.clone());
        TransportError::LinkUnavailable(reason)
    }

    /// Write a frame. Any I/O error is fatal for the session.
    pub fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        self.check_usable()?;
        trace!("bus tx: {:02X?}", frame);
        match self.transport.write_frame(frame) {
            Ok(()) => Ok(()),
            Err(TransportError::Timeout) => Err(self.fail("write timed out".to_string())),
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Read a frame using the session timeout.
    ///
    /// A timeout is returned as [`TransportError::Timeout`] until the third in
    /// a row, which escalates to [`TransportError::LinkUnavailable`].
    pub fn read_frame(&mut self) -> TransportResult<Vec<u8>> {
        self.check_usable()?;
        match self.transport.read_frame(self.params.timeout) {
            Ok(frame) => {
                self.consecutive_timeouts = 0;
                trace!("bus rx: {:02X?}", frame);
                Ok(frame)
            }
            Err(TransportError::Timeout) => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    Err(self.fail(format!(
                        "{} consecutive read timeouts",
                        self.consecutive_timeouts
                    )))
                } else {
                    warn!(
                        "Servo bus read timeout ({}/{})",
                        self.consecutive_timeouts, MAX_CONSECUTIVE_TIMEOUTS
                    );
                    Err(TransportError::Timeout)
                }
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Write a frame and wait for one reply, where silence is an expected
    /// answer. Used by bus scans and background telemetry; a timeout here
    /// does not count toward escalation.
    pub fn probe(&mut self, frame: &[u8]) -> TransportResult<Option<Vec<u8>>> {
        self.write_frame(frame)?;
        match self.transport.read_frame(self.params.timeout) {
            Ok(reply) => {
                self.consecutive_timeouts = 0;
                Ok(Some(reply))
            }
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Discard unread input after a bad reply.
    pub fn clear_input(&mut self) -> TransportResult<()> {
        self.check_usable()?;
        self.transport
            .clear_input()
            .map_err(|e| self.fail(e.to_string()))
    }

    /// Close the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
        debug!("Closed servo bus on {}", self.params.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn source(bytes: &[u8]) -> impl FnMut() -> TransportResult<u8> {
        let mut queue: VecDeque<u8> = bytes.iter().copied().collect();
        move || queue.pop_front().ok_or(TransportError::Timeout)
    }

    #[test]
    fn test_read_frame_skips_leading_noise() {
        let bytes = [0x00, 0x55, 0x12, 0x55, 0x55, 0x01, 0x05, 0x1C, 0xF4, 0x01, 0xE8];
        let frame = read_frame_with(source(&bytes)).unwrap();
        assert_eq!(frame, &bytes[3..]);
    }

    #[test]
    fn test_read_frame_stops_on_bad_length() {
        let bytes = [0x55, 0x55, 0x01, 0xF0, 0x00, 0x00];
        let frame = read_frame_with(source(&bytes)).unwrap();
        assert_eq!(frame, vec![0x55, 0x55, 0x01, 0xF0]);
    }

    #[test]
    fn test_read_frame_times_out_on_truncated_frame() {
        let bytes = [0x55, 0x55, 0x01, 0x05, 0x1C];
        assert!(matches!(
            read_frame_with(source(&bytes)),
            Err(TransportError::Timeout)
        ));
    }

    struct SilentTransport;

    impl Transport for SilentTransport {
        fn write_frame(&mut self, _frame: &[u8]) -> TransportResult<()> {
            Ok(())
        }

        fn read_frame(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
            Err(TransportError::Timeout)
        }

        fn clear_input(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_third_timeout_escalates() {
        let mut link = LinkSession::new(
            Box::new(SilentTransport),
            LinkParams::new("test"),
        );

        assert!(matches!(link.read_frame(), Err(TransportError::Timeout)));
        assert!(matches!(link.read_frame(), Err(TransportError::Timeout)));
        assert!(matches!(
            link.read_frame(),
            Err(TransportError::LinkUnavailable(_))
        ));
        assert!(link.is_failed());

        // A failed session refuses writes as well
        assert!(matches!(
            link.write_frame(&[0x55]),
            Err(TransportError::LinkUnavailable(_))
        ));
    }

    #[test]
    fn test_unanswered_scan_read_does_not_escalate() {
        let mut link = LinkSession::new(
            Box::new(SilentTransport),
            LinkParams::new("test"),
        );
        for _ in 0..5 {
            assert!(link.probe(&[0x55, 0x55]).unwrap().is_none());
        }
        assert!(!link.is_failed());
        assert_eq!(link.consecutive_timeouts(), 0);
    }

    struct BrokenPipe;

    impl Transport for BrokenPipe {
        fn write_frame(&mut self, _frame: &[u8]) -> TransportResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged").into())
        }

        fn read_frame(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
            Err(TransportError::Timeout)
        }

        fn clear_input(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_io_error_is_fatal() {
        let mut link = LinkSession::new(Box::new(BrokenPipe), LinkParams::new("test"));
        assert!(matches!(
            link.write_frame(&[0x55, 0x55]),
            Err(TransportError::LinkUnavailable(_))
        ));
        assert!(link.is_failed());
    }

    #[test]
    fn test_link_params_builder() {
        let params = LinkParams::new("/dev/ttyUSB0")
            .with_baud_rate(57_600)
            .with_timeout(Duration::from_millis(50));
        assert_eq!(params.baud_rate, 57_600);
        assert_eq!(params.timeout, Duration::from_millis(50));
    }
}
