// Byte streams of an established TCP connection (wasi:io/streams)
//
// A successful connect or accept hands out one `InputStream` and one
// `OutputStream`. Both share a `StreamControl` with the socket they came
// from so that `shutdown` on the socket is observed by the streams even
// though the caller owns them.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::loopback::SharedPipe;

#[cfg(all(feature = "std", unix))]
use crate::os;

/// Write budget reported by streams that buffer internally.
pub const MAX_WRITE_BUDGET: u64 = 64 * 1024;

/// Stream-level error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// End of stream: no more data will be delivered or accepted.
    Closed,
    /// The last read or write failed.
    LastOperationFailed(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closed => f.write_str("stream closed"),
            StreamError::LastOperationFailed(msg) => write!(f, "last operation failed: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StreamError {}

// ---------------------------------------------------------------------------
// Shutdown flags shared between a socket and its streams
// ---------------------------------------------------------------------------

bitflags! {
    /// Directions of a connection that have been shut down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownFlags: u8 {
        const RECEIVE = 1 << 0;
        const SEND = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StreamControl(Arc<AtomicU8>);

impl StreamControl {
    pub(crate) fn new() -> Self {
        StreamControl(Arc::new(AtomicU8::new(0)))
    }

    pub(crate) fn shut(&self, flags: ShutdownFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn flags(&self) -> ShutdownFlags {
        ShutdownFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    fn is_shut(&self, flag: ShutdownFlags) -> bool {
        self.flags().contains(flag)
    }
}

// ---------------------------------------------------------------------------
// InputStream
// ---------------------------------------------------------------------------

pub(crate) enum InputSource {
    /// Reads from an in-memory loopback pipe.
    Loopback(SharedPipe),
    /// Reads from an OS socket.
    #[cfg(all(feature = "std", unix))]
    Os(Arc<socket2::Socket>),
}

/// The receiving half of a TCP connection.
pub struct InputStream {
    control: StreamControl,
    source: InputSource,
}

impl InputStream {
    pub(crate) fn new(control: StreamControl, source: InputSource) -> Self {
        Self { control, source }
    }

    /// Read up to `len` bytes.
    ///
    /// Returns an empty buffer when no data has arrived yet and
    /// [`StreamError::Closed`] once the stream has ended.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>, StreamError> {
        if self.control.is_shut(ShutdownFlags::RECEIVE) {
            return Err(StreamError::Closed);
        }
        match &self.source {
            InputSource::Loopback(pipe) => pipe.lock().read(len),
            #[cfg(all(feature = "std", unix))]
            InputSource::Os(socket) => os::read(socket, len),
        }
    }

    /// Skip up to `len` bytes without copying them out.
    pub fn skip(&mut self, len: usize) -> Result<u64, StreamError> {
        if self.control.is_shut(ShutdownFlags::RECEIVE) {
            return Err(StreamError::Closed);
        }
        match &self.source {
            InputSource::Loopback(pipe) => pipe.lock().skip(len),
            #[cfg(all(feature = "std", unix))]
            InputSource::Os(socket) => os::read(socket, len).map(|data| data.len() as u64),
        }
    }

    /// Whether a `read` would return data or end-of-stream right now.
    pub fn is_ready(&self) -> bool {
        if self.control.is_shut(ShutdownFlags::RECEIVE) {
            return true;
        }
        match &self.source {
            InputSource::Loopback(pipe) => pipe.lock().is_readable(),
            #[cfg(all(feature = "std", unix))]
            InputSource::Os(socket) => os::poll_fd(socket, libc::POLLIN, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputStream
// ---------------------------------------------------------------------------

pub(crate) enum OutputSink {
    /// Writes into an in-memory loopback pipe.
    Loopback(SharedPipe),
    /// Writes to an OS socket; bytes the kernel did not take yet are
    /// kept in `pending` and pushed out by later calls.
    #[cfg(all(feature = "std", unix))]
    Os {
        socket: Arc<socket2::Socket>,
        pending: Vec<u8>,
    },
}

/// The sending half of a TCP connection.
pub struct OutputStream {
    control: StreamControl,
    sink: OutputSink,
}

impl OutputStream {
    pub(crate) fn new(control: StreamControl, sink: OutputSink) -> Self {
        Self { control, sink }
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.control.is_shut(ShutdownFlags::SEND) {
            return Err(StreamError::LastOperationFailed(String::from(
                "socket is shut down for sending",
            )));
        }
        Ok(())
    }

    /// How many bytes may be passed to the next `write`.
    ///
    /// Zero means the caller has to wait before writing again.
    pub fn check_write(&mut self) -> Result<u64, StreamError> {
        self.check_open()?;
        match &mut self.sink {
            OutputSink::Loopback(pipe) => pipe.lock().space().map(|n| n as u64),
            #[cfg(all(feature = "std", unix))]
            OutputSink::Os { socket, pending } => {
                os::drain(socket, pending)?;
                Ok(if pending.is_empty() { MAX_WRITE_BUDGET } else { 0 })
            }
        }
    }

    /// Write bytes without blocking.
    ///
    /// `bytes` must not exceed what `check_write` last permitted.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.check_open()?;
        match &mut self.sink {
            OutputSink::Loopback(pipe) => pipe.lock().write(bytes),
            #[cfg(all(feature = "std", unix))]
            OutputSink::Os { socket, pending } => {
                if pending.len() + bytes.len() > MAX_WRITE_BUDGET as usize {
                    return Err(StreamError::LastOperationFailed(String::from(
                        "write exceeds permitted budget",
                    )));
                }
                pending.extend_from_slice(bytes);
                os::drain(socket, pending)
            }
        }
    }

    /// Push out anything buffered.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        match &mut self.sink {
            OutputSink::Loopback(_) => Ok(()),
            #[cfg(all(feature = "std", unix))]
            OutputSink::Os { socket, pending } => os::drain(socket, pending),
        }
    }

    /// Whether `check_write` would currently permit a non-empty write.
    pub fn is_ready(&mut self) -> bool {
        !matches!(self.check_write(), Ok(0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
