//! Transport abstraction
//!
//! The driver core never talks to `serialport` directly; everything goes
//! through [`LinkTransport`] so the protocol machinery can run over a real
//! port, a test double, or some future bridge transport.

use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte-level access to one Meridian channel.
///
/// The read engine holds one clone for receiving while command dispatch and
/// recovery share another for writes and line control, so implementations
/// must support `try_clone` with both handles talking to the same channel.
pub trait LinkTransport: Read + Write + Send {
    /// Set the blocking-read timeout
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard anything buffered in both directions
    fn purge(&mut self) -> io::Result<()>;

    /// Number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Clone the handle; both handles address the same channel
    fn try_clone(&self) -> io::Result<Box<dyn LinkTransport>>;

    /// Change the channel speed
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;

    /// Hold the line in break condition for `duration`.
    ///
    /// On a Meridian ring this drops every node back to the base rate and
    /// is the first step of connectivity recovery.
    fn send_break(&mut self, duration: Duration) -> io::Result<()>;

    /// Drive the DTR line
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Drive the RTS line
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
}
