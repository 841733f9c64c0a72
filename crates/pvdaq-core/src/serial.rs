//! Serial port abstractions.
//!
//! The engine is written against async byte streams rather than a concrete
//! serial type, so the whole stack runs unmodified against
//! `tokio::io::duplex` pairs in tests and `tokio_serial::SerialStream` in
//! production.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` (real hardware) and
/// `tokio::io::DuplexStream` (tests).
pub trait PortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PortIO for T {}

/// Type-erased boxed serial port.
pub type DynPort = Box<dyn PortIO>;

/// Open a serial port asynchronously using `spawn_blocking`.
///
/// Standard instrument settings are applied: 8N1, no flow control. The open
/// itself is a blocking syscall on most platforms, hence the blocking-task
/// wrapper.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or the blocking task fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    instrument: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let instrument_owned = instrument.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                instrument_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until no more data arrives within `timeout_ms`. Used
/// right after (re)opening a connection so leftover bytes from a previous
/// overrun cannot corrupt the first frame.
///
/// Returns the total number of bytes discarded.
pub async fn drain_port_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}
