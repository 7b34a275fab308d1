//! Serial transport abstractions.
//!
//! The driver never names a concrete port type: everything downstream works
//! against [`DynSerial`], a type-erased async byte stream. Real hardware
//! comes in through `tokio_serial::SerialStream` (behind the
//! `serial-hardware` feature); tests substitute `tokio::io::duplex` halves.
//!
//! [`PortProvider`] is the seam for discovery: it enumerates candidate
//! endpoint names and opens them. Production uses [`SystemPorts`]; tests
//! inject scripted providers.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::LinkError;

/// Trait alias for async serial port I/O.
///
/// Any `AsyncRead + AsyncWrite + Unpin + Send` type qualifies, which covers
/// `tokio_serial::SerialStream` for hardware and `tokio::io::DuplexStream`
/// for tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Source of candidate serial endpoints.
///
/// Implementations must be cheap to call repeatedly: discovery re-enumerates
/// on every pass.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Endpoint names currently present on the host, in a stable order.
    fn list_ports(&self) -> Vec<String>;

    /// Open an endpoint for duplex traffic at the given baud rate.
    async fn open(&self, port: &str, baud_rate: u32) -> Result<DynSerial, LinkError>;
}

/// Port provider backed by the host's real serial devices.
#[cfg(feature = "serial-hardware")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

#[cfg(feature = "serial-hardware")]
#[async_trait]
impl PortProvider for SystemPorts {
    fn list_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "serial port enumeration failed");
                Vec::new()
            }
        }
    }

    async fn open(&self, port: &str, baud_rate: u32) -> Result<DynSerial, LinkError> {
        let stream = open_serial_async(port, baud_rate).await?;
        Ok(Box::new(stream))
    }
}

/// Open a serial port without blocking the async runtime.
///
/// Standard settings are applied: 8N1, no flow control. The open itself
/// runs on the blocking pool because some platforms stall in the OS call.
#[cfg(feature = "serial-hardware")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> Result<tokio_serial::SerialStream, LinkError> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::PortOpen {
                port: path.clone(),
                source: e.into(),
            })
    })
    .await
    .map_err(|e| LinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Drain whatever the port has buffered within `window`, returning the
/// collected bytes.
///
/// Used by the handshake probe: after the settle period the device's whole
/// reply is sitting in the OS buffer, so a short window suffices. Reads stop
/// at the first sign of silence, EOF or I/O error; the caller treats the
/// bytes gathered so far as the complete response.
pub async fn read_buffered<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    collected
}
