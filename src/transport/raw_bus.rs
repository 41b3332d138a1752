use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_serial::SerialStream;

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// A read-only byte source for passive bus sniffing: either a TCP socket to an
// RS-485 gateway, or a directly-attached serial port. Both sides just need
// "give me up to 4 KiB whenever it shows up".
// --------------------------------------------------------------------------------------------------------------

pub enum RawBusConnection {
    Tcp(TcpStream),
    Serial(SerialStream),
}

impl RawBusConnection {
    pub async fn connect_tcp(addr: SocketAddr) -> DeviceResult<Self> {
        TcpStream::connect(addr)
            .await
            .map(RawBusConnection::Tcp)
            .map_err(|e| DeviceError::TransportUnavailable(format!("connecting to gateway {addr}: {e}")))
    }

    pub fn open_serial(device_path: &str, baud_rate: u32) -> DeviceResult<Self> {
        let builder = tokio_serial::new(device_path, baud_rate);
        SerialStream::open(&builder)
            .map(RawBusConnection::Serial)
            .map_err(|e| DeviceError::TransportUnavailable(format!("opening {device_path}: {e}")))
    }

    /// Reads whatever is available, up to 4 KiB. Returns an empty vec on EOF
    /// only for TCP (a closed gateway socket); a serial port read returning 0
    /// bytes is treated the same way by the caller's listener loop.
    pub async fn read_chunk(&mut self) -> DeviceResult<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        let n = match self {
            RawBusConnection::Tcp(s) => s.read(&mut buf).await,
            RawBusConnection::Serial(s) => s.read(&mut buf).await,
        }
        .map_err(|e| DeviceError::TransportUnavailable(format!("reading bus: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }
}
