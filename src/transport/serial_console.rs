use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::SerialStream;

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// Line-based ASCII console over serial (Pytes family). One command in
// flight at a time - `query` owns the port for the whole round trip.
// --------------------------------------------------------------------------------------------------------------

pub const TERMINATOR: &str = "Command completed";

pub struct SerialConsole {
    device_path: String,
    baud_rate: u32,
    port: Mutex<Option<BufReader<SerialStream>>>,
}

impl SerialConsole {
    pub fn new(device_path: impl Into<String>, baud_rate: u32) -> Self {
        Self { device_path: device_path.into(), baud_rate, port: Mutex::new(None) }
    }

    async fn ensure_open(&self) -> DeviceResult<()> {
        let mut guard = self.port.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let builder = tokio_serial::new(&self.device_path, self.baud_rate);
        let stream = SerialStream::open(&builder)
            .map_err(|e| DeviceError::TransportUnavailable(format!("opening {}: {e}", self.device_path)))?;
        *guard = Some(BufReader::new(stream));
        Ok(())
    }

    pub async fn close(&self) {
        self.port.lock().await.take();
    }

    /// Sends one line command and collects response lines up to the
    /// `"Command completed"` terminator, or times out.
    pub async fn query(&self, command: &str, deadline: Duration) -> DeviceResult<Vec<String>> {
        self.ensure_open().await?;
        let mut guard = self.port.lock().await;
        let stream = guard.as_mut().expect("just ensured open");

        stream
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("writing command '{command}': {e}")))?;

        let read_lines = async {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                let n = stream
                    .read_line(&mut line)
                    .await
                    .map_err(|e| DeviceError::TransportUnavailable(format!("reading console: {e}")))?;
                if n == 0 {
                    return Err(DeviceError::TransportUnavailable("console closed connection".to_string()));
                }
                let trimmed = line.trim_end().to_string();
                let done = trimmed.contains(TERMINATOR);
                lines.push(trimmed);
                if done {
                    return Ok(lines);
                }
            }
        };

        match timeout(deadline, read_lines).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(deadline)),
        }
    }
}
