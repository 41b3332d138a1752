use async_trait::async_trait;
use std::path::Path;
use tokio_modbus::client::{rtu, Context as ModbusContext};
use tokio_modbus::slave::Slave;
use tokio_serial::SerialStream;

use crate::error::{DeviceError, DeviceResult};
use crate::modbus_session::ModbusConnector;

// --------------------------------------------------------------------------------------------------------------
// Modbus-RTU over a local serial device. One connector per bus; the
// ModbusSession above is what actually serializes access and handles retry.
// --------------------------------------------------------------------------------------------------------------

pub struct RtuConnector {
    pub device_path: String,
    pub baud_rate: u32,
    pub unit_id: u8,
}

#[async_trait]
impl ModbusConnector for RtuConnector {
    async fn connect(&self) -> DeviceResult<ModbusContext> {
        let builder = tokio_serial::new(&self.device_path, self.baud_rate);
        let port = SerialStream::open(&builder).map_err(|e| {
            DeviceError::TransportUnavailable(format!("opening {}: {e}", self.device_path))
        })?;
        Ok(rtu::attach_slave(port, Slave(self.unit_id)))
    }

    fn port_exists(&self) -> bool {
        Path::new(&self.device_path).exists()
    }
}
