use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_modbus::client::{tcp, Context as ModbusContext};
use tokio_modbus::slave::Slave;

use crate::error::{DeviceError, DeviceResult};
use crate::modbus_session::ModbusConnector;

// --------------------------------------------------------------------------------------------------------------
// Modbus-TCP to a gateway or native-TCP inverter/meter.
// --------------------------------------------------------------------------------------------------------------

pub struct TcpConnector {
    pub addr: SocketAddr,
    pub unit_id: u8,
}

#[async_trait]
impl ModbusConnector for TcpConnector {
    async fn connect(&self) -> DeviceResult<ModbusContext> {
        tcp::connect_slave(self.addr, Slave(self.unit_id))
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("connecting to {}: {e}", self.addr)))
    }

    // Nothing useful to stat locally for a TCP peer; connection attempts
    // themselves are the only real liveness signal.
    fn port_exists(&self) -> bool {
        true
    }
}
