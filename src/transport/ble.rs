use std::time::Duration;

use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::{Stream, StreamExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// One GATT link to a JK-BMS-family pack: a write characteristic for outgoing
// command frames and a notify characteristic for incoming data. The BLE host
// stack serializes scan/connect per adapter, not per link - that discipline
// lives one level up, in the multi-pack adapter.
// --------------------------------------------------------------------------------------------------------------

/// Preferred notify characteristic handle on these BMS boards; most firmware
/// exposes the data characteristic here. Not all stacks surface raw GATT
/// handles through btleplug, so this is a best-effort preference only - the
/// fallback is "any characteristic on the vendor service with NOTIFY set".
const PREFERRED_NOTIFY_HANDLE_HINT: u16 = 0x0005;

pub struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
}

impl BleLink {
    /// Connects, discovers services, and picks write/notify characteristics.
    /// Does not retry `InProgress` errors from the host BLE stack - the
    /// caller (bank adapter) is responsible for spacing out pack connects.
    pub async fn connect(peripheral: Peripheral, connect_timeout: Duration) -> DeviceResult<Self> {
        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| DeviceError::Timeout(connect_timeout))?
            .map_err(|e| DeviceError::TransportUnavailable(format!("BLE connect: {e}")))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("BLE service discovery: {e}")))?;

        let chars = peripheral.characteristics();

        let write_char = chars
            .iter()
            .find(|c| c.properties.contains(CharPropFlags::WRITE) || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE))
            .cloned()
            .ok_or_else(|| DeviceError::ProtocolError("no writable characteristic found".to_string()))?;

        let notify_char = chars
            .iter()
            .find(|c| hint_matches_handle(&c.uuid, PREFERRED_NOTIFY_HANDLE_HINT))
            .or_else(|| chars.iter().find(|c| c.properties.contains(CharPropFlags::NOTIFY)))
            .cloned()
            .ok_or_else(|| DeviceError::ProtocolError("no notify characteristic found".to_string()))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("BLE subscribe: {e}")))?;

        Ok(Self { peripheral, write_char, notify_char })
    }

    pub async fn write_command(&self, bytes: &[u8]) -> DeviceResult<()> {
        self.peripheral
            .write(&self.write_char, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("BLE write: {e}")))
    }

    pub async fn notifications(&self) -> DeviceResult<impl Stream<Item = Vec<u8>>> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| DeviceError::TransportUnavailable(format!("BLE notification stream: {e}")))?;
        let notify_uuid = self.notify_char.uuid;
        Ok(stream.filter_map(move |n| {
            let matches = n.uuid == notify_uuid;
            async move { if matches { Some(n.value) } else { None } }
        }))
    }

    pub async fn disconnect(&self) {
        let _ = self.peripheral.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        // btleplug exposes this only via an async call; callers that need a
        // definite answer should await `peripheral.is_connected()` directly.
        true
    }
}

fn hint_matches_handle(uuid: &Uuid, hint: u16) -> bool {
    // Standard-derived 16-bit BLE UUIDs embed their short form in the first
    // two bytes of the 128-bit value; this is the closest a portable check
    // gets to "prefer handle 0x05" without platform-specific GATT handle access.
    let bytes = uuid.as_bytes();
    u16::from_be_bytes([bytes[2], bytes[3]]) == hint
}
