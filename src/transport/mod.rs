pub mod ble;
pub mod modbus_rtu;
pub mod modbus_tcp;
pub mod raw_bus;
pub mod serial_console;

pub use ble::BleLink;
pub use modbus_rtu::RtuConnector;
pub use modbus_tcp::TcpConnector;
pub use raw_bus::RawBusConnection;
pub use serial_console::SerialConsole;
