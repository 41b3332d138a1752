pub mod battery_decode;
pub mod command;
pub mod common;
pub mod hybrid_inverter;
pub mod hybrid_three_phase;
pub mod iammeter;
pub mod jkbms_ble;
pub mod jkbms_rs485;
pub mod phase_detect;
pub mod pytes;
pub mod split_tou_inverter;
pub mod traits;

pub use command::{Command, CommandResponse};
pub use hybrid_inverter::HybridInverterAdapter;
pub use hybrid_three_phase::HybridThreePhaseAdapter;
pub use iammeter::IamMeterAdapter;
pub use jkbms_ble::JkBmsBleAdapter;
pub use jkbms_rs485::JkBmsRs485Adapter;
pub use pytes::PytesBatteryAdapter;
pub use split_tou_inverter::SplitTouInverterAdapter;
pub use traits::{Adapter, BatteryAdapter, InverterAdapter, MeterAdapter};
