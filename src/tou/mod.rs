pub mod window;

pub use window::{charge_mode_bit, normalize_battery_power, Direction, Target, TouWindow, WindowType};
