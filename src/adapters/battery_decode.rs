// --------------------------------------------------------------------------------------------------------------
// Little-endian primitive readers shared by the JK-BMS BLE and RS-485
// adapters. Both decode the same family of binary frames at different byte
// offsets; this is just the handful of `buf[i..i+n]` reads both need.
// --------------------------------------------------------------------------------------------------------------

pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(|s| u16::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_i16(buf: &[u8], offset: usize) -> Option<i16> {
    buf.get(offset..offset + 2).map(|s| i16::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    buf.get(offset..offset + 4).map(|s| i32::from_le_bytes(s.try_into().unwrap()))
}

/// Reads an unsigned little-endian integer of `width` bytes (2 or 4) and
/// scales it. Used for the JK-BMS voltage/capacity fields (u32, 1e-3 scale).
pub fn read_f32_scaled_unsigned(buf: &[u8], offset: usize, width: usize, scale: f64) -> Option<f64> {
    match width {
        2 => read_u16(buf, offset).map(|v| v as f64 * scale),
        4 => read_u32(buf, offset).map(|v| v as f64 * scale),
        _ => None,
    }
}

/// Same as above but sign-extended. Used for the JK-BMS current field (s32).
pub fn read_f32_scaled_signed(buf: &[u8], offset: usize, width: usize, scale: f64) -> Option<f64> {
    match width {
        2 => read_i16(buf, offset).map(|v| v as f64 * scale),
        4 => read_i32(buf, offset).map(|v| v as f64 * scale),
        _ => None,
    }
}

/// JK-BMS temperature sentinel: -2000 (raw decidegrees) means "no sensor".
pub fn temp_from_decidegrees(raw: Option<i16>) -> Option<f64> {
    raw.and_then(|r| if r == -2000 { None } else { Some(r as f64 / 10.0) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sentinel_is_filtered() {
        assert_eq!(temp_from_decidegrees(Some(-2000)), None);
        assert_eq!(temp_from_decidegrees(Some(250)), Some(25.0));
    }

    #[test]
    fn scaled_reads_roundtrip() {
        let buf = 1234u32.to_le_bytes();
        assert_eq!(read_f32_scaled_unsigned(&buf, 0, 4, 1e-3), Some(1.234));
    }
}
