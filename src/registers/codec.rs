use serde_json::Value;

use super::descriptor::{Encoder, RegisterDescriptor, RegisterType};
use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// Pure encode/decode. No I/O, no adapter state - every function here takes a
// descriptor and a value and returns a value. Dispatch is on `desc.encoder`
// first, then on `desc.value_type`/`enum_map`/`bit_enum` for the plain
// numeric path. This mirrors the tagged-variant design: the descriptor *is*
// the variant tag, we just never materialised a separate enum for it because
// the fields already carry the information uniquely.
// --------------------------------------------------------------------------------------------------------------

const TRUTHY: &[&str] = &["1", "true", "on", "enable", "enabled"];

fn truthy(s: &str) -> bool {
    TRUTHY.contains(&s.to_ascii_lowercase().as_str())
}

fn value_as_f64(v: &Value, field: &str) -> DeviceResult<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}' value is not a finite number"))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| DeviceError::RegisterError(format!("register '{field}' value '{s}' is not numeric"))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(DeviceError::RegisterError(format!(
            "register '{field}' cannot coerce {other:?} to a number"
        ))),
    }
}

fn value_as_str<'a>(v: &'a Value, field: &str) -> DeviceResult<&'a str> {
    v.as_str()
        .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}' expected a string value")))
}

fn parse_hh_mm(s: &str, field: &str) -> DeviceResult<(u16, u16)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}': '{s}' is not HH:MM")))?;
    let h: u16 = h
        .trim()
        .parse()
        .map_err(|_| DeviceError::RegisterError(format!("register '{field}': bad hour in '{s}'")))?;
    let m: u16 = m
        .trim()
        .parse()
        .map_err(|_| DeviceError::RegisterError(format!("register '{field}': bad minute in '{s}'")))?;
    if h > 23 || m > 59 {
        return Err(DeviceError::RegisterError(format!(
            "register '{field}': '{s}' out of range (H<=23, M<=59)"
        )));
    }
    Ok((h, m))
}

fn parse_month_day(v: &Value, field: &str) -> DeviceResult<(u16, u16)> {
    let (m, d) = match v {
        Value::String(s) => {
            let sep = if s.contains('/') { '/' } else { '-' };
            let (m, d) = s
                .split_once(sep)
                .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}': '{s}' is not MM-DD")))?;
            (
                m.trim()
                    .parse::<u16>()
                    .map_err(|_| DeviceError::RegisterError(format!("register '{field}': bad month in '{s}'")))?,
                d.trim()
                    .parse::<u16>()
                    .map_err(|_| DeviceError::RegisterError(format!("register '{field}': bad day in '{s}'")))?,
            )
        }
        Value::Object(o) => {
            let m = o
                .get("month")
                .and_then(Value::as_u64)
                .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}': missing month")))?;
            let d = o
                .get("day")
                .and_then(Value::as_u64)
                .ok_or_else(|| DeviceError::RegisterError(format!("register '{field}': missing day")))?;
            (m as u16, d as u16)
        }
        other => {
            return Err(DeviceError::RegisterError(format!(
                "register '{field}': cannot parse {other:?} as month/day"
            )))
        }
    };
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return Err(DeviceError::RegisterError(format!(
            "register '{field}': month/day {m}-{d} out of range"
        )));
    }
    Ok((m, d))
}

fn clamp_and_scale_encode(desc: &RegisterDescriptor, mut v: f64) -> f64 {
    if let Some(min) = desc.min {
        v = v.max(min);
    }
    if let Some(max) = desc.max {
        v = v.min(max);
    }
    if let Some(scale) = desc.scale {
        if scale != 0.0 {
            v /= scale;
        }
    }
    v
}

fn pack_words(desc: &RegisterDescriptor, raw: i64) -> Vec<u16> {
    match desc.word_count() {
        1 => vec![(raw as i32 as u32 & 0xFFFF) as u16],
        2 => {
            let bits = raw as i64 as u32;
            vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16]
        }
        n => vec![0u16; n],
    }
}

fn pack_ascii(size: u8, s: &str) -> Vec<u16> {
    let mut bytes: Vec<u8> = s.bytes().collect();
    bytes.push(0); // NUL terminator, then pad
    bytes.resize((size as usize) * 2, 0);
    bytes
        .chunks(2)
        .take(size as usize)
        .map(|c| ((c[0] as u16) << 8) | c[1] as u16)
        .collect()
}

pub fn encode(desc: &RegisterDescriptor, value: &Value) -> DeviceResult<Vec<u16>> {
    desc.validate()?;
    desc.assert_writable()?;

    if let Some(encoder) = desc.encoder {
        return match encoder {
            Encoder::Bool => {
                let word = match value {
                    Value::Bool(b) => *b as u16,
                    Value::String(s) => truthy(s) as u16,
                    Value::Number(n) => (n.as_f64().unwrap_or(0.0) != 0.0) as u16,
                    other => {
                        return Err(DeviceError::RegisterError(format!(
                            "register '{}': cannot encode {other:?} as bool",
                            desc.id
                        )))
                    }
                };
                Ok(vec![word])
            }
            Encoder::Ascii => Ok(pack_ascii(desc.size, value_as_str(value, &desc.id)?)),
            Encoder::Hhmm => {
                let (h, m) = parse_hh_mm(value_as_str(value, &desc.id)?, &desc.id)?;
                Ok(vec![(h << 8) | m])
            }
            Encoder::HhmmDecimal => {
                let (h, m) = parse_hh_mm(value_as_str(value, &desc.id)?, &desc.id)?;
                Ok(vec![h * 100 + m])
            }
            Encoder::MonthDay => {
                let (m, d) = parse_month_day(value, &desc.id)?;
                Ok(vec![(m << 8) | d])
            }
            Encoder::Second => {
                let s = value_as_f64(value, &desc.id)? as u16;
                if s > 59 {
                    return Err(DeviceError::RegisterError(format!(
                        "register '{}': second {s} out of range",
                        desc.id
                    )));
                }
                Ok(vec![s << 8])
            }
        };
    }

    if matches!(desc.value_type, RegisterType::ASCII) {
        return Ok(pack_ascii(desc.size, value_as_str(value, &desc.id)?));
    }

    if let Some(table) = desc.enum_map.as_ref() {
        let _ = table; // enum_table() below does the parsing
        let key = match value {
            Value::String(label) => desc
                .enum_table()
                .into_iter()
                .find(|(_, v)| v == label)
                .map(|(k, _)| k)
                .or_else(|| label.parse::<i64>().ok())
                .ok_or_else(|| {
                    DeviceError::RegisterError(format!("register '{}': unknown enum label '{label}'", desc.id))
                })?,
            other => value_as_f64(other, &desc.id)? as i64,
        };
        return Ok(pack_words(desc, key));
    }

    let numeric = value_as_f64(value, &desc.id)?;
    let scaled = clamp_and_scale_encode(desc, numeric);
    Ok(pack_words(desc, scaled.round() as i64))
}

fn assemble_raw(desc: &RegisterDescriptor, words: &[u16]) -> DeviceResult<u32> {
    match desc.word_count().min(words.len()) {
        0 => Err(DeviceError::RegisterError(format!("register '{}': empty word slice", desc.id))),
        1 => Ok(words[0] as u32),
        _ => Ok(((words[0] as u32) << 16) | words[1] as u32),
    }
}

fn sign_extend(desc: &RegisterDescriptor, raw: u32) -> i64 {
    match desc.value_type {
        RegisterType::S16 => (raw as u16 as i16) as i64,
        RegisterType::S32 => (raw as i32) as i64,
        _ => raw as i64,
    }
}

pub fn decode(desc: &RegisterDescriptor, words: &[u16]) -> DeviceResult<Value> {
    desc.validate()?;

    if matches!(desc.value_type, RegisterType::ASCII) || matches!(desc.encoder, Some(Encoder::Ascii)) {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for w in words {
            bytes.push((w >> 8) as u8);
            bytes.push((w & 0xFF) as u8);
        }
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let text = String::from_utf8_lossy(&bytes[..end]).trim().to_string();
        return Ok(Value::String(text));
    }

    let mut raw = assemble_raw(desc, words)?;
    if let Some(hb) = desc.higher_bits {
        raw >>= hb;
    }
    if let Some(bm) = desc.bitmask {
        raw &= bm;
    }

    if !desc.bit_enum_table().is_empty() {
        let table = desc.bit_enum_table();
        let mut flags: Vec<String> = table
            .iter()
            .filter(|(bit, _)| raw & (1 << **bit) != 0)
            .map(|(_, label)| label.clone())
            .collect();
        flags.sort();
        if flags.is_empty() {
            flags.push("OK".to_string());
        }
        return Ok(Value::Array(flags.into_iter().map(Value::String).collect()));
    }

    if !desc.enum_table().is_empty() {
        let signed = sign_extend(desc, raw);
        let label = desc
            .enum_table()
            .get(&signed)
            .cloned()
            .unwrap_or_else(|| format!("UNKNOWN({signed})"));
        return Ok(Value::String(label));
    }

    if let Some(encoder) = desc.encoder {
        return match encoder {
            Encoder::Hhmm => Ok(Value::String(format!("{:02}:{:02}", (raw >> 8) & 0xFF, raw & 0xFF))),
            Encoder::HhmmDecimal => Ok(Value::String(format!("{:02}:{:02}", raw / 100, raw % 100))),
            Encoder::MonthDay => Ok(Value::String(format!("{:02}-{:02}", (raw >> 8) & 0xFF, raw & 0xFF))),
            Encoder::Second => Ok(Value::Number(((raw >> 8) & 0xFF).into())),
            Encoder::Bool => Ok(Value::Bool(raw != 0)),
            Encoder::Ascii => unreachable!("handled above"),
        };
    }

    let signed = sign_extend(desc, raw);
    let scaled = signed as f64 * desc.scale.unwrap_or(1.0);
    Ok(serde_json::Number::from_f64(scaled).map(Value::Number).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::descriptor::{ReadWrite, RegisterKind};
    use std::collections::HashMap;

    fn base(id: &str, addr: u16, size: u8, ty: RegisterType) -> RegisterDescriptor {
        RegisterDescriptor {
            id: id.to_string(),
            standard_id: None,
            addr,
            size,
            kind: RegisterKind::Holding,
            value_type: ty,
            scale: None,
            unit: None,
            encoder: None,
            enum_map: None,
            bit_enum: None,
            bitmask: None,
            higher_bits: None,
            rw: ReadWrite::RW,
            min: None,
            max: None,
        }
    }

    // S1 - Register encode/decode round trip with a scale.
    #[test]
    fn s1_scaled_round_trip() {
        let mut d = base("batt_voltage_v", 587, 1, RegisterType::U16);
        d.scale = Some(0.01);
        let words = encode(&d, &Value::from(52.48)).unwrap();
        assert_eq!(words, vec![5248]);
        let decoded = decode(&d, &words).unwrap();
        assert!((decoded.as_f64().unwrap() - 52.48).abs() < 0.01);
    }

    // S2 - signed 32-bit grid power.
    #[test]
    fn s2_signed_32bit() {
        let d = base("grid_power_w", 0x0002, 2, RegisterType::S32);
        let decoded = decode(&d, &[0xFFFF, 0xFC18]).unwrap();
        assert_eq!(decoded.as_f64().unwrap() as i64, -1000);
    }

    // S3 - hhmm vs hhmm_decimal dichotomy.
    #[test]
    fn s3_hhmm_dichotomy() {
        let mut hhmm = base("prog_time", 10, 1, RegisterType::U16);
        hhmm.encoder = Some(Encoder::Hhmm);
        let mut decimal = base("prog_time_dec", 11, 1, RegisterType::U16);
        decimal.encoder = Some(Encoder::HhmmDecimal);

        let w1 = encode(&hhmm, &Value::from("23:59")).unwrap();
        let w2 = encode(&decimal, &Value::from("23:59")).unwrap();
        assert_eq!(w1, vec![0x173B]);
        assert_eq!(w2, vec![2359]);
    }

    // S4 - enum decode of an unrecognised value.
    #[test]
    fn s4_unknown_enum() {
        let mut d = base("mode", 20, 1, RegisterType::U16);
        let mut map = HashMap::new();
        map.insert("0".to_string(), "Standby".to_string());
        map.insert("1".to_string(), "Normal".to_string());
        d.enum_map = Some(map);
        let decoded = decode(&d, &[7]).unwrap();
        assert_eq!(decoded.as_str().unwrap(), "UNKNOWN(7)");
    }

    #[test]
    fn enum_round_trip() {
        let mut d = base("mode", 20, 1, RegisterType::U16);
        let mut map = HashMap::new();
        map.insert("0".to_string(), "Standby".to_string());
        map.insert("1".to_string(), "Normal".to_string());
        d.enum_map = Some(map);
        let words = encode(&d, &Value::from("Normal")).unwrap();
        assert_eq!(decode(&d, &words).unwrap().as_str().unwrap(), "Normal");
    }

    #[test]
    fn bit_enum_zero_is_ok() {
        let mut d = base("fault_flags", 30, 1, RegisterType::U16);
        let mut map = HashMap::new();
        map.insert("0".to_string(), "OverVoltage".to_string());
        map.insert("1".to_string(), "UnderVoltage".to_string());
        d.bit_enum = Some(map);
        let decoded = decode(&d, &[0]).unwrap();
        assert_eq!(decoded, Value::Array(vec![Value::String("OK".to_string())]));
    }

    #[test]
    fn read_only_write_rejected() {
        let mut d = base("serial_number", 1, 1, RegisterType::U16);
        d.rw = ReadWrite::RO;
        assert!(encode(&d, &Value::from(1)).is_err());
    }
}
