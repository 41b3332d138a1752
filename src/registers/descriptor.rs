use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// Register descriptors are loaded verbatim from JSON (see RegisterMap::load).
// Everything here is immutable once parsed - corrections discovered at runtime
// (a register answering on a different function code than declared) live in
// the owning RegisterMap's cache, not on the descriptor itself.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RegisterType {
    U16,
    S16,
    U32,
    S32,
    ASCII,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadWrite {
    RO,
    RW,
    WO,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoder {
    Hhmm,
    HhmmDecimal,
    Bool,
    Ascii,
    MonthDay,
    Second,
}

fn default_rw() -> ReadWrite {
    ReadWrite::RW
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDescriptor {
    pub id: String,
    pub standard_id: Option<String>,
    pub addr: u16,
    pub size: u8,
    pub kind: RegisterKind,
    #[serde(rename = "type")]
    pub value_type: RegisterType,
    pub scale: Option<f64>,
    pub unit: Option<String>,
    pub encoder: Option<Encoder>,
    // JSON object keys are always strings, so enum/bit_enum maps come in as
    // "<int>": "<label>" and are parsed to i64 keys on first use.
    #[serde(rename = "enum")]
    pub enum_map: Option<HashMap<String, String>>,
    pub bit_enum: Option<HashMap<String, String>>,
    pub bitmask: Option<u32>,
    #[serde(rename = "higherBits")]
    pub higher_bits: Option<u32>,
    #[serde(default = "default_rw")]
    pub rw: ReadWrite,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl RegisterDescriptor {
    /// `standard_id` if given, else fall back to the device-local `id`.
    pub fn standard_field(&self) -> &str {
        self.standard_id.as_deref().unwrap_or(&self.id)
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self.rw, ReadWrite::WO)
    }

    pub fn assert_writable(&self) -> DeviceResult<()> {
        if matches!(self.rw, ReadWrite::RO) {
            return Err(DeviceError::RegisterError(format!(
                "register '{}' is read-only",
                self.id
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> DeviceResult<()> {
        if !matches!(self.size, 1 | 2) && !matches!(self.value_type, RegisterType::ASCII) {
            return Err(DeviceError::RegisterError(format!(
                "register '{}' has unsupported size {}",
                self.id, self.size
            )));
        }
        if self.enum_map.is_some() && self.bit_enum.is_some() {
            return Err(DeviceError::RegisterError(format!(
                "register '{}' declares both enum and bit_enum",
                self.id
            )));
        }
        Ok(())
    }

    /// Parsed `enum` map, keys coerced to i64. Invalid keys are skipped rather
    /// than failing the whole map load - a single typo shouldn't brick the adapter.
    pub fn enum_table(&self) -> HashMap<i64, String> {
        self.enum_map
            .as_ref()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| k.parse::<i64>().ok().map(|k| (k, v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bit_enum_table(&self) -> HashMap<u32, String> {
        self.bit_enum
            .as_ref()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| k.parse::<u32>().ok().map(|k| (k, v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn word_count(&self) -> usize {
        match self.value_type {
            RegisterType::ASCII => self.size.max(1) as usize,
            _ => self.size.clamp(1, 2) as usize,
        }
    }
}
