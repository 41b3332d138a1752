use async_trait::async_trait;
use serde_json::{Map, Value};

use super::codec::{decode, encode};
use super::descriptor::RegisterKind;
use super::map::RegisterMap;
use crate::error::DeviceResult;

// --------------------------------------------------------------------------------------------------------------
// A thin seam between the register map/codec and whatever is actually on
// the wire. Adapters plug in a `RegisterTransport` (Modbus session + executor
// context bundled together, typically) and get `read_by_ident` /
// `write_by_ident` / `read_all_registers` for free.
// --------------------------------------------------------------------------------------------------------------

#[async_trait]
pub trait RegisterTransport: Send + Sync {
    async fn read_words(&self, kind: RegisterKind, addr: u16, count: u16) -> DeviceResult<Vec<u16>>;
    async fn write_words(&self, addr: u16, words: &[u16]) -> DeviceResult<()>;
}

pub async fn read_by_ident(
    map: &RegisterMap,
    transport: &dyn RegisterTransport,
    id: &str,
) -> DeviceResult<Value> {
    let desc = map.require(id)?;
    let kind = map.effective_kind(id);
    let count = desc.word_count() as u16;

    match transport.read_words(kind, desc.addr, count).await {
        Ok(words) => decode(desc, &words),
        Err(first_err) => {
            // Some devices expose the same address on the other function
            // code. Try once, and if it works, remember the correction.
            let alt_kind = match kind {
                RegisterKind::Holding => RegisterKind::Input,
                RegisterKind::Input => RegisterKind::Holding,
            };
            match transport.read_words(alt_kind, desc.addr, count).await {
                Ok(words) => {
                    map.record_kind_correction(id, alt_kind);
                    decode(desc, &words)
                }
                Err(_) => Err(first_err),
            }
        }
    }
}

pub async fn write_by_ident(
    map: &RegisterMap,
    transport: &dyn RegisterTransport,
    id: &str,
    value: &Value,
) -> DeviceResult<()> {
    let desc = map.require(id)?;
    let words = encode(desc, value)?;
    transport.write_words(desc.addr, &words).await
}

/// Reads every readable register, skipping (and logging) individual
/// failures rather than aborting the whole scan.
pub async fn read_all_registers(map: &RegisterMap, transport: &dyn RegisterTransport) -> Map<String, Value> {
    let mut out = Map::new();
    for reg in map.all().iter().filter(|r| r.is_readable()) {
        match read_by_ident(map, transport, &reg.id).await {
            Ok(value) => {
                out.insert(reg.id.clone(), value);
            }
            Err(e) => {
                log::debug!("register '{}': read failed, skipping: {e}", reg.id);
            }
        }
    }
    out
}

/// Chunked read using `RegisterMap::read_windows`; on a window failure falls
/// back to per-register reads for just that window so one bad gap-fill
/// doesn't sacrifice the whole batch.
pub async fn read_all_registers_chunked(map: &RegisterMap, transport: &dyn RegisterTransport) -> Map<String, Value> {
    let mut out = Map::new();
    for window in map.read_windows() {
        match transport.read_words(window.kind, window.start, window.count).await {
            Ok(words) => {
                for id in &window.register_ids {
                    if let Some(desc) = map.find_by_id(id) {
                        let offset = (desc.addr - window.start) as usize;
                        let word_count = desc.word_count();
                        if offset + word_count <= words.len() {
                            match decode(desc, &words[offset..offset + word_count]) {
                                Ok(v) => {
                                    out.insert(id.clone(), v);
                                }
                                Err(e) => log::debug!("register '{id}': decode failed in chunk: {e}"),
                            }
                        }
                    }
                }
            }
            Err(e) => {
                log::debug!("read window {:?}@{} failed ({e}), falling back to per-register reads", window.kind, window.start);
                for id in &window.register_ids {
                    match read_by_ident(map, transport, id).await {
                        Ok(v) => {
                            out.insert(id.clone(), v);
                        }
                        Err(e) => log::debug!("register '{id}': fallback read failed: {e}"),
                    }
                }
            }
        }
    }
    out
}
