use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::descriptor::{RegisterDescriptor, RegisterKind};
use crate::error::{DeviceError, DeviceResult};

// --------------------------------------------------------------------------------------------------------------
// Loads a register map JSON file and indexes it. Search order mirrors the
// source tool's layered lookup so a bare filename like "growatt_hybrid.json"
// resolves the same way whether the binary runs from a checkout, an
// installed package directory, or a systemd working directory:
//
//   1. absolute path, used as-is
//   2. $CARGO_MANIFEST_DIR (stand-in for "project root" once installed)
//   3. current working directory
//   4. the directory the register map file itself says it lives in (here: ./registers)
//   5. up to 5 parent directories of the working directory
// --------------------------------------------------------------------------------------------------------------

pub struct ReadWindow {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
    pub register_ids: Vec<String>,
}

pub struct RegisterMap {
    registers: Vec<RegisterDescriptor>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    // Some devices answer a declared `holding` register on function 4 (input)
    // or vice versa. Discovered at runtime, cached for the lifetime of the map.
    kind_corrections: Mutex<HashMap<String, RegisterKind>>,
}

fn sanitize_name(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn search_candidates(file_name: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let path = Path::new(file_name);

    if path.is_absolute() {
        candidates.push(path.to_path_buf());
        return candidates;
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        candidates.push(Path::new(&manifest_dir).join(file_name));
    }

    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(file_name));
        candidates.push(cwd.join("registers").join(file_name));

        let mut parent = cwd.clone();
        for _ in 0..5 {
            if let Some(p) = parent.parent() {
                candidates.push(p.join(file_name));
                parent = p.to_path_buf();
            } else {
                break;
            }
        }
    }

    candidates
}

impl RegisterMap {
    pub fn load(file_name: &str) -> DeviceResult<Self> {
        let candidates = search_candidates(file_name);
        let data = candidates
            .iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .ok_or_else(|| {
                DeviceError::RegisterError(format!(
                    "register map '{file_name}' not found in any of {} candidate locations",
                    candidates.len()
                ))
            })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> DeviceResult<Self> {
        let registers: Vec<RegisterDescriptor> = serde_json::from_str(data)
            .map_err(|e| DeviceError::RegisterError(format!("invalid register map JSON: {e}")))?;
        Self::from_registers(registers)
    }

    pub fn from_registers(registers: Vec<RegisterDescriptor>) -> DeviceResult<Self> {
        for r in &registers {
            r.validate()?;
        }
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (idx, r) in registers.iter().enumerate() {
            by_id.insert(r.id.clone(), idx);
            by_name.insert(sanitize_name(&r.id), idx);
        }
        Ok(Self {
            registers,
            by_id,
            by_name,
            kind_corrections: Mutex::new(HashMap::new()),
        })
    }

    pub fn all(&self) -> &[RegisterDescriptor] {
        &self.registers
    }

    pub fn find_by_id(&self, id: &str) -> Option<&RegisterDescriptor> {
        self.by_id.get(id).map(|&i| &self.registers[i])
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.by_name.get(&sanitize_name(name)).map(|&i| &self.registers[i])
    }

    pub fn require(&self, id: &str) -> DeviceResult<&RegisterDescriptor> {
        self.find_by_id(id)
            .ok_or_else(|| DeviceError::RegisterError(format!("unknown register id '{id}'")))
    }

    /// The effective Modbus function family for a register, honouring any
    /// runtime correction recorded via `record_kind_correction`.
    pub fn effective_kind(&self, id: &str) -> RegisterKind {
        if let Some(k) = self.kind_corrections.lock().unwrap().get(id) {
            return *k;
        }
        self.find_by_id(id).map(|r| r.kind).unwrap_or(RegisterKind::Holding)
    }

    pub fn record_kind_correction(&self, id: &str, kind: RegisterKind) {
        self.kind_corrections.lock().unwrap().insert(id.to_string(), kind);
        log::debug!("register '{id}': function-code correction recorded -> {kind:?}");
    }

    /// Group readable registers into contiguous read windows (<=20 words,
    /// gaps of <=4 words merged) per kind, for chunked bulk reads.
    pub fn read_windows(&self) -> Vec<ReadWindow> {
        const MAX_WINDOW: u16 = 20;
        const MAX_GAP: u16 = 4;

        let mut by_kind: HashMap<RegisterKind, Vec<(&RegisterDescriptor, u16)>> = HashMap::new();
        for r in self.registers.iter().filter(|r| r.is_readable()) {
            let kind = self.effective_kind(&r.id);
            by_kind.entry(kind).or_default().push((r, r.word_count() as u16));
        }

        let mut windows = Vec::new();
        for (kind, mut entries) in by_kind {
            entries.sort_by_key(|(r, _)| r.addr);
            let mut cur: Option<(u16, u16, Vec<String>)> = None;
            for (r, words) in entries {
                let extend = if let Some((start, count, _)) = &cur {
                    let end = *start + *count;
                    let gap = r.addr.saturating_sub(end);
                    let new_count = r.addr + words - *start;
                    gap <= MAX_GAP && new_count <= MAX_WINDOW
                } else {
                    false
                };

                if extend {
                    let (start, count, ids) = cur.as_mut().unwrap();
                    *count = r.addr + words - *start;
                    ids.push(r.id.clone());
                } else {
                    if let Some((start, count, ids)) = cur.take() {
                        windows.push(ReadWindow { kind, start, count, register_ids: ids });
                    }
                    cur = Some((r.addr, words, vec![r.id.clone()]));
                }
            }
            if let Some((start, count, ids)) = cur {
                windows.push(ReadWindow { kind, start, count, register_ids: ids });
            }
        }
        windows
    }
}
