//! Stage parameter plumbing.
//!
//! Each stage keeps a strongly-typed parameter struct internally and projects
//! it to a flat [`ParameterSet`] — (category, name, description, typed value)
//! — for the external configuration collaborator. Parameter files are
//! sectioned key/value text, UTF-16LE on disk, one file per stage named
//! `<Stage>Parameter_<CameraModel>.ini`. A missing file is created from the
//! stage defaults.
//!
//! [`ParamCell`] carries pending parameter updates across threads: the API
//! side stores a new struct and raises a dirty flag, the worker observes and
//! clears it at the top of the next stage invocation.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A typed parameter value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParameterValue {
    /// 32-bit integer.
    Int(i32),
    /// Single-precision float.
    Float(f32),
    /// Double-precision float.
    Double(f64),
}

impl ParameterValue {
    /// Integer view (floats are truncated).
    pub fn as_i32(self) -> i32 {
        match self {
            ParameterValue::Int(v) => v,
            ParameterValue::Float(v) => v as i32,
            ParameterValue::Double(v) => v as i32,
        }
    }

    /// Double view.
    pub fn as_f64(self) -> f64 {
        match self {
            ParameterValue::Int(v) => f64::from(v),
            ParameterValue::Float(v) => f64::from(v),
            ParameterValue::Double(v) => v,
        }
    }
}

/// One entry of a stage's flat parameter view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterEntry {
    /// Grouping, e.g. `Matching`.
    pub category: String,
    /// Key, e.g. `crstthr`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Current value.
    pub value: ParameterValue,
}

/// Flat, typed key/value view of a stage's tunables.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Entries in stage-defined order.
    pub entries: Vec<ParameterEntry>,
}

impl ParameterSet {
    /// Append an integer entry.
    pub fn push_int(&mut self, value: i32, name: &str, category: &str, description: &str) {
        self.entries.push(ParameterEntry {
            category: category.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            value: ParameterValue::Int(value),
        });
    }

    /// Append a float entry.
    pub fn push_float(&mut self, value: f32, name: &str, category: &str, description: &str) {
        self.entries.push(ParameterEntry {
            category: category.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            value: ParameterValue::Float(value),
        });
    }

    /// Append a double entry.
    pub fn push_double(&mut self, value: f64, name: &str, category: &str, description: &str) {
        self.entries.push(ParameterEntry {
            category: category.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            value: ParameterValue::Double(value),
        });
    }

    /// Look up an entry by category and name.
    pub fn get(&self, category: &str, name: &str) -> Option<&ParameterEntry> {
        self.entries
            .iter()
            .find(|e| e.category == category && e.name == name)
    }

    /// Replace the value of an existing entry.
    pub fn set(&mut self, category: &str, name: &str, value: ParameterValue) -> bool {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.category == category && e.name == name)
        {
            entry.value = value;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Ini files
// ============================================================================

/// A sectioned key/value parameter file, UTF-16LE on disk.
///
/// Section and insertion order are preserved so saved files stay diffable.
#[derive(Clone, Debug, Default)]
pub struct IniFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniFile {
    /// Parse a file. UTF-16 (either endianness, BOM required) and UTF-8 are
    /// accepted; files are written back as UTF-16LE.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read parameter file {}", path.display()))?;
        let text = decode_text(&bytes)
            .with_context(|| format!("failed to decode parameter file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Parse ini text.
    pub fn parse(text: &str) -> Self {
        let mut ini = IniFile::default();
        let mut current: Option<usize> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                ini.sections.push((name.trim().to_string(), Vec::new()));
                current = Some(ini.sections.len() - 1);
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if let Some(idx) = current {
                    ini.sections[idx]
                        .1
                        .push((key.trim().to_string(), value.trim().to_string()));
                }
            }
        }
        ini
    }

    /// Write the file as UTF-16LE with BOM and CRLF line endings.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for (section, entries) in &self.sections {
            let _ = writeln!(text, "[{section}]\r");
            for (key, value) in entries {
                let _ = writeln!(text, "{key}={value}\r");
            }
            text.push_str("\r\n");
        }

        let mut bytes = Vec::with_capacity(2 + text.len() * 2);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }

        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write parameter file {}", path.display()))
    }

    /// Raw string lookup.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)
            .and_then(|(_, entries)| {
                entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            })
    }

    /// Integer lookup with default for missing or malformed keys.
    pub fn get_i32(&self, section: &str, key: &str, default: i32) -> i32 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Double lookup with default for missing or malformed keys.
    pub fn get_f64(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Set `section/key`, creating the section as needed.
    pub fn set(&mut self, section: &str, key: &str, value: impl std::fmt::Display) {
        let value = value.to_string();
        let idx = match self.sections.iter().position(|(name, _)| name == section) {
            Some(idx) => idx,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        let entries = &mut self.sections[idx].1;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => entries.push((key.to_string(), value)),
        }
    }
}

/// Decode UTF-16 (BOM required) or UTF-8 bytes.
fn decode_text(bytes: &[u8]) -> Result<String> {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16(&units).map_err(|e| anyhow!("invalid UTF-16LE: {e}"));
    }
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16(&units).map_err(|e| anyhow!("invalid UTF-16BE: {e}"));
    }
    String::from_utf8(bytes.to_vec()).map_err(|e| anyhow!("invalid UTF-8: {e}"))
}

// ============================================================================
// Cross-thread parameter updates
// ============================================================================

/// A pending-update cell for a stage parameter struct.
///
/// The API thread stores a full struct and raises the dirty flag; the worker
/// takes the update (clearing the flag) at the top of the next stage
/// invocation. Reads never block the writer for long: the critical section is
/// a clone.
#[derive(Debug, Default)]
pub struct ParamCell<T: Clone> {
    value: Mutex<T>,
    dirty: AtomicBool,
}

impl<T: Clone> ParamCell<T> {
    /// Create a cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            dirty: AtomicBool::new(false),
        }
    }

    /// Store a new value and raise the update flag.
    pub fn store(&self, value: T) {
        *self.value.lock() = value;
        self.dirty.store(true, Ordering::Release);
    }

    /// Current value, regardless of the flag.
    pub fn snapshot(&self) -> T {
        self.value.lock().clone()
    }

    /// Take the value if an update is pending, clearing the flag.
    pub fn take_if_dirty(&self) -> Option<T> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.value.lock().clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_set_lookup_and_update() {
        let mut set = ParameterSet::default();
        set.push_int(40, "crstthr", "Matching", "contrast threshold");
        set.push_double(0.1, "slplmt", "Complement", "max disparity slope");

        assert_eq!(
            set.get("Matching", "crstthr").map(|e| e.value.as_i32()),
            Some(40)
        );
        assert!(set.set("Matching", "crstthr", ParameterValue::Int(55)));
        assert_eq!(
            set.get("Matching", "crstthr").map(|e| e.value.as_i32()),
            Some(55)
        );
        assert!(!set.set("Matching", "nosuch", ParameterValue::Int(0)));
    }

    #[test]
    fn test_ini_parse_sections_and_comments() {
        let ini = IniFile::parse(
            "; comment\n[MATCHING]\ndepth=256\ncrstthr = 40\n\n[BACKMATCHING]\nenb=1\n",
        );
        assert_eq!(ini.get_i32("MATCHING", "depth", 0), 256);
        assert_eq!(ini.get_i32("MATCHING", "crstthr", 0), 40);
        assert_eq!(ini.get_i32("BACKMATCHING", "enb", 0), 1);
        // Missing keys fall back to the default.
        assert_eq!(ini.get_i32("MATCHING", "missing", 7), 7);
        assert_eq!(ini.get_f64("AVERAGE", "range", 2.0), 2.0);
    }

    #[test]
    fn test_ini_utf16_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("StereoMatchingParameter_XC.ini");

        let mut ini = IniFile::default();
        ini.set("MATCHING", "depth", 256);
        ini.set("MATCHING", "crstthr", 40);
        ini.set("COMPLEMENT", "slplmt", 0.1);
        ini.save(&path).unwrap();

        // On-disk format is UTF-16LE with BOM.
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);

        let loaded = IniFile::load(&path).unwrap();
        assert_eq!(loaded.get_i32("MATCHING", "depth", 0), 256);
        assert!((loaded.get_f64("COMPLEMENT", "slplmt", 0.0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_ini_set_overwrites_existing_key() {
        let mut ini = IniFile::parse("[A]\nx=1\n");
        ini.set("A", "x", 2);
        assert_eq!(ini.get_i32("A", "x", 0), 2);
    }

    #[test]
    fn test_utf8_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.ini");
        std::fs::write(&path, "[A]\nx=3\n").unwrap();
        let ini = IniFile::load(&path).unwrap();
        assert_eq!(ini.get_i32("A", "x", 0), 3);
    }

    #[test]
    fn test_parameter_set_json_round_trip() {
        let mut set = ParameterSet::default();
        set.push_int(256, "depth", "Matching", "search depth");
        set.push_double(0.1, "slplmt", "Complement", "max gradient");

        let json = serde_json::to_string(&set).unwrap();
        let back: ParameterSet = serde_json::from_str(&json).unwrap();

        assert_eq!(back.entries.len(), 2);
        assert_eq!(
            back.get("Matching", "depth").map(|e| e.value.as_i32()),
            Some(256)
        );
        assert_eq!(
            back.get("Complement", "slplmt").map(|e| e.value.as_f64()),
            Some(0.1)
        );
    }

    #[test]
    fn test_param_cell_dirty_protocol() {
        let cell = ParamCell::new(1i32);
        assert_eq!(cell.take_if_dirty(), None);

        cell.store(5);
        assert_eq!(cell.snapshot(), 5);
        assert_eq!(cell.take_if_dirty(), Some(5));
        // Flag cleared by the take.
        assert_eq!(cell.take_if_dirty(), None);
    }
}
