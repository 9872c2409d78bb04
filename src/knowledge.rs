use std::collections::HashMap;
use std::fmt;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

const BUILTIN_KB: &str = include_str!("../data/knowledge_base.json");

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity { Unknown, Low, Medium, High, Critical }

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Severity::Critical => "Critical", Severity::High => "High", Severity::Medium => "Medium", Severity::Low => "Low", Severity::Unknown => "Unknown" };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootStage { BootLoader, Driver, Kernel, Setup, Unknown }

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { BootStage::BootLoader => "BootLoader", BootStage::Driver => "Driver", BootStage::Kernel => "Kernel", BootStage::Setup => "Setup", BootStage::Unknown => "Unknown" };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorCodeEntry {
    pub code: String,
    pub description: String,
    pub action: String,
    pub command: Option<String>, // may contain `{drive}`, resolved by the planner
    pub severity: Severity,
    pub stage: BootStage,
}

#[derive(Deserialize)]
struct KnowledgeFile {
    version: String,
    entries: Vec<ErrorCodeEntry>,
}

/// Immutable code table. Built once at startup; there is no way to add entries afterwards.
#[derive(Debug)]
pub struct KnowledgeBase {
    version: String,
    entries: HashMap<String, ErrorCodeEntry>,
}

/// Lowercases and adds the `0x` prefix. Returns `None` unless the result is `0x` + 8 hex digits.
pub fn normalize_code(code: &str) -> Option<String> {
    let t = code.trim().to_lowercase();
    let digits = t.strip_prefix("0x").unwrap_or(&t);
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) { return None; }
    Some(format!("0x{}", digits))
}

impl KnowledgeBase {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_json(BUILTIN_KB).context("built-in knowledge base is malformed")
    }

    /// Explicit path wins, then `BOOTDOCTOR_KB_PATH`, then the embedded table.
    pub fn load(path_opt: Option<&str>) -> anyhow::Result<Self> {
        let path = path_opt.map(|s| s.to_string()).or_else(|| std::env::var("BOOTDOCTOR_KB_PATH").ok());
        let Some(path) = path else { return Self::builtin() };
        let data = std::fs::read_to_string(&path).with_context(|| format!("failed to read knowledge base {}", path))?;
        let kb = Self::from_json(&data).with_context(|| format!("failed to parse knowledge base {}", path))?;
        log::info!("Loaded knowledge base {} (version {}, {} codes)", path, kb.version, kb.entries.len());
        Ok(kb)
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let file: KnowledgeFile = serde_json::from_str(data)?;
        let mut entries = HashMap::with_capacity(file.entries.len());
        for mut e in file.entries {
            let Some(code) = normalize_code(&e.code) else { bail!("invalid status code {:?}", e.code) };
            if e.severity == Severity::Unknown { bail!("entry {} declares severity Unknown", code); }
            e.code = code.clone();
            if entries.insert(code.clone(), e).is_some() { bail!("duplicate status code {}", code); }
        }
        Ok(Self { version: file.version, entries })
    }

    pub fn lookup(&self, code: &str) -> Option<&ErrorCodeEntry> {
        normalize_code(code).and_then(|c| self.entries.get(&c))
    }

    pub fn version(&self) -> &str { &self.version }

    pub fn len(&self) -> usize { self.entries.len() }

    #[cfg(test)]
    pub fn codes(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(|k| k.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_loads() {
        let kb = KnowledgeBase::builtin().unwrap();
        assert!(kb.len() >= 20);
        assert!(!kb.version().is_empty());
    }

    #[test]
    fn lookup_ignores_hex_case_for_every_code() {
        let kb = KnowledgeBase::builtin().unwrap();
        for code in kb.codes() {
            let upper = format!("0x{}", code[2..].to_uppercase());
            let expected = kb.lookup(code).unwrap();
            assert_eq!(kb.lookup(&upper), Some(expected));
            assert_eq!(kb.lookup(&code.to_uppercase()), Some(expected));
            assert_eq!(kb.lookup(&code[2..]), Some(expected));
        }
    }

    #[test]
    fn unregistered_code_is_not_found() {
        let kb = KnowledgeBase::builtin().unwrap();
        assert!(kb.lookup("0xdeadbeef").is_none());
        assert!(kb.lookup("0xc00000").is_none());
        assert!(kb.lookup("not a code").is_none());
    }

    #[test]
    fn normalize_rejects_wrong_width() {
        assert_eq!(normalize_code("0XC000000E").as_deref(), Some("0xc000000e"));
        assert_eq!(normalize_code(" c000000e "), Some("0xc000000e".to_string()));
        assert!(normalize_code("0xc000000e1").is_none());
        assert!(normalize_code("0xg000000e").is_none());
    }

    #[test]
    fn duplicate_codes_fail_to_load() {
        let data = r#"{"version":"t","entries":[
            {"code":"0xc000000e","description":"a","action":"a","command":null,"severity":"High","stage":"BootLoader"},
            {"code":"0XC000000E","description":"b","action":"b","command":null,"severity":"Low","stage":"Setup"}]}"#;
        assert!(KnowledgeBase::from_json(data).is_err());
    }

    #[test]
    fn unknown_severity_is_rejected() {
        let data = r#"{"version":"t","entries":[
            {"code":"0xc000000e","description":"a","action":"a","command":null,"severity":"Unknown","stage":"BootLoader"}]}"#;
        assert!(KnowledgeBase::from_json(data).is_err());
    }

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Unknown);
    }
}
