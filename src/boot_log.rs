use std::path::{Path, PathBuf};
use crate::driver_image;
use crate::evidence::{Evidence, EvidenceKind, Gap};

const SESSION_MARKER: &str = "Microsoft (R) Windows (R)";
const LOADED: [&str; 2] = ["Loaded driver ", "BOOTLOG_LOADED "];
const NOT_LOADED: [&str; 2] = ["Did not load driver ", "BOOTLOG_NOT_LOADED "];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BootLogSummary {
    pub last_loaded: Option<String>,
    pub first_failure: Option<String>,
    pub failure_line: Option<String>,
}

/// Boot transcripts are usually UTF-16LE with a BOM; setup logs are ANSI/UTF-8.
pub fn decode_log_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) { return decode_utf16le(rest); }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) { return String::from_utf8_lossy(rest).into_owned(); }
    if bytes.len() >= 4 && bytes[0] != 0 && bytes[1] == 0 && bytes[3] == 0 { return decode_utf16le(bytes); }
    String::from_utf8_lossy(bytes).into_owned()
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

fn strip_any<'a>(line: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| line.strip_prefix(p)).map(str::trim)
}

/// Only the most recent boot session counts; each session starts with a version banner.
pub fn summarize(text: &str) -> Option<BootLogSummary> {
    let mut cur = BootLogSummary::default();
    for raw in text.lines() {
        let line = raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
        if line.contains(SESSION_MARKER) { cur = BootLogSummary::default(); continue; }
        if cur.first_failure.is_some() { continue; }
        if let Some(drv) = strip_any(line, &NOT_LOADED) {
            cur.first_failure = Some(drv.to_string());
            cur.failure_line = Some(line.to_string());
        } else if let Some(drv) = strip_any(line, &LOADED) {
            cur.last_loaded = Some(drv.to_string());
        }
    }
    if cur.last_loaded.is_none() && cur.first_failure.is_none() { None } else { Some(cur) }
}

/// An unreadable transcript yields no evidence plus the gap explaining why.
#[derive(Debug, Default)]
pub struct BootRead {
    pub evidence: Vec<Evidence>,
    pub gap: Option<Gap>,
}

pub struct BootLogReader {
    windows_dir: Option<PathBuf>,
}

impl BootLogReader {
    /// `windows_dir` lets the reader inspect the failing driver image on the target install.
    pub fn new(windows_dir: Option<PathBuf>) -> Self { Self { windows_dir } }

    pub fn read(&self, path: &Path) -> BootRead {
        let src = path.to_string_lossy().into_owned();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => return BootRead { evidence: vec![], gap: Some(Gap::from_io(src, &e)) },
        };
        let text = decode_log_bytes(&bytes);
        let Some(sum) = summarize(&text) else {
            log::debug!("Boot log {} has no driver load lines", src);
            return BootRead::default();
        };
        log::debug!("Boot log {}: last loaded {:?}, first failure {:?}", src, sum.last_loaded, sum.first_failure);
        let driver_image = match (&sum.first_failure, &self.windows_dir) {
            (Some(drv), Some(win)) => Some(driver_image::inspect_driver(&driver_image::resolve_driver_path(drv, win))),
            _ => None,
        };
        let raw = sum.failure_line.clone().or_else(|| sum.last_loaded.clone()).unwrap_or_default();
        let evidence = vec![Evidence {
            source: src,
            raw,
            entry: None,
            kind: EvidenceKind::BootLogEntry { last_loaded: sum.last_loaded, first_failure: sum.first_failure, driver_image },
        }];
        BootRead { evidence, gap: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "Microsoft (R) Windows (R) Version 10.0 (Build 19041)\n\
        1 15 2026 10:00:00.500\n\
        Loaded driver \\SystemRoot\\system32\\ntoskrnl.exe\n\
        Loaded driver \\SystemRoot\\system32\\hal.dll\n\
        Loaded driver \\SystemRoot\\System32\\drivers\\disk.sys\n\
        Did not load driver \\SystemRoot\\System32\\drivers\\badstor.sys\n\
        Loaded driver \\SystemRoot\\System32\\drivers\\later.sys\n\
        Did not load driver \\SystemRoot\\System32\\drivers\\second.sys\n";

    #[test]
    fn finds_first_failure_and_last_loaded_before_it() {
        let s = summarize(LOG).unwrap();
        assert_eq!(s.first_failure.as_deref(), Some("\\SystemRoot\\System32\\drivers\\badstor.sys"));
        assert_eq!(s.last_loaded.as_deref(), Some("\\SystemRoot\\System32\\drivers\\disk.sys"));
    }

    #[test]
    fn only_latest_session_counts() {
        let text = format!("{}Microsoft (R) Windows (R) Version 10.0\nBOOTLOG_LOADED \\SystemRoot\\system32\\ntoskrnl.exe\n", LOG);
        let s = summarize(&text).unwrap();
        assert!(s.first_failure.is_none());
        assert_eq!(s.last_loaded.as_deref(), Some("\\SystemRoot\\system32\\ntoskrnl.exe"));
    }

    #[test]
    fn empty_log_has_no_summary() {
        assert!(summarize("Microsoft (R) Windows (R) Version 10.0\n").is_none());
    }

    #[test]
    fn decodes_utf16_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for u in "Loaded driver x.sys\r\n".encode_utf16() { bytes.extend_from_slice(&u.to_le_bytes()); }
        let text = decode_log_bytes(&bytes);
        assert_eq!(summarize(&text).unwrap().last_loaded.as_deref(), Some("x.sys"));
    }

    #[test]
    fn missing_file_is_a_soft_gap() {
        let p = std::env::temp_dir().join("bootdoctor_no_such_ntbtlog.txt");
        let _ = std::fs::remove_file(&p);
        let out = BootLogReader::new(None).read(&p);
        assert!(out.evidence.is_empty());
        assert_eq!(out.gap.unwrap().kind, crate::evidence::GapKind::EvidenceUnavailable);
    }

    #[test]
    fn read_produces_single_summary_with_driver_image() {
        let dir = std::env::temp_dir().join(format!("bootdoctor_bootlog_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("ntbtlog.txt");
        std::fs::write(&p, LOG).unwrap();
        let read = BootLogReader::new(Some(dir.join("Windows"))).read(&p);
        assert!(read.gap.is_none());
        let out = read.evidence;
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            EvidenceKind::BootLogEntry { first_failure, driver_image, .. } => {
                assert!(first_failure.as_deref().unwrap().ends_with("badstor.sys"));
                assert!(matches!(driver_image, Some(crate::driver_image::DriverImage::Missing { .. })));
            }
            _ => panic!("expected boot log entry"),
        }
        assert!(out[0].raw.starts_with("Did not load driver"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
