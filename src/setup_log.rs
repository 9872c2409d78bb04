use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;
use regex::bytes::Regex;
use crate::evidence::{Evidence, EvidenceKind, Gap};
use crate::knowledge::KnowledgeBase;

const MAX_RAW_LINE: usize = 512;

pub fn hex_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i-u)\b0x[0-9a-f]{8}\b").expect("static pattern"))
}

#[derive(Debug, Default)]
pub struct SetupRead {
    pub evidence: Vec<Evidence>,
    /// Byte offset to pass as `since` on the next read.
    pub offset: u64,
}

/// Opens for shared read; setup may still be appending to the file.
pub fn open_shared(path: &Path) -> std::io::Result<File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        opts.share_mode(0x1 | 0x2 | 0x4);
    }
    opts.open(path)
}

pub struct SetupLogReader<'a> {
    kb: &'a KnowledgeBase,
}

impl<'a> SetupLogReader<'a> {
    pub fn new(kb: &'a KnowledgeBase) -> Self { Self { kb } }

    /// Reads everything from `since` to end of file.
    pub fn read(&self, path: &Path, since: u64) -> Result<SetupRead, Gap> {
        self.read_from(path, since, false)
    }

    /// Like `read`, but stops after the last complete line so a half-written line is picked up whole next time.
    pub fn read_lines(&self, path: &Path, since: u64) -> Result<SetupRead, Gap> {
        self.read_from(path, since, true)
    }

    fn read_from(&self, path: &Path, since: u64, complete_lines: bool) -> Result<SetupRead, Gap> {
        let src = path.to_string_lossy().into_owned();
        let mut f = open_shared(path).map_err(|e| Gap::from_io(src.clone(), &e))?;
        let len = f.metadata().map_err(|e| Gap::from_io(src.clone(), &e))?.len();
        let start = if len < since {
            log::warn!("{} shrank from {} to {} bytes; reading it again from the start", src, since, len);
            0
        } else { since };
        f.seek(SeekFrom::Start(start)).map_err(|e| Gap::from_io(src.clone(), &e))?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        f.read_to_end(&mut buf).map_err(|e| Gap::from_io(src.clone(), &e))?;
        drop(f);
        if complete_lines {
            match buf.iter().rposition(|b| *b == b'\n') {
                Some(i) => buf.truncate(i + 1),
                None => buf.clear(),
            }
        }
        let evidence = self.scan_bytes(&src, &buf, start);
        log::debug!("{}: {} bytes from offset {}, {} codes", src, buf.len(), start, evidence.len());
        Ok(SetupRead { evidence, offset: start + buf.len() as u64 })
    }

    /// Every hex-code hit in file order; `base` is the absolute offset of `buf[0]`.
    pub fn scan_bytes(&self, src: &str, buf: &[u8], base: u64) -> Vec<Evidence> {
        let re = hex_code_regex();
        let mut out = vec![];
        let mut pos = 0usize;
        for line in buf.split_inclusive(|b| *b == b'\n') {
            let line_offset = base + pos as u64;
            pos += line.len();
            let mut text: Option<String> = None;
            for m in re.find_iter(line) {
                let code = String::from_utf8_lossy(m.as_bytes()).to_lowercase();
                let raw = text.get_or_insert_with(|| {
                    let s = String::from_utf8_lossy(line);
                    s.trim_end().chars().take(MAX_RAW_LINE).collect()
                }).clone();
                let entry = self.kb.lookup(&code).cloned();
                if entry.is_none() { log::debug!("Unregistered status code {} in {}", code, src); }
                out.push(Evidence { source: src.to_string(), raw, entry, kind: EvidenceKind::SetupLogEntry { code, line_offset, column: m.start() } });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_log(name: &str, content: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("bootdoctor_{}_{}.log", name, std::process::id()));
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn finds_codes_in_file_order() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("order", "2026-10-01 Info  start\n2026-10-01 Error hr=0xC0000221\n2026-10-01 Error 0xc000000e then 0xdeadbeef\n");
        let out = SetupLogReader::new(&kb).read(&p, 0).unwrap();
        let codes: Vec<&str> = out.evidence.iter().filter_map(|e| e.setup_code()).collect();
        assert_eq!(codes, vec!["0xc0000221", "0xc000000e", "0xdeadbeef"]);
        assert!(out.evidence[0].entry.is_some());
        assert!(out.evidence[2].entry.is_none());
        assert_eq!(out.offset, std::fs::metadata(&p).unwrap().len());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn ignores_wider_hex_values() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("wide", "value 0xc0000221ff and 0x1234 and 0xc1900101\n");
        let out = SetupLogReader::new(&kb).read(&p, 0).unwrap();
        let codes: Vec<&str> = out.evidence.iter().filter_map(|e| e.setup_code()).collect();
        assert_eq!(codes, vec!["0xc1900101"]);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn incremental_read_skips_seen_bytes() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("incr", "first 0xc0000221\n");
        let reader = SetupLogReader::new(&kb);
        let first = reader.read(&p, 0).unwrap();
        assert_eq!(first.evidence.len(), 1);
        let mut f = std::fs::OpenOptions::new().append(true).open(&p).unwrap();
        writeln!(f, "second 0xc000000e").unwrap();
        drop(f);
        let second = reader.read(&p, first.offset).unwrap();
        assert_eq!(second.evidence.len(), 1);
        assert_eq!(second.evidence[0].setup_code(), Some("0xc000000e"));
        match second.evidence[0].kind {
            EvidenceKind::SetupLogEntry { line_offset, column, .. } => {
                assert_eq!(line_offset, first.offset);
                assert_eq!(column, 7);
            }
            _ => panic!("expected setup entry"),
        }
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn read_lines_holds_back_partial_line() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("partial", "done 0xc0000221\nhalf 0xc00000");
        let out = SetupLogReader::new(&kb).read_lines(&p, 0).unwrap();
        assert_eq!(out.evidence.len(), 1);
        assert_eq!(out.offset, "done 0xc0000221\n".len() as u64);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn shrunk_file_is_reread_from_start() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("shrink", "x 0xc0000221\n");
        let out = SetupLogReader::new(&kb).read(&p, 10_000).unwrap();
        assert_eq!(out.evidence.len(), 1);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn missing_setup_log_is_soft() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = std::env::temp_dir().join("bootdoctor_no_such_setupact.log");
        let _ = std::fs::remove_file(&p);
        assert!(SetupLogReader::new(&kb).read(&p, 0).is_err());
    }
}
