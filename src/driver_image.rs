use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

const IMAGE_SUBSYSTEM_NATIVE: u16 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DriverImage {
    Missing { path: String },
    Unreadable { path: String, reason: String },
    NotPortableExecutable { path: String },
    Valid {
        path: String,
        machine: String,
        sections: usize,
        native: bool,
        /// None when the image carries no checksum.
        checksum_ok: Option<bool>,
    },
}

impl DriverImage {
    /// Missing, unparseable or checksum-mismatched images warrant replacing the file.
    pub fn needs_replacement(&self) -> bool {
        match self {
            DriverImage::Missing { .. } | DriverImage::NotPortableExecutable { .. } => true,
            DriverImage::Valid { checksum_ok, .. } => *checksum_ok == Some(false),
            DriverImage::Unreadable { .. } => false,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DriverImage::Missing { path } | DriverImage::Unreadable { path, .. } | DriverImage::NotPortableExecutable { path } | DriverImage::Valid { path, .. } => path,
        }
    }
}

/// Maps a boot-log driver path (`\SystemRoot\...`, `\??\C:\...`, `system32\...`) onto the target Windows directory.
pub fn resolve_driver_path(raw: &str, windows_dir: &Path) -> PathBuf {
    let t = raw.trim();
    let lower = t.to_ascii_lowercase();
    let rel = if lower.starts_with("\\systemroot\\") {
        &t["\\systemroot\\".len()..]
    } else if lower.starts_with("\\??\\") && t.len() > 7 {
        // `\??\C:\Windows\...` names a volume of the failing install; keep the path below the Windows dir
        let after = &t[4..];
        match after.to_ascii_lowercase().find("\\windows\\") { Some(i) => &after[i + "\\windows\\".len()..], None => after }
    } else {
        t.trim_start_matches('\\')
    };
    rel.split(['\\', '/']).filter(|p| !p.is_empty()).fold(windows_dir.to_path_buf(), |acc, part| acc.join(part))
}

pub fn inspect_driver(path: &Path) -> DriverImage {
    let p = path.to_string_lossy().into_owned();
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return DriverImage::Missing { path: p },
        Err(e) => return DriverImage::Unreadable { path: p, reason: e.to_string() },
    };
    match goblin::pe::PE::parse(&bytes) {
        Ok(pe) => {
            let machine = format!("0x{:04x}", pe.header.coff_header.machine);
            let (native, stored) = match pe.header.optional_header.as_ref() {
                Some(oh) => (oh.windows_fields.subsystem == IMAGE_SUBSYSTEM_NATIVE, oh.windows_fields.check_sum),
                None => (false, 0),
            };
            let checksum_ok = if stored == 0 {
                None
            } else {
                let off = pe.header.dos_header.pe_pointer as usize + 4 + 20 + 64;
                Some(pe_checksum(&bytes, off) == stored)
            };
            DriverImage::Valid { path: p, machine, sections: pe.sections.len(), native, checksum_ok }
        }
        Err(e) => {
            log::debug!("PE parse failed for {}: {}", p, e);
            DriverImage::NotPortableExecutable { path: p }
        }
    }
}

/// Standard PE image checksum; the 4-byte checksum field at `checksum_offset` is skipped.
pub fn pe_checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        if i == checksum_offset || i == checksum_offset + 2 { i += 2; continue; }
        let lo = bytes[i] as u64;
        let hi = bytes.get(i + 1).copied().unwrap_or(0) as u64;
        sum += lo | (hi << 8);
        sum = (sum & 0xffff) + (sum >> 16);
        i += 2;
    }
    sum = (sum & 0xffff) + (sum >> 16);
    (sum as u32).wrapping_add(bytes.len() as u32)
}
