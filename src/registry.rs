use std::fmt;
use serde::{Deserialize, Serialize};
use crate::evidence::{Gap, GapKind};
use crate::knowledge::Severity;

pub const CONTROL_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Control";
pub const SESSION_MANAGER_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager";
pub const WU_REBOOT_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\WindowsUpdate\Auto Update\RebootRequired";
pub const CBS_REBOOT_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Component Based Servicing\RebootPending";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockerType {
    PortableOSFlag,
    PendingFileRename,
    PendingRebootUpdate,
    CBSRebootPending,
    Custom(String),
}

impl fmt::Display for BlockerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockerType::PortableOSFlag => f.write_str("PortableOSFlag"),
            BlockerType::PendingFileRename => f.write_str("PendingFileRename"),
            BlockerType::PendingRebootUpdate => f.write_str("PendingRebootUpdate"),
            BlockerType::CBSRebootPending => f.write_str("CBSRebootPending"),
            BlockerType::Custom(name) => write!(f, "Custom({})", name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub description: String,
    pub command: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub blocker_type: BlockerType,
    pub registry_path: String,
    pub severity: Severity,
    pub remediation: Remediation,
    pub observed: String,
}

/// A registry location to check. A probe with no value name tests for the key's existence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockerProbe {
    pub blocker_type: BlockerType,
    pub key: String,
    pub value: Option<String>,
    pub severity: Severity,
    pub remediation: Remediation,
}

impl BlockerProbe {
    pub fn path(&self) -> String {
        match &self.value { Some(v) => format!("{}\\{}", self.key, v), None => self.key.clone() }
    }
}

pub fn builtin_probes() -> Vec<BlockerProbe> {
    vec![
        BlockerProbe {
            blocker_type: BlockerType::PortableOSFlag,
            key: CONTROL_KEY.to_string(),
            value: Some("PortableOperatingSystem".to_string()),
            severity: Severity::High,
            remediation: Remediation {
                description: "Reset the portable OS flag so setup and servicing treat the install as fixed".to_string(),
                command: format!("reg add \"{}\" /v PortableOperatingSystem /t REG_DWORD /d 0 /f", CONTROL_KEY),
            },
        },
        BlockerProbe {
            blocker_type: BlockerType::PendingFileRename,
            key: SESSION_MANAGER_KEY.to_string(),
            value: Some("PendingFileRenameOperations".to_string()),
            severity: Severity::Medium,
            remediation: Remediation {
                description: "Drop queued file rename operations left by an interrupted install".to_string(),
                command: format!("reg delete \"{}\" /v PendingFileRenameOperations /f", SESSION_MANAGER_KEY),
            },
        },
        BlockerProbe {
            blocker_type: BlockerType::PendingRebootUpdate,
            key: WU_REBOOT_KEY.to_string(),
            value: None,
            severity: Severity::Medium,
            remediation: Remediation {
                description: "Remove the Windows Update reboot-required marker".to_string(),
                command: format!("reg delete \"{}\" /f", WU_REBOOT_KEY),
            },
        },
        BlockerProbe {
            blocker_type: BlockerType::CBSRebootPending,
            key: CBS_REBOOT_KEY.to_string(),
            value: None,
            severity: Severity::High,
            remediation: Remediation {
                description: "Remove the component servicing reboot-pending marker that makes DISM and SFC refuse to run".to_string(),
                command: format!("reg delete \"{}\" /f", CBS_REBOOT_KEY),
            },
        },
    ]
}

#[derive(Clone, Debug, PartialEq)]
pub enum RegRead {
    Missing,
    Denied,
    Unavailable(String),
    KeyExists,
    Dword(u32),
    Strings(Vec<String>),
    Binary(usize),
}

pub trait RegistryView {
    fn query(&self, key: &str, value: Option<&str>) -> RegRead;
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub blockers: Vec<Blocker>,
    pub gaps: Vec<Gap>,
    /// At least one probe got an answer from the registry (present or absent).
    pub reachable: bool,
}

pub struct RegistryBlockerScanner<'a> {
    registry: &'a dyn RegistryView,
    probes: Vec<BlockerProbe>,
}

impl<'a> RegistryBlockerScanner<'a> {
    pub fn new(registry: &'a dyn RegistryView) -> Self { Self { registry, probes: builtin_probes() } }

    pub fn with_custom(mut self, custom: Vec<BlockerProbe>) -> Self { self.probes.extend(custom); self }

    pub fn scan(&self) -> ScanOutcome {
        let mut out = ScanOutcome::default();
        for p in &self.probes {
            let path = p.path();
            let observed = match self.registry.query(&p.key, p.value.as_deref()) {
                RegRead::Missing => { out.reachable = true; None }
                RegRead::KeyExists => Some("key present".to_string()),
                RegRead::Dword(0) => { out.reachable = true; None }
                RegRead::Dword(v) => Some(format!("REG_DWORD {}", v)),
                RegRead::Strings(v) if v.iter().all(|s| s.is_empty()) => { out.reachable = true; None }
                RegRead::Strings(v) => Some(format!("{} entries", v.iter().filter(|s| !s.is_empty()).count())),
                RegRead::Binary(n) => Some(format!("{} bytes", n)),
                RegRead::Denied => {
                    log::warn!("Access denied reading {}", path);
                    out.gaps.push(Gap::new(GapKind::PermissionDenied, path, "blocker check skipped; rerun elevated or from the recovery environment"));
                    continue;
                }
                RegRead::Unavailable(reason) => {
                    log::warn!("Registry unavailable for {}: {}", path, reason);
                    out.gaps.push(Gap::unavailable(path, reason));
                    continue;
                }
            };
            let Some(observed) = observed else { continue };
            out.reachable = true;
            log::info!("Blocker {} at {} ({})", p.blocker_type, path, observed);
            out.blockers.push(Blocker { blocker_type: p.blocker_type.clone(), registry_path: path, severity: p.severity, remediation: p.remediation.clone(), observed });
        }
        out
    }
}

/// Read-only view of the running registry.
pub struct WindowsRegistry;

#[cfg(windows)]
mod win {
    use super::RegRead;
    use std::ptr;
    use windows_sys::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, ERROR_SUCCESS};
    use windows_sys::Win32::System::Registry::*;

    struct Key(HKEY);
    impl Drop for Key { fn drop(&mut self) { unsafe { RegCloseKey(self.0); } } }

    fn w(s: &str) -> Vec<u16> { let mut v = s.encode_utf16().collect::<Vec<u16>>(); v.push(0); v }

    fn subkey(key: &str) -> &str {
        key.strip_prefix("HKLM\\").or_else(|| key.strip_prefix("HKEY_LOCAL_MACHINE\\")).unwrap_or(key)
    }

    fn status(code: u32) -> Option<RegRead> {
        match code {
            ERROR_SUCCESS => None,
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => Some(RegRead::Missing),
            ERROR_ACCESS_DENIED => Some(RegRead::Denied),
            other => Some(RegRead::Unavailable(format!("registry error {}", other))),
        }
    }

    pub fn query(key: &str, value: Option<&str>) -> RegRead {
        let sub = w(subkey(key));
        let Some(value) = value else {
            let mut h: HKEY = ptr::null_mut();
            let rc = unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, sub.as_ptr(), 0, KEY_READ | KEY_WOW64_64KEY, &mut h) };
            if let Some(r) = status(rc) { return r; }
            let _k = Key(h);
            return RegRead::KeyExists;
        };
        let name = w(value);
        let mut ty: REG_VALUE_TYPE = 0;
        let mut size: u32 = 0;
        let rc = unsafe { RegGetValueW(HKEY_LOCAL_MACHINE, sub.as_ptr(), name.as_ptr(), RRF_RT_ANY | RRF_SUBKEY_WOW6464KEY, &mut ty, ptr::null_mut(), &mut size) };
        if let Some(r) = status(rc) { return r; }
        let mut buf: Vec<u8> = vec![0u8; size as usize];
        let rc = unsafe { RegGetValueW(HKEY_LOCAL_MACHINE, sub.as_ptr(), name.as_ptr(), RRF_RT_ANY | RRF_SUBKEY_WOW6464KEY, &mut ty, buf.as_mut_ptr() as *mut _, &mut size) };
        if let Some(r) = status(rc) { return r; }
        buf.truncate(size as usize);
        match ty {
            REG_DWORD if buf.len() >= 4 => RegRead::Dword(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            REG_MULTI_SZ | REG_SZ | REG_EXPAND_SZ => {
                let units: Vec<u16> = buf.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
                RegRead::Strings(String::from_utf16_lossy(&units).split('\0').map(|s| s.to_string()).collect())
            }
            _ => RegRead::Binary(buf.len()),
        }
    }
}

impl RegistryView for WindowsRegistry {
    #[cfg(windows)]
    fn query(&self, key: &str, value: Option<&str>) -> RegRead { win::query(key, value) }

    #[cfg(not(windows))]
    fn query(&self, _key: &str, _value: Option<&str>) -> RegRead {
        RegRead::Unavailable("registry not available on this platform".to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fake::MemoryRegistry;

    fn all_blockers() -> MemoryRegistry {
        let reg = MemoryRegistry::default();
        reg.set(&format!("{}\\PortableOperatingSystem", CONTROL_KEY), RegRead::Dword(1));
        reg.set(&format!("{}\\PendingFileRenameOperations", SESSION_MANAGER_KEY), RegRead::Strings(vec!["\\??\\C:\\a.tmp".into(), "".into()]));
        reg.set(WU_REBOOT_KEY, RegRead::KeyExists);
        reg.set(CBS_REBOOT_KEY, RegRead::KeyExists);
        reg
    }

    #[test]
    fn detects_all_four_blockers() {
        let reg = all_blockers();
        let out = RegistryBlockerScanner::new(&reg).scan();
        let types: Vec<BlockerType> = out.blockers.iter().map(|b| b.blocker_type.clone()).collect();
        assert_eq!(types, vec![BlockerType::PortableOSFlag, BlockerType::PendingFileRename, BlockerType::PendingRebootUpdate, BlockerType::CBSRebootPending]);
        assert!(out.gaps.is_empty());
        assert!(out.reachable);
    }

    #[test]
    fn scan_after_clearing_is_empty() {
        let reg = all_blockers();
        let scanner = RegistryBlockerScanner::new(&reg);
        let first = scanner.scan();
        assert_eq!(first.blockers.len(), 4);
        for b in &first.blockers { reg.clear(b); }
        let second = scanner.scan();
        assert!(second.blockers.is_empty());
        assert!(second.reachable);
    }

    #[test]
    fn zero_flag_and_empty_list_are_not_blockers() {
        let reg = MemoryRegistry::default();
        reg.set(&format!("{}\\PortableOperatingSystem", CONTROL_KEY), RegRead::Dword(0));
        reg.set(&format!("{}\\PendingFileRenameOperations", SESSION_MANAGER_KEY), RegRead::Strings(vec!["".into()]));
        assert!(RegistryBlockerScanner::new(&reg).scan().blockers.is_empty());
    }

    #[test]
    fn denied_key_is_reported_as_gap_not_blocker() {
        let reg = MemoryRegistry::default();
        reg.set(CBS_REBOOT_KEY, RegRead::Denied);
        let out = RegistryBlockerScanner::new(&reg).scan();
        assert!(out.blockers.is_empty());
        assert_eq!(out.gaps.len(), 1);
        assert_eq!(out.gaps[0].kind, GapKind::PermissionDenied);
    }

    #[test]
    fn custom_probe_is_scanned() {
        let reg = MemoryRegistry::default();
        reg.set(r"HKLM\SOFTWARE\Vendor\Lock", RegRead::KeyExists);
        let custom = BlockerProbe {
            blocker_type: BlockerType::Custom("VendorLock".into()),
            key: r"HKLM\SOFTWARE\Vendor\Lock".into(),
            value: None,
            severity: Severity::Low,
            remediation: Remediation { description: "remove vendor lock".into(), command: "reg delete \"HKLM\\SOFTWARE\\Vendor\\Lock\" /f".into() },
        };
        let out = RegistryBlockerScanner::new(&reg).with_custom(vec![custom]).scan();
        assert_eq!(out.blockers.len(), 1);
        assert_eq!(out.blockers[0].blocker_type, BlockerType::Custom("VendorLock".into()));
    }

    #[cfg(not(windows))]
    #[test]
    fn real_registry_is_unreachable_off_windows() {
        let out = RegistryBlockerScanner::new(&WindowsRegistry).scan();
        assert!(!out.reachable);
        assert_eq!(out.gaps.len(), 4);
    }
}
