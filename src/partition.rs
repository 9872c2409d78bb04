use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::evidence::{Gap, GapKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSource { Override, AutoDetected }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionFact {
    pub drive: String,
    pub system_drive: Option<String>,
    /// Target is not the volume the running OS booted from; repair tools need explicit paths.
    pub offline: bool,
    pub source: PartitionSource,
}

impl PartitionFact {
    pub fn root(&self) -> PathBuf { drive_root(&self.drive) }
    pub fn windows_dir(&self) -> PathBuf { self.root().join("Windows") }
}

pub fn drive_root(letter: &str) -> PathBuf { PathBuf::from(format!("{}:\\", letter)) }

/// Accepts `d`, `D:`, `D:\`; returns the uppercase letter.
pub fn normalize_drive(s: &str) -> Option<String> {
    let t = s.trim().trim_end_matches(['\\', '/']);
    let t = t.strip_suffix(':').unwrap_or(t);
    let mut chars = t.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase().to_string()),
        _ => None,
    }
}

pub trait VolumeSource {
    /// Mounted volume letters in ascending order.
    fn mounted_volumes(&self) -> Vec<String>;
    /// Letter of the volume the running OS (or recovery environment) booted from.
    fn system_drive(&self) -> Option<String>;
    fn is_accessible(&self, letter: &str) -> bool;
    fn has_windows(&self, letter: &str) -> bool;
}

pub struct SystemVolumes;

impl VolumeSource for SystemVolumes {
    #[cfg(windows)]
    fn mounted_volumes(&self) -> Vec<String> {
        let mask = unsafe { windows_sys::Win32::Storage::FileSystem::GetLogicalDrives() };
        (0..26u8).filter(|i| mask & (1 << i) != 0).map(|i| ((b'A' + i) as char).to_string()).collect()
    }

    #[cfg(not(windows))]
    fn mounted_volumes(&self) -> Vec<String> {
        (b'A'..=b'Z').map(|c| (c as char).to_string()).filter(|l| drive_root(l).is_dir()).collect()
    }

    fn system_drive(&self) -> Option<String> {
        std::env::var("SystemDrive").ok().and_then(|s| normalize_drive(&s))
    }

    fn is_accessible(&self, letter: &str) -> bool { std::fs::read_dir(drive_root(letter)).is_ok() }

    fn has_windows(&self, letter: &str) -> bool { drive_root(letter).join("Windows").join("System32").is_dir() }
}

pub struct PartitionLocator<'a> {
    volumes: &'a dyn VolumeSource,
}

impl<'a> PartitionLocator<'a> {
    pub fn new(volumes: &'a dyn VolumeSource) -> Self { Self { volumes } }

    pub fn locate(&self, override_drive: Option<&str>) -> Result<PartitionFact, Gap> {
        let system_drive = self.volumes.system_drive();
        if let Some(raw) = override_drive {
            let Some(letter) = normalize_drive(raw) else {
                return Err(Gap::new(GapKind::PartitionNotFound, raw, "override is not a single volume letter"));
            };
            if !self.volumes.mounted_volumes().contains(&letter) || !self.volumes.is_accessible(&letter) {
                return Err(Gap::new(GapKind::PartitionNotFound, format!("{}:", letter), "override volume is not mounted or not accessible"));
            }
            log::info!("Using target drive {}: from override", letter);
            let offline = system_drive.as_deref() != Some(letter.as_str());
            return Ok(PartitionFact { drive: letter, system_drive, offline, source: PartitionSource::Override });
        }
        for letter in self.volumes.mounted_volumes() {
            if system_drive.as_deref() == Some(letter.as_str()) { continue; }
            if !self.volumes.has_windows(&letter) { continue; }
            log::info!("Detected offline Windows installation on {}:", letter);
            return Ok(PartitionFact { drive: letter, system_drive, offline: true, source: PartitionSource::AutoDetected });
        }
        Err(Gap::new(
            GapKind::PartitionNotFound,
            "volume scan",
            "no mounted volume other than the running system holds Windows\\System32; rerun with --drive <letter>",
        ))
    }
}

#[cfg(test)]
pub mod fake {
    use super::VolumeSource;

    pub struct FakeVolumes {
        pub mounted: Vec<&'static str>,
        pub system: Option<&'static str>,
        pub with_windows: Vec<&'static str>,
    }

    impl VolumeSource for FakeVolumes {
        fn mounted_volumes(&self) -> Vec<String> { self.mounted.iter().map(|s| s.to_string()).collect() }
        fn system_drive(&self) -> Option<String> { self.system.map(|s| s.to_string()) }
        fn is_accessible(&self, letter: &str) -> bool { self.mounted.iter().any(|m| *m == letter) }
        fn has_windows(&self, letter: &str) -> bool { self.with_windows.iter().any(|m| *m == letter) }
    }
}
