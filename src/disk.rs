use serde::{Deserialize, Serialize};
use crate::evidence::Gap;

pub const LOW_SPACE_PERCENT: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus { Healthy, Warning, Critical, Unknown }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskHealthFact {
    pub drive: String,
    pub status: HealthStatus,
    pub free_percent: Option<f64>,
    pub read_only: Option<bool>,
    pub low_space: bool,
    pub smart_failure_predicted: Option<bool>,
    pub notes: Vec<String>,
    /// Set when the platform could not be queried at all.
    pub unavailable: Option<String>,
}

/// Raw figures as reported by the platform, before assessment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiskStats {
    pub health: Option<HealthStatus>,
    pub free_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub read_only: Option<bool>,
    pub smart_predicted: Option<bool>,
}

pub trait DiskSource {
    fn stats(&self, drive: &str) -> Result<DiskStats, Gap>;
}

pub struct SystemDisks;

#[cfg(target_os = "windows")]
impl DiskSource for SystemDisks {
    fn stats(&self, drive: &str) -> Result<DiskStats, Gap> {
        use wmi::WMIConnection;
        #[allow(non_snake_case)]
        #[derive(Debug, Deserialize)]
        struct LogicalDiskRow { FreeSpace: Option<u64>, Size: Option<u64> }
        #[allow(non_snake_case)]
        #[derive(Debug, Deserialize)]
        struct VolumeRow { HealthStatus: Option<u16> }
        #[allow(non_snake_case)]
        #[derive(Debug, Deserialize)]
        struct SmartRow { PredictFailure: Option<bool> }
        let mut out = DiskStats::default();
        let wmi = WMIConnection::new().map_err(|e| Gap::unavailable(format!("{}:", drive), format!("WMI connection failed: {}", e)))?;
        if let Ok(rows) = wmi.raw_query::<LogicalDiskRow>(format!("SELECT FreeSpace, Size FROM Win32_LogicalDisk WHERE DeviceID='{}:'", drive))
            && let Some(r) = rows.into_iter().next() {
            out.free_bytes = r.FreeSpace;
            out.total_bytes = r.Size;
        }
        if let Ok(storage) = WMIConnection::with_namespace_path("ROOT\\Microsoft\\Windows\\Storage")
            && let Ok(rows) = storage.raw_query::<VolumeRow>(format!("SELECT HealthStatus FROM MSFT_Volume WHERE DriveLetter='{}'", drive))
            && let Some(r) = rows.into_iter().next() {
            out.health = r.HealthStatus.map(|h| match h { 0 => HealthStatus::Healthy, 1 => HealthStatus::Warning, 2 => HealthStatus::Critical, _ => HealthStatus::Unknown });
        }
        if let Ok(wmi_root) = WMIConnection::with_namespace_path("ROOT\\WMI")
            && let Ok(rows) = wmi_root.raw_query::<SmartRow>("SELECT PredictFailure FROM MSStorageDriver_FailurePredictStatus") {
            out.smart_predicted = Some(rows.into_iter().any(|r| r.PredictFailure.unwrap_or(false)));
        }
        out.read_only = volume_read_only(drive);
        Ok(out)
    }
}

#[cfg(target_os = "windows")]
fn volume_read_only(drive: &str) -> Option<bool> {
    use windows_sys::Win32::Storage::FileSystem::GetVolumeInformationW;
    const FILE_READ_ONLY_VOLUME: u32 = 0x0008_0000;
    let root: Vec<u16> = format!("{}:\\", drive).encode_utf16().chain(std::iter::once(0)).collect();
    let mut flags: u32 = 0;
    let ok = unsafe { GetVolumeInformationW(root.as_ptr(), std::ptr::null_mut(), 0, std::ptr::null_mut(), std::ptr::null_mut(), &mut flags, std::ptr::null_mut(), 0) };
    if ok == 0 { None } else { Some(flags & FILE_READ_ONLY_VOLUME != 0) }
}

#[cfg(not(target_os = "windows"))]
impl DiskSource for SystemDisks {
    fn stats(&self, drive: &str) -> Result<DiskStats, Gap> {
        Err(Gap::unavailable(format!("{}:", drive), "disk health probe requires Windows"))
    }
}

pub struct DiskHealthProbe<'a> {
    source: &'a dyn DiskSource,
}

impl<'a> DiskHealthProbe<'a> {
    pub fn new(source: &'a dyn DiskSource) -> Self { Self { source } }

    pub fn probe(&self, drive: &str) -> DiskHealthFact {
        match self.source.stats(drive) {
            Ok(stats) => assess(drive, &stats),
            Err(gap) => {
                log::warn!("Disk health unavailable for {}: {}", drive, gap.detail);
                DiskHealthFact { drive: drive.to_string(), status: HealthStatus::Unknown, free_percent: None, read_only: None, low_space: false, smart_failure_predicted: None, notes: vec![], unavailable: Some(gap.detail) }
            }
        }
    }
}

pub fn assess(drive: &str, s: &DiskStats) -> DiskHealthFact {
    let mut notes = vec![];
    let mut status = s.health.unwrap_or(HealthStatus::Unknown);
    if s.smart_predicted == Some(true) {
        status = HealthStatus::Critical;
        notes.push("SMART predicts imminent drive failure".to_string());
    }
    let free_percent = match (s.free_bytes, s.total_bytes) {
        (Some(free), Some(total)) if total > 0 => Some(free as f64 * 100.0 / total as f64),
        _ => None,
    };
    let low_space = free_percent.is_some_and(|p| p < LOW_SPACE_PERCENT);
    if let Some(p) = free_percent && low_space {
        notes.push(format!("Only {:.1}% free space left on {}:", p, drive));
        if status == HealthStatus::Healthy { status = HealthStatus::Warning; }
    }
    if s.read_only == Some(true) {
        notes.push(format!("Volume {}: is mounted read-only; repairs cannot write to it", drive));
        if status == HealthStatus::Healthy { status = HealthStatus::Warning; }
    }
    DiskHealthFact { drive: drive.to_string(), status, free_percent, read_only: s.read_only, low_space, smart_failure_predicted: s.smart_predicted, notes, unavailable: None }
}
