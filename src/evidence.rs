use std::fmt;
use serde::{Deserialize, Serialize};
use crate::disk::DiskHealthFact;
use crate::driver_image::DriverImage;
use crate::knowledge::ErrorCodeEntry;
use crate::partition::PartitionFact;

/// One observed fact. Created by a collector and never modified afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evidence {
    pub source: String,
    pub raw: String,
    pub entry: Option<ErrorCodeEntry>,
    #[serde(flatten)]
    pub kind: EvidenceKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EvidenceKind {
    BootLogEntry {
        last_loaded: Option<String>,
        first_failure: Option<String>,
        driver_image: Option<DriverImage>,
    },
    SetupLogEntry {
        code: String,
        line_offset: u64,
        column: usize,
    },
    DiskHealthFact(DiskHealthFact),
    PartitionFact(PartitionFact),
}

impl Evidence {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EvidenceKind::BootLogEntry { .. } => "BootLogEntry",
            EvidenceKind::SetupLogEntry { .. } => "SetupLogEntry",
            EvidenceKind::DiskHealthFact(_) => "DiskHealthFact",
            EvidenceKind::PartitionFact(_) => "PartitionFact",
        }
    }

    pub fn setup_code(&self) -> Option<&str> {
        match &self.kind { EvidenceKind::SetupLogEntry { code, .. } => Some(code), _ => None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind { EvidenceUnavailable, PartitionNotFound, UnknownErrorCode, HardwareFault, PermissionDenied }

impl fmt::Display for GapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GapKind::EvidenceUnavailable => "EvidenceUnavailable",
            GapKind::PartitionNotFound => "PartitionNotFound",
            GapKind::UnknownErrorCode => "UnknownErrorCode",
            GapKind::HardwareFault => "HardwareFault",
            GapKind::PermissionDenied => "PermissionDenied",
        };
        f.write_str(s)
    }
}

/// A soft failure. Collectors return it instead of aborting; the report lists every one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} ({origin}): {detail}")]
pub struct Gap {
    pub kind: GapKind,
    pub origin: String,
    pub detail: String,
}

impl Gap {
    pub fn new(kind: GapKind, origin: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { kind, origin: origin.into(), detail: detail.into() }
    }

    pub fn unavailable(origin: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(GapKind::EvidenceUnavailable, origin, detail)
    }

    pub fn from_io(origin: impl Into<String>, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::new(GapKind::PermissionDenied, origin, format!("{}; rerun elevated or from the recovery environment", err)),
            _ => Self::new(GapKind::EvidenceUnavailable, origin, err.to_string()),
        }
    }
}
