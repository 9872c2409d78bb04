use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::analyzer::{BootChainAnalyzer, Diagnosis};
use crate::blockers::BlockerAnalyzer;
use crate::boot_log::BootLogReader;
use crate::disk::{DiskHealthFact, DiskHealthProbe, DiskSource, HealthStatus};
use crate::evidence::{Evidence, EvidenceKind, Gap, GapKind};
use crate::file_scan;
use crate::knowledge::KnowledgeBase;
use crate::partition::{PartitionFact, PartitionLocator, VolumeSource};
use crate::planner::{RepairPlan, RepairPlanner};
use crate::registry::{Blocker, BlockerProbe, RegistryBlockerScanner, RegistryView};
use crate::setup_log::SetupLogReader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Mode { Analyze, Full, Repair, Monitor }

impl Mode {
    pub fn plans(self) -> bool { matches!(self, Mode::Full | Mode::Repair) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus { Complete, Degraded, Failed }

/// Platform access used by one run. Tests pass in-memory fakes.
pub struct Collectors<'a> {
    pub volumes: &'a dyn VolumeSource,
    pub registry: &'a dyn RegistryView,
    pub disks: &'a dyn DiskSource,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub drive: Option<String>,
    /// Read logs from this directory instead of `<drive>:\Windows` (e.g. a copied or mounted image).
    pub windows_dir: Option<PathBuf>,
    pub custom_blockers: Vec<BlockerProbe>,
    pub scan_path: Option<String>,
    pub file_glob: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub mode: Mode,
    pub status: ReportStatus,
    pub kb_version: String,
    pub partition: Option<PartitionFact>,
    pub diagnosis: Diagnosis,
    pub blockers: Vec<Blocker>,
    pub disk_health: Option<DiskHealthFact>,
    pub plan: Option<RepairPlan>,
    pub evidence: Vec<Evidence>,
    pub gaps: Vec<Gap>,
}

pub fn boot_log_path(windows_dir: &std::path::Path) -> PathBuf { windows_dir.join("ntbtlog.txt") }
pub fn setup_log_path(windows_dir: &std::path::Path) -> PathBuf { windows_dir.join("Panther").join("setupact.log") }
pub fn setup_err_path(windows_dir: &std::path::Path) -> PathBuf { windows_dir.join("Panther").join("setuperr.log") }

pub struct AnalysisOrchestrator<'a> {
    kb: &'a KnowledgeBase,
    collectors: Collectors<'a>,
}

impl<'a> AnalysisOrchestrator<'a> {
    pub fn new(kb: &'a KnowledgeBase, collectors: Collectors<'a>) -> Self { Self { kb, collectors } }

    /// Resolves the target partition and the Windows directory to read logs from.
    pub fn resolve_target(&self, opts: &RunOptions) -> (Option<PartitionFact>, Option<PathBuf>, Option<Gap>) {
        let (partition, gap) = match PartitionLocator::new(self.collectors.volumes).locate(opts.drive.as_deref()) {
            Ok(p) => (Some(p), None),
            Err(g) => { log::warn!("{}", g); (None, Some(g)) }
        };
        let windows_dir = opts.windows_dir.clone().or_else(|| partition.as_ref().map(|p| p.windows_dir()));
        (partition, windows_dir, gap)
    }

    pub fn run(&self, mode: Mode, opts: &RunOptions) -> DiagnosticReport {
        let mut evidence: Vec<Evidence> = vec![];
        let mut gaps: Vec<Gap> = vec![];
        let mut reachable = 0usize;

        let (partition, windows_dir, part_gap) = self.resolve_target(opts);
        gaps.extend(part_gap);
        if let Some(p) = &partition {
            evidence.push(Evidence { source: "volume scan".into(), raw: format!("{}:", p.drive), entry: None, kind: EvidenceKind::PartitionFact(p.clone()) });
        }

        match &windows_dir {
            Some(win) => {
                let boot = BootLogReader::new(Some(win.clone())).read(&boot_log_path(win));
                match boot.gap {
                    Some(g) => { log::warn!("{}", g); gaps.push(g); }
                    None => reachable += 1,
                }
                evidence.extend(boot.evidence);
                let reader = SetupLogReader::new(self.kb);
                for path in [setup_log_path(win), setup_err_path(win)] {
                    match reader.read(&path, 0) {
                        Ok(r) => { reachable += 1; evidence.extend(r.evidence); }
                        Err(g) => { log::warn!("{}", g); gaps.push(g); }
                    }
                }
            }
            None => gaps.push(Gap::unavailable("boot and setup logs", "no target partition to read them from")),
        }

        if let Some(root) = &opts.scan_path {
            match file_scan::scan_logs(root, opts.file_glob.as_deref(), self.kb) {
                Ok(s) => {
                    if s.files_scanned > 0 { reachable += 1; }
                    evidence.extend(s.evidence);
                    gaps.extend(s.gaps);
                }
                Err(e) => gaps.push(Gap::unavailable(root.clone(), format!("log scan failed: {}", e))),
            }
        }

        let scan = RegistryBlockerScanner::new(self.collectors.registry).with_custom(opts.custom_blockers.clone()).scan();
        if scan.reachable { reachable += 1; }
        gaps.extend(scan.gaps);
        let blockers = BlockerAnalyzer::classify(&scan.blockers);

        let disk_health = partition.as_ref().map(|p| DiskHealthProbe::new(self.collectors.disks).probe(&p.drive));
        if let Some(d) = &disk_health {
            match &d.unavailable {
                Some(reason) => gaps.push(Gap::unavailable(format!("{}:", d.drive), reason.clone())),
                None => reachable += 1,
            }
            if d.status == HealthStatus::Critical {
                gaps.push(Gap::new(GapKind::HardwareFault, format!("{}:", d.drive), "disk reports critical health; software repair suppressed"));
            }
            evidence.push(Evidence { source: format!("{}:", d.drive), raw: format!("{:?}", d.status), entry: None, kind: EvidenceKind::DiskHealthFact(d.clone()) });
        }

        let diagnosis = BootChainAnalyzer::analyze(&evidence);
        for c in diagnosis.candidates.iter().filter(|c| !c.known) {
            gaps.push(Gap::new(GapKind::UnknownErrorCode, c.code.clone(), format!("no knowledge base entry; seen {} time(s)", c.occurrences)));
        }
        log::info!("Diagnosis: stage {}, severity {}, confidence {}%", diagnosis.stage, diagnosis.severity, diagnosis.confidence);

        let plan = mode.plans().then(|| RepairPlanner::plan(&diagnosis, &blockers, partition.as_ref(), disk_health.as_ref()));

        let status = if reachable == 0 {
            ReportStatus::Failed
        } else if gaps.iter().any(|g| !matches!(g.kind, GapKind::UnknownErrorCode | GapKind::HardwareFault)) {
            ReportStatus::Degraded
        } else {
            ReportStatus::Complete
        };
        log::debug!("{} evidence items, {} gaps, {} sources reachable", evidence.len(), gaps.len(), reachable);

        DiagnosticReport {
            generated_at: Utc::now(),
            mode,
            status,
            kb_version: self.kb.version().to_string(),
            partition,
            diagnosis,
            blockers: blockers.into_ordered(),
            disk_health,
            plan,
            evidence,
            gaps,
        }
    }
}
