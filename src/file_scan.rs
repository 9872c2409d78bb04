use globset::{GlobBuilder, GlobSetBuilder};
use walkdir::WalkDir;
use crate::evidence::{Evidence, Gap};
use crate::knowledge::KnowledgeBase;
use crate::setup_log::SetupLogReader;

pub const DEFAULT_GLOB: &str = "**/*.log";

#[derive(Debug, Default)]
pub struct FileScanSummary {
    pub files_scanned: usize,
    pub evidence: Vec<Evidence>,
    pub gaps: Vec<Gap>,
}

/// Extra setup-style logs under `root` (e.g. `$WINDOWS.~BT\Sources\Panther`), scanned for status codes.
pub fn scan_logs(root: &str, file_glob: Option<&str>, kb: &KnowledgeBase) -> anyhow::Result<FileScanSummary> {
    let mut gs = GlobSetBuilder::new();
    gs.add(GlobBuilder::new(file_glob.unwrap_or(DEFAULT_GLOB)).case_insensitive(true).literal_separator(false).build()?);
    let set = gs.build()?;
    let reader = SetupLogReader::new(kb);
    let mut out = FileScanSummary::default();
    let mut paths: Vec<std::path::PathBuf> = vec![];
    for de in WalkDir::new(root).follow_links(false).into_iter() {
        let de = match de {
            Ok(d) => d,
            Err(e) => {
                let origin = e.path().map(|p| p.display().to_string()).unwrap_or_else(|| root.to_string());
                out.gaps.push(Gap::unavailable(origin, e.to_string()));
                continue;
            }
        };
        if !de.file_type().is_file() { continue; }
        let rel = de.path().strip_prefix(root).unwrap_or(de.path());
        if !set.is_match(rel) && !set.is_match(de.path()) { continue; }
        paths.push(de.path().to_path_buf());
    }
    paths.sort();
    for p in paths {
        match reader.read(&p, 0) {
            Ok(r) => { out.files_scanned += 1; out.evidence.extend(r.evidence); }
            Err(gap) => out.gaps.push(gap),
        }
    }
    log::debug!("Scanned {} files under {}, {} codes", out.files_scanned, root, out.evidence.len());
    Ok(out)
}
