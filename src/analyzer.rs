use std::cmp::Ordering;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::evidence::{Evidence, EvidenceKind};
use crate::knowledge::{BootStage, ErrorCodeEntry, Severity};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DiagnosedCode {
    Matched { entry: ErrorCodeEntry },
    /// A status code was found but the knowledge base has no entry for it.
    Unregistered { code: String },
    /// Diagnosis comes from the boot transcript, which carries no status code.
    UnknownCode,
    InsufficientEvidence,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub code: String,
    pub severity: Severity,
    pub stage: BootStage,
    pub known: bool,
    pub occurrences: usize,
    /// Reading order of the log file holding the last occurrence.
    pub source_order: usize,
    pub last_line_offset: u64,
    pub column: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnosis {
    pub stage: BootStage,
    pub severity: Severity,
    pub code: DiagnosedCode,
    pub confidence: u8,
    pub explanation: String,
    pub failing_driver: Option<String>,
    pub candidates: Vec<Candidate>,
    pub supporting: Vec<Evidence>,
}

impl Diagnosis {
    pub fn entry(&self) -> Option<&ErrorCodeEntry> {
        match &self.code { DiagnosedCode::Matched { entry } => Some(entry), _ => None }
    }

    pub fn code_str(&self) -> Option<&str> {
        match &self.code {
            DiagnosedCode::Matched { entry } => Some(&entry.code),
            DiagnosedCode::Unregistered { code } => Some(code),
            _ => None,
        }
    }
}

/// Severity first, then the later position (file read order, then line), then the earlier column on that line.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.severity.cmp(&a.severity)
        .then(b.source_order.cmp(&a.source_order))
        .then(b.last_line_offset.cmp(&a.last_line_offset))
        .then(a.column.cmp(&b.column))
}

/// Candidates are collected in first-appearance order so the stable sort settles full ties the same way every run.
pub fn rank_candidates(evidence: &[Evidence]) -> Vec<Candidate> {
    let mut sources: HashMap<&str, usize> = HashMap::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<Candidate> = vec![];
    for e in evidence {
        let EvidenceKind::SetupLogEntry { code, line_offset, column } = &e.kind else { continue };
        let next = sources.len();
        let order = *sources.entry(e.source.as_str()).or_insert(next);
        let (severity, stage) = e.entry.as_ref().map(|x| (x.severity, x.stage)).unwrap_or((Severity::Unknown, BootStage::Unknown));
        let i = *index.entry(code.as_str()).or_insert_with(|| {
            out.push(Candidate {
                code: code.clone(), severity, stage, known: e.entry.is_some(), occurrences: 0,
                source_order: order, last_line_offset: *line_offset, column: *column,
            });
            out.len() - 1
        });
        let c = &mut out[i];
        c.occurrences += 1;
        if (order, *line_offset) > (c.source_order, c.last_line_offset) {
            c.source_order = order;
            c.last_line_offset = *line_offset;
            c.column = *column;
        }
    }
    out.sort_by(rank);
    out
}

pub struct BootChainAnalyzer;

impl BootChainAnalyzer {
    pub fn analyze(evidence: &[Evidence]) -> Diagnosis {
        let candidates = rank_candidates(evidence);
        let known: Vec<&Candidate> = candidates.iter().filter(|c| c.known).collect();
        if let Some(top) = known.first() {
            let entry = evidence.iter().find(|e| e.setup_code() == Some(top.code.as_str())).and_then(|e| e.entry.clone());
            if let Some(entry) = entry {
                let confidence = 90u8.saturating_sub(10 * (known.len().min(5) as u8 - 1)).max(50);
                let supporting = evidence.iter().filter(|e| e.setup_code() == Some(top.code.as_str())).cloned().collect();
                let explanation = if known.len() > 1 {
                    format!("{} ({}) outranks {} other code(s): {}", entry.code, entry.severity, known.len() - 1, entry.description)
                } else {
                    format!("{}: {}", entry.code, entry.description)
                };
                return Diagnosis { stage: entry.stage, severity: entry.severity, code: DiagnosedCode::Matched { entry }, confidence, explanation, failing_driver: None, candidates, supporting };
            }
        }
        let boot = evidence.iter().find_map(|e| match &e.kind {
            EvidenceKind::BootLogEntry { first_failure: Some(drv), .. } => Some((drv.clone(), e)),
            _ => None,
        });
        if let Some((driver, e)) = boot {
            let explanation = format!("Boot transcript stops at driver {}", driver);
            return Diagnosis { stage: BootStage::Driver, severity: Severity::High, code: DiagnosedCode::UnknownCode, confidence: 50, explanation, failing_driver: Some(driver), candidates, supporting: vec![e.clone()] };
        }
        if let Some(top) = candidates.first() {
            let supporting = evidence.iter().filter(|e| e.setup_code() == Some(top.code.as_str())).cloned().collect();
            let explanation = format!("Unregistered code {} found; no knowledge base entry to map it to a stage", top.code);
            return Diagnosis { stage: BootStage::Unknown, severity: Severity::Unknown, code: DiagnosedCode::Unregistered { code: top.code.clone() }, confidence: 20, explanation, failing_driver: None, candidates, supporting };
        }
        Diagnosis {
            stage: BootStage::Unknown,
            severity: Severity::Unknown,
            code: DiagnosedCode::InsufficientEvidence,
            confidence: 0,
            explanation: "Insufficient evidence: no status codes in setup logs and no driver failure in the boot transcript".to_string(),
            failing_driver: None,
            candidates,
            supporting: vec![],
        }
    }
}
