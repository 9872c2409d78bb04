use crate::knowledge::Severity;
use crate::registry::Blocker;

pub struct BlockerAnalyzer {
    ordered: Vec<Blocker>,
}

impl BlockerAnalyzer {
    /// Sorts by severity, most severe first. Equal severities keep discovery order.
    pub fn classify(blockers: &[Blocker]) -> Self {
        let mut ordered = blockers.to_vec();
        ordered.sort_by(|a, b| b.severity.cmp(&a.severity));
        Self { ordered }
    }

    pub fn ordered(&self) -> &[Blocker] { &self.ordered }

    pub fn into_ordered(self) -> Vec<Blocker> { self.ordered }

    pub fn has_blocking_condition(&self) -> bool { !self.ordered.is_empty() }

    pub fn highest_severity(&self) -> Option<Severity> { self.ordered.first().map(|b| b.severity) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BlockerType, Remediation};

    fn blocker(t: BlockerType, sev: Severity) -> Blocker {
        Blocker { blocker_type: t, registry_path: "HKLM\\x".into(), severity: sev, remediation: Remediation { description: "d".into(), command: "c".into() }, observed: "key present".into() }
    }

    #[test]
    fn sorts_by_severity_and_keeps_discovery_order_for_ties() {
        let input = vec![
            blocker(BlockerType::PendingFileRename, Severity::Medium),
            blocker(BlockerType::PortableOSFlag, Severity::High),
            blocker(BlockerType::PendingRebootUpdate, Severity::Medium),
            blocker(BlockerType::CBSRebootPending, Severity::High),
        ];
        let a = BlockerAnalyzer::classify(&input);
        let types: Vec<BlockerType> = a.ordered().iter().map(|b| b.blocker_type.clone()).collect();
        assert_eq!(types, vec![BlockerType::PortableOSFlag, BlockerType::CBSRebootPending, BlockerType::PendingFileRename, BlockerType::PendingRebootUpdate]);
        assert!(a.has_blocking_condition());
        assert_eq!(a.highest_severity(), Some(Severity::High));
        assert_eq!(input[0].blocker_type, BlockerType::PendingFileRename);
    }

    #[test]
    fn empty_list_has_no_blocking_condition() {
        let a = BlockerAnalyzer::classify(&[]);
        assert!(!a.has_blocking_condition());
        assert!(a.highest_severity().is_none());
    }
}
