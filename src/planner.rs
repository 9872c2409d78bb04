use serde::{Deserialize, Serialize};
use crate::analyzer::{DiagnosedCode, Diagnosis};
use crate::blockers::BlockerAnalyzer;
use crate::disk::{DiskHealthFact, HealthStatus};
use crate::evidence::EvidenceKind;
use crate::knowledge::{BootStage, Severity};
use crate::partition::PartitionFact;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind { ClearBlocker, RepairTool, Advisory }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairTool { Sfc, Dism, Bootrec, Bcdboot, Chkdsk, Other }

impl RepairTool {
    pub fn from_command(cmd: &str) -> Self {
        let first = cmd.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
        match first.trim_end_matches(".exe") {
            "sfc" => RepairTool::Sfc,
            "dism" => RepairTool::Dism,
            "bootrec" => RepairTool::Bootrec,
            "bcdboot" => RepairTool::Bcdboot,
            "chkdsk" => RepairTool::Chkdsk,
            _ => RepairTool::Other,
        }
    }

    /// Tools whose default mode acts on their own host volume.
    pub fn needs_target(self) -> bool { matches!(self, RepairTool::Sfc | RepairTool::Dism | RepairTool::Bcdboot | RepairTool::Chkdsk) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub step: usize,
    pub kind: ActionKind,
    pub description: String,
    pub command: Option<String>,
    pub tool: Option<RepairTool>,
    pub priority: Severity,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub target_drive: Option<String>,
    pub offline: bool,
    pub actions: Vec<RepairAction>,
    /// Why repair-tool commands were left out, if they were.
    pub suppressed: Option<String>,
}

impl RepairPlan {
    pub fn has_repair_tool(&self) -> bool { self.actions.iter().any(|a| a.kind == ActionKind::RepairTool) }
}

fn replace_ci(hay: &str, needle: &str, with: &str) -> Option<String> {
    let i = hay.to_ascii_lowercase().find(needle)?;
    Some(format!("{}{}{}", &hay[..i], with, &hay[i + needle.len()..]))
}

/// Resolves `{drive}` and switches to explicit-target syntax when the target is not the running system.
/// Returns `None` when the tool needs a target and none is known.
pub fn render_command(template: &str, partition: Option<&PartitionFact>) -> Option<String> {
    let tool = RepairTool::from_command(template);
    let Some(p) = partition else {
        return if tool.needs_target() || template.contains("{drive}") { None } else { Some(template.to_string()) };
    };
    let cmd = template.replace("{drive}", &p.drive);
    if !p.offline { return Some(cmd); }
    let root = format!("{}:\\", p.drive);
    let out = match tool {
        RepairTool::Sfc if !cmd.to_ascii_lowercase().contains("/offwindir") => format!("{} /offbootdir={} /offwindir={}Windows", cmd, root, root),
        RepairTool::Dism => match replace_ci(&cmd, "/online", &format!("/image:{}", root)) {
            Some(c) => c,
            None if !cmd.to_ascii_lowercase().contains("/image:") => cmd.replacen(' ', &format!(" /image:{} ", root), 1),
            None => cmd,
        },
        _ => cmd,
    };
    Some(out)
}

pub struct RepairPlanner;

impl RepairPlanner {
    pub fn plan(diagnosis: &Diagnosis, blockers: &BlockerAnalyzer, partition: Option<&PartitionFact>, disk: Option<&DiskHealthFact>) -> RepairPlan {
        let mut plan = RepairPlan { target_drive: partition.map(|p| p.drive.clone()), offline: partition.is_some_and(|p| p.offline), ..Default::default() };
        let target = partition.map(|p| format!("{}:", p.drive)).unwrap_or_else(|| "the affected drive".to_string());
        let mut actions: Vec<RepairAction> = vec![];

        if let Some(d) = disk && d.status == HealthStatus::Critical {
            actions.push(advisory(format!("Disk {}: reports a critical health state. Back up user data now and replace the drive; software repair is suppressed on failing hardware", d.drive), Severity::Critical));
            plan.suppressed = Some("HardwareFault".to_string());
            return finish(plan, actions);
        }
        if diagnosis.stage == BootStage::Unknown {
            let what = match &diagnosis.code { DiagnosedCode::Unregistered { code } => format!("unregistered code {}", code), _ => "no conclusive evidence".to_string() };
            actions.push(advisory(format!("Diagnosis unresolved ({}). Back up user data from {} and run disk and memory diagnostics before attempting any repair", what, target), Severity::Medium));
            plan.suppressed = Some("UnresolvedDiagnosis".to_string());
            return finish(plan, actions);
        }

        if blockers.has_blocking_condition() {
            let n = blockers.ordered().len();
            actions.push(advisory(format!("Clear {} blocker(s) before running repair tools", n), blockers.highest_severity().unwrap_or(Severity::Medium)));
            for b in blockers.ordered() {
                actions.push(RepairAction { step: 0, kind: ActionKind::ClearBlocker, description: format!("{}: {}", b.blocker_type, b.remediation.description), command: Some(b.remediation.command.clone()), tool: None, priority: b.severity });
            }
        }

        let mut withheld = false;
        match &diagnosis.code {
            DiagnosedCode::Matched { entry } => match entry.command.as_deref() {
                Some(tpl) => match render_command(tpl, partition) {
                    Some(cmd) => actions.push(tool_action(entry.action.clone(), cmd, diagnosis.severity)),
                    None => withheld = true,
                },
                None => actions.push(advisory(entry.action.clone(), diagnosis.severity)),
            },
            DiagnosedCode::UnknownCode => {
                let driver = diagnosis.failing_driver.clone().unwrap_or_default();
                let replace = diagnosis.supporting.iter().find_map(|e| match &e.kind {
                    EvidenceKind::BootLogEntry { driver_image: Some(img), .. } if img.needs_replacement() => Some(img.path().to_string()),
                    _ => None,
                });
                if let Some(path) = replace {
                    actions.push(advisory(format!("Driver image {} is missing or corrupt; restore it from installation media or a known-good copy", path), Severity::High));
                }
                match render_command("sfc /scannow", partition) {
                    Some(cmd) => actions.push(tool_action(format!("Restore protected system files; boot stopped loading {}", driver), cmd, diagnosis.severity)),
                    None => withheld = true,
                }
            }
            DiagnosedCode::Unregistered { .. } | DiagnosedCode::InsufficientEvidence => {}
        }
        if partition.is_none() {
            let msg = if withheld { "Target Windows partition not found, so the repair command was withheld; rerun with --drive <letter>" } else { "Target Windows partition not found; rerun with --drive <letter> to confirm the target" };
            actions.push(advisory(msg.to_string(), Severity::Medium));
        }
        if let Some(d) = disk {
            if d.read_only == Some(true) { actions.push(advisory(format!("Volume {}: is read-only; remount it writable before running repairs", d.drive), Severity::High)); }
            if d.low_space { actions.push(advisory(format!("Free space on {}: is below 10%; free space before running repairs", d.drive), Severity::Medium)); }
        }
        finish(plan, actions)
    }
}

fn advisory(description: String, priority: Severity) -> RepairAction {
    RepairAction { step: 0, kind: ActionKind::Advisory, description, command: None, tool: None, priority }
}

fn tool_action(description: String, cmd: String, priority: Severity) -> RepairAction {
    let tool = RepairTool::from_command(&cmd);
    RepairAction { step: 0, kind: ActionKind::RepairTool, description, command: Some(cmd), tool: Some(tool), priority }
}

fn finish(mut plan: RepairPlan, mut actions: Vec<RepairAction>) -> RepairPlan {
    for (i, a) in actions.iter_mut().enumerate() { a.step = i + 1; }
    plan.actions = actions;
    plan
}
