use chrono::Local;
use crate::analyzer::DiagnosedCode;
use crate::orchestrator::DiagnosticReport;
use crate::planner::ActionKind;

pub fn render_markdown(rep: &DiagnosticReport) -> String {
    let mut s = String::new();
    s.push_str("# BootDoctor Report\n\n");
    s.push_str(&format!("Generated: {}\n\n", rep.generated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")));
    s.push_str(&format!("Mode: {:?}  \nStatus: {:?}  \nKnowledge base: {}\n\n", rep.mode, rep.status, rep.kb_version));

    s.push_str("## Target\n");
    match &rep.partition {
        Some(p) => s.push_str(&format!("- Drive: {}: ({:?}{})\n\n", p.drive, p.source, if p.offline { ", offline" } else { "" })),
        None => s.push_str("- Not found; rerun with --drive <letter>\n\n"),
    }

    let d = &rep.diagnosis;
    s.push_str("## Diagnosis\n");
    s.push_str(&format!("- Stage: {}\n", d.stage));
    s.push_str(&format!("- Severity: {}\n", d.severity));
    let code = match &d.code {
        DiagnosedCode::Matched { entry } => entry.code.clone(),
        DiagnosedCode::Unregistered { code } => format!("{} (unregistered)", code),
        DiagnosedCode::UnknownCode => "none (boot transcript)".to_string(),
        DiagnosedCode::InsufficientEvidence => "none".to_string(),
    };
    s.push_str(&format!("- Code: {}\n", code));
    s.push_str(&format!("- Confidence: {}%\n", d.confidence));
    if let Some(drv) = &d.failing_driver { s.push_str(&format!("- Failing driver: {}\n", drv)); }
    s.push_str(&format!("- {}\n\n", d.explanation.replace('\n', " ")));
    if d.candidates.len() > 1 {
        s.push_str("### Competing Codes\n");
        for c in &d.candidates { s.push_str(&format!("- {} [{} / {}] x{}\n", c.code, c.severity, c.stage, c.occurrences)); }
        s.push('\n');
    }

    s.push_str("## Blockers\n");
    if rep.blockers.is_empty() { s.push_str("None\n\n"); } else {
        for b in &rep.blockers { s.push_str(&format!("- [{}] {} at `{}` ({})\n", b.severity, b.blocker_type, b.registry_path, b.observed)); }
        s.push('\n');
    }

    if let Some(dh) = &rep.disk_health {
        s.push_str("## Disk Health\n");
        s.push_str(&format!("- {}: {:?}\n", dh.drive, dh.status));
        if let Some(p) = dh.free_percent { s.push_str(&format!("- Free space: {:.1}%\n", p)); }
        for n in &dh.notes { s.push_str(&format!("- {}\n", n)); }
        if let Some(u) = &dh.unavailable { s.push_str(&format!("- Unavailable: {}\n", u)); }
        s.push('\n');
    }

    if let Some(plan) = &rep.plan {
        s.push_str("## Repair Plan\n");
        if let Some(why) = &plan.suppressed { s.push_str(&format!("Repair tools suppressed: {}\n\n", why)); }
        for a in &plan.actions {
            match &a.command {
                Some(c) => s.push_str(&format!("{}. [{}] {}: `{}`\n", a.step, a.priority, a.description, c)),
                None => s.push_str(&format!("{}. [{}] {}\n", a.step, a.priority, a.description)),
            }
        }
        s.push('\n');
    }

    if !rep.gaps.is_empty() {
        s.push_str("## Gaps\n");
        for g in &rep.gaps { s.push_str(&format!("- {} ({}): {}\n", g.kind, g.origin, g.detail)); }
        s.push('\n');
    }
    s
}

pub fn render_fix_markdown(rep: &DiagnosticReport) -> String {
    let mut s = String::new();
    s.push_str("# BootDoctor Fix-It\n\n");
    s.push_str(&format!("Diagnosis: {} stage, {} ({}% confidence)\n\n", rep.diagnosis.stage, rep.diagnosis.severity, rep.diagnosis.confidence));
    let Some(plan) = &rep.plan else {
        s.push_str("No repair plan was built; rerun in full mode.\n");
        return s;
    };
    let clear: Vec<_> = plan.actions.iter().filter(|a| a.kind == ActionKind::ClearBlocker).collect();
    if !clear.is_empty() {
        s.push_str("## Clear Blockers First\n");
        for a in clear { s.push_str(&format!("- [ ] {}\n  ```\n  {}\n  ```\n", a.description, a.command.as_deref().unwrap_or(""))); }
        s.push('\n');
    }
    s.push_str("## Repair\n");
    let rest: Vec<_> = plan.actions.iter().filter(|a| a.kind != ActionKind::ClearBlocker).collect();
    if rest.is_empty() { s.push_str("- No specific actions\n"); }
    for a in rest {
        match &a.command {
            Some(c) => s.push_str(&format!("- [ ] {}\n  ```\n  {}\n  ```\n", a.description, c)),
            None => s.push_str(&format!("- [ ] {}\n", a.description)),
        }
    }
    s
}
