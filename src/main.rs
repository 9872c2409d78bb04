use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use anyhow::Context;
use clap::{Parser, ValueEnum, ColorChoice, ArgAction, CommandFactory};
use clap_complete::Shell;
use comfy_table::{Table, ContentArrangement};
use serde::{Deserialize, Serialize};
use is_terminal::IsTerminal;
mod analyzer;
mod blockers;
mod boot_log;
mod disk;
mod driver_image;
mod evidence;
mod file_scan;
mod knowledge;
mod markdown;
mod monitor;
mod orchestrator;
mod partition;
mod planner;
mod registry;
mod setup_log;

use crate::analyzer::DiagnosedCode;
use crate::knowledge::{KnowledgeBase, Severity};
use crate::monitor::{Alert, CancelToken, LiveMonitor, MonitorOutcome, SystemClock};
use crate::orchestrator::{AnalysisOrchestrator, Collectors, DiagnosticReport, Mode, ReportStatus, RunOptions};
use crate::registry::{BlockerProbe, BlockerType, Remediation};

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
enum OutputFmt { Text, Json }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
enum TextFormat { Lines, Table }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
enum LogFormat { Text, Json }

#[derive(Parser, Debug)]
#[command(
    name = "BootDoctor",
    about = "Forensic diagnosis and repair planning for Windows installations that fail to boot",
    long_about = "Reads the boot transcript and setup logs of a Windows installation, checks registry blockers and disk health, ranks the failure against a knowledge base of status codes and builds an ordered repair plan. Nothing is repaired automatically.",
    after_long_help = "Examples:\n  BootDoctor --mode analyze\n  BootDoctor --mode full --drive D --md-fix-path fix.md\n  BootDoctor --mode repair --drive D --yes\n  BootDoctor --mode monitor --drive C --timeout-secs 3600 --progress\n  BootDoctor --mode full --windows-dir E:\\case42\\Windows --output json",
    color = ColorChoice::Auto
)]
struct Args {
    #[arg(long, short = 'm', value_enum, default_value = "analyze")]
    mode: Mode,
    /// Target volume letter; skips auto-detection
    #[arg(long, short = 'd')]
    drive: Option<String>,
    /// Read logs from this Windows directory (copied or mounted image)
    #[arg(long)]
    windows_dir: Option<String>,
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    output: OutputFmt,
    #[arg(long, value_enum, default_value = "table")]
    text_format: TextFormat,
    #[arg(long, short = 'j')]
    json_path: Option<String>,
    #[arg(long)]
    md_path: Option<String>,
    #[arg(long)]
    md_fix_path: Option<String>,
    #[arg(long)]
    csv_path: Option<String>,
    #[arg(long, short = 's')]
    scan_path: Option<String>,
    #[arg(long, short = 'g')]
    file_glob: Option<String>,
    /// Path to a knowledge base JSON file (default: built-in table)
    #[arg(long)]
    knowledge_base: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, default_value_t = 1800)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 2)]
    poll_secs: u64,
    #[arg(long, default_value_t = false)]
    progress: bool,
    /// Exit with status 2 when the report is degraded
    #[arg(long, default_value_t = false)]
    strict: bool,
    /// Run blocker-clearing commands without asking (repair mode only)
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<String>,
    #[arg(skip)]
    custom_blockers: Vec<BlockerProbe>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::Analyze,
            drive: None,
            windows_dir: None,
            output: OutputFmt::Text,
            text_format: TextFormat::Table,
            json_path: None,
            md_path: None,
            md_fix_path: None,
            csv_path: None,
            scan_path: None,
            file_glob: None,
            knowledge_base: None,
            config: None,
            timeout_secs: 1800,
            poll_secs: 2,
            progress: false,
            strict: false,
            yes: false,
            no_color: false,
            force_color: false,
            log_level: None,
            log_format: None,
            log_path: None,
            verbose: 0,
            quiet: false,
            completions: None,
            completions_out: None,
            custom_blockers: vec![],
        }
    }
}

#[derive(Deserialize)]
struct CustomBlockerCfg {
    name: String,
    key: String,
    value: Option<String>,
    severity: Severity,
    description: String,
    command: String,
}

#[derive(Deserialize)]
struct AppConfig {
    mode: Option<Mode>,
    drive: Option<String>,
    windows_dir: Option<String>,
    output: Option<OutputFmt>,
    text_format: Option<TextFormat>,
    json_path: Option<String>,
    md_path: Option<String>,
    md_fix_path: Option<String>,
    csv_path: Option<String>,
    scan_path: Option<String>,
    file_glob: Option<String>,
    knowledge_base: Option<String>,
    timeout_secs: Option<u64>,
    poll_secs: Option<u64>,
    progress: Option<bool>,
    strict: Option<bool>,
    force_color: Option<bool>,
    log_format: Option<LogFormat>,
    log_path: Option<String>,
    blockers: Option<Vec<CustomBlockerCfg>>,
}

#[derive(Serialize)]
struct MonitorReport {
    kb_version: String,
    outcome: MonitorOutcome,
    alerts: Vec<Alert>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        if let Some(path) = args.completions_out.as_ref() {
            if let Ok(mut f) = std::fs::File::create(path) { clap_complete::generate(sh, &mut cmd, "BootDoctor", &mut f); } else { clap_complete::generate(sh, &mut cmd, "BootDoctor", &mut std::io::stdout()); }
        } else {
            clap_complete::generate(sh, &mut cmd, "BootDoctor", &mut std::io::stdout());
        }
        return;
    }
    let cfg_path = args.config.clone().unwrap_or_else(|| "BootDoctor.toml".to_string());
    if let Ok(s) = std::fs::read_to_string(&cfg_path) {
        match toml::from_str::<AppConfig>(&s) {
            Ok(cfg) => apply_config(&mut args, cfg),
            Err(e) => eprintln!("Ignoring config {}: {}", cfg_path, e),
        }
    } else if args.config.is_some() {
        eprintln!("Config file {} not readable", cfg_path);
    }
    init_logging(&args);
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let enable_color = if args.force_color { true } else { color_default && !args.no_color };
    let _ = ENABLE_COLOR.set(enable_color);

    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("{}", paint(&format!("error: {:#}", e), "1;31"));
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let kb = KnowledgeBase::load(args.knowledge_base.as_deref())?;
    log::info!("Knowledge base {} loaded ({} codes)", kb.version(), kb.len());
    let volumes = partition::SystemVolumes;
    let reg = registry::WindowsRegistry;
    let disks = disk::SystemDisks;
    let orch = AnalysisOrchestrator::new(&kb, Collectors { volumes: &volumes, registry: &reg, disks: &disks });
    let opts = RunOptions {
        drive: args.drive.clone(),
        windows_dir: args.windows_dir.as_ref().map(PathBuf::from),
        custom_blockers: args.custom_blockers.clone(),
        scan_path: args.scan_path.clone(),
        file_glob: args.file_glob.clone(),
    };
    if args.mode == Mode::Monitor {
        return run_monitor(args, &kb, &orch, &opts);
    }

    let report = orch.run(args.mode, &opts);
    match args.output {
        OutputFmt::Text => { if !args.quiet { print_text(&report, args.text_format); } }
        OutputFmt::Json => {
            if args.json_path.is_none() { println!("{}", serde_json::to_string_pretty(&report).context("serializing report")?); }
        }
    }
    if let Some(p) = args.json_path.as_ref() {
        std::fs::write(p, serde_json::to_vec_pretty(&report)?).with_context(|| format!("writing JSON to {}", p))?;
        if !args.quiet { println!("{}", paint(&format!("JSON written: {}", p), "1;36")); }
    }
    if let Some(p) = args.csv_path.as_ref() {
        write_csv(p, &report).with_context(|| format!("writing CSV to {}", p))?;
        if !args.quiet { println!("{}", paint(&format!("CSV written: {}", p), "1;36")); }
    }
    if let Some(p) = args.md_path.as_ref() {
        std::fs::write(p, markdown::render_markdown(&report)).with_context(|| format!("writing Markdown to {}", p))?;
        if !args.quiet { println!("{}", paint(&format!("Markdown written: {}", p), "1;36")); }
    }
    if let Some(p) = args.md_fix_path.as_ref() {
        std::fs::write(p, markdown::render_fix_markdown(&report)).with_context(|| format!("writing Fix-It Markdown to {}", p))?;
        if !args.quiet { println!("{}", paint(&format!("Fix-It Markdown written: {}", p), "1;36")); }
    }
    if args.mode == Mode::Repair {
        clear_blockers(&report, args, &reg)?;
    }
    Ok(exit_code(report.status, args.strict))
}

fn exit_code(status: ReportStatus, strict: bool) -> i32 {
    match status {
        ReportStatus::Complete => 0,
        ReportStatus::Degraded if strict => 2,
        ReportStatus::Degraded => 0,
        ReportStatus::Failed => 1,
    }
}

fn run_monitor(args: &Args, kb: &KnowledgeBase, orch: &AnalysisOrchestrator, opts: &RunOptions) -> anyhow::Result<i32> {
    let (_, windows_dir, gap) = orch.resolve_target(opts);
    let Some(win) = windows_dir else {
        let why = gap.map(|g| g.to_string()).unwrap_or_else(|| "no target".to_string());
        anyhow::bail!("cannot monitor: {}", why);
    };
    let path = orchestrator::setup_log_path(&win);
    let cancel = CancelToken::default();
    if std::io::stdin().is_terminal() {
        let token = cancel.clone();
        if !args.quiet { println!("{}", paint("Monitoring; enter q to stop", "2")); }
        std::thread::spawn(move || {
            let mut line = String::new();
            while std::io::stdin().read_line(&mut line).unwrap_or(0) > 0 {
                if line.trim().eq_ignore_ascii_case("q") { token.cancel(); break; }
                line.clear();
            }
        });
    }
    let mon = LiveMonitor::new(Duration::from_secs(args.timeout_secs), Duration::from_secs(args.poll_secs));
    let mut session = mon.start(&path, kb, SystemClock::new(), cancel);
    let pb = if args.progress { Some(indicatif::ProgressBar::new_spinner()) } else { None };
    if let Some(ref pb) = pb {
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("Watching {}", path.display()));
    }
    let mut alerts: Vec<Alert> = vec![];
    for alert in session.by_ref() {
        if args.output == OutputFmt::Text && !args.quiet {
            let line = format!("{} [{} / {}] {}: {}", alert.at.with_timezone(&chrono::Local).format("%H:%M:%S"), alert.severity, alert.stage, alert.code, alert.recommended_action);
            match &pb { Some(pb) => pb.println(paint(&line, sev_code(alert.severity))), None => println!("{}", paint(&line, sev_code(alert.severity))) }
        }
        if let Some(ref pb) = pb { pb.set_message(format!("Watching {} ({} alerts)", path.display(), alerts.len() + 1)); }
        alerts.push(alert);
    }
    if let Some(pb) = pb { pb.finish_and_clear(); }
    if let Some(d) = session.latest_diagnosis() {
        log::info!("Last diagnosis from new lines: {} ({})", d.code_str().unwrap_or("-"), d.explanation);
    }
    log::debug!("Monitor stopped: {:?}", session.state());
    let report = MonitorReport { kb_version: kb.version().to_string(), outcome: session.outcome(), alerts };
    match args.output {
        OutputFmt::Text => {
            if !args.quiet {
                let o = &report.outcome;
                println!("{} {:?} after {:.0}s, {} polls, {} alerts, {} unregistered codes", paint("Monitor:", "1"), o.state, o.elapsed_secs, o.polls, o.alerts, o.unregistered);
            }
        }
        OutputFmt::Json => { if args.json_path.is_none() { println!("{}", serde_json::to_string_pretty(&report)?); } }
    }
    if let Some(p) = args.json_path.as_ref() {
        std::fs::write(p, serde_json::to_vec_pretty(&report)?).with_context(|| format!("writing JSON to {}", p))?;
    }
    Ok(0)
}

/// Clearing steps come from the scan itself, so they are offered even when the plan was suppressed.
fn clearing_steps(report: &DiagnosticReport) -> Vec<(String, String)> {
    report.blockers.iter()
        .map(|b| (format!("{}: {}", b.blocker_type, b.remediation.description), b.remediation.command.clone()))
        .collect()
}

fn clear_blockers(report: &DiagnosticReport, args: &Args, reg: &dyn registry::RegistryView) -> anyhow::Result<()> {
    let steps = clearing_steps(report);
    if steps.is_empty() {
        if !args.quiet { println!("{}", paint("No blockers to clear", "32")); }
        return Ok(());
    }
    if let Some(why) = report.plan.as_ref().and_then(|p| p.suppressed.as_deref()) {
        log::warn!("Repair tools are suppressed ({}); clearing {} blocker(s) anyway", why, steps.len());
    }
    for (i, (description, cmd)) in steps.iter().enumerate() {
        println!("{} {}\n  {}", paint(&format!("[{}]", i + 1), "1"), description, paint(cmd, "36"));
        if !args.yes && !confirm("Run this command? [y/N] ")? {
            log::info!("Skipped: {}", cmd);
            continue;
        }
        execute(cmd)?;
    }
    let left = registry::RegistryBlockerScanner::new(reg).with_custom(args.custom_blockers.clone()).scan();
    if left.blockers.is_empty() {
        if !args.quiet { println!("{}", paint("All blockers cleared", "1;32")); }
    } else {
        for b in &left.blockers { println!("{}", paint(&format!("Still present: {} at {}", b.blocker_type, b.registry_path), "33")); }
    }
    if report.plan.as_ref().is_some_and(|p| p.has_repair_tool()) && !args.quiet {
        println!("{}", paint("Run the repair commands from the plan next; they are never executed automatically", "2"));
    }
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

#[cfg(target_os = "windows")]
fn execute(cmd: &str) -> anyhow::Result<()> {
    let status = std::process::Command::new("cmd").args(["/C", cmd]).status().with_context(|| format!("starting {}", cmd))?;
    if status.success() { log::info!("Ran: {}", cmd); } else { log::warn!("{} exited with {}", cmd, status); }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn execute(cmd: &str) -> anyhow::Result<()> {
    log::warn!("Not on Windows; not running: {}", cmd);
    Ok(())
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if args.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else if let Some(lvl) = args.log_level {
        let f = match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace };
        builder.filter_level(f);
    } else if args.verbose > 0 {
        let f = if args.verbose >= 3 { log::LevelFilter::Trace } else if args.verbose == 2 { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        builder.filter_level(f);
    }
    if let Some(fmt) = args.log_format {
        match fmt {
            LogFormat::Json => {
                builder.format(|buf, record| {
                    use std::io::Write;
                    let ts = chrono::Local::now().to_rfc3339();
                    let obj = serde_json::json!({
                        "ts": ts,
                        "level": record.level().to_string(),
                        "target": record.target(),
                        "msg": record.args().to_string(),
                    });
                    writeln!(buf, "{}", obj)
                });
            }
            LogFormat::Text => {
                builder.format(|buf, record| {
                    use std::io::Write;
                    let ts = chrono::Local::now().format("%H:%M:%S");
                    writeln!(buf, "[{:<5} {}] {}", record.level(), ts, record.args())
                });
            }
        }
    }
    if let Some(path) = args.log_path.as_ref() {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => { eprintln!("Failed to open log file {}: {}", path, e); }
        }
    }
    builder.init();
}

fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.mode == Mode::Analyze && let Some(v) = cfg.mode { args.mode = v; }
    if args.drive.is_none() && let Some(v) = cfg.drive { args.drive = Some(v); }
    if args.windows_dir.is_none() && let Some(v) = cfg.windows_dir { args.windows_dir = Some(v); }
    if let Some(v) = cfg.output { args.output = v; }
    if let Some(v) = cfg.text_format { args.text_format = v; }
    if args.json_path.is_none() && let Some(v) = cfg.json_path { args.json_path = Some(v); }
    if args.md_path.is_none() && let Some(v) = cfg.md_path { args.md_path = Some(v); }
    if args.md_fix_path.is_none() && let Some(v) = cfg.md_fix_path { args.md_fix_path = Some(v); }
    if args.csv_path.is_none() && let Some(v) = cfg.csv_path { args.csv_path = Some(v); }
    if args.scan_path.is_none() && let Some(v) = cfg.scan_path { args.scan_path = Some(v); }
    if args.file_glob.is_none() && let Some(v) = cfg.file_glob { args.file_glob = Some(v); }
    if args.knowledge_base.is_none() && let Some(v) = cfg.knowledge_base { args.knowledge_base = Some(v); }
    if args.timeout_secs == 1800 && let Some(v) = cfg.timeout_secs { args.timeout_secs = v; }
    if args.poll_secs == 2 && let Some(v) = cfg.poll_secs { args.poll_secs = v; }
    if let Some(v) = cfg.progress { args.progress = args.progress || v; }
    if let Some(v) = cfg.strict { args.strict = args.strict || v; }
    if let Some(v) = cfg.force_color { args.force_color = args.force_color || v; }
    if args.log_format.is_none() && let Some(v) = cfg.log_format { args.log_format = Some(v); }
    if args.log_path.is_none() && let Some(v) = cfg.log_path { args.log_path = Some(v); }
    if let Some(list) = cfg.blockers {
        args.custom_blockers.extend(list.into_iter().map(|b| BlockerProbe {
            blocker_type: BlockerType::Custom(b.name),
            key: b.key,
            value: b.value,
            severity: b.severity,
            remediation: Remediation { description: b.description, command: b.command },
        }));
    }
}

fn print_text(rep: &DiagnosticReport, fmt: TextFormat) {
    let status_code = match rep.status { ReportStatus::Complete => "1;32", ReportStatus::Degraded => "1;33", ReportStatus::Failed => "1;31" };
    println!("{} {}  {} {:?}  {} {}", paint("Status:", "1"), paint(&format!("{:?}", rep.status), status_code), paint("Mode:", "1"), rep.mode, paint("KB:", "1"), rep.kb_version);
    match &rep.partition {
        Some(p) => println!("{} {}: ({:?}{})", paint("Target:", "1"), p.drive, p.source, if p.offline { ", offline" } else { ", running system" }),
        None => println!("{} {}", paint("Target:", "1"), paint("not found; rerun with --drive <letter>", "33")),
    }
    let d = &rep.diagnosis;
    let code = match &d.code {
        DiagnosedCode::Matched { entry } => entry.code.clone(),
        DiagnosedCode::Unregistered { code } => format!("{} (unregistered)", code),
        DiagnosedCode::UnknownCode => "-".to_string(),
        DiagnosedCode::InsufficientEvidence => "none".to_string(),
    };
    println!("{} {} stage, {} [{}], confidence {}%", paint("Diagnosis:", "1"), d.stage, paint(&d.severity.to_string(), sev_code(d.severity)), code, d.confidence);
    println!("  {}", d.explanation);
    if let Some(drv) = &d.failing_driver { println!("  Failing driver: {}", drv); }
    if let Some(entry) = d.entry() { println!("  {} {}", paint("Action:", "1"), entry.action); }
    if d.candidates.len() > 1 {
        println!("{}", paint("Competing codes:", "1"));
        for c in &d.candidates { println!("  {} {} / {} x{}", c.code, c.severity, c.stage, c.occurrences); }
    }
    if !rep.blockers.is_empty() {
        println!("{}", paint("Blockers:", "1"));
        for b in &rep.blockers { println!("  {} {} ({})", paint(&format!("[{}]", b.severity), sev_code(b.severity)), b.blocker_type, b.observed); }
    }
    if let Some(dh) = &rep.disk_health {
        let free = dh.free_percent.map(|p| format!(", {:.1}% free", p)).unwrap_or_default();
        println!("{} {}: {:?}{}", paint("Disk:", "1"), dh.drive, dh.status, free);
        for n in &dh.notes { println!("  {}", n); }
    }
    if let Some(plan) = &rep.plan {
        println!("{}", paint("Repair plan:", "1"));
        if let Some(why) = &plan.suppressed { println!("  {}", paint(&format!("Repair tools suppressed ({})", why), "1;31")); }
        match fmt {
            TextFormat::Table => {
                let mut table = Table::new();
                table.set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec![paint("#", "1"), paint("Priority", "1"), paint("Kind", "1"), paint("Action", "1"), paint("Command", "1")]);
                for a in &plan.actions {
                    table.add_row(vec![a.step.to_string(), paint(&a.priority.to_string(), sev_code(a.priority)), format!("{:?}", a.kind), a.description.clone(), a.command.clone().unwrap_or_default()]);
                }
                println!("{}", table);
            }
            TextFormat::Lines => {
                for a in &plan.actions {
                    println!("  {}. [{}] {}", a.step, paint(&a.priority.to_string(), sev_code(a.priority)), a.description);
                    if let Some(c) = &a.command { println!("     {}", paint(c, "36")); }
                }
            }
        }
    }
    if !rep.gaps.is_empty() {
        println!("{}", paint("Gaps:", "1"));
        for g in &rep.gaps { println!("  {}", paint(&g.to_string(), "2")); }
    }
}

fn write_csv(path: &str, rep: &DiagnosticReport) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["kind", "source", "code", "line_offset", "severity", "stage", "raw"])?;
    for e in &rep.evidence {
        let (code, offset) = match &e.kind {
            evidence::EvidenceKind::SetupLogEntry { code, line_offset, .. } => (code.clone(), line_offset.to_string()),
            _ => (String::new(), String::new()),
        };
        let (sev, stage) = e.entry.as_ref().map(|x| (x.severity.to_string(), x.stage.to_string())).unwrap_or_default();
        wtr.write_record([e.kind_name().to_string(), e.source.clone(), code, offset, sev, stage, e.raw.clone()])?;
    }
    wtr.flush()?;
    Ok(())
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&true) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}

fn sev_code(s: Severity) -> &'static str {
    match s { Severity::Critical => "1;31", Severity::High => "31", Severity::Medium => "33", Severity::Low => "34", Severity::Unknown => "37" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BootChainAnalyzer;
    use crate::setup_log::SetupLogReader;

    fn base_args() -> Args {
        Args { quiet: true, ..Default::default() }
    }

    fn sample_report() -> DiagnosticReport {
        let kb = KnowledgeBase::builtin().unwrap();
        let evidence = SetupLogReader::new(&kb).scan_bytes("setupact.log", b"x, 0xc0000221\n", 0);
        DiagnosticReport {
            generated_at: chrono::Utc::now(), mode: Mode::Analyze, status: ReportStatus::Complete, kb_version: kb.version().to_string(),
            partition: None, diagnosis: BootChainAnalyzer::analyze(&evidence), blockers: vec![], disk_health: None, plan: None, evidence, gaps: vec![],
        }
    }

    #[test]
    fn config_fills_unset_fields_only() {
        let mut a = base_args();
        a.drive = Some("E".into());
        let cfg: AppConfig = toml::from_str("mode = \"Full\"\ndrive = \"D\"\ntimeout_secs = 60\nmd_path = \"r.md\"\n").unwrap();
        apply_config(&mut a, cfg);
        assert_eq!(a.mode, Mode::Full);
        assert_eq!(a.drive.as_deref(), Some("E"));
        assert_eq!(a.timeout_secs, 60);
        assert_eq!(a.md_path.as_deref(), Some("r.md"));
    }

    #[test]
    fn config_blockers_become_custom_probes() {
        let mut a = base_args();
        let cfg: AppConfig = toml::from_str(r#"
[[blockers]]
name = "SetupInProgress"
key = 'HKLM\SYSTEM\Setup'
value = "SystemSetupInProgress"
severity = "High"
description = "Clear the setup-in-progress flag"
command = 'reg add "HKLM\SYSTEM\Setup" /v SystemSetupInProgress /t REG_DWORD /d 0 /f'
"#).unwrap();
        apply_config(&mut a, cfg);
        assert_eq!(a.custom_blockers.len(), 1);
        assert_eq!(a.custom_blockers[0].blocker_type, BlockerType::Custom("SetupInProgress".into()));
        assert_eq!(a.custom_blockers[0].path(), "HKLM\\SYSTEM\\Setup\\SystemSetupInProgress");
    }

    #[test]
    fn blockers_are_offered_when_plan_is_suppressed() {
        let mut rep = sample_report();
        rep.diagnosis = BootChainAnalyzer::analyze(&[]);
        rep.blockers = vec![registry::Blocker {
            blocker_type: BlockerType::PendingFileRename, registry_path: "HKLM\\x\\PendingFileRenameOperations".into(), severity: Severity::Medium,
            remediation: Remediation { description: "clear pending renames".into(), command: "reg delete x /f".into() }, observed: "2 entries".into(),
        }];
        let plan = planner::RepairPlanner::plan(&rep.diagnosis, &blockers::BlockerAnalyzer::classify(&rep.blockers), None, None);
        assert!(plan.suppressed.is_some());
        assert!(!plan.has_repair_tool());
        rep.plan = Some(plan);
        let steps = clearing_steps(&rep);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].1, "reg delete x /f");
        assert!(steps[0].0.contains("clear pending renames"));
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_code(ReportStatus::Complete, true), 0);
        assert_eq!(exit_code(ReportStatus::Degraded, false), 0);
        assert_eq!(exit_code(ReportStatus::Degraded, true), 2);
        assert_eq!(exit_code(ReportStatus::Failed, false), 1);
    }

    #[test]
    fn csv_lists_evidence() {
        let rep = sample_report();
        let p = std::env::temp_dir().join("bootdoctor_test.csv");
        write_csv(&p.to_string_lossy(), &rep).unwrap();
        let data = std::fs::read_to_string(&p).unwrap();
        assert_eq!(data.lines().count(), 2);
        assert!(data.contains("SetupLogEntry"));
        assert!(data.contains("\"x, 0xc0000221\""));
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn report_serializes_with_tags() {
        let v = serde_json::to_value(sample_report()).unwrap();
        assert_eq!(v["diagnosis"]["code"]["status"], "Matched");
        assert_eq!(v["evidence"][0]["kind"], "SetupLogEntry");
        assert_eq!(v["status"], "Complete");
    }
}
