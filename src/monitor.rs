use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::analyzer::{BootChainAnalyzer, Diagnosis};
use crate::evidence::EvidenceKind;
use crate::knowledge::{BootStage, KnowledgeBase, Severity};
use crate::setup_log::{self, SetupLogReader};

/// Leading bytes remembered to notice a log rewritten in place.
const HEAD_BYTES: u64 = 256;

fn read_head(path: &Path, len: u64) -> Vec<u8> {
    let mut buf = vec![];
    if let Ok(f) = setup_log::open_shared(path) {
        let _ = f.take(len.min(HEAD_BYTES)).read_to_end(&mut buf);
    }
    buf
}

/// Time source for the poll loop. Tests substitute a virtual clock.
pub trait PollClock {
    fn elapsed(&self) -> Duration;
    fn sleep(&mut self, d: Duration);
}

pub struct SystemClock { start: Instant }

impl SystemClock {
    pub fn new() -> Self { Self { start: Instant::now() } }
}

impl PollClock for SystemClock {
    fn elapsed(&self) -> Duration { self.start.elapsed() }
    fn sleep(&mut self, d: Duration) { std::thread::sleep(d) }
}

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) { self.0.store(true, Ordering::Release) }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Acquire) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState { #[default] Idle, Watching, Alerted, TimedOut, Cancelled }

impl MonitorState {
    pub fn is_terminal(self) -> bool { matches!(self, MonitorState::TimedOut | MonitorState::Cancelled) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub code: String,
    pub stage: BootStage,
    pub severity: Severity,
    pub description: String,
    pub recommended_action: String,
    pub command: Option<String>,
    pub raw: String,
    pub line_offset: u64,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorOutcome {
    pub path: String,
    pub state: MonitorState,
    pub alerts: usize,
    pub unregistered: usize,
    pub polls: u64,
    pub elapsed_secs: f64,
    pub final_offset: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct LiveMonitor {
    pub timeout: Duration,
    pub poll: Duration,
}

impl LiveMonitor {
    pub fn new(timeout: Duration, poll: Duration) -> Self {
        Self { timeout, poll: poll.max(Duration::from_millis(10)) }
    }

    /// Begins watching at the file's current end; content already present is never alerted on.
    pub fn start<'a, C: PollClock>(&self, path: &Path, kb: &'a KnowledgeBase, clock: C, cancel: CancelToken) -> MonitorSession<'a, C> {
        let offset = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) => {
                log::warn!("{} not readable yet ({}); waiting for it to appear", path.display(), e);
                0
            }
        };
        log::info!("Monitoring {} from offset {} (timeout {:?}, poll {:?})", path.display(), offset, self.timeout, self.poll);
        let head = read_head(path, offset);
        let mut session = MonitorSession {
            path: path.to_path_buf(), reader: SetupLogReader::new(kb), clock, cancel, timeout: self.timeout, poll: self.poll,
            offset, head, state: MonitorState::Idle, pending: VecDeque::new(), alerts: 0, unregistered: 0, polls: 0, latest: None,
        };
        session.state = MonitorState::Watching;
        session
    }
}

pub struct MonitorSession<'a, C: PollClock> {
    path: PathBuf,
    reader: SetupLogReader<'a>,
    clock: C,
    cancel: CancelToken,
    timeout: Duration,
    poll: Duration,
    offset: u64,
    head: Vec<u8>,
    state: MonitorState,
    pending: VecDeque<Alert>,
    alerts: usize,
    unregistered: usize,
    polls: u64,
    latest: Option<Diagnosis>,
}

impl<'a, C: PollClock> MonitorSession<'a, C> {
    pub fn state(&self) -> MonitorState { self.state }
    #[cfg(test)]
    pub fn alerts_emitted(&self) -> usize { self.alerts }
    #[cfg(test)]
    pub fn unregistered_seen(&self) -> usize { self.unregistered }
    pub fn latest_diagnosis(&self) -> Option<&Diagnosis> { self.latest.as_ref() }

    pub fn outcome(&self) -> MonitorOutcome {
        MonitorOutcome {
            path: self.path.display().to_string(), state: self.state, alerts: self.alerts, unregistered: self.unregistered,
            polls: self.polls, elapsed_secs: self.clock.elapsed().as_secs_f64(), final_offset: self.offset,
        }
    }

    fn poll_once(&mut self) {
        self.polls += 1;
        let size = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) => { log::debug!("poll {}: {}", self.polls, e); return; }
        };
        if size >= self.offset && read_head(&self.path, self.offset) != self.head {
            log::info!("{} was rewritten; rescanning from the start", self.path.display());
            self.offset = 0;
        }
        if size == self.offset { return; }
        let read = match self.reader.read_lines(&self.path, self.offset) {
            Ok(r) => r,
            Err(gap) => { log::warn!("{}", gap); return; }
        };
        self.offset = read.offset;
        self.head = read_head(&self.path, self.offset);
        if read.evidence.is_empty() { return; }
        let diagnosis = BootChainAnalyzer::analyze(&read.evidence);
        let mut seen = HashSet::new();
        for e in &read.evidence {
            let Some(code) = e.setup_code() else { continue };
            if !seen.insert(code.to_string()) { continue; }
            let Some(entry) = &e.entry else {
                log::warn!("Unregistered status code {} appeared in {}", code, self.path.display());
                self.unregistered += 1;
                continue;
            };
            let line_offset = match &e.kind { EvidenceKind::SetupLogEntry { line_offset, .. } => *line_offset, _ => 0 };
            self.pending.push_back(Alert {
                code: entry.code.clone(), stage: entry.stage, severity: entry.severity, description: entry.description.clone(),
                recommended_action: entry.action.clone(), command: entry.command.clone(), raw: e.raw.clone(), line_offset, at: Utc::now(),
            });
        }
        self.latest = Some(diagnosis);
    }
}

impl<'a, C: PollClock> Iterator for MonitorSession<'a, C> {
    type Item = Alert;

    fn next(&mut self) -> Option<Alert> {
        loop {
            if let Some(alert) = self.pending.pop_front() {
                self.state = MonitorState::Alerted;
                self.alerts += 1;
                log::info!("Alert {} ({}, {}) at offset {}", alert.code, alert.severity, alert.stage, alert.line_offset);
                return Some(alert);
            }
            if self.state.is_terminal() { return None; }
            self.state = MonitorState::Watching;
            if self.cancel.is_cancelled() {
                self.state = MonitorState::Cancelled;
                log::info!("Monitor cancelled after {} polls", self.polls);
                return None;
            }
            if self.clock.elapsed() >= self.timeout {
                self.state = MonitorState::TimedOut;
                log::info!("Monitor timed out after {} polls, {} alerts", self.polls, self.alerts);
                return None;
            }
            self.clock.sleep(self.poll);
            if self.cancel.is_cancelled() {
                self.state = MonitorState::Cancelled;
                log::info!("Monitor cancelled after {} polls", self.polls);
                return None;
            }
            self.poll_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FakeClock<F: FnMut(u32)> { now: Duration, ticks: u32, on_sleep: F }

    impl<F: FnMut(u32)> FakeClock<F> {
        fn new(on_sleep: F) -> Self { Self { now: Duration::ZERO, ticks: 0, on_sleep } }
    }

    impl<F: FnMut(u32)> PollClock for FakeClock<F> {
        fn elapsed(&self) -> Duration { self.now }
        fn sleep(&mut self, d: Duration) {
            self.now += d;
            self.ticks += 1;
            (self.on_sleep)(self.ticks);
        }
    }

    fn temp_log(name: &str, content: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("bootdoctor_mon_{}_{}.log", name, std::process::id()));
        std::fs::write(&p, content).unwrap();
        p
    }

    fn append(p: &Path, s: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(p).unwrap();
        f.write_all(s.as_bytes()).unwrap();
    }

    const POLL: Duration = Duration::from_secs(2);

    #[test]
    fn empty_file_times_out_without_alerts() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("empty", "");
        let mon = LiveMonitor::new(POLL * 2, POLL);
        let mut s = mon.start(&p, &kb, FakeClock::new(|_| {}), CancelToken::default());
        assert_eq!(s.state(), MonitorState::Watching);
        assert!(s.next().is_none());
        assert_eq!(s.state(), MonitorState::TimedOut);
        assert_eq!(s.alerts_emitted(), 0);
        assert_eq!(s.outcome().polls, 2);
        assert!(s.next().is_none());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn new_line_raises_exactly_one_alert() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("grow", "");
        let target = p.clone();
        let clock = FakeClock::new(move |t| if t == 1 { append(&target, "2026-10-16 Error SP ApplyOps failed 0xc0000221\n") });
        let mut s = LiveMonitor::new(POLL * 5, POLL).start(&p, &kb, clock, CancelToken::default());
        let first = s.next().unwrap();
        assert_eq!(first.code, "0xc0000221");
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(s.state(), MonitorState::Alerted);
        assert!(s.next().is_none());
        assert_eq!(s.state(), MonitorState::TimedOut);
        assert_eq!(s.alerts_emitted(), 1);
        assert_eq!(s.latest_diagnosis().unwrap().code_str(), Some("0xc0000221"));
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn existing_content_is_not_replayed() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("old", "old failure 0xc000000e\n");
        let alerts: Vec<Alert> = LiveMonitor::new(POLL * 3, POLL).start(&p, &kb, FakeClock::new(|_| {}), CancelToken::default()).collect();
        assert!(alerts.is_empty());
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn partial_line_alerts_once_complete() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("partial", "");
        let target = p.clone();
        let clock = FakeClock::new(move |t| match t {
            1 => append(&target, "x 0xc00002"),
            2 => append(&target, "21\n"),
            _ => {}
        });
        let alerts: Vec<Alert> = LiveMonitor::new(POLL * 4, POLL).start(&p, &kb, clock, CancelToken::default()).collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "0xc0000221");
        assert_eq!(alerts[0].line_offset, 0);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn repeated_code_in_one_delta_is_one_alert() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("dupe", "");
        let target = p.clone();
        let clock = FakeClock::new(move |t| if t == 1 { append(&target, "0xc0000221\n0xc0000221\n0xc000000e\n") });
        let alerts: Vec<Alert> = LiveMonitor::new(POLL * 2, POLL).start(&p, &kb, clock, CancelToken::default()).collect();
        let codes: Vec<&str> = alerts.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(codes, vec!["0xc0000221", "0xc000000e"]);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn unregistered_code_is_counted_not_alerted() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("unreg", "");
        let target = p.clone();
        let clock = FakeClock::new(move |t| if t == 1 { append(&target, "odd 0xdeadbeef\n") });
        let mut s = LiveMonitor::new(POLL * 2, POLL).start(&p, &kb, clock, CancelToken::default());
        assert!(s.next().is_none());
        assert_eq!(s.unregistered_seen(), 1);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn same_length_rewrite_is_rescanned() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("rewrite", "old 0xc000000e\n");
        let target = p.clone();
        let clock = FakeClock::new(move |t| if t == 1 { std::fs::write(&target, "new 0xc0000221\n").unwrap() });
        let mut s = LiveMonitor::new(POLL * 3, POLL).start(&p, &kb, clock, CancelToken::default());
        let alerts: Vec<Alert> = s.by_ref().collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "0xc0000221");
        assert_eq!(s.outcome().final_offset, 15);
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn cancellation_stops_within_one_poll() {
        let kb = KnowledgeBase::builtin().unwrap();
        let p = temp_log("cancel", "");
        let token = CancelToken::default();
        let remote = token.clone();
        let clock = FakeClock::new(move |t| if t == 1 { remote.cancel() });
        let mut s = LiveMonitor::new(POLL * 100, POLL).start(&p, &kb, clock, token);
        assert!(s.next().is_none());
        assert_eq!(s.state(), MonitorState::Cancelled);
        assert_eq!(s.outcome().polls, 0);
        assert_eq!(s.outcome().elapsed_secs, 2.0);
        let _ = std::fs::remove_file(&p);
    }
}
