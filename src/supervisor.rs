//! Long-running link health monitor.
//!
//! Each cycle checks adapter liveness, enumerates active connections, samples
//! link quality and RSSI per handle and reports unhealthy links as
//! [`SupervisorAction`]s. The supervisor never touches the bring-up path; it
//! only asks whoever owns the stack to restart it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::config::SupervisorConfig;
use crate::errors::CommandError;
use crate::framer::CancelToken;
use crate::hci::{
    CommandEngine, EventPayload, EVT_CONN_COMPLETE, EVT_DISCONN_COMPLETE, EVT_SYNC_CONN_COMPLETE,
    OP_READ_LINK_QUALITY, OP_READ_RSSI,
};
use crate::transport::ByteStream;

/// Substituted when a link-quality query fails.
pub const FAILED_LINK_QUALITY: u8 = 0;
/// Substituted when an RSSI query fails.
pub const FAILED_RSSI: i8 = -100;

const ACL_LINK_TYPE: u8 = 0x01;
/// Connection handles are 12 bits; the top nibble carries packet flags.
const HANDLE_MASK: u16 = 0x0FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Acl,
    Sco,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Acl => f.write_str("ACL"),
            LinkKind::Sco => f.write_str("SCO"),
        }
    }
}

/// Device address as carried in HCI events (least significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// A connection the controller reports as open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveLink {
    pub handle: u16,
    pub peer: BdAddr,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Unknown,
    Tracked,
    Degraded,
    Recovering,
}

/// Result of applying one sample to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Healthy,
    Degraded,
    /// The failure bound was reached; recovery must be requested once.
    Recover,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub peer: BdAddr,
    pub handle: u16,
    pub kind: LinkKind,
    pub link_quality: u8,
    pub rssi: i8,
    pub consecutive_failures: u32,
    pub last_seen: Instant,
    pub state: RecordState,
}

impl ConnectionRecord {
    pub fn new(link: &ActiveLink) -> Self {
        Self {
            peer: link.peer,
            handle: link.handle,
            kind: link.kind,
            link_quality: 0,
            rssi: 0,
            consecutive_failures: 0,
            last_seen: Instant::now(),
            state: RecordState::Unknown,
        }
    }

    pub fn observe(&mut self, link_quality: u8, rssi: i8, config: &SupervisorConfig) -> Observation {
        self.link_quality = link_quality;
        self.rssi = rssi;
        self.last_seen = Instant::now();

        let degraded =
            link_quality < config.link_quality_threshold || rssi < config.rssi_threshold;
        if !degraded {
            self.consecutive_failures = 0;
            self.state = RecordState::Tracked;
            return Observation::Healthy;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= config.failure_bound {
            self.consecutive_failures = 0;
            self.state = RecordState::Recovering;
            Observation::Recover
        } else {
            self.state = RecordState::Degraded;
            Observation::Degraded
        }
    }
}

/// What the supervisor asks of the process that owns the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    /// A sample fell below threshold; informational.
    Degraded {
        peer: BdAddr,
        handle: u16,
        link_quality: u8,
        rssi: i8,
        failures: u32,
    },
    /// A link stayed degraded for the failure bound; restart the stack.
    Recovering { peer: BdAddr, handle: u16 },
    /// The control interface stopped answering; restart the stack.
    AdapterLost,
}

impl SupervisorAction {
    pub fn restarts_stack(&self) -> bool {
        !matches!(self, SupervisorAction::Degraded { .. })
    }
}

/// Source of connection and radio-health information.
///
/// `CommandError::Busy` from any method makes the supervisor skip the rest of
/// the cycle.
pub trait ControllerProbe: Send {
    fn adapter_alive(&mut self) -> Result<bool, CommandError>;

    fn active_links(&mut self) -> Result<Vec<ActiveLink>, CommandError>;

    fn link_quality(&mut self, handle: u16) -> Result<u8, CommandError>;

    fn rssi(&mut self, handle: u16) -> Result<i8, CommandError>;
}

/// Out-of-band adapter liveness, for hosts where another owner holds the line.
pub trait LivenessCheck: Send {
    fn is_alive(&mut self) -> bool;
}

/// Probe that talks to the controller through the shared command engine.
pub struct HciProbe<S: ByteStream> {
    engine: Arc<CommandEngine<S>>,
    links: BTreeMap<u16, ActiveLink>,
    query_timeout: Duration,
    event_window: Duration,
    liveness: Option<Box<dyn LivenessCheck>>,
}

impl<S: ByteStream> HciProbe<S> {
    pub fn new(engine: Arc<CommandEngine<S>>, config: &SupervisorConfig) -> Self {
        Self {
            engine,
            links: BTreeMap::new(),
            query_timeout: config.query_timeout(),
            event_window: config.event_window(),
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, check: Box<dyn LivenessCheck>) -> Self {
        self.liveness = Some(check);
        self
    }

    fn apply_event(&mut self, event: &EventPayload) {
        match (event.code, event.params.as_slice()) {
            (
                EVT_CONN_COMPLETE | EVT_SYNC_CONN_COMPLETE,
                [0x00, h_lo, h_hi, a0, a1, a2, a3, a4, a5, link_type, ..],
            ) => {
                let kind = if event.code == EVT_CONN_COMPLETE && *link_type == ACL_LINK_TYPE {
                    LinkKind::Acl
                } else {
                    LinkKind::Sco
                };
                let link = ActiveLink {
                    handle: u16::from_le_bytes([*h_lo, *h_hi]) & HANDLE_MASK,
                    peer: BdAddr([*a0, *a1, *a2, *a3, *a4, *a5]),
                    kind,
                };
                debug!("{} link {:#05X} to {} opened", link.kind, link.handle, link.peer);
                self.links.insert(link.handle, link);
            }
            (EVT_DISCONN_COMPLETE, [0x00, h_lo, h_hi, ..]) => {
                let handle = u16::from_le_bytes([*h_lo, *h_hi]) & HANDLE_MASK;
                if self.links.remove(&handle).is_some() {
                    debug!("link {:#05X} closed", handle);
                }
            }
            (EVT_CONN_COMPLETE | EVT_SYNC_CONN_COMPLETE | EVT_DISCONN_COMPLETE, [status, ..]) => {
                debug!("event {:#04X} with status {:#04X} ignored", event.code, status);
            }
            _ => {}
        }
    }

    fn query(&self, opcode: u16, handle: u16) -> Result<u8, CommandError> {
        let event =
            self.engine
                .send_command_with_timeout(opcode, &handle.to_le_bytes(), self.query_timeout)?;
        match event.return_params() {
            [lo, hi, value, ..] => {
                let answered = u16::from_le_bytes([*lo, *hi]) & HANDLE_MASK;
                if answered != handle & HANDLE_MASK {
                    return Err(CommandError::MalformedEvent(format!(
                        "{:#06X} for handle {:#05X} answered for {:#05X}",
                        opcode, handle, answered
                    )));
                }
                Ok(*value)
            }
            other => Err(CommandError::MalformedEvent(format!(
                "{:#06X} returned {} bytes",
                opcode,
                other.len()
            ))),
        }
    }
}

impl<S: ByteStream> ControllerProbe for HciProbe<S> {
    fn adapter_alive(&mut self) -> Result<bool, CommandError> {
        if let Some(check) = self.liveness.as_mut() {
            return Ok(check.is_alive());
        }
        match self.engine.read_local_version_with_timeout(self.query_timeout) {
            Ok(_) => Ok(true),
            Err(e @ CommandError::Busy) => Err(e),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!("liveness query failed: {}", e);
                Ok(false)
            }
        }
    }

    fn active_links(&mut self) -> Result<Vec<ActiveLink>, CommandError> {
        self.engine.poll_events(self.event_window)?;
        for event in self.engine.drain_unsolicited() {
            self.apply_event(&event);
        }
        Ok(self.links.values().copied().collect())
    }

    fn link_quality(&mut self, handle: u16) -> Result<u8, CommandError> {
        self.query(OP_READ_LINK_QUALITY, handle)
    }

    fn rssi(&mut self, handle: u16) -> Result<i8, CommandError> {
        self.query(OP_READ_RSSI, handle).map(|v| v as i8)
    }
}

/// Process-wide supervisor counters.
#[derive(Debug)]
pub struct SupervisorStats {
    started: Instant,
    connections_seen: AtomicU64,
    active: AtomicUsize,
    sco_active: AtomicUsize,
    recoveries: AtomicU64,
    skipped_cycles: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub connections_seen: u64,
    pub active: usize,
    pub sco_active: usize,
    pub recoveries: u64,
    pub skipped_cycles: u64,
}

impl SupervisorStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_seen: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            sco_active: AtomicUsize::new(0),
            recoveries: AtomicU64::new(0),
            skipped_cycles: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started.elapsed(),
            connections_seen: self.connections_seen.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            sco_active: self.sco_active.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            skipped_cycles: self.skipped_cycles.load(Ordering::Relaxed),
        }
    }
}

impl Default for SupervisorStats {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_STATS: Lazy<Arc<SupervisorStats>> = Lazy::new(|| Arc::new(SupervisorStats::new()));

/// Counters shared by every supervisor in this process.
pub fn global_stats() -> Arc<SupervisorStats> {
    Arc::clone(&GLOBAL_STATS)
}

pub struct Supervisor<P: ControllerProbe> {
    probe: P,
    config: SupervisorConfig,
    records: BTreeMap<u16, ConnectionRecord>,
    stats: Arc<SupervisorStats>,
}

impl<P: ControllerProbe> Supervisor<P> {
    pub fn new(probe: P, config: SupervisorConfig) -> Self {
        Self::with_stats(probe, config, global_stats())
    }

    pub fn with_stats(probe: P, config: SupervisorConfig, stats: Arc<SupervisorStats>) -> Self {
        Self {
            probe,
            config,
            records: BTreeMap::new(),
            stats,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    pub fn record(&self, handle: u16) -> Option<&ConnectionRecord> {
        self.records.get(&handle)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn skip_cycle(&self, what: &str) -> Vec<SupervisorAction> {
        debug!("controller busy during {}; skipping cycle", what);
        self.stats.skipped_cycles.fetch_add(1, Ordering::Relaxed);
        Vec::new()
    }

    /// Run one supervision cycle and return the resulting actions.
    pub fn run_cycle(&mut self) -> Vec<SupervisorAction> {
        match self.probe.adapter_alive() {
            Ok(true) => {}
            Ok(false) => {
                warn!("adapter not responding; requesting stack restart");
                self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                return vec![SupervisorAction::AdapterLost];
            }
            Err(CommandError::Busy) => return self.skip_cycle("liveness check"),
            Err(e) if e.is_cancelled() => return Vec::new(),
            Err(e) => {
                warn!("adapter liveness check failed: {}", e);
                self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                return vec![SupervisorAction::AdapterLost];
            }
        }

        let links = match self.probe.active_links() {
            Ok(links) => links,
            Err(CommandError::Busy) => return self.skip_cycle("connection listing"),
            Err(e) => {
                warn!("failed to get connection list: {}", e);
                return Vec::new();
            }
        };

        let present: HashSet<u16> = links.iter().map(|l| l.handle).collect();
        self.records.retain(|handle, record| {
            let keep = present.contains(handle);
            if !keep {
                info!("{} link {:#05X} to {} gone", record.kind, handle, record.peer);
            }
            keep
        });

        let mut actions = Vec::new();
        for link in &links {
            let record = self.records.entry(link.handle).or_insert_with(|| {
                info!("tracking {} link {:#05X} to {}", link.kind, link.handle, link.peer);
                self.stats.connections_seen.fetch_add(1, Ordering::Relaxed);
                ConnectionRecord::new(link)
            });

            let link_quality = match self.probe.link_quality(link.handle) {
                Ok(v) => v,
                Err(CommandError::Busy) => return self.finish_partial(actions, &links),
                Err(e) => {
                    debug!("link quality query for {:#05X} failed: {}", link.handle, e);
                    FAILED_LINK_QUALITY
                }
            };
            let rssi = match self.probe.rssi(link.handle) {
                Ok(v) => v,
                Err(CommandError::Busy) => return self.finish_partial(actions, &links),
                Err(e) => {
                    debug!("rssi query for {:#05X} failed: {}", link.handle, e);
                    FAILED_RSSI
                }
            };

            match record.observe(link_quality, rssi, &self.config) {
                Observation::Healthy => {}
                Observation::Degraded => {
                    warn!(
                        "poor link quality: {} LQ={} RSSI={} ({} consecutive)",
                        record.peer, link_quality, rssi, record.consecutive_failures
                    );
                    actions.push(SupervisorAction::Degraded {
                        peer: record.peer,
                        handle: record.handle,
                        link_quality,
                        rssi,
                        failures: record.consecutive_failures,
                    });
                }
                Observation::Recover => {
                    warn!(
                        "link {} degraded for {} samples; requesting recovery",
                        record.peer, self.config.failure_bound
                    );
                    self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                    actions.push(SupervisorAction::Recovering {
                        peer: record.peer,
                        handle: record.handle,
                    });
                }
            }
        }

        self.update_active(&links);
        actions
    }

    fn finish_partial(
        &self,
        actions: Vec<SupervisorAction>,
        links: &[ActiveLink],
    ) -> Vec<SupervisorAction> {
        self.skip_cycle("link sampling");
        self.update_active(links);
        actions
    }

    fn update_active(&self, links: &[ActiveLink]) {
        let sco = links.iter().filter(|l| l.kind == LinkKind::Sco).count();
        self.stats.active.store(links.len(), Ordering::Relaxed);
        self.stats.sco_active.store(sco, Ordering::Relaxed);
    }

    pub fn log_statistics(&self) {
        let s = self.stats.snapshot();
        info!(
            "supervisor: uptime {}s, connections seen {}, active {} ({} SCO), recoveries {}, skipped cycles {}",
            s.uptime.as_secs(),
            s.connections_seen,
            s.active,
            s.sco_active,
            s.recoveries,
            s.skipped_cycles
        );
        for r in self.records.values() {
            info!(
                "  {}: type={} handle={:#05X} LQ={} RSSI={} state={:?}",
                r.peer, r.kind, r.handle, r.link_quality, r.rssi, r.state
            );
        }
    }

    /// Supervise until `stop` is cancelled or nobody listens for actions.
    pub fn run(&mut self, actions: &Sender<SupervisorAction>, stop: &CancelToken) {
        info!(
            "link supervisor started (interval {:?}, LQ < {}, RSSI < {}, bound {})",
            self.config.interval(),
            self.config.link_quality_threshold,
            self.config.rssi_threshold,
            self.config.failure_bound
        );
        let mut last_stats = Instant::now();

        while !stop.is_cancelled() {
            for action in self.run_cycle() {
                if actions.send(action).is_err() {
                    debug!("action receiver dropped; stopping supervisor");
                    self.log_statistics();
                    return;
                }
            }

            if last_stats.elapsed() >= self.config.stats_interval() {
                self.log_statistics();
                last_stats = Instant::now();
            }

            if stop.sleep(self.config.interval()).is_err() {
                break;
            }
        }

        info!("link supervisor stopped");
        self.log_statistics();
    }
}

impl<P: ControllerProbe + 'static> Supervisor<P> {
    /// Run on a dedicated thread.
    pub fn spawn(
        mut self,
        actions: Sender<SupervisorAction>,
        stop: CancelToken,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("link-supervisor".into())
            .spawn(move || self.run(&actions, &stop))
    }
}
