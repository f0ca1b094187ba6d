//! Network traffic observers for staging-window assertions.
//!
//! A traffic observer records outbound connections while a deployment
//! stages. It is process-wide state: only one staging window may be observed
//! at a time, no other deployment may stage while it is open, and it must
//! never stay installed after its scenario ends or it would attribute
//! unrelated traffic to the next one. [`ObserverScope`] and
//! [`unobserved_window`] enforce this between them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ObserverError;

/// One observed outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub destination: String,

    /// True when the connection went through the configured proxy.
    pub via_proxy: bool,
}

impl Connection {
    pub fn direct(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            via_proxy: false,
        }
    }

    pub fn proxied(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            via_proxy: true,
        }
    }
}

/// Everything an observer recorded during one staging window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficLog {
    pub connections: Vec<Connection>,
}

impl TrafficLog {
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Short human-readable listing for diagnostics.
    pub fn summary(&self) -> String {
        if self.connections.is_empty() {
            return "no connections".to_string();
        }
        let shown: Vec<String> = self
            .connections
            .iter()
            .take(10)
            .map(|c| {
                let via = if c.via_proxy { " (proxy)" } else { "" };
                format!("{}{via}", c.destination)
            })
            .collect();
        let more = self.connections.len().saturating_sub(shown.len());
        if more > 0 {
            format!("{} connections: {} ... and {more} more", self.connections.len(), shown.join(", "))
        } else {
            format!("{} connections: {}", self.connections.len(), shown.join(", "))
        }
    }
}

/// Records network activity between `start` and `finish`.
#[async_trait]
pub trait TrafficObserver: Send + Sync {
    async fn start(&self) -> Result<(), ObserverError>;

    async fn finish(&self) -> Result<TrafficLog, ObserverError>;

    /// Whether direct (unproxied) connections show up in the log. An
    /// observer that cannot see them cannot prove staging stayed offline.
    fn sees_direct(&self) -> bool;

    /// Stop recording without producing a log. Called when a scope is
    /// dropped before it was collected, so it must not block.
    fn abort(&self) {}
}

/// Observed windows hold this exclusively, unobserved stages share it.
static STAGING_WINDOWS: RwLock<()> = RwLock::const_new(());
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether a traffic observer is currently installed in this process.
pub fn observer_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Permission to stage a deployment nobody is observing.
///
/// Any number may be held at once, but never while an [`ObserverScope`] is
/// installed, so unobserved staging traffic cannot land in an observed
/// window.
pub struct UnobservedWindow {
    _guard: RwLockReadGuard<'static, ()>,
}

/// Waits until no observer is installed and holds installation off until
/// the returned window is dropped.
pub async fn unobserved_window() -> UnobservedWindow {
    UnobservedWindow {
        _guard: STAGING_WINDOWS.read().await,
    }
}

/// An installed observer, bracketing exactly one staging window.
///
/// Installing waits for any other scope and for every [`UnobservedWindow`]
/// in the process to end. The observer is uninstalled when the scope is
/// collected or dropped, whichever comes first, including on panic and
/// cancellation.
pub struct ObserverScope {
    observer: Arc<dyn TrafficObserver>,
    collected: bool,
    _guard: RwLockWriteGuard<'static, ()>,
}

impl ObserverScope {
    pub async fn install(observer: Arc<dyn TrafficObserver>) -> Result<Self, ObserverError> {
        let guard = STAGING_WINDOWS.write().await;
        observer.start().await?;
        INSTALLED.store(true, Ordering::SeqCst);
        debug!("traffic observer installed");

        Ok(Self {
            observer,
            collected: false,
            _guard: guard,
        })
    }

    /// Finishes recording and uninstalls the observer.
    pub async fn collect(mut self) -> Result<TrafficLog, ObserverError> {
        self.collected = true;
        let log = self.observer.finish().await;
        debug!("traffic observer collected");
        log
    }
}

impl Drop for ObserverScope {
    fn drop(&mut self) {
        if !self.collected {
            warn!("traffic observer dropped before collection, aborting");
            self.observer.abort();
        }
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

struct Capture {
    child: Child,
    reader: JoinHandle<Vec<String>>,
}

/// Runs a packet-capture command for the staging window; every line it
/// prints is one direct connection.
pub struct CaptureObserver {
    program: String,
    args: Vec<String>,
    capture: Mutex<Option<Capture>>,
}

impl CaptureObserver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            capture: Mutex::new(None),
        }
    }

    /// Splits a command line on whitespace.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl TrafficObserver for CaptureObserver {
    async fn start(&self) -> Result<(), ObserverError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ObserverError::Start(format!("{}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ObserverError::Start("capture has no stdout".to_string()))?;

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    seen.push(line);
                }
            }
            seen
        });

        *self.capture.lock() = Some(Capture { child, reader });
        Ok(())
    }

    async fn finish(&self) -> Result<TrafficLog, ObserverError> {
        let capture = self.capture.lock().take();
        let Some(Capture { mut child, reader }) = capture else {
            return Err(ObserverError::Collect("capture was never started".to_string()));
        };

        if let Err(e) = child.kill().await {
            debug!(error = %e, "capture already exited");
        }
        let lines = reader
            .await
            .map_err(|e| ObserverError::Collect(e.to_string()))?;

        Ok(TrafficLog {
            connections: lines.into_iter().map(Connection::direct).collect(),
        })
    }

    fn sees_direct(&self) -> bool {
        true
    }

    fn abort(&self) {
        if let Some(mut capture) = self.capture.lock().take() {
            let _ = capture.child.start_kill();
            capture.reader.abort();
        }
    }
}

/// Reads the lines a forwarding proxy appended to its access log during the
/// staging window; each one is a proxied connection.
pub struct ProxyLogObserver {
    path: PathBuf,
    offset: Mutex<Option<u64>>,
}

impl ProxyLogObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TrafficObserver for ProxyLogObserver {
    async fn start(&self) -> Result<(), ObserverError> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(ObserverError::Start(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };
        *self.offset.lock() = Some(len);
        Ok(())
    }

    async fn finish(&self) -> Result<TrafficLog, ObserverError> {
        let Some(offset) = self.offset.lock().take() else {
            return Err(ObserverError::Collect("proxy log was never marked".to_string()));
        };

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ObserverError::Collect(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let appended = String::from_utf8_lossy(&bytes[start..]);

        Ok(TrafficLog {
            connections: appended
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(Connection::proxied)
                .collect(),
        })
    }

    fn sees_direct(&self) -> bool {
        false
    }

    fn abort(&self) {
        self.offset.lock().take();
    }
}

/// Several observers recording the same window; their logs are concatenated.
pub struct ObserverSet {
    members: Vec<Arc<dyn TrafficObserver>>,
}

impl ObserverSet {
    pub fn new(members: Vec<Arc<dyn TrafficObserver>>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl TrafficObserver for ObserverSet {
    async fn start(&self) -> Result<(), ObserverError> {
        for (started, member) in self.members.iter().enumerate() {
            if let Err(e) = member.start().await {
                for member in &self.members[..started] {
                    member.abort();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn finish(&self) -> Result<TrafficLog, ObserverError> {
        let mut log = TrafficLog::default();
        let mut first_err = None;
        for member in &self.members {
            match member.finish().await {
                Ok(part) => log.connections.extend(part.connections),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(log),
        }
    }

    fn sees_direct(&self) -> bool {
        self.members.iter().any(|m| m.sees_direct())
    }

    fn abort(&self) {
        for member in &self.members {
            member.abort();
        }
    }
}

/// Observer that reports a fixed traffic log. For tests and rehearsals.
#[derive(Debug, Default)]
pub struct ScriptedObserver {
    log: TrafficLog,
    proxy_only: bool,
    starts: Mutex<usize>,
}

impl ScriptedObserver {
    pub fn new(connections: Vec<Connection>) -> Self {
        Self {
            log: TrafficLog { connections },
            ..Self::default()
        }
    }

    /// Behaves like a proxy access log: blind to direct connections.
    pub fn proxy_only(connections: Vec<Connection>) -> Self {
        Self {
            proxy_only: true,
            ..Self::new(connections)
        }
    }

    /// How many staging windows this observer was installed for.
    pub fn starts(&self) -> usize {
        *self.starts.lock()
    }
}

#[async_trait]
impl TrafficObserver for ScriptedObserver {
    async fn start(&self) -> Result<(), ObserverError> {
        *self.starts.lock() += 1;
        Ok(())
    }

    async fn finish(&self) -> Result<TrafficLog, ObserverError> {
        Ok(self.log.clone())
    }

    fn sees_direct(&self) -> bool {
        !self.proxy_only
    }
}
