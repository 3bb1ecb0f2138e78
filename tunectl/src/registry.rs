//! Instance registry
//!
//! Exactly one singleton per config directory. Ownership is an exclusive
//! `flock` on `<config_dir>/instance.lock`, held for the singleton's whole
//! life. The kernel drops the lock when the holder dies, so a crashed
//! instance never blocks a new one.
//!
//! The file also carries a one-line JSON [`InstanceRecord`] naming the
//! holder's pid and control socket. It is written only after the socket is
//! listening and truncated before the lock is released. The file itself is
//! never unlinked: a waiter blocked on the old inode would otherwise win a
//! lock nobody else can see.

use crate::channel::ControlClient;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunectl_common::config::{ChannelConfig, ConfigPaths};
use tunectl_common::{time, ControlCommand, StateSnapshot};

/// First retry delay while waiting for a superseded instance
pub const BACKOFF_START: Duration = Duration::from_millis(25);
/// Retry delay ceiling
pub const BACKOFF_CAP: Duration = Duration::from_millis(400);
/// Poll interval while a freshly started holder has not published its record
const RECORD_POLL: Duration = Duration::from_millis(20);

/// Contents of the lock file while a singleton is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub pid: u32,
    /// Control channel socket
    pub address: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// What the calling process wants to do
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Become the singleton, replacing a running one
    Start,
    /// Deliver one command to the running singleton
    Command(ControlCommand),
}

/// Outcome of [`InstanceRegistry::acquire_or_forward`]
#[derive(Debug)]
pub enum Role {
    Singleton(InstanceGuard),
    Forwarded(StateSnapshot),
}

/// Outcome of a single non-blocking claim attempt
#[derive(Debug)]
pub enum Claim {
    Acquired(InstanceGuard),
    /// Someone else holds the lock; their record if already published
    Held(Option<InstanceRecord>),
}

/// Proof of singleton ownership; releases the lock when dropped
#[derive(Debug)]
pub struct InstanceGuard {
    lock: Option<Flock<File>>,
    instance_id: String,
    record: Option<InstanceRecord>,
}

impl InstanceGuard {
    /// Short random id used to name this instance's sockets
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn record(&self) -> Option<&InstanceRecord> {
        self.record.as_ref()
    }

    /// Advertise the control channel; call once the socket is listening
    pub fn publish(&mut self, address: &Path) -> Result<InstanceRecord> {
        let lock = self
            .lock
            .as_ref()
            .ok_or_else(|| Error::Internal("instance lock already released".to_string()))?;
        let record = InstanceRecord {
            pid: std::process::id(),
            address: address.to_path_buf(),
            started_at: time::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        lock.set_len(0)?;
        lock.write_all_at(line.as_bytes(), 0)?;
        lock.sync_data()?;
        info!("Registered instance pid {} at {}", record.pid, address.display());
        self.record = Some(record.clone());
        Ok(record)
    }

    /// Clear the record and unlock
    pub fn release(mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            lock.set_len(0)?;
            lock.unlock().map_err(|(_, errno)| Error::Io(errno.into()))?;
            info!("Released instance lock");
        }
        Ok(())
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.set_len(0) {
                warn!("Failed to clear instance record: {}", e);
            }
        }
    }
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?)
}

fn read_record(path: &Path) -> Result<Option<InstanceRecord>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let line = content.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(line) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!("Ignoring unreadable instance record: {}", e);
            Ok(None)
        }
    }
}

/// Send SIGTERM to a superseded instance
fn terminate(pid: u32) {
    if pid == std::process::id() {
        debug!("Instance record names this process, not signalling");
        return;
    }
    let Ok(raw) = i32::try_from(pid) else {
        warn!("Instance record has invalid pid {}", pid);
        return;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => info!("Sent SIGTERM to pid {}", pid),
        Err(Errno::ESRCH) => debug!("Pid {} already gone", pid),
        Err(e) => warn!("Failed to signal pid {}: {}", pid, e),
    }
}

pub struct InstanceRegistry {
    paths: ConfigPaths,
    client_timeout: Duration,
    lock_wait: Duration,
}

impl InstanceRegistry {
    pub fn new(paths: ConfigPaths, channel: &ChannelConfig) -> Self {
        Self::with_timeouts(paths, channel.client_timeout(), channel.lock_wait())
    }

    pub fn with_timeouts(paths: ConfigPaths, client_timeout: Duration, lock_wait: Duration) -> Self {
        Self {
            paths,
            client_timeout,
            lock_wait,
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Client for the instance described by `record`
    pub fn client_for(&self, record: &InstanceRecord) -> ControlClient {
        ControlClient::new(&record.address, self.client_timeout)
    }

    /// Become the singleton, or forward a command to the existing one
    pub async fn acquire_or_forward(&self, intent: Intent) -> Result<Role> {
        match intent {
            Intent::Start => self.acquire().await.map(Role::Singleton),
            Intent::Command(command) => {
                let record = self.lookup().await?.ok_or(Error::NoRunningInstance)?;
                let snapshot = self.client_for(&record).send(command).await?;
                Ok(Role::Forwarded(snapshot))
            }
        }
    }

    /// Record of the live singleton, if any, without claiming anything
    ///
    /// A holder that has locked but not yet published gets
    /// `client_timeout` to do so.
    pub async fn lookup(&self) -> Result<Option<InstanceRecord>> {
        let path = self.paths.lock_file();
        let deadline = Instant::now() + self.client_timeout;
        loop {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match Flock::lock(file, FlockArg::LockSharedNonblock) {
                Ok(_probe) => return Ok(None),
                Err((_, Errno::EWOULDBLOCK)) => {
                    if let Some(record) = read_record(&path)? {
                        return Ok(Some(record));
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::InstanceUnresponsive(self.client_timeout.as_millis() as u64));
                    }
                    tokio::time::sleep(RECORD_POLL).await;
                }
                Err((_, errno)) => return Err(Error::Io(errno.into())),
            }
        }
    }

    /// One non-blocking attempt at the lock
    pub fn try_claim(&self) -> Result<Claim> {
        self.paths.ensure_exists()?;
        let path = self.paths.lock_file();
        let file = open_lock_file(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                // Leftovers of a holder that died without cleaning up
                lock.set_len(0)?;
                Ok(Claim::Acquired(InstanceGuard {
                    lock: Some(lock),
                    instance_id: short_id(),
                    record: None,
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(Claim::Held(read_record(&path)?)),
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }

    /// Claim the lock, asking a running instance to quit first
    ///
    /// The holder is sent `quit` over its channel; if that fails, or it is
    /// still holding on halfway through the wait window, it gets SIGTERM.
    /// Retries back off from [`BACKOFF_START`] to [`BACKOFF_CAP`].
    pub async fn acquire(&self) -> Result<InstanceGuard> {
        let started = Instant::now();
        let deadline = started + self.lock_wait;
        let mut backoff = BACKOFF_START;
        let mut asked: Option<u32> = None;
        let mut signalled: Option<u32> = None;
        let mut holder: Option<u32> = None;

        loop {
            match self.try_claim()? {
                Claim::Acquired(guard) => {
                    info!("Acquired instance lock after {} ms", started.elapsed().as_millis());
                    return Ok(guard);
                }
                Claim::Held(None) => debug!("Instance lock held, record not yet published"),
                Claim::Held(Some(record)) => {
                    holder = Some(record.pid);
                    if asked != Some(record.pid) {
                        asked = Some(record.pid);
                        if !self.request_quit(&record).await {
                            terminate(record.pid);
                            signalled = Some(record.pid);
                        }
                    } else if signalled != Some(record.pid) && started.elapsed() >= self.lock_wait / 2 {
                        warn!("Instance pid {} still running, sending SIGTERM", record.pid);
                        terminate(record.pid);
                        signalled = Some(record.pid);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let who = holder.map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {}", pid));
                return Err(Error::StaleLockTimeout(format!(
                    "instance lock held by {} after {} ms",
                    who,
                    self.lock_wait.as_millis()
                )));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Ask the holder to quit over its channel; `false` if unreachable
    async fn request_quit(&self, record: &InstanceRecord) -> bool {
        info!("Replacing running instance (pid {})", record.pid);
        match self.client_for(record).send(ControlCommand::Quit).await {
            Ok(_) | Err(Error::ShuttingDown) => {
                debug!("Instance pid {} acknowledged quit", record.pid);
                true
            }
            Err(e) => {
                warn!("Instance pid {} unreachable: {}", record.pid, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &Path) -> InstanceRegistry {
        InstanceRegistry::with_timeouts(
            ConfigPaths::new(dir),
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
    }

    #[tokio::test]
    async fn test_lookup_without_lock_file_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(registry(temp.path()).lookup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_claim_sees_published_record() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let Claim::Acquired(mut guard) = registry.try_claim().unwrap() else {
            panic!("first claim should succeed");
        };
        let record = guard.publish(&temp.path().join("ctl-x.sock")).unwrap();

        match registry.try_claim().unwrap() {
            Claim::Held(Some(held)) => assert_eq!(held, record),
            other => panic!("expected held lock, got {:?}", other),
        }
        assert_eq!(registry.lookup().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_release_clears_record_and_keeps_file() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let Claim::Acquired(mut guard) = registry.try_claim().unwrap() else {
            panic!("claim should succeed");
        };
        guard.publish(&temp.path().join("ctl-x.sock")).unwrap();
        guard.release().unwrap();

        let lock_file = registry.paths().lock_file();
        assert!(lock_file.exists());
        assert_eq!(std::fs::read_to_string(&lock_file).unwrap(), "");
        assert!(registry.lookup().await.unwrap().is_none());
        assert!(matches!(registry.try_claim().unwrap(), Claim::Acquired(_)));
    }

    #[tokio::test]
    async fn test_unpublished_holder_makes_lookup_time_out() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        let _guard = registry.try_claim().unwrap();

        let result = registry.lookup().await;
        assert!(matches!(result, Err(Error::InstanceUnresponsive(_))));
    }

    #[tokio::test]
    async fn test_leftover_record_of_dead_holder_is_ignored() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        std::fs::write(
            registry.paths().lock_file(),
            r#"{"pid":999999,"address":"/nowhere.sock","started_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(registry.lookup().await.unwrap().is_none());
        assert!(matches!(registry.try_claim().unwrap(), Claim::Acquired(_)));
    }
}
