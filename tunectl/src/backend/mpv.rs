//! mpv backend over its JSON IPC socket
//!
//! mpv is started with `--idle` and stays alive between
//! tracks. Commands are written as `{"command": [...], "request_id": N}` lines;
//! replies carry the same `request_id` and are routed back to the waiting
//! caller, everything else on the socket is an event.
//!
//! If mpv dies, `restart` starts a fresh process on a new socket and
//! re-applies volume, output device and equalizer.
//!
//! Load ids are mpv playlist entry ids. Position updates from the
//! `time-pos` observer carry no entry id, so they are tagged with the entry
//! of the most recent `start-file` event.

use super::{BackendEvent, MediaBackend};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunectl_common::config::{BackendConfig, ConfigPaths};
use tunectl_common::protocol::{OutputDevice, AUTO_DEVICE, EQ_BANDS, EQ_FREQUENCIES_HZ};

const TIME_POS_OBSERVER: u64 = 1;
const DURATION_OBSERVER: u64 = 2;

/// How long mpv gets to create its IPC socket
const SOCKET_WAIT: Duration = Duration::from_secs(2);
const SOCKET_POLL: Duration = Duration::from_millis(100);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// A message read from the mpv socket
#[derive(Debug, PartialEq)]
enum MpvMessage {
    Reply {
        request_id: u64,
        result: std::result::Result<Value, String>,
    },
    Event(BackendEvent),
    Ignored,
}

/// Entry tracking for events that do not name their playlist entry
#[derive(Debug, Default)]
struct LoadTracker {
    started: u64,
    current: u64,
}

impl LoadTracker {
    fn parse(&mut self, value: &Value) -> MpvMessage {
        if let Some(request_id) = value.get("request_id").and_then(Value::as_u64) {
            let error = value.get("error").and_then(Value::as_str).unwrap_or("success");
            let result = if error == "success" {
                Ok(value.get("data").cloned().unwrap_or(Value::Null))
            } else {
                Err(error.to_string())
            };
            return MpvMessage::Reply { request_id, result };
        }

        let entry_id = value.get("playlist_entry_id").and_then(Value::as_u64);
        match value.get("event").and_then(Value::as_str) {
            Some("start-file") => {
                self.started += 1;
                self.current = entry_id.unwrap_or(self.started);
                MpvMessage::Ignored
            }
            Some("end-file") => {
                let load_id = entry_id.unwrap_or(self.current);
                match value.get("reason").and_then(Value::as_str) {
                    Some("eof") => MpvMessage::Event(BackendEvent::TrackEnded { load_id }),
                    Some("error") => {
                        let file_error = value.get("file_error").and_then(Value::as_str).unwrap_or("unknown");
                        warn!("mpv failed to play entry {}: {}", load_id, file_error);
                        MpvMessage::Event(BackendEvent::TrackEnded { load_id })
                    }
                    _ => MpvMessage::Ignored,
                }
            }
            Some("property-change") => {
                let Some(secs) = value.get("data").and_then(Value::as_f64) else {
                    return MpvMessage::Ignored;
                };
                match value.get("id").and_then(Value::as_u64) {
                    Some(TIME_POS_OBSERVER) => MpvMessage::Event(BackendEvent::Position {
                        load_id: self.current,
                        secs,
                    }),
                    Some(DURATION_OBSERVER) => MpvMessage::Event(BackendEvent::Duration {
                        load_id: self.current,
                        secs,
                    }),
                    _ => MpvMessage::Ignored,
                }
            }
            Some("log-message") => {
                let prefix = value.get("prefix").and_then(Value::as_str).unwrap_or("");
                let level = value.get("level").and_then(Value::as_str).unwrap_or("");
                if prefix.starts_with("ao") && matches!(level, "error" | "fatal") {
                    let text = value.get("text").and_then(Value::as_str).unwrap_or("").trim();
                    MpvMessage::Event(BackendEvent::DeviceError {
                        message: text.to_string(),
                    })
                } else {
                    MpvMessage::Ignored
                }
            }
            _ => MpvMessage::Ignored,
        }
    }
}

/// Build the `af` property value for ten-band gains
///
/// All-zero gains clear the filter chain.
fn equalizer_filter(gains: &[i8; EQ_BANDS]) -> String {
    if gains.iter().all(|g| *g == 0) {
        return String::new();
    }
    let bands: Vec<String> = EQ_FREQUENCIES_HZ
        .iter()
        .zip(gains)
        .map(|(freq, gain)| format!("equalizer=f={}:t=o:w=1:g={}", freq, gain))
        .collect();
    format!("lavfi=[{}]", bands.join(","))
}

fn parse_devices(data: &Value) -> Vec<OutputDevice> {
    data.as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?.to_string();
                    let description = entry
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or(&name)
                        .to_string();
                    Some(OutputDevice { name, description })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One running mpv process and its IPC connection
struct Session {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
    socket_path: PathBuf,
}

impl Session {
    async fn start(
        config: &BackendConfig,
        paths: &ConfigPaths,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let socket_path = paths.backend_socket_path(&id[..8]);
        remove_socket(&socket_path);

        let mut child = Command::new(&config.mpv_path)
            .arg("--idle=yes")
            .arg("--no-video")
            .arg("--no-terminal")
            .arg("--audio-display=no")
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Backend(format!("mpv executable not found: {}", config.mpv_path))
                } else {
                    Error::Io(e)
                }
            })?;
        info!("Started mpv (pid {:?}), IPC at {}", child.id(), socket_path.display());

        let stream = connect_when_ready(&socket_path, &mut child).await?;
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), events));

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            child: Mutex::new(Some(child)),
            reader,
            socket_path,
        })
    }

    /// Drop the connection, then wait for the process to exit (killing it after `timeout`)
    ///
    /// The reader goes first so a closed session never reports `Exited`.
    async fn close(&self, timeout: Duration) {
        self.reader.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => info!("mpv exited: {}", status),
                _ => {
                    warn!("mpv did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill mpv: {}", e);
                    }
                }
            }
        }
        remove_socket(&self.socket_path);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Settings re-applied to a restarted mpv
#[derive(Debug, Clone, Default)]
struct Restore {
    volume: Option<u8>,
    audio_device: Option<String>,
    filter: Option<String>,
}

/// mpv driven over JSON IPC, restartable after the process goes away
pub struct MpvBackend {
    config: BackendConfig,
    paths: ConfigPaths,
    events: mpsc::Sender<BackendEvent>,
    session: Mutex<Arc<Session>>,
    restore: Mutex<Restore>,
    next_request: AtomicU64,
    loads_requested: AtomicU64,
    timeout: Duration,
}

impl MpvBackend {
    /// Start mpv and connect to its IPC socket
    pub async fn spawn(
        config: &BackendConfig,
        paths: &ConfigPaths,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Self> {
        let session = Session::start(config, paths, events.clone()).await?;
        let backend = Self {
            config: config.clone(),
            paths: paths.clone(),
            events,
            session: Mutex::new(Arc::new(session)),
            restore: Mutex::new(Restore::default()),
            next_request: AtomicU64::new(0),
            loads_requested: AtomicU64::new(0),
            timeout: config.command_timeout(),
        };
        backend.observe().await?;
        Ok(backend)
    }

    async fn observe(&self) -> Result<()> {
        self.command(json!(["observe_property", TIME_POS_OBSERVER, "time-pos"]))
            .await?;
        self.command(json!(["observe_property", DURATION_OBSERVER, "duration"]))
            .await?;
        self.command(json!(["request_log_messages", "error"])).await?;
        Ok(())
    }

    async fn command(&self, args: Value) -> Result<Value> {
        let session = self.session.lock().await.clone();
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        session.pending.lock().await.insert(request_id, tx);

        let mut line = serde_json::to_string(&json!({"command": args, "request_id": request_id}))?;
        line.push('\n');
        debug!("mpv <- {}", line.trim_end());

        let write = async {
            let mut writer = session.writer.lock().await;
            writer.write_all(line.as_bytes()).await
        };
        let written = tokio::time::timeout(self.timeout, write).await;
        if !matches!(written, Ok(Ok(()))) {
            session.pending.lock().await.remove(&request_id);
            return Err(Error::BackendUnresponsive(format!("could not write {} to mpv", args)));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::BackendUnresponsive("mpv connection closed".to_string())),
            Err(_) => {
                session.pending.lock().await.remove(&request_id);
                Err(Error::BackendUnresponsive(format!(
                    "no reply to {} within {} ms",
                    args,
                    self.timeout.as_millis()
                )))
            }
        }
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.command(json!(["set_property", name, value])).await.map(|_| ())
    }
}

async fn connect_when_ready(socket_path: &Path, child: &mut Child) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::Backend(format!("mpv exited during startup: {}", status)));
        }
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                if let Err(kill_err) = child.kill().await {
                    warn!("Failed to kill mpv after startup timeout: {}", kill_err);
                }
                return Err(Error::BackendUnresponsive(format!(
                    "mpv IPC socket {} not ready: {}",
                    socket_path.display(),
                    e
                )));
            }
            Err(_) => tokio::time::sleep(SOCKET_POLL).await,
        }
    }
}

async fn read_loop(read_half: OwnedReadHalf, pending: Pending, events: mpsc::Sender<BackendEvent>) {
    let mut lines = BufReader::new(read_half).lines();
    let mut tracker = LoadTracker::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("mpv IPC read failed: {}", e);
                break;
            }
        };
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring malformed mpv message: {}", e);
                continue;
            }
        };
        match tracker.parse(&value) {
            MpvMessage::Reply { request_id, result } => {
                if let Some(tx) = pending.lock().await.remove(&request_id) {
                    let _ = tx.send(result.map_err(|e| Error::Backend(format!("mpv: {}", e))));
                }
            }
            MpvMessage::Event(event) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            MpvMessage::Ignored => {}
        }
    }

    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(Error::BackendUnresponsive("mpv connection closed".to_string())));
    }
    info!("mpv IPC connection closed");
    let _ = events.send(BackendEvent::Exited).await;
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl MediaBackend for MpvBackend {
    fn name(&self) -> &'static str {
        "mpv"
    }

    async fn load(&self, url: &str) -> Result<u64> {
        self.set_property("pause", json!(true)).await?;
        let data = self.command(json!(["loadfile", url, "replace"])).await?;
        let requested = self.loads_requested.fetch_add(1, Ordering::Relaxed) + 1;
        let load_id = data
            .get("playlist_entry_id")
            .and_then(Value::as_u64)
            .unwrap_or(requested);
        debug!("mpv loaded {} as entry {}", url, load_id);
        Ok(load_id)
    }

    async fn play(&self) -> Result<()> {
        self.set_property("pause", json!(false)).await
    }

    async fn pause(&self) -> Result<()> {
        self.set_property("pause", json!(true)).await
    }

    async fn stop(&self) -> Result<()> {
        self.command(json!(["stop"])).await.map(|_| ())
    }

    async fn seek(&self, position_secs: f64) -> Result<()> {
        self.command(json!(["seek", position_secs, "absolute"]))
            .await
            .map(|_| ())
    }

    async fn set_volume(&self, level: u8) -> Result<()> {
        self.set_property("volume", json!(level)).await?;
        self.restore.lock().await.volume = Some(level);
        Ok(())
    }

    async fn set_output_device(&self, device: &str) -> Result<()> {
        if device != AUTO_DEVICE {
            let devices = self.list_devices().await?;
            if !devices.iter().any(|d| d.name == device) {
                return Err(Error::DeviceUnavailable(device.to_string()));
            }
        }
        match self.set_property("audio-device", json!(device)).await {
            Ok(()) => {
                self.restore.lock().await.audio_device = Some(device.to_string());
                Ok(())
            }
            Err(Error::Backend(msg)) => Err(Error::DeviceUnavailable(format!("{}: {}", device, msg))),
            Err(other) => Err(other),
        }
    }

    async fn list_devices(&self) -> Result<Vec<OutputDevice>> {
        let data = self.command(json!(["get_property", "audio-device-list"])).await?;
        Ok(parse_devices(&data))
    }

    async fn set_equalizer(&self, gains: &[i8; EQ_BANDS]) -> Result<()> {
        let filter = equalizer_filter(gains);
        self.set_property("af", json!(filter)).await?;
        self.restore.lock().await.filter = Some(filter);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let old = self.session.lock().await.clone();
        old.close(self.timeout).await;

        let session = Session::start(&self.config, &self.paths, self.events.clone()).await?;
        *self.session.lock().await = Arc::new(session);
        self.observe().await?;

        let restore = self.restore.lock().await.clone();
        if let Some(level) = restore.volume {
            self.set_property("volume", json!(level)).await?;
        }
        if let Some(device) = restore.audio_device {
            if let Err(e) = self.set_property("audio-device", json!(device)).await {
                warn!("Could not restore output device {}: {}", device, e);
            }
        }
        if let Some(filter) = restore.filter {
            self.set_property("af", json!(filter)).await?;
        }
        info!("mpv restarted");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // mpv may close the socket before answering `quit`
        if let Err(e) = self.command(json!(["quit"])).await {
            debug!("mpv quit: {}", e);
        }
        let session = self.session.lock().await.clone();
        session.close(self.timeout).await;
        Ok(())
    }
}
