//! PulseAudio / PipeWire default sink via the `pactl` command line tool

use super::{SystemMixer, VolumeLevel};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_SINK: &str = "@DEFAULT_SINK@";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// First `NN%` figure of `pactl get-sink-volume` output, clamped to 100
///
/// ```text
/// Volume: front-left: 42597 /  65% / -11.23 dB,   front-right: 42597 /  65% / -11.23 dB
///         balance 0.00
/// ```
pub fn parse_volume(output: &str) -> Option<u8> {
    output
        .split_whitespace()
        .find_map(|token| token.strip_suffix('%')?.parse::<u32>().ok())
        .map(|percent| percent.min(100) as u8)
}

/// `Mute: yes` / `Mute: no`
pub fn parse_mute(output: &str) -> Option<bool> {
    let value = output.trim().strip_prefix("Mute:")?.trim();
    match value {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// `Event 'change' on sink #57` from `pactl subscribe`
pub fn is_sink_change(line: &str) -> bool {
    line.contains("'change' on sink #")
}

pub struct PactlMixer {
    program: String,
}

impl PactlMixer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Create a mixer after checking that the default sink answers
    pub async fn probe(program: &str) -> Result<Self> {
        let mixer = Self::new(program);
        let level = mixer.get().await?;
        debug!("pactl default sink at {}", level);
        Ok(mixer)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(COMMAND_TIMEOUT, output)
            .await
            .map_err(|_| Error::Mixer(format!("{} {} timed out", self.program, args.join(" "))))?
            .map_err(|e| Error::Mixer(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(Error::Mixer(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SystemMixer for PactlMixer {
    fn name(&self) -> &'static str {
        "pactl"
    }

    async fn get(&self) -> Result<VolumeLevel> {
        let volume = self.run(&["get-sink-volume", DEFAULT_SINK]).await?;
        let mute = self.run(&["get-sink-mute", DEFAULT_SINK]).await?;
        let level = parse_volume(&volume)
            .ok_or_else(|| Error::Mixer(format!("unexpected volume output: {}", volume.trim())))?;
        let muted = parse_mute(&mute)
            .ok_or_else(|| Error::Mixer(format!("unexpected mute output: {}", mute.trim())))?;
        Ok(VolumeLevel::new(level, muted))
    }

    async fn set(&self, level: VolumeLevel) -> Result<()> {
        let percent = format!("{}%", level.level);
        self.run(&["set-sink-volume", DEFAULT_SINK, &percent]).await?;
        let mute = if level.muted { "1" } else { "0" };
        self.run(&["set-sink-mute", DEFAULT_SINK, mute]).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>> {
        let mut child = Command::new(&self.program)
            .arg("subscribe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Mixer(format!("cannot run {} subscribe: {}", self.program, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Mixer("pactl subscribe has no stdout".to_string()))?;

        // Capacity 1: one pending notification covers any burst
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if is_sink_change(&line) => {
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(()) {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!("pactl subscribe ended");
                        break;
                    }
                    Err(e) => {
                        warn!("pactl subscribe read failed: {}", e);
                        break;
                    }
                }
            }
            if let Err(e) = child.kill().await {
                debug!("pactl subscribe kill: {}", e);
            }
        });
        info!("Listening for system mixer changes");
        Ok(Some(rx))
    }
}
