//! Multi-process singleton tests
//!
//! Runs the built `tunectl` binary with the memory backend and the system
//! mixer disabled, so nothing touches real audio.
//!
//! Tests cover:
//! - Concurrent start requests leave exactly one live singleton
//! - Commands with no singleton exit with status 3

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tunectl::InstanceRegistry;
use tunectl_common::config::ConfigPaths;

const TUNECTL: &str = env!("CARGO_BIN_EXE_tunectl");

fn tunectl(dir: &Path) -> Command {
    let mut command = Command::new(TUNECTL);
    command
        .arg("--config-dir")
        .arg(dir)
        .env_remove("TUNECTL_CONFIG_DIR")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn write_config(dir: &Path) {
    std::fs::write(
        dir.join("config.toml"),
        "[mixer]\nenabled = false\n\n[backend]\nkind = \"memory\"\n\n[playback]\nnow_playing_file = false\n",
    )
    .unwrap();
}

fn ctl(dir: &Path, command: &str) -> ExitStatus {
    tunectl(dir).args(["ctl", command]).status().unwrap()
}

fn live(children: &mut [Child]) -> Vec<u32> {
    children
        .iter_mut()
        .filter_map(|child| matches!(child.try_wait(), Ok(None)).then(|| child.id()))
        .collect()
}

#[tokio::test]
async fn test_concurrent_starts_leave_one_singleton() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path());

    let mut children: Vec<Child> = (0..5)
        .map(|_| {
            tunectl(temp.path())
                .args(["daemon", "--backend", "memory"])
                .spawn()
                .unwrap()
        })
        .collect();

    // Superseded starters exit; wait until only one is left standing
    let deadline = Instant::now() + Duration::from_secs(30);
    while live(&mut children).len() > 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    let survivors = live(&mut children);
    assert_eq!(survivors.len(), 1, "survivors: {:?}", survivors);

    // The survivor is the published singleton and answers commands
    let registry = InstanceRegistry::with_timeouts(
        ConfigPaths::new(temp.path()),
        Duration::from_secs(2),
        Duration::from_secs(5),
    );
    let mut record = None;
    for _ in 0..50 {
        record = registry.lookup().await.unwrap();
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(record.map(|r| r.pid), Some(survivors[0]));
    assert!(ctl(temp.path(), "query-state").success());

    // Quit ends the last one and leaves nobody to talk to
    assert!(ctl(temp.path(), "quit").success());
    let deadline = Instant::now() + Duration::from_secs(10);
    while !live(&mut children).is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(live(&mut children).is_empty());
    assert_eq!(ctl(temp.path(), "next").code(), Some(3));
}

#[test]
fn test_command_without_singleton_exits_with_3() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path());
    assert_eq!(ctl(temp.path(), "toggle-pause").code(), Some(3));
}
