//! # Serialized RCON gateway.
//!
//! The only path by which the supervisor mutates game state. Commands are
//! handed to an external RCON client binary and the merged output returned.
//!
//! At most one invocation is in flight across the whole supervisor: callers
//! queue on a single async mutex in arrival order. A handler must never call
//! back into the gateway from within an invocation; that deadlocks and is
//! prohibited.
//!
//! Every invocation gets one minute. On expiry the client subprocess is
//! killed and [`RconError::Timeout`] returned. The gateway does not retry;
//! retry policy belongs to the caller.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error};

use crate::config::RconConfig;
use crate::error::RconError;

/// Deadline for a single RCON invocation.
pub const RCON_TIMEOUT: Duration = Duration::from_secs(60);

/// Literal prefix the game prints when it rejects a command.
const UNKNOWN_COMMAND: &str = "Unknown command: ";

pub struct RconGateway {
    serial: Mutex<()>,
    up: Arc<AtomicBool>,
    timeout: Duration,
}

impl RconGateway {
    /// `up` reflects whether the child process is running; the gateway
    /// refuses to run commands while it is false.
    pub fn new(up: Arc<AtomicBool>) -> Self {
        Self {
            serial: Mutex::new(()),
            up,
            timeout: RCON_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one command through the external client and returns its output.
    pub async fn run(&self, endpoint: &RconConfig, cmd: &str) -> Result<String, RconError> {
        let _serial = self.serial.lock().await;

        if !self.up.load(Ordering::SeqCst) {
            return Err(RconError::ServerDown);
        }

        debug!(cmd, "running rcon command");
        let child = Command::new(&endpoint.binary)
            .arg("-H")
            .arg(&endpoint.address)
            .arg("-p")
            .arg(endpoint.port.to_string())
            .arg("-P")
            .arg(&endpoint.pass)
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RconError::Failed {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            })?;

        // Dropping the in-flight future on expiry kills the client process.
        let output = match time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_elapsed) => {
                return Err(RconError::Timeout {
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(RconError::Failed {
                    cmd: cmd.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            error!(cmd, status = %output.status, output = %text, "rcon client failed");
            return Err(RconError::Failed {
                cmd: cmd.to_string(),
                reason: format!("client exited with {}", output.status),
            });
        }

        if text.starts_with(UNKNOWN_COMMAND) {
            return Err(RconError::InvalidCommand { output: text });
        }

        Ok(text.trim_end_matches('\n').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(binary: &str) -> RconConfig {
        RconConfig {
            binary: binary.into(),
            address: String::from("127.0.0.1"),
            port: 27015,
            pass: String::from("secret"),
        }
    }

    fn gateway(up: bool) -> RconGateway {
        let flag = Arc::new(AtomicBool::new(up));
        RconGateway::new(flag)
    }

    #[tokio::test]
    async fn refuses_when_server_is_down() {
        let gw = gateway(false);
        let err = gw.run(&endpoint("echo"), "status").await.unwrap_err();
        assert!(matches!(err, RconError::ServerDown));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn returns_trimmed_client_output() {
        let gw = gateway(true);
        let out = gw.run(&endpoint("echo"), "status").await.unwrap();
        assert_eq!(out, "-H 127.0.0.1 -p 27015 -P secret status");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detects_server_side_rejection() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-rcon");
        std::fs::write(&script, "#!/bin/sh\necho \"Unknown command: $7\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gw = gateway(true);
        let err = gw
            .run(&endpoint(script.to_str().unwrap()), "bogus")
            .await
            .unwrap_err();
        match err {
            RconError::InvalidCommand { output } => {
                assert!(output.contains("bogus"), "original text kept: {output}")
            }
            other => panic!("expected InvalidCommand, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_and_kills_the_client() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-rcon");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gw = gateway(true).with_timeout(Duration::from_millis(50));
        let err = gw
            .run(&endpoint(script.to_str().unwrap()), "30")
            .await
            .unwrap_err();
        assert!(matches!(err, RconError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invocations_never_overlap() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = dir.path().join("slow-rcon");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho start >> {log}\nsleep 0.2\necho end >> {log}\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gw = Arc::new(gateway(true));
        let ep = endpoint(script.to_str().unwrap());

        let a = {
            let gw = gw.clone();
            let ep = ep.clone();
            tokio::spawn(async move { gw.run(&ep, "first").await })
        };
        let b = {
            let gw = gw.clone();
            let ep = ep.clone();
            tokio::spawn(async move { gw.run(&ep, "second").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let order: Vec<&str> = calls.lines().collect();
        assert_eq!(order, vec!["start", "end", "start", "end"]);
    }
}
