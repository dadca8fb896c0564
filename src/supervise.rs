//! # Output and status supervision.
//!
//! Two long-lived tasks run per child lifetime:
//!
//! ```text
//!   child stdout/stderr ──► line channel ──► supervise_output ──► registry
//!                                                │                   │
//!                                                ▼                   ▼
//!                                             readiness          handlers
//!
//!   ticks ──► supervise_status ──► liveness probe / full DB refresh
//!                    │
//!                    └─ crash recovery on unexpected close
//! ```
//!
//! `supervise_output` scans the merged line stream. Until the game prints its
//! readiness sentinel, lines are logged at the init level and only named
//! events dispatch; afterwards every line goes through the registry. The
//! close token wins over pending input so shutdown is prompt.
//!
//! `supervise_status` multiplexes the outer exit token, the per-run close
//! token, and two independent tickers: a cheap RCON probe that detects hangs,
//! and the periodic full player-database refresh.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::Server;

/// Sentinel line: the game finished initializing.
const STARTUP_COMPLETE: &str = "Server startup complete.";
/// Sentinel line: the game gave up during initialization.
const STARTUP_FAILED: &str = "Server startup FAILED.";

/// Command used as a liveness probe. Cheap and side-effect free.
const PROBE_COMMAND: &str = "echo Server status check";

/// Scans the child's merged output until EOF or close.
pub(crate) async fn supervise_output(
    server: Arc<Server>,
    mut lines: mpsc::Receiver<String>,
    ready: CancellationToken,
    closed: CancellationToken,
) {
    info!("started output supervisor");
    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => break,

            line = lines.recv() => {
                let Some(line) = line else { break };
                if ready.is_cancelled() {
                    server.dispatch(&line).await;
                } else {
                    scan_init_line(&server, &ready, &line).await;
                }
            }
        }
    }
    info!("stopping output supervisor");
}

/// Pre-readiness handling: watch for the two sentinels, keep logging at the
/// init level, and still dispatch named events so early output is not lost.
async fn scan_init_line(server: &Arc<Server>, ready: &CancellationToken, line: &str) {
    match line.trim() {
        STARTUP_COMPLETE => {
            info!(target: "game::init", "server initialization completed");
            // Idempotent; releases everyone waiting on readiness.
            ready.cancel();
        }
        STARTUP_FAILED => {
            // Keep scanning so post-failure diagnostics are captured.
            error!(target: "game::init", "{STARTUP_FAILED}");
            server.crashed();
        }
        trimmed => {
            match server.events().lookup(trimmed) {
                Some(event) if !event.is_fallthrough() => {
                    server.dispatch_event(event, trimmed).await;
                }
                _ => info!(target: "game::init", "{trimmed}"),
            }
        }
    }
}

/// Health probing, full refresh scheduling, and crash recovery.
pub(crate) fn supervise_status(
    server: Arc<Server>,
    closed: CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(supervise_status_inner(server, closed))
}

async fn supervise_status_inner(server: Arc<Server>, closed: CancellationToken) {
    info!("starting status supervisor");

    let (hang_every, refresh_every) = server.cadences();
    let mut hang = time::interval_at(time::Instant::now() + hang_every, hang_every);
    hang.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut refresh =
        time::interval_at(time::Instant::now() + refresh_every, refresh_every);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit = server.exit_token();

    loop {
        tokio::select! {
            _ = exit.cancelled() => {
                // A start or restart may be mid-flight; let it settle before
                // the graceful stop so the child is not orphaned.
                while server.state().transition_in_flight() {
                    time::sleep(std::time::Duration::from_millis(250)).await;
                }
                if let Err(e) = server.stop(false).await {
                    error!(error = %e, "graceful stop failed");
                }
                break;
            }

            _ = closed.cancelled() => {
                if !server.state().transition_in_flight() {
                    warn!("server exited abnormally, restarting");
                    server.crashed();
                    if server.restart().await.is_ok() {
                        server.recovered();
                    }
                }
                break;
            }

            _ = hang.tick() => {
                let online = server.recount_online();
                debug!(online, "liveness tick");

                if server.state().transition_in_flight() {
                    continue;
                }

                match server.run_command(PROBE_COMMAND).await {
                    Ok(_) => {
                        if server.is_crashed() {
                            server.recovered();
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "liveness probe failed, killing server");
                        server.crashed();
                        server.request_kill();
                    }
                }
            }

            _ = refresh.tick() => {
                if let Err(e) = server.update_player_database(true).await {
                    warn!(error = %e, "player database refresh failed");
                }
            }
        }
    }

    info!("stopping status supervisor");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    async fn readiness(ready: &CancellationToken) {
        time::timeout(Duration::from_secs(2), ready.cancelled())
            .await
            .expect("server never became ready");
    }

    #[tokio::test]
    async fn startup_sentinel_releases_readiness() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let (tx, rx) = mpsc::channel(16);
        let ready = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(supervise_output(
            server.clone(),
            rx,
            ready.clone(),
            closed.clone(),
        ));

        tx.send(String::from("some early boot chatter")).await.unwrap();
        assert!(!ready.is_cancelled());

        tx.send(String::from(STARTUP_COMPLETE)).await.unwrap();
        readiness(&ready).await;

        drop(tx);
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn startup_failure_marks_crashed_and_keeps_scanning() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let (tx, rx) = mpsc::channel(16);
        let ready = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(supervise_output(
            server.clone(),
            rx,
            ready.clone(),
            closed.clone(),
        ));

        tx.send(String::from(STARTUP_FAILED)).await.unwrap();
        tx.send(String::from("stack trace line one")).await.unwrap();
        drop(tx);
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(server.is_crashed());
        assert!(!ready.is_cancelled());
    }

    #[tokio::test]
    async fn login_and_jump_flow_updates_the_store() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let (tx, rx) = mpsc::channel(16);
        let ready = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(supervise_output(
            server.clone(),
            rx,
            ready.clone(),
            closed.clone(),
        ));

        tx.send(String::from(STARTUP_COMPLETE)).await.unwrap();
        readiness(&ready).await;

        tx.send(String::from("Player logged in: Alice, index: 42"))
            .await
            .unwrap();
        tx.send(String::from("shipJumpEvent: 42 -3:7 Scout"))
            .await
            .unwrap();
        tx.send(String::from("unmatched chatter passes through"))
            .await
            .unwrap();

        drop(tx);
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let state = server.game_state();
        let player = state.player("42").expect("player registered on login");
        assert_eq!(player.name(), "Alice");
        assert!(player.online());
        assert_eq!(state.online_count(), 1);

        let jump = player.last_jump().expect("jump recorded");
        assert_eq!((jump.x, jump.y), (-3, 7));
        assert_eq!(jump.name, "Scout");

        let sector = state.sector(-3, 7).expect("sector created on first jump");
        assert_eq!(sector.jumps.len(), 1);
        assert_eq!(sector.jumps[0].fid, 42);
    }

    #[tokio::test]
    async fn early_named_events_dispatch_before_readiness() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let (tx, rx) = mpsc::channel(16);
        let ready = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(supervise_output(
            server.clone(),
            rx,
            ready.clone(),
            closed.clone(),
        ));

        // Jump observed while the server is still initializing.
        tx.send(String::from("shipJumpEvent: 7 1:2 EarlyBird"))
            .await
            .unwrap();
        drop(tx);
        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let state = server.game_state();
        assert!(state.sector(1, 2).is_some());
    }

    #[tokio::test]
    async fn close_request_wins_over_pending_lines() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let (tx, rx) = mpsc::channel(16);
        let ready = CancellationToken::new();
        let closed = CancellationToken::new();

        closed.cancel();
        let task = tokio::spawn(supervise_output(server, rx, ready, closed));
        tx.send(String::from("never read")).await.unwrap();

        time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
