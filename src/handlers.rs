//! Built-in game event handlers.
//!
//! [`registry`] assembles the full event registry for a run: the built-in
//! events first, then the operator-configured logged events, then the `.*`
//! fallthrough. Configured events that fail to register are skipped with a
//! warning rather than aborting startup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bridge::ChatMessage;
use crate::config::Config;
use crate::error::EventError;
use crate::events::{EventDescriptor, EventHandler, EventRegistry, EVENT_NONE};
use crate::server::Server;

/// Builds the event registry for a server run.
pub fn registry(config: &Config) -> Result<EventRegistry, EventError> {
    let mut reg = EventRegistry::new();

    reg.register(
        "EventConnection",
        "",
        r"^([0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}):[0-9]{1,5} is connecting\.\.\.$",
        Arc::new(Connection),
    )?;
    reg.register(
        "EventPlayerJoin",
        "",
        r"^Player logged in: (.+), index: ([0-9]+)$",
        Arc::new(PlayerJoin),
    )?;
    reg.register(
        "EventPlayerLeft",
        "",
        r"^<Server> (.+) left the galaxy$",
        Arc::new(PlayerLeft),
    )?;
    reg.register(
        "EventShipJump",
        "",
        r"^\s*shipJumpEvent: ([0-9]+) (-?[0-9]+):(-?[0-9]+) (.+)$",
        Arc::new(ShipJump),
    )?;
    reg.register(
        "EventShipTrackInit",
        "",
        r"^\s*shipTrackInitEvent: ([0-9]+) (-?[0-9]+):(-?[0-9]+) (.+)$",
        Arc::new(ShipJump),
    )?;

    for (name, (fstring, pattern)) in &config.events {
        if let Err(e) = reg.register(name, fstring, pattern, Arc::new(Configured)) {
            warn!(event = name.as_str(), error = %e, "failed to register configured event");
        }
    }

    // Registered last so every other pattern gets first refusal.
    reg.register(EVENT_NONE, "", r".*", Arc::new(Fallthrough))?;
    Ok(reg)
}

/// A client opened a connection to the game port.
struct Connection;

#[async_trait]
impl EventHandler for Connection {
    async fn handle(
        &self,
        _server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        reply: Option<mpsc::Sender<String>>,
    ) {
        let Some(caps) = event.pattern().captures(&line) else {
            return;
        };
        let ip = caps[1].to_string();
        info!(target: "game", ip = %ip, "connection attempt");
        if let Some(reply) = reply {
            let _ = reply.try_send(ip);
        }
    }
}

struct PlayerJoin;

#[async_trait]
impl EventHandler for PlayerJoin {
    async fn handle(
        &self,
        server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        _reply: Option<mpsc::Sender<String>>,
    ) {
        let Some(caps) = event.pattern().captures(&line) else {
            return;
        };
        info!(target: "game", "{line}");
        let (name, index) = (caps[1].to_string(), caps[2].to_string());
        let _ = server.player_logged_in(&index, &name).await;
    }
}

struct PlayerLeft;

#[async_trait]
impl EventHandler for PlayerLeft {
    async fn handle(
        &self,
        server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        _reply: Option<mpsc::Sender<String>>,
    ) {
        let Some(caps) = event.pattern().captures(&line) else {
            return;
        };
        info!(target: "game", "{line}");
        server.player_logged_out(&caps[1]);
    }
}

/// Handles both the jump event and the initial ship observation: the payload
/// is identical and both seed the faction and sector histories.
struct ShipJump;

#[async_trait]
impl EventHandler for ShipJump {
    async fn handle(
        &self,
        server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        _reply: Option<mpsc::Sender<String>>,
    ) {
        let Some(caps) = event.pattern().captures(&line) else {
            return;
        };
        let (Ok(fid), Ok(x), Ok(y)) = (caps[1].parse(), caps[2].parse(), caps[3].parse()) else {
            warn!(target: "game", "{line}: unparseable jump coordinates");
            return;
        };
        server.record_jump(fid, x, y, &caps[4]).await;
    }
}

/// Operator-configured logged event: format the captures and push the
/// rendered line to the bot's log pipe.
struct Configured;

#[async_trait]
impl EventHandler for Configured {
    async fn handle(
        &self,
        server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        _reply: Option<mpsc::Sender<String>>,
    ) {
        info!(target: "game", "{line}");
        if let Some(rendered) = server.render_event(&event, &line) {
            server.send_log(ChatMessage::log(rendered)).await;
        }
    }
}

/// Unmanaged output: plain log passthrough.
struct Fallthrough;

#[async_trait]
impl EventHandler for Fallthrough {
    async fn handle(
        &self,
        _server: Arc<Server>,
        _event: Arc<EventDescriptor>,
        line: String,
        _reply: Option<mpsc::Sender<String>>,
    ) {
        info!(target: "game", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_in_order() {
        let reg = registry(&Config::default()).unwrap();
        assert_eq!(
            reg.lookup("Player logged in: Alice, index: 42")
                .unwrap()
                .name(),
            "EventPlayerJoin"
        );
        assert_eq!(
            reg.lookup("shipJumpEvent: 42 -3:7 Scout").unwrap().name(),
            "EventShipJump"
        );
        assert_eq!(
            reg.lookup("  shipTrackInitEvent: 9 0:0 Probe").unwrap().name(),
            "EventShipTrackInit"
        );
        assert_eq!(
            reg.lookup("203.0.113.9:41000 is connecting...")
                .unwrap()
                .name(),
            "EventConnection"
        );
        assert!(reg.lookup("some unmatched chatter").unwrap().is_fallthrough());
    }

    #[test]
    fn configured_events_come_before_fallthrough() {
        let mut config = Config::default();
        config.events.insert(
            String::from("EventDiscovery"),
            (
                String::from("{} discovered a relic"),
                String::from(r"^discoveryEvent: (player:[0-9]+)$"),
            ),
        );
        let reg = registry(&config).unwrap();
        assert_eq!(
            reg.lookup("discoveryEvent: player:42").unwrap().name(),
            "EventDiscovery"
        );
    }

    #[test]
    fn broken_configured_event_is_skipped() {
        let mut config = Config::default();
        config.events.insert(
            String::from("EventBroken"),
            (String::from("{}"), String::from(r"([0-9]+")),
        );
        let reg = registry(&config).unwrap();
        assert!(reg.get("EventBroken").is_none());
        // The fallthrough still terminates the registry.
        assert!(reg.lookup("whatever").unwrap().is_fallthrough());
    }
}
