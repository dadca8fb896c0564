//! # Event registry.
//!
//! Maps named regular expressions over the child's output lines to handlers.
//! Lookup walks the registrations in insertion order and returns the first
//! descriptor whose pattern matches the whole trimmed line, so the implicit
//! `.*` fallthrough ([`EVENT_NONE`]) must be registered last.
//!
//! Patterns are anchored at registration: an unanchored pattern would shadow
//! or be shadowed by neighbours in surprising ways.
//!
//! Handlers run on the output supervisor's dispatch path and must not block;
//! anything slow belongs in a spawned task. A handler panic is caught at the
//! dispatch boundary and never tears down the supervisor.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use crate::error::EventError;
use crate::server::Server;
use crate::store::Faction;

/// Name of the terminal fallthrough descriptor.
pub const EVENT_NONE: &str = "EventNone";

static PLAYER_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^player:([0-9]+)$").expect("player ref pattern"));
static ALLIANCE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^alliance:([0-9]+)$").expect("alliance ref pattern"));

/// Shared handle to an event handler.
pub type HandlerRef = Arc<dyn EventHandler>;

/// A handler for one matched output line.
///
/// Handlers receive the owning server, their descriptor, the matched line,
/// and an optional reply channel for handlers that feed another task.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        server: Arc<Server>,
        event: Arc<EventDescriptor>,
        line: String,
        reply: Option<mpsc::Sender<String>>,
    );
}

/// One named (pattern, handler) registration.
pub struct EventDescriptor {
    name: String,
    fstring: String,
    pattern: Regex,
    handler: HandlerRef,
}

impl EventDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fstring(&self) -> &str {
        &self.fstring
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    /// True for the `.*` fallthrough descriptor.
    pub fn is_fallthrough(&self) -> bool {
        self.name == EVENT_NONE
    }

    /// Applies the captured groups to the format string.
    ///
    /// Each `{}` placeholder takes the next capture group. Groups shaped like
    /// `player:<n>` or `alliance:<n>` are first resolved through `resolve`,
    /// falling back to the bare index when the faction is unknown.
    pub fn render<F>(&self, line: &str, resolve: F) -> Option<String>
    where
        F: Fn(Faction, &str) -> Option<String>,
    {
        let caps = self.pattern.captures(line)?;
        let mut groups = caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str()).unwrap_or_default());

        let mut parts = self.fstring.split("{}");
        let mut out = String::from(parts.next().unwrap_or_default());
        for tail in parts {
            let group = groups.next().unwrap_or_default();
            out.push_str(&rewrite_faction_ref(group, &resolve));
            out.push_str(tail);
        }
        Some(out)
    }
}

fn rewrite_faction_ref<F>(group: &str, resolve: &F) -> String
where
    F: Fn(Faction, &str) -> Option<String>,
{
    if let Some(caps) = PLAYER_REF_RE.captures(group) {
        let index = &caps[1];
        return resolve(Faction::Player, index).unwrap_or_else(|| index.to_string());
    }
    if let Some(caps) = ALLIANCE_REF_RE.captures(group) {
        let index = &caps[1];
        return resolve(Faction::Alliance, index).unwrap_or_else(|| index.to_string());
    }
    group.to_string()
}

/// Ordered registry of event descriptors. Append-only at startup.
#[derive(Default)]
pub struct EventRegistry {
    entries: Vec<Arc<EventDescriptor>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event. Fails on duplicate names and invalid patterns.
    /// Patterns are anchored to the full line if they are not already.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        fstring: impl Into<String>,
        pattern: &str,
        handler: HandlerRef,
    ) -> Result<(), EventError> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(EventError::DuplicateName { name });
        }

        let anchored = anchor(pattern);
        let pattern = Regex::new(&anchored).map_err(|source| EventError::BadPattern {
            name: name.clone(),
            source,
        })?;

        self.entries.push(Arc::new(EventDescriptor {
            name,
            fstring: fstring.into(),
            pattern,
            handler,
        }));
        Ok(())
    }

    /// Returns the first descriptor matching the whole trimmed line.
    pub fn lookup(&self, line: &str) -> Option<Arc<EventDescriptor>> {
        let line = line.trim();
        self.entries
            .iter()
            .find(|e| e.pattern.is_match(line))
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EventDescriptor>> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn anchor(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}
