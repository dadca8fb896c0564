//! # In-memory game-state mirror.
//!
//! [`GameState`] mirrors what the game knows: players, alliances (a separate
//! index space), lazily created sectors, and per-faction jump histories. It
//! is kept coherent by the streamed events from the output supervisor and by
//! the periodic full refresh from the status supervisor.
//!
//! Writer discipline: the store lives behind an `RwLock` on the server and
//! only the output supervisor and the status supervisor's refresh tick take
//! the write half. Everyone else reads an eventually consistent snapshot no
//! fresher than the larger of the two supervisor cadences.
//!
//! Jump histories are bounded at [`JUMP_HISTORY_MAX`] entries with oldest-
//! first eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::error::StoreError;

/// Upper bound on any faction's jump history.
pub const JUMP_HISTORY_MAX: usize = 1000;

/// Shape of one `player: ` line in the full data dump. Name comes last so it
/// may contain spaces.
pub static PLAYER_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^player: ([0-9]+) ([0-9]+) ([0-9.]+|-) ([01]) (-?[0-9]+:-?[0-9]+) (-?[0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) (.+)$",
    )
    .expect("player data pattern")
});

/// Shape of one `alliance: ` line in the full data dump.
pub static ALLIANCE_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^alliance: ([0-9]+) ([0-9]+) ([0-9]+) (-?[0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) ([0-9]+) (.+)$",
    )
    .expect("alliance data pattern")
});

/// Seconds since the unix epoch. Jump timestamps sort on this.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// One jump in a faction's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpRecord {
    pub x: i32,
    pub y: i32,
    /// Ship name as reported by the game.
    pub name: String,
    pub at: i64,
}

/// One jump in a sector's history, carrying the jumping faction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpInfo {
    pub x: i32,
    pub y: i32,
    pub name: String,
    pub at: i64,
    pub fid: i64,
}

/// A galaxy grid cell. Created on first reference, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sector {
    pub x: i32,
    pub y: i32,
    pub jumps: Vec<JumpInfo>,
}

/// Parsed fields of a `player: ` data line.
#[derive(Debug, Clone)]
pub struct PlayerData {
    pub index: String,
    pub steam_id: String,
    pub ip: Option<String>,
    pub online: bool,
    pub credits: i64,
    pub name: String,
}

/// Parsed fields of an `alliance: ` data line.
#[derive(Debug, Clone)]
pub struct AllianceData {
    pub index: String,
    pub credits: i64,
    pub name: String,
}

pub fn parse_player_line(line: &str) -> Result<PlayerData, StoreError> {
    let caps = PLAYER_DATA_RE
        .captures(line)
        .ok_or_else(|| StoreError::BadDataString { line: line.into() })?;
    let ip = match &caps[3] {
        "-" => None,
        seen => Some(seen.to_string()),
    };
    Ok(PlayerData {
        index: caps[1].to_string(),
        steam_id: caps[2].to_string(),
        ip,
        online: &caps[4] == "1",
        credits: caps[6].parse().unwrap_or_default(),
        name: caps[14].to_string(),
    })
}

pub fn parse_alliance_line(line: &str) -> Result<AllianceData, StoreError> {
    let caps = ALLIANCE_DATA_RE
        .captures(line)
        .ok_or_else(|| StoreError::BadDataString { line: line.into() })?;
    Ok(AllianceData {
        index: caps[1].to_string(),
        credits: caps[4].parse().unwrap_or_default(),
        name: caps[12].to_string(),
    })
}

/// One connected or historical participant.
#[derive(Debug, Clone)]
pub struct Player {
    index: String,
    name: String,
    steam_id: Option<String>,
    discord_id: Option<String>,
    ip: Option<String>,
    online: bool,
    credits: i64,
    jumps: VecDeque<JumpRecord>,
}

impl Player {
    pub fn new(index: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            name: name.into(),
            steam_id: None,
            discord_id: None,
            ip: None,
            online: false,
            credits: 0,
            jumps: VecDeque::new(),
        }
    }

    pub fn from_data(data: &PlayerData) -> Self {
        let mut player = Self::new(&data.index, &data.name);
        player.update_from_data(data);
        player
    }

    /// Refreshes mutable fields from a data line. Jump history is untouched.
    pub fn update_from_data(&mut self, data: &PlayerData) {
        self.name = data.name.clone();
        self.steam_id = Some(data.steam_id.clone());
        self.ip = data.ip.clone();
        self.online = data.online;
        self.credits = data.credits;
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn steam_id(&self) -> Option<&str> {
        self.steam_id.as_deref()
    }

    pub fn discord_id(&self) -> Option<&str> {
        self.discord_id.as_deref()
    }

    pub fn set_discord_id(&mut self, id: impl Into<String>) {
        self.discord_id = Some(id.into());
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn set_ip(&mut self, ip: impl Into<String>) {
        self.ip = Some(ip.into());
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn add_jump(&mut self, jump: JumpRecord) {
        push_bounded(&mut self.jumps, jump);
    }

    pub fn jumps(&self) -> impl Iterator<Item = &JumpRecord> {
        self.jumps.iter()
    }

    pub fn jump_count(&self) -> usize {
        self.jumps.len()
    }

    pub fn last_jump(&self) -> Option<&JumpRecord> {
        self.jumps.back()
    }

    fn sort_jumps(&mut self) {
        self.jumps.make_contiguous().sort_by_key(|j| j.at);
    }
}

/// A player alliance. Same shape as [`Player`], different index space.
#[derive(Debug, Clone)]
pub struct Alliance {
    index: String,
    name: String,
    credits: i64,
    jumps: VecDeque<JumpRecord>,
}

impl Alliance {
    pub fn new(index: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            name: name.into(),
            credits: 0,
            jumps: VecDeque::new(),
        }
    }

    pub fn from_data(data: &AllianceData) -> Self {
        let mut alliance = Self::new(&data.index, &data.name);
        alliance.update_from_data(data);
        alliance
    }

    pub fn update_from_data(&mut self, data: &AllianceData) {
        self.name = data.name.clone();
        self.credits = data.credits;
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_jump(&mut self, jump: JumpRecord) {
        push_bounded(&mut self.jumps, jump);
    }

    pub fn jumps(&self) -> impl Iterator<Item = &JumpRecord> {
        self.jumps.iter()
    }

    pub fn jump_count(&self) -> usize {
        self.jumps.len()
    }

    pub fn last_jump(&self) -> Option<&JumpRecord> {
        self.jumps.back()
    }

    fn sort_jumps(&mut self) {
        self.jumps.make_contiguous().sort_by_key(|j| j.at);
    }
}

fn push_bounded(jumps: &mut VecDeque<JumpRecord>, jump: JumpRecord) {
    if jumps.len() >= JUMP_HISTORY_MAX {
        jumps.pop_front();
    }
    jumps.push_back(jump);
}

/// Which faction space a jump landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Faction {
    Player,
    Alliance,
}

/// Result of recording a jump observation.
#[derive(Debug, Clone, Copy)]
pub struct JumpOutcome {
    /// The sector was created by this observation.
    pub sector_created: bool,
    /// The faction space the index resolved into, if any.
    pub faction: Option<Faction>,
}

#[derive(Debug, Default)]
pub struct GameState {
    players: Vec<Player>,
    alliances: Vec<Alliance>,
    sectors: HashMap<(i32, i32), Sector>,
    online_players: String,
    online_count: usize,
    player_total: usize,
    alliance_total: usize,
    sector_count: usize,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Players ----

    pub fn player(&self, index: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.index() == index)
    }

    pub fn player_mut(&mut self, index: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.index() == index)
    }

    pub fn player_by_name(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.name() == name)
    }

    pub fn player_by_name_mut(&mut self, name: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.name() == name)
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Adds a player. A duplicate index is a silent no-op.
    pub fn insert_player(&mut self, player: Player) -> bool {
        if self.player(player.index()).is_some() {
            return false;
        }
        self.players.push(player);
        true
    }

    // ---- Alliances ----

    pub fn alliance(&self, index: &str) -> Option<&Alliance> {
        self.alliances.iter().find(|a| a.index() == index)
    }

    pub fn alliance_mut(&mut self, index: &str) -> Option<&mut Alliance> {
        self.alliances.iter_mut().find(|a| a.index() == index)
    }

    pub fn alliance_by_name(&self, name: &str) -> Option<&Alliance> {
        self.alliances.iter().find(|a| a.name() == name)
    }

    pub fn alliances(&self) -> &[Alliance] {
        &self.alliances
    }

    pub fn insert_alliance(&mut self, alliance: Alliance) -> bool {
        if self.alliance(alliance.index()).is_some() {
            return false;
        }
        self.alliances.push(alliance);
        true
    }

    // ---- Sectors ----

    pub fn sector(&self, x: i32, y: i32) -> Option<&Sector> {
        self.sectors.get(&(x, y))
    }

    pub fn sectors(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.values()
    }

    /// Seeds a sector from persistence without touching jump histories.
    pub fn insert_sector(&mut self, sector: Sector) {
        if self
            .sectors
            .insert((sector.x, sector.y), sector)
            .is_none()
        {
            self.sector_count += 1;
        }
    }

    /// Records a jump into the sector history and the owning faction's
    /// history, creating the sector on first reference.
    pub fn record_jump(&mut self, fid: i64, x: i32, y: i32, ship: &str, at: i64) -> JumpOutcome {
        let sector_created = !self.sectors.contains_key(&(x, y));
        let sector = self.sectors.entry((x, y)).or_insert_with(|| Sector {
            x,
            y,
            jumps: Vec::new(),
        });
        if sector_created {
            self.sector_count += 1;
        }
        sector.jumps.push(JumpInfo {
            x,
            y,
            name: ship.to_string(),
            at,
            fid,
        });

        let index = fid.to_string();
        let record = JumpRecord {
            x,
            y,
            name: ship.to_string(),
            at,
        };
        let faction = if let Some(player) = self.player_mut(&index) {
            player.add_jump(record);
            Some(Faction::Player)
        } else if let Some(alliance) = self.alliance_mut(&index) {
            alliance.add_jump(record);
            Some(Faction::Alliance)
        } else {
            None
        };

        JumpOutcome {
            sector_created,
            faction,
        }
    }

    /// Replays persisted sector histories into the faction histories, then
    /// sorts every history by time. Run once after rehydration.
    pub fn load_sector_histories(&mut self) {
        let jumps: Vec<JumpInfo> = self
            .sectors
            .values()
            .flat_map(|s| s.jumps.iter().cloned())
            .collect();
        for info in jumps {
            let index = info.fid.to_string();
            let record = JumpRecord {
                x: info.x,
                y: info.y,
                name: info.name,
                at: info.at,
            };
            if let Some(player) = self.player_mut(&index) {
                player.add_jump(record);
            } else if let Some(alliance) = self.alliance_mut(&index) {
                alliance.add_jump(record);
            }
        }
        for player in &mut self.players {
            player.sort_jumps();
        }
        for alliance in &mut self.alliances {
            alliance.sort_jumps();
        }
    }

    // ---- Online accounting ----

    pub fn add_player_online(&mut self) {
        self.online_count += 1;
        self.rebuild_online_string();
    }

    pub fn sub_player_online(&mut self) {
        self.online_count = self.online_count.saturating_sub(1);
        self.rebuild_online_string();
    }

    /// Marks every player offline. Used when the server goes down.
    pub fn clear_online(&mut self) {
        for player in &mut self.players {
            player.set_online(false);
        }
        self.online_count = 0;
        self.rebuild_online_string();
    }

    /// Recounts the online flag across all players and refreshes the cache.
    pub fn recount_online(&mut self) -> usize {
        self.online_count = self.players.iter().filter(|p| p.online()).count();
        self.rebuild_online_string();
        self.online_count
    }

    fn rebuild_online_string(&mut self) {
        self.online_players = self
            .players
            .iter()
            .filter(|p| p.online())
            .map(Player::name)
            .collect::<Vec<_>>()
            .join("\n");
    }

    /// Newline-joined names of players currently online.
    pub fn online_players(&self) -> &str {
        &self.online_players
    }

    pub fn online_count(&self) -> usize {
        self.online_count
    }

    pub fn set_totals(&mut self, players: usize, alliances: usize) {
        self.player_total = players;
        self.alliance_total = alliances;
    }

    pub fn player_total(&self) -> usize {
        self.player_total
    }

    pub fn alliance_total(&self) -> usize {
        self.alliance_total
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_line(index: &str, online: &str, name: &str) -> String {
        format!("player: {index} 76561198000000001 10.0.0.5 {online} -3:7 15000 1 2 3 4 5 6 7 {name}")
    }

    #[test]
    fn parses_player_data_line() {
        let data = parse_player_line(&player_line("42", "1", "Kes Var")).unwrap();
        assert_eq!(data.index, "42");
        assert_eq!(data.steam_id, "76561198000000001");
        assert_eq!(data.ip.as_deref(), Some("10.0.0.5"));
        assert!(data.online);
        assert_eq!(data.credits, 15000);
        assert_eq!(data.name, "Kes Var");
    }

    #[test]
    fn rejects_malformed_player_line() {
        let err = parse_player_line("player: not a data string").unwrap_err();
        assert!(matches!(err, StoreError::BadDataString { .. }));
    }

    #[test]
    fn parses_alliance_data_line() {
        let data =
            parse_alliance_line("alliance: 9001 42 5 200000 1 2 3 4 5 6 7 The Void Collective")
                .unwrap();
        assert_eq!(data.index, "9001");
        assert_eq!(data.credits, 200000);
        assert_eq!(data.name, "The Void Collective");
    }

    #[test]
    fn duplicate_player_index_is_a_no_op() {
        let mut state = GameState::new();
        assert!(state.insert_player(Player::new("7", "First")));
        assert!(!state.insert_player(Player::new("7", "Second")));
        assert_eq!(state.player("7").unwrap().name(), "First");
    }

    #[test]
    fn player_and_alliance_index_spaces_are_distinct() {
        let mut state = GameState::new();
        state.insert_player(Player::new("5", "Pilot"));
        state.insert_alliance(Alliance::new("5", "Guild"));
        assert_eq!(state.player("5").unwrap().name(), "Pilot");
        assert_eq!(state.alliance("5").unwrap().name(), "Guild");
    }

    #[test]
    fn jump_history_is_bounded_fifo() {
        let mut player = Player::new("1", "Hopper");
        for i in 0..(JUMP_HISTORY_MAX as i64 + 5) {
            player.add_jump(JumpRecord {
                x: i as i32,
                y: 0,
                name: String::from("Scout"),
                at: i,
            });
        }
        assert_eq!(player.jump_count(), JUMP_HISTORY_MAX);
        // The five oldest entries were evicted.
        assert_eq!(player.jumps().next().unwrap().at, 5);
        assert_eq!(player.last_jump().unwrap().at, JUMP_HISTORY_MAX as i64 + 4);
    }

    #[test]
    fn record_jump_updates_sector_and_faction() {
        let mut state = GameState::new();
        state.insert_player(Player::new("42", "Kes"));

        let outcome = state.record_jump(42, -3, 7, "Scout", 100);
        assert!(outcome.sector_created);
        assert_eq!(outcome.faction, Some(Faction::Player));

        let sector = state.sector(-3, 7).unwrap();
        assert_eq!(sector.jumps.len(), 1);
        assert_eq!(sector.jumps[0].fid, 42);

        let last = state.player("42").unwrap().last_jump().unwrap();
        assert_eq!((last.x, last.y), (-3, 7));
        assert_eq!(last.name, "Scout");

        // Second jump into the same sector does not create it again.
        let outcome = state.record_jump(42, -3, 7, "Scout", 101);
        assert!(!outcome.sector_created);
        assert_eq!(state.sector_count(), 1);
    }

    #[test]
    fn jump_for_unknown_faction_still_lands_in_sector() {
        let mut state = GameState::new();
        let outcome = state.record_jump(77, 0, 0, "Drifter", 5);
        assert!(outcome.faction.is_none());
        assert_eq!(state.sector(0, 0).unwrap().jumps.len(), 1);
    }

    #[test]
    fn sector_histories_replay_sorted() {
        let mut state = GameState::new();
        state.insert_player(Player::new("42", "Kes"));
        state.insert_sector(Sector {
            x: 1,
            y: 2,
            jumps: vec![
                JumpInfo {
                    x: 1,
                    y: 2,
                    name: String::from("Late"),
                    at: 300,
                    fid: 42,
                },
                JumpInfo {
                    x: 1,
                    y: 2,
                    name: String::from("Early"),
                    at: 100,
                    fid: 42,
                },
            ],
        });

        state.load_sector_histories();

        let times: Vec<i64> = state.player("42").unwrap().jumps().map(|j| j.at).collect();
        assert_eq!(times, vec![100, 300]);
    }

    #[test]
    fn online_accounting_rebuilds_cache() {
        let mut state = GameState::new();
        let mut a = Player::new("1", "Alice");
        a.set_online(true);
        state.insert_player(a);
        state.insert_player(Player::new("2", "Bob"));
        state.add_player_online();

        assert_eq!(state.online_count(), 1);
        assert_eq!(state.online_players(), "Alice");

        state.player_mut("2").unwrap().set_online(true);
        assert_eq!(state.recount_online(), 2);
        assert_eq!(state.online_players(), "Alice\nBob");

        state.player_mut("1").unwrap().set_online(false);
        state.sub_player_online();
        assert_eq!(state.online_players(), "Bob");
    }

    #[test]
    fn player_from_data_carries_every_field() {
        let data = parse_player_line(&player_line("42", "1", "Kes Var")).unwrap();
        let player = Player::from_data(&data);
        assert_eq!(player.index(), "42");
        assert_eq!(player.name(), "Kes Var");
        assert_eq!(player.steam_id(), Some("76561198000000001"));
        assert_eq!(player.ip(), Some("10.0.0.5"));
        assert!(player.online());
        assert_eq!(player.jump_count(), 0);
    }
}
