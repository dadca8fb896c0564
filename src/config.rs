//! # Supervisor configuration.
//!
//! [`Config`] is the single structured file (toml) driving the supervisor:
//! install and data paths, galaxy name, RCON endpoint, chat-bot settings,
//! logged event definitions, the two status-supervisor cadences, and the
//! optional PostUp/PostDown hook commands.
//!
//! The file is loaded once at startup, reloaded on SIGUSR1/SIGUSR2, and
//! persisted on clean shutdown so that settings changed at runtime survive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Name of the dedicated-server binary inside `<install_dir>/bin`.
#[cfg(not(windows))]
pub const SERVER_BINARY: &str = "AvorionServer";
#[cfg(windows)]
pub const SERVER_BINARY: &str = "AvorionServer.exe";

/// A logged event definition: format string and capture pattern.
///
/// Configured as `name = ["<fstring>", "<pattern>"]` under `[events]`. The
/// format string is applied positionally: each `{}` is replaced with the next
/// capture group, after faction references have been resolved to names.
pub type LoggedEvent = (String, String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log verbosity: 0 = warn, 1 = info, 2 = debug, 3 = trace.
    pub log_level: u8,
    /// Optional directory for the supervisor log file.
    pub log_directory: Option<PathBuf>,
    /// Tracking database filename, created under `data_dir`.
    pub db_filename: String,
    /// Galaxy (save) name. A server instance hosts exactly one.
    pub galaxy_name: String,
    /// Game installation directory containing `bin/AvorionServer`.
    pub install_dir: PathBuf,
    /// Directory holding galaxy saves and the tracking database.
    pub data_dir: PathBuf,
    /// Administrator identity passed to the game on launch.
    pub admin: String,
    /// Seconds between liveness probes.
    pub hang_time_secs: u64,
    /// Seconds between full player-database refreshes.
    pub db_update_secs: u64,
    /// Command run after the server comes online. Tokenized on whitespace.
    pub post_up: Option<String>,
    /// Command run after the server exits. Tokenized on whitespace.
    pub post_down: Option<String>,
    pub rcon: RconConfig,
    pub discord: DiscordConfig,
    /// Additional logged events, matched after the built-in ones.
    pub events: BTreeMap<String, LoggedEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RconConfig {
    /// Path to the external RCON client binary.
    pub binary: PathBuf,
    pub address: String,
    pub port: u16,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: String,
    pub prefix: String,
    pub chat_channel: String,
    pub log_channel: String,
    pub status_channel: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: 1,
            log_directory: None,
            db_filename: String::from("tracking.db"),
            galaxy_name: String::from("Galaxy"),
            install_dir: PathBuf::from("/srv/avorion"),
            data_dir: PathBuf::from("/srv/avorion/galaxies"),
            admin: String::from("admin"),
            hang_time_secs: 300,
            db_update_secs: 3600,
            post_up: None,
            post_down: None,
            rcon: RconConfig::default(),
            discord: DiscordConfig::default(),
            events: BTreeMap::new(),
        }
    }
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("rcon"),
            address: String::from("127.0.0.1"),
            port: 27015,
            pass: String::new(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            prefix: String::from("!"),
            chat_channel: String::new(),
            log_channel: String::new(),
            status_channel: None,
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Persists the configuration so runtime changes survive a restart.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "saved configuration");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.galaxy_name.is_empty() {
            return Err(ConfigError::Invalid("galaxy_name cannot be empty".into()));
        }
        if self.install_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("install_dir cannot be empty".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir cannot be empty".into()));
        }
        if self.hang_time_secs == 0 {
            return Err(ConfigError::Invalid("hang_time_secs must be > 0".into()));
        }
        if self.db_update_secs == 0 {
            return Err(ConfigError::Invalid("db_update_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn hang_time(&self) -> Duration {
        Duration::from_secs(self.hang_time_secs)
    }

    pub fn db_update_time(&self) -> Duration {
        Duration::from_secs(self.db_update_secs)
    }

    /// Full path to the server executable.
    pub fn server_binary(&self) -> PathBuf {
        self.install_dir.join("bin").join(SERVER_BINARY)
    }

    /// Directory holding the active galaxy save.
    pub fn galaxy_dir(&self) -> PathBuf {
        self.data_dir.join(&self.galaxy_name)
    }

    /// Full path to the tracking database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }

    /// Materializes the mod configuration file the game reads on boot.
    ///
    /// Workshop mod management lives outside the supervisor; this writes the
    /// file so the game never boots against a stale mod set.
    pub fn write_mod_config(&self) -> std::io::Result<()> {
        let path = self.galaxy_dir().join("modconfig.lua");
        let body = "modLocation = \"\"\nforceEnabling = false\nmods = {}\n";
        fs::write(&path, body)?;
        debug!(path = %path.display(), "wrote mod configuration");
        Ok(())
    }

    /// Reads the galaxy's `server.ini`, if present, for display values.
    ///
    /// The game owns this file. Only a handful of keys are mirrored.
    pub fn load_game_config(&self) -> Option<GameConfig> {
        let raw = fs::read_to_string(self.galaxy_dir().join("server.ini")).ok()?;
        let mut game = GameConfig::default();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "seed" => game.seed = value,
                "password" => game.password = value,
                "motd" => game.motd = value,
                _ => {}
            }
        }
        Some(game)
    }
}

/// Values mirrored from the game's own `server.ini`.
#[derive(Debug, Clone, Default)]
pub struct GameConfig {
    pub seed: String,
    pub password: String,
    pub motd: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avctl.toml");

        let mut config = Config::default();
        config.galaxy_name = String::from("Frontier");
        config.rcon.port = 27099;
        config.events.insert(
            String::from("EventDiscovery"),
            (
                String::from("{} discovered something"),
                String::from("^discoveryEvent: (player:[0-9]+)$"),
            ),
        );

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.galaxy_name, "Frontier");
        assert_eq!(loaded.rcon.port, 27099);
        assert_eq!(
            loaded.events.get("EventDiscovery").unwrap().0,
            "{} discovered something"
        );
    }

    #[test]
    fn rejects_zero_cadence() {
        let mut config = Config::default();
        config.hang_time_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn paths_are_derived() {
        let mut config = Config::default();
        config.install_dir = PathBuf::from("/opt/game");
        config.data_dir = PathBuf::from("/var/galaxies");
        config.galaxy_name = String::from("Core");
        config.db_filename = String::from("track.db");

        assert_eq!(
            config.server_binary(),
            PathBuf::from("/opt/game/bin").join(SERVER_BINARY)
        );
        assert_eq!(config.galaxy_dir(), PathBuf::from("/var/galaxies/Core"));
        assert_eq!(config.db_path(), PathBuf::from("/var/galaxies/track.db"));
    }
}
