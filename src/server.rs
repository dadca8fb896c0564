//! # Server process lifecycle.
//!
//! [`Server`] owns the dedicated-server child process and everything attached
//! to it: the run-state coordinator, the RCON gateway, the game-state mirror,
//! the tracking database, the event registry, and the bridge to the chat bot.
//!
//! A run wires up as follows: the child is spawned into its own process group
//! (when the supervisor sits on a terminal), stdout and stderr are merged
//! into one line channel, and three tasks are started against it: the output
//! supervisor, the status supervisor, and the process waiter. `start()` then
//! waits on a rendezvous of readiness, unexpected close, and a five-minute
//! deadline.
//!
//! All long-running tasks are spawned on one shared [`TaskTracker`] so
//! shutdown is observable from the top level.

use std::collections::HashMap;
#[cfg(unix)]
use std::io::IsTerminal;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bridge::{BotBridge, ChatMessage};
use crate::config::{Config, GameConfig};
use crate::db::TrackingDb;
use crate::error::{RconError, ServerError, StoreError};
use crate::events::{EventDescriptor, EventRegistry};
use crate::handlers;
use crate::rcon::RconGateway;
use crate::state::{RunState, Status, Transition};
use crate::store::{self, Alliance, Faction, GameState, JumpInfo, Player, PlayerData};
use crate::supervise;

/// How long the child gets to report readiness.
pub const START_TIMEOUT: Duration = Duration::from_secs(300);
/// How long a graceful stop may take before the process group is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(300);
/// Restarts are refused this soon after a successful start.
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(10);

/// Grace given to hook processes before they are killed.
const HOOK_GRACE: Duration = Duration::from_secs(60);
/// Delay before the first full refresh; player data loads late in the
/// game's own startup, so an immediate refresh reads an empty set.
const FIRST_REFRESH_DELAY: Duration = Duration::from_secs(90);
const LINE_BUFFER: usize = 1024;

const DB_REFRESH_NOTICE: &str = "Updating player data DB. Potential lag incoming.";

static INTEGRATION_PIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+):([0-9]{10})$").expect("integration pin pattern"));

/// Point-in-time status snapshot for external consumers.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub status: Status,
    /// Newline-joined names of online players.
    pub players: String,
    pub total_players: usize,
    pub players_online: usize,
    pub alliances: usize,
    pub sectors: usize,
    pub version: String,
}

/// Handles tied to one child lifetime.
struct RunHandle {
    closed: CancellationToken,
    kill: CancellationToken,
    /// Reserved. Held so the child keeps a usable stdin; never written.
    _stdin: Option<ChildStdin>,
}

pub struct Server {
    config: RwLock<Config>,
    version: String,

    state: RunState,
    up: Arc<AtomicBool>,
    rcon: RconGateway,

    store: RwLock<GameState>,
    tracking: StdMutex<Option<TrackingDb>>,
    game: StdMutex<Option<GameConfig>>,
    events: EventRegistry,
    bridge: BotBridge,

    /// Pending chat-integration requests, index to pin.
    requests: StdMutex<HashMap<String, String>>,

    run: StdMutex<Option<RunHandle>>,
    exit: CancellationToken,
    tracker: TaskTracker,
    fatal: mpsc::Sender<StoreError>,
}

impl Server {
    /// Constructs the server, probing the game binary for its version.
    pub fn new(
        config: Config,
        bridge: BotBridge,
        exit: CancellationToken,
        tracker: TaskTracker,
        fatal: mpsc::Sender<StoreError>,
    ) -> Result<Arc<Self>, ServerError> {
        let binary = config.server_binary();
        let output = std::process::Command::new(&binary)
            .arg("--version")
            .output()
            .map_err(|source| ServerError::Exec {
                path: binary.display().to_string(),
                source,
            })?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(version, "probed server binary");

        Self::assemble(config, bridge, exit, tracker, fatal, version)
    }

    fn assemble(
        config: Config,
        bridge: BotBridge,
        exit: CancellationToken,
        tracker: TaskTracker,
        fatal: mpsc::Sender<StoreError>,
        version: String,
    ) -> Result<Arc<Self>, ServerError> {
        let events = handlers::registry(&config)?;
        let up = Arc::new(AtomicBool::new(false));
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            version,
            state: RunState::new(),
            rcon: RconGateway::new(up.clone()),
            up,
            store: RwLock::new(GameState::new()),
            tracking: StdMutex::new(None),
            game: StdMutex::new(None),
            events,
            bridge,
            requests: StdMutex::new(HashMap::new()),
            run: StdMutex::new(None),
            exit,
            tracker,
            fatal,
        }))
    }

    /// Test constructor that skips the binary probe.
    #[cfg(test)]
    pub(crate) fn new_for_tests(config: Config) -> (Arc<Self>, mpsc::Receiver<StoreError>) {
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let server = Self::assemble(
            config,
            BotBridge::disabled(),
            CancellationToken::new(),
            TaskTracker::new(),
            fatal_tx,
            String::from("test"),
        )
        .expect("test server");
        (server, fatal_rx)
    }

    // ---- Lifecycle ----

    /// Starts the child process and brings the run online.
    pub async fn start(self: &Arc<Self>, announce: bool) -> Result<(), ServerError> {
        debug!("start requested");
        let guard = self.state.begin(Transition::Starting)?;
        let result = self.start_inner(announce).await;
        drop(guard);
        result
    }

    /// Gracefully stops the child process.
    pub async fn stop(self: &Arc<Self>, announce: bool) -> Result<(), ServerError> {
        debug!("stop requested");
        let guard = self.state.begin(Transition::Stopping)?;
        let result = self.stop_inner(announce).await;
        drop(guard);
        result
    }

    /// Stops and starts the server, refusing shortly after a start.
    pub async fn restart(self: &Arc<Self>) -> Result<(), ServerError> {
        debug!("restart requested");
        if self.state.started_within(RESTART_DEBOUNCE) {
            info!("server was just started, skipping restart attempt");
            return Err(ServerError::TooSoon {
                debounce: RESTART_DEBOUNCE,
            });
        }
        let guard = self
            .state
            .begin(Transition::Restarting)
            .map_err(|_| ServerError::TooSoon {
                debounce: RESTART_DEBOUNCE,
            })?;

        if let Err(e) = self.stop_inner(false).await {
            error!(error = %e, "stop during restart failed");
        }
        let result = self.start_inner(false).await;
        drop(guard);
        result.map(|()| info!("restarted server"))
    }

    async fn start_inner(self: &Arc<Self>, announce: bool) -> Result<(), ServerError> {
        if self.is_up() {
            return Err(ServerError::AlreadyRunning);
        }

        let cfg = self.config.read().unwrap().clone();
        info!(galaxy = %cfg.galaxy_name, "beginning server startup sequence");

        *self.store.write().unwrap() = GameState::new();

        let galaxy_dir = cfg.galaxy_dir();
        if !galaxy_dir.exists() {
            std::fs::create_dir_all(&galaxy_dir).map_err(|source| ServerError::GalaxyDir {
                path: galaxy_dir.display().to_string(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    &galaxy_dir,
                    std::fs::Permissions::from_mode(0o700),
                );
            }
        }

        cfg.write_mod_config().map_err(ServerError::ModConfig)?;

        let tracking = TrackingDb::open(cfg.db_path()).await?;
        let sectors = tracking.init().await?;
        {
            let mut store = self.store.write().unwrap();
            for sector in sectors {
                store.insert_sector(sector);
            }
        }
        *self.tracking.lock().unwrap() = Some(tracking);

        let binary = cfg.server_binary();
        let mut command = Command::new(&binary);
        command
            .arg("--galaxy-name")
            .arg(&cfg.galaxy_name)
            .arg("--datapath")
            .arg(&cfg.data_dir)
            .arg("--admin")
            .arg(&cfg.admin)
            .arg("--rcon-ip")
            .arg(&cfg.rcon.address)
            .arg("--rcon-password")
            .arg(&cfg.rcon.pass)
            .arg("--rcon-port")
            .arg(cfg.rcon.port.to_string())
            .current_dir(&cfg.install_dir)
            .env("LD_LIBRARY_PATH", cfg.install_dir.join("linux64"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        if std::io::stdout().is_terminal() {
            // Keeps a ctrl+c aimed at the supervisor from cascading into the
            // game; the group is also what the hard-kill path signals.
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| ServerError::Exec {
            path: binary.display().to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&binary))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(&binary))?;

        // Both pipes feed one channel: the scanner sees a single merged
        // stream, ordered per pipe.
        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        self.tracker.spawn(forward_lines(stdout, line_tx.clone()));
        self.tracker.spawn(forward_lines(stderr, line_tx.clone()));

        let ready = CancellationToken::new();
        let closed = CancellationToken::new();
        let kill = CancellationToken::new();

        *self.run.lock().unwrap() = Some(RunHandle {
            closed: closed.clone(),
            kill: kill.clone(),
            _stdin: stdin,
        });
        self.up.store(true, Ordering::SeqCst);

        self.tracker.spawn(supervise::supervise_output(
            self.clone(),
            line_rx,
            ready.clone(),
            closed.clone(),
        ));
        self.tracker
            .spawn(supervise::supervise_status(self.clone(), closed.clone()));
        self.tracker.spawn(wait_for_exit(
            self.clone(),
            child,
            kill.clone(),
            closed.clone(),
            cfg.post_down.clone(),
        ));

        info!("started server, waiting until ready");
        tokio::select! {
            _ = ready.cancelled() => {
                self.state.recovered();
                info!("server is online");

                *self.game.lock().unwrap() = cfg.load_game_config();
                self.schedule_first_refresh(&closed);
                self.store.write().unwrap().load_sector_histories();

                if let Some(post_up) = cfg.post_up.clone() {
                    self.spawn_post_up(post_up, &cfg, line_tx, closed);
                }

                self.state.mark_started();
                if announce {
                    self.bridge
                        .send_log(ChatMessage::log("**Server**: online"))
                        .await;
                }
                Ok(())
            }

            _ = closed.clone().cancelled_owned() => Err(ServerError::StartFailed),

            _ = time::sleep(START_TIMEOUT) => {
                kill.cancel();
                Err(ServerError::StartTimeout { timeout: START_TIMEOUT })
            }
        }
    }

    async fn stop_inner(self: &Arc<Self>, announce: bool) -> Result<(), ServerError> {
        if !self.is_up() {
            info!("server is already offline");
            return Ok(());
        }
        let Some((closed, kill)) = self.run_tokens() else {
            return Ok(());
        };

        info!("stopping server and waiting for it to exit");
        if announce {
            self.bridge
                .send_log(ChatMessage::log("**Server**: shutting down"))
                .await;
        }

        // Detached so a wedged RCON cannot wedge the stop path.
        {
            let server = self.clone();
            self.tracker.spawn(async move {
                match server.run_command("save").await {
                    Ok(_) => {
                        if let Err(e) = server.run_command("stop").await {
                            error!(error = %e, "rcon stop failed");
                        }
                    }
                    Err(e) => error!(error = %e, "rcon save failed"),
                }
            });
        }

        self.store.write().unwrap().clear_online();

        tokio::select! {
            _ = closed.cancelled() => {
                info!("server has been stopped");
                Ok(())
            }
            _ = time::sleep(STOP_TIMEOUT) => {
                self.state.crashed();
                kill.cancel();
                closed.cancelled().await;
                Err(ServerError::StopTimeout { timeout: STOP_TIMEOUT })
            }
        }
    }

    // ---- Probes and snapshots ----

    /// Whether the child process is currently running.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn is_crashed(&self) -> bool {
        self.state.is_crashed()
    }

    /// Marks the server crashed.
    pub fn crashed(&self) {
        self.state.crashed();
    }

    /// Clears the crash flag.
    pub fn recovered(&self) {
        self.state.recovered();
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> ServerStatus {
        let store = self.store.read().unwrap();
        ServerStatus {
            name: self.config.read().unwrap().galaxy_name.clone(),
            status: self.state.status(self.is_up()),
            players: store.online_players().to_string(),
            total_players: store.player_total(),
            players_online: store.online_count(),
            alliances: store.alliance_total(),
            sectors: store.sector_count(),
            version: self.version.clone(),
        }
    }

    /// Read access to the game-state mirror. The snapshot is eventually
    /// consistent; writers are the supervisor tasks only.
    pub fn game_state(&self) -> RwLockReadGuard<'_, GameState> {
        self.store.read().unwrap()
    }

    /// Values mirrored from the game's own configuration, once online.
    pub fn game_config(&self) -> Option<GameConfig> {
        self.game.lock().unwrap().clone()
    }

    pub fn config_snapshot(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    /// Swaps in a reloaded configuration. The event registry is fixed at
    /// construction; changed event definitions apply on the next process
    /// start.
    pub fn reload_config(&self, config: Config) {
        *self.config.write().unwrap() = config;
        info!("configuration reloaded");
    }

    // ---- RCON ----

    /// Runs a remote console command. The only mutator path into the game.
    pub async fn run_command(&self, cmd: &str) -> Result<String, RconError> {
        let endpoint = self.config.read().unwrap().rcon.clone();
        self.rcon.run(&endpoint, cmd).await
    }

    /// Sends an in-game notification.
    pub async fn notify(&self, message: &str) -> Result<(), RconError> {
        self.run_command(&format!("say [NOTIFICATION] {message}"))
            .await
            .map(|_| ())
    }

    // ---- Store operations ----

    /// Registers a player, fetching its data string when none is supplied.
    /// A duplicate index is a silent no-op.
    pub async fn new_player(
        &self,
        index: &str,
        data: Option<PlayerData>,
    ) -> Result<(), StoreError> {
        let parsed = self.parse_index(index)?;
        if self.store.read().unwrap().player(index).is_some() {
            return Ok(());
        }

        let data = match data {
            Some(data) => data,
            None => {
                let out = match self.run_command(&format!("getplayerdata -p {index}")).await {
                    Ok(out) => out,
                    Err(e) => {
                        error!(index, error = %e, "failed to fetch player data");
                        return Err(StoreError::BadDataString {
                            line: String::new(),
                        });
                    }
                };
                store::parse_player_line(out.trim()).inspect_err(|e| {
                    error!(index, error = %e, "player data fetch returned garbage");
                })?
            }
        };

        if self.store.write().unwrap().insert_player(Player::from_data(&data)) {
            info!(index, name = %data.name, "registered player");
            self.track_player(parsed, data.name.clone()).await;
        }
        Ok(())
    }

    /// Registers an alliance, analogous to [`Server::new_player`].
    pub async fn new_alliance(
        &self,
        index: &str,
        data: Option<store::AllianceData>,
    ) -> Result<(), StoreError> {
        let parsed = self.parse_index(index)?;
        if self.store.read().unwrap().alliance(index).is_some() {
            return Ok(());
        }

        let data = match data {
            Some(data) => data,
            None => {
                let out = match self.run_command(&format!("getplayerdata -a {index}")).await {
                    Ok(out) => out,
                    Err(e) => {
                        error!(index, error = %e, "failed to fetch alliance data");
                        return Err(StoreError::BadDataString {
                            line: String::new(),
                        });
                    }
                };
                store::parse_alliance_line(out.trim()).inspect_err(|e| {
                    error!(index, error = %e, "alliance data fetch returned garbage");
                })?
            }
        };

        if self
            .store
            .write()
            .unwrap()
            .insert_alliance(Alliance::from_data(&data))
        {
            info!(index, name = %data.name, "registered alliance");
            self.track_alliance(parsed, data.name.clone()).await;
        }
        Ok(())
    }

    /// Login event: ensure the player exists, mark it online, and refresh its
    /// record through RCON.
    pub async fn player_logged_in(&self, index: &str, name: &str) -> Result<(), StoreError> {
        let parsed = self.parse_index(index)?;
        {
            let mut store = self.store.write().unwrap();
            if let Some(player) = store.player_mut(index) {
                player.set_name(name);
                player.set_online(true);
            } else {
                let mut player = Player::new(index, name);
                player.set_online(true);
                store.insert_player(player);
                info!(index, name, "registered player");
            }
            store.add_player_online();
        }
        self.track_player(parsed, name.to_string()).await;

        let cmd = format!("playerinfo -p {index} -a -c -t -s");
        if let Err(e) = self.run_command(&cmd).await {
            warn!(index, error = %e, "player info refresh failed");
        }
        Ok(())
    }

    /// Logout event: flip the online flag and drop the online count.
    pub fn player_logged_out(&self, name: &str) {
        let mut store = self.store.write().unwrap();
        let known = match store.player_by_name_mut(name) {
            Some(player) => {
                player.set_online(false);
                true
            }
            None => false,
        };
        if known {
            store.sub_player_online();
        } else {
            debug!(name, "logout for unknown player");
        }
    }

    /// Records a jump observation into the sector and faction histories and
    /// persists it.
    pub async fn record_jump(&self, fid: i64, x: i32, y: i32, ship: &str) {
        let at = store::now_secs();
        let outcome = self.store.write().unwrap().record_jump(fid, x, y, ship, at);

        if outcome.sector_created {
            info!(x, y, "tracking new sector");
        }
        if outcome.faction.is_none() {
            debug!(fid, "jump for faction not yet in the mirror");
        }

        if let Some(db) = self.tracking() {
            if let Err(e) = db
                .record_jump(JumpInfo {
                    x,
                    y,
                    name: ship.to_string(),
                    at,
                    fid,
                })
                .await
            {
                warn!(error = %e, "failed to persist jump");
            }
        }
    }

    /// Full refresh: dump every known faction through RCON and register the
    /// ones the mirror has not seen yet. Already-tracked factions are left
    /// untouched. Unparseable lines are skipped, not fatal.
    pub async fn update_player_database(&self, notify: bool) -> Result<(), RconError> {
        debug!("updating player database");
        if notify {
            if let Err(e) = self.notify(DB_REFRESH_NOTICE).await {
                warn!(error = %e, "refresh notice failed");
            }
        }

        let dump = self.run_command("getplayerdata").await?;

        let mut players = 0usize;
        let mut alliances = 0usize;
        for line in dump.lines() {
            if line.starts_with("player: ") {
                players += 1;
                match store::parse_player_line(line) {
                    Ok(data) => {
                        // Create-only: an already-tracked index is left alone.
                        let index = data.index.clone();
                        let _ = self.new_player(&index, Some(data)).await;
                    }
                    Err(e) => error!(error = %e, "skipping player line"),
                }
            } else if line.starts_with("alliance: ") {
                alliances += 1;
                match store::parse_alliance_line(line) {
                    Ok(data) => {
                        let index = data.index.clone();
                        let _ = self.new_alliance(&index, Some(data)).await;
                    }
                    Err(e) => error!(error = %e, "skipping alliance line"),
                }
            } else if line.is_empty() {
                warn!("playerdb: got empty data string");
            } else {
                error!(line, "failed to parse data string");
            }
        }
        {
            let mut store = self.store.write().unwrap();
            store.set_totals(players, alliances);
            store.recount_online();
        }

        if let Some(db) = self.tracking() {
            let indices: Vec<i64> = self
                .store
                .read()
                .unwrap()
                .players()
                .iter()
                .filter_map(|p| p.index().parse().ok())
                .collect();
            for index in indices {
                match db.discord_for_player(index).await {
                    Ok(Some(id)) => {
                        let mut store = self.store.write().unwrap();
                        if let Some(player) = store.player_mut(&index.to_string()) {
                            player.set_discord_id(id);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(index, error = %e, "chat link lookup failed"),
                }
            }
        }

        debug!(players, alliances, "player database refresh complete");
        Ok(())
    }

    // ---- Chat integration ----

    /// Records an in-game request to link a chat account.
    pub fn add_integration_request(&self, index: &str, pin: &str) {
        self.requests
            .lock()
            .unwrap()
            .insert(index.to_string(), pin.to_string());
    }

    /// Confirms a `<index>:<pin>` request and persists the account link.
    pub async fn validate_integration_pin(&self, input: &str, discord_id: &str) -> bool {
        let Some(caps) = INTEGRATION_PIN_RE.captures(input) else {
            error!(input, discord_id, "invalid integration request");
            return false;
        };
        let (index, pin) = (caps[1].to_string(), caps[2].to_string());

        let matched = self
            .requests
            .lock()
            .unwrap()
            .get(&index)
            .is_some_and(|expected| *expected == pin);
        if !matched {
            return false;
        }
        let Ok(parsed) = index.parse::<i64>() else {
            return false;
        };

        if let Some(db) = self.tracking() {
            if let Err(e) = db.add_integration(discord_id.to_string(), parsed).await {
                warn!(index = %index, error = %e, "failed to persist chat link");
            }
        }
        if let Some(player) = self.store.write().unwrap().player_mut(&index) {
            player.set_discord_id(discord_id);
        }
        if let Err(e) = self
            .run_command(&format!("linkdiscordacct {index} {discord_id}"))
            .await
        {
            warn!(index = %index, error = %e, "in-game link confirmation failed");
        }
        true
    }

    // ---- Bridge ----

    pub async fn send_chat(&self, message: ChatMessage) {
        self.bridge.send_chat(message).await;
    }

    pub async fn send_log(&self, message: ChatMessage) {
        self.bridge.send_log(message).await;
    }

    // ---- Dispatch ----

    pub(crate) fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Resolves and runs the handler for one output line.
    pub(crate) async fn dispatch(self: &Arc<Self>, line: &str) {
        match self.events.lookup(line) {
            Some(event) => self.dispatch_event(event, line).await,
            None => info!(target: "game", "{line}"),
        }
    }

    /// Runs one handler, isolating panics at the dispatch boundary. The
    /// handler is awaited so lines keep their order.
    pub(crate) async fn dispatch_event(self: &Arc<Self>, event: Arc<EventDescriptor>, line: &str) {
        let handler = event.handler().clone();
        let server = self.clone();
        let descriptor = event.clone();
        let line = line.trim().to_string();

        let joined = tokio::spawn(async move {
            handler.handle(server, descriptor, line, None).await;
        })
        .await;

        if let Err(e) = joined {
            if e.is_panic() {
                error!(event = event.name(), "event handler panicked");
            }
        }
    }

    /// Renders a configured event's format string against the mirror.
    pub(crate) fn render_event(&self, event: &EventDescriptor, line: &str) -> Option<String> {
        let store = self.store.read().unwrap();
        event.render(line, |faction, index| match faction {
            Faction::Player => store.player(index).map(|p| p.name().to_string()),
            Faction::Alliance => store.alliance(index).map(|a| a.name().to_string()),
        })
    }

    // ---- Internals ----

    pub(crate) fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub(crate) fn cadences(&self) -> (Duration, Duration) {
        let cfg = self.config.read().unwrap();
        (cfg.hang_time(), cfg.db_update_time())
    }

    /// Hard-kills the current run's process group.
    pub(crate) fn request_kill(&self) {
        if let Some(run) = self.run.lock().unwrap().as_ref() {
            run.kill.cancel();
        }
    }

    pub(crate) fn recount_online(&self) -> usize {
        self.store.write().unwrap().recount_online()
    }

    fn tracking(&self) -> Option<TrackingDb> {
        self.tracking.lock().unwrap().clone()
    }

    fn run_tokens(&self) -> Option<(CancellationToken, CancellationToken)> {
        self.run
            .lock()
            .unwrap()
            .as_ref()
            .map(|run| (run.closed.clone(), run.kill.clone()))
    }

    /// Parses a faction index, raising the fatal channel on corruption.
    fn parse_index(&self, index: &str) -> Result<i64, StoreError> {
        match index.parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                let err = StoreError::BadIndex {
                    index: index.to_string(),
                };
                error!(error = %err, "fatal data corruption detected");
                let _ = self.fatal.try_send(StoreError::BadIndex {
                    index: index.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn track_player(&self, index: i64, name: String) {
        if let Some(db) = self.tracking() {
            if let Err(e) = db.track_player(index, name).await {
                warn!(index, error = %e, "tracking database write failed");
            }
        }
    }

    async fn track_alliance(&self, index: i64, name: String) {
        if let Some(db) = self.tracking() {
            if let Err(e) = db.track_alliance(index, name).await {
                warn!(index, error = %e, "tracking database write failed");
            }
        }
    }

    fn schedule_first_refresh(self: &Arc<Self>, closed: &CancellationToken) {
        let server = self.clone();
        let closed = closed.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = time::sleep(FIRST_REFRESH_DELAY) => {
                    if let Err(e) = server.update_player_database(false).await {
                        warn!(error = %e, "initial player database refresh failed");
                    }
                }
                _ = closed.cancelled() => {}
            }
        });
    }

    /// Starts the PostUp hook in its own process group, merging its stdout
    /// into the game's line stream. The hook may outlive startup; it gets
    /// SIGTERM when the run closes and SIGKILL a minute later.
    fn spawn_post_up(
        self: &Arc<Self>,
        command_line: String,
        cfg: &Config,
        lines: mpsc::Sender<String>,
        closed: CancellationToken,
    ) {
        let Some((program, args)) = tokenize(&command_line) else {
            return;
        };
        let save_path = cfg.galaxy_dir();
        let rcon = cfg.rcon.clone();
        let exit = self.exit.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            let mut command = Command::new(&program);
            command
                .args(&args)
                .env("SAVEPATH", &save_path)
                .env("RCONADDR", &rcon.address)
                .env("RCONPASS", &rcon.pass)
                .env("RCONPORT", rcon.port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null());
            #[cfg(unix)]
            command.process_group(0);

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(command = %command_line, error = %e, "failed to start PostUp");
                    return;
                }
            };
            if let Some(stdout) = child.stdout.take() {
                tracker.spawn(forward_lines(stdout, lines));
            }
            info!(command = %command_line, "started PostUp");

            tokio::select! {
                _ = child.wait() => {
                    info!("PostUp command exited");
                    return;
                }
                _ = closed.cancelled() => {}
                _ = exit.cancelled() => {}
            }
            terminate_hook(child, "PostUp").await;
        });
    }
}

fn missing_pipe(binary: &std::path::Path) -> ServerError {
    ServerError::Exec {
        path: binary.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child pipe missing"),
    }
}

/// Splits a hook command line on whitespace.
fn tokenize(command_line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command_line.split_whitespace().map(String::from);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Forwards one pipe into the merged line channel until EOF.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            return;
        }
    }
}

/// Reaps the child: waits for exit or a kill request, reports the exit code,
/// runs the PostDown hook, and finally releases everyone selecting on the
/// close token.
async fn wait_for_exit(
    server: Arc<Server>,
    mut child: Child,
    kill: CancellationToken,
    closed: CancellationToken,
    post_down: Option<String>,
) {
    let status = wait_or_kill(&mut child, &kill).await;
    server.up.store(false, Ordering::SeqCst);

    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            warn!(code, "server process exited");
            if code != 0 {
                server.state.crashed();
                server
                    .bridge
                    .send_log(ChatMessage::log(format!(
                        "**Server Error**: exited with non-zero status code: `{code}`"
                    )))
                    .await;
            }
        }
        Err(e) => {
            error!(error = %e, "failed to reap server process");
            server.state.crashed();
        }
    }

    closed.cancel();

    if let Some(post_down) = post_down {
        run_post_down(&server, &post_down).await;
    }
}

/// Waits for the child to exit, honoring a hard-kill request. Scoped so the
/// waiting future's borrow ends before the kill path touches the child.
async fn wait_or_kill(
    child: &mut Child,
    kill: &CancellationToken,
) -> std::io::Result<std::process::ExitStatus> {
    {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            status = &mut wait => return status,
            _ = kill.cancelled() => {}
        }
    }
    hard_kill(child);
    child.wait().await
}

/// Sends SIGKILL to the child's process group, falling back to a plain kill
/// when the child is not a group leader.
fn hard_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

/// SIGTERM, a minute of grace, then SIGKILL.
async fn terminate_hook(mut child: Child, label: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    info!("waiting for {label} to stop");
    match time::timeout(HOOK_GRACE, child.wait()).await {
        Ok(_) => info!("{label} command stopped"),
        Err(_) => {
            error!("sending kill to {label}");
            hard_kill(&mut child);
            let _ = child.wait().await;
        }
    }
}

/// Runs the PostDown hook with a bounded lifetime, logging its output.
async fn run_post_down(server: &Server, command_line: &str) {
    let Some((program, args)) = tokenize(command_line) else {
        return;
    };
    let save_path = server.config.read().unwrap().galaxy_dir();
    info!(command = command_line, "running PostDown");

    let mut command = Command::new(&program);
    command
        .args(&args)
        .env("SAVEPATH", &save_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match time::timeout(HOOK_GRACE, command.output()).await {
        Err(_elapsed) => error!("PostDown exceeded its time limit and was killed"),
        Ok(Err(e)) => error!(error = %e, "PostDown failed to run"),
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            for line in text.lines().filter(|l| !l.is_empty()) {
                info!("PostDown: {line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restart_is_debounced_after_a_start() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        server.state.mark_started();

        let err = server.restart().await.unwrap_err();
        assert!(matches!(err, ServerError::TooSoon { .. }));
    }

    #[tokio::test]
    async fn restart_refuses_while_a_transition_runs() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let _guard = server.state.begin(Transition::Starting).unwrap();

        let err = server.restart().await.unwrap_err();
        assert!(matches!(err, ServerError::TooSoon { .. }));
    }

    #[tokio::test]
    async fn stop_on_offline_server_is_a_no_op() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        server.stop(false).await.unwrap();
        assert_eq!(server.status().status, Status::Offline);
    }

    #[tokio::test]
    async fn bad_index_raises_the_fatal_channel() {
        let (server, mut fatal) = Server::new_for_tests(Config::default());

        let err = server
            .player_logged_in("not-a-number", "Intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadIndex { .. }));

        let raised = fatal.recv().await.expect("fatal channel signalled");
        assert!(matches!(raised, StoreError::BadIndex { .. }));
    }

    #[tokio::test]
    async fn duplicate_player_registration_is_silent() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        let data = store::parse_player_line(
            "player: 42 76561198000000001 10.0.0.5 0 0:0 100 1 2 3 4 5 6 7 Kes",
        )
        .unwrap();
        let renamed = store::parse_player_line(
            "player: 42 76561198000000002 10.0.0.9 1 0:0 999 1 2 3 4 5 6 7 Impostor",
        )
        .unwrap();

        server.new_player("42", Some(data)).await.unwrap();
        server.new_player("42", Some(renamed)).await.unwrap();

        // The second registration is a no-op: nothing about the tracked
        // player changes.
        let state = server.game_state();
        assert_eq!(state.players().len(), 1);
        let player = state.player("42").unwrap();
        assert_eq!(player.name(), "Kes");
        assert_eq!(player.steam_id(), Some("76561198000000001"));
        assert!(!player.online());
    }

    #[tokio::test]
    async fn login_then_logout_round_trips_online_state() {
        let (server, _fatal) = Server::new_for_tests(Config::default());

        server.player_logged_in("42", "Alice").await.unwrap();
        {
            let state = server.game_state();
            assert_eq!(state.online_count(), 1);
            assert_eq!(state.online_players(), "Alice");
        }

        server.player_logged_out("Alice");
        let state = server.game_state();
        assert_eq!(state.online_count(), 0);
        assert!(!state.player("42").unwrap().online());
    }

    #[tokio::test]
    async fn integration_pin_round_trip() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        server.player_logged_in("42", "Alice").await.unwrap();

        server.add_integration_request("42", "1234567890");
        assert!(!server.validate_integration_pin("42:0000000000", "chat-1").await);
        assert!(!server.validate_integration_pin("garbage", "chat-1").await);
        assert!(server.validate_integration_pin("42:1234567890", "chat-1").await);

        assert_eq!(
            server.game_state().player("42").unwrap().discord_id(),
            Some("chat-1")
        );
    }

    #[tokio::test]
    async fn status_snapshot_reflects_the_mirror() {
        let (server, _fatal) = Server::new_for_tests(Config::default());
        server.player_logged_in("42", "Alice").await.unwrap();
        server.record_jump(42, 1, 1, "Scout").await;

        let status = server.status();
        assert_eq!(status.status, Status::Offline);
        assert_eq!(status.players_online, 1);
        assert_eq!(status.players, "Alice");
        assert_eq!(status.sectors, 1);
    }
}
