//! # Persistent tracking database.
//!
//! A narrow sqlite mirror of the game-state store: players, alliances,
//! sectors, per-sector jump histories, and chat-account links. Only the
//! server lifecycle and the store refresh paths call into it. Persistence
//! failures are logged by the callers and the supervisor continues without
//! durability.
//!
//! The contract on restart is that [`TrackingDb::init`] round-trips the
//! sectors (with their jump histories, sorted by time) that were recorded
//! before shutdown.

use std::path::Path;

use tokio_rusqlite::rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::error::DbError;
use crate::store::{JumpInfo, Sector};

type Result<T> = std::result::Result<T, DbError>;

/// Handle to the tracking database. Cheap to clone.
#[derive(Clone)]
pub struct TrackingDb {
    conn: Connection,
}

impl TrackingDb {
    /// Opens or creates the database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
        let db = Self { conn };
        db.initialize().await?;
        Ok(db)
    }

    /// Creates an in-memory database (useful for testing).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(DbError::Sqlite)?;
        let db = Self { conn };
        db.initialize().await?;
        Ok(db)
    }

    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "foreign_keys", "ON")?;

                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS players (
                        idx INTEGER PRIMARY KEY,
                        name TEXT NOT NULL,
                        discord_id TEXT
                    );

                    CREATE TABLE IF NOT EXISTS alliances (
                        idx INTEGER PRIMARY KEY,
                        name TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS sectors (
                        x INTEGER NOT NULL,
                        y INTEGER NOT NULL,
                        PRIMARY KEY (x, y)
                    );

                    CREATE TABLE IF NOT EXISTS jumps (
                        x INTEGER NOT NULL,
                        y INTEGER NOT NULL,
                        fid INTEGER NOT NULL,
                        ship TEXT NOT NULL,
                        at INTEGER NOT NULL,
                        FOREIGN KEY (x, y) REFERENCES sectors (x, y)
                    );

                    CREATE INDEX IF NOT EXISTS idx_jumps_sector ON jumps (x, y);
                    "#,
                )?;
                Ok(())
            })
            .await?;

        info!("tracking database initialized");
        Ok(())
    }

    /// Loads every tracked sector with its jump history, sorted by time.
    pub async fn init(&self) -> Result<Vec<Sector>> {
        let sectors = self
            .conn
            .call(|conn| {
                let mut sectors: Vec<Sector> = conn
                    .prepare_cached("SELECT x, y FROM sectors")?
                    .query_map([], |row| {
                        Ok(Sector {
                            x: row.get(0)?,
                            y: row.get(1)?,
                            jumps: Vec::new(),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare_cached(
                    "SELECT fid, ship, at FROM jumps WHERE x = ?1 AND y = ?2 ORDER BY at",
                )?;
                for sector in &mut sectors {
                    sector.jumps = stmt
                        .query_map(params![sector.x, sector.y], |row| {
                            Ok(JumpInfo {
                                x: sector.x,
                                y: sector.y,
                                fid: row.get(0)?,
                                name: row.get(1)?,
                                at: row.get(2)?,
                            })
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                }

                Ok(sectors)
            })
            .await?;

        debug!(count = sectors.len(), "loaded tracked sectors");
        Ok(sectors)
    }

    /// Records a player, refreshing the name but keeping any chat link.
    pub async fn track_player(&self, index: i64, name: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO players (idx, name) VALUES (?1, ?2)
                     ON CONFLICT (idx) DO UPDATE SET name = excluded.name",
                )?
                .execute(params![index, &name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn track_alliance(&self, index: i64, name: String) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO alliances (idx, name) VALUES (?1, ?2)
                     ON CONFLICT (idx) DO UPDATE SET name = excluded.name",
                )?
                .execute(params![index, &name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Registers a sector. Idempotent.
    pub async fn track_sector(&self, x: i32, y: i32) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.prepare_cached("INSERT OR IGNORE INTO sectors (x, y) VALUES (?1, ?2)")?
                    .execute(params![x, y])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Appends one jump to a sector's durable history.
    pub async fn record_jump(&self, jump: JumpInfo) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.prepare_cached("INSERT OR IGNORE INTO sectors (x, y) VALUES (?1, ?2)")?
                    .execute(params![jump.x, jump.y])?;
                conn.prepare_cached(
                    "INSERT INTO jumps (x, y, fid, ship, at) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                .execute(params![jump.x, jump.y, jump.fid, &jump.name, jump.at])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Looks up the linked chat account for a player, if any.
    pub async fn discord_for_player(&self, index: i64) -> Result<Option<String>> {
        let id = self
            .conn
            .call(move |conn| {
                conn.prepare_cached("SELECT discord_id FROM players WHERE idx = ?1")?
                    .query_row(params![index], |row| row.get::<_, Option<String>>(0))
                    .optional()
                    .map_err(Into::into)
            })
            .await?;
        Ok(id.flatten())
    }

    /// Durably links a chat account to a player.
    pub async fn add_integration(&self, discord_id: String, index: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO players (idx, name, discord_id) VALUES (?1, '', ?2)
                     ON CONFLICT (idx) DO UPDATE SET discord_id = excluded.discord_id",
                )?
                .execute(params![index, &discord_id])?;
                Ok(())
            })
            .await?;

        debug!(index, "linked chat account to player");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sectors_round_trip_sorted() {
        let db = TrackingDb::open_in_memory().await.unwrap();

        db.track_sector(-3, 7).await.unwrap();
        db.record_jump(JumpInfo {
            x: -3,
            y: 7,
            fid: 42,
            name: String::from("Late"),
            at: 300,
        })
        .await
        .unwrap();
        db.record_jump(JumpInfo {
            x: -3,
            y: 7,
            fid: 42,
            name: String::from("Early"),
            at: 100,
        })
        .await
        .unwrap();

        let sectors = db.init().await.unwrap();
        assert_eq!(sectors.len(), 1);
        let sector = &sectors[0];
        assert_eq!((sector.x, sector.y), (-3, 7));
        let times: Vec<i64> = sector.jumps.iter().map(|j| j.at).collect();
        assert_eq!(times, vec![100, 300]);
        assert_eq!(sector.jumps[0].name, "Early");
    }

    #[tokio::test]
    async fn record_jump_creates_missing_sector() {
        let db = TrackingDb::open_in_memory().await.unwrap();
        db.record_jump(JumpInfo {
            x: 1,
            y: 1,
            fid: 9,
            name: String::from("Scout"),
            at: 5,
        })
        .await
        .unwrap();

        let sectors = db.init().await.unwrap();
        assert_eq!(sectors.len(), 1);
        assert_eq!(sectors[0].jumps.len(), 1);
    }

    #[tokio::test]
    async fn track_player_preserves_integration() {
        let db = TrackingDb::open_in_memory().await.unwrap();

        db.track_player(42, String::from("Kes")).await.unwrap();
        assert_eq!(db.discord_for_player(42).await.unwrap(), None);

        db.add_integration(String::from("112233445566"), 42)
            .await
            .unwrap();
        assert_eq!(
            db.discord_for_player(42).await.unwrap().as_deref(),
            Some("112233445566")
        );

        // A later refresh must not clear the link.
        db.track_player(42, String::from("Kes Var")).await.unwrap();
        assert_eq!(
            db.discord_for_player(42).await.unwrap().as_deref(),
            Some("112233445566")
        );
    }

    #[tokio::test]
    async fn track_sector_is_idempotent() {
        let db = TrackingDb::open_in_memory().await.unwrap();
        db.track_sector(0, 0).await.unwrap();
        db.track_sector(0, 0).await.unwrap();
        assert_eq!(db.init().await.unwrap().len(), 1);
    }
}
