use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::SleipnirResult;
use crate::frame::{Camera, Frame};
use crate::Game;

/// Bumping this drops and recreates every table on the next open.
pub const SCHEMA_VERSION: i64 = 2;
pub const DB_FILE_NAME: &str = "sleipnir.db";

/// Timestamp and encoded image of a persisted frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFrame {
    pub timestamp: i64,
    pub image: Vec<u8>,
}

/// Durable, key-addressed frame blob store.
///
/// Frames are keyed by (game, flight, camera, position). Implementations must be
/// safe to call from the upload handler threads and the event loop at once.
pub trait FrameRepository: Send + Sync {
    fn store(&self, game: Game, frame: &Frame, image: &[u8]) -> SleipnirResult<()>;

    fn load(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<StoredFrame>>;

    fn load_timestamp(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<i64>>;

    /// Highest position stored for the camera, if any.
    fn load_frame_count(&self, game: Game, flight: u32, camera: Camera)
        -> SleipnirResult<Option<u32>>;

    fn load_flight_timestamps(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
    ) -> SleipnirResult<Vec<(u32, i64)>>;

    /// Removes every frame (and announcement, where the store keeps them) of a flight.
    fn delete_flight(&self, game: Game, flight: u32) -> SleipnirResult<()>;
}

/// SQLite database shared by all disciplines.
///
/// The connection sits behind a single mutex, which doubles as the global
/// write lock: at most one writer touches the file at a time.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(save_path: &Path) -> SleipnirResult<Self> {
        let db_path = save_path.join(DB_FILE_NAME);
        log::info!("opening database {}", db_path.display());
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> SleipnirResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SleipnirResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA auto_vacuum = NONE;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn schema_version(&self) -> SleipnirResult<Option<i64>> {
        let conn = self.lock();
        current_schema_version(&conn)
    }

    fn ensure_schema(&self) -> SleipnirResult<()> {
        let mut conn = self.lock();
        match current_schema_version(&conn)? {
            Some(version) if version == SCHEMA_VERSION => {
                log::info!("database schema v{} is up to date", version);
            }
            current => {
                log::warn!(
                    "upgrading database schema from {:?} to v{}, this removes all flight data",
                    current,
                    SCHEMA_VERSION
                );
                create_tables(&mut conn)?;
            }
        }
        Ok(())
    }
}

fn current_schema_version(conn: &Connection) -> SleipnirResult<Option<i64>> {
    let has_version: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'version'",
        [],
        |row| row.get(0),
    )?;
    if has_version == 0 {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT version FROM version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(version)
}

fn create_tables(conn: &mut Connection) -> SleipnirResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        DROP TABLE IF EXISTS version;
        DROP TABLE IF EXISTS align_frame;
        DROP TABLE IF EXISTS speed_trap_frame;
        DROP TABLE IF EXISTS gate_crasher_frame;
        DROP TABLE IF EXISTS speed_trap_announcement;
        DROP TABLE IF EXISTS gate_crasher_announcement;
        "#,
    )?;

    for game in Game::ALL {
        let table = game.frame_table();
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE {table} (
              id INTEGER PRIMARY KEY,
              flight INTEGER NOT NULL,
              camera INTEGER NOT NULL,
              position INTEGER NOT NULL,
              timestamp INTEGER NOT NULL,
              image BLOB
            );
            CREATE INDEX {table}_position_idx ON {table} (position, flight, camera);
            CREATE INDEX {table}_flight_idx ON {table} (flight);
            "#
        ))?;
    }

    tx.execute_batch(
        r#"
        CREATE TABLE speed_trap_announcement (
          id INTEGER PRIMARY KEY,
          flight INTEGER NOT NULL,
          cam1_position INTEGER NOT NULL,
          cam2_position INTEGER NOT NULL,
          duration INTEGER NOT NULL,
          speed REAL NOT NULL,
          direction INTEGER NOT NULL
        );
        CREATE INDEX speed_trap_announcement_flight_idx ON speed_trap_announcement (flight);

        CREATE TABLE gate_crasher_announcement (
          id INTEGER PRIMARY KEY,
          flight INTEGER NOT NULL,
          level_name TEXT NOT NULL,
          gate_number INTEGER NOT NULL,
          camera INTEGER NOT NULL,
          position INTEGER NOT NULL,
          timestamp INTEGER NOT NULL,
          direction INTEGER NOT NULL,
          angle INTEGER NOT NULL,
          altitude INTEGER NOT NULL,
          time INTEGER NOT NULL
        );
        CREATE INDEX gate_crasher_announcement_flight_idx ON gate_crasher_announcement (flight);

        CREATE TABLE version (
          version INTEGER PRIMARY KEY
        );
        "#,
    )?;
    tx.execute("INSERT INTO version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
    tx.commit()?;
    Ok(())
}

impl FrameRepository for Database {
    fn store(&self, game: Game, frame: &Frame, image: &[u8]) -> SleipnirResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (flight, camera, position, timestamp, image) VALUES (?1, ?2, ?3, ?4, ?5)",
                game.frame_table()
            ),
            params![
                frame.flight,
                frame.camera.db_id(),
                frame.position,
                frame.timestamp,
                image
            ],
        )?;
        Ok(())
    }

    fn load(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<StoredFrame>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT timestamp, image FROM {} WHERE position = ?1 AND flight = ?2 AND camera = ?3",
                    game.frame_table()
                ),
                params![position, flight, camera.db_id()],
                |row| {
                    Ok(StoredFrame {
                        timestamp: row.get(0)?,
                        image: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn load_timestamp(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<i64>> {
        let conn = self.lock();
        let timestamp = conn
            .query_row(
                &format!(
                    "SELECT timestamp FROM {} WHERE position = ?1 AND flight = ?2 AND camera = ?3",
                    game.frame_table()
                ),
                params![position, flight, camera.db_id()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(timestamp)
    }

    fn load_frame_count(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
    ) -> SleipnirResult<Option<u32>> {
        let conn = self.lock();
        let position = conn
            .query_row(
                &format!(
                    "SELECT position FROM {} WHERE flight = ?1 AND camera = ?2 ORDER BY id DESC LIMIT 1",
                    game.frame_table()
                ),
                params![flight, camera.db_id()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position)
    }

    fn load_flight_timestamps(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
    ) -> SleipnirResult<Vec<(u32, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT position, timestamp FROM {} WHERE flight = ?1 AND camera = ?2 ORDER BY position ASC",
            game.frame_table()
        ))?;
        let mut rows = stmt.query(params![flight, camera.db_id()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    fn delete_flight(&self, game: Game, flight: u32) -> SleipnirResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        log::debug!("deleting {} frames for flight {}", game, flight);
        tx.execute(
            &format!("DELETE FROM {} WHERE flight = ?1", game.frame_table()),
            params![flight],
        )?;
        if let Some(table) = game.announcement_table() {
            log::debug!("deleting {} announcements for flight {}", game, flight);
            tx.execute(
                &format!("DELETE FROM {} WHERE flight = ?1", table),
                params![flight],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

type FrameKey = (Game, u32, Camera, u32);

/// Volatile repository used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryFrameRepository {
    frames: Mutex<BTreeMap<FrameKey, StoredFrame>>,
}

impl InMemoryFrameRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FrameKey, StoredFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl FrameRepository for InMemoryFrameRepository {
    fn store(&self, game: Game, frame: &Frame, image: &[u8]) -> SleipnirResult<()> {
        self.lock().insert(
            (game, frame.flight, frame.camera, frame.position),
            StoredFrame {
                timestamp: frame.timestamp,
                image: image.to_vec(),
            },
        );
        Ok(())
    }

    fn load(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<StoredFrame>> {
        Ok(self.lock().get(&(game, flight, camera, position)).cloned())
    }

    fn load_timestamp(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Option<i64>> {
        Ok(self
            .lock()
            .get(&(game, flight, camera, position))
            .map(|stored| stored.timestamp))
    }

    fn load_frame_count(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
    ) -> SleipnirResult<Option<u32>> {
        Ok(self
            .lock()
            .range((game, flight, camera, 0)..=(game, flight, camera, u32::MAX))
            .next_back()
            .map(|(key, _)| key.3))
    }

    fn load_flight_timestamps(
        &self,
        game: Game,
        flight: u32,
        camera: Camera,
    ) -> SleipnirResult<Vec<(u32, i64)>> {
        Ok(self
            .lock()
            .range((game, flight, camera, 0)..=(game, flight, camera, u32::MAX))
            .map(|(key, stored)| (key.3, stored.timestamp))
            .collect())
    }

    fn delete_flight(&self, game: Game, flight: u32) -> SleipnirResult<()> {
        self.lock()
            .retain(|key, _| !(key.0 == game && key.1 == flight));
        Ok(())
    }
}
