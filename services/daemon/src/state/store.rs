//! SQLite-based state store for the daemon.
//!
//! This provides durable storage for instance records, enabling recovery
//! after daemon restarts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::daemon::InstanceState;
use crate::platform::ResourceSpec;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Instance record in the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Unique instance name.
    pub name: String,
    /// Last committed lifecycle state.
    pub state: InstanceState,
    /// Whether the instance sits in the trash.
    pub trashed: bool,
    /// Content hash of the backing image, absent while creation is in flight.
    pub image_hash: Option<String>,
    /// Alias the image was requested by.
    pub image_alias: String,
    /// Requested resources.
    pub resources: ResourceSpec,
    /// Opaque backend configuration.
    pub backend_config: serde_json::Value,
    /// Last known guest address.
    pub address: Option<String>,
    /// Generation of the last committed transition.
    pub generation: u64,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
    /// Updated timestamp (Unix seconds).
    pub updated_at: i64,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "SELECT name, state, trashed, image_hash, image_alias, cpus, memory_bytes, disk_bytes, backend_config, address, generation, created_at, updated_at FROM instances";

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn
            .lock()
            .map_err(|_| StateStoreError::Invalid("connection lock poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                name TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                trashed INTEGER NOT NULL DEFAULT 0,
                image_hash TEXT,
                image_alias TEXT NOT NULL,
                cpus INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                disk_bytes INTEGER NOT NULL,
                backend_config TEXT NOT NULL DEFAULT 'null',
                address TEXT,
                generation INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Get an instance record.
    pub fn get_instance(&self, name: &str) -> Result<Option<InstanceRecord>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE name = ?1"))?;

        let raw = stmt.query_row(params![name], RawRecord::from_row).optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Insert or update an instance record.
    pub fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StateStoreError> {
        let backend_config = serde_json::to_string(&record.backend_config)?;

        self.conn()?.execute(
            r#"
            INSERT INTO instances (name, state, trashed, image_hash, image_alias, cpus, memory_bytes, disk_bytes, backend_config, address, generation, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(name) DO UPDATE SET
                state = excluded.state,
                trashed = excluded.trashed,
                image_hash = excluded.image_hash,
                image_alias = excluded.image_alias,
                cpus = excluded.cpus,
                memory_bytes = excluded.memory_bytes,
                disk_bytes = excluded.disk_bytes,
                backend_config = excluded.backend_config,
                address = excluded.address,
                generation = excluded.generation,
                updated_at = excluded.updated_at
            "#,
            params![
                record.name,
                record.state.as_str(),
                record.trashed,
                record.image_hash,
                record.image_alias,
                record.resources.cpus,
                record.resources.memory_bytes as i64,
                record.resources.disk_bytes as i64,
                backend_config,
                record.address,
                record.generation as i64,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Delete an instance record.
    pub fn delete_instance(&self, name: &str) -> Result<(), StateStoreError> {
        self.conn()?
            .execute("DELETE FROM instances WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// List all instances.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at, name"))?;

        let raw = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter().map(RawRecord::into_record).collect()
    }

    /// Count instances in the trash.
    pub fn count_trashed(&self) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM instances WHERE trashed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Row as stored, before textual columns are parsed.
struct RawRecord {
    name: String,
    state: String,
    trashed: bool,
    image_hash: Option<String>,
    image_alias: String,
    cpus: u32,
    memory_bytes: i64,
    disk_bytes: i64,
    backend_config: String,
    address: Option<String>,
    generation: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            state: row.get(1)?,
            trashed: row.get(2)?,
            image_hash: row.get(3)?,
            image_alias: row.get(4)?,
            cpus: row.get(5)?,
            memory_bytes: row.get(6)?,
            disk_bytes: row.get(7)?,
            backend_config: row.get(8)?,
            address: row.get(9)?,
            generation: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<InstanceRecord, StateStoreError> {
        let state = InstanceState::from_str(&self.state).ok_or_else(|| {
            StateStoreError::Invalid(format!(
                "instance {} has unknown state {}",
                self.name, self.state
            ))
        })?;
        let backend_config = serde_json::from_str(&self.backend_config).map_err(|e| {
            StateStoreError::Invalid(format!("instance {} backend config: {e}", self.name))
        })?;

        Ok(InstanceRecord {
            name: self.name,
            state,
            trashed: self.trashed,
            image_hash: self.image_hash,
            image_alias: self.image_alias,
            resources: ResourceSpec {
                cpus: self.cpus,
                memory_bytes: self.memory_bytes as u64,
                disk_bytes: self.disk_bytes as u64,
            },
            backend_config,
            address: self.address,
            generation: self.generation as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, state: InstanceState) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            state,
            trashed: false,
            image_hash: Some("ab".repeat(32)),
            image_alias: "noble".to_string(),
            resources: ResourceSpec::default(),
            backend_config: serde_json::json!({ "socket_path": "/run/fc.sock" }),
            address: Some("172.30.0.2".to_string()),
            generation: 3,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn test_state_store_instances() {
        let store = StateStore::open_in_memory().unwrap();

        let record = record("pied-piper-valley", InstanceState::Running);

        // Insert
        store.upsert_instance(&record).unwrap();

        // Get
        let fetched = store.get_instance("pied-piper-valley").unwrap().unwrap();
        assert_eq!(fetched, record);

        // Update
        let mut updated = record.clone();
        updated.state = InstanceState::Off;
        updated.trashed = true;
        updated.address = None;
        updated.generation = 4;
        store.upsert_instance(&updated).unwrap();
        let fetched = store.get_instance("pied-piper-valley").unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::Off);
        assert!(fetched.trashed);
        assert_eq!(fetched.generation, 4);
        assert_eq!(store.count_trashed().unwrap(), 1);

        // List
        let all = store.list_instances().unwrap();
        assert_eq!(all.len(), 1);

        // Delete
        store.delete_instance("pied-piper-valley").unwrap();
        assert!(store.get_instance("pied-piper-valley").unwrap().is_none());
    }

    #[test]
    fn test_pending_create_has_no_image() {
        let store = StateStore::open_in_memory().unwrap();

        let mut pending = record("foo", InstanceState::Starting);
        pending.image_hash = None;
        pending.backend_config = serde_json::Value::Null;
        store.upsert_instance(&pending).unwrap();

        let fetched = store.get_instance("foo").unwrap().unwrap();
        assert!(fetched.image_hash.is_none());
        assert!(fetched.backend_config.is_null());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .upsert_instance(&record("a", InstanceState::Suspended))
                .unwrap();
            store.upsert_instance(&record("b", InstanceState::Off)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let names: Vec<_> = store
            .list_instances()
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.state))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), InstanceState::Suspended),
                ("b".to_string(), InstanceState::Off)
            ]
        );
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_instance(&record("foo", InstanceState::Off)).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE instances SET state = 'exploded' WHERE name = 'foo'", [])
            .unwrap();

        assert!(matches!(
            store.get_instance("foo"),
            Err(StateStoreError::Invalid(_))
        ));
    }
}
