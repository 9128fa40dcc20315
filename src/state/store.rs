use crate::instance::{VmSpecs, VmState};
use crate::monitor::VmStatusMonitor;
use crate::{Result, VmError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// SQLite-backed store for instance specs, lifecycle state and metadata.
/// Doubles as the production [`VmStatusMonitor`].
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VmError::io(parent, e))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn save_specs(&self, name: &str, specs: &VmSpecs) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let specs_json = serde_json::to_string(specs)?;
        let state_json = serde_json::to_string(&specs.state)?;
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO instances (name, state, specs_json, metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, '{}', ?4, ?4)
             ON CONFLICT(name) DO UPDATE
             SET state = ?2, specs_json = ?3, updated_at = ?4",
            params![name, state_json, specs_json, now],
        )?;

        Ok(())
    }

    pub fn get_specs(&self, name: &str) -> Result<VmSpecs> {
        let conn = self.conn.lock().unwrap();
        let specs_json: Option<String> = conn
            .query_row(
                "SELECT specs_json FROM instances WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        match specs_json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(VmError::InstanceSettings {
                op: "load".to_string(),
                instance: name.to_string(),
                reason: "no such instance".to_string(),
            }),
        }
    }

    pub fn list_instances(&self) -> Result<Vec<(String, VmState)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name, state FROM instances ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let state_json: String = row.get(1)?;
            Ok((name, state_json))
        })?;

        let mut instances = Vec::new();
        for row in rows {
            let (name, state_json) = row?;
            let state: VmState = serde_json::from_str(&state_json)?;
            instances.push((name, state));
        }
        Ok(instances)
    }

    pub fn delete_instance(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM instances WHERE name = ?1", [name])?;
        Ok(())
    }

    fn set_state(&self, name: &str, state: VmState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let state_json = serde_json::to_string(&state)?;
        let now = chrono::Utc::now().timestamp();

        let updated = conn.execute(
            "UPDATE instances SET state = ?2, updated_at = ?3,
                    specs_json = json_set(specs_json, '$.state', json(?4))
             WHERE name = ?1",
            params![name, state_json, now, state_json],
        )?;
        if updated == 0 {
            tracing::debug!(name, "state change for an instance the store does not know");
        }
        Ok(())
    }

    fn get_metadata(&self, name: &str) -> Result<serde_json::Value> {
        let conn = self.conn.lock().unwrap();
        let metadata_json: Option<String> = conn
            .query_row(
                "SELECT metadata_json FROM instances WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        match metadata_json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
    }

    fn set_metadata(&self, name: &str, metadata: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let metadata_json = serde_json::to_string(metadata)?;
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "UPDATE instances SET metadata_json = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, metadata_json, now],
        )?;
        Ok(())
    }
}

impl VmStatusMonitor for StateStore {
    fn persist_state_for(&self, name: &str, state: VmState) {
        if let Err(e) = self.set_state(name, state) {
            tracing::error!(name, %state, "failed to persist state: {e}");
        }
    }

    fn retrieve_metadata_for(&self, name: &str) -> serde_json::Value {
        match self.get_metadata(name) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!(name, "failed to load metadata: {e}");
                serde_json::Value::Object(serde_json::Map::new())
            }
        }
    }

    fn update_metadata_for(&self, name: &str, metadata: serde_json::Value) {
        if let Err(e) = self.set_metadata(name, &metadata) {
            tracing::error!(name, "failed to store metadata: {e}");
        }
    }

    fn on_resume(&self) {
        tracing::debug!("instance resumed");
    }

    fn on_shutdown(&self) {
        tracing::debug!("instance shut down");
    }

    fn on_suspend(&self) {
        tracing::debug!("instance suspended");
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
