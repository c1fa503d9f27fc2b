//! Machine rows and settings.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use warden_shared::wire::SeccompPolicy;
use warden_shared::{WardenError, WardenResult};

use super::{db_err, Database};

pub mod settings {
    pub const DEFAULT_USER: &str = "default_user";
    pub const DEFAULT_MACHINE_ID: &str = "default_machine_id";
    pub const LAST_MACHINE_ID: &str = "last_machine_id";
}

/// Persistent fields of a machine. Runtime-only state (LXC handle, agent
/// client, freezer count) lives on the in-memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
    pub rootfs_dir: String,
    #[serde(default)]
    pub seccomp_policy: SeccompPolicy,
    /// Ordered LXC config key/value overrides.
    #[serde(default)]
    pub config_overrides: Vec<(String, String)>,
    pub default_user: String,
    #[serde(default)]
    pub last_cgroup_path: Option<String>,
    /// Desired state; restored machines with this set are started again.
    #[serde(default)]
    pub desired_running: bool,
    pub created_at: DateTime<Utc>,
}

/// Store for machine rows and settings.
#[derive(Clone)]
pub struct MachineStore {
    db: Database,
}

impl MachineStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write the full row. Inserts or replaces; the caller always has the
    /// complete record.
    pub fn save(&self, record: &MachineRecord) -> WardenResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| WardenError::Store(format!("serialize machine row: {}", e)))?;
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO machines (id, name, json) VALUES (?1, ?2, ?3)",
            rusqlite::params![record.id, record.name, json],
        ))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> WardenResult<Option<MachineRecord>> {
        let conn = self.db.conn();
        let json: Option<String> = db_err!(
            conn.query_row("SELECT json FROM machines WHERE id = ?1", [id], |row| row
                .get(0))
                .optional()
        )?;
        json.map(|j| {
            serde_json::from_str(&j)
                .map_err(|e| WardenError::Store(format!("decode machine row {}: {}", id, e)))
        })
        .transpose()
    }

    pub fn delete(&self, id: &str) -> WardenResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute("DELETE FROM machines WHERE id = ?1", [id]))?;
        Ok(())
    }

    pub fn load_all(&self) -> WardenResult<Vec<MachineRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT json FROM machines ORDER BY name"))?;
        let rows = db_err!(stmt.query_map([], |row| row.get::<_, String>(0)))?;
        let mut records = Vec::new();
        for row in rows {
            let json = db_err!(row)?;
            records.push(
                serde_json::from_str(&json)
                    .map_err(|e| WardenError::Store(format!("decode machine row: {}", e)))?,
            );
        }
        Ok(records)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> WardenResult<Option<String>> {
        let conn = self.db.conn();
        db_err!(
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        )
    }

    pub fn set_setting(&self, key: &str, value: &str) -> WardenResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        ))?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> WardenResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute("DELETE FROM settings WHERE key = ?1", [key]))?;
        Ok(())
    }

    /// Resolve the default machine among `live` entries of
    /// `(id, name, builtin)`.
    ///
    /// Explicit default wins if it still exists; otherwise the last-used
    /// machine; otherwise the first non-builtin in name order. A stale
    /// explicit default is rewritten to the fallback that replaced it.
    pub fn resolve_default_machine(
        &self,
        live: &[(String, String, bool)],
    ) -> WardenResult<Option<String>> {
        let exists = |id: &str| live.iter().any(|(lid, _, _)| lid == id);

        let explicit = self.get_setting(settings::DEFAULT_MACHINE_ID)?;
        if let Some(id) = &explicit {
            if exists(id) {
                return Ok(Some(id.clone()));
            }
        }

        let fallback = match self.get_setting(settings::LAST_MACHINE_ID)? {
            Some(id) if exists(&id) => Some(id),
            _ => {
                let mut candidates: Vec<&(String, String, bool)> =
                    live.iter().filter(|(_, _, builtin)| !builtin).collect();
                candidates.sort_by(|a, b| a.1.cmp(&b.1));
                candidates.first().map(|(id, _, _)| id.clone())
            }
        };

        // Heal a stale explicit default so later lookups stay stable.
        if explicit.is_some() {
            if let Some(id) = &fallback {
                self.set_setting(settings::DEFAULT_MACHINE_ID, id)?;
            }
        }

        Ok(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, MachineStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("store.db")).unwrap();
        (dir, MachineStore::new(db))
    }

    fn record(id: &str, name: &str) -> MachineRecord {
        MachineRecord {
            id: id.to_string(),
            name: name.to_string(),
            aliases: Vec::new(),
            builtin: false,
            rootfs_dir: format!("/data/containers/{}", id),
            seccomp_policy: SeccompPolicy::Default,
            config_overrides: Vec::new(),
            default_user: "admin".to_string(),
            last_cgroup_path: None,
            desired_running: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, store) = test_store();
        let mut rec = record("01J0000000000000000000000A", "alpha");
        rec.config_overrides
            .push(("lxc.uts.name".into(), "alpha".into()));
        store.save(&rec).unwrap();

        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.config_overrides.len(), 1);
    }

    #[test]
    fn test_save_rewrites_full_row() {
        let (_dir, store) = test_store();
        let mut rec = record("01J0000000000000000000000A", "alpha");
        store.save(&rec).unwrap();
        rec.name = "beta".to_string();
        store.save(&rec).unwrap();

        let loaded = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(loaded.name, "beta");
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_row() {
        let (_dir, store) = test_store();
        let rec = record("01J0000000000000000000000A", "alpha");
        store.save(&rec).unwrap();
        store.delete(&rec.id).unwrap();
        assert!(store.get(&rec.id).unwrap().is_none());
    }

    #[test]
    fn test_default_machine_explicit_wins() {
        let (_dir, store) = test_store();
        store
            .set_setting(settings::DEFAULT_MACHINE_ID, "id-b")
            .unwrap();
        store.set_setting(settings::LAST_MACHINE_ID, "id-a").unwrap();
        let live = vec![
            ("id-a".to_string(), "alpha".to_string(), false),
            ("id-b".to_string(), "beta".to_string(), false),
        ];
        assert_eq!(
            store.resolve_default_machine(&live).unwrap(),
            Some("id-b".to_string())
        );
    }

    #[test]
    fn test_default_machine_stale_explicit_rewritten() {
        let (_dir, store) = test_store();
        store
            .set_setting(settings::DEFAULT_MACHINE_ID, "gone")
            .unwrap();
        let live = vec![
            ("id-e".to_string(), "engine".to_string(), true),
            ("id-a".to_string(), "alpha".to_string(), false),
        ];
        assert_eq!(
            store.resolve_default_machine(&live).unwrap(),
            Some("id-a".to_string())
        );
        assert_eq!(
            store.get_setting(settings::DEFAULT_MACHINE_ID).unwrap(),
            Some("id-a".to_string())
        );
    }

    #[test]
    fn test_default_machine_skips_builtins() {
        let (_dir, store) = test_store();
        let live = vec![
            ("id-e".to_string(), "engine".to_string(), true),
            ("id-z".to_string(), "zeta".to_string(), false),
            ("id-a".to_string(), "alpha".to_string(), false),
        ];
        assert_eq!(
            store.resolve_default_machine(&live).unwrap(),
            Some("id-a".to_string())
        );
    }

    #[test]
    fn test_default_machine_none_when_only_builtins() {
        let (_dir, store) = test_store();
        let live = vec![("id-e".to_string(), "engine".to_string(), true)];
        assert_eq!(store.resolve_default_machine(&live).unwrap(), None);
    }
}
