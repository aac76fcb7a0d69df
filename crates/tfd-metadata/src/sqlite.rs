//! SQLite-backed metadata index.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use tfd_core::{ModelId, ModuleId, ServableId};

use crate::{
    next_version, MetadataError, ModelMetadata, ModelRecord, ModuleMetadata, ModuleRecord,
    QueryFilter, Result, Status, START_VERSION,
};

const MODEL_COLUMNS: &str = "id, team, project, name, version, label, status, created, updated";
const MODULE_COLUMNS: &str = "id, team, project, name, version, created, updated";

/// Durable metadata store on a single SQLite database.
///
/// The connection is shared behind a mutex; every operation takes the
/// guard for its full duration, so `change_label`'s transaction cannot
/// interleave with other statements.
pub struct SqliteMetadata {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetadata").finish_non_exhaustive()
    }
}

impl SqliteMetadata {
    /// Opens (or creates) the database at `dsn` and bootstraps the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the driver is not `sqlite3` or the database
    /// cannot be opened.
    pub fn open(driver: &str, dsn: &str) -> Result<Self> {
        if driver != "sqlite3" {
            return Err(MetadataError::UnsupportedDriver(driver.to_string()));
        }
        Self::from_connection(Connection::open(dsn)?)
    }

    /// Opens an in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=30000;
             PRAGMA synchronous=NORMAL;",
        )?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS model (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team TEXT NOT NULL,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_identity
                ON model(team, project, name, version, label);
            CREATE TABLE IF NOT EXISTS module (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team TEXT NOT NULL,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_module_identity
                ON module(team, project, name, version);",
        )?;
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata connection poisoned")
    }

    fn row_to_model(row: &Row<'_>) -> rusqlite::Result<(ModelRecord, u8)> {
        let status_id: u8 = row.get(6)?;
        let record = ModelRecord {
            id: row.get(0)?,
            model: ModelId {
                id: ServableId {
                    team: row.get(1)?,
                    project: row.get(2)?,
                    name: row.get(3)?,
                },
                version: row.get(4)?,
                label: row.get(5)?,
            },
            // placeholder until the status id is validated by the caller
            status: Status::Pending,
            created: row.get(7)?,
            updated: row.get(8)?,
        };
        Ok((record, status_id))
    }

    fn row_to_module(row: &Row<'_>) -> rusqlite::Result<ModuleRecord> {
        Ok(ModuleRecord {
            id: row.get(0)?,
            module: ModuleId {
                id: ServableId {
                    team: row.get(1)?,
                    project: row.get(2)?,
                    name: row.get(3)?,
                },
                version: row.get(4)?,
            },
            created: row.get(5)?,
            updated: row.get(6)?,
        })
    }

    fn get_model(conn: &Connection, filter: &QueryFilter) -> Result<Option<ModelRecord>> {
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT {MODEL_COLUMNS} FROM model{clause} LIMIT 1");

        let found = conn
            .query_row(&query, params_from_iter(values), Self::row_to_model)
            .optional()?;

        match found {
            None => Ok(None),
            Some((mut record, status_id)) => {
                record.status = Status::from_id(status_id)?;
                Ok(Some(record))
            }
        }
    }

    fn insert_model(conn: &Connection, model: &ModelId, status: Status) -> Result<i64> {
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO model (team, project, name, version, label, status, created, updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                model.id.team,
                model.id.project,
                model.id.name,
                model.version,
                model.label,
                status.as_id(),
                now,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl ModelMetadata for SqliteMetadata {
    fn get(&self, filter: &QueryFilter) -> Result<Option<ModelRecord>> {
        Self::get_model(&self.guard(), filter)
    }

    fn list(&self, filter: &QueryFilter) -> Result<Vec<ModelRecord>> {
        let conn = self.guard();
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT {MODEL_COLUMNS} FROM model{clause}");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_model)?;

        let mut models = Vec::new();
        for row in rows {
            let (mut record, status_id) = row?;
            record.status = Status::from_id(status_id)?;
            models.push(record);
        }
        Ok(models)
    }

    fn add(&self, model: &ModelId, status: Status) -> Result<i64> {
        Self::insert_model(&self.guard(), model, status)
    }

    fn delete(&self, id: i64) -> Result<()> {
        let affected = self
            .guard()
            .execute("DELETE FROM model WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(MetadataError::DeleteFailed);
        }
        Ok(())
    }

    fn update_status(&self, id: i64, status: Status) -> Result<()> {
        let affected = self.guard().execute(
            "UPDATE model SET status = ?, updated = ? WHERE id = ? AND status != ?",
            params![status.as_id(), Utc::now().timestamp(), id, status.as_id()],
        )?;
        if affected == 0 {
            return Err(MetadataError::UpdateFailed);
        }
        Ok(())
    }

    fn next_version(&self, filter: &QueryFilter) -> Result<i64> {
        let conn = self.guard();
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT version FROM model{clause} ORDER BY version DESC LIMIT 1");

        let newest: Option<i64> = conn
            .query_row(&query, params_from_iter(values), |row| row.get(0))
            .optional()?;

        match newest {
            None => Ok(START_VERSION),
            Some(version) => next_version(version),
        }
    }

    fn list_unique_team_project(&self) -> Result<Vec<ServableId>> {
        let conn = self.guard();
        let mut stmt = conn.prepare(
            "SELECT team, project FROM model GROUP BY team, project ORDER BY team, project",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ServableId {
                team: row.get(0)?,
                project: row.get(1)?,
                name: String::new(),
            })
        })?;

        let mut servables = Vec::new();
        for row in rows {
            servables.push(row?);
        }
        Ok(servables)
    }

    fn remove_label(&self, model: &ModelId) -> Result<()> {
        let conn = self.guard();
        let filter = QueryFilter::servable(&model.id).with_label(&model.label);
        let labelled = Self::get_model(&conn, &filter)?.ok_or(MetadataError::NotFound)?;

        let affected = conn.execute("DELETE FROM model WHERE id = ?", params![labelled.id])?;
        if affected == 0 {
            return Err(MetadataError::DeleteFailed);
        }
        Ok(())
    }

    fn change_label(&self, model: &ModelId, status: Status) -> Result<()> {
        let mut conn = self.guard();
        let filter = QueryFilter::servable(&model.id).with_label(&model.label);
        let current = Self::get_model(&conn, &filter)?;

        let tx = conn.transaction()?;
        if let Some(current) = current {
            let affected = tx.execute("DELETE FROM model WHERE id = ?", params![current.id])?;
            if affected == 0 {
                return Err(MetadataError::UpdateFailed);
            }
        }
        let now = Utc::now().timestamp();
        tx.execute(
            "INSERT INTO model (team, project, name, version, label, status, created, updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                model.id.team,
                model.id.project,
                model.id.name,
                model.version,
                model.label,
                status.as_id(),
                now,
                now
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn is_status_pending(&self, id: &ServableId) -> Result<bool> {
        let found: Option<u8> = self
            .guard()
            .query_row(
                "SELECT status FROM model
                 WHERE team = ? AND project = ? AND name = ? AND status = ? LIMIT 1",
                params![id.team, id.project, id.name, Status::Pending.as_id()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl ModuleMetadata for SqliteMetadata {
    fn get(&self, filter: &QueryFilter) -> Result<Option<ModuleRecord>> {
        let conn = self.guard();
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT {MODULE_COLUMNS} FROM module{clause} LIMIT 1");

        Ok(conn
            .query_row(&query, params_from_iter(values), Self::row_to_module)
            .optional()?)
    }

    fn list(&self, filter: &QueryFilter) -> Result<Vec<ModuleRecord>> {
        let conn = self.guard();
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT {MODULE_COLUMNS} FROM module{clause}");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_module)?;

        let mut modules = Vec::new();
        for row in rows {
            modules.push(row?);
        }
        Ok(modules)
    }

    fn add(&self, module: &ModuleId) -> Result<i64> {
        let conn = self.guard();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO module (team, project, name, version, created, updated)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                module.id.team,
                module.id.project,
                module.id.name,
                module.version,
                now,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn delete(&self, id: i64) -> Result<()> {
        let affected = self
            .guard()
            .execute("DELETE FROM module WHERE id = ?", params![id])?;
        if affected == 0 {
            return Err(MetadataError::DeleteFailed);
        }
        Ok(())
    }

    fn next_version(&self, filter: &QueryFilter) -> Result<i64> {
        let conn = self.guard();
        let (clause, values) = filter.to_where_clause();
        let query = format!("SELECT version FROM module{clause} ORDER BY version DESC LIMIT 1");

        let newest: Option<i64> = conn
            .query_row(&query, params_from_iter(values), |row| row.get(0))
            .optional()?;

        match newest {
            None => Ok(START_VERSION),
            Some(version) => next_version(version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteMetadata {
        SqliteMetadata::open_in_memory().expect("open in-memory store")
    }

    fn model(version: i64, label: &str) -> ModelId {
        ModelId::with_label(
            ServableId::new("team", "proj", "ranker").unwrap(),
            version,
            label,
        )
    }

    fn servable_filter() -> QueryFilter {
        QueryFilter::servable(&ServableId::new("team", "proj", "ranker").unwrap())
    }

    #[test]
    fn next_version_starts_at_one_then_increments() {
        let store = store();
        assert_eq!(
            ModelMetadata::next_version(&store, &servable_filter()).unwrap(),
            1
        );

        ModelMetadata::add(&store, &model(1, ""), Status::Pending).unwrap();
        ModelMetadata::add(&store, &model(7, ""), Status::Ready).unwrap();
        assert_eq!(
            ModelMetadata::next_version(&store, &servable_filter()).unwrap(),
            8
        );
    }

    #[test]
    fn get_and_list_filter_rows() {
        let store = store();
        ModelMetadata::add(&store, &model(1, ""), Status::Ready).unwrap();
        ModelMetadata::add(&store, &model(1, "canary"), Status::Ready).unwrap();
        ModelMetadata::add(&store, &model(2, ""), Status::Pending).unwrap();

        let anchor = ModelMetadata::get(&store, &servable_filter().with_label(""))
            .unwrap()
            .unwrap();
        assert_eq!(anchor.model.version, 1);
        assert_eq!(anchor.status, Status::Ready);

        let all = ModelMetadata::list(&store, &servable_filter()).unwrap();
        assert_eq!(all.len(), 3);

        let pending =
            ModelMetadata::list(&store, &servable_filter().with_status(Status::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].model.version, 2);

        assert!(
            ModelMetadata::get(&store, &servable_filter().with_version(9))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn update_status_requires_an_actual_transition() {
        let store = store();
        let id = ModelMetadata::add(&store, &model(1, ""), Status::Pending).unwrap();

        ModelMetadata::update_status(&store, id, Status::Ready).unwrap();
        let record = ModelMetadata::get(&store, &servable_filter())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, Status::Ready);

        // already at the target status: zero rows affected
        assert!(matches!(
            ModelMetadata::update_status(&store, id, Status::Ready),
            Err(MetadataError::UpdateFailed)
        ));
        // missing row
        assert!(matches!(
            ModelMetadata::update_status(&store, 9999, Status::Pending),
            Err(MetadataError::UpdateFailed)
        ));
    }

    #[test]
    fn change_label_repoints_atomically() {
        let store = store();
        ModelMetadata::add(&store, &model(1, ""), Status::Ready).unwrap();
        ModelMetadata::add(&store, &model(2, ""), Status::Ready).unwrap();

        store.change_label(&model(1, "stable"), Status::Ready).unwrap();
        store.change_label(&model(2, "stable"), Status::Ready).unwrap();

        let stable = ModelMetadata::get(&store, &servable_filter().with_label("stable"))
            .unwrap()
            .unwrap();
        assert_eq!(stable.model.version, 2);

        // exactly one stable row remains
        let rows = ModelMetadata::list(&store, &servable_filter().with_label("stable")).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn remove_label_deletes_only_the_alias_row() {
        let store = store();
        ModelMetadata::add(&store, &model(1, ""), Status::Ready).unwrap();
        store.change_label(&model(1, "canary"), Status::Ready).unwrap();

        store.remove_label(&model(1, "canary")).unwrap();

        assert!(
            ModelMetadata::get(&store, &servable_filter().with_label("canary"))
                .unwrap()
                .is_none()
        );
        assert!(
            ModelMetadata::get(&store, &servable_filter().with_label(""))
                .unwrap()
                .is_some()
        );

        assert!(matches!(
            store.remove_label(&model(1, "canary")),
            Err(MetadataError::NotFound)
        ));
    }

    #[test]
    fn unique_index_rejects_duplicate_identity() {
        let store = store();
        ModelMetadata::add(&store, &model(1, ""), Status::Ready).unwrap();
        assert!(ModelMetadata::add(&store, &model(1, ""), Status::Ready).is_err());
    }

    #[test]
    fn list_unique_team_project_groups_rows() {
        let store = store();
        ModelMetadata::add(&store, &model(1, ""), Status::Ready).unwrap();
        ModelMetadata::add(&store, &model(2, ""), Status::Ready).unwrap();
        let other = ModelId::new(ServableId::new("zeta", "ads", "ctr").unwrap(), 1);
        ModelMetadata::add(&store, &other, Status::Ready).unwrap();

        let unique = store.list_unique_team_project().unwrap();
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].team, "team");
        assert_eq!(unique[1].team, "zeta");
        assert!(unique.iter().all(|id| id.name.is_empty()));
    }

    #[test]
    fn is_status_pending_reflects_rows() {
        let store = store();
        let servable = ServableId::new("team", "proj", "ranker").unwrap();
        assert!(!store.is_status_pending(&servable).unwrap());

        let id = ModelMetadata::add(&store, &model(1, ""), Status::Pending).unwrap();
        assert!(store.is_status_pending(&servable).unwrap());

        ModelMetadata::update_status(&store, id, Status::Ready).unwrap();
        assert!(!store.is_status_pending(&servable).unwrap());
    }

    #[test]
    fn module_store_versions_and_deletes() {
        let store = store();
        let module = ModuleId {
            id: ServableId::new("team", "proj", "embedder").unwrap(),
            version: 1,
        };
        let filter = QueryFilter::servable(&module.id);

        assert_eq!(ModuleMetadata::next_version(&store, &filter).unwrap(), 1);
        let id = ModuleMetadata::add(&store, &module).unwrap();
        assert_eq!(ModuleMetadata::next_version(&store, &filter).unwrap(), 2);

        let listed = ModuleMetadata::list(&store, &filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].module.version, 1);

        ModuleMetadata::delete(&store, id).unwrap();
        assert!(matches!(
            ModuleMetadata::delete(&store, id),
            Err(MetadataError::DeleteFailed)
        ));
    }
}
