use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stocktake_core::{
    BadTestResult, NewTestTemplate, Part, PartId, RepairOptions, RepairReport, StockItem,
    StockItemId, TemplateId, TestResult, TestResultId, TestTemplate, TreePosition,
};
use time::OffsetDateTime;

mod repair;

pub use repair::{count_bad_test_results, find_bad_test_results, resolve_template};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS part_part (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  parent_id INTEGER,
  tree_id INTEGER NOT NULL CHECK (tree_id >= 1),
  lft INTEGER NOT NULL CHECK (lft >= 0),
  rght INTEGER NOT NULL,
  level INTEGER NOT NULL CHECK (level >= 0),
  CHECK (lft < rght),
  FOREIGN KEY (parent_id) REFERENCES part_part(id)
);

CREATE TABLE IF NOT EXISTS stock_stockitem (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  part_id INTEGER NOT NULL,
  serial TEXT,
  quantity REAL NOT NULL DEFAULT 1 CHECK (quantity >= 0),
  FOREIGN KEY (part_id) REFERENCES part_part(id)
);

CREATE TABLE IF NOT EXISTS part_parttesttemplate (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  part_id INTEGER NOT NULL,
  key TEXT NOT NULL CHECK (length(key) > 0),
  test_name TEXT NOT NULL,
  description TEXT,
  required INTEGER NOT NULL DEFAULT 0 CHECK (required IN (0,1)),
  requires_value INTEGER NOT NULL DEFAULT 0 CHECK (requires_value IN (0,1)),
  requires_attachment INTEGER NOT NULL DEFAULT 0 CHECK (requires_attachment IN (0,1)),
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0,1)),
  FOREIGN KEY (part_id) REFERENCES part_part(id)
);

CREATE TABLE IF NOT EXISTS stock_stockitemtestresult (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  stock_item_id INTEGER NOT NULL,
  template_id INTEGER NOT NULL,
  result INTEGER NOT NULL CHECK (result IN (0,1)),
  value TEXT,
  notes TEXT,
  date TEXT NOT NULL,
  FOREIGN KEY (stock_item_id) REFERENCES stock_stockitem(id),
  FOREIGN KEY (template_id) REFERENCES part_parttesttemplate(id)
);

CREATE INDEX IF NOT EXISTS idx_part_part_tree ON part_part(tree_id, lft, rght);
CREATE INDEX IF NOT EXISTS idx_stock_stockitem_part ON stock_stockitem(part_id);
CREATE INDEX IF NOT EXISTS idx_part_parttesttemplate_key ON part_parttesttemplate(key);
CREATE INDEX IF NOT EXISTS idx_part_parttesttemplate_part ON part_parttesttemplate(part_id);
CREATE INDEX IF NOT EXISTS idx_stock_stockitemtestresult_template ON stock_stockitemtestresult(template_id);
";

const TEMPLATE_COLUMNS: &str = "id, part_id, key, test_name, description, required, \
     requires_value, requires_attachment, enabled";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSummary {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub bad_test_results: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed inventory database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// Version 2 is the test-template repair. It is recorded only when the
    /// repaired data passes verification; otherwise nothing it wrote survives.
    ///
    /// # Errors
    /// Returns an error when bootstrapping, any migration step, or repair verification fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "part_part")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if has_inventory_schema(&self.conn)? {
            // Tables were created by the host application without a ledger.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!(
            "database schema is invalid: part_part exists without nested-set columns or test tables"
        ))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        let report = repair::repair_test_templates(&tx, &RepairOptions::default())?;
        tracing::info!(
            bad_results = report.bad_results,
            created_templates = report.created_templates.len(),
            "test-template repair migration finished"
        );

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Fail unless the inventory tables exist.
    ///
    /// # Errors
    /// Returns an error when the schema is missing or cannot be inspected.
    pub fn require_inventory_schema(&self) -> Result<()> {
        if has_inventory_schema(&self.conn)? {
            Ok(())
        } else {
            Err(anyhow!("database has no inventory schema; run `db migrate` first"))
        }
    }

    /// List every test result whose template lies outside the result's part ancestry.
    ///
    /// # Errors
    /// Returns an error when the detection query fails.
    pub fn bad_test_results(&self) -> Result<Vec<BadTestResult>> {
        find_bad_test_results(&self.conn)
    }

    /// Repoint mis-linked test results, cloning templates where no ancestor owns the key.
    ///
    /// All writes happen in one transaction. A dry run always rolls back.
    ///
    /// # Errors
    /// Returns an error when options are invalid, any write fails, or results remain
    /// mis-linked after the repair. In that last case the error wraps
    /// [`stocktake_core::RepairError::Unresolved`] and nothing is persisted.
    pub fn repair_test_templates(&mut self, options: &RepairOptions) -> Result<RepairReport> {
        options.validate().map_err(|err| anyhow!("invalid repair options: {err}"))?;

        let tx = self.conn.transaction().context("failed to start repair transaction")?;
        let report = repair::repair_test_templates(&tx, options)?;

        if options.dry_run {
            tx.rollback().context("failed to roll back dry-run repair")?;
        } else {
            tx.commit().context("failed to commit repair transaction")?;
        }
        Ok(report)
    }

    /// Insert a part as the last child of `parent`, or as the root of a new tree.
    ///
    /// # Errors
    /// Returns an error when the name is empty, the parent is unknown, or writes fail.
    pub fn add_part(&mut self, name: &str, parent: Option<PartId>) -> Result<PartId> {
        if name.trim().is_empty() {
            return Err(anyhow!("part name MUST be provided"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;

        let position = match parent {
            None => {
                let tree_id: i64 = tx
                    .query_row("SELECT COALESCE(MAX(tree_id), 0) + 1 FROM part_part", [], |row| {
                        row.get(0)
                    })
                    .context("failed to allocate tree id")?;
                TreePosition::root(tree_id)
            }
            Some(parent_id) => {
                let parent_part = load_part(&tx, parent_id)?
                    .ok_or_else(|| anyhow!("parent part {parent_id} does not exist"))?;
                let anchor = parent_part.position;

                tx.execute(
                    "UPDATE part_part SET rght = rght + 2 WHERE tree_id = ?1 AND rght >= ?2",
                    params![anchor.tree_id, anchor.rght],
                )
                .context("failed to widen right bounds")?;
                tx.execute(
                    "UPDATE part_part SET lft = lft + 2 WHERE tree_id = ?1 AND lft > ?2",
                    params![anchor.tree_id, anchor.rght],
                )
                .context("failed to shift left bounds")?;

                anchor.next_child()
            }
        };

        let id = insert_part_row(&tx, name, parent, &position)?;
        tx.commit().context("failed to commit part insert")?;
        Ok(id)
    }

    /// Insert a part with explicit nested-set coordinates, as imported from another system.
    ///
    /// # Errors
    /// Returns an error when the position is malformed or the insert fails.
    pub fn insert_part_at(
        &mut self,
        name: &str,
        parent: Option<PartId>,
        position: TreePosition,
    ) -> Result<PartId> {
        position.validate().map_err(|err| anyhow!("invalid tree position: {err}"))?;
        insert_part_row(&self.conn, name, parent, &position)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_part(&self, id: PartId) -> Result<Option<Part>> {
        load_part(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when the part is unknown or the insert fails.
    pub fn add_stock_item(
        &mut self,
        part_id: PartId,
        serial: Option<&str>,
        quantity: f64,
    ) -> Result<StockItemId> {
        self.conn
            .execute(
                "INSERT INTO stock_stockitem(part_id, serial, quantity) VALUES (?1, ?2, ?3)",
                params![part_id.0, serial, quantity],
            )
            .with_context(|| format!("failed to insert stock item for part {part_id}"))?;
        Ok(StockItemId(self.conn.last_insert_rowid()))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>> {
        self.conn
            .query_row(
                "SELECT id, part_id, serial, quantity FROM stock_stockitem WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(StockItem {
                        id: StockItemId(row.get(0)?),
                        part_id: PartId(row.get(1)?),
                        serial: row.get(2)?,
                        quantity: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load stock item {id}"))
    }

    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn add_template(&mut self, template: &NewTestTemplate) -> Result<TemplateId> {
        insert_template(&self.conn, template)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_template(&self, id: TemplateId) -> Result<Option<TestTemplate>> {
        load_template(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_templates(&self) -> Result<Vec<TestTemplate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM part_parttesttemplate ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], template_from_row)?;

        let mut templates = Vec::new();
        for row in rows {
            templates.push(row?);
        }
        Ok(templates)
    }

    /// # Errors
    /// Returns an error when the referenced rows are unknown or the insert fails.
    pub fn add_test_result(
        &mut self,
        stock_item_id: StockItemId,
        template_id: TemplateId,
        result: bool,
        value: Option<&str>,
    ) -> Result<TestResultId> {
        self.conn
            .execute(
                "INSERT INTO stock_stockitemtestresult(stock_item_id, template_id, result, value, notes, date)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
                params![stock_item_id.0, template_id.0, result, value, now_rfc3339()?],
            )
            .context("failed to insert test result")?;
        Ok(TestResultId(self.conn.last_insert_rowid()))
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_test_results(&self) -> Result<Vec<TestResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, stock_item_id, template_id, result, value, notes, date
             FROM stock_stockitemtestresult
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut results = Vec::new();

        while let Some(row) = rows.next()? {
            let date_raw: String = row.get(6)?;
            results.push(TestResult {
                id: TestResultId(row.get(0)?),
                stock_item_id: StockItemId(row.get(1)?),
                template_id: TemplateId(row.get(2)?),
                result: row.get(3)?,
                value: row.get(4)?,
                notes: row.get(5)?,
                date: parse_rfc3339(&date_raw)?,
            });
        }

        Ok(results)
    }

    /// Create a `SQLite` backup file of the current main database and digest it.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created, backup fails,
    /// or the backup cannot be read back.
    pub fn backup_database(&self, out_file: &Path) -> Result<BackupSummary> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;

        let (sha256, bytes) = file_digest(out_file)?;
        Ok(BackupSummary { path: out_file.display().to_string(), sha256, bytes })
    }

    /// Run quick-check, foreign-key-check, template-ancestry, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let bad_test_results = if has_inventory_schema(&self.conn)? {
            count_bad_test_results(&self.conn)?
        } else {
            0
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            bad_test_results,
            schema_status,
        })
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn insert_part_row(
    conn: &Connection,
    name: &str,
    parent: Option<PartId>,
    position: &TreePosition,
) -> Result<PartId> {
    conn.execute(
        "INSERT INTO part_part(name, parent_id, tree_id, lft, rght, level)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            name,
            parent.map(|id| id.0),
            position.tree_id,
            position.lft,
            position.rght,
            position.level,
        ],
    )
    .with_context(|| format!("failed to insert part {name}"))?;
    Ok(PartId(conn.last_insert_rowid()))
}

fn load_part(conn: &Connection, id: PartId) -> Result<Option<Part>> {
    conn.query_row(
        "SELECT id, parent_id, name, tree_id, lft, rght, level FROM part_part WHERE id = ?1",
        params![id.0],
        |row| {
            Ok(Part {
                id: PartId(row.get(0)?),
                parent_id: row.get::<_, Option<i64>>(1)?.map(PartId),
                name: row.get(2)?,
                position: TreePosition {
                    tree_id: row.get(3)?,
                    lft: row.get(4)?,
                    rght: row.get(5)?,
                    level: row.get(6)?,
                },
            })
        },
    )
    .optional()
    .with_context(|| format!("failed to load part {id}"))
}

fn insert_template(conn: &Connection, template: &NewTestTemplate) -> Result<TemplateId> {
    template.validate().map_err(|err| anyhow!("template validation failed: {err}"))?;
    insert_template_row(conn, template)
}

// Writes the row as given; clones of stored templates keep whatever the host allowed.
pub(crate) fn insert_template_row(
    conn: &Connection,
    template: &NewTestTemplate,
) -> Result<TemplateId> {
    conn.execute(
        "INSERT INTO part_parttesttemplate(
            part_id, key, test_name, description, required,
            requires_value, requires_attachment, enabled
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            template.part_id.0,
            template.key,
            template.test_name,
            template.description,
            template.required,
            template.requires_value,
            template.requires_attachment,
            template.enabled,
        ],
    )
    .with_context(|| {
        format!("failed to insert template {} for part {}", template.key, template.part_id)
    })?;
    Ok(TemplateId(conn.last_insert_rowid()))
}

pub(crate) fn load_template(conn: &Connection, id: TemplateId) -> Result<Option<TestTemplate>> {
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLUMNS} FROM part_parttesttemplate WHERE id = ?1"),
        params![id.0],
        template_from_row,
    )
    .optional()
    .with_context(|| format!("failed to load template {id}"))
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<TestTemplate> {
    Ok(TestTemplate {
        id: TemplateId(row.get(0)?),
        part_id: PartId(row.get(1)?),
        key: row.get(2)?,
        test_name: row.get(3)?,
        description: row.get(4)?,
        required: row.get(5)?,
        requires_value: row.get(6)?,
        requires_attachment: row.get(7)?,
        enabled: row.get(8)?,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn has_inventory_schema(conn: &Connection) -> Result<bool> {
    for (table, column) in [
        ("part_part", "rght"),
        ("stock_stockitem", "part_id"),
        ("part_parttesttemplate", "key"),
        ("stock_stockitemtestresult", "template_id"),
    ] {
        if !table_has_column(conn, table, column)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "part_part")? {
        return Ok((0, false));
    }

    // The repair is data-only, so an unrecorded database can at most be inferred as v1.
    if has_inventory_schema(conn)? {
        return Ok((1, true));
    }

    Err(anyhow!(
        "database schema is invalid: part_part exists without nested-set columns or test tables"
    ))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn file_digest(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for digest {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    let mut bytes = 0_u64;

    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read file for digest {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        bytes += u64::try_from(read).unwrap_or(u64::MAX);
    }

    Ok((format!("{:x}", hasher.finalize()), bytes))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
