use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use host_dedup_core::{
    DedupError, DeleteOutcome, FactExpr, FactValue, Host, HostId, HostStore, HostType,
    StalenessConfig, StalenessOffsets,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS hosts (
  id TEXT PRIMARY KEY,
  account TEXT NOT NULL CHECK (length(trim(account)) > 0),
  display_name TEXT,
  reporter TEXT,
  host_type TEXT NOT NULL CHECK (host_type IN ('conventional','edge')),
  canonical_facts TEXT NOT NULL CHECK (json_valid(canonical_facts)),
  modified_on_unix_ns INTEGER NOT NULL,
  stale_timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hosts_account_id ON hosts(account, id);
CREATE INDEX IF NOT EXISTS idx_hosts_account_modified_on ON hosts(account, modified_on_unix_ns);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS account_staleness (
  account TEXT PRIMARY KEY,
  conventional_time_to_stale INTEGER NOT NULL CHECK (conventional_time_to_stale > 0),
  conventional_time_to_stale_warning INTEGER NOT NULL,
  conventional_time_to_delete INTEGER NOT NULL,
  immutable_time_to_stale INTEGER NOT NULL CHECK (immutable_time_to_stale > 0),
  immutable_time_to_stale_warning INTEGER NOT NULL,
  immutable_time_to_delete INTEGER NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (conventional_time_to_stale <= conventional_time_to_stale_warning
         AND conventional_time_to_stale_warning <= conventional_time_to_delete),
  CHECK (immutable_time_to_stale <= immutable_time_to_stale_warning
         AND immutable_time_to_stale_warning <= immutable_time_to_delete)
);
";

const HOST_COLUMNS: &str = "id, account, display_name, reporter, host_type, canonical_facts, \
                            modified_on_unix_ns, stale_timestamp";

const STALENESS_COLUMNS: &str = "account, \
     conventional_time_to_stale, conventional_time_to_stale_warning, conventional_time_to_delete, \
     immutable_time_to_stale, immutable_time_to_stale_warning, immutable_time_to_delete, updated_at";

pub struct SqliteHostStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_hosts: usize,
    pub skipped_existing_hosts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Hosts whose `canonical_facts` is valid JSON but not an object.
    pub non_object_fact_rows: usize,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStaleness {
    pub account: String,
    pub staleness: StalenessConfig,
    pub updated_at: String,
}

/// SQL fragment plus positional parameters for one [`FactExpr`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSql {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

impl SqliteHostStore {
    /// Open a SQLite-backed host inventory and configure required runtime pragmas.
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
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or a migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        while version < LATEST_SCHEMA_VERSION {
            version += 1;
            self.apply_migration(version)?;
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64) -> Result<()> {
        let sql = match version {
            1 => MIGRATION_001_SQL,
            2 => MIGRATION_002_SQL,
            other => return Err(anyhow!("no migration defined for schema version {other}")),
        };

        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;

        info!(version, "applied schema migration");
        Ok(())
    }

    /// Persist one validated host.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_host(&mut self, host: &Host) -> Result<()> {
        insert_host_row(&self.conn, host)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_host(&self, id: &HostId) -> Result<Option<Host>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                params![id.to_string()],
                HostRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load host {id}"))?;
        row.map(HostRow::into_host).transpose()
    }

    /// Load hosts, optionally restricted to one account, ordered by account then id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_hosts(&self, account: Option<&str>) -> Result<Vec<Host>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts
             WHERE (?1 IS NULL OR account = ?1)
             ORDER BY account ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![account], HostRow::from_row)?;

        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?.into_host()?);
        }
        Ok(hosts)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_hosts(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM hosts", [], |row| row.get::<_, i64>(0))
            .context("failed to count hosts")?;
        usize::try_from(count).context("host count out of range")
    }

    /// Import hosts from an NDJSON file (one [`Host`] per line) in a single transaction.
    ///
    /// # Errors
    /// Returns an error when migration, parsing, duplicate handling, or writes fail.
    pub fn import_hosts(&mut self, in_file: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let file = File::open(in_file)
            .with_context(|| format!("failed to open NDJSON file {}", in_file.display()))?;
        let reader = BufReader::new(file);
        let mut summary = ImportSummary { imported_hosts: 0, skipped_existing_hosts: 0 };

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read line {} from {}", index + 1, in_file.display())
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let host: Host = serde_json::from_str(trimmed).with_context(|| {
                format!("failed to parse NDJSON row {} from {}", index + 1, in_file.display())
            })?;

            if host_exists(&tx, &host.id)? {
                if skip_existing {
                    summary.skipped_existing_hosts += 1;
                    continue;
                }
                return Err(anyhow!("host already exists: {}", host.id));
            }
            insert_host_row(&tx, &host)?;
            summary.imported_hosts += 1;
        }
        tx.commit().context("failed to commit import transaction")?;

        info!(
            imported = summary.imported_hosts,
            skipped = summary.skipped_existing_hosts,
            file = %in_file.display(),
            "imported hosts"
        );
        Ok(summary)
    }

    /// Store (or replace) an account's staleness offsets.
    ///
    /// # Errors
    /// Returns an error when the offsets are invalid or the upsert fails.
    pub fn set_account_staleness(&mut self, account: &str, config: &StalenessConfig) -> Result<()> {
        if account.trim().is_empty() {
            return Err(anyhow!("account MUST NOT be blank"));
        }
        config.validate().map_err(|err| anyhow!("staleness validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO account_staleness(
                    account,
                    conventional_time_to_stale, conventional_time_to_stale_warning,
                    conventional_time_to_delete,
                    immutable_time_to_stale, immutable_time_to_stale_warning,
                    immutable_time_to_delete,
                    updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(account) DO UPDATE SET
                    conventional_time_to_stale = excluded.conventional_time_to_stale,
                    conventional_time_to_stale_warning = excluded.conventional_time_to_stale_warning,
                    conventional_time_to_delete = excluded.conventional_time_to_delete,
                    immutable_time_to_stale = excluded.immutable_time_to_stale,
                    immutable_time_to_stale_warning = excluded.immutable_time_to_stale_warning,
                    immutable_time_to_delete = excluded.immutable_time_to_delete,
                    updated_at = excluded.updated_at",
                params![
                    account,
                    config.conventional.time_to_stale,
                    config.conventional.time_to_stale_warning,
                    config.conventional.time_to_delete,
                    config.immutable.time_to_stale,
                    config.immutable.time_to_stale_warning,
                    config.immutable.time_to_delete,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to store staleness for account {account}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn account_staleness(&self, account: &str) -> Result<Option<AccountStaleness>> {
        self.conn
            .query_row(
                &format!("SELECT {STALENESS_COLUMNS} FROM account_staleness WHERE account = ?1"),
                params![account],
                staleness_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load staleness for account {account}"))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_account_staleness(&self) -> Result<Vec<AccountStaleness>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STALENESS_COLUMNS} FROM account_staleness ORDER BY account ASC"
        ))?;
        let rows = stmt.query_map([], staleness_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Run quick-check, fact-shape, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let non_object_fact_rows = if table_exists(&self.conn, "hosts")? {
            let count = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM hosts WHERE json_type(canonical_facts) != 'object'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to count non-object canonical facts")?;
            usize::try_from(count).context("row count out of range")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            non_object_fact_rows,
            schema_status,
        })
    }

    fn load_accounts(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT account FROM hosts ORDER BY account ASC")
            .context("failed to prepare account listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    fn load_page(&self, account: &str, after: Option<&HostId>, limit: usize) -> Result<Vec<Host>> {
        let limit = i64::try_from(limit).context("page size out of range")?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts
             WHERE account = ?1 AND (?2 IS NULL OR id > ?2)
             ORDER BY id ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![account, after.map(ToString::to_string), limit],
            HostRow::from_row,
        )?;

        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?.into_host()?);
        }
        Ok(hosts)
    }

    fn load_candidates(&self, account: &str, filter: &FactExpr) -> Result<Vec<Host>> {
        let compiled = compile_filter(filter)?;
        let sql = format!(
            "SELECT {HOST_COLUMNS} FROM hosts
             WHERE account = ? AND ({})
             ORDER BY modified_on_unix_ns DESC, id DESC",
            compiled.clause
        );
        let mut bound = Vec::with_capacity(compiled.params.len() + 1);
        bound.push(SqlValue::Text(account.to_string()));
        bound.extend(compiled.params);

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare candidate query")?;
        let rows = stmt.query_map(params_from_iter(bound.iter()), HostRow::from_row)?;

        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?.into_host()?);
        }
        debug!(account = %account, candidates = hosts.len(), "loaded candidate hosts");
        Ok(hosts)
    }

    fn remove_host(&self, id: &HostId) -> Result<DeleteOutcome> {
        let changed = self
            .conn
            .execute("DELETE FROM hosts WHERE id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to delete host {id}"))?;
        Ok(if changed == 0 { DeleteOutcome::NotFound } else { DeleteOutcome::Deleted })
    }
}

fn storage_error(err: &anyhow::Error) -> DedupError {
    DedupError::Storage(format!("{err:#}"))
}

impl HostStore for SqliteHostStore {
    fn list_accounts(&self) -> Result<Vec<String>, DedupError> {
        self.load_accounts().map_err(|err| storage_error(&err))
    }

    fn query_hosts(
        &self,
        account: &str,
        after: Option<&HostId>,
        limit: usize,
    ) -> Result<Vec<Host>, DedupError> {
        self.load_page(account, after, limit).map_err(|err| storage_error(&err))
    }

    fn query_candidates(
        &self,
        account: &str,
        filter: &FactExpr,
    ) -> Result<Vec<Host>, DedupError> {
        self.load_candidates(account, filter).map_err(|err| storage_error(&err))
    }

    fn delete_host(&self, id: &HostId) -> Result<DeleteOutcome, DedupError> {
        self.remove_host(id).map_err(|err| storage_error(&err))
    }

    fn staleness_for(&self, account: &str) -> Result<Option<StalenessConfig>, DedupError> {
        self.account_staleness(account)
            .map(|entry| entry.map(|entry| entry.staleness))
            .map_err(|err| storage_error(&err))
    }
}

/// Compile a fact predicate into a `WHERE` fragment over the `canonical_facts` column.
///
/// The fragment agrees with [`FactExpr::evaluate`] for every stored JSON object.
///
/// # Errors
/// Returns an error when a fact key cannot be used as a JSON path segment.
pub fn compile_filter(expr: &FactExpr) -> Result<FilterSql> {
    let mut params = Vec::new();
    let clause = compile_into(expr, &mut params)?;
    Ok(FilterSql { clause, params })
}

fn compile_into(expr: &FactExpr, params: &mut Vec<SqlValue>) -> Result<String> {
    match expr {
        FactExpr::Contains { key, value } => contains_sql(key, value, params),
        FactExpr::Conflicts { key, value } => {
            params.push(SqlValue::Text(fact_path(key)?));
            let contains = contains_sql(key, value, params)?;
            Ok(format!("(json_type(canonical_facts, ?) IS NOT NULL AND NOT {contains})"))
        }
        FactExpr::AnyOf(exprs) => join_exprs(exprs, " OR ", "0", params),
        FactExpr::AllOf(exprs) => join_exprs(exprs, " AND ", "1", params),
        FactExpr::NoneOf(exprs) => {
            let any = join_exprs(exprs, " OR ", "0", params)?;
            Ok(format!("(NOT {any})"))
        }
    }
}

fn join_exprs(
    exprs: &[FactExpr],
    separator: &str,
    empty: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    if exprs.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = exprs
        .iter()
        .map(|expr| compile_into(expr, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(separator)))
}

fn contains_sql(key: &str, value: &FactValue, params: &mut Vec<SqlValue>) -> Result<String> {
    let path = fact_path(key)?;
    match value {
        FactValue::Single(expected) => {
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            params.push(SqlValue::Text(expected.clone()));
            Ok("(json_type(canonical_facts, ?) = 'text' AND json_extract(canonical_facts, ?) = ?)"
                .to_string())
        }
        FactValue::Many(expected) => {
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            let placeholders = vec!["?"; expected.len()].join(", ");
            params.extend(expected.iter().cloned().map(SqlValue::Text));
            params.push(SqlValue::Integer(
                i64::try_from(expected.len()).context("fact list too long")?,
            ));
            let membership = if expected.is_empty() {
                "0".to_string()
            } else {
                format!("value IN ({placeholders})")
            };
            Ok(format!(
                "(json_type(canonical_facts, ?) = 'array' AND \
                 (SELECT COUNT(DISTINCT value) FROM json_each(canonical_facts, ?) \
                  WHERE type = 'text' AND {membership}) = ?)"
            ))
        }
    }
}

fn fact_path(key: &str) -> Result<String> {
    if key.is_empty() || !key.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(anyhow!("fact key {key:?} is not a plain identifier"));
    }
    Ok(format!("$.\"{key}\""))
}

struct HostRow {
    id: String,
    account: String,
    display_name: Option<String>,
    reporter: Option<String>,
    host_type: String,
    canonical_facts: String,
    modified_on_unix_ns: i64,
    stale_timestamp: String,
}

impl HostRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account: row.get(1)?,
            display_name: row.get(2)?,
            reporter: row.get(3)?,
            host_type: row.get(4)?,
            canonical_facts: row.get(5)?,
            modified_on_unix_ns: row.get(6)?,
            stale_timestamp: row.get(7)?,
        })
    }

    fn into_host(self) -> Result<Host> {
        let id = self.id.parse::<HostId>().map_err(|err| anyhow!("{err}"))?;
        let host_type = HostType::parse(&self.host_type)
            .ok_or_else(|| anyhow!("unknown host_type: {}", self.host_type))?;
        let canonical_facts = match serde_json::from_str::<Value>(&self.canonical_facts)
            .with_context(|| format!("failed to decode canonical_facts for host {id}"))?
        {
            Value::Object(map) => map,
            // Non-object facts are surfaced to the resolver as empty so the row can still be paged.
            _ => Map::new(),
        };
        let modified_on =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.modified_on_unix_ns))
                .with_context(|| format!("invalid modified_on for host {id}"))?;

        Ok(Host {
            id,
            account: self.account,
            display_name: self.display_name,
            reporter: self.reporter,
            host_type,
            canonical_facts,
            modified_on,
            stale_timestamp: parse_rfc3339(&self.stale_timestamp)?,
        })
    }
}

fn staleness_from_row(row: &Row<'_>) -> rusqlite::Result<AccountStaleness> {
    Ok(AccountStaleness {
        account: row.get(0)?,
        staleness: StalenessConfig {
            conventional: StalenessOffsets::new(row.get(1)?, row.get(2)?, row.get(3)?),
            immutable: StalenessOffsets::new(row.get(4)?, row.get(5)?, row.get(6)?),
        },
        updated_at: row.get(7)?,
    })
}

fn insert_host_row(conn: &Connection, host: &Host) -> Result<()> {
    host.validate().map_err(|err| anyhow!("host validation failed: {err}"))?;
    let modified_on_unix_ns = i64::try_from(host.modified_on.unix_timestamp_nanos())
        .with_context(|| format!("modified_on out of range for host {}", host.id))?;

    conn.execute(
        "INSERT INTO hosts(
            id, account, display_name, reporter, host_type, canonical_facts,
            modified_on_unix_ns, stale_timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            host.id.to_string(),
            host.account,
            host.display_name,
            host.reporter,
            host.host_type.as_str(),
            serde_json::to_string(&host.canonical_facts)
                .context("failed to serialize canonical facts")?,
            modified_on_unix_ns,
            rfc3339(host.stale_timestamp)?,
        ],
    )
    .with_context(|| format!("failed to insert host {}", host.id))?;
    Ok(())
}

fn host_exists(conn: &Connection, id: &HostId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM hosts WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if host exists: {id}"))?;
    Ok(exists == 1)
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

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
