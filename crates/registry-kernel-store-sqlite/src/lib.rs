use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use registry_kernel_core::{
    AccessGrant, Amendment, Clearance, Inscription, LedgerHeight, LedgerStore, Principal, Record,
    RecordId, RecordTable, RegistryError,
};
use rusqlite::{params, Connection, DatabaseName, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS registry_counter (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  last_record_id INTEGER NOT NULL CHECK (last_record_id >= 0),
  ledger_height INTEGER NOT NULL CHECK (ledger_height >= 0)
);

INSERT OR IGNORE INTO registry_counter(singleton, last_record_id, ledger_height) VALUES (1, 0, 0);

CREATE TABLE IF NOT EXISTS records (
  record_id INTEGER PRIMARY KEY CHECK (record_id >= 1),
  designation TEXT NOT NULL,
  owner TEXT NOT NULL,
  seal TEXT NOT NULL,
  descriptor TEXT NOT NULL,
  created_height INTEGER NOT NULL CHECK (created_height >= 0),
  updated_height INTEGER NOT NULL CHECK (updated_height >= created_height),
  classification TEXT NOT NULL,
  taxonomy_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS optimized_records (
  record_id INTEGER PRIMARY KEY CHECK (record_id >= 1),
  designation TEXT NOT NULL,
  owner TEXT NOT NULL,
  seal TEXT NOT NULL,
  descriptor TEXT NOT NULL,
  created_height INTEGER NOT NULL CHECK (created_height >= 0),
  updated_height INTEGER NOT NULL CHECK (updated_height >= created_height),
  classification TEXT NOT NULL,
  taxonomy_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_grants (
  record_id INTEGER NOT NULL,
  recipient TEXT NOT NULL,
  clearance TEXT NOT NULL CHECK (clearance IN ('baseline','enhanced','sovereign')),
  granted_height INTEGER NOT NULL CHECK (granted_height >= 0),
  sunset_height INTEGER NOT NULL CHECK (sunset_height > granted_height),
  mutation_permitted INTEGER NOT NULL CHECK (mutation_permitted IN (0,1)),
  PRIMARY KEY (record_id, recipient),
  FOREIGN KEY(record_id) REFERENCES records(record_id) ON DELETE RESTRICT
);
";

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_SQL)];

const RECORD_COLUMNS: &str = "record_id, designation, owner, seal, descriptor, \
     created_height, updated_height, classification, taxonomy_json";

const RECORDS_FILE: &str = "records.ndjson";
const OPTIMIZED_RECORDS_FILE: &str = "optimized_records.ndjson";
const ACCESS_GRANTS_FILE: &str = "access_grants.ndjson";

/// Manifest written at the root of every snapshot directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// The data files every snapshot carries, in export order.
pub const SNAPSHOT_FILES: [&str; 3] = [RECORDS_FILE, OPTIMIZED_RECORDS_FILE, ACCESS_GRANTS_FILE];

/// Durable ledger backed by a single `SQLite` database file.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub last_record_id: RecordId,
    pub ledger_height: LedgerHeight,
    pub primary_records: u64,
    pub optimized_records: u64,
    pub access_grants: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub snapshot_id: String,
    pub exported_at: String,
    pub last_record_id: RecordId,
    pub ledger_height: LedgerHeight,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub imported_optimized_records: usize,
    pub imported_grants: usize,
    pub skipped_existing_records: usize,
    pub skipped_existing_grants: usize,
    pub last_record_id: RecordId,
    pub ledger_height: LedgerHeight,
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
    /// Counter is at or above every stored identifier.
    pub counter_consistent: bool,
    /// Identifiers present in both record tables; always empty on a healthy ledger.
    pub identifier_collisions: Vec<RecordId>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
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
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect::<Vec<_>>();

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration transaction")?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
            record_schema_version(&tx, *version)?;
            tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
            info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Highest ledger height any committed mutation has been stamped with.
    ///
    /// # Errors
    /// Returns an error when the counter row cannot be read.
    pub fn ledger_height(&self) -> Result<LedgerHeight> {
        let (_, height) = read_counter(&self.conn)?;
        Ok(height)
    }

    /// Counter position plus per-table row counts.
    ///
    /// # Errors
    /// Returns an error when the counter or a table count cannot be read.
    pub fn ledger_status(&self) -> Result<LedgerStatus> {
        let (last_record_id, ledger_height) = read_counter(&self.conn)?;
        Ok(LedgerStatus {
            last_record_id,
            ledger_height,
            primary_records: count_rows(&self.conn, "records")?,
            optimized_records: count_rows(&self.conn, "optimized_records")?,
            access_grants: count_rows(&self.conn, "access_grants")?,
        })
    }

    /// Export all ledger tables as NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let (last_record_id, ledger_height) = read_counter(&self.conn)?;
        let primary = self.all_records(RecordTable::Primary)?;
        let optimized = self.all_records(RecordTable::Optimized)?;
        let grants = self.all_grants()?;

        let mut files = Vec::new();
        for (name, digest) in [
            (RECORDS_FILE, write_ndjson_file(&out_dir.join(RECORDS_FILE), &primary)?),
            (OPTIMIZED_RECORDS_FILE, write_ndjson_file(&out_dir.join(OPTIMIZED_RECORDS_FILE), &optimized)?),
            (ACCESS_GRANTS_FILE, write_ndjson_file(&out_dir.join(ACCESS_GRANTS_FILE), &grants)?),
        ] {
            files.push(ExportFileDigest { path: name.to_string(), sha256: digest.0, records: digest.1 });
        }

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            snapshot_id: Ulid::new().to_string(),
            exported_at: now_rfc3339()?,
            last_record_id,
            ledger_height,
            files,
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        info!(
            snapshot_id = %manifest.snapshot_id,
            records = primary.len(),
            optimized_records = optimized.len(),
            grants = grants.len(),
            "exported ledger snapshot"
        );
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// Identifiers are preserved. The counter and ledger height end at or above
    /// both the local and the snapshot values. The whole import is one transaction.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, parsing fails,
    /// or a record already exists while `skip_existing` is false (the error then
    /// wraps [`RegistryError::DuplicateEntry`]).
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let primary = read_ndjson_file::<Record>(&in_dir.join(RECORDS_FILE))?;
        let optimized = read_ndjson_file::<Record>(&in_dir.join(OPTIMIZED_RECORDS_FILE))?;
        let grants = read_ndjson_file::<AccessGrant>(&in_dir.join(ACCESS_GRANTS_FILE))?;

        let mut summary = ImportSummary {
            imported_records: 0,
            imported_optimized_records: 0,
            imported_grants: 0,
            skipped_existing_records: 0,
            skipped_existing_grants: 0,
            last_record_id: RecordId(0),
            ledger_height: LedgerHeight(0),
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;

        for (table, records) in [(RecordTable::Primary, &primary), (RecordTable::Optimized, &optimized)] {
            for record in records {
                if record_exists(&tx, record.record_id)? {
                    if skip_existing {
                        summary.skipped_existing_records += 1;
                        continue;
                    }
                    return Err(anyhow::Error::new(RegistryError::DuplicateEntry(record.record_id))
                        .context(format!("snapshot {} conflicts with local ledger", manifest.snapshot_id)));
                }
                insert_record(&tx, table, record)?;
                match table {
                    RecordTable::Primary => summary.imported_records += 1,
                    RecordTable::Optimized => summary.imported_optimized_records += 1,
                }
            }
        }

        for grant in &grants {
            if grant_exists(&tx, grant.record_id, &grant.recipient)? {
                if skip_existing {
                    summary.skipped_existing_grants += 1;
                    continue;
                }
                return Err(anyhow!(
                    "access grant already exists for record {} and recipient {}",
                    grant.record_id,
                    grant.recipient
                ));
            }
            upsert_grant(&tx, grant)?;
            summary.imported_grants += 1;
        }

        let highest_imported = primary
            .iter()
            .chain(optimized.iter())
            .map(|record| record.record_id)
            .max()
            .unwrap_or_default();
        let (local_last, local_height) = read_counter(&tx)?;
        summary.last_record_id = local_last.max(manifest.last_record_id).max(highest_imported);
        summary.ledger_height = local_height.max(manifest.ledger_height);
        tx.execute(
            "UPDATE registry_counter SET last_record_id = ?1, ledger_height = ?2 WHERE singleton = 1",
            params![to_sql(summary.last_record_id.0)?, to_sql(summary.ledger_height.0)?],
        )
        .context("failed to advance counter after import")?;

        tx.commit().context("failed to commit import transaction")?;
        info!(
            snapshot_id = %manifest.snapshot_id,
            imported_records = summary.imported_records,
            imported_optimized_records = summary.imported_optimized_records,
            imported_grants = summary.imported_grants,
            "imported ledger snapshot"
        );
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        info!(source = %in_file.display(), "restored ledger from backup");
        Ok(())
    }

    /// Run quick-check, foreign-key-check, counter and schema health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
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

        let (last_record_id, _) = read_counter(&self.conn)?;
        let highest_stored: i64 = self
            .conn
            .query_row(
                "SELECT MAX(
                    COALESCE((SELECT MAX(record_id) FROM records), 0),
                    COALESCE((SELECT MAX(record_id) FROM optimized_records), 0)
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to read highest stored record id")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.record_id FROM records r
                 JOIN optimized_records o ON o.record_id = r.record_id
                 ORDER BY r.record_id",
            )
            .context("failed to prepare identifier collision query")?;
        let mut rows = stmt.query([])?;
        let mut identifier_collisions = Vec::new();
        while let Some(row) = rows.next()? {
            identifier_collisions.push(RecordId(from_sql(row.get(0)?)?));
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            counter_consistent: last_record_id.0 >= from_sql(highest_stored)?,
            identifier_collisions,
            schema_status,
        })
    }

    fn all_records(&self, table: RecordTable) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} ORDER BY record_id ASC",
            table_name(table)
        ))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(read_record(row)?);
        }
        Ok(records)
    }

    fn all_grants(&self) -> Result<Vec<AccessGrant>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, recipient, clearance, granted_height, sunset_height, mutation_permitted
             FROM access_grants
             ORDER BY record_id ASC, recipient ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut grants = Vec::new();
        while let Some(row) = rows.next()? {
            grants.push(read_grant(row)?);
        }
        Ok(grants)
    }

    fn begin(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")
    }
}

impl LedgerStore for SqliteStore {
    type Error = anyhow::Error;

    fn last_record_id(&self) -> Result<RecordId> {
        let (last_record_id, _) = read_counter(&self.conn)?;
        Ok(last_record_id)
    }

    fn allocate_and_insert(
        &mut self,
        table: RecordTable,
        owner: &Principal,
        inscription: Inscription,
        height: LedgerHeight,
    ) -> Result<RecordId> {
        let tx = self.begin()?;
        let (last_record_id, _) = read_counter(&tx)?;
        let record_id = last_record_id.next();
        let record = inscription.into_record(record_id, owner.clone(), height);
        insert_record(&tx, table, &record)?;
        tx.execute(
            "UPDATE registry_counter
             SET last_record_id = ?1, ledger_height = MAX(ledger_height, ?2)
             WHERE singleton = 1",
            params![to_sql(record_id.0)?, to_sql(height.0)?],
        )
        .context("failed to advance record counter")?;
        tx.commit().context("failed to commit inscription transaction")?;
        debug!(record_id = record_id.0, table = table.as_str(), "stored record");
        Ok(record_id)
    }

    fn load_record(&self, table: RecordTable, id: RecordId) -> Result<Option<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE record_id = ?1",
            table_name(table)
        ))?;
        let mut rows = stmt.query(params![to_sql(id.0)?])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_record(row)?)),
            None => Ok(None),
        }
    }

    fn update_fields(
        &mut self,
        id: RecordId,
        amendment: Amendment,
        height: LedgerHeight,
    ) -> Result<()> {
        let tx = self.begin()?;
        let taxonomy_json =
            serde_json::to_string(&amendment.taxonomy).context("failed to serialize taxonomy")?;
        tx.execute(
            "UPDATE records
             SET designation = ?2, seal = ?3, descriptor = ?4, taxonomy_json = ?5, updated_height = ?6
             WHERE record_id = ?1",
            params![
                to_sql(id.0)?,
                amendment.designation,
                amendment.seal,
                amendment.descriptor,
                taxonomy_json,
                to_sql(height.0)?,
            ],
        )
        .with_context(|| format!("failed to update record {id}"))?;
        advance_height(&tx, height)?;
        tx.commit().context("failed to commit amendment transaction")?;
        debug!(record_id = id.0, "updated record fields");
        Ok(())
    }

    fn put_grant(&mut self, grant: &AccessGrant) -> Result<()> {
        let tx = self.begin()?;
        upsert_grant(&tx, grant)?;
        advance_height(&tx, grant.granted_at)?;
        tx.commit().context("failed to commit delegation transaction")?;
        debug!(record_id = grant.record_id.0, recipient = %grant.recipient, "stored access grant");
        Ok(())
    }

    fn load_grant(&self, record_id: RecordId, recipient: &Principal) -> Result<Option<AccessGrant>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, recipient, clearance, granted_height, sunset_height, mutation_permitted
             FROM access_grants
             WHERE record_id = ?1 AND recipient = ?2",
        )?;
        let mut rows = stmt.query(params![to_sql(record_id.0)?, recipient.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_grant(row)?)),
            None => Ok(None),
        }
    }
}

fn table_name(table: RecordTable) -> &'static str {
    match table {
        RecordTable::Primary => "records",
        RecordTable::Optimized => "optimized_records",
    }
}

fn insert_record(conn: &Connection, table: RecordTable, record: &Record) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {}({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            table_name(table)
        ),
        params![
            to_sql(record.record_id.0)?,
            record.designation,
            record.owner.as_str(),
            record.seal,
            record.descriptor,
            to_sql(record.created_at.0)?,
            to_sql(record.updated_at.0)?,
            record.classification,
            serde_json::to_string(&record.taxonomy).context("failed to serialize taxonomy")?,
        ],
    )
    .with_context(|| format!("failed to insert record {} into {}", record.record_id, table_name(table)))?;
    Ok(())
}

fn upsert_grant(conn: &Connection, grant: &AccessGrant) -> Result<()> {
    conn.execute(
        "INSERT INTO access_grants(
            record_id, recipient, clearance, granted_height, sunset_height, mutation_permitted
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(record_id, recipient) DO UPDATE SET
            clearance = excluded.clearance,
            granted_height = excluded.granted_height,
            sunset_height = excluded.sunset_height,
            mutation_permitted = excluded.mutation_permitted",
        params![
            to_sql(grant.record_id.0)?,
            grant.recipient.as_str(),
            grant.clearance.as_str(),
            to_sql(grant.granted_at.0)?,
            to_sql(grant.sunset_at.0)?,
            grant.mutation_permitted,
        ],
    )
    .with_context(|| {
        format!("failed to store access grant on record {} for {}", grant.record_id, grant.recipient)
    })?;
    Ok(())
}

fn read_record(row: &rusqlite::Row<'_>) -> Result<Record> {
    let taxonomy_json: String = row.get(8)?;
    Ok(Record {
        record_id: RecordId(from_sql(row.get(0)?)?),
        designation: row.get(1)?,
        owner: Principal::new(row.get::<_, String>(2)?),
        seal: row.get(3)?,
        descriptor: row.get(4)?,
        created_at: LedgerHeight(from_sql(row.get(5)?)?),
        updated_at: LedgerHeight(from_sql(row.get(6)?)?),
        classification: row.get(7)?,
        taxonomy: serde_json::from_str(&taxonomy_json)
            .context("failed to deserialize taxonomy")?,
    })
}

fn read_grant(row: &rusqlite::Row<'_>) -> Result<AccessGrant> {
    let clearance_raw: String = row.get(2)?;
    Ok(AccessGrant {
        record_id: RecordId(from_sql(row.get(0)?)?),
        recipient: Principal::new(row.get::<_, String>(1)?),
        clearance: Clearance::parse(&clearance_raw)
            .ok_or_else(|| anyhow!("unknown clearance: {clearance_raw}"))?,
        granted_at: LedgerHeight(from_sql(row.get(3)?)?),
        sunset_at: LedgerHeight(from_sql(row.get(4)?)?),
        mutation_permitted: row.get(5)?,
    })
}

fn record_exists(conn: &Connection, record_id: RecordId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE record_id = ?1)
                 OR EXISTS(SELECT 1 FROM optimized_records WHERE record_id = ?1)",
            params![to_sql(record_id.0)?],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if record {record_id} exists"))?;
    Ok(exists == 1)
}

fn grant_exists(conn: &Connection, record_id: RecordId, recipient: &Principal) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM access_grants WHERE record_id = ?1 AND recipient = ?2)",
            params![to_sql(record_id.0)?, recipient.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check if access grant exists")?;
    Ok(exists == 1)
}

fn read_counter(conn: &Connection) -> Result<(RecordId, LedgerHeight)> {
    let (last_record_id, ledger_height) = conn
        .query_row(
            "SELECT last_record_id, ledger_height FROM registry_counter WHERE singleton = 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .context("failed to read registry counter; has the database been migrated?")?;
    Ok((RecordId(from_sql(last_record_id)?), LedgerHeight(from_sql(ledger_height)?)))
}

fn advance_height(conn: &Connection, height: LedgerHeight) -> Result<()> {
    conn.execute(
        "UPDATE registry_counter SET ledger_height = MAX(ledger_height, ?1) WHERE singleton = 1",
        params![to_sql(height.0)?],
    )
    .context("failed to advance ledger height")?;
    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    from_sql(count)
}

fn to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} exceeds sqlite integer range"))
}

fn from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative value {value} in unsigned column"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
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

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in SNAPSHOT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
