use std::path::PathBuf;

use anyhow::anyhow;
use registry_kernel_core::{
    AccessGrant, AccessView, Amendment, AmendmentPathway, CallContext, CallError, Delegation,
    ErrorKind, Inscription, InscriptionPathway, LedgerHeight, LedgerStore, Principal, Record,
    RecordId, RecordTable, Registry, RegistryError, MAX_LEDGER_HEIGHT,
};
use registry_kernel_core::validate;
use registry_kernel_store_sqlite::{LedgerStatus, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Failure of one API call.
///
/// Rejections carry the registry's typed error and should be shown to callers
/// verbatim; internal failures are infrastructure problems.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] RegistryError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rejected(err) => Some(err.kind()),
            Self::Internal(_) => None,
        }
    }
}

impl From<CallError<anyhow::Error>> for ApiError {
    fn from(value: CallError<anyhow::Error>) -> Self {
        match value {
            CallError::Rejected(err) => Self::Rejected(err),
            CallError::Storage(err) => Self::Internal(err),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

fn default_inscription_pathway() -> InscriptionPathway {
    InscriptionPathway::Canonical
}

fn default_amendment_pathway() -> AmendmentPathway {
    AmendmentPathway::Canonical
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InscribeRequest {
    pub actor: String,
    #[serde(default = "default_inscription_pathway")]
    pub pathway: InscriptionPathway,
    pub designation: String,
    pub seal: String,
    pub descriptor: String,
    pub classification: String,
    pub taxonomy: Vec<String>,
    /// Explicit ledger height; defaults to one past the current tip.
    #[serde(default)]
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InscribeReceipt {
    pub record_id: RecordId,
    pub table: RecordTable,
    pub pathway: InscriptionPathway,
    pub ledger_height: LedgerHeight,
    pub record: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmendRequest {
    pub actor: String,
    pub record_id: RecordId,
    #[serde(default = "default_amendment_pathway")]
    pub pathway: AmendmentPathway,
    pub designation: String,
    pub seal: String,
    pub descriptor: String,
    pub taxonomy: Vec<String>,
    #[serde(default)]
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmendReceipt {
    pub record_id: RecordId,
    pub pathway: AmendmentPathway,
    pub amended: bool,
    pub ledger_height: LedgerHeight,
    pub record: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegateRequest {
    pub actor: String,
    pub record_id: RecordId,
    pub recipient: String,
    pub clearance: String,
    pub span: u64,
    #[serde(default)]
    pub mutation_permitted: bool,
    #[serde(default)]
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegateReceipt {
    pub delegated: bool,
    pub ledger_height: LedgerHeight,
    pub grant: AccessGrant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantLookup {
    pub record_id: RecordId,
    pub recipient: Principal,
    /// Whether the grant is live at the current ledger tip.
    pub active: bool,
    pub grant: Option<AccessGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessCheck {
    pub record_id: RecordId,
    pub principal: Principal,
    pub at_height: LedgerHeight,
    pub access: AccessView,
}

#[derive(Debug, Clone)]
pub struct RegistryKernelApi {
    db_path: PathBuf,
}

impl RegistryKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_registry(&self) -> anyhow::Result<Registry<SqliteStore>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(Registry::new(store))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Inscribe one record through the requested pathway.
    ///
    /// # Errors
    /// Returns [`ApiError::Rejected`] for invalid fields or a height below the
    /// ledger tip, and [`ApiError::Internal`] when persistence fails.
    pub fn inscribe(&self, input: InscribeRequest) -> ApiResult<InscribeReceipt> {
        let mut registry = self.open_registry()?;
        let ctx = call_context(registry.store(), input.actor, input.height)?;
        let pathway = input.pathway;
        let inscription = Inscription {
            designation: input.designation,
            seal: input.seal,
            descriptor: input.descriptor,
            classification: input.classification,
            taxonomy: input.taxonomy,
        };

        let record_id = registry.inscribe_via(pathway, &ctx, inscription)?;
        let table = pathway.table();
        let record = registry
            .store()
            .load_record(table, record_id)?
            .ok_or_else(|| anyhow!("inscribed record {record_id} not found in {}", table.as_str()))?;

        Ok(InscribeReceipt { record_id, table, pathway, ledger_height: ctx.height, record })
    }

    /// Amend the mutable fields of a primary-table record.
    ///
    /// # Errors
    /// Returns [`ApiError::Rejected`] for invalid fields, a missing record, a
    /// non-owning actor, or a height below the tip; [`ApiError::Internal`] when
    /// persistence fails.
    pub fn amend(&self, input: AmendRequest) -> ApiResult<AmendReceipt> {
        let mut registry = self.open_registry()?;
        let ctx = call_context(registry.store(), input.actor, input.height)?;
        let amendment = Amendment {
            designation: input.designation,
            seal: input.seal,
            descriptor: input.descriptor,
            taxonomy: input.taxonomy,
        };

        registry.amend_via(input.pathway, &ctx, input.record_id, amendment)?;
        let record = registry
            .record(input.record_id)?
            .ok_or_else(|| anyhow!("amended record {} disappeared", input.record_id))?;

        Ok(AmendReceipt {
            record_id: input.record_id,
            pathway: input.pathway,
            amended: true,
            ledger_height: ctx.height,
            record,
        })
    }

    /// Grant `recipient` time-bounded access to a record the actor owns.
    ///
    /// # Errors
    /// Returns [`ApiError::Rejected`] for invalid delegation fields, a missing
    /// record, or a non-owning actor; [`ApiError::Internal`] when persistence fails.
    pub fn delegate(&self, input: DelegateRequest) -> ApiResult<DelegateReceipt> {
        let mut registry = self.open_registry()?;
        let ctx = call_context(registry.store(), input.actor, input.height)?;
        let recipient = Principal::new(input.recipient);
        let delegation = Delegation {
            recipient: recipient.clone(),
            clearance: input.clearance,
            span: input.span,
            mutation_permitted: input.mutation_permitted,
        };

        registry.delegate(&ctx, input.record_id, delegation)?;
        let grant = registry
            .grant(input.record_id, &recipient)?
            .ok_or_else(|| anyhow!("grant on record {} for {recipient} not stored", input.record_id))?;

        Ok(DelegateReceipt { delegated: true, ledger_height: ctx.height, grant })
    }

    /// Load one record from the selected table.
    ///
    /// # Errors
    /// Returns `RecordMissing` when the table holds no such record.
    pub fn record_show(&self, table: RecordTable, record_id: RecordId) -> ApiResult<Record> {
        let registry = self.open_registry()?;
        registry
            .store()
            .load_record(table, record_id)?
            .ok_or(ApiError::Rejected(RegistryError::RecordMissing(record_id)))
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn grant_show(&self, record_id: RecordId, recipient: &str) -> ApiResult<GrantLookup> {
        let registry = self.open_registry()?;
        let recipient = Principal::new(recipient);
        let tip = registry.store().ledger_height()?;
        let grant = registry.grant(record_id, &recipient)?;
        Ok(GrantLookup {
            record_id,
            active: grant.as_ref().is_some_and(|grant| grant.is_active_at(tip)),
            recipient,
            grant,
        })
    }

    /// Resolve what `principal` holds on a record, at `at_height` or the current tip.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn access_check(
        &self,
        record_id: RecordId,
        principal: &str,
        at_height: Option<u64>,
    ) -> ApiResult<AccessCheck> {
        let registry = self.open_registry()?;
        let principal = Principal::new(principal);
        let at_height = match at_height {
            Some(height) => LedgerHeight(height),
            None => registry.store().ledger_height()?,
        };
        let access = registry.access_at(record_id, &principal, at_height)?;
        Ok(AccessCheck { record_id, principal, at_height, access })
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn ledger_status(&self) -> ApiResult<LedgerStatus> {
        let registry = self.open_registry()?;
        Ok(registry.store().ledger_status()?)
    }
}

fn call_context(store: &SqliteStore, actor: String, requested: Option<u64>) -> ApiResult<CallContext> {
    let tip = store.ledger_height()?;
    let height = match requested {
        None => tip.after(1),
        Some(height) if height >= tip.0 => LedgerHeight(height),
        Some(height) => {
            return Err(ApiError::Rejected(RegistryError::ParameterError(format!(
                "height {height} is below the ledger tip {tip}"
            ))));
        }
    };
    if !validate::height_valid(height) {
        return Err(ApiError::Rejected(RegistryError::ParameterError(format!(
            "height {height} is above the highest ledger height {MAX_LEDGER_HEIGHT}"
        ))));
    }
    debug!(actor = %actor, height = height.0, tip = tip.0, "resolved call context");
    Ok(CallContext::new(actor, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_kernel_core::Clearance;

    type TestResult = anyhow::Result<()>;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("registrykernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup_sqlite_files(db_path: &std::path::Path) -> anyhow::Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|err| anyhow!("failed to cleanup sqlite file {}: {err}", path.display()))?;
            }
        }
        Ok(())
    }

    fn doc_a(actor: &str) -> InscribeRequest {
        InscribeRequest {
            actor: actor.to_string(),
            pathway: InscriptionPathway::Canonical,
            designation: "doc-A".to_string(),
            seal: "f".repeat(64),
            descriptor: "first record".to_string(),
            classification: "public".to_string(),
            taxonomy: vec!["alpha".to_string()],
            height: None,
        }
    }

    fn revise(actor: &str, record_id: RecordId, descriptor: &str) -> AmendRequest {
        AmendRequest {
            actor: actor.to_string(),
            record_id,
            pathway: AmendmentPathway::Canonical,
            designation: "doc-A".to_string(),
            seal: "f".repeat(64),
            descriptor: descriptor.to_string(),
            taxonomy: vec!["alpha".to_string()],
            height: None,
        }
    }

    fn rejection_kind<T: std::fmt::Debug>(result: ApiResult<T>) -> anyhow::Result<ErrorKind> {
        match result {
            Ok(value) => Err(anyhow!("expected rejection, got {value:?}")),
            Err(err) => err.kind().ok_or_else(|| anyhow!("expected typed rejection, got {err}")),
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_inscribe_amend_and_foreign_amend() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        let receipt = api.inscribe(doc_a("alice"))?;
        assert_eq!(receipt.record_id, RecordId(1));
        assert_eq!(receipt.table, RecordTable::Primary);
        assert_eq!(receipt.ledger_height, LedgerHeight(1));

        let amended = api.amend(revise("alice", receipt.record_id, "revised"))?;
        assert!(amended.amended);
        assert_eq!(amended.record.descriptor, "revised");
        assert_eq!(amended.record.owner, Principal::new("alice"));
        assert_eq!(amended.record.created_at, LedgerHeight(1));
        assert_eq!(amended.record.updated_at, LedgerHeight(2));

        let kind = rejection_kind(api.amend(revise("mallory", receipt.record_id, "hijacked")))?;
        assert_eq!(kind, ErrorKind::AccessDenied);
        assert_eq!(api.record_show(RecordTable::Primary, receipt.record_id)?.descriptor, "revised");

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-002
    #[test]
    fn ledger_height_advances_only_on_commit() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        api.inscribe(doc_a("alice"))?;
        let mut invalid = doc_a("alice");
        invalid.classification = String::new();
        assert_eq!(rejection_kind(api.inscribe(invalid))?, ErrorKind::ClassificationError);
        assert_eq!(api.ledger_status()?.ledger_height, LedgerHeight(1));

        let mut secondary = doc_a("alice");
        secondary.pathway = InscriptionPathway::Secondary;
        let receipt = api.inscribe(secondary)?;
        assert_eq!(receipt.record_id, RecordId(2));
        assert_eq!(receipt.table, RecordTable::Optimized);
        assert_eq!(receipt.ledger_height, LedgerHeight(2));

        let status = api.ledger_status()?;
        assert_eq!(status.last_record_id, RecordId(2));
        assert_eq!((status.primary_records, status.optimized_records), (1, 1));

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-003
    #[test]
    fn explicit_height_below_tip_is_rejected() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        let mut first = doc_a("alice");
        first.height = Some(50);
        assert_eq!(api.inscribe(first)?.ledger_height, LedgerHeight(50));

        let mut stale = doc_a("alice");
        stale.height = Some(49);
        assert_eq!(rejection_kind(api.inscribe(stale))?, ErrorKind::ParameterError);
        assert_eq!(api.ledger_status()?.last_record_id, RecordId(1));

        let mut same = doc_a("alice");
        same.height = Some(50);
        assert_eq!(api.inscribe(same)?.record_id, RecordId(2));
        assert_eq!(api.inscribe(doc_a("alice"))?.ledger_height, LedgerHeight(51));

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-004
    #[test]
    fn delegate_then_check_access_over_time() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());
        let record_id = api.inscribe(doc_a("alice"))?.record_id;

        let receipt = api.delegate(DelegateRequest {
            actor: "alice".to_string(),
            record_id,
            recipient: "bob".to_string(),
            clearance: "sovereign".to_string(),
            span: 3,
            mutation_permitted: true,
            height: None,
        })?;
        assert!(receipt.delegated);
        assert_eq!(receipt.grant.clearance, Clearance::Sovereign);
        assert_eq!(receipt.grant.granted_at, LedgerHeight(2));
        assert_eq!(receipt.grant.sunset_at, LedgerHeight(5));

        let lookup = api.grant_show(record_id, "bob")?;
        assert!(lookup.active);
        assert!(lookup.grant.is_some());
        assert!(api.grant_show(record_id, "carol")?.grant.is_none());

        let live = api.access_check(record_id, "bob", Some(4))?;
        assert!(matches!(live.access, AccessView::Granted { mutation_permitted: true, .. }));
        let expired = api.access_check(record_id, "bob", Some(5))?;
        assert!(matches!(expired.access, AccessView::Expired { .. }));
        assert_eq!(api.access_check(record_id, "alice", None)?.access, AccessView::Owner);

        let kind = rejection_kind(api.delegate(DelegateRequest {
            actor: "alice".to_string(),
            record_id,
            recipient: "bob".to_string(),
            clearance: "admin".to_string(),
            span: 3,
            mutation_permitted: false,
            height: None,
        }))?;
        assert_eq!(kind, ErrorKind::ClearanceMismatch);

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-005
    #[test]
    fn record_show_reports_missing_records_and_migrate_dry_run_plans() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let kind = rejection_kind(api.record_show(RecordTable::Optimized, RecordId(7)))?;
        assert_eq!(kind, ErrorKind::RecordMissing);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-006
    #[test]
    fn heights_beyond_ledger_range_are_rejected_not_internal() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        let mut unbounded = doc_a("alice");
        unbounded.height = Some(u64::MAX);
        assert_eq!(rejection_kind(api.inscribe(unbounded))?, ErrorKind::ParameterError);

        let mut top = doc_a("alice");
        top.height = Some(MAX_LEDGER_HEIGHT);
        assert_eq!(api.inscribe(top)?.ledger_height, LedgerHeight(MAX_LEDGER_HEIGHT));

        // The default height would step past the top.
        assert_eq!(rejection_kind(api.inscribe(doc_a("alice")))?, ErrorKind::ParameterError);
        assert_eq!(api.ledger_status()?.last_record_id, RecordId(1));

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TAPI-007
    #[test]
    fn delegation_sunset_beyond_ledger_range_is_timeframe_invalid() -> TestResult {
        let db_path = unique_temp_db_path();
        let api = RegistryKernelApi::new(db_path.clone());

        let mut near_top = doc_a("alice");
        near_top.height = Some(MAX_LEDGER_HEIGHT - 2);
        let record_id = api.inscribe(near_top)?.record_id;

        let kind = rejection_kind(api.delegate(DelegateRequest {
            actor: "alice".to_string(),
            record_id,
            recipient: "bob".to_string(),
            clearance: "baseline".to_string(),
            span: 10,
            mutation_permitted: false,
            height: None,
        }))?;
        assert_eq!(kind, ErrorKind::TimeframeInvalid);
        assert!(api.grant_show(record_id, "bob")?.grant.is_none());

        let receipt = api.delegate(DelegateRequest {
            actor: "alice".to_string(),
            record_id,
            recipient: "bob".to_string(),
            clearance: "baseline".to_string(),
            span: 1,
            mutation_permitted: false,
            height: None,
        })?;
        assert_eq!(receipt.grant.sunset_at, LedgerHeight(MAX_LEDGER_HEIGHT));

        cleanup_sqlite_files(&db_path)
    }

    #[test]
    fn request_pathway_defaults_to_canonical() -> TestResult {
        let request: InscribeRequest = serde_json::from_value(serde_json::json!({
            "actor": "alice",
            "designation": "doc-A",
            "seal": "f".repeat(64),
            "descriptor": "first record",
            "classification": "public",
            "taxonomy": ["alpha"]
        }))?;
        assert_eq!(request.pathway, InscriptionPathway::Canonical);
        assert_eq!(request.height, None);
        Ok(())
    }
}
