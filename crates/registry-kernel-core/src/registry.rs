use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::validate;
use crate::{
    AccessGrant, Amendment, AmendmentPathway, CallContext, Clearance, Delegation, Inscription,
    InscriptionPathway, LedgerHeight, LedgerStore, Principal, Record, RecordId, RecordTable,
    RegistryError, MAX_LEDGER_HEIGHT,
};

/// Outcome channel of a registry call: a typed rejection, or a failure of the backing store.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Rejected(#[from] RegistryError),
    #[error("ledger storage failure: {0}")]
    Storage(E),
}

impl<E> CallError<E> {
    #[must_use]
    pub fn rejection(&self) -> Option<&RegistryError> {
        match self {
            Self::Rejected(err) => Some(err),
            Self::Storage(_) => None,
        }
    }
}

/// What a principal may do with a primary-table record at a given height.
///
/// Advisory only: no write path consults it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum AccessView {
    Owner,
    Granted { clearance: Clearance, mutation_permitted: bool, sunset_at: LedgerHeight },
    Expired { clearance: Clearance, sunset_at: LedgerHeight },
    None,
}

/// Registry and delegation protocol over a [`LedgerStore`].
///
/// Every mutating call validates all fields first, then resolves existence and
/// ownership, then performs exactly one store mutation. A rejected call never
/// reaches the store.
#[derive(Debug, Clone, Default)]
pub struct Registry<S> {
    store: S,
}

impl<S: LedgerStore> Registry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// # Errors
    /// Returns the first failing field's rejection, or a storage failure.
    pub fn inscribe(
        &mut self,
        ctx: &CallContext,
        inscription: Inscription,
    ) -> Result<RecordId, CallError<S::Error>> {
        self.inscribe_via(InscriptionPathway::Canonical, ctx, inscription)
    }

    /// # Errors
    /// Same contract as [`Registry::inscribe`].
    pub fn inscribe_optimized(
        &mut self,
        ctx: &CallContext,
        inscription: Inscription,
    ) -> Result<RecordId, CallError<S::Error>> {
        self.inscribe_via(InscriptionPathway::Optimized, ctx, inscription)
    }

    /// # Errors
    /// Same contract as [`Registry::inscribe`].
    pub fn inscribe_fortified(
        &mut self,
        ctx: &CallContext,
        inscription: Inscription,
    ) -> Result<RecordId, CallError<S::Error>> {
        self.inscribe_via(InscriptionPathway::Fortified, ctx, inscription)
    }

    /// Inscribe into the optimized table. The identifier still comes from the shared counter.
    ///
    /// # Errors
    /// Same contract as [`Registry::inscribe`].
    pub fn inscribe_secondary(
        &mut self,
        ctx: &CallContext,
        inscription: Inscription,
    ) -> Result<RecordId, CallError<S::Error>> {
        self.inscribe_via(InscriptionPathway::Secondary, ctx, inscription)
    }

    /// Shared implementation behind the named inscription entry points.
    ///
    /// # Errors
    /// Returns [`CallError::Rejected`] with the first failing field's kind, or
    /// [`CallError::Storage`] when the store cannot commit.
    pub fn inscribe_via(
        &mut self,
        pathway: InscriptionPathway,
        ctx: &CallContext,
        inscription: Inscription,
    ) -> Result<RecordId, CallError<S::Error>> {
        if let Err(err) = inscription.validate() {
            return Err(rejected("inscribe", pathway.as_str(), ctx, err));
        }
        let table = pathway.table();
        let record_id = self
            .store
            .allocate_and_insert(table, &ctx.actor, inscription, ctx.height)
            .map_err(CallError::Storage)?;
        info!(
            record_id = record_id.0,
            pathway = pathway.as_str(),
            table = table.as_str(),
            actor = %ctx.actor,
            height = ctx.height.0,
            "record inscribed"
        );
        Ok(record_id)
    }

    /// # Errors
    /// Returns the first failing field's rejection, then `RecordMissing`, then
    /// `AccessDenied`, or a storage failure.
    pub fn amend(
        &mut self,
        ctx: &CallContext,
        record_id: RecordId,
        amendment: Amendment,
    ) -> Result<(), CallError<S::Error>> {
        self.amend_via(AmendmentPathway::Canonical, ctx, record_id, amendment)
    }

    /// # Errors
    /// Same contract as [`Registry::amend`].
    pub fn amend_optimized(
        &mut self,
        ctx: &CallContext,
        record_id: RecordId,
        amendment: Amendment,
    ) -> Result<(), CallError<S::Error>> {
        self.amend_via(AmendmentPathway::Optimized, ctx, record_id, amendment)
    }

    /// # Errors
    /// Same contract as [`Registry::amend`].
    pub fn amend_fortified(
        &mut self,
        ctx: &CallContext,
        record_id: RecordId,
        amendment: Amendment,
    ) -> Result<(), CallError<S::Error>> {
        self.amend_via(AmendmentPathway::Fortified, ctx, record_id, amendment)
    }

    /// Trusted fast path: ownership is enforced but the revised fields are
    /// merged as given, so a record may end up holding values inscription
    /// would refuse.
    ///
    /// # Errors
    /// Returns `RecordMissing`, `AccessDenied`, or a storage failure.
    pub fn amend_unchecked(
        &mut self,
        ctx: &CallContext,
        record_id: RecordId,
        amendment: Amendment,
    ) -> Result<(), CallError<S::Error>> {
        self.amend_via(AmendmentPathway::Unchecked, ctx, record_id, amendment)
    }

    /// Shared implementation behind the named amendment entry points.
    ///
    /// # Errors
    /// Returns [`CallError::Rejected`] for invalid fields (unless the pathway
    /// skips validation), a missing record, or a non-owning actor;
    /// [`CallError::Storage`] when the store fails.
    pub fn amend_via(
        &mut self,
        pathway: AmendmentPathway,
        ctx: &CallContext,
        record_id: RecordId,
        amendment: Amendment,
    ) -> Result<(), CallError<S::Error>> {
        if pathway.revalidates_fields() {
            if let Err(err) = amendment.validate() {
                return Err(rejected("amend", pathway.as_str(), ctx, err));
            }
        }
        if let Err(err) = self.authorize_owner(ctx, record_id)? {
            return Err(rejected("amend", pathway.as_str(), ctx, err));
        }
        self.store
            .update_fields(record_id, amendment, ctx.height)
            .map_err(CallError::Storage)?;
        info!(
            record_id = record_id.0,
            pathway = pathway.as_str(),
            actor = %ctx.actor,
            height = ctx.height.0,
            "record amended"
        );
        Ok(())
    }

    /// Record a time-bounded grant for `delegation.recipient`, replacing any
    /// grant that recipient already holds on the record.
    ///
    /// # Errors
    /// Returns `ParameterError`, `ClearanceMismatch` or `TimeframeInvalid` for
    /// bad input, then `RecordMissing` or `AccessDenied`, or a storage failure.
    pub fn delegate(
        &mut self,
        ctx: &CallContext,
        record_id: RecordId,
        delegation: Delegation,
    ) -> Result<(), CallError<S::Error>> {
        let clearance = match delegation.validate(&ctx.actor) {
            Ok(clearance) => clearance,
            Err(err) => return Err(rejected("delegate", "canonical", ctx, err)),
        };
        if !validate::sunset_valid(ctx.height, delegation.span) {
            let err = RegistryError::TimeframeInvalid(format!(
                "sunset {} + {} is beyond the highest ledger height {MAX_LEDGER_HEIGHT}",
                ctx.height, delegation.span
            ));
            return Err(rejected("delegate", "canonical", ctx, err));
        }
        if let Err(err) = self.authorize_owner(ctx, record_id)? {
            return Err(rejected("delegate", "canonical", ctx, err));
        }
        let grant = AccessGrant::issue(
            record_id,
            delegation.recipient,
            clearance,
            delegation.span,
            delegation.mutation_permitted,
            ctx.height,
        );
        self.store.put_grant(&grant).map_err(CallError::Storage)?;
        info!(
            record_id = record_id.0,
            recipient = %grant.recipient,
            clearance = clearance.as_str(),
            sunset_at = grant.sunset_at.0,
            actor = %ctx.actor,
            "access delegated"
        );
        Ok(())
    }

    /// # Errors
    /// Returns the store error when the lookup fails.
    pub fn record(&self, record_id: RecordId) -> Result<Option<Record>, S::Error> {
        self.store.load_record(RecordTable::Primary, record_id)
    }

    /// # Errors
    /// Returns the store error when the lookup fails.
    pub fn secondary_record(&self, record_id: RecordId) -> Result<Option<Record>, S::Error> {
        self.store.load_record(RecordTable::Optimized, record_id)
    }

    /// # Errors
    /// Returns the store error when the lookup fails.
    pub fn is_owner(
        &self,
        table: RecordTable,
        record_id: RecordId,
        principal: &Principal,
    ) -> Result<bool, S::Error> {
        self.store.is_owner(table, record_id, principal)
    }

    /// # Errors
    /// Returns the store error when the lookup fails.
    pub fn grant(
        &self,
        record_id: RecordId,
        recipient: &Principal,
    ) -> Result<Option<AccessGrant>, S::Error> {
        self.store.load_grant(record_id, recipient)
    }

    /// # Errors
    /// Returns the store error when the counter cannot be read.
    pub fn last_record_id(&self) -> Result<RecordId, S::Error> {
        self.store.last_record_id()
    }

    /// Resolve what `principal` holds on a primary-table record at `height`.
    ///
    /// # Errors
    /// Returns the store error when a lookup fails.
    pub fn access_at(
        &self,
        record_id: RecordId,
        principal: &Principal,
        height: LedgerHeight,
    ) -> Result<AccessView, S::Error> {
        let Some(record) = self.store.load_record(RecordTable::Primary, record_id)? else {
            return Ok(AccessView::None);
        };
        if &record.owner == principal {
            return Ok(AccessView::Owner);
        }
        let view = match self.store.load_grant(record_id, principal)? {
            Some(grant) if grant.is_active_at(height) => AccessView::Granted {
                clearance: grant.clearance,
                mutation_permitted: grant.mutation_permitted,
                sunset_at: grant.sunset_at,
            },
            Some(grant) if height >= grant.sunset_at => {
                AccessView::Expired { clearance: grant.clearance, sunset_at: grant.sunset_at }
            }
            _ => AccessView::None,
        };
        Ok(view)
    }

    fn authorize_owner(
        &self,
        ctx: &CallContext,
        record_id: RecordId,
    ) -> Result<Result<(), RegistryError>, CallError<S::Error>> {
        let record = self
            .store
            .load_record(RecordTable::Primary, record_id)
            .map_err(CallError::Storage)?;
        let verdict = match record {
            None => Err(RegistryError::RecordMissing(record_id)),
            Some(record) if record.owner != ctx.actor => {
                Err(RegistryError::AccessDenied { record_id, actor: ctx.actor.clone() })
            }
            Some(_) => Ok(()),
        };
        Ok(verdict)
    }
}

fn rejected<E>(
    operation: &'static str,
    pathway: &'static str,
    ctx: &CallContext,
    err: RegistryError,
) -> CallError<E> {
    debug!(
        operation,
        pathway,
        actor = %ctx.actor,
        error_kind = err.kind().as_str(),
        "registry call rejected"
    );
    CallError::Rejected(err)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{ErrorKind, InMemoryLedger, MAX_GRANT_SPAN};

    fn registry() -> Registry<InMemoryLedger> {
        Registry::new(InMemoryLedger::new())
    }

    fn at(actor: &str, height: u64) -> CallContext {
        CallContext::new(actor, LedgerHeight(height))
    }

    fn doc_a() -> Inscription {
        Inscription {
            designation: "doc-A".to_string(),
            seal: "f".repeat(64),
            descriptor: "first record".to_string(),
            classification: "public".to_string(),
            taxonomy: vec!["alpha".to_string()],
        }
    }

    fn amendment(descriptor: &str) -> Amendment {
        Amendment {
            designation: "doc-A".to_string(),
            seal: "e".repeat(64),
            descriptor: descriptor.to_string(),
            taxonomy: vec!["alpha".to_string(), "beta".to_string()],
        }
    }

    fn delegation(recipient: &str, clearance: &str, span: u64) -> Delegation {
        Delegation {
            recipient: Principal::new(recipient),
            clearance: clearance.to_string(),
            span,
            mutation_permitted: false,
        }
    }

    fn kind_of<T: std::fmt::Debug>(result: Result<T, CallError<std::convert::Infallible>>) -> ErrorKind {
        match result {
            Ok(value) => panic!("expected rejection, got {value:?}"),
            Err(err) => match err.rejection() {
                Some(rejection) => rejection.kind(),
                None => panic!("expected typed rejection, got {err}"),
            },
        }
    }

    fn inscribed(registry: &mut Registry<InMemoryLedger>, ctx: &CallContext) -> RecordId {
        registry
            .inscribe(ctx, doc_a())
            .unwrap_or_else(|err| panic!("inscribe failed: {err}"))
    }

    fn stored(registry: &Registry<InMemoryLedger>, id: RecordId) -> Record {
        match registry.record(id) {
            Ok(Some(record)) => record,
            other => panic!("record {id} not readable: {other:?}"),
        }
    }

    // Test IDs: REG-001
    #[test]
    fn end_to_end_inscribe_amend_and_foreign_amend() {
        let mut registry = registry();
        let alice = at("alice", 10);
        let id = inscribed(&mut registry, &alice);
        assert_eq!(id, RecordId(1));

        let amend_ctx = at("alice", 12);
        registry
            .amend(&amend_ctx, id, amendment("revised record"))
            .unwrap_or_else(|err| panic!("owner amend failed: {err}"));
        let record = stored(&registry, id);
        assert_eq!(record.descriptor, "revised record");
        assert_eq!(record.owner, Principal::new("alice"));
        assert_eq!(record.created_at, LedgerHeight(10));
        assert_eq!(record.updated_at, LedgerHeight(12));
        assert_eq!(record.seal, "e".repeat(64));
        assert_eq!(record.taxonomy, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(record.classification, "public");

        let kind = kind_of(registry.amend(&at("mallory", 13), id, amendment("hijacked")));
        assert_eq!(kind, ErrorKind::AccessDenied);
        assert_eq!(stored(&registry, id), record);
    }

    // Test IDs: REG-002
    #[test]
    fn rejected_inscription_leaves_counter_unchanged() {
        let mut registry = registry();
        let ctx = at("alice", 1);
        inscribed(&mut registry, &ctx);

        for designation in [String::new(), "d".repeat(51)] {
            let input = Inscription { designation, ..doc_a() };
            assert_eq!(kind_of(registry.inscribe(&ctx, input)), ErrorKind::ParameterError);
        }
        let input = Inscription { seal: "f".repeat(65), ..doc_a() };
        assert_eq!(kind_of(registry.inscribe_fortified(&ctx, input)), ErrorKind::ParameterError);

        for taxonomy in [Vec::new(), vec!["t".to_string(); 6], vec![String::new()], vec!["t".repeat(31)]] {
            let input = Inscription { taxonomy, ..doc_a() };
            assert_eq!(kind_of(registry.inscribe_secondary(&ctx, input)), ErrorKind::DescriptorProblem);
        }

        assert_eq!(registry.last_record_id().ok(), Some(RecordId(1)));
    }

    // Test IDs: REG-003
    #[test]
    fn secondary_inscription_shares_counter_but_not_keyspace() {
        let mut registry = registry();
        let ctx = at("alice", 3);
        let first = inscribed(&mut registry, &ctx);
        let second = registry
            .inscribe_secondary(&ctx, doc_a())
            .unwrap_or_else(|err| panic!("secondary inscribe failed: {err}"));
        let third = registry
            .inscribe_optimized(&ctx, doc_a())
            .unwrap_or_else(|err| panic!("optimized inscribe failed: {err}"));

        assert_eq!((first, second, third), (RecordId(1), RecordId(2), RecordId(3)));
        assert_eq!(registry.record(second).ok(), Some(None));
        assert!(matches!(registry.secondary_record(second), Ok(Some(_))));
        assert_eq!(registry.secondary_record(first).ok(), Some(None));
        assert_eq!(
            registry.is_owner(RecordTable::Optimized, second, &Principal::new("alice")).ok(),
            Some(true)
        );

        // Amendments address the primary table only.
        let kind = kind_of(registry.amend(&ctx, second, amendment("nope")));
        assert_eq!(kind, ErrorKind::RecordMissing);
    }

    // Test IDs: REG-004
    #[test]
    fn amend_checks_fields_then_existence_then_owner() {
        let mut registry = registry();
        let ctx = at("alice", 1);
        let id = inscribed(&mut registry, &ctx);

        let bad = Amendment { descriptor: String::new(), ..amendment("x") };
        assert_eq!(kind_of(registry.amend(&at("mallory", 2), RecordId(99), bad)), ErrorKind::DescriptorProblem);
        assert_eq!(
            kind_of(registry.amend_optimized(&at("mallory", 2), RecordId(99), amendment("x"))),
            ErrorKind::RecordMissing
        );
        assert_eq!(
            kind_of(registry.amend_fortified(&at("mallory", 2), id, amendment("x"))),
            ErrorKind::AccessDenied
        );
    }

    // Test IDs: REG-005
    #[test]
    fn unchecked_amendment_skips_field_validation_but_not_ownership() {
        let mut registry = registry();
        let ctx = at("alice", 1);
        let id = inscribed(&mut registry, &ctx);

        let loose = Amendment {
            designation: String::new(),
            seal: "short".to_string(),
            descriptor: "d".repeat(250),
            taxonomy: Vec::new(),
        };
        assert_eq!(
            kind_of(registry.amend_unchecked(&at("mallory", 2), id, loose.clone())),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            kind_of(registry.amend(&at("alice", 2), id, loose.clone())),
            ErrorKind::ParameterError
        );

        registry
            .amend_unchecked(&at("alice", 2), id, loose)
            .unwrap_or_else(|err| panic!("unchecked amend failed: {err}"));
        let record = stored(&registry, id);
        assert_eq!(record.seal, "short");
        assert!(record.taxonomy.is_empty());
        assert_eq!(record.updated_at, LedgerHeight(2));
    }

    // Test IDs: REG-006
    #[test]
    fn delegate_validates_then_overwrites_single_grant() {
        let mut registry = registry();
        let ctx = at("alice", 100);
        let id = inscribed(&mut registry, &ctx);

        assert_eq!(kind_of(registry.delegate(&ctx, id, delegation("alice", "baseline", 10))), ErrorKind::ParameterError);
        assert_eq!(kind_of(registry.delegate(&ctx, id, delegation("bob", "baseline", 0))), ErrorKind::TimeframeInvalid);
        assert_eq!(
            kind_of(registry.delegate(&ctx, id, delegation("bob", "baseline", MAX_GRANT_SPAN + 1))),
            ErrorKind::TimeframeInvalid
        );
        assert_eq!(kind_of(registry.delegate(&ctx, id, delegation("bob", "root", 10))), ErrorKind::ClearanceMismatch);
        assert_eq!(
            kind_of(registry.delegate(&ctx, RecordId(7), delegation("bob", "baseline", 10))),
            ErrorKind::RecordMissing
        );
        assert_eq!(
            kind_of(registry.delegate(&at("carol", 100), id, delegation("bob", "baseline", 10))),
            ErrorKind::AccessDenied
        );
        assert_eq!(registry.store().grant_count(), 0);

        registry
            .delegate(&ctx, id, delegation("bob", "baseline", 10))
            .unwrap_or_else(|err| panic!("first delegation failed: {err}"));
        let mut second = delegation("bob", "sovereign", 500);
        second.mutation_permitted = true;
        registry
            .delegate(&at("alice", 120), id, second)
            .unwrap_or_else(|err| panic!("second delegation failed: {err}"));

        assert_eq!(registry.store().grant_count(), 1);
        let grant = match registry.grant(id, &Principal::new("bob")) {
            Ok(Some(grant)) => grant,
            other => panic!("grant missing: {other:?}"),
        };
        assert_eq!(grant.clearance, Clearance::Sovereign);
        assert_eq!(grant.granted_at, LedgerHeight(120));
        assert_eq!(grant.sunset_at, LedgerHeight(620));
        assert!(grant.mutation_permitted);
    }

    // Test IDs: REG-008
    #[test]
    fn delegation_sunset_must_fit_ledger_range() {
        let mut registry = registry();
        let near_top = at("alice", MAX_LEDGER_HEIGHT - 5);
        let id = inscribed(&mut registry, &near_top);

        assert_eq!(
            kind_of(registry.delegate(&near_top, id, delegation("bob", "baseline", 10))),
            ErrorKind::TimeframeInvalid
        );
        assert_eq!(registry.store().grant_count(), 0);

        registry
            .delegate(&near_top, id, delegation("bob", "baseline", 5))
            .unwrap_or_else(|err| panic!("delegation ending at the top height failed: {err}"));
        let sunset = registry.grant(id, &Principal::new("bob")).ok().flatten().map(|grant| grant.sunset_at);
        assert_eq!(sunset, Some(LedgerHeight(MAX_LEDGER_HEIGHT)));
    }

    // Test IDs: REG-007
    #[test]
    fn access_view_tracks_ownership_and_expiry() {
        let mut registry = registry();
        let ctx = at("alice", 10);
        let id = inscribed(&mut registry, &ctx);
        registry
            .delegate(&ctx, id, delegation("bob", "enhanced", 5))
            .unwrap_or_else(|err| panic!("delegation failed: {err}"));

        let bob = Principal::new("bob");
        assert_eq!(registry.access_at(id, &Principal::new("alice"), LedgerHeight(99)).ok(), Some(AccessView::Owner));
        assert_eq!(
            registry.access_at(id, &bob, LedgerHeight(14)).ok(),
            Some(AccessView::Granted {
                clearance: Clearance::Enhanced,
                mutation_permitted: false,
                sunset_at: LedgerHeight(15),
            })
        );
        assert_eq!(
            registry.access_at(id, &bob, LedgerHeight(15)).ok(),
            Some(AccessView::Expired { clearance: Clearance::Enhanced, sunset_at: LedgerHeight(15) })
        );
        assert_eq!(registry.access_at(id, &Principal::new("carol"), LedgerHeight(11)).ok(), Some(AccessView::None));
        assert_eq!(registry.access_at(RecordId(42), &bob, LedgerHeight(11)).ok(), Some(AccessView::None));

        // Expired grants are advisory; the owner keeps full control.
        registry
            .amend(&at("alice", 40), id, amendment("still mine"))
            .unwrap_or_else(|err| panic!("owner amend failed: {err}"));
    }

    proptest! {
        #[test]
        fn property_identifiers_increase_by_one_across_pathways(pathways in prop::collection::vec(0_u8..4, 1..40)) {
            let mut registry = registry();
            let ctx = at("alice", 1);
            for selector in pathways {
                let pathway = match selector {
                    0 => InscriptionPathway::Canonical,
                    1 => InscriptionPathway::Optimized,
                    2 => InscriptionPathway::Fortified,
                    _ => InscriptionPathway::Secondary,
                };
                let before = registry.last_record_id().unwrap_or_else(|err| match err {});
                let id = registry
                    .inscribe_via(pathway, &ctx, doc_a())
                    .unwrap_or_else(|err| panic!("inscribe failed: {err}"));
                prop_assert_eq!(id, before.next());
                prop_assert_eq!(registry.last_record_id().unwrap_or_else(|err| match err {}), id);
            }
        }
    }
}
