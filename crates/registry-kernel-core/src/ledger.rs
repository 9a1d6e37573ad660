use std::collections::BTreeMap;
use std::convert::Infallible;

use crate::{
    AccessGrant, Amendment, Inscription, LedgerHeight, Principal, Record, RecordId, RecordTable,
};

/// Key-value seam between the registry protocol and whatever persists its state.
///
/// One implementation owns the two record tables, the delegation table, and the
/// identifier counter they share. Every mutating method is a single atomic step:
/// it either commits fully or leaves the store untouched.
pub trait LedgerStore {
    type Error;

    /// Highest identifier handed out so far; `RecordId(0)` on an empty ledger.
    ///
    /// # Errors
    /// Returns the backend error when the counter cannot be read.
    fn last_record_id(&self) -> Result<RecordId, Self::Error>;

    /// Take `last_record_id + 1`, store the record under it in `table`, and advance the counter.
    ///
    /// # Errors
    /// Returns the backend error when the write cannot be committed.
    fn allocate_and_insert(
        &mut self,
        table: RecordTable,
        owner: &Principal,
        inscription: Inscription,
        height: LedgerHeight,
    ) -> Result<RecordId, Self::Error>;

    /// # Errors
    /// Returns the backend error when the lookup fails.
    fn load_record(&self, table: RecordTable, id: RecordId) -> Result<Option<Record>, Self::Error>;

    /// Replace the mutable fields of a primary-table record. Existence and
    /// ownership are the caller's responsibility.
    ///
    /// # Errors
    /// Returns the backend error when the write cannot be committed.
    fn update_fields(
        &mut self,
        id: RecordId,
        amendment: Amendment,
        height: LedgerHeight,
    ) -> Result<(), Self::Error>;

    /// Store `grant`, replacing any grant held for the same record and recipient.
    ///
    /// # Errors
    /// Returns the backend error when the write cannot be committed.
    fn put_grant(&mut self, grant: &AccessGrant) -> Result<(), Self::Error>;

    /// # Errors
    /// Returns the backend error when the lookup fails.
    fn load_grant(
        &self,
        record_id: RecordId,
        recipient: &Principal,
    ) -> Result<Option<AccessGrant>, Self::Error>;

    /// `false` when the record does not exist.
    ///
    /// # Errors
    /// Returns the backend error when the lookup fails.
    fn is_owner(
        &self,
        table: RecordTable,
        id: RecordId,
        principal: &Principal,
    ) -> Result<bool, Self::Error> {
        Ok(self.load_record(table, id)?.is_some_and(|record| &record.owner == principal))
    }
}

/// Volatile ledger for tests, benches and embedding without persistence.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    last_record_id: RecordId,
    primary: BTreeMap<RecordId, Record>,
    optimized: BTreeMap<RecordId, Record>,
    grants: BTreeMap<(RecordId, Principal), AccessGrant>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: RecordTable) -> &BTreeMap<RecordId, Record> {
        match table {
            RecordTable::Primary => &self.primary,
            RecordTable::Optimized => &self.optimized,
        }
    }

    fn table_mut(&mut self, table: RecordTable) -> &mut BTreeMap<RecordId, Record> {
        match table {
            RecordTable::Primary => &mut self.primary,
            RecordTable::Optimized => &mut self.optimized,
        }
    }

    #[must_use]
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }
}

impl LedgerStore for InMemoryLedger {
    type Error = Infallible;

    fn last_record_id(&self) -> Result<RecordId, Self::Error> {
        Ok(self.last_record_id)
    }

    fn allocate_and_insert(
        &mut self,
        table: RecordTable,
        owner: &Principal,
        inscription: Inscription,
        height: LedgerHeight,
    ) -> Result<RecordId, Self::Error> {
        let record_id = self.last_record_id.next();
        let record = inscription.into_record(record_id, owner.clone(), height);
        self.table_mut(table).insert(record_id, record);
        self.last_record_id = record_id;
        Ok(record_id)
    }

    fn load_record(&self, table: RecordTable, id: RecordId) -> Result<Option<Record>, Self::Error> {
        Ok(self.table(table).get(&id).cloned())
    }

    fn update_fields(
        &mut self,
        id: RecordId,
        amendment: Amendment,
        height: LedgerHeight,
    ) -> Result<(), Self::Error> {
        if let Some(record) = self.primary.get_mut(&id) {
            amendment.apply_to(record, height);
        }
        Ok(())
    }

    fn put_grant(&mut self, grant: &AccessGrant) -> Result<(), Self::Error> {
        self.grants.insert((grant.record_id, grant.recipient.clone()), grant.clone());
        Ok(())
    }

    fn load_grant(
        &self,
        record_id: RecordId,
        recipient: &Principal,
    ) -> Result<Option<AccessGrant>, Self::Error> {
        Ok(self.grants.get(&(record_id, recipient.clone())).cloned())
    }
}
