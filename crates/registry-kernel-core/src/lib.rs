use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod ledger;
mod registry;
pub mod validate;

pub use ledger::{InMemoryLedger, LedgerStore};
pub use registry::{AccessView, CallError, Registry};

/// Longest permitted delegation span, in ledger height units (about one year).
pub const MAX_GRANT_SPAN: u64 = 52_560;

/// Highest ledger height a durable ledger can record (the signed 64-bit range).
pub const MAX_LEDGER_HEIGHT: u64 = 9_223_372_036_854_775_807;

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An identity able to issue calls. Principals are only ever compared for equality.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Principal {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct LedgerHeight(pub u64);

impl LedgerHeight {
    /// Height reached after `span` more units, saturating at `u64::MAX`.
    #[must_use]
    pub fn after(self, span: u64) -> Self {
        Self(self.0.saturating_add(span))
    }
}

impl Display for LedgerHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Baseline,
    Enhanced,
    Sovereign,
}

impl Clearance {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Enhanced => "enhanced",
            Self::Sovereign => "sovereign",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baseline" => Some(Self::Baseline),
            "enhanced" => Some(Self::Enhanced),
            "sovereign" => Some(Self::Sovereign),
            _ => None,
        }
    }
}

/// Selects one of the two record keyspaces. Both draw identifiers from the same counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordTable {
    Primary,
    Optimized,
}

impl RecordTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Optimized => "optimized",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "optimized" => Some(Self::Optimized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InscriptionPathway {
    Canonical,
    Optimized,
    Fortified,
    Secondary,
}

impl InscriptionPathway {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Optimized => "optimized",
            Self::Fortified => "fortified",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "canonical" => Some(Self::Canonical),
            "optimized" => Some(Self::Optimized),
            "fortified" => Some(Self::Fortified),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }

    /// Table the pathway writes into. Only the secondary pathway leaves the primary table.
    #[must_use]
    pub fn table(self) -> RecordTable {
        match self {
            Self::Canonical | Self::Optimized | Self::Fortified => RecordTable::Primary,
            Self::Secondary => RecordTable::Optimized,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AmendmentPathway {
    Canonical,
    Optimized,
    Fortified,
    Unchecked,
}

impl AmendmentPathway {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Optimized => "optimized",
            Self::Fortified => "fortified",
            Self::Unchecked => "unchecked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "canonical" => Some(Self::Canonical),
            "optimized" => Some(Self::Optimized),
            "fortified" => Some(Self::Fortified),
            "unchecked" => Some(Self::Unchecked),
            _ => None,
        }
    }

    #[must_use]
    pub fn revalidates_fields(self) -> bool {
        !matches!(self, Self::Unchecked)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    ParameterError,
    RecordMissing,
    DuplicateEntry,
    DescriptorProblem,
    AuthorizationLacking,
    TimeframeInvalid,
    ClearanceMismatch,
    ClassificationError,
}

impl ErrorKind {
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::AccessDenied => 100,
            Self::ParameterError => 101,
            Self::RecordMissing => 102,
            Self::DuplicateEntry => 103,
            Self::DescriptorProblem => 104,
            Self::AuthorizationLacking => 105,
            Self::TimeframeInvalid => 106,
            Self::ClearanceMismatch => 107,
            Self::ClassificationError => 108,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::ParameterError => "parameter_error",
            Self::RecordMissing => "record_missing",
            Self::DuplicateEntry => "duplicate_entry",
            Self::DescriptorProblem => "descriptor_problem",
            Self::AuthorizationLacking => "authorization_lacking",
            Self::TimeframeInvalid => "timeframe_invalid",
            Self::ClearanceMismatch => "clearance_mismatch",
            Self::ClassificationError => "classification_error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal rejection of one registry call. A rejected call leaves no state behind.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("access_denied: principal `{actor}` does not own record {record_id}")]
    AccessDenied { record_id: RecordId, actor: Principal },
    #[error("parameter_error: {0}")]
    ParameterError(String),
    #[error("record_missing: no record with id {0}")]
    RecordMissing(RecordId),
    #[error("duplicate_entry: record {0} already exists")]
    DuplicateEntry(RecordId),
    #[error("descriptor_problem: {0}")]
    DescriptorProblem(String),
    #[error("authorization_lacking: {0}")]
    AuthorizationLacking(String),
    #[error("timeframe_invalid: {0}")]
    TimeframeInvalid(String),
    #[error("clearance_mismatch: `{0}` is not one of baseline, enhanced, sovereign")]
    ClearanceMismatch(String),
    #[error("classification_error: {0}")]
    ClassificationError(String),
}

impl RegistryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::ParameterError(_) => ErrorKind::ParameterError,
            Self::RecordMissing(_) => ErrorKind::RecordMissing,
            Self::DuplicateEntry(_) => ErrorKind::DuplicateEntry,
            Self::DescriptorProblem(_) => ErrorKind::DescriptorProblem,
            Self::AuthorizationLacking(_) => ErrorKind::AuthorizationLacking,
            Self::TimeframeInvalid(_) => ErrorKind::TimeframeInvalid,
            Self::ClearanceMismatch(_) => ErrorKind::ClearanceMismatch,
            Self::ClassificationError(_) => ErrorKind::ClassificationError,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub record_id: RecordId,
    pub designation: String,
    pub owner: Principal,
    pub seal: String,
    pub descriptor: String,
    pub created_at: LedgerHeight,
    pub updated_at: LedgerHeight,
    pub classification: String,
    pub taxonomy: Vec<String>,
}

/// Field values supplied when a record is first inscribed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Inscription {
    pub designation: String,
    pub seal: String,
    pub descriptor: String,
    pub classification: String,
    pub taxonomy: Vec<String>,
}

impl Inscription {
    /// Check every field in declaration order and report the first failure.
    ///
    /// # Errors
    /// Returns [`RegistryError::ParameterError`] for designation or seal,
    /// [`RegistryError::DescriptorProblem`] for descriptor or taxonomy, and
    /// [`RegistryError::ClassificationError`] for classification.
    pub fn validate(&self) -> Result<(), RegistryError> {
        check_designation(&self.designation)?;
        check_seal(&self.seal)?;
        check_descriptor(&self.descriptor)?;
        if !validate::classification_valid(&self.classification) {
            return Err(RegistryError::ClassificationError(format!(
                "classification MUST be 1..={} characters",
                validate::MAX_CLASSIFICATION_CHARS
            )));
        }
        check_taxonomy(&self.taxonomy)
    }

    #[must_use]
    pub fn into_record(self, record_id: RecordId, owner: Principal, height: LedgerHeight) -> Record {
        Record {
            record_id,
            designation: self.designation,
            owner,
            seal: self.seal,
            descriptor: self.descriptor,
            created_at: height,
            updated_at: height,
            classification: self.classification,
            taxonomy: self.taxonomy,
        }
    }
}

/// Revised values for the mutable fields of an existing record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Amendment {
    pub designation: String,
    pub seal: String,
    pub descriptor: String,
    pub taxonomy: Vec<String>,
}

impl Amendment {
    /// Check the revised fields with the same predicates inscription uses.
    ///
    /// # Errors
    /// Returns [`RegistryError::ParameterError`] or [`RegistryError::DescriptorProblem`]
    /// for the first failing field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        check_designation(&self.designation)?;
        check_seal(&self.seal)?;
        check_descriptor(&self.descriptor)?;
        check_taxonomy(&self.taxonomy)
    }

    /// Merge onto `record`, leaving identity, owner, creation height and classification alone.
    pub fn apply_to(self, record: &mut Record, height: LedgerHeight) {
        record.designation = self.designation;
        record.seal = self.seal;
        record.descriptor = self.descriptor;
        record.taxonomy = self.taxonomy;
        record.updated_at = height;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Delegation {
    pub recipient: Principal,
    pub clearance: String,
    pub span: u64,
    pub mutation_permitted: bool,
}

impl Delegation {
    /// Validate against the granting principal and resolve the clearance level.
    ///
    /// # Errors
    /// Returns [`RegistryError::ParameterError`] for self-delegation,
    /// [`RegistryError::ClearanceMismatch`] for an unknown clearance and
    /// [`RegistryError::TimeframeInvalid`] for an out-of-range span.
    pub fn validate(&self, grantor: &Principal) -> Result<Clearance, RegistryError> {
        if !validate::recipient_valid(&self.recipient, grantor) {
            return Err(RegistryError::ParameterError(
                "recipient MUST differ from the granting principal".to_string(),
            ));
        }
        if !validate::clearance_valid(&self.clearance) {
            return Err(RegistryError::ClearanceMismatch(self.clearance.clone()));
        }
        if !validate::span_valid(self.span) {
            return Err(RegistryError::TimeframeInvalid(format!(
                "span {} is outside (0, {MAX_GRANT_SPAN}]",
                self.span
            )));
        }
        Clearance::parse(&self.clearance)
            .ok_or_else(|| RegistryError::ClearanceMismatch(self.clearance.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessGrant {
    pub record_id: RecordId,
    pub recipient: Principal,
    pub clearance: Clearance,
    pub granted_at: LedgerHeight,
    pub sunset_at: LedgerHeight,
    pub mutation_permitted: bool,
}

impl AccessGrant {
    #[must_use]
    pub fn issue(
        record_id: RecordId,
        recipient: Principal,
        clearance: Clearance,
        span: u64,
        mutation_permitted: bool,
        height: LedgerHeight,
    ) -> Self {
        Self {
            record_id,
            recipient,
            clearance,
            granted_at: height,
            sunset_at: height.after(span),
            mutation_permitted,
        }
    }

    /// Grants are live up to, but not including, their sunset height.
    #[must_use]
    pub fn is_active_at(&self, height: LedgerHeight) -> bool {
        height >= self.granted_at && height < self.sunset_at
    }
}

/// Identity and ledger position a single call executes under.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallContext {
    pub actor: Principal,
    pub height: LedgerHeight,
}

impl CallContext {
    #[must_use]
    pub fn new(actor: impl Into<Principal>, height: LedgerHeight) -> Self {
        Self { actor: actor.into(), height }
    }
}

fn check_designation(value: &str) -> Result<(), RegistryError> {
    if validate::designation_valid(value) {
        return Ok(());
    }
    Err(RegistryError::ParameterError(format!(
        "designation MUST be 1..={} characters",
        validate::MAX_DESIGNATION_CHARS
    )))
}

fn check_seal(value: &str) -> Result<(), RegistryError> {
    if validate::seal_valid(value) {
        return Ok(());
    }
    Err(RegistryError::ParameterError(format!(
        "seal MUST be exactly {} characters",
        validate::SEAL_CHARS
    )))
}

fn check_descriptor(value: &str) -> Result<(), RegistryError> {
    if validate::descriptor_valid(value) {
        return Ok(());
    }
    Err(RegistryError::DescriptorProblem(format!(
        "descriptor MUST be 1..={} characters",
        validate::MAX_DESCRIPTOR_CHARS
    )))
}

fn check_taxonomy(tags: &[String]) -> Result<(), RegistryError> {
    if validate::taxonomy_valid(tags) {
        return Ok(());
    }
    Err(RegistryError::DescriptorProblem(format!(
        "taxonomy MUST hold 1..={} tags of 1..={} characters each",
        validate::MAX_TAXONOMY_TAGS,
        validate::MAX_TAXONOMY_TAG_CHARS
    )))
}
