//! Field predicates shared by every registry entry point.
//!
//! All predicates are total: they never panic and never touch state. Lengths
//! count Unicode scalar values, not bytes.

use crate::{Clearance, LedgerHeight, Principal, MAX_GRANT_SPAN, MAX_LEDGER_HEIGHT};

pub const MAX_DESIGNATION_CHARS: usize = 50;
pub const SEAL_CHARS: usize = 64;
pub const MAX_DESCRIPTOR_CHARS: usize = 200;
pub const MAX_CLASSIFICATION_CHARS: usize = 20;
pub const MAX_TAXONOMY_TAGS: usize = 5;
pub const MAX_TAXONOMY_TAG_CHARS: usize = 30;

fn char_len_within(value: &str, max: usize) -> bool {
    let len = value.chars().count();
    (1..=max).contains(&len)
}

#[must_use]
pub fn designation_valid(value: &str) -> bool {
    char_len_within(value, MAX_DESIGNATION_CHARS)
}

#[must_use]
pub fn seal_valid(value: &str) -> bool {
    !value.is_empty() && value.chars().count() == SEAL_CHARS
}

#[must_use]
pub fn descriptor_valid(value: &str) -> bool {
    char_len_within(value, MAX_DESCRIPTOR_CHARS)
}

#[must_use]
pub fn classification_valid(value: &str) -> bool {
    char_len_within(value, MAX_CLASSIFICATION_CHARS)
}

#[must_use]
pub fn taxonomy_entry_valid(value: &str) -> bool {
    char_len_within(value, MAX_TAXONOMY_TAG_CHARS)
}

#[must_use]
pub fn taxonomy_valid<S: AsRef<str>>(tags: &[S]) -> bool {
    (1..=MAX_TAXONOMY_TAGS).contains(&tags.len())
        && tags.iter().all(|tag| taxonomy_entry_valid(tag.as_ref()))
}

#[must_use]
pub fn clearance_valid(value: &str) -> bool {
    Clearance::parse(value).is_some()
}

#[must_use]
pub fn span_valid(span: u64) -> bool {
    span > 0 && span <= MAX_GRANT_SPAN
}

#[must_use]
pub fn height_valid(height: LedgerHeight) -> bool {
    height.0 <= MAX_LEDGER_HEIGHT
}

/// The sunset `height + span` must itself be a recordable height.
#[must_use]
pub fn sunset_valid(height: LedgerHeight, span: u64) -> bool {
    height.0.checked_add(span).is_some_and(|sunset| sunset <= MAX_LEDGER_HEIGHT)
}

#[must_use]
pub fn recipient_valid(recipient: &Principal, actor: &Principal) -> bool {
    recipient != actor
}
