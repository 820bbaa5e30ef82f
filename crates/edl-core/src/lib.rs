//! Core domain model for EDL: source records, directory candidates and matched pairs.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "edl-core";

/// Legacy null sentinel emitted by older revisions of the cleaning stage.
pub const NULL_SENTINEL: &str = "NULL";

/// Collapse empty, whitespace-only and sentinel values to `None`.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed == NULL_SENTINEL {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Keep only ASCII digits; a number without digits is absent.
pub fn normalize_phone(value: Option<&str>) -> Option<String> {
    let digits = non_empty(value)?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// One government-registered establishment, as handed over by the cleaning stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
}

impl SourceRecord {
    /// Build a record from raw collaborator values, applying the canonical null rules.
    pub fn new(
        id: impl Into<String>,
        name: Option<&str>,
        address: Option<&str>,
        postal_code: Option<&str>,
        phone: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            name: non_empty(name),
            address: non_empty(address),
            postal_code: non_empty(postal_code),
            phone: normalize_phone(phone),
        }
    }

    /// `"address, postal_code"` location string used by text searches.
    pub fn location_query(&self) -> String {
        let address = self.address.as_deref().unwrap_or_default();
        let postal_code = self.postal_code.as_deref().unwrap_or_default();
        format!("{address}, {postal_code}")
    }
}

/// One directory listing returned by a remote lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateExtract {
    pub directory_id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub review_count: Option<u32>,
    pub rating: Option<f64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub neighborhoods: Vec<String>,
}

/// Candidates returned for a single source record by one lookup, in response order.
pub type CandidatePool = Vec<CandidateExtract>;

/// Output unit of matching: at most one candidate per source record per pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub source: SourceRecord,
    pub candidate: CandidateExtract,
}

impl MatchedPair {
    pub fn new(source: SourceRecord, candidate: CandidateExtract) -> Self {
        Self { source, candidate }
    }
}

/// Which sweep of the pipeline produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Phone,
    Address,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Phone => "phone",
            Pass::Address => "address",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sentinels_collapse_to_none() {
        assert_eq!(non_empty(Some("NULL")), None);
        assert_eq!(non_empty(Some("   ")), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some(" Joe's Pizza ")).as_deref(), Some("Joe's Pizza"));
    }

    #[test]
    fn phone_keeps_digits_only() {
        assert_eq!(normalize_phone(Some("+1 212-555-0100")).as_deref(), Some("12125550100"));
        assert_eq!(normalize_phone(Some("NULL")), None);
        assert_eq!(normalize_phone(Some("--")), None);
    }

    #[test]
    fn location_query_joins_address_and_postal_code() {
        let record = SourceRecord::new("1", Some("Joe's"), Some("123 Main St"), Some("10001"), None);
        assert_eq!(record.location_query(), "123 Main St, 10001");
    }
}
