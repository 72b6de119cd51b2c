// =============================================================================
// Scheme Catalog — read-mostly metadata for known schemes
// =============================================================================
//
// Populated lazily the first time a scheme is observed (via the quote
// client's response metadata) and refreshable in bulk through `list_funds`.
// Reads never touch the network; a catalog miss is not an error, it simply
// means metadata fields are omitted from a response.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::quote_client::SchemeMeta;
use crate::types::SchemeCode;

/// Catalog entry for a single scheme.
#[derive(Debug, Clone, Serialize)]
pub struct Scheme {
    pub scheme_code: SchemeCode,
    pub scheme_name: String,
    pub fund_house: String,
    pub category: String,
    #[serde(rename = "type")]
    pub scheme_type: String,
}

/// Read-mostly store of scheme metadata, keyed by `schemeCode`.
pub struct SchemeCatalog {
    schemes: RwLock<HashMap<SchemeCode, Scheme>>,
}

impl SchemeCatalog {
    pub fn new() -> Self {
        Self {
            schemes: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, scheme_code: SchemeCode) -> Option<Scheme> {
        self.schemes.read().get(&scheme_code).cloned()
    }

    pub fn contains(&self, scheme_code: SchemeCode) -> bool {
        self.schemes.read().contains_key(&scheme_code)
    }

    /// Record/refresh metadata observed from a quote provider response.
    pub fn observe(&self, scheme_code: SchemeCode, meta: &SchemeMeta) {
        self.schemes.write().insert(
            scheme_code,
            Scheme {
                scheme_code,
                scheme_name: meta.scheme_name.clone(),
                fund_house: meta.fund_house.clone(),
                category: meta.scheme_category.clone(),
                scheme_type: meta.scheme_type.clone(),
            },
        );
    }

    pub fn all(&self) -> Vec<Scheme> {
        self.schemes.read().values().cloned().collect()
    }
}

impl Default for SchemeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SchemeMeta {
        SchemeMeta {
            scheme_name: "Axis Bluechip Fund".into(),
            fund_house: "Axis Mutual Fund".into(),
            scheme_category: "Equity".into(),
            scheme_type: "Open Ended".into(),
        }
    }

    #[test]
    fn observe_then_get_round_trips() {
        let catalog = SchemeCatalog::new();
        assert!(!catalog.contains(152075));
        catalog.observe(152075, &meta());
        let scheme = catalog.get(152075).unwrap();
        assert_eq!(scheme.scheme_name, "Axis Bluechip Fund");
        assert_eq!(scheme.fund_house, "Axis Mutual Fund");
    }

    #[test]
    fn unknown_scheme_returns_none() {
        let catalog = SchemeCatalog::new();
        assert!(catalog.get(999999).is_none());
    }

    #[test]
    fn observe_overwrites_prior_entry() {
        let catalog = SchemeCatalog::new();
        catalog.observe(152075, &meta());
        let mut updated = meta();
        updated.scheme_category = "Debt".into();
        catalog.observe(152075, &updated);
        assert_eq!(catalog.get(152075).unwrap().category, "Debt");
    }
}
