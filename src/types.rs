// =============================================================================
// Shared domain types — roles, transaction kinds, scheme identifiers
// =============================================================================

use serde::{Deserialize, Serialize};

/// Identity role carried inside a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A mutual fund scheme identifier in the provider's namespace. Valid values
/// are `[100000, 999999]`; validated at the API boundary, not here.
pub type SchemeCode = i64;

/// Opaque user identifier decoded from a bearer token.
pub type UserId = String;

/// Kind of a ledger entry in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}
