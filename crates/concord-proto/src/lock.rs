//! Cluster-wide lock identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names one exclusive resource, e.g. `("ChatChannel", "lobby-3")`.
///
/// Singleton resources have no qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lock {
    pub domain: String,
    pub qualifier: Option<String>,
}

impl Lock {
    pub fn new(domain: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    pub fn singleton(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            qualifier: None,
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}:{}", self.domain, q),
            None => f.write_str(&self.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_display() {
        assert_eq!(Lock::new("ChatChannel", "lobby-3").to_string(), "ChatChannel:lobby-3");
        assert_eq!(Lock::singleton("Tourney").to_string(), "Tourney");
    }

    #[test]
    fn test_lock_identity() {
        assert_eq!(Lock::new("Game", "7"), Lock::new("Game", "7"));
        assert_ne!(Lock::new("Game", "7"), Lock::new("Game", "8"));
        assert_ne!(Lock::singleton("Game"), Lock::new("Game", ""));
    }
}
