//! Palaver Policy Engine
//!
//! Sender allowlist and denylist

use palaver_config::PolicyConfig;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
}

impl PolicyEngine {
    pub fn new(config: Option<&PolicyConfig>) -> Self {
        let allowlist = config
            .and_then(|c| c.allowlist.clone())
            .map(|list| list.into_iter().map(|id| id.trim().to_string()).collect())
            .unwrap_or_default();

        let denylist = config
            .and_then(|c| c.denylist.clone())
            .map(|list| list.into_iter().map(|id| id.trim().to_string()).collect())
            .unwrap_or_default();

        Self {
            allowlist,
            denylist,
        }
    }

    /// Permissive engine used when no `[policy]` section is configured.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, sender_id: &str) -> bool {
        let sender_id = sender_id.trim();
        if self.denylist.contains(sender_id) {
            return false;
        }

        if self.allowlist.is_empty() {
            return true;
        }

        self.allowlist.contains(sender_id)
    }
}
