use crate::error::Result;
use crate::storage::{self, Store};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Read access to the administered species blacklist.
pub struct BlacklistChecker {
    store: Arc<Store>,
}

impl BlacklistChecker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// First blacklisted name among the distinct `names`, in sorted order.
    pub fn first_blacklisted<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        let distinct: BTreeSet<&str> = names.into_iter().collect();
        self.store.with_connection(|conn| {
            for name in distinct {
                if storage::is_blacklisted(conn, name)? {
                    return Ok(Some(name.to_string()));
                }
            }
            Ok(None)
        })
    }

    pub fn is_blacklisted(&self, species_name: &str) -> Result<bool> {
        self.store
            .with_connection(|conn| storage::is_blacklisted(conn, species_name))
    }

    /// Administrative write used by the CLI.
    pub fn set_blacklisted(&self, species_name: &str, blacklisted: bool) -> Result<()> {
        self.store
            .with_connection(|conn| storage::set_blacklisted(conn, species_name, blacklisted))?;
        info!(species = species_name, blacklisted, "Updated species blacklist");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_blacklisted_over_distinct_names() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let checker = BlacklistChecker::new(store);
        checker.set_blacklisted("Wolf", true).unwrap();

        assert_eq!(
            checker
                .first_blacklisted(["Grazer", "Grazer", "Wolf", "Grazer"])
                .unwrap(),
            Some("Wolf".to_string())
        );
        assert_eq!(checker.first_blacklisted(["Grazer", "Plant"]).unwrap(), None);
        assert_eq!(checker.first_blacklisted(std::iter::empty()).unwrap(), None);
    }

    #[test]
    fn test_unblacklisted_entry_is_ignored() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let checker = BlacklistChecker::new(store);
        checker.set_blacklisted("Wolf", true).unwrap();
        checker.set_blacklisted("Wolf", false).unwrap();
        assert!(!checker.is_blacklisted("Wolf").unwrap());
    }
}
