//! Address settings keyed by wildcard pattern.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::config::AddressSettings;
use crate::postoffice::address;

/// Resolves the effective [`AddressSettings`] of an address by merging every
/// matching pattern, most specific first, over the defaults.
#[derive(Debug, Default)]
pub struct SettingsRepository {
    defaults: AddressSettings,
    entries: RwLock<BTreeMap<String, AddressSettings>>,
}

impl SettingsRepository {
    pub fn new(defaults: AddressSettings) -> Self {
        Self {
            defaults,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(entries: &BTreeMap<String, AddressSettings>) -> Self {
        Self {
            defaults: AddressSettings::default(),
            entries: RwLock::new(entries.clone()),
        }
    }

    pub fn add_match(&self, pattern: impl Into<String>, settings: AddressSettings) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.into(), settings);
    }

    pub fn remove_match(&self, pattern: &str) -> Option<AddressSettings> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pattern)
    }

    pub fn match_address(&self, address: &str) -> AddressSettings {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<(&String, &AddressSettings)> = entries
            .iter()
            .filter(|(pattern, _)| address::matches(pattern, address))
            .collect();
        matching.sort_by_key(|(pattern, _)| std::cmp::Reverse(address::specificity(pattern)));

        let mut resolved = AddressSettings::default();
        for (_, settings) in matching {
            resolved.merge(settings);
        }
        resolved.merge(&self.defaults);
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributionPolicy;

    #[test]
    fn specific_values_win_and_gaps_fall_back() {
        let repo = SettingsRepository::default();
        repo.add_match(
            "#",
            AddressSettings {
                max_delivery_attempts: Some(5),
                dead_letter_address: Some("dlq".into()),
                ..AddressSettings::default()
            },
        );
        repo.add_match(
            "orders.*",
            AddressSettings {
                max_delivery_attempts: Some(2),
                distribution: Some(DistributionPolicy::FirstAvailable),
                ..AddressSettings::default()
            },
        );
        repo.add_match(
            "orders.eu",
            AddressSettings {
                redelivery_delay_ms: Some(250),
                ..AddressSettings::default()
            },
        );

        let eu = repo.match_address("orders.eu");
        assert_eq!(eu.redelivery_delay_ms(), 250);
        assert_eq!(eu.max_delivery_attempts(), 2);
        assert_eq!(eu.distribution(), DistributionPolicy::FirstAvailable);
        assert_eq!(eu.dead_letter_address.as_deref(), Some("dlq"));

        let other = repo.match_address("payments");
        assert_eq!(other.max_delivery_attempts(), 5);
        assert_eq!(other.distribution(), DistributionPolicy::RoundRobin);
    }

    #[test]
    fn unmatched_addresses_use_defaults() {
        let repo = SettingsRepository::new(AddressSettings {
            page_max_messages: Some(100),
            ..AddressSettings::default()
        });
        assert_eq!(repo.match_address("x").page_max_messages, Some(100));
        assert_eq!(repo.match_address("x").max_delivery_attempts(), 10);
    }
}
