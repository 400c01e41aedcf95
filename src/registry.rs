//! Per-feature budget registry
//!
//! Maps a feature type to its `(max_usage, period_length_days)` budget.
//! The registry is an injected instance: deployments load it from a TOML
//! file plus environment overrides, tests build it directly, and either can
//! swap the table at runtime without restarting the process.
//!
//! Unknown feature types fall back to the table defaults
//! (10 units per 30 days unless configured otherwise).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

use crate::types::{EntitlementError, FeatureType, Result};

/// Default units per period for unregistered feature types
pub const DEFAULT_MAX_USAGE: u32 = 10;

/// Default period length for unregistered feature types
pub const DEFAULT_PERIOD_LENGTH_DAYS: u32 = 30;

/// Prefix of per-feature environment overrides, e.g.
/// `TOLLGATE_BUDGET__SUBMIT_ON_DEMAND_RUN=8/30`
pub const ENV_OVERRIDE_PREFIX: &str = "TOLLGATE_BUDGET__";

/// Budget parameters for one feature type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBudget {
    pub max_usage: u32,
    pub period_length_days: u32,
}

impl FeatureBudget {
    pub const fn new(max_usage: u32, period_length_days: u32) -> Self {
        Self {
            max_usage,
            period_length_days,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_usage == 0 {
            return Err(EntitlementError::Config(format!(
                "Budget for '{}' must allow at least one use per period",
                name
            )));
        }
        if self.period_length_days == 0 {
            return Err(EntitlementError::Config(format!(
                "Budget for '{}' must have a period of at least one day",
                name
            )));
        }
        Ok(())
    }
}

impl Default for FeatureBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_USAGE, DEFAULT_PERIOD_LENGTH_DAYS)
    }
}

/// Full budget table: defaults plus per-feature entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetTable {
    pub defaults: FeatureBudget,
    pub features: HashMap<FeatureType, FeatureBudget>,
}

/// On-disk layout of a budget file
#[derive(Debug, Deserialize)]
struct BudgetFile {
    defaults: Option<FeatureBudget>,
    #[serde(default)]
    features: HashMap<String, FeatureBudget>,
}

impl BudgetTable {
    pub fn new(defaults: FeatureBudget) -> Self {
        Self {
            defaults,
            features: HashMap::new(),
        }
    }

    /// Add or replace one feature's budget
    pub fn with_budget(mut self, feature_type: &str, budget: FeatureBudget) -> Result<Self> {
        budget.validate(feature_type)?;
        self.features.insert(FeatureType::new(feature_type)?, budget);
        Ok(self)
    }

    /// Parse a TOML budget table. `fallback` is used when the file has no
    /// `[defaults]` section.
    pub fn from_toml_str(contents: &str, fallback: FeatureBudget) -> Result<Self> {
        let file: BudgetFile = toml::from_str(contents)?;

        let defaults = file.defaults.unwrap_or(fallback);
        defaults.validate("defaults")?;

        let mut table = Self::new(defaults);
        for (name, budget) in file.features {
            table = table.with_budget(&name, budget)?;
        }
        Ok(table)
    }

    pub fn from_file(path: &Path, fallback: FeatureBudget) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EntitlementError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let table = Self::from_toml_str(&contents, fallback)?;
        info!(
            "Loaded {} feature budget(s) from {}",
            table.features.len(),
            path.display()
        );
        Ok(table)
    }

    /// Apply `TOLLGATE_BUDGET__<FEATURE>=<max_usage>/<period_days>` overrides.
    ///
    /// The feature name is lower-cased with `_` mapped to `-`.
    /// Returns the number of overrides applied.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (name, value) in vars {
            let Some(feature) = name.strip_prefix(ENV_OVERRIDE_PREFIX) else {
                continue;
            };
            let feature = feature.to_ascii_lowercase().replace('_', "-");
            let budget = parse_budget(&value).ok_or_else(|| {
                EntitlementError::Config(format!(
                    "{} must be '<max_usage>/<period_days>', got '{}'",
                    name, value
                ))
            })?;
            budget.validate(&feature)?;
            debug!("Budget override for {}: {:?}", feature, budget);
            self.features.insert(FeatureType::new(&feature)?, budget);
            applied += 1;
        }
        Ok(applied)
    }
}

fn parse_budget(value: &str) -> Option<FeatureBudget> {
    let (max_usage, days) = value.split_once('/')?;
    Some(FeatureBudget::new(
        max_usage.trim().parse().ok()?,
        days.trim().parse().ok()?,
    ))
}

/// Thread-safe, swappable budget registry
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    table: RwLock<BudgetTable>,
}

impl ConfigRegistry {
    pub fn new(table: BudgetTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    /// Budget for `feature_type`, or the defaults if it is not registered
    pub fn get_config(&self, feature_type: &FeatureType) -> FeatureBudget {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        match table.features.get(feature_type) {
            Some(budget) => *budget,
            None => {
                debug!(
                    "No budget registered for '{}', using defaults {:?}",
                    feature_type, table.defaults
                );
                table.defaults
            }
        }
    }

    /// Whether `feature_type` has its own entry
    pub fn is_registered(&self, feature_type: &FeatureType) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .features
            .contains_key(feature_type)
    }

    pub fn set_budget(&self, feature_type: FeatureType, budget: FeatureBudget) -> Result<()> {
        budget.validate(feature_type.as_str())?;
        info!("Budget for {} set to {:?}", feature_type, budget);
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .features
            .insert(feature_type, budget);
        Ok(())
    }

    /// Swap in a whole new table
    pub fn replace(&self, table: BudgetTable) {
        info!("Budget table replaced ({} feature(s))", table.features.len());
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(name: &str) -> FeatureType {
        FeatureType::new(name).unwrap()
    }

    #[test]
    fn test_unknown_feature_falls_back_to_defaults() {
        let registry = ConfigRegistry::default();
        let budget = registry.get_config(&feature("never-registered"));
        assert_eq!(budget, FeatureBudget::new(10, 30));
        assert!(!registry.is_registered(&feature("never-registered")));
    }

    #[test]
    fn test_registered_budget_wins() {
        let table = BudgetTable::default()
            .with_budget("submit-on-demand-run", FeatureBudget::new(2, 30))
            .unwrap();
        let registry = ConfigRegistry::new(table);

        assert_eq!(
            registry.get_config(&feature("submit-on-demand-run")),
            FeatureBudget::new(2, 30)
        );
        assert_eq!(
            registry.get_config(&feature("create-clip")),
            FeatureBudget::default()
        );
    }

    #[test]
    fn test_runtime_swap() {
        let registry = ConfigRegistry::default();
        registry
            .set_budget(feature("create-clip"), FeatureBudget::new(3, 7))
            .unwrap();
        assert_eq!(
            registry.get_config(&feature("create-clip")),
            FeatureBudget::new(3, 7)
        );

        registry.replace(BudgetTable::new(FeatureBudget::new(1, 1)));
        assert_eq!(
            registry.get_config(&feature("create-clip")),
            FeatureBudget::new(1, 1)
        );

        assert!(registry
            .set_budget(feature("create-clip"), FeatureBudget::new(0, 7))
            .is_err());
    }

    #[test]
    fn test_toml_table() {
        let toml = r#"
[defaults]
max_usage = 5
period_length_days = 7

[features.submit-on-demand-run]
max_usage = 8
period_length_days = 30
"#;
        let table = BudgetTable::from_toml_str(toml, FeatureBudget::default()).unwrap();
        assert_eq!(table.defaults, FeatureBudget::new(5, 7));
        assert_eq!(
            table.features.get(&feature("submit-on-demand-run")),
            Some(&FeatureBudget::new(8, 30))
        );
    }

    #[test]
    fn test_toml_without_defaults_uses_fallback() {
        let table = BudgetTable::from_toml_str("", FeatureBudget::new(4, 2)).unwrap();
        assert_eq!(table.defaults, FeatureBudget::new(4, 2));
        assert!(table.features.is_empty());
    }

    #[test]
    fn test_toml_rejects_zero_budget() {
        let toml = r#"
[features.create-clip]
max_usage = 0
period_length_days = 30
"#;
        assert!(BudgetTable::from_toml_str(toml, FeatureBudget::default()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut table = BudgetTable::default();
        let applied = table
            .apply_env_overrides(vec![
                (
                    "TOLLGATE_BUDGET__SUBMIT_ON_DEMAND_RUN".to_string(),
                    "8/30".to_string(),
                ),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(
            table.features.get(&feature("submit-on-demand-run")),
            Some(&FeatureBudget::new(8, 30))
        );

        let bad = table.apply_env_overrides(vec![(
            "TOLLGATE_BUDGET__CREATE_CLIP".to_string(),
            "lots".to_string(),
        )]);
        assert!(bad.is_err());
    }
}
