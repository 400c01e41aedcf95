//! Configuration for Tollgate
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::{BudgetTable, FeatureBudget};
use crate::types::{IdentifierKind, Result};

/// Tollgate - entitlement metering engine
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(about = "Per-period usage budgets for rate-limited features")]
pub struct Args {
    /// Use the in-memory store instead of MongoDB (state is lost on exit)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "tollgate")]
    pub mongodb_db: String,

    /// Collection holding entitlement records
    #[arg(long, env = "ENTITLEMENT_COLLECTION", default_value = "entitlements")]
    pub entitlement_collection: String,

    /// Timeout for each store round trip in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "5000")]
    pub store_timeout_ms: u64,

    /// TOML file with per-feature budgets
    #[arg(long, env = "BUDGETS_FILE")]
    pub budgets_file: Option<PathBuf>,

    /// Units per period for feature types without a budget
    #[arg(long, env = "DEFAULT_MAX_USAGE", default_value = "10")]
    pub default_max_usage: u32,

    /// Period length in days for feature types without a budget
    #[arg(long, env = "DEFAULT_PERIOD_DAYS", default_value = "30")]
    pub default_period_days: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Administrative operations
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Report whether a consume would currently succeed
    Check(KeyArgs),
    /// Consume one unit of budget
    Consume(KeyArgs),
    /// Start a new period with zero usage and reactivate
    Reset(KeyArgs),
    /// Block consumption regardless of remaining budget
    Suspend(KeyArgs),
    /// Lift a suspension
    Activate(KeyArgs),
    /// Print the stored record without modifying it
    Show(KeyArgs),
    /// Aggregate usage by identifier kind and feature type
    Stats {
        /// Only include this feature type
        #[arg(long)]
        feature: Option<String>,
    },
    /// Delete never-used records idle for longer than the retention window
    Sweep {
        #[arg(long, default_value = "90")]
        retention_days: u32,
    },
}

/// Identity tuple of one entitlement
#[derive(ClapArgs, Debug, Clone)]
pub struct KeyArgs {
    /// Holder of the entitlement
    pub identifier: String,

    /// Feature type being metered
    pub feature: String,

    /// Namespace of the identifier (ip, jwt, email, custom)
    #[arg(long, default_value = "ip")]
    pub kind: IdentifierKind,
}

impl Args {
    /// Store round trip timeout
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Budget applied to unregistered feature types
    pub fn default_budget(&self) -> FeatureBudget {
        FeatureBudget::new(self.default_max_usage, self.default_period_days)
    }

    /// Build the budget table: file (if any), then `TOLLGATE_BUDGET__*`
    /// environment overrides
    pub fn budget_table(&self) -> Result<BudgetTable> {
        let mut table = match &self.budgets_file {
            Some(path) => BudgetTable::from_file(path, self.default_budget())?,
            None => BudgetTable::new(self.default_budget()),
        };
        table.apply_env_overrides(std::env::vars())?;
        Ok(table)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.store_timeout_ms == 0 {
            return Err("STORE_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.default_max_usage == 0 {
            return Err("DEFAULT_MAX_USAGE must be greater than zero".to_string());
        }

        if self.default_period_days == 0 {
            return Err("DEFAULT_PERIOD_DAYS must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["tollgate"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["check", "1.2.3.4", "submit-on-demand-run"]);
        assert_eq!(args.default_budget(), FeatureBudget::new(10, 30));
        assert_eq!(args.store_timeout(), Duration::from_millis(5000));
        assert!(args.validate().is_ok());

        match args.command {
            Command::Check(key) => {
                assert_eq!(key.identifier, "1.2.3.4");
                assert_eq!(key.kind, IdentifierKind::Ip);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_kind_flag() {
        let args = parse(&["consume", "user-7", "create-clip", "--kind", "jwt"]);
        match args.command {
            Command::Consume(key) => assert_eq!(key.kind, IdentifierKind::Jwt),
            other => panic!("unexpected command {:?}", other),
        }

        let bad = Args::try_parse_from(["tollgate", "consume", "u", "f", "--kind", "fax"]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let args = parse(&["--store-timeout-ms", "0", "stats"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_budget_table_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[features.create-clip]\nmax_usage = 3\nperiod_length_days = 7"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = parse(&["--budgets-file", &path, "stats"]);
        let table = args.budget_table().unwrap();

        assert_eq!(table.defaults, FeatureBudget::new(10, 30));
        let clip = crate::types::FeatureType::new("create-clip").unwrap();
        assert_eq!(table.features.get(&clip), Some(&FeatureBudget::new(3, 7)));
    }
}
