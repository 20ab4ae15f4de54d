use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ======================================
// === Types for Handling Config File ===
// ======================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Engine configuration, read from `config.toml`. Every knob has a production default so a
/// minimal file only needs the account id.
pub struct Config {
    /// The brokerage account the engine trades and reconciles against.
    pub account_id: String,
    /// Where operator notifications are addressed.
    pub notification_email: String,
    /// Dollars of capital per unit of sheet position size.
    pub capital_factor: f64,
    /// Seconds between supervisor cycles.
    pub eval_interval_secs: u64,
    /// Seconds after an order request during which a trade is not re-evaluated.
    pub cooldown_secs: i64,
    /// Hard timeout for a peg-to-mid chase.
    pub peg_timeout_secs: i64,
    /// Seconds between peg chase steps.
    pub peg_step_secs: u64,
    /// The NBBO offset for pegged stock orders; drift beyond this triggers a cancel-replace.
    pub nbbo_offset: f64,
    /// Placed orders older than this during market hours become errors.
    pub pending_order_timeout_secs: i64,
    /// How long the supervisor keeps cycling after the close to complete fills.
    pub after_close_grace_secs: i64,
    /// Consecutive failed cycles tolerated before the loop terminates.
    pub max_cycle_failures: u32,
    /// Emit limit orders (mid-pegged for stocks) instead of market orders.
    pub use_limit_orders: bool,
    /// Optional percentage offset applied to option/combo limit prices: buys become more
    /// aggressive, sells more concessive.
    pub limit_offset_pct: f64,
    /// Allow order placement outside regular trading hours.
    pub trade_after_hours: bool,
    /// Flatten every broker-side position on the first portfolio download.
    pub close_open_positions_on_start: bool,
    /// Where the store snapshot is written. `None` keeps the store in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            notification_email: String::new(),
            capital_factor: 1000.0,
            eval_interval_secs: 30,
            cooldown_secs: 60,
            peg_timeout_secs: 90,
            peg_step_secs: 5,
            nbbo_offset: 0.02,
            pending_order_timeout_secs: 15 * 60,
            after_close_grace_secs: 30 * 60,
            max_cycle_failures: 7,
            use_limit_orders: false,
            limit_offset_pct: 0.0,
            trade_after_hours: false,
            close_open_positions_on_start: false,
            store_path: None,
        }
    }
}

impl Config {
    /// Read and parse the config file at `path`.
    ///
    /// # Errors
    /// Returns any error encountered while reading or parsing the file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        toml::from_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("Invalid config file at path {path}"))?
                .as_str(),
        )
        .with_context(|| format!("Invalid TOML file at path {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.capital_factor, 1000.0);
        assert_eq!(cfg.eval_interval_secs, 30);
        assert_eq!(cfg.cooldown_secs, 60);
        assert_eq!(cfg.peg_timeout_secs, 90);
        assert_eq!(cfg.nbbo_offset, 0.02);
        assert_eq!(cfg.pending_order_timeout_secs, 900);
        assert_eq!(cfg.max_cycle_failures, 7);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            account_id = "DU12345"
            use_limit_orders = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.account_id, "DU12345");
        assert!(cfg.use_limit_orders);
        assert_eq!(cfg.capital_factor, 1000.0);
    }
}
