use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{ContractKey, SecType};
use crate::order::Action;

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The stable identity of a sheet intent row. Assigned on first ingest (a millisecond
/// timestamp) and written back to the sheet; once assigned it never changes for that intent.
pub struct Uid(pub String);

impl Uid {
    #[must_use]
    #[inline]
    /// View the uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    /// Mint a uid from an instant: the millisecond timestamp, matching what the production
    /// sheet has carried for years.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(now.timestamp_millis().to_string())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uid {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The trade lifecycle: `PreOpenCheck → Open → Closed`, with `Error` reachable from anywhere on
/// an unrecoverable fault.
pub enum TradeStatus {
    /// Ingested but not yet validated against live prices and resolved contracts.
    PreOpenCheck,
    /// Live: evaluated every cycle.
    Open,
    /// Fully closed out.
    Closed,
    /// Demoted on parse/resolution/position faults or excessive retries.
    Error,
}

/// Notes written to the sheet when a close fills favorably.
pub const TARGET_REACHED: &str = "Target reached";
/// Notes written to the sheet when a close fills unfavorably.
pub const STOP_LOSS: &str = "Stop loss";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A trade ingested from the sheet and owned by the store.
///
/// Quantities that depend on the trade's orders (`total_qty`, `bought_qty`, ...) live on the
/// store, which owns the orders; everything derivable from the row alone lives here.
pub struct Trade {
    /// Stable intent identity.
    pub uid: Uid,
    /// The underlying's ticker symbol as entered on the sheet.
    pub symbol: String,
    /// The alert category column (column 1).
    pub alert_category: String,
    /// Signed position size in units of $1000: positive long, negative short.
    pub size: f64,
    /// The raw tactic text.
    pub tactic: String,
    /// The parsed security type.
    pub sec_type: SecType,
    /// Key of the tradable shape.
    pub contract_key: ContractKey,
    /// Key of the underlying stock used for target/stop evaluation. Equals `contract_key` for
    /// stocks and cash.
    pub underlying_key: ContractKey,
    /// The underlying price at the moment the intent was entered.
    pub underlying_entry_price: Option<f64>,
    /// The entry price as originally written on the sheet (negative for shorts and credit
    /// combos). Cleared from the sheet on ingest; the post-fill price lands in `entry_price`.
    pub original_entry_price: Option<f64>,
    /// The live entry price registered from the opening fill. Always positive.
    pub entry_price: Option<f64>,
    /// The exit price registered from the final closing fill. Always positive.
    pub exit_price: Option<f64>,
    /// Up to three target prices on the underlying, in trigger order.
    pub target_prices: [Option<f64>; 3],
    /// Up to two stop prices on the underlying, in trigger order.
    pub stop_prices: [Option<f64>; 2],
    /// When the intent was entered (sheet column 12, normalized to UTC).
    pub date_entered: Option<DateTime<Utc>>,
    /// When the trade fully exited.
    pub date_exited: Option<DateTime<Utc>>,
    /// Percent of the position already sold, from the sheet.
    pub pct_sold: i64,
    /// Lifecycle state.
    pub status: TradeStatus,
    /// Parent trade when this row records a partial exit of another intent.
    pub parent: Option<Uid>,
    /// Last known sheet row index; a hint only, re-resolved by uid before writes.
    pub row_idx: Option<usize>,
    /// When the last order was requested on this trade; drives the evaluation cooldown.
    pub last_order_at: Option<DateTime<Utc>>,
    /// Consecutive placement failures; three demote the trade to `Error`.
    pub fail_count: u32,
    /// Contract-resolution requests issued so far; capped at three per leg.
    pub resolution_attempts: u32,
}

impl Trade {
    #[must_use]
    #[inline]
    /// Whether the trade is short. Shorts are entered on the sheet as negative entry prices and
    /// normalized to a negative size on ingest.
    pub fn is_short(&self) -> bool {
        self.size < 0.0
    }

    #[must_use]
    #[inline]
    /// Whether the trade is long. Combos are always long to the broker; a credit combo is
    /// recorded via a negative [`Trade::original_entry_price`].
    pub fn is_long(&self) -> bool {
        !self.is_short()
    }

    #[must_use]
    #[inline]
    /// Whether a combo trade was entered for a credit.
    pub fn is_credit(&self) -> bool {
        self.sec_type == SecType::Combo && self.original_entry_price.unwrap_or(0.0) < 0.0
    }

    #[must_use]
    /// Whether profit accrues as the underlying rises. Holds for every security type: the first
    /// target sitting above the underlying entry defines the direction.
    pub fn profits_up(&self) -> Option<bool> {
        match (self.target_prices[0], self.underlying_entry_price) {
            (Some(target), Some(entry)) => Some(target > entry),
            _ => None,
        }
    }

    #[must_use]
    #[inline]
    /// The action that opens the position: combos are always bought, shorts are sold, longs are
    /// bought.
    pub fn opening_action(&self) -> Action {
        if self.sec_type == SecType::Combo || self.is_long() {
            Action::Buy
        } else {
            Action::Sell
        }
    }

    #[must_use]
    #[inline]
    /// The action that closes the position.
    pub fn closing_action(&self) -> Action {
        self.opening_action().inverse()
    }

    #[must_use]
    #[inline]
    /// Count of configured target prices.
    pub fn number_of_targets(&self) -> usize {
        self.target_prices.iter().flatten().count()
    }

    #[must_use]
    #[inline]
    /// Count of configured stop prices.
    pub fn number_of_stops(&self) -> usize {
        self.stop_prices.iter().flatten().count()
    }

    #[must_use]
    /// The next target price, indexed by the number of closing orders already emitted. `None`
    /// once the targets are exhausted.
    pub fn next_target(&self, closing_orders_emitted: usize) -> Option<(usize, f64)> {
        self.target_prices
            .get(closing_orders_emitted)
            .copied()
            .flatten()
            .map(|p| (closing_orders_emitted, p))
    }

    #[must_use]
    /// The next stop price, indexed the same way as [`Trade::next_target`].
    pub fn next_stop(&self, closing_orders_emitted: usize) -> Option<(usize, f64)> {
        self.stop_prices
            .get(closing_orders_emitted)
            .copied()
            .flatten()
            .map(|p| (closing_orders_emitted, p))
    }

    #[must_use]
    #[inline]
    /// Whether the trade still participates in ingest, pricing, and evaluation.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TradeStatus::PreOpenCheck | TradeStatus::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SecType;

    fn trade() -> Trade {
        Trade {
            uid: Uid::from("1546000000000"),
            symbol: "SYM".to_owned(),
            alert_category: String::new(),
            size: 1.0,
            tactic: "JUN 20 $151C".to_owned(),
            sec_type: SecType::SecOption,
            contract_key: ContractKey::from("SYM-20190620-151.0-C"),
            underlying_key: ContractKey::from("SYM"),
            underlying_entry_price: Some(150.0),
            original_entry_price: None,
            entry_price: None,
            exit_price: None,
            target_prices: [Some(152.2), Some(153.5), Some(154.5)],
            stop_prices: [Some(149.98), Some(149.0)],
            date_entered: None,
            date_exited: None,
            pct_sold: 0,
            status: TradeStatus::PreOpenCheck,
            parent: None,
            row_idx: None,
            last_order_at: None,
            fail_count: 0,
            resolution_attempts: 0,
        }
    }

    #[test]
    fn direction_follows_first_target() {
        let mut t = trade();
        assert_eq!(t.profits_up(), Some(true));
        t.target_prices = [Some(148.0), None, None];
        assert_eq!(t.profits_up(), Some(false));
        t.underlying_entry_price = None;
        assert_eq!(t.profits_up(), None);
    }

    #[test]
    fn targets_index_by_emitted_closes() {
        let t = trade();
        assert_eq!(t.number_of_targets(), 3);
        assert_eq!(t.number_of_stops(), 2);
        assert_eq!(t.next_target(0), Some((0, 152.2)));
        assert_eq!(t.next_target(2), Some((2, 154.5)));
        assert_eq!(t.next_target(3), None);
        assert_eq!(t.next_stop(1), Some((1, 149.0)));
        assert_eq!(t.next_stop(2), None);
    }

    #[test]
    fn shorts_sell_to_open() {
        let mut t = trade();
        t.size = -2.0;
        assert!(t.is_short());
        assert_eq!(t.opening_action(), Action::Sell);
        assert_eq!(t.closing_action(), Action::Buy);

        t.sec_type = SecType::Combo;
        // A combo is always bought, even on a credit entry.
        assert_eq!(t.opening_action(), Action::Buy);
    }
}
