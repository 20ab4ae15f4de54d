use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::contract::ContractKey;
use crate::trade::Uid;

// ==============================================
// === Core Order Types (Market, Limit, etc.) ===
// ==============================================

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The two sides of an order.
pub enum Action {
    /// Buy the contract.
    Buy,
    /// Sell the contract.
    Sell,
}

impl Action {
    #[must_use]
    #[inline]
    /// The broker-side action code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    #[must_use]
    #[inline]
    /// The opposite action.
    pub const fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Default, Clone, thiserror::Error)]
#[error("Invalid value encountered when attempting to parse an order action. No such action: {0}. Valid actions are \"BUY\" or \"SELL\".")]
/// An error returned when parsing an [`Action`] fails.
pub struct ParseActionError(String);

impl FromStr for Action {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(ParseActionError(other.to_owned())),
        }
    }
}

#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
/// The time periods for which an order is active and can be executed against.
pub enum TimeInForce {
    #[default]
    /// Valid for the day only.
    Day,
    /// Good until canceled.
    Gtc,
    /// Immediate or cancel. Any portion not filled as soon as it becomes available in the market
    /// is canceled.
    Ioc,
}

impl TimeInForce {
    #[must_use]
    #[inline]
    /// The broker-side code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
/// How an order executes once it reaches the broker.
pub enum Method {
    /// Buy or sell at the best available price. Sensitive to price fluctuations.
    Market,
    /// Buy or sell at a price as good or better than the limit price. May not be filled.
    Limit {
        /// The limit price.
        price: f64,
    },
    /// A limit order whose limit price chases the bid/ask midpoint: the engine cancel-replaces
    /// it whenever the midpoint drifts beyond `offset` from the working price.
    PegMid {
        /// The current working limit price.
        price: f64,
        /// The NBBO offset that triggers a cancel-replace when exceeded.
        offset: f64,
    },
}

impl Method {
    #[must_use]
    #[inline]
    /// The broker-side order-type code. Pegged orders are submitted as plain limits; the chase
    /// behavior is the engine's.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit { .. } | Self::PegMid { .. } => "LMT",
        }
    }

    #[must_use]
    #[inline]
    /// The current limit price, when the order has one.
    pub const fn limit_price(&self) -> Option<f64> {
        match *self {
            Self::Market => None,
            Self::Limit { price } | Self::PegMid { price, .. } => Some(price),
        }
    }

    #[must_use]
    #[inline]
    /// Whether the order is pegged to the midpoint and must be chased.
    pub const fn is_pegged(&self) -> bool {
        matches!(self, Self::PegMid { .. })
    }
}

// ====================================
// === Order Entity + State Machine ===
// ====================================

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
/// Store-assigned identity of an [`Order`]. Stable across the order's whole lifecycle; the
/// broker-assigned request id only exists once the order is placed.
pub struct OrderId(pub i64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// An order progresses only along `Ready → Placed → {Complete | Error}`.
pub enum OrderStatus {
    /// Created by the evaluator, not yet sent to the broker.
    Ready,
    /// Sent to the broker; awaiting executions.
    Placed,
    /// Executions covering the full quantity were accepted.
    Complete,
    /// Rejected, timed out, or canceled.
    Error,
}

impl OrderStatus {
    #[must_use]
    #[inline]
    /// Whether the order still occupies its trade (keeps the trade locked).
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Ready | Self::Placed)
    }

    #[must_use]
    /// Whether the state machine permits moving from `self` to `next`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Ready, Self::Placed)
                | (Self::Ready, Self::Error)
                | (Self::Placed, Self::Complete)
                | (Self::Placed, Self::Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single order owned by the store. Cross-references ([`Uid`], [`ContractKey`]) are looked up
/// at use sites; the order owns no trade or contract data itself.
pub struct Order {
    /// Store-assigned identity.
    pub id: OrderId,
    /// The owning trade, absent for orphan-flattening orders.
    pub trade: Option<Uid>,
    /// The shape being bought or sold.
    pub contract_key: ContractKey,
    /// Buy or sell.
    pub action: Action,
    /// The total quantity to execute. Always positive.
    pub qty: f64,
    /// Market, limit, or pegged limit.
    pub method: Method,
    /// The time for which the order remains valid.
    pub time_in_force: TimeInForce,
    /// Broker-assigned id, present once placed.
    pub request_id: Option<i64>,
    /// Lifecycle state.
    pub status: OrderStatus,
    /// Excluded orders never count toward trade quantities (orphan flattens, drift corrections).
    pub exclude: bool,
    /// When the store created the order.
    pub date_added: DateTime<Utc>,
    /// When the order was sent to the broker.
    pub date_placed: Option<DateTime<Utc>>,
    /// When executions covered the full quantity.
    pub date_filled: Option<DateTime<Utc>>,
}

impl Order {
    #[must_use]
    /// A fresh `Ready` order. The store assigns the id.
    pub fn new(
        id: OrderId,
        trade: Option<Uid>,
        contract_key: ContractKey,
        action: Action,
        qty: f64,
        method: Method,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trade,
            contract_key,
            action,
            qty: qty.abs(),
            method,
            time_in_force: TimeInForce::default(),
            request_id: None,
            status: OrderStatus::Ready,
            exclude: false,
            date_added: now,
            date_placed: None,
            date_filled: None,
        }
    }

    #[must_use]
    #[inline]
    /// Whether the order still occupies its trade.
    pub const fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    /// Update the working limit price on a pegged order. No-op for other methods.
    pub fn reprice(&mut self, new_price: f64) {
        if let Method::PegMid { price, .. } = &mut self.method {
            *price = new_price;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_advances_forward() {
        use OrderStatus::*;
        assert!(Ready.can_advance_to(Placed));
        assert!(Placed.can_advance_to(Complete));
        assert!(Placed.can_advance_to(Error));
        assert!(Ready.can_advance_to(Error));

        assert!(!Ready.can_advance_to(Complete));
        assert!(!Complete.can_advance_to(Placed));
        assert!(!Error.can_advance_to(Ready));
        assert!(!Placed.can_advance_to(Ready));
    }

    #[test]
    fn pegged_orders_submit_as_limits() {
        let m = Method::PegMid {
            price: 10.0,
            offset: 0.02,
        };
        assert_eq!(m.code(), "LMT");
        assert_eq!(m.limit_price(), Some(10.0));
        assert!(m.is_pegged());
        assert_eq!(Method::Market.limit_price(), None);
    }
}
