use chrono::NaiveDate;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::order::Action;

// =========================================================
// === Utility Types and Functions for Contract Identity ===
// =========================================================

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The canonical identity of a tradable shape. Two contracts with the same key denote the same
/// shape and share one registry record.
///
/// The rendering is bit-exact and forms both the storage key and the handle passed between
/// components:
/// * stock: `SYMBOL`
/// * option: `SYMBOL-YYYYMMDD-STRIKE-C|P` (strike always carries a decimal, e.g. `150.0`)
/// * combo: `SYMBOL/BAG/<action>/<ratio>(-<action>/<ratio>)*` in leg sequence order
/// * cash: `SYMBOL` (the `USD` suffix already stripped)
pub struct ContractKey(pub(crate) String);

impl ContractKey {
    #[must_use]
    #[inline]
    /// View the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContractKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContractKey {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
/// A unique identifier used by the broker's trading systems to define a specific contract.
/// Obtained from a contract-details request and required before a combo order can be placed.
pub struct BrokerContractId(pub i64);

impl FromStr for BrokerContractId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// An option's class: a call or a put.
pub enum Right {
    /// A vanilla call option.
    Call,
    /// A vanilla put option.
    Put,
}

impl Right {
    #[must_use]
    #[inline]
    /// The single-character code used in contract keys and broker requests.
    pub const fn code(self) -> char {
        match self {
            Self::Call => 'C',
            Self::Put => 'P',
        }
    }
}

#[derive(Debug, Default, Clone, thiserror::Error)]
#[error("Invalid value encountered when attempting to parse an option right. No such right: {0}. Valid rights are \"C\" or \"P\".")]
/// An error returned when parsing a [`Right`] fails.
pub struct ParseRightError(String);

impl FromStr for Right {
    type Err = ParseRightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "C" | "c" => Ok(Self::Call),
            "P" | "p" => Ok(Self::Put),
            other => Err(ParseRightError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The trading venues the engine routes to.
pub enum Exchange {
    /// IBKR's smart order router.
    Smart,
    /// The NASDAQ listing venue (primary exchange for smart-routed stocks).
    Island,
    /// The IDEALPRO forex venue.
    IdealPro,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Smart => "SMART",
            Self::Island => "ISLAND",
            Self::IdealPro => "IDEALPRO",
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The security types understood by the engine, as reported to and by the broker.
pub enum SecType {
    /// An equity.
    Stock,
    /// A vanilla option.
    SecOption,
    /// A multi-leg combination (an option spread traded as one shape).
    Combo,
    /// A forex pair.
    Cash,
}

impl SecType {
    #[must_use]
    #[inline]
    /// The broker-side type code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::SecOption => "OPT",
            Self::Combo => "BAG",
            Self::Cash => "CASH",
        }
    }

    #[must_use]
    #[inline]
    /// The ratio of actual price paid to quoted price: 100 for options and combos, 1 otherwise.
    pub const fn multiplier(self) -> u32 {
        match self {
            Self::SecOption | Self::Combo => 100,
            Self::Stock | Self::Cash => 1,
        }
    }
}

// =======================================
// === Definitions of Contract Structs ===
// =======================================

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// An equity contract, like AAPL.
pub struct Stock {
    /// The ticker symbol.
    pub symbol: String,
    /// The routing exchange.
    pub exchange: Exchange,
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// A vanilla option contract, like AAPL 20190115 150.0 C.
pub struct SecOption {
    /// The underlying's ticker symbol.
    pub symbol: String,
    /// The strike price.
    pub strike: f64,
    /// Call or put.
    pub right: Right,
    /// The expiration / last-trade date.
    pub expiry: NaiveDate,
    /// The routing exchange.
    pub exchange: Exchange,
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// One component of a [`Combo`]: its own option contract plus an action and a ratio.
pub struct ComboLeg {
    /// Position of the leg within the combo, starting at 1. Key rendering and broker requests
    /// follow this order.
    pub sequence: u32,
    /// Whether the leg is bought or sold when the combo is bought.
    pub action: Action,
    /// The smallest-terms quantity ratio of this leg.
    pub ratio: u32,
    /// The leg's own option contract.
    pub option: SecOption,
}

impl ComboLeg {
    #[must_use]
    #[inline]
    /// The contract key of the leg's own option.
    pub fn option_key(&self) -> ContractKey {
        Contract::SecOption(self.option.clone()).key()
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// A multi-leg combination contract. The broker treats the whole shape as a single tradable
/// instrument that is always bought; credit/debit direction lives on the owning trade.
pub struct Combo {
    /// The (shared) underlying symbol.
    pub symbol: String,
    /// The legs in sequence order.
    pub legs: Vec<ComboLeg>,
    /// The routing exchange.
    pub exchange: Exchange,
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// A forex pair contract quoted against USD, like EURUSD.
pub struct Cash {
    /// The base currency (the `USD` suffix stripped from the sheet symbol).
    pub pair: String,
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
/// Wrapper enum for all contract shapes the engine trades.
pub enum Contract {
    /// A [`Stock`] contract.
    Stock(Stock),
    /// A [`SecOption`] contract.
    SecOption(SecOption),
    /// A [`Combo`] contract.
    Combo(Combo),
    /// A [`Cash`] contract.
    Cash(Cash),
}

impl Contract {
    #[must_use]
    /// Construct a smart-routed stock contract for `symbol`.
    pub fn stock(symbol: &str) -> Self {
        Self::Stock(Stock {
            symbol: symbol.to_owned(),
            exchange: Exchange::Smart,
        })
    }

    #[must_use]
    #[inline]
    /// The contract's security type.
    pub const fn sec_type(&self) -> SecType {
        match self {
            Self::Stock(_) => SecType::Stock,
            Self::SecOption(_) => SecType::SecOption,
            Self::Combo(_) => SecType::Combo,
            Self::Cash(_) => SecType::Cash,
        }
    }

    #[must_use]
    #[inline]
    /// The contract's ticker symbol.
    pub fn symbol(&self) -> &str {
        match self {
            Self::Stock(c) => &c.symbol,
            Self::SecOption(c) => &c.symbol,
            Self::Combo(c) => &c.symbol,
            Self::Cash(c) => &c.pair,
        }
    }

    #[must_use]
    #[inline]
    /// The exchange to which orders on this contract are routed.
    pub const fn exchange(&self) -> Exchange {
        match self {
            Self::Stock(c) => c.exchange,
            Self::SecOption(c) => c.exchange,
            Self::Combo(c) => c.exchange,
            Self::Cash(_) => Exchange::IdealPro,
        }
    }

    #[must_use]
    #[inline]
    /// The contract's price multiplier.
    pub const fn multiplier(&self) -> u32 {
        self.sec_type().multiplier()
    }

    #[must_use]
    #[inline]
    /// The combo legs, when the contract is a [`Combo`].
    pub fn legs(&self) -> Option<&[ComboLeg]> {
        match self {
            Self::Combo(c) => Some(&c.legs),
            _ => None,
        }
    }

    #[must_use]
    #[inline]
    /// The earliest expiration date across the contract, if it has one.
    pub fn earliest_expiry(&self) -> Option<NaiveDate> {
        match self {
            Self::SecOption(c) => Some(c.expiry),
            Self::Combo(c) => c.legs.iter().map(|l| l.option.expiry).min(),
            Self::Stock(_) | Self::Cash(_) => None,
        }
    }

    #[must_use]
    /// Render the canonical [`ContractKey`] for this shape. A pure function: equal keys if and
    /// only if equal shapes.
    pub fn key(&self) -> ContractKey {
        match self {
            Self::Stock(c) => ContractKey(c.symbol.clone()),
            Self::Cash(c) => ContractKey(c.pair.clone()),
            Self::SecOption(c) => ContractKey(format!(
                "{}-{}-{}-{}",
                c.symbol,
                c.expiry.format("%Y%m%d"),
                format_strike(c.strike),
                c.right.code(),
            )),
            Self::Combo(c) => {
                let mut key = format!("{}/BAG/", c.symbol);
                for (i, leg) in c.legs.iter().enumerate() {
                    if i > 0 {
                        key.push('-');
                    }
                    let _ = write!(key, "{}/{}", leg.action.code(), leg.ratio);
                }
                ContractKey(key)
            }
        }
    }
}

/// Render a strike price the way contract keys expect: always at least one decimal place
/// (`150.0`, `150.5`, `150.25`), never a bare integer.
#[must_use]
pub fn format_strike(strike: f64) -> String {
    if strike.fract() == 0.0 {
        format!("{strike:.1}")
    } else {
        format!("{strike}")
    }
}
