//! An automated options/equities trade execution engine. It reads trade intents from a
//! spreadsheet, resolves and prices the contracts behind them against the IBKR TWS API
//! surface, decides when to open, trim, stop, or close each position, places and supervises
//! the orders, and reconciles every execution back into durable state and sheet rows.
//!
//! The wire protocol itself lives behind [`broker::BrokerGateway`]; everything in this crate
//! is the trade lifecycle around it.

#![warn(missing_docs)]
#![allow(
    clippy::implicit_return,
    clippy::missing_docs_in_private_items,
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::question_mark_used,
    clippy::separated_literal_suffix,
    clippy::single_char_lifetime_names
)]

/// Contains the brokerage boundary: the [`broker::BrokerGateway`] request trait and the
/// [`broker::BrokerEvent`] callbacks the engine consumes.
pub mod broker;
/// Contains the [`calendar::Clock`] and [`calendar::MarketCalendar`] traits plus the system
/// and manual implementations, so time is injected rather than read ambiently.
pub mod calendar;
/// Contains the engine configuration, read from `config.toml`.
pub mod config;
/// Contains the definitions of all contract shapes the engine trades, and the canonical
/// [`contract::ContractKey`] identity that every other component keys on.
pub mod contract;
mod error;
/// Contains the pre-open gate and the per-cycle evaluation that decides what each trade does
/// next.
pub mod evaluator;
/// Contains execution reports, correction handling, and the valid-set selection rule.
pub mod execution;
/// Contains the live quote book, midpoint computation, and subscription reconciliation.
pub mod market_data;
/// Contains operator-facing messages, their stable numeric codes, and the [`message::Notifier`]
/// boundary.
pub mod message;
/// Contains order entities, execution styles, and the order state machine.
pub mod order;
/// Contains order placement, the cannot-sell guard, order timeouts, and the peg-to-mid chase.
pub mod order_manager;
/// Contains the reconciler: fills into trade state and sheet rows, orphan flattening, and
/// drift correction.
pub mod reconcile;
/// Contains the sheet surface: the row codec, the [`sheet::SheetGateway`] trait, and an
/// in-memory sheet.
pub mod sheet;
/// Contains a scriptable simulated gateway for tests, paper sessions, and dry runs.
pub mod sim;
/// Contains the store: every table, the derived trade quantities, and the snapshot.
pub mod store;
/// Contains the supervisor loop, the callback consumer, and sheet ingest.
pub mod supervisor;
/// Contains the tactic parser, which turns the sheet's freeform tactic text into typed
/// contract shapes.
pub mod tactic;
/// Contains the trade entity and its row-derived quantities.
pub mod trade;

pub use error::{Error, Result};
