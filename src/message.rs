use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trade::Uid;

// ==================================
// === Operator Notification Codes ===
// ==================================

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The stable numeric codes attached to operator-visible conditions. Codes in the notify set
/// elevate to an operator email through the [`Notifier`].
pub enum MessageCode {
    /// A pegged or placed order was not filled within its window.
    PegTimeout,
    /// No valid bid/ask arrived for a subscribed contract.
    Pricing,
    /// The sheet's entry price is too far from the live market, or a contract could not be
    /// resolved.
    EntryOutOfBand,
    /// The computed position size disagrees with the sheet, or the broker-side position
    /// disagrees with the store.
    SizeMismatch,
    /// The tactic column could not be parsed.
    TacticParse,
}

impl MessageCode {
    #[must_use]
    #[inline]
    /// The wire/storage number for the code.
    pub const fn number(self) -> u32 {
        match self {
            Self::PegTimeout => 99_991,
            Self::Pricing => 99_992,
            Self::EntryOutOfBand => 99_993,
            Self::SizeMismatch => 99_994,
            Self::TacticParse => 99_995,
        }
    }

    #[must_use]
    #[inline]
    /// Whether the code elevates to an operator email.
    pub const fn notifies(self) -> bool {
        // The whole 9999x range is operator-facing today; the split exists so new
        // bookkeeping-only codes stay quiet.
        true
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Lifecycle of a trade message.
pub enum MessageStatus {
    /// Raised and not yet handled.
    Open,
    /// The condition cleared or the operator was notified.
    Resolved,
    /// Carried over from a previous run with no matching condition.
    Unknown,
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
/// Store-assigned identity of a [`TradeMessage`].
pub struct MessageId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An operator-visible condition attached to a trade (or to the engine itself when no trade is
/// involved). Re-raising the same condition increments `count` rather than inserting a new row.
pub struct TradeMessage {
    /// Store-assigned identity.
    pub id: MessageId,
    /// The affected trade, if any.
    pub trade: Option<Uid>,
    /// Human-readable description.
    pub text: String,
    /// The stable condition code.
    pub code: MessageCode,
    /// How many times the condition has recurred.
    pub count: u32,
    /// Lifecycle state.
    pub status: MessageStatus,
    /// First occurrence.
    pub first_at: DateTime<Utc>,
    /// Most recent occurrence.
    pub last_at: DateTime<Utc>,
    /// When the message left the open state.
    pub resolved_at: Option<DateTime<Utc>>,
}

// =========================
// === Operator Channels ===
// =========================

/// The boundary through which structured notifications leave the engine. Delivery (email,
/// chat, pager) is someone else's problem; the engine only promises one call per resolved
/// condition.
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    fn notify(&self, subject: &str, body: &str);
}

#[derive(Debug, Default, Clone, Copy)]
/// A [`Notifier`] that writes notifications to the log. The default wiring for paper runs and
/// for any deployment without an email bridge.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        tracing::warn!(subject, body, "operator notification");
    }
}
