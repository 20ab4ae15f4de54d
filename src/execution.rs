use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::contract::ContractKey;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The side of a confirmed trade, as reported in execution callbacks.
pub enum Side {
    /// Contracts were bought.
    Bought,
    /// Contracts were sold.
    Sold,
}

impl Side {
    #[must_use]
    #[inline]
    /// The broker-side code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Bought => "BOT",
            Self::Sold => "SLD",
        }
    }
}

#[derive(Debug, Default, Clone, thiserror::Error)]
#[error("Invalid value encountered when attempting to parse an execution side. No such side: {0}. Valid sides are \"BOT\" or \"SLD\".")]
/// An error returned when parsing a [`Side`] fails.
pub struct ParseSideError(String);

impl FromStr for Side {
    type Err = ParseSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOT" => Ok(Self::Bought),
            "SLD" => Ok(Self::Sold),
            other => Err(ParseSideError(other.to_owned())),
        }
    }
}

/// Split a broker execution id into its base id and correction counter.
///
/// Corrected executions arrive as `"<base>.<correction>"`; the correction segment may carry a
/// leading zero (`"0000e0d5.01"`). An id without a dot-suffix that parses as an integer is an
/// uncorrected original.
#[must_use]
pub fn split_correction_id(exec_id: &str) -> (String, Option<i64>) {
    match exec_id.rsplit_once('.') {
        Some((base, suffix)) => match suffix.trim_start_matches('0').parse::<i64>() {
            Ok(n) => (base.to_owned(), Some(n)),
            // All-zero suffix is correction zero.
            Err(_) if !suffix.is_empty() && suffix.chars().all(|c| c == '0') => {
                (base.to_owned(), Some(0))
            }
            Err(_) => (exec_id.to_owned(), None),
        },
        None => (exec_id.to_owned(), None),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single execution report. Stored under its full `exec_id`; multiple rows may share a
/// `base_exec_id` when the broker issues corrections, and the latest-time row supersedes.
pub struct Execution {
    /// The full execution id, including any correction suffix.
    pub exec_id: String,
    /// The id shared by an execution and all of its corrections.
    pub base_exec_id: String,
    /// The correction counter parsed from the id suffix, if any.
    pub correction_id: Option<i64>,
    /// The broker request id of the order that produced the execution.
    pub order_request_id: i64,
    /// The shape that traded.
    pub contract_key: ContractKey,
    /// Bought or sold.
    pub side: Side,
    /// The number of contracts traded in this report.
    pub shares: f64,
    /// The price at which this report traded.
    pub price: f64,
    /// The average price for the underlying order after this execution.
    pub avg_price: f64,
    /// The cumulative quantity for the underlying order after this execution.
    pub cum_qty: f64,
    /// When the execution occurred, normalized to UTC.
    pub utc_time: DateTime<Utc>,
}

impl Execution {
    #[must_use]
    /// Build an execution from a raw broker report, deriving the base/correction split from the
    /// id.
    pub fn from_report(
        exec_id: &str,
        order_request_id: i64,
        contract_key: ContractKey,
        side: Side,
        shares: f64,
        price: f64,
        avg_price: f64,
        cum_qty: f64,
        utc_time: DateTime<Utc>,
    ) -> Self {
        let (base_exec_id, correction_id) = split_correction_id(exec_id);
        Self {
            exec_id: exec_id.to_owned(),
            base_exec_id,
            correction_id,
            order_request_id,
            contract_key,
            side,
            shares,
            price,
            avg_price,
            cum_qty,
            utc_time,
        }
    }
}

/// Reduce a set of executions to the valid ones: per `base_exec_id`, only the entry with the
/// latest `utc_time` (ties broken by the higher correction counter) survives.
#[must_use]
pub fn valid_executions<'e>(executions: impl IntoIterator<Item = &'e Execution>) -> Vec<&'e Execution> {
    let mut latest: HashMap<&str, &Execution> = HashMap::new();
    for e in executions {
        latest
            .entry(e.base_exec_id.as_str())
            .and_modify(|cur| {
                if (e.utc_time, e.correction_id) > (cur.utc_time, cur.correction_id) {
                    *cur = e;
                }
            })
            .or_insert(e);
    }
    let mut valid: Vec<&Execution> = latest.into_values().collect();
    valid.sort_by(|a, b| a.utc_time.cmp(&b.utc_time).then(a.exec_id.cmp(&b.exec_id)));
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn exec(exec_id: &str, cum_qty: f64, secs: i64) -> Execution {
        Execution::from_report(
            exec_id,
            7,
            ContractKey::from("AAPL"),
            Side::Bought,
            cum_qty,
            1.0,
            1.0,
            cum_qty,
            Utc.timestamp_opt(1_546_000_000 + secs, 0).unwrap(),
        )
    }

    #[test]
    fn correction_suffix_splits() {
        assert_eq!(
            split_correction_id("0000e0d5.5d6a"),
            ("0000e0d5.5d6a".to_owned(), None)
        );
        assert_eq!(
            split_correction_id("0000e0d5.01"),
            ("0000e0d5".to_owned(), Some(1))
        );
        assert_eq!(split_correction_id("plain"), ("plain".to_owned(), None));
        assert_eq!(
            split_correction_id("abc.00"),
            ("abc".to_owned(), Some(0))
        );
    }

    #[test]
    fn latest_correction_supersedes() {
        let a = exec("base.01", 5.0, 0);
        let b = exec("base.02", 10.0, 30);
        let unrelated = exec("other", 3.0, 10);

        let valid = valid_executions([&a, &b, &unrelated]);
        assert_eq!(valid.len(), 2);
        assert!(valid.iter().any(|e| e.exec_id == "base.02"));
        assert!(valid.iter().all(|e| e.exec_id != "base.01"));
    }
}
