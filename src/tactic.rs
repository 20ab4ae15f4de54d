//! Parsing of the sheet's freeform tactic column into typed contract shapes.
//!
//! The grammar is whatever the data-entry team actually types: `"JAN 15 2019 $150C"`,
//! `"JUN20 $151C"`, `"STOCK LONG"`, `"BOT DEC31 $100P x5/SLD JAN15 $100P x5"`, or a forex
//! symbol like `EURUSD` with any tactic text at all. Anything unreadable becomes a typed error
//! that the supervisor records against the trade.

use chrono::{Datelike, NaiveDate};

use crate::contract::{Cash, Combo, ComboLeg, Contract, Exchange, Right, SecOption, Stock};
use crate::order::Action;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The ways a tactic string can fail to parse. Each failure is recorded as a trade message and
/// demotes the trade to the error state.
pub enum TacticError {
    #[error("tactic is empty")]
    /// Nothing to parse.
    Empty,
    #[error("stock tactic is missing a LONG/SHORT keyword: {0:?}")]
    /// A `STOCK` tactic without a direction.
    MissingDirection(String),
    #[error("unknown month abbreviation: {0:?}")]
    /// A month token that is not one of the twelve 3-letter abbreviations.
    UnknownMonth(String),
    #[error("unreadable spread leg: {0:?}")]
    /// A combo leg with the wrong number of tokens.
    MalformedLeg(String),
    #[error("unreadable leg action (expected BOT or SLD): {0:?}")]
    /// A combo leg action other than `BOT`/`SLD`.
    BadAction(String),
    #[error("unreadable strike: {0:?}")]
    /// A strike token with no parsable price or missing C/P suffix.
    BadStrike(String),
    #[error("unreadable leg quantity: {0:?}")]
    /// A leg quantity token that is not `x<int>`.
    BadQuantity(String),
    #[error("no such calendar date: {year}-{month:02}-{day:02}")]
    /// Tokens parsed individually but name an impossible date.
    BadDate {
        /// Parsed year.
        year: i32,
        /// Parsed month.
        month: u32,
        /// Parsed day.
        day: u32,
    },
    #[error("unreadable option tactic: {0:?}")]
    /// An option tactic with too few tokens.
    Malformed(String),
}

/// Parse a tactic string for `symbol` into a contract shape.
///
/// `today` anchors the year-defaulting rules so that tests (and backfills) are not coupled to
/// the wall clock: an omitted year means the current year, rolled forward by one when the
/// parsed month has already passed.
pub fn parse(symbol: &str, tactic: &str, today: NaiveDate) -> Result<Contract, TacticError> {
    let symbol = symbol.trim().to_uppercase();
    let tactic = tactic.trim().to_uppercase();

    // Forex symbols are recognized by shape alone; the tactic text is free-form commentary.
    if symbol.len() > 3 && symbol.contains("USD") {
        return Ok(Contract::Cash(Cash {
            pair: symbol.replace("USD", "").trim().to_owned(),
        }));
    }

    if tactic.is_empty() {
        return Err(TacticError::Empty);
    }

    if tactic.contains("STOCK") {
        if !tactic.contains("LONG") && !tactic.contains("SHORT") {
            return Err(TacticError::MissingDirection(tactic));
        }
        return Ok(Contract::Stock(Stock {
            symbol,
            exchange: Exchange::Smart,
        }));
    }

    if (tactic.contains('/') || tactic.contains(',')) && tactic.contains('X') {
        return parse_combo(&symbol, &tactic, today);
    }

    parse_option(&symbol, &tactic, today).map(Contract::SecOption)
}

// ==========================
// === Component Grammars ===
// ==========================

/// `<MONTHDAY|MONTH DAY> [YEAR] $<strike><C|P>`, e.g. `"JAN 15 2019 $150.5C"`.
fn parse_option(symbol: &str, tactic: &str, today: NaiveDate) -> Result<SecOption, TacticError> {
    let parts: Vec<&str> = tactic.split_whitespace().collect();
    if parts.is_empty() {
        return Err(TacticError::Empty);
    }

    let first_day: String = parts[0].chars().filter(char::is_ascii_digit).collect();
    let (month, day, year, strike_part) = if first_day.is_empty() {
        // Month and day are separate tokens: `JAN 15 [2019] $150C`.
        let (&day_tok, rest) = parts
            .get(1)
            .zip(parts.get(2..))
            .ok_or_else(|| TacticError::Malformed(tactic.to_owned()))?;
        let month = month_number(&parts[0].chars().take(3).collect::<String>())?;
        let day = parse_day(day_tok)?;
        match rest {
            [year, strike, ..] if rest.len() >= 2 => {
                let year: i32 = year
                    .parse()
                    .map_err(|_| TacticError::Malformed(tactic.to_owned()))?;
                (month, day, Some(year), *strike)
            }
            [strike] => (month, day, None, *strike),
            _ => return Err(TacticError::Malformed(tactic.to_owned())),
        }
    } else {
        // Month and day are attached: `JAN15 [2019] $150C`.
        let month_abv: String = parts[0].chars().filter(|c| c.is_ascii_alphabetic()).collect();
        let month = month_number(&month_abv.chars().take(3).collect::<String>())?;
        let day = parse_day(&first_day)?;
        match parts.get(1..) {
            Some([year, strike, ..]) if parts.len() >= 3 => {
                let year: i32 = year
                    .parse()
                    .map_err(|_| TacticError::Malformed(tactic.to_owned()))?;
                (month, day, Some(year), *strike)
            }
            Some([strike]) => (month, day, None, *strike),
            _ => return Err(TacticError::Malformed(tactic.to_owned())),
        }
    };

    let (strike, right) = parse_strike(strike_part)?;
    let expiry = resolve_expiry(year, month, day, today, false)?;

    Ok(SecOption {
        symbol: symbol.to_owned(),
        strike,
        right,
        expiry,
        exchange: Exchange::Smart,
    })
}

/// Legs separated by `/` (or `,`), each
/// `<BOT|SLD> <MONTHDAY> [YEAR] $<strike><C|P> x<qty>`. The year also shows up before the
/// month-day in older rows; both orders are accepted.
fn parse_combo(symbol: &str, tactic: &str, today: NaiveDate) -> Result<Contract, TacticError> {
    let sep = if tactic.contains('/') { '/' } else { ',' };
    let mut legs = Vec::new();
    let mut qtys = Vec::new();

    for (i, raw) in tactic.split(sep).enumerate() {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let is_year = |tok: &str| tok.len() == 4 && tok.chars().all(|c| c.is_ascii_digit());
        let (action_tok, month_day, year_tok, strike_tok, qty_tok) = match parts.as_slice() {
            [a, y, md, s, q] if is_year(y) => (*a, *md, Some(*y), *s, *q),
            [a, md, y, s, q] => (*a, *md, Some(*y), *s, *q),
            [a, md, s, q] => (*a, *md, None, *s, *q),
            _ => return Err(TacticError::MalformedLeg(raw.trim().to_owned())),
        };

        let action = match action_tok {
            "BOT" => Action::Buy,
            "SLD" => Action::Sell,
            other => return Err(TacticError::BadAction(other.to_owned())),
        };

        let day_digits: String = month_day.chars().filter(char::is_ascii_digit).collect();
        let month_abv: String = month_day
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        let month = month_number(&month_abv)?;
        let day = parse_day(&day_digits)?;
        let year = match year_tok {
            Some(y) => Some(
                y.parse::<i32>()
                    .map_err(|_| TacticError::MalformedLeg(raw.trim().to_owned()))?,
            ),
            None => None,
        };

        let (strike, right) = parse_strike(strike_tok)?;
        let qty: u32 = qty_tok
            .trim_start_matches('X')
            .trim()
            .parse()
            .map_err(|_| TacticError::BadQuantity(qty_tok.to_owned()))?;

        let expiry = resolve_expiry(year, month, day, today, true)?;

        qtys.push(qty.max(1));
        legs.push(ComboLeg {
            sequence: u32::try_from(i).unwrap_or(u32::MAX).saturating_add(1),
            action,
            ratio: 1,
            option: SecOption {
                symbol: symbol.to_owned(),
                strike,
                right,
                expiry,
                exchange: Exchange::Smart,
            },
        });
    }

    // Reduce leg quantities to smallest terms: x5/x5 trades as 1:1, x2/x4 as 1:2.
    let g = qtys.iter().copied().fold(0, gcd);
    for (leg, qty) in legs.iter_mut().zip(&qtys) {
        leg.ratio = if g > 0 { qty / g } else { *qty };
    }

    Ok(Contract::Combo(Combo {
        symbol: symbol.to_owned(),
        legs,
        exchange: Exchange::Smart,
    }))
}

fn parse_strike(token: &str) -> Result<(f64, Right), TacticError> {
    let right = match token.chars().last() {
        Some('C') => Right::Call,
        Some('P') => Right::Put,
        _ => return Err(TacticError::BadStrike(token.to_owned())),
    };
    let digits: String = token
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let strike: f64 = digits
        .parse()
        .map_err(|_| TacticError::BadStrike(token.to_owned()))?;
    Ok((strike, right))
}

fn parse_day(token: &str) -> Result<u32, TacticError> {
    token
        .parse()
        .map_err(|_| TacticError::Malformed(token.to_owned()))
}

/// Apply the year-defaulting rules and validate the calendar date.
///
/// Combo legs roll forward when the parsed month has already passed this year; single options
/// roll forward whenever the full date is already behind `today`.
fn resolve_expiry(
    year: Option<i32>,
    month: u32,
    day: u32,
    today: NaiveDate,
    month_rule: bool,
) -> Result<NaiveDate, TacticError> {
    let bad_date = |year| TacticError::BadDate { year, month, day };

    match year {
        Some(y) => NaiveDate::from_ymd_opt(y, month, day).ok_or_else(|| bad_date(y)),
        None => {
            let mut y = today.year();
            if month_rule && today.month() > month {
                y += 1;
            }
            let mut date = NaiveDate::from_ymd_opt(y, month, day).ok_or_else(|| bad_date(y))?;
            if !month_rule && date < today {
                date = NaiveDate::from_ymd_opt(y + 1, month, day).ok_or_else(|| bad_date(y + 1))?;
            }
            Ok(date)
        }
    }
}

fn month_number(abv: &str) -> Result<u32, TacticError> {
    Ok(match abv {
        "JAN" => 1,
        "FEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" => 8,
        "SEP" => 9,
        "OCT" => 10,
        "NOV" => 11,
        "DEC" => 12,
        other => return Err(TacticError::UnknownMonth(other.to_owned())),
    })
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2019, 1, 2).unwrap()
    }

    #[test]
    fn option_with_year_and_decimal_strike() {
        let c = parse("SYM", "JAN 15 2019 $150.5C", today()).unwrap();
        let Contract::SecOption(opt) = &c else {
            panic!("expected an option, got {c:?}");
        };
        assert_eq!(opt.expiry, NaiveDate::from_ymd_opt(2019, 1, 15).unwrap());
        assert_eq!(opt.strike, 150.5);
        assert_eq!(opt.right, Right::Call);
        assert_eq!(c.key().as_str(), "SYM-20190115-150.5-C");
    }

    #[test]
    fn option_attached_month_day_defaults_year() {
        let c = parse("SYM", "JUN20 $151C", today()).unwrap();
        let Contract::SecOption(opt) = c else {
            panic!("expected an option");
        };
        assert_eq!(opt.expiry, NaiveDate::from_ymd_opt(2019, 6, 20).unwrap());
        assert_eq!(opt.strike, 151.0);
    }

    #[test]
    fn option_in_the_past_rolls_year_forward() {
        // Parsed on Jun 1; a JAN 15 option without a year must mean next January.
        let c = parse("SYM", "JAN 15 $150C", NaiveDate::from_ymd_opt(2019, 6, 1).unwrap()).unwrap();
        let Contract::SecOption(opt) = c else {
            panic!("expected an option");
        };
        assert_eq!(opt.expiry, NaiveDate::from_ymd_opt(2020, 1, 15).unwrap());
    }

    #[test]
    fn combo_two_puts() {
        let c = parse(
            "XYZ",
            "BOT DEC31 2018 $100P x5/SLD JAN15 2019 $100P x5",
            today(),
        )
        .unwrap();
        let legs = c.legs().unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].action, Action::Buy);
        assert_eq!(legs[1].action, Action::Sell);
        assert_eq!([legs[0].ratio, legs[1].ratio], [1, 1]);
        assert_eq!(
            legs[0].option.expiry,
            NaiveDate::from_ymd_opt(2018, 12, 31).unwrap()
        );
        assert_eq!(c.key().as_str(), "XYZ/BAG/BUY/1-SELL/1");
    }

    #[test]
    fn combo_accepts_year_before_month() {
        let c = parse(
            "XYZ",
            "SLD 2018 DEC31 $100P x5/BOT 2019 JAN15 $100P x5",
            today(),
        )
        .unwrap();
        let legs = c.legs().unwrap();
        assert_eq!(legs[0].action, Action::Sell);
        assert_eq!(
            legs[0].option.expiry,
            NaiveDate::from_ymd_opt(2018, 12, 31).unwrap()
        );
        assert_eq!(
            legs[1].option.expiry,
            NaiveDate::from_ymd_opt(2019, 1, 15).unwrap()
        );
    }

    #[test]
    fn combo_ratios_reduce() {
        let c = parse("XYZ", "BOT DEC31 2018 $100P x2/SLD JAN15 2019 $100P x4", today()).unwrap();
        let legs = c.legs().unwrap();
        assert_eq!([legs[0].ratio, legs[1].ratio], [1, 2]);
    }

    #[test]
    fn combo_leg_year_defaults_by_month() {
        // Parsed in November: a DEC leg stays this year, a JAN leg moves to next year.
        let nov = NaiveDate::from_ymd_opt(2018, 11, 20).unwrap();
        let c = parse("XYZ", "BOT DEC31 $100P x1/SLD JAN15 $100P x1", nov).unwrap();
        let legs = c.legs().unwrap();
        assert_eq!(legs[0].option.expiry.year(), 2018);
        assert_eq!(legs[1].option.expiry.year(), 2019);
    }

    #[test]
    fn stock_requires_direction() {
        assert!(matches!(
            parse("AAPL", "STOCK", today()),
            Err(TacticError::MissingDirection(_))
        ));
        let c = parse("AAPL", "STOCK LONG", today()).unwrap();
        assert_eq!(c.key().as_str(), "AAPL");
    }

    #[test]
    fn forex_symbol_overrides_tactic() {
        let c = parse("EURUSD", "anything at all", today()).unwrap();
        let Contract::Cash(cash) = &c else {
            panic!("expected cash");
        };
        assert_eq!(cash.pair, "EUR");
        assert_eq!(c.key().as_str(), "EUR");
    }

    #[test]
    fn garbage_is_a_typed_error() {
        assert!(matches!(
            parse("SYM", "QQQ 15 $150C", today()),
            Err(TacticError::UnknownMonth(_))
        ));
        assert!(matches!(
            parse("SYM", "JAN 15 2019 $150X", today()),
            Err(TacticError::BadStrike(_))
        ));
        assert!(matches!(parse("SYM", "", today()), Err(TacticError::Empty)));
        assert!(matches!(
            parse("SYM", "BOT DEC31 $100P xFIVE/SLD JAN15 $100P x5", today()),
            Err(TacticError::BadQuantity(_))
        ));
    }
}
