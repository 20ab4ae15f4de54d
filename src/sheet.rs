//! The tabular intent surface: row parsing, the gateway trait, and an in-memory sheet.
//!
//! The sheet is a best-effort mirror of engine state. Every write can fail without blocking a
//! state transition; the supervisor logs the failure and retries on the next cycle.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::America::New_York;
use std::sync::Mutex;

use crate::trade::Uid;

// ============================
// === Column Layout (1-based) ===
// ============================

/// Column positions of the intent sheet, 1-based to match the upstream API.
pub mod columns {
    /// Alert category.
    pub const TYPE: usize = 1;
    /// Ticker symbol.
    pub const SYMBOL: usize = 2;
    /// Position size in units of $1000.
    pub const POSITION_SIZE: usize = 3;
    /// Freeform tactic text.
    pub const TACTIC: usize = 4;
    /// Thesis text (unused by the engine).
    pub const THESIS: usize = 5;
    /// Underlying price at entry.
    pub const UNDERLYING_ENTRY: usize = 6;
    /// Comma-separated stop prices, up to two.
    pub const STOP: usize = 7;
    /// Comma-separated target prices, up to three.
    pub const TARGET: usize = 8;
    /// Entry price; negative marks a short.
    pub const ENTRY_PRICE: usize = 9;
    /// Percent sold, rendered `"NN%"`.
    pub const PCT_SOLD: usize = 10;
    /// Exit price.
    pub const EXIT_PRICE: usize = 11;
    /// Date entered, `MM/DD/YYYY HH:MM` US/Eastern.
    pub const DATE_ENTERED: usize = 12;
    /// Date exited.
    pub const DATE_EXITED: usize = 13;
    /// Close notes ("Target reached" / "Stop loss").
    pub const NOTES: usize = 14;
    /// First analytics formula column; 15–21 are preserved on row inserts.
    pub const FORMULA_FIRST: usize = 15;
    /// Last analytics formula column.
    pub const FORMULA_LAST: usize = 21;
    /// The engine-assigned uid.
    pub const UID: usize = 22;
    /// Total columns the engine reads or writes.
    pub const WIDTH: usize = 22;
}

// ==========================
// === Cell-level Parsing ===
// ==========================

/// Scrub a price cell down to a number. Keeps digits, `.`, `-`; everything else (currency
/// symbols, whitespace, stray text) is dropped. Multi-value cells yield their first field.
#[must_use]
pub fn parse_price(cell: &str) -> Option<f64> {
    let first = cell.split(',').next().unwrap_or("");
    let scrubbed: String = first
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    scrubbed.parse().ok()
}

/// Parse a comma-separated price list, padded with `None` to exactly `N` entries.
#[must_use]
pub fn parse_price_list<const N: usize>(cell: &str) -> [Option<f64>; N] {
    let mut out = [None; N];
    for (slot, part) in out.iter_mut().zip(cell.split(',')) {
        *slot = parse_price(part);
    }
    out
}

/// Parse a `"NN%"` cell to an integer percent; unreadable cells count as zero.
#[must_use]
pub fn parse_pct(cell: &str) -> i64 {
    parse_price(cell).map_or(0, |p| p as i64)
}

/// Parse a sheet timestamp (`MM/DD/YYYY HH:MM`, US/Eastern) into UTC. A couple of close
/// variants the data-entry team actually produces are accepted too.
#[must_use]
pub fn parse_sheet_datetime(cell: &str) -> Option<DateTime<Utc>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(cell, "%m/%d/%Y %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(cell, "%m/%d/%Y %H:%M:%S"))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(cell, "%m/%d/%Y").map(|d| {
                d.and_hms_opt(0, 0, 0)
                    .expect("midnight is always a valid time")
            })
        })
        .ok()?;
    naive
        .and_local_timezone(New_York)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Render a UTC instant the way the sheet expects: `MM/DD/YYYY HH:MM` US/Eastern.
#[must_use]
pub fn format_sheet_datetime(at: DateTime<Utc>) -> String {
    at.with_timezone(&New_York)
        .format("%m/%d/%Y %H:%M")
        .to_string()
}

/// Re-point the analytics formulas of a copied row at its new row index. The upstream formulas
/// reference their own row, so a plain text substitution of the row number is exactly what the
/// production sheet does on insert.
pub fn rewrite_formula_rows(values: &mut [String], old_row: usize, new_row: usize) {
    let old = old_row.to_string();
    let new = new_row.to_string();
    for col in columns::FORMULA_FIRST..=columns::FORMULA_LAST {
        if let Some(cell) = values.get_mut(col - 1) {
            *cell = cell.replace(&old, &new);
        }
    }
}

// ======================
// === Parsed Intents ===
// ======================

#[derive(Debug, Clone, PartialEq)]
/// One data row of the sheet, parsed leniently. Row indices are 1-based sheet coordinates
/// (row 1 is the header).
pub struct IntentRow {
    /// The sheet row this intent currently occupies.
    pub row_idx: usize,
    /// Alert category (column 1).
    pub alert_category: String,
    /// Ticker symbol.
    pub symbol: String,
    /// Position size in units of $1000.
    pub size: Option<f64>,
    /// Raw tactic text.
    pub tactic: String,
    /// Underlying price at entry.
    pub underlying_entry: Option<f64>,
    /// Stop prices in trigger order.
    pub stops: [Option<f64>; 2],
    /// Target prices in trigger order.
    pub targets: [Option<f64>; 3],
    /// Entry price; negative marks a short.
    pub entry_price: Option<f64>,
    /// Percent sold.
    pub pct_sold: i64,
    /// Exit price.
    pub exit_price: Option<f64>,
    /// When the intent was entered.
    pub date_entered: Option<DateTime<Utc>>,
    /// When the trade exited.
    pub date_exited: Option<DateTime<Utc>>,
    /// Close notes.
    pub notes: String,
    /// The engine-assigned uid, once present.
    pub uid: Option<Uid>,
}

impl IntentRow {
    #[must_use]
    /// Parse raw cells into an intent. Never fails: unreadable cells parse to `None`/empty, and
    /// the ingest filter decides what to do with incomplete rows.
    pub fn from_cells(row_idx: usize, cells: &[String]) -> Self {
        let cell = |col: usize| cells.get(col - 1).map(String::as_str).unwrap_or("");
        let uid = {
            let raw = cell(columns::UID).trim();
            (!raw.is_empty()).then(|| Uid::from(raw))
        };
        Self {
            row_idx,
            alert_category: cell(columns::TYPE).trim().to_owned(),
            symbol: cell(columns::SYMBOL).trim().to_owned(),
            size: parse_price(cell(columns::POSITION_SIZE)),
            tactic: cell(columns::TACTIC).trim().to_owned(),
            underlying_entry: parse_price(cell(columns::UNDERLYING_ENTRY)),
            stops: parse_price_list(cell(columns::STOP)),
            targets: parse_price_list(cell(columns::TARGET)),
            entry_price: parse_price(cell(columns::ENTRY_PRICE)),
            pct_sold: parse_pct(cell(columns::PCT_SOLD)),
            exit_price: parse_price(cell(columns::EXIT_PRICE)),
            date_entered: parse_sheet_datetime(cell(columns::DATE_ENTERED)),
            date_exited: parse_sheet_datetime(cell(columns::DATE_EXITED)),
            notes: cell(columns::NOTES).trim().to_owned(),
            uid,
        }
    }

    #[must_use]
    /// Whether the row is a live intent: has a symbol and an entered date, and has not exited.
    pub fn is_live_intent(&self) -> bool {
        !self.symbol.is_empty() && self.date_entered.is_some() && self.date_exited.is_none()
    }

    #[must_use]
    /// Whether the row records a partial exit of some intent.
    pub fn is_partial_exit(&self) -> bool {
        self.pct_sold > 0 && self.pct_sold < 100
    }
}

// =========================
// === The Gateway Trait ===
// =========================

#[derive(Debug, Clone, thiserror::Error)]
#[error("sheet gateway error: {0}")]
/// A transient sheet I/O failure. Retried next cycle.
pub struct SheetError(pub String);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
/// The cell highlight colors the engine uses: red flags a problem, white clears it.
pub enum Color {
    /// Flag a cell.
    Red,
    /// Clear a flag.
    White,
}

/// The engine's view of the spreadsheet. Row/column coordinates are 1-based.
///
/// Implementations are expected to be cheap to call repeatedly; the production implementation
/// caches reads on a short TTL the way the upstream service client does.
pub trait SheetGateway: Send + Sync {
    /// All data rows (sheet rows 2..), raw cells in column order.
    fn rows(&self) -> Result<Vec<Vec<String>>, SheetError>;

    /// Overwrite one cell.
    fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), SheetError>;

    /// Read one row with formula cells in formula form (not computed values).
    fn row_formulas(&self, row: usize) -> Result<Vec<String>, SheetError>;

    /// Insert a full row at `index`, shifting later rows down.
    fn insert_row(&self, index: usize, values: &[String]) -> Result<(), SheetError>;

    /// Locate the row currently holding `uid` in the UID column.
    fn find_row_by_uid(&self, uid: &Uid) -> Result<Option<usize>, SheetError>;

    /// Change a cell's background color.
    fn highlight_cell(&self, row: usize, col: usize, color: Color) -> Result<(), SheetError>;

    /// Copy `source_row` to the row below it, re-pointing its analytics formulas at the new
    /// index and overlaying `(column, value)` overrides. Returns the new row index.
    ///
    /// This is the single capability partial closes need: the copied row keeps its formula
    /// cells live while the override cells record the exit.
    fn insert_row_preserving_formulas(
        &self,
        source_row: usize,
        overrides: &[(usize, String)],
    ) -> Result<usize, SheetError> {
        let mut values = self.row_formulas(source_row)?;
        values.resize(columns::WIDTH, String::new());
        let new_row = source_row + 1;
        rewrite_formula_rows(&mut values, source_row, new_row);
        for (col, value) in overrides {
            if let Some(cell) = values.get_mut(col - 1) {
                *cell = value.clone();
            }
        }
        self.insert_row(new_row, &values)?;
        Ok(new_row)
    }
}

// ==========================
// === In-memory Gateway ===
// ==========================

#[derive(Debug, Default)]
/// A [`SheetGateway`] backed by a vector of rows. Used by the test suite and by dry runs; it
/// also records highlight calls so tests can assert on operator-visible flags.
pub struct MemorySheet {
    rows: Mutex<Vec<Vec<String>>>,
    highlights: Mutex<Vec<(usize, usize, Color)>>,
}

impl MemorySheet {
    #[must_use]
    /// An empty sheet containing only a header row.
    pub fn new() -> Self {
        let sheet = Self::default();
        sheet
            .rows
            .lock()
            .expect("sheet lock poisoned")
            .push(vec![String::new(); columns::WIDTH]);
        sheet
    }

    /// Append a data row built from `(column, value)` pairs; unset columns are empty.
    pub fn push_row(&self, cells: &[(usize, &str)]) {
        let mut row = vec![String::new(); columns::WIDTH];
        for (col, value) in cells {
            row[col - 1] = (*value).to_owned();
        }
        self.rows.lock().expect("sheet lock poisoned").push(row);
    }

    #[must_use]
    /// Read a single cell (empty string when out of range).
    pub fn cell(&self, row: usize, col: usize) -> String {
        self.rows
            .lock()
            .expect("sheet lock poisoned")
            .get(row - 1)
            .and_then(|r| r.get(col - 1))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    /// Number of rows including the header.
    pub fn len(&self) -> usize {
        self.rows.lock().expect("sheet lock poisoned").len()
    }

    #[must_use]
    /// Whether the sheet holds only the header.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    #[must_use]
    /// Every highlight call made so far, in order.
    pub fn highlights(&self) -> Vec<(usize, usize, Color)> {
        self.highlights.lock().expect("sheet lock poisoned").clone()
    }
}

impl SheetGateway for MemorySheet {
    fn rows(&self) -> Result<Vec<Vec<String>>, SheetError> {
        let rows = self.rows.lock().expect("sheet lock poisoned");
        Ok(rows.iter().skip(1).cloned().collect())
    }

    fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), SheetError> {
        let mut rows = self.rows.lock().expect("sheet lock poisoned");
        let cell = rows
            .get_mut(row - 1)
            .and_then(|r| r.get_mut(col - 1))
            .ok_or_else(|| SheetError(format!("no such cell: ({row}, {col})")))?;
        *cell = value.to_owned();
        Ok(())
    }

    fn row_formulas(&self, row: usize) -> Result<Vec<String>, SheetError> {
        self.rows
            .lock()
            .expect("sheet lock poisoned")
            .get(row - 1)
            .cloned()
            .ok_or_else(|| SheetError(format!("no such row: {row}")))
    }

    fn insert_row(&self, index: usize, values: &[String]) -> Result<(), SheetError> {
        let mut rows = self.rows.lock().expect("sheet lock poisoned");
        if index == 0 || index > rows.len() + 1 {
            return Err(SheetError(format!("insert index out of range: {index}")));
        }
        rows.insert(index - 1, values.to_vec());
        Ok(())
    }

    fn find_row_by_uid(&self, uid: &Uid) -> Result<Option<usize>, SheetError> {
        let rows = self.rows.lock().expect("sheet lock poisoned");
        Ok(rows
            .iter()
            .position(|r| r.get(columns::UID - 1).map(String::as_str) == Some(uid.as_str()))
            .map(|i| i + 1))
    }

    fn highlight_cell(&self, row: usize, col: usize, color: Color) -> Result<(), SheetError> {
        self.highlights
            .lock()
            .expect("sheet lock poisoned")
            .push((row, col, color));
        Ok(())
    }
}
