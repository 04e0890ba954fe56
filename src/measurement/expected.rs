//! Expected-value table.
//!
//! A reference aid for comparing a run against nominal figures. The source is a
//! small CSV table: a header row naming the columns, then three rows holding
//! span, step and mean for each data column. The first column carries row
//! labels and is ignored.
//!
//! ```text
//! param,Кп,Iпит
//! span,1.0,-
//! step,0.5,-
//! mean,-7.0,85
//! ```
//!
//! Each data column yields one expected value drawn uniformly from the
//! step-aligned inclusive range `mean - span ..= mean + span`.

use rand::Rng;
use std::fmt;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::error::DaqResult;

/// Marker for a cell with no expected value.
pub const PLACEHOLDER: &str = "-";

/// Guard against `2 * span / step` landing a hair below an integer.
const GRID_TOLERANCE: f64 = 1e-9;

/// A derived expected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpectedCell {
    /// Missing or `-` in the source
    Placeholder,
    /// Expected numeric value
    Value(f64),
}

impl ExpectedCell {
    /// Numeric value, `None` for the placeholder.
    pub fn value(&self) -> Option<f64> {
        match self {
            ExpectedCell::Placeholder => None,
            ExpectedCell::Value(v) => Some(*v),
        }
    }
}

impl fmt::Display for ExpectedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedCell::Placeholder => f.write_str(PLACEHOLDER),
            ExpectedCell::Value(v) => write!(f, "{v}"),
        }
    }
}

/// One data column of the source table. `None` marks an empty, placeholder
/// or non-numeric cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedColumn {
    /// Column header
    pub name: String,
    /// Half-width of the range
    pub span: Option<f64>,
    /// Grid step inside the range
    pub step: Option<f64>,
    /// Center value
    pub mean: Option<f64>,
}

impl ExpectedColumn {
    /// Pick this column's expected value.
    pub fn derive<R: Rng + ?Sized>(&self, rng: &mut R) -> ExpectedCell {
        expected_value(self.span, self.step, self.mean, rng)
    }
}

/// Derived table: column name and expected value, in source column order.
pub type ExpectedRow = Vec<(String, ExpectedCell)>;

/// Compute one expected value.
///
/// Any missing cell gives the placeholder. A zero span or step gives `mean`
/// exactly. Otherwise the result is `mean - span + k * step` for a uniformly
/// chosen `k` in `0..=floor(2 * span / step)`, rounded to 2 decimals.
pub fn expected_value<R: Rng + ?Sized>(
    span: Option<f64>,
    step: Option<f64>,
    mean: Option<f64>,
    rng: &mut R,
) -> ExpectedCell {
    let (Some(span), Some(step), Some(mean)) = (span, step, mean) else {
        return ExpectedCell::Placeholder;
    };
    if span == 0.0 || step == 0.0 {
        return ExpectedCell::Value(mean);
    }

    let (span, step) = (span.abs(), step.abs());
    let steps = (2.0 * span / step + GRID_TOLERANCE).floor() as u64;
    let k = rng.gen_range(0..=steps);
    let value = mean - span + k as f64 * step;
    ExpectedCell::Value((value * 100.0).round() / 100.0)
}

fn parse_cell(cell: Option<&str>) -> Option<f64> {
    let cell = cell?.trim();
    if cell.is_empty() || cell == PLACEHOLDER {
        return None;
    }
    cell.parse().ok()
}

/// Parsed span/step/mean source table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    columns: Vec<ExpectedColumn>,
}

impl SourceTable {
    /// Read a span/step/mean table from CSV.
    pub fn load(path: &Path) -> DaqResult<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        info!(path = %path.display(), columns = table.columns.len(), "Loaded expected-value source");
        Ok(table)
    }

    /// Parse from any CSV reader. Rows beyond the third are ignored; missing
    /// rows or cells read as placeholders.
    pub fn from_reader<R: io::Read>(reader: R) -> DaqResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let names: Vec<String> = csv.headers()?.iter().skip(1).map(str::to_string).collect();

        let mut rows = Vec::with_capacity(3);
        for record in csv.records().take(3) {
            rows.push(record?);
        }
        let cell = |row: usize, col: usize| parse_cell(rows.get(row).and_then(|r| r.get(col + 1)));

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(col, name)| ExpectedColumn {
                name,
                span: cell(0, col),
                step: cell(1, col),
                mean: cell(2, col),
            })
            .collect();

        Ok(Self { columns })
    }

    /// Columns in source order.
    pub fn columns(&self) -> &[ExpectedColumn] {
        &self.columns
    }

    /// One expected value per column, in column order.
    pub fn derive<R: Rng + ?Sized>(&self, rng: &mut R) -> ExpectedRow {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.derive(rng)))
            .collect()
    }
}

/// Derive the expected row from `path`, or `None` when the file is absent.
pub fn derive_expected<R: Rng + ?Sized>(path: &Path, rng: &mut R) -> DaqResult<Option<ExpectedRow>> {
    if !path.exists() {
        debug!(path = %path.display(), "Expected-value source not found");
        return Ok(None);
    }
    let table = SourceTable::load(path)?;
    Ok(Some(table.derive(rng)))
}
