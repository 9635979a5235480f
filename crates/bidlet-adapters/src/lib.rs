//! Source sheet adapters: read one per-letting export, reconcile its headers and
//! clean every row into a [`BidRecord`].

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use bidlet_core::{BidRecord, CountyTable, RANK_UNKNOWN};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bidlet-adapters";

/// How many leading rows are scanned for the header row.
const HEADER_SCAN_ROWS: usize = 10;

/// Spreadsheet downloads smaller than this are error stubs, not workbooks.
const MIN_WORKBOOK_BYTES: usize = 1024;

const ERROR_PAGE_PHRASE: &str = "An Error Occurred while processing your request";

const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%Y%m%d",
    "%m-%d-%Y",
    "%m%d%Y",
    "%y%m%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    Xlsx,
    Xls,
    Csv,
}

impl SourceFormat {
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xlsx" | "xlsm" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn is_workbook(self) -> bool {
        matches!(self, Self::Xlsx | Self::Xls)
    }
}

/// Why a whole source file could not be read.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported source file `{0}`")]
    UnsupportedFormat(String),
    #[error("not a spreadsheet: {0}")]
    ErrorPage(String),
    #[error("workbook could not be read: {0}")]
    Workbook(String),
    #[error("csv could not be read: {0}")]
    Csv(#[from] csv::Error),
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("no header row found (missing: {})", .0.join(", "))]
    MissingColumns(Vec<&'static str>),
}

/// Why one row was dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CleanError {
    #[error("{field} is empty")]
    Missing { field: &'static str },
    #[error("{field} `{value}` is not a number")]
    NotNumeric { field: &'static str, value: String },
    #[error("{field} `{value}` is negative")]
    Negative { field: &'static str, value: String },
}

/// Reads the raw cell grid of one source file.
pub trait SheetReader: Send + Sync {
    fn format(&self) -> SourceFormat;

    fn read_rows(&self, bytes: &[u8]) -> Result<Vec<Vec<String>>, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
struct WorkbookReader {
    format: SourceFormat,
}

#[derive(Debug, Clone, Copy)]
struct CsvReader;

impl SheetReader for WorkbookReader {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn read_rows(&self, bytes: &[u8]) -> Result<Vec<Vec<String>>, AdapterError> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| AdapterError::Workbook(e.to_string()))?;
        let names = workbook.sheet_names();
        let sheet = names
            .iter()
            .find(|n| n.as_str() == "Sheet1")
            .or_else(|| names.first())
            .cloned()
            .ok_or(AdapterError::NoSheets)?;
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| AdapterError::Workbook(format!("sheet {sheet}: {e}")))?;
        Ok(range
            .rows()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }
}

impl SheetReader for CsvReader {
    fn format(&self) -> SourceFormat {
        SourceFormat::Csv
    }

    fn read_rows(&self, bytes: &[u8]) -> Result<Vec<Vec<String>>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|c| c.trim().to_string()).collect());
        }
        Ok(rows)
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

pub fn reader_for_path(path: impl AsRef<Path>) -> Option<Box<dyn SheetReader>> {
    match SourceFormat::from_path(path)? {
        SourceFormat::Csv => Some(Box::new(CsvReader)),
        format => Some(Box::new(WorkbookReader { format })),
    }
}

/// Canonical source columns. Header text varies between exports, so each
/// column accepts several normalised aliases, most preferred first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    ProposalId,
    ItemDescription,
    SupplementalDescription,
    Unit,
    Quantity,
    BidPrice,
    ExtAmount,
    VendorName,
    VendRank,
}

impl Column {
    pub const REQUIRED: [Column; 8] = [
        Column::ProposalId,
        Column::ItemDescription,
        Column::Unit,
        Column::Quantity,
        Column::BidPrice,
        Column::ExtAmount,
        Column::VendorName,
        Column::VendRank,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::ProposalId => "Proposal ID",
            Self::ItemDescription => "Item Description/Supplemental Description",
            Self::SupplementalDescription => "Supplemental Description",
            Self::Unit => "Unit",
            Self::Quantity => "Quantity",
            Self::BidPrice => "Bid Price",
            Self::ExtAmount => "Ext Amount",
            Self::VendorName => "Vendor Name",
            Self::VendRank => "Vend Rank",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::ProposalId => &["proposalid", "proposal", "proposalno", "proposalnumber"],
            Self::ItemDescription => &[
                "itemdescriptionsupplementaldescription",
                "itemsupplementaldescription",
                "itemdescription",
                "payitemdescription",
                "description",
            ],
            Self::SupplementalDescription => &["supplementaldescription", "supplemental"],
            Self::Unit => &["unit", "units", "unitofmeasure"],
            Self::Quantity => &["quantity", "qty"],
            Self::BidPrice => &["bidprice", "unitprice", "price"],
            Self::ExtAmount => &["extamount", "extendedamount", "extamt", "amount"],
            Self::VendorName => &["vendorname", "vendor", "bidder", "biddername"],
            Self::VendRank => &["vendrank", "vendorrank", "rank", "bidrank"],
        }
    }
}

fn normalize_header(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Where each canonical column lives in one particular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    index: BTreeMap<Column, usize>,
    combined_description: bool,
}

impl ColumnMap {
    /// Resolve columns from a single header row; `Err` lists required columns
    /// the row does not provide.
    pub fn from_header(header: &[String]) -> Result<Self, Vec<&'static str>> {
        let normalized = header.iter().map(|h| normalize_header(h)).collect::<Vec<_>>();
        let mut index = BTreeMap::new();
        let mut combined_description = false;

        for column in Column::REQUIRED
            .iter()
            .copied()
            .chain([Column::SupplementalDescription])
        {
            let hit = column.aliases().iter().enumerate().find_map(|(rank, alias)| {
                normalized
                    .iter()
                    .position(|h| h == alias)
                    .map(|pos| (rank, pos))
            });
            if let Some((rank, pos)) = hit {
                if column == Column::ItemDescription {
                    combined_description = rank <= 1;
                }
                index.insert(column, pos);
            }
        }

        let missing = Column::REQUIRED
            .iter()
            .filter(|c| !index.contains_key(c))
            .map(|c| c.label())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(Self {
                index,
                combined_description,
            })
        } else {
            Err(missing)
        }
    }

    /// Find the header row among the first rows of a sheet.
    pub fn locate(rows: &[Vec<String>]) -> Result<(usize, Self), AdapterError> {
        let mut best_missing: Option<Vec<&'static str>> = None;
        for (row_idx, row) in rows.iter().take(HEADER_SCAN_ROWS).enumerate() {
            match Self::from_header(row) {
                Ok(map) => return Ok((row_idx, map)),
                Err(missing) => {
                    if best_missing.as_ref().map_or(true, |b| missing.len() < b.len()) {
                        best_missing = Some(missing);
                    }
                }
            }
        }
        Err(AdapterError::MissingColumns(best_missing.unwrap_or_else(|| {
            Column::REQUIRED.iter().map(|c| c.label()).collect()
        })))
    }

    fn cell<'a>(&self, row: &'a [String], column: Column) -> &'a str {
        self.index
            .get(&column)
            .and_then(|&i| row.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    /// Pull the canonical fields out of one data row.
    pub fn raw_row<'a>(&self, row: &'a [String]) -> RawRow<'a> {
        let description = self.cell(row, Column::ItemDescription);
        let supplemental = if self.combined_description {
            ""
        } else {
            self.cell(row, Column::SupplementalDescription)
        };
        RawRow {
            proposal_id: self.cell(row, Column::ProposalId),
            item_description: description,
            supplemental_description: supplemental,
            unit: self.cell(row, Column::Unit),
            quantity: self.cell(row, Column::Quantity),
            bid_price: self.cell(row, Column::BidPrice),
            ext_amount: self.cell(row, Column::ExtAmount),
            vendor_name: self.cell(row, Column::VendorName),
            vend_rank: self.cell(row, Column::VendRank),
        }
    }
}

/// One source row as text, before any coercion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawRow<'a> {
    pub proposal_id: &'a str,
    pub item_description: &'a str,
    pub supplemental_description: &'a str,
    pub unit: &'a str,
    pub quantity: &'a str,
    pub bid_price: &'a str,
    pub ext_amount: &'a str,
    pub vendor_name: &'a str,
    pub vend_rank: &'a str,
}

/// File-level facts stamped onto every row of that file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowProvenance {
    pub source_file: String,
    pub letting_date: NaiveDate,
}

/// Strip thousands separators and currency symbols, then parse.
pub fn clean_numeric(field: &'static str, value: &str) -> Result<f64, CleanError> {
    let stripped = value
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£') && !c.is_whitespace())
        .collect::<String>();
    if stripped.is_empty() {
        return Err(CleanError::Missing { field });
    }
    match stripped.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CleanError::NotNumeric {
            field,
            value: value.to_string(),
        }),
    }
}

/// Parse a vendor rank; anything that is not a positive integer is unknown.
pub fn clean_rank(value: &str) -> i32 {
    let value = value.trim();
    let parsed = value.parse::<i32>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0 && *f >= 1.0 && *f <= f64::from(i32::MAX))
            .map(|f| f as i32)
    });
    match parsed {
        Some(rank) if rank >= 1 => rank,
        _ => RANK_UNKNOWN,
    }
}

/// Coerce one raw row into a record, or report why it must be dropped.
pub fn clean_row(
    raw: &RawRow<'_>,
    provenance: &RowProvenance,
    counties: &CountyTable,
) -> Result<BidRecord, CleanError> {
    let quantity = clean_numeric("Quantity", raw.quantity)?;
    if quantity < 0.0 {
        return Err(CleanError::Negative {
            field: "Quantity",
            value: raw.quantity.to_string(),
        });
    }
    let bid_price = clean_numeric("Bid Price", raw.bid_price)?;
    let ext_amount = clean_numeric("Ext Amount", raw.ext_amount)?;

    let item_description = if raw.supplemental_description.is_empty() {
        raw.item_description.to_string()
    } else {
        format!("{}/{}", raw.item_description, raw.supplemental_description)
    };

    Ok(BidRecord {
        proposal_id: raw.proposal_id.to_string(),
        item_description,
        unit: raw.unit.to_string(),
        quantity,
        bid_price,
        ext_amount,
        vendor_name: raw.vendor_name.to_string(),
        vend_rank: clean_rank(raw.vend_rank),
        letting_date: provenance.letting_date,
        source_file: provenance.source_file.clone(),
        county: counties.decode(raw.proposal_id).map(ToString::to_string),
    })
}

/// Letting date encoded in a source file name such as `2024-01-05.xlsx`.
///
/// A trailing copy marker (`_1`, ` (2)`) is tolerated.
pub fn letting_date_from_file_name(file_name: &str) -> Option<NaiveDate> {
    let stem = Path::new(file_name).file_stem()?.to_str()?.trim();
    parse_date_stem(stem).or_else(|| parse_date_stem(strip_copy_suffix(stem)?))
}

fn parse_date_stem(stem: &str) -> Option<NaiveDate> {
    let normalized = stem.replace(['_', '.'], "-");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
}

fn strip_copy_suffix(stem: &str) -> Option<&str> {
    if let Some(inner) = stem.strip_suffix(')') {
        let (head, counter) = inner.rsplit_once('(')?;
        if !counter.is_empty() && counter.chars().all(|c| c.is_ascii_digit()) {
            return Some(head.trim_end());
        }
        return None;
    }
    let (head, counter) = stem.rsplit_once('_')?;
    (!counter.is_empty() && counter.len() <= 2 && counter.chars().all(|c| c.is_ascii_digit()))
        .then_some(head)
}

/// Detect downloads that saved an error response instead of a sheet.
pub fn sniff_error_page(format: SourceFormat, bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    if head.contains(ERROR_PAGE_PHRASE) {
        return Some("server error page saved in place of the export".to_string());
    }
    let lead = head.trim_start().to_ascii_lowercase();
    if lead.starts_with("<!doctype") || lead.starts_with("<html") {
        return Some("HTML document saved in place of the export".to_string());
    }
    if format.is_workbook() && bytes.len() < MIN_WORKBOOK_BYTES {
        return Some(format!("only {} bytes, too small for a workbook", bytes.len()));
    }
    None
}

/// A row dropped by the cleaner, by 1-based sheet row number.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    pub row: usize,
    pub error: CleanError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetParse {
    pub records: Vec<BidRecord>,
    pub malformed: Vec<MalformedRow>,
}

/// Read one source file's bytes into cleaned records.
pub fn parse_source(
    file_name: &str,
    bytes: &[u8],
    letting_date: NaiveDate,
    counties: &CountyTable,
) -> Result<SheetParse, AdapterError> {
    let reader = reader_for_path(file_name)
        .ok_or_else(|| AdapterError::UnsupportedFormat(file_name.to_string()))?;
    if let Some(reason) = sniff_error_page(reader.format(), bytes) {
        return Err(AdapterError::ErrorPage(reason));
    }

    let rows = reader.read_rows(bytes)?;
    let (header_idx, columns) = ColumnMap::locate(&rows)?;
    let provenance = RowProvenance {
        source_file: file_name.to_string(),
        letting_date,
    };

    let mut parsed = SheetParse::default();
    for (offset, row) in rows.iter().enumerate().skip(header_idx + 1) {
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        match clean_row(&columns.raw_row(row), &provenance, counties) {
            Ok(record) => parsed.records.push(record),
            Err(error) => {
                debug!(file = file_name, row = offset + 1, %error, "dropping malformed row");
                parsed.malformed.push(MalformedRow {
                    row: offset + 1,
                    error,
                });
            }
        }
    }
    Ok(parsed)
}
