//! Core domain model for bid-letting records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

mod county;

pub use county::{CountyTable, MICHIGAN_COUNTIES};

pub const CRATE_NAME: &str = "bidlet-core";

/// Rank recorded when the source rank cell is missing or not an integer.
pub const RANK_UNKNOWN: i32 = -1;

/// One vendor bid on one pay item in one letting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRecord {
    pub proposal_id: String,
    pub item_description: String,
    pub unit: String,
    pub quantity: f64,
    pub bid_price: f64,
    pub ext_amount: f64,
    pub vendor_name: String,
    pub vend_rank: i32,
    pub letting_date: NaiveDate,
    pub source_file: String,
    #[serde(default)]
    pub county: Option<String>,
}

impl BidRecord {
    pub fn is_lowest_bid(&self) -> bool {
        self.vend_rank == 1
    }

    pub fn rank_known(&self) -> bool {
        self.vend_rank != RANK_UNKNOWN
    }
}

/// The unified dataset produced by one ingestion run.
///
/// Rows carry no required ordering and are never mutated once the dataset is
/// built; queries work on borrowed views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    records: Vec<BidRecord>,
}

impl Dataset {
    pub fn new(records: Vec<BidRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[BidRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<BidRecord> {
        self.records
    }

    /// Earliest and latest letting dates, or `None` for an empty dataset.
    pub fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self.records.iter().map(|r| r.letting_date);
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }
}

impl FromIterator<BidRecord> for Dataset {
    fn from_iter<I: IntoIterator<Item = BidRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
