//! Filter and aggregate queries over the unified bid dataset.
//!
//! Every predicate in a [`FilterSpec`] is independent and the engine keeps a
//! row only when all active predicates accept it.

use std::collections::BTreeSet;
use std::path::Path;

use bidlet_core::{BidRecord, CountyTable, Dataset};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod aggregate;
mod allow_list;

pub use aggregate::PriceSummary;
pub use allow_list::{AllowList, AllowListError, AllowListOrigin};

pub const CRATE_NAME: &str = "bidlet-query";

/// Description predicate. A non-blank `exact` wins over `contains`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptionFilter {
    pub exact: Option<String>,
    pub contains: Option<String>,
}

impl DescriptionFilter {
    pub fn exact(description: impl Into<String>) -> Self {
        Self {
            exact: Some(description.into()),
            contains: None,
        }
    }

    pub fn contains(term: impl Into<String>) -> Self {
        Self {
            exact: None,
            contains: Some(term.into()),
        }
    }

    pub fn is_active(&self) -> bool {
        non_blank(&self.exact).is_some() || non_blank(&self.contains).is_some()
    }

    pub fn matcher(&self) -> impl Fn(&str) -> bool + '_ {
        let exact = non_blank(&self.exact);
        let needle = non_blank(&self.contains).map(str::to_lowercase);
        move |description: &str| match (exact, needle.as_deref()) {
            (Some(exact), _) => description == exact,
            (None, Some(needle)) => description.to_lowercase().contains(needle),
            (None, None) => true,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Inclusive quantity bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityRange {
    pub min: f64,
    pub max: f64,
}

impl QuantityRange {
    pub fn contains(&self, quantity: f64) -> bool {
        self.min <= quantity && quantity <= self.max
    }

    /// Integer bounds enclosing every quantity in `quantities`, or `None` when
    /// there are none. A degenerate span is widened by 10% either side so a
    /// caller narrowing the range still has room to move.
    pub fn enclosing(quantities: impl IntoIterator<Item = f64>) -> Option<Self> {
        let (lo, hi) = quantities
            .into_iter()
            .fold(None, |acc: Option<(f64, f64)>, q| match acc {
                None => Some((q, q)),
                Some((lo, hi)) => Some((lo.min(q), hi.max(q))),
            })?;
        let floor = lo.floor();
        if floor == hi.floor() {
            return Some(Self {
                min: (floor * 0.9).floor(),
                max: (floor * 1.1).floor() + 1.0,
            });
        }
        Some(Self {
            min: floor,
            max: hi.ceil(),
        })
    }
}

/// Inclusive letting-date bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// One analyst question. Absent or default fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub description_filter: DescriptionFilter,
    pub quantity_range: Option<QuantityRange>,
    pub letting_date_range: Option<DateRange>,
    pub lowest_bidder_only: bool,
    pub county_filter: Option<BTreeSet<String>>,
    pub allow_list_filter: bool,
}

#[derive(Debug, Error)]
pub enum FilterFileError {
    #[error("reading filter file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing filter file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("filter file {0} must end in .yaml, .yml or .json")]
    UnsupportedExtension(String),
}

/// Read a [`FilterSpec`] from a YAML or JSON file.
pub fn load_filter_file(path: &Path) -> Result<FilterSpec, FilterFileError> {
    let display = path.display().to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let text = std::fs::read_to_string(path).map_err(|source| FilterFileError::Io {
        path: display.clone(),
        source,
    })?;
    let parse_err = |message: String| FilterFileError::Parse {
        path: display.clone(),
        message,
    };
    match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string())),
        _ => Err(FilterFileError::UnsupportedExtension(display)),
    }
}

/// Matching rows in dataset order plus their price summary.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult<'a> {
    pub records: Vec<&'a BidRecord>,
    pub summary: Option<PriceSummary>,
}

impl QueryResult<'_> {
    /// No rows matched. A normal outcome the caller decides how to present.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Read-only query surface over one loaded dataset.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    dataset: Dataset,
    counties: CountyTable,
    allow_list: AllowList,
}

impl QueryEngine {
    pub fn new(dataset: Dataset, counties: CountyTable, allow_list: AllowList) -> Self {
        Self {
            dataset,
            counties,
            allow_list,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn counties(&self) -> &CountyTable {
        &self.counties
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn execute(&self, spec: &FilterSpec) -> QueryResult<'_> {
        let description = spec.description_filter.matcher();
        let county_codes = spec
            .county_filter
            .as_ref()
            .map(|names| self.counties.codes_for(names.iter().map(String::as_str)));
        let use_allow_list = spec.allow_list_filter && !self.allow_list.is_empty();

        let records: Vec<&BidRecord> = self
            .dataset
            .records()
            .iter()
            .filter(|r| description(r.item_description.as_str()))
            .filter(|r| spec.quantity_range.map_or(true, |q| q.contains(r.quantity)))
            .filter(|r| spec.letting_date_range.map_or(true, |d| d.contains(r.letting_date)))
            .filter(|r| !spec.lowest_bidder_only || r.is_lowest_bid())
            .filter(|r| {
                county_codes.as_ref().map_or(true, |codes| {
                    CountyTable::code_of(&r.proposal_id).is_some_and(|c| codes.contains(&c))
                })
            })
            .filter(|r| !use_allow_list || self.allow_list.contains(&r.proposal_id))
            .collect();

        debug!(matched = records.len(), total = self.dataset.len(), "query executed");
        let summary = PriceSummary::from_records(records.iter().copied());
        QueryResult { records, summary }
    }

    /// Distinct item descriptions, sorted.
    pub fn descriptions(&self) -> Vec<&str> {
        self.dataset
            .records()
            .iter()
            .map(|r| r.item_description.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Default quantity bound for the rows a description filter selects.
    pub fn quantity_bounds(&self, description: &DescriptionFilter) -> Option<QuantityRange> {
        let matches = description.matcher();
        QuantityRange::enclosing(
            self.dataset
                .records()
                .iter()
                .filter(|r| matches(r.item_description.as_str()))
                .map(|r| r.quantity),
        )
    }

    /// Full letting-date span of the dataset, the default date bound.
    pub fn date_span(&self) -> Option<DateRange> {
        self.dataset
            .date_span()
            .map(|(start, end)| DateRange { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bid(
        proposal_id: &str,
        description: &str,
        quantity: f64,
        bid_price: f64,
        vend_rank: i32,
        letting_date: NaiveDate,
    ) -> BidRecord {
        let counties = CountyTable::michigan();
        BidRecord {
            proposal_id: proposal_id.into(),
            item_description: description.into(),
            unit: "Ea".into(),
            quantity,
            bid_price,
            ext_amount: quantity * bid_price,
            vendor_name: format!("Vendor {vend_rank}"),
            vend_rank,
            letting_date,
            source_file: format!("{letting_date}.xlsx"),
            county: counties.decode(proposal_id).map(ToString::to_string),
        }
    }

    fn engine(allow: &[&str]) -> QueryEngine {
        let records = vec![
            bid("41001", "Hand Patching", 10.0, 5.0, 1, date(2024, 1, 5)),
            bid("41001", "Hand Patching", 20.0, 7.0, 2, date(2024, 1, 5)),
            bid("82002", "Hand Patching, Special", 100.0, 6.5, 1, date(2023, 6, 2)),
            bid("82002", "Curb and Gutter", 100.0, 12.0, -1, date(2023, 6, 2)),
            bid("63003", "Curb and Gutter", 250.5, 11.0, 1, date(2022, 11, 4)),
            bid("99004", "Curb and Gutter", 40.0, 13.0, 2, date(2024, 3, 1)),
        ];
        QueryEngine::new(
            Dataset::new(records),
            CountyTable::michigan(),
            AllowList::from_ids(allow.iter().copied()),
        )
    }

    fn ids(result: &QueryResult<'_>) -> Vec<(String, f64)> {
        result
            .records
            .iter()
            .map(|r| (r.proposal_id.clone(), r.bid_price))
            .collect()
    }

    #[test]
    fn lowest_only_and_weighted_mean_scenario() {
        let engine = engine(&[]);
        let both = FilterSpec {
            description_filter: DescriptionFilter::exact("Hand Patching"),
            ..FilterSpec::default()
        };
        let all = engine.execute(&both);
        assert_eq!(all.len(), 2);
        let summary = all.summary.unwrap();
        assert!((summary.weighted_mean.unwrap() - 6.333_333).abs() < 1e-3);

        let lowest = engine.execute(&FilterSpec {
            lowest_bidder_only: true,
            ..both
        });
        assert_eq!(lowest.len(), 1);
        assert_eq!(lowest.records[0].vend_rank, 1);
        assert_eq!(lowest.records[0].bid_price, 5.0);
    }

    #[test]
    fn exact_description_wins_over_contains() {
        let engine = engine(&[]);
        let filter = DescriptionFilter {
            exact: Some("Hand Patching".into()),
            contains: Some("curb".into()),
        };
        let result = engine.execute(&FilterSpec {
            description_filter: filter,
            ..FilterSpec::default()
        });
        assert!(result.records.iter().all(|r| r.item_description == "Hand Patching"));

        let contains = engine.execute(&FilterSpec {
            description_filter: DescriptionFilter {
                exact: Some("  ".into()),
                contains: Some("PATCHING".into()),
            },
            ..FilterSpec::default()
        });
        assert_eq!(contains.len(), 3);
    }

    #[test]
    fn county_filter_uses_code_projection() {
        let engine = engine(&[]);
        let spec = |names: &[&str]| FilterSpec {
            county_filter: Some(names.iter().map(|n| n.to_string()).collect()),
            ..FilterSpec::default()
        };
        let wayne = engine.execute(&spec(&["wayne"]));
        assert_eq!(ids(&wayne).len(), 2);
        assert!(wayne.records.iter().all(|r| r.county.as_deref() == Some("Wayne")));

        assert_eq!(engine.execute(&spec(&["Kent", "Oakland"])).len(), 3);
        assert!(engine.execute(&spec(&["Atlantis"])).is_empty());
    }

    #[test]
    fn empty_allow_list_is_a_no_op() {
        let spec = FilterSpec {
            allow_list_filter: true,
            ..FilterSpec::default()
        };
        let open = engine(&[]);
        assert_eq!(open.execute(&spec).len(), 6);

        let listed = engine(&["63003", "99004"]);
        let narrowed = listed.execute(&spec);
        assert_eq!(
            ids(&narrowed),
            vec![("63003".to_string(), 11.0), ("99004".to_string(), 13.0)]
        );
    }

    #[test]
    fn predicates_compose_by_intersection() {
        let engine = engine(&["41001", "82002"]);
        let predicates = vec![
            FilterSpec {
                description_filter: DescriptionFilter::contains("curb"),
                ..FilterSpec::default()
            },
            FilterSpec {
                quantity_range: Some(QuantityRange { min: 20.0, max: 150.0 }),
                ..FilterSpec::default()
            },
            FilterSpec {
                letting_date_range: Some(DateRange {
                    start: date(2023, 1, 1),
                    end: date(2024, 1, 31),
                }),
                ..FilterSpec::default()
            },
            FilterSpec {
                lowest_bidder_only: true,
                ..FilterSpec::default()
            },
            FilterSpec {
                county_filter: Some(["Wayne".to_string(), "Oakland".to_string()].into()),
                ..FilterSpec::default()
            },
            FilterSpec {
                allow_list_filter: true,
                ..FilterSpec::default()
            },
        ];

        let combine = |a: &FilterSpec, b: &FilterSpec| FilterSpec {
            description_filter: if a.description_filter.is_active() {
                a.description_filter.clone()
            } else {
                b.description_filter.clone()
            },
            quantity_range: a.quantity_range.or(b.quantity_range),
            letting_date_range: a.letting_date_range.or(b.letting_date_range),
            lowest_bidder_only: a.lowest_bidder_only || b.lowest_bidder_only,
            county_filter: a.county_filter.clone().or_else(|| b.county_filter.clone()),
            allow_list_filter: a.allow_list_filter || b.allow_list_filter,
        };

        for (i, a) in predicates.iter().enumerate() {
            for b in &predicates[i + 1..] {
                let ra = engine.execute(a);
                let rb = engine.execute(b);
                let both = engine.execute(&combine(a, b));
                let expected: Vec<&BidRecord> = ra
                    .records
                    .iter()
                    .copied()
                    .filter(|r| rb.records.iter().any(|o| std::ptr::eq(*o, *r)))
                    .collect();
                assert_eq!(both.records, expected, "{a:?} & {b:?}");
            }
        }
    }

    #[test]
    fn degenerate_quantity_bound_is_widened() {
        assert_eq!(
            QuantityRange::enclosing([100.0, 100.0]),
            Some(QuantityRange { min: 90.0, max: 111.0 })
        );
        assert_eq!(
            QuantityRange::enclosing([0.0]),
            Some(QuantityRange { min: 0.0, max: 1.0 })
        );
        assert_eq!(
            QuantityRange::enclosing([12.5, 40.0]),
            Some(QuantityRange { min: 12.0, max: 40.0 })
        );
        assert_eq!(QuantityRange::enclosing([]), None);
    }

    #[test]
    fn fractional_single_quantity_is_widened_from_its_whole_part() {
        let widened = Some(QuantityRange { min: 10.0, max: 14.0 });
        assert_eq!(QuantityRange::enclosing([12.5]), widened);
        assert_eq!(QuantityRange::enclosing([12.5, 12.5]), widened);
        assert_eq!(QuantityRange::enclosing([12.2, 12.9]), widened);
    }

    #[test]
    fn bounds_follow_the_description_subset() {
        let engine = engine(&[]);
        assert_eq!(
            engine.quantity_bounds(&DescriptionFilter::exact("Curb and Gutter")),
            Some(QuantityRange { min: 40.0, max: 251.0 })
        );
        assert_eq!(
            engine.quantity_bounds(&DescriptionFilter::exact("Hand Patching, Special")),
            Some(QuantityRange { min: 90.0, max: 111.0 })
        );
        assert_eq!(engine.quantity_bounds(&DescriptionFilter::exact("Nothing")), None);
        assert_eq!(
            engine.date_span(),
            Some(DateRange {
                start: date(2022, 11, 4),
                end: date(2024, 3, 1)
            })
        );
        assert_eq!(
            engine.descriptions(),
            vec!["Curb and Gutter", "Hand Patching", "Hand Patching, Special"]
        );
    }

    #[test]
    fn no_match_is_an_empty_result_not_an_error() {
        let engine = engine(&[]);
        let result = engine.execute(&FilterSpec {
            description_filter: DescriptionFilter::exact("Bridge Deck"),
            ..FilterSpec::default()
        });
        assert!(result.is_empty());
        assert_eq!(result.summary, None);
    }

    #[test]
    fn filter_files_load_from_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("q.yaml");
        std::fs::write(
            &yaml,
            "description_filter:\n  contains: patch\nlowest_bidder_only: true\ncounty_filter: [Kent]\nletting_date_range:\n  start: 2024-01-01\n  end: 2024-12-31\n",
        )
        .unwrap();
        let spec = load_filter_file(&yaml).unwrap();
        assert_eq!(spec.description_filter, DescriptionFilter::contains("patch"));
        assert!(spec.lowest_bidder_only);
        let engine = engine(&[]);
        assert_eq!(engine.execute(&spec).len(), 1);

        let json = dir.path().join("q.json");
        std::fs::write(&json, r#"{"quantity_range": {"min": 0, "max": 15}}"#).unwrap();
        let spec = load_filter_file(&json).unwrap();
        assert_eq!(spec.quantity_range, Some(QuantityRange { min: 0.0, max: 15.0 }));

        let toml = dir.path().join("q.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            load_filter_file(&toml),
            Err(FilterFileError::UnsupportedExtension(_))
        ));
    }
}
