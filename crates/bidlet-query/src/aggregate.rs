//! Unit-price statistics over a filtered subset.

use bidlet_core::BidRecord;
use serde::Serialize;

/// Unit-price statistics over a filtered subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSummary {
    pub count: usize,
    pub mean: f64,
    /// `Σ(price·qty) / Σqty`; `None` when the subset's total quantity is zero.
    pub weighted_mean: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub total_quantity: f64,
}

impl PriceSummary {
    /// `None` for an empty subset.
    pub fn from_records<'a, I>(records: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a BidRecord>,
    {
        let mut count = 0usize;
        let mut price_sum = 0.0;
        let mut weighted_sum = 0.0;
        let mut total_quantity = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for r in records {
            count += 1;
            price_sum += r.bid_price;
            weighted_sum += r.bid_price * r.quantity;
            total_quantity += r.quantity;
            min = min.min(r.bid_price);
            max = max.max(r.bid_price);
        }
        if count == 0 {
            return None;
        }

        Some(Self {
            count,
            mean: price_sum / count as f64,
            weighted_mean: (total_quantity != 0.0).then(|| weighted_sum / total_quantity),
            min,
            max,
            total_quantity,
        })
    }
}
