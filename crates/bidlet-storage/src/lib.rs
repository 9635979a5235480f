//! Unified dataset persistence: Parquet + CSV encodings and atomic file writes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{Array, Date32Array, Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bidlet_core::{BidRecord, Dataset};
use chrono::{Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidlet-storage";

pub const PARQUET_FILE_NAME: &str = "bid_records.parquet";
pub const CSV_FILE_NAME: &str = "bid_records.csv";

/// Days from 0001-01-01 to 1970-01-01, the Date32 epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes via a sibling temp file and rename, so readers never observe a
/// half-written dataset.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<StoredFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    debug!(path = %path.display(), bytes = bytes.len(), "stored file");

    Ok(StoredFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

/// Location of the persisted unified dataset.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parquet_path(&self) -> PathBuf {
        self.root.join(PARQUET_FILE_NAME)
    }

    pub fn csv_path(&self) -> PathBuf {
        self.root.join(CSV_FILE_NAME)
    }

    /// Replace the persisted dataset with `dataset` in both encodings.
    pub async fn write_dataset(&self, dataset: &Dataset) -> Result<Vec<StoredFile>> {
        let parquet = encode_parquet(dataset.records())?;
        let csv = encode_csv(dataset.records())?;
        Ok(vec![
            write_atomic(&self.parquet_path(), &parquet).await?,
            write_atomic(&self.csv_path(), &csv).await?,
        ])
    }

    pub fn load(&self) -> Result<Dataset> {
        load_dataset(&self.parquet_path())
    }
}

fn bid_record_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("proposal_id", DataType::Utf8, false),
        ArrowField::new("item_description", DataType::Utf8, false),
        ArrowField::new("unit", DataType::Utf8, false),
        ArrowField::new("quantity", DataType::Float64, false),
        ArrowField::new("bid_price", DataType::Float64, false),
        ArrowField::new("ext_amount", DataType::Float64, false),
        ArrowField::new("vendor_name", DataType::Utf8, false),
        ArrowField::new("vend_rank", DataType::Int32, false),
        ArrowField::new("letting_date", DataType::Date32, false),
        ArrowField::new("source_file", DataType::Utf8, false),
        ArrowField::new("county", DataType::Utf8, true),
    ]))
}

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

fn strings<'a>(records: &'a [BidRecord], f: impl Fn(&'a BidRecord) -> &'a str) -> StringArray {
    StringArray::from(records.iter().map(f).collect::<Vec<_>>())
}

fn floats(records: &[BidRecord], f: impl Fn(&BidRecord) -> f64) -> Float64Array {
    Float64Array::from(records.iter().map(f).collect::<Vec<_>>())
}

pub fn encode_parquet(records: &[BidRecord]) -> Result<Vec<u8>> {
    let batch = RecordBatch::try_new(
        bid_record_schema(),
        vec![
            Arc::new(strings(records, |r| r.proposal_id.as_str())),
            Arc::new(strings(records, |r| r.item_description.as_str())),
            Arc::new(strings(records, |r| r.unit.as_str())),
            Arc::new(floats(records, |r| r.quantity)),
            Arc::new(floats(records, |r| r.bid_price)),
            Arc::new(floats(records, |r| r.ext_amount)),
            Arc::new(strings(records, |r| r.vendor_name.as_str())),
            Arc::new(Int32Array::from(records.iter().map(|r| r.vend_rank).collect::<Vec<_>>())),
            Arc::new(Date32Array::from(
                records.iter().map(|r| date_to_days(r.letting_date)).collect::<Vec<_>>(),
            )),
            Arc::new(strings(records, |r| r.source_file.as_str())),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.county.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building bid record batch")?;

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing bid record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("parquet column `{name}` is missing"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("parquet column `{name}` has an unexpected type"))
}

fn batch_to_records(batch: &RecordBatch, out: &mut Vec<BidRecord>) -> Result<()> {
    let proposal_id = column::<StringArray>(batch, "proposal_id")?;
    let item_description = column::<StringArray>(batch, "item_description")?;
    let unit = column::<StringArray>(batch, "unit")?;
    let quantity = column::<Float64Array>(batch, "quantity")?;
    let bid_price = column::<Float64Array>(batch, "bid_price")?;
    let ext_amount = column::<Float64Array>(batch, "ext_amount")?;
    let vendor_name = column::<StringArray>(batch, "vendor_name")?;
    let vend_rank = column::<Int32Array>(batch, "vend_rank")?;
    let letting_date = column::<Date32Array>(batch, "letting_date")?;
    let source_file = column::<StringArray>(batch, "source_file")?;
    let county = column::<StringArray>(batch, "county")?;

    for i in 0..batch.num_rows() {
        let Some(date) = days_to_date(letting_date.value(i)) else {
            bail!("row {i}: letting_date {} is out of range", letting_date.value(i));
        };
        out.push(BidRecord {
            proposal_id: proposal_id.value(i).to_string(),
            item_description: item_description.value(i).to_string(),
            unit: unit.value(i).to_string(),
            quantity: quantity.value(i),
            bid_price: bid_price.value(i),
            ext_amount: ext_amount.value(i),
            vendor_name: vendor_name.value(i).to_string(),
            vend_rank: vend_rank.value(i),
            letting_date: date,
            source_file: source_file.value(i).to_string(),
            county: (!county.is_null(i)).then(|| county.value(i).to_string()),
        });
    }
    Ok(())
}

pub fn load_parquet(path: &Path) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        batch_to_records(&batch, &mut records)
            .with_context(|| format!("decoding {}", path.display()))?;
    }
    Ok(Dataset::new(records))
}

pub fn encode_csv(records: &[BidRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record).context("serializing bid record to csv")?;
    }
    writer.into_inner().context("flushing csv writer")
}

pub fn load_csv(path: &Path) -> Result<Dataset> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize::<BidRecord>()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("{} record {}", path.display(), i + 1)))
        .collect::<Result<Vec<_>>>()
        .map(Dataset::new)
}

/// Load a persisted dataset, choosing the decoder from the file extension.
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => load_csv(path),
        Some(ext) if ext.eq_ignore_ascii_case("parquet") => load_parquet(path),
        _ => bail!("{}: expected a .parquet or .csv dataset", path.display()),
    }
}

/// Re-encode a persisted CSV dataset as Parquet.
pub async fn convert_csv_to_parquet(input: &Path, output: &Path) -> Result<StoredFile> {
    let dataset = load_csv(input)?;
    let bytes = encode_parquet(dataset.records())?;
    write_atomic(output, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(proposal: &str, rank: i32, county: Option<&str>) -> BidRecord {
        BidRecord {
            proposal_id: proposal.to_string(),
            item_description: "Hand Patching".to_string(),
            unit: "Ton".to_string(),
            quantity: 1200.0,
            bid_price: 95.5,
            ext_amount: 114_600.0,
            vendor_name: "Grand River Paving".to_string(),
            vend_rank: rank,
            letting_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            source_file: "2024-01-05.xlsx".to_string(),
            county: county.map(ToString::to_string),
        }
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn date32_conversion_matches_unix_epoch() {
        assert_eq!(date_to_days(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()), 0);
        assert_eq!(days_to_date(19_727), NaiveDate::from_ymd_opt(2024, 1, 5));
    }

    #[tokio::test]
    async fn dataset_survives_parquet_and_csv() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("data"));
        let dataset = Dataset::new(vec![
            record("41001", 1, Some("Kent")),
            record("99001", -1, None),
        ]);

        let stored = store.write_dataset(&dataset).await.expect("write dataset");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|f| f.path.exists() && f.bytes > 0));

        assert_eq!(store.load().expect("load parquet"), dataset);
        assert_eq!(load_dataset(&store.csv_path()).expect("load csv"), dataset);
    }

    #[tokio::test]
    async fn csv_converts_to_parquet() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("combined.csv");
        let dataset = Dataset::new(vec![record("82021", 2, Some("Wayne"))]);
        std::fs::write(&csv_path, encode_csv(dataset.records()).unwrap()).unwrap();

        let out = dir.path().join("out/combined.parquet");
        let stored = convert_csv_to_parquet(&csv_path, &out).await.expect("convert");
        assert_eq!(stored.path, out);
        assert_eq!(load_parquet(&out).expect("load"), dataset);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested/file.bin");
        write_atomic(&target, b"first").await.unwrap();
        let second = write_atomic(&target, b"second").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert_eq!(second.sha256, sha256_hex(b"second"));
        let leftovers = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(load_dataset(Path::new("data/bid_records.xlsx")).is_err());
    }
}
