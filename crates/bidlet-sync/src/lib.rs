//! Ingestion pipeline: source directory walk, per-file outcomes, reports and
//! the unified dataset write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bidlet_adapters::{letting_date_from_file_name, parse_source, SourceFormat};
use bidlet_core::{BidRecord, CountyTable, Dataset};
use bidlet_storage::{sha256_hex, DatasetStore, StoredFile};
use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidlet-sync";

const SECONDS_PER_YEAR: u64 = 365 * 24 * 3600;

/// Which timestamp the ingestion recency window is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecencyBasis {
    /// The letting date parsed from the file name.
    #[default]
    LettingDate,
    /// The file's modification time on disk.
    Modified,
}

impl FromStr for RecencyBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "letting-date" | "letting_date" | "name" => Ok(Self::LettingDate),
            "modified" | "mtime" => Ok(Self::Modified),
            other => Err(format!("unknown recency basis `{other}` (expected letting-date or modified)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyCutoff {
    pub years: u32,
    pub basis: RecencyBasis,
}

impl RecencyCutoff {
    /// Oldest letting date still inside the window, counted in calendar years.
    pub fn earliest_letting_date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_months(Months::new(self.years.saturating_mul(12)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Oldest modification time still inside the window, counted in 365-day years.
    pub fn earliest_modified(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(Duration::from_secs(u64::from(self.years) * SECONDS_PER_YEAR))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub recency: Option<RecencyCutoff>,
    pub skip_duplicates: bool,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let basis = std::env::var("BIDLET_RECENCY_BASIS")
            .ok()
            .and_then(|v| match v.parse::<RecencyBasis>() {
                Ok(basis) => Some(basis),
                Err(err) => {
                    warn!(%err, "ignoring BIDLET_RECENCY_BASIS");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            source_dir: std::env::var("BIDLET_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./xlsx")),
            output_dir: std::env::var("BIDLET_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            recency: recency_years(std::env::var("BIDLET_RECENCY_YEARS").ok())
                .map(|years| RecencyCutoff { years, basis }),
            skip_duplicates: std::env::var("BIDLET_SKIP_DUPLICATES")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }
}

fn recency_years(value: Option<String>) -> Option<u32> {
    let value = value?;
    match value.trim().parse() {
        Ok(years) => Some(years),
        Err(err) => {
            warn!(%err, value = %value, "ignoring BIDLET_RECENCY_YEARS");
            None
        }
    }
}

/// What happened to one candidate source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested { rows: usize, malformed_rows: usize },
    OutsideCutoff,
    UndatedName,
    Duplicate { of: String },
    Failed { reason: String },
}

impl FileOutcome {
    pub fn rows(&self) -> usize {
        match self {
            Self::Ingested { rows, .. } => *rows,
            _ => 0,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Ingested { rows, malformed_rows: 0 } => format!("ingested {rows} rows"),
            Self::Ingested { rows, malformed_rows } => {
                format!("ingested {rows} rows ({malformed_rows} malformed dropped)")
            }
            Self::OutsideCutoff => "skipped: outside recency window".to_string(),
            Self::UndatedName => "skipped: file name is not a date".to_string(),
            Self::Duplicate { of } => format!("skipped: same content as `{of}`"),
            Self::Failed { reason } => format!("failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub file: String,
    pub letting_date: Option<NaiveDate>,
    pub sha256: Option<String>,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Unified dataset plus the per-file outcomes that produced it.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub dataset: Dataset,
    pub files: Vec<FileReport>,
}

impl Aggregation {
    pub fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_dir: String,
    pub recency: Option<RecencyCutoff>,
    pub candidate_files: usize,
    pub ingested_files: usize,
    pub failed_files: usize,
    pub rows: usize,
    pub malformed_rows: usize,
    pub reports_dir: String,
    pub dataset_files: Vec<String>,
    pub files: Vec<FileReport>,
}

impl IngestRunSummary {
    /// True when no file contributed a row; the run still completes normally.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub rows: usize,
    pub files: Vec<DatasetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct IngestPipeline {
    config: IngestConfig,
    counties: CountyTable,
    store: DatasetStore,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, counties: CountyTable) -> Self {
        let store = DatasetStore::new(config.output_dir.clone());
        Self {
            config,
            counties,
            store,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Full ingestion: aggregate, write reports, and replace the dataset when
    /// any rows were produced.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let aggregation = self.aggregate(started_at).await?;
        let rows = aggregation.dataset.len();
        let malformed_rows = aggregation
            .files
            .iter()
            .map(|f| match f.outcome {
                FileOutcome::Ingested { malformed_rows, .. } => malformed_rows,
                _ => 0,
            })
            .sum();

        let reports_dir = self.config.output_dir.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let dataset_files = if aggregation.dataset.is_empty() {
            warn!(source_dir = %self.config.source_dir.display(), "ingestion produced no rows; dataset left untouched");
            Vec::new()
        } else {
            let stored = self.store.write_dataset(&aggregation.dataset).await?;
            self.write_manifest(&reports_dir, rows, &stored).await?;
            stored.iter().map(|f| f.path.display().to_string()).collect()
        };

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_dir: self.config.source_dir.display().to_string(),
            recency: self.config.recency,
            candidate_files: aggregation.files.len(),
            ingested_files: aggregation.count(|o| matches!(o, FileOutcome::Ingested { .. })),
            failed_files: aggregation.count(|o| matches!(o, FileOutcome::Failed { .. })),
            rows,
            malformed_rows,
            reports_dir: reports_dir.display().to_string(),
            dataset_files,
            files: aggregation.files,
        };
        self.write_reports(&reports_dir, &summary).await?;
        info!(
            run_id = %summary.run_id,
            files = summary.candidate_files,
            rows = summary.rows,
            failed = summary.failed_files,
            "ingestion run finished"
        );
        Ok(summary)
    }

    /// Walk the source directory and build the unified dataset in memory.
    ///
    /// Files are visited in file-name order. A file that cannot be read or
    /// parsed is recorded as failed and the walk continues; only an
    /// unreadable source directory fails the whole call.
    pub async fn aggregate(&self, now: DateTime<Utc>) -> Result<Aggregation> {
        let candidates = list_candidates(&self.config.source_dir).await?;
        let mut records: Vec<BidRecord> = Vec::new();
        let mut files = Vec::with_capacity(candidates.len());
        let mut seen: HashMap<String, String> = HashMap::new();

        for path in candidates {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let span = info_span!("ingest_file", file = %name);
            let (report, rows) = self
                .ingest_file(&path, name, now, &mut seen)
                .instrument(span)
                .await;
            records.extend(rows);
            files.push(report);
        }

        Ok(Aggregation {
            dataset: Dataset::new(records),
            files,
        })
    }

    async fn ingest_file(
        &self,
        path: &Path,
        name: String,
        now: DateTime<Utc>,
        seen: &mut HashMap<String, String>,
    ) -> (FileReport, Vec<BidRecord>) {
        let mut report = FileReport {
            file: name,
            letting_date: None,
            sha256: None,
            outcome: FileOutcome::UndatedName,
        };

        let Some(letting_date) = letting_date_from_file_name(&report.file) else {
            info!("skipping file without a date in its name");
            return (report, Vec::new());
        };
        report.letting_date = Some(letting_date);

        match self.within_cutoff(path, letting_date, now).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%letting_date, "skipping file outside recency window");
                report.outcome = FileOutcome::OutsideCutoff;
                return (report, Vec::new());
            }
            Err(err) => return fail(report, format!("{err:#}")),
        }

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => return fail(report, format!("reading file: {err}")),
        };
        let sha256 = sha256_hex(&bytes);
        report.sha256 = Some(sha256.clone());

        if self.config.skip_duplicates {
            if let Some(first) = seen.get(&sha256) {
                info!(of = %first, "skipping duplicate download");
                report.outcome = FileOutcome::Duplicate { of: first.clone() };
                return (report, Vec::new());
            }
        }

        match parse_source(&report.file, &bytes, letting_date, &self.counties) {
            Ok(parsed) => {
                seen.insert(sha256, report.file.clone());
                info!(rows = parsed.records.len(), malformed = parsed.malformed.len(), "ingested file");
                report.outcome = FileOutcome::Ingested {
                    rows: parsed.records.len(),
                    malformed_rows: parsed.malformed.len(),
                };
                (report, parsed.records)
            }
            Err(err) => fail(report, err.to_string()),
        }
    }

    async fn within_cutoff(&self, path: &Path, letting_date: NaiveDate, now: DateTime<Utc>) -> Result<bool> {
        let Some(cutoff) = self.config.recency else {
            return Ok(true);
        };
        match cutoff.basis {
            RecencyBasis::LettingDate => Ok(letting_date >= cutoff.earliest_letting_date(now.date_naive())),
            RecencyBasis::Modified => {
                let modified = fs::metadata(path)
                    .await
                    .and_then(|m| m.modified())
                    .with_context(|| format!("reading modification time of {}", path.display()))?;
                Ok(modified >= cutoff.earliest_modified(now.into()))
            }
        }
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &IngestRunSummary) -> Result<()> {
        let recency = match summary.recency {
            Some(RecencyCutoff { years, basis: RecencyBasis::LettingDate }) => {
                format!("{years} years by letting date")
            }
            Some(RecencyCutoff { years, basis: RecencyBasis::Modified }) => {
                format!("{years} years by modification time")
            }
            None => "none".to_string(),
        };
        let report = format!(
            "# Ingest Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Source dir: `{}`\n- Recency window: {}\n- Candidate files: {}\n- Ingested files: {}\n- Failed files: {}\n- Rows: {}\n- Malformed rows dropped: {}\n\n## Files\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.source_dir,
            recency,
            summary.candidate_files,
            summary.ingested_files,
            summary.failed_files,
            summary.rows,
            summary.malformed_rows,
            summary
                .files
                .iter()
                .map(|f| format!("- `{}`: {}", f.file, f.outcome.describe()))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("ingest_report.md"), report)
            .await
            .context("writing ingest_report.md")?;

        let json = serde_json::to_vec_pretty(summary).context("serializing ingest outcomes")?;
        fs::write(reports_dir.join("ingest_outcomes.json"), json)
            .await
            .context("writing ingest_outcomes.json")?;
        Ok(())
    }

    async fn write_manifest(&self, reports_dir: &Path, rows: usize, stored: &[StoredFile]) -> Result<()> {
        let manifest = DatasetManifest {
            schema_version: 1,
            rows,
            files: stored.iter().map(|f| manifest_entry(&self.config.output_dir, f)).collect(),
        };
        let manifest_path = reports_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing dataset manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))
    }
}

fn fail(mut report: FileReport, reason: String) -> (FileReport, Vec<BidRecord>) {
    warn!(file = %report.file, %reason, "source file failed; continuing with remaining files");
    report.outcome = FileOutcome::Failed { reason };
    (report, Vec::new())
}

fn manifest_entry(output_dir: &Path, file: &StoredFile) -> DatasetManifestFile {
    let rel = file.path.strip_prefix(output_dir).unwrap_or(&file.path);
    DatasetManifestFile {
        name: rel
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: rel.display().to_string(),
        sha256: file.sha256.clone(),
        bytes: file.bytes,
    }
}

async fn list_candidates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading source directory {}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
        if is_file && SourceFormat::from_path(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    IngestPipeline::new(IngestConfig::from_env(), CountyTable::michigan())
        .run_once()
        .await
}

fn read_run_summary(run_dir: &Path) -> Result<IngestRunSummary> {
    let path = run_dir.join("ingest_outcomes.json");
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Markdown digest of the most recent `runs` ingestion reports under
/// `<output_dir>/reports`.
pub fn report_runs_markdown(runs: usize, output_dir: &Path) -> Result<String> {
    let reports_root = output_dir.join("reports");
    let mut summaries = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| match read_run_summary(&entry.path()) {
            Ok(summary) => Some((entry.path(), summary)),
            Err(err) => {
                warn!(
                    run_dir = %entry.path().display(),
                    err = %format!("{err:#}"),
                    "skipping unreadable run report"
                );
                None
            }
        })
        .collect::<Vec<_>>();
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# Ingest Runs".to_string(), String::new()];
    for (dir, summary) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- files: {} candidate, {} ingested, {} failed",
            summary.candidate_files, summary.ingested_files, summary.failed_files
        ));
        lines.push(format!("- rows: {} ({} malformed dropped)", summary.rows, summary.malformed_rows));
        for failed in summary
            .files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed { .. }))
        {
            lines.push(format!("  - `{}`: {}", failed.file, failed.outcome.describe()));
        }
        let manifest_path = dir.join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- dataset manifest: `{}`", manifest_path.display()));
        } else {
            lines.push("- dataset: not written (no rows)".to_string());
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const HEADER: &str = "Proposal ID,Item Description,Unit,Quantity,Bid Price,Ext Amount,Vendor Name,Vend Rank\n";

    fn sheet(rows: &[&str]) -> String {
        let mut out = HEADER.to_string();
        for row in rows {
            out.push_str(row);
            out.push('\n');
        }
        out
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn pipeline(source: &Path, output: &Path, recency: Option<RecencyCutoff>) -> IngestPipeline {
        IngestPipeline::new(
            IngestConfig {
                source_dir: source.to_path_buf(),
                output_dir: output.to_path_buf(),
                recency,
                skip_duplicates: true,
            },
            CountyTable::michigan(),
        )
    }

    fn outcome_of<'a>(agg: &'a Aggregation, file: &str) -> &'a FileOutcome {
        &agg.files.iter().find(|f| f.file == file).unwrap().outcome
    }

    async fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).await.unwrap();
    }

    #[tokio::test]
    async fn dataset_size_is_sum_of_rows_from_eligible_files() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write(
            src.path(),
            "2024-03-01.csv",
            &sheet(&[
                "41001,Hand Patching,Ton,10,$5.00,50.00,Acme,1",
                "41001,Hand Patching,Ton,20,7.00,140.00,Beta,2",
            ]),
        )
        .await;
        write(
            src.path(),
            "2024-02-02.csv",
            &sheet(&[
                "82002,Curb and Gutter,Ft,\"1,200\",12.50,\"15,000.00\",Acme,1",
                "82002,Curb and Gutter,Ft,n/a,12.50,0,Beta,2",
            ]),
        )
        .await;
        write(src.path(), "2019-01-01.csv", &sheet(&["41001,Old Item,Ea,1,1,1,Acme,1"])).await;
        write(src.path(), "notes.csv", &sheet(&["41001,Undated,Ea,1,1,1,Acme,1"])).await;
        write(src.path(), "2024-04-04.xlsx", "<html><body>An Error Occurred</body></html>").await;
        write(src.path(), "readme.txt", "not a source").await;

        let cutoff = RecencyCutoff {
            years: 2,
            basis: RecencyBasis::LettingDate,
        };
        let agg = pipeline(src.path(), out.path(), Some(cutoff)).aggregate(now()).await.unwrap();

        assert_eq!(agg.files.len(), 5);
        assert_eq!(
            agg.files.iter().map(|f| f.file.as_str()).collect::<Vec<_>>(),
            vec!["2019-01-01.csv", "2024-02-02.csv", "2024-03-01.csv", "2024-04-04.xlsx", "notes.csv"]
        );
        assert_eq!(outcome_of(&agg, "2019-01-01.csv"), &FileOutcome::OutsideCutoff);
        assert_eq!(outcome_of(&agg, "notes.csv"), &FileOutcome::UndatedName);
        assert!(matches!(outcome_of(&agg, "2024-04-04.xlsx"), FileOutcome::Failed { .. }));
        assert_eq!(
            outcome_of(&agg, "2024-02-02.csv"),
            &FileOutcome::Ingested {
                rows: 1,
                malformed_rows: 1
            }
        );

        let expected: usize = agg.files.iter().map(|f| f.outcome.rows()).sum();
        assert_eq!(agg.dataset.len(), expected);
        assert_eq!(agg.dataset.len(), 3);

        let curb = agg
            .dataset
            .records()
            .iter()
            .find(|r| r.item_description == "Curb and Gutter")
            .unwrap();
        assert_eq!(curb.quantity, 1200.0);
        assert_eq!(curb.letting_date, NaiveDate::from_ymd_opt(2024, 2, 2).unwrap());
        assert_eq!(curb.source_file, "2024-02-02.csv");
        assert_eq!(curb.county.as_deref(), Some("Wayne"));
    }

    #[tokio::test]
    async fn duplicate_content_is_ingested_once() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let body = sheet(&["41001,Hand Patching,Ton,10,5,50,Acme,1"]);
        write(src.path(), "2024-03-01.csv", &body).await;
        write(src.path(), "2024-03-01_1.csv", &body).await;

        let agg = pipeline(src.path(), out.path(), None).aggregate(now()).await.unwrap();
        assert_eq!(agg.dataset.len(), 1);
        assert_eq!(
            outcome_of(&agg, "2024-03-01_1.csv"),
            &FileOutcome::Duplicate {
                of: "2024-03-01.csv".to_string()
            }
        );
    }

    #[tokio::test]
    async fn modified_basis_uses_file_mtime_not_name() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write(src.path(), "2024-03-01.csv", &sheet(&["41001,Fresh,Ea,1,1,1,Acme,1"])).await;
        write(src.path(), "2024-03-02.csv", &sheet(&["41001,Stale,Ea,1,1,1,Acme,1"])).await;

        let stale = std::fs::File::options()
            .write(true)
            .open(src.path().join("2024-03-02.csv"))
            .unwrap();
        let three_years_ago: SystemTime = (now() - chrono::Duration::days(3 * 365)).into();
        stale.set_modified(three_years_ago).unwrap();
        let fresh = std::fs::File::options()
            .write(true)
            .open(src.path().join("2024-03-01.csv"))
            .unwrap();
        fresh.set_modified(now().into()).unwrap();

        let cutoff = RecencyCutoff {
            years: 1,
            basis: RecencyBasis::Modified,
        };
        let agg = pipeline(src.path(), out.path(), Some(cutoff)).aggregate(now()).await.unwrap();
        assert_eq!(outcome_of(&agg, "2024-03-02.csv"), &FileOutcome::OutsideCutoff);
        assert_eq!(agg.dataset.len(), 1);
        assert_eq!(agg.dataset.records()[0].item_description, "Fresh");
    }

    #[test]
    fn letting_date_cutoff_counts_calendar_years() {
        let cutoff = RecencyCutoff {
            years: 2,
            basis: RecencyBasis::LettingDate,
        };
        assert_eq!(
            cutoff.earliest_letting_date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()),
            NaiveDate::from_ymd_opt(2022, 6, 1).unwrap()
        );
        assert_eq!("modified".parse::<RecencyBasis>(), Ok(RecencyBasis::Modified));
        assert!("yesterday".parse::<RecencyBasis>().is_err());
    }

    #[test]
    fn recency_years_ignores_values_that_are_not_whole_years() {
        assert_eq!(recency_years(Some("3".into())), Some(3));
        assert_eq!(recency_years(Some(" 2 ".into())), Some(2));
        assert_eq!(recency_years(Some("three".into())), None);
        assert_eq!(recency_years(Some("-1".into())), None);
        assert_eq!(recency_years(None), None);
    }

    #[tokio::test]
    async fn run_once_writes_dataset_reports_and_manifest() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write(
            src.path(),
            "2024-03-01.csv",
            &sheet(&["41001,Hand Patching,Ton,10,5,50,Acme,1"]),
        )
        .await;
        write(src.path(), "2024-03-08.csv", "garbage without a header\n").await;

        let summary = pipeline(src.path(), out.path(), None).run_once().await.unwrap();
        assert!(!summary.is_empty());
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.ingested_files, 1);
        assert_eq!(summary.failed_files, 1);
        assert_eq!(summary.dataset_files.len(), 2);

        let store = DatasetStore::new(out.path());
        assert_eq!(store.load().unwrap().len(), 1);

        let reports = PathBuf::from(&summary.reports_dir);
        let md = std::fs::read_to_string(reports.join("ingest_report.md")).unwrap();
        assert!(md.contains("`2024-03-08.csv`: failed"));
        assert!(reports.join("ingest_outcomes.json").exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(reports.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["rows"], 1);
        assert_eq!(manifest["files"].as_array().unwrap().len(), 2);

        let digest = report_runs_markdown(5, out.path()).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("`2024-03-08.csv`: failed"));
    }

    #[tokio::test]
    async fn interrupted_run_directories_are_left_out_of_the_digest() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write(
            src.path(),
            "2024-03-01.csv",
            &sheet(&["41001,Hand Patching,Ton,10,5,50,Acme,1"]),
        )
        .await;
        let summary = pipeline(src.path(), out.path(), None).run_once().await.unwrap();

        let reports = out.path().join("reports");
        std::fs::create_dir_all(reports.join(Uuid::new_v4().to_string())).unwrap();
        let corrupt = reports.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&corrupt).unwrap();
        std::fs::write(corrupt.join("ingest_outcomes.json"), "{ not json").unwrap();

        let digest = report_runs_markdown(5, out.path()).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert_eq!(digest.matches("## Run").count(), 1);
    }

    #[tokio::test]
    async fn empty_run_is_reported_without_writing_a_dataset() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write(src.path(), "undated.csv", &sheet(&["41001,X,Ea,1,1,1,Acme,1"])).await;

        let summary = pipeline(src.path(), out.path(), None).run_once().await.unwrap();
        assert!(summary.is_empty());
        assert!(summary.dataset_files.is_empty());
        assert!(!DatasetStore::new(out.path()).parquet_path().exists());
        assert!(report_runs_markdown(1, out.path()).unwrap().contains("not written"));
    }

    #[tokio::test]
    async fn missing_source_dir_fails_the_run() {
        let out = TempDir::new().unwrap();
        let missing = out.path().join("nope");
        assert!(pipeline(&missing, out.path(), None).run_once().await.is_err());
    }
}
