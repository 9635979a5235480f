use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use bidlet_core::CountyTable;
use bidlet_query::{load_filter_file, AllowList, DateRange, FilterSpec, QuantityRange, QueryEngine};
use bidlet_search::{DocumentSearch, LopdfPageSource, TermMatcher};
use bidlet_storage::{convert_csv_to_parquet, load_dataset};
use bidlet_sync::{report_runs_markdown, IngestConfig, IngestPipeline, RecencyBasis, RecencyCutoff};
use bidlet_web::WebConfig;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidlet")]
#[command(about = "Bid letting price explorer: ingest, query and search letting documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the unified dataset from the source directory.
    Ingest(IngestArgs),
    /// Filter the dataset and print matching bids with price statistics.
    Query(QueryArgs),
    /// Find PDF pages containing every search term.
    Search(SearchArgs),
    /// Look up county codes.
    Counties {
        /// Print only the code for this county name.
        #[arg(long)]
        name: Option<String>,
        /// Print only the county for this proposal id.
        #[arg(long)]
        proposal: Option<String>,
    },
    /// Convert a CSV dataset export to Parquet.
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Summarize recent ingestion runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Serve the JSON query API.
    Serve {
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long)]
        allow_list: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    source_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Skip files older than this many years.
    #[arg(long)]
    recency_years: Option<u32>,
    /// Measure recency by `letting-date` (from the file name) or `modified`.
    #[arg(long)]
    recency_basis: Option<RecencyBasis>,
    /// Ingest files even when their content repeats an earlier file.
    #[arg(long)]
    keep_duplicates: bool,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    allow_list: Option<PathBuf>,
    /// YAML or JSON filter file; flags below override its fields.
    #[arg(long)]
    filter: Option<PathBuf>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    contains: Option<String>,
    #[arg(long)]
    min_qty: Option<f64>,
    #[arg(long)]
    max_qty: Option<f64>,
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long)]
    lowest_only: bool,
    #[arg(long = "county")]
    counties: Vec<String>,
    /// Keep only proposals on the allow list.
    #[arg(long)]
    allow_listed: bool,
    /// Maximum rows to print (summary always covers every match).
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    dir: PathBuf,
    /// Only documents modified within this many years.
    #[arg(long, default_value_t = 1)]
    years: u32,
    #[arg(long = "term", required = true)]
    terms: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest(args) => ingest(args).await?,
        Commands::Query(args) => query(args)?,
        Commands::Search(args) => search(args)?,
        Commands::Counties { name, proposal } => counties(name, proposal)?,
        Commands::Convert { input, output } => {
            let stored = convert_csv_to_parquet(&input, &output).await?;
            println!(
                "converted {} -> {} ({} bytes, sha256 {})",
                input.display(),
                stored.path.display(),
                stored.bytes,
                stored.sha256
            );
        }
        Commands::Report { runs, output_dir } => {
            let output_dir = output_dir.unwrap_or_else(|| IngestConfig::from_env().output_dir);
            println!("{}", report_runs_markdown(runs, &output_dir)?);
        }
        Commands::Serve {
            dataset,
            allow_list,
            port,
        } => {
            let mut config = WebConfig::from_env();
            if let Some(dataset) = dataset {
                config.dataset_path = dataset;
            }
            if let Some(allow_list) = allow_list {
                config.allow_list_path = allow_list;
            }
            if let Some(port) = port {
                config.port = port;
            }
            bidlet_web::serve(config).await?;
        }
    }

    Ok(())
}

async fn ingest(args: IngestArgs) -> Result<()> {
    let mut config = IngestConfig::from_env();
    if let Some(dir) = args.source_dir {
        config.source_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    match (args.recency_years, args.recency_basis, config.recency) {
        (Some(years), basis, current) => {
            config.recency = Some(RecencyCutoff {
                years,
                basis: basis.or(current.map(|c| c.basis)).unwrap_or_default(),
            });
        }
        (None, Some(basis), Some(current)) => {
            config.recency = Some(RecencyCutoff { basis, ..current });
        }
        (None, Some(_), None) => bail!("--recency-basis needs --recency-years or BIDLET_RECENCY_YEARS"),
        (None, None, _) => {}
    }
    if args.keep_duplicates {
        config.skip_duplicates = false;
    }

    let summary = IngestPipeline::new(config, CountyTable::michigan()).run_once().await?;
    if summary.is_empty() {
        println!(
            "ingest finished with no rows: run_id={} files={} reports={}",
            summary.run_id, summary.candidate_files, summary.reports_dir
        );
    } else {
        println!(
            "ingest complete: run_id={} files={} ingested={} failed={} rows={} reports={}",
            summary.run_id,
            summary.candidate_files,
            summary.ingested_files,
            summary.failed_files,
            summary.rows,
            summary.reports_dir
        );
    }
    Ok(())
}

fn query(args: QueryArgs) -> Result<()> {
    let web = WebConfig::from_env();
    let dataset_path = args.dataset.clone().unwrap_or(web.dataset_path);
    let allow_list_path = args.allow_list.clone().unwrap_or(web.allow_list_path);
    let dataset = load_dataset(&dataset_path)
        .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
    let engine = QueryEngine::new(
        dataset,
        CountyTable::michigan(),
        AllowList::load_or_empty(&allow_list_path),
    );

    let spec = filter_from_args(&args, &engine)?;
    let result = engine.execute(&spec);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let Some(summary) = result.summary else {
        println!("no matching bids");
        return Ok(());
    };

    for r in result.records.iter().take(args.limit) {
        println!(
            "{}\t{}\t{}\t{} {}\t${:.2}\t{}\trank {}\t{}",
            r.letting_date,
            r.proposal_id,
            r.item_description,
            r.quantity,
            r.unit,
            r.bid_price,
            r.vendor_name,
            r.vend_rank,
            r.county.as_deref().unwrap_or("-")
        );
    }
    if result.len() > args.limit {
        println!("... {} more", result.len() - args.limit);
    }
    println!();
    println!("matching bids: {}", summary.count);
    println!("average unit price: ${:.2}", summary.mean);
    match summary.weighted_mean {
        Some(w) => println!("weighted average unit price: ${w:.2}"),
        None => println!("weighted average unit price: n/a (total quantity is zero)"),
    }
    println!("min unit price: ${:.2}", summary.min);
    println!("max unit price: ${:.2}", summary.max);
    Ok(())
}

fn filter_from_args(args: &QueryArgs, engine: &QueryEngine) -> Result<FilterSpec> {
    let mut spec = match &args.filter {
        Some(path) => load_filter_file(path)?,
        None => FilterSpec::default(),
    };
    if args.description.is_some() {
        spec.description_filter.exact = args.description.clone();
    }
    if args.contains.is_some() {
        spec.description_filter.contains = args.contains.clone();
    }
    if args.min_qty.is_some() || args.max_qty.is_some() {
        let defaults = spec
            .quantity_range
            .or_else(|| engine.quantity_bounds(&spec.description_filter))
            .unwrap_or(QuantityRange {
                min: 0.0,
                max: f64::MAX,
            });
        spec.quantity_range = Some(QuantityRange {
            min: args.min_qty.unwrap_or(defaults.min),
            max: args.max_qty.unwrap_or(defaults.max),
        });
    }
    if args.from.is_some() || args.to.is_some() {
        let Some(span) = spec.letting_date_range.or_else(|| engine.date_span()) else {
            bail!("dataset is empty; no letting dates to bound");
        };
        spec.letting_date_range = Some(DateRange {
            start: args.from.unwrap_or(span.start),
            end: args.to.unwrap_or(span.end),
        });
    }
    if args.lowest_only {
        spec.lowest_bidder_only = true;
    }
    if !args.counties.is_empty() {
        spec.county_filter = Some(args.counties.iter().cloned().collect::<BTreeSet<_>>());
    }
    if args.allow_listed {
        spec.allow_list_filter = true;
    }
    Ok(spec)
}

fn search(args: SearchArgs) -> Result<()> {
    let matcher = TermMatcher::new(&args.terms)?;
    let report = DocumentSearch::new(&args.dir, args.years, matcher).run(&LopdfPageSource, SystemTime::now())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let terms = args.terms.join("', '");
    for hit in &report.hits {
        println!("'{terms}' found in {}, page {}", hit.path.display(), hit.page);
    }
    for failure in &report.failures {
        eprintln!("skipped {}: {}", failure.path.display(), failure.reason);
    }
    println!(
        "{} matching pages in {} documents ({} older than {} years)",
        report.hits.len(),
        report.scanned_documents,
        report.stale_documents,
        args.years
    );
    Ok(())
}

fn counties(name: Option<String>, proposal: Option<String>) -> Result<()> {
    let table = CountyTable::michigan();
    match (name, proposal) {
        (Some(name), _) => match table.code_for(&name) {
            Some(code) => println!("{code}"),
            None => bail!("unknown county `{name}`"),
        },
        (None, Some(proposal)) => match table.decode(&proposal) {
            Some(county) => println!("{county}"),
            None => bail!("proposal `{proposal}` has no mapped county code"),
        },
        (None, None) => {
            for (code, county) in table.iter() {
                println!("{code:02}\t{county}");
            }
        }
    }
    Ok(())
}
