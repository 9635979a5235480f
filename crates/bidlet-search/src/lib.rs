//! Whole-word, all-terms page search over a directory of bid advertisement PDFs.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

pub const CRATE_NAME: &str = "bidlet-search";

const SECONDS_PER_YEAR: u64 = 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no search terms given")]
    NoTerms,
    #[error("invalid search term `{term}`: {source}")]
    Pattern {
        term: String,
        #[source]
        source: regex::Error,
    },
    #[error("{} is not a readable PDF: {reason}", .path.display())]
    UnreadableDocument { path: PathBuf, reason: String },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Case-insensitive whole-word matcher requiring every term on the same text.
#[derive(Debug, Clone)]
pub struct TermMatcher {
    terms: Vec<(String, Regex)>,
}

impl TermMatcher {
    pub fn new<S: AsRef<str>>(terms: &[S]) -> Result<Self, SearchError> {
        let terms = terms
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .map(|term| {
                RegexBuilder::new(&format!(r"\b{}\b", regex::escape(term)))
                    .case_insensitive(true)
                    .build()
                    .map(|re| (term.to_string(), re))
                    .map_err(|source| SearchError::Pattern {
                        term: term.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if terms.is_empty() {
            return Err(SearchError::NoTerms);
        }
        Ok(Self { terms })
    }

    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(t, _)| t.as_str())
    }

    pub fn matches_all(&self, text: &str) -> bool {
        self.terms.iter().all(|(_, re)| re.is_match(text))
    }
}

/// Per-page text of one document, pages numbered from 1.
pub trait PageSource {
    fn pages(&self, path: &Path) -> Result<Vec<(u32, String)>, SearchError>;
}

/// Text extraction through `lopdf`. A page whose text cannot be extracted is
/// skipped with a warning; a file that does not load as a PDF is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfPageSource;

impl PageSource for LopdfPageSource {
    fn pages(&self, path: &Path) -> Result<Vec<(u32, String)>, SearchError> {
        let doc = lopdf::Document::load(path).map_err(|err| SearchError::UnreadableDocument {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let mut pages = Vec::new();
        for page_no in doc.get_pages().into_keys() {
            match doc.extract_text(&[page_no]) {
                Ok(text) => pages.push((page_no, text)),
                Err(err) => warn!(path = %path.display(), page = page_no, %err, "skipping page without extractable text"),
            }
        }
        Ok(pages)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageHit {
    pub path: PathBuf,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchReport {
    pub hits: Vec<PageHit>,
    pub scanned_documents: usize,
    pub stale_documents: usize,
    pub failures: Vec<DocumentFailure>,
}

/// A search over `dir` for PDFs modified within the last `years` 365-day years.
#[derive(Debug, Clone)]
pub struct DocumentSearch {
    dir: PathBuf,
    years: u32,
    matcher: TermMatcher,
}

impl DocumentSearch {
    pub fn new(dir: impl Into<PathBuf>, years: u32, matcher: TermMatcher) -> Self {
        Self {
            dir: dir.into(),
            years,
            matcher,
        }
    }

    pub fn modified_after(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(Duration::from_secs(u64::from(self.years) * SECONDS_PER_YEAR))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Scan documents in file-name order and report every page on which all
    /// terms occur. Only an unreadable directory fails the whole scan.
    pub fn run(&self, source: &dyn PageSource, now: SystemTime) -> Result<SearchReport, SearchError> {
        let cutoff = self.modified_after(now);
        let mut report = SearchReport::default();

        for path in list_documents(&self.dir)? {
            let fresh = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|modified| modified > cutoff);
            match fresh {
                Ok(true) => {}
                Ok(false) => {
                    report.stale_documents += 1;
                    continue;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "cannot read modification time");
                    report.failures.push(DocumentFailure {
                        reason: err.to_string(),
                        path,
                    });
                    continue;
                }
            }

            let _span = info_span!("search_document", path = %path.display()).entered();
            report.scanned_documents += 1;
            match source.pages(&path) {
                Ok(pages) => {
                    let before = report.hits.len();
                    for (page, text) in pages {
                        if self.matcher.matches_all(&text) {
                            report.hits.push(PageHit {
                                path: path.clone(),
                                page,
                            });
                        }
                    }
                    debug!(hits = report.hits.len() - before, "document scanned");
                }
                Err(err) => {
                    warn!(%err, "skipping document");
                    report.failures.push(DocumentFailure {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            scanned = report.scanned_documents,
            hits = report.hits.len(),
            failures = report.failures.len(),
            "document search finished"
        );
        Ok(report)
    }
}

fn list_documents(dir: &Path) -> Result<Vec<PathBuf>, SearchError> {
    let io_err = |source| SearchError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
