use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::models::{EventRecord, IngestSummary, RowIssue};

pub const REQUIRED_COLUMNS: [&str; 4] = ["date", "cohort", "stage", "count"];

/// Only the first few bad rows are itemized; the rest are only counted.
const MAX_REPORTED_ISSUES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Ingested {
    pub records: Vec<EventRecord>,
    pub summary: IngestSummary,
}

struct ColumnMap {
    date: usize,
    cohort: usize,
    stage: usize,
    count: usize,
    channel: Option<usize>,
    segment: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, IngestError> {
        let names: Vec<String> = headers
            .iter()
            .map(|header| canonical_header(header).to_string())
            .collect();
        let find = |name: &str| names.iter().position(|header| header == name);

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|&&name| find(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::MissingColumns(missing));
        }

        Ok(Self {
            date: find("date").unwrap_or_default(),
            cohort: find("cohort").unwrap_or_default(),
            stage: find("stage").unwrap_or_default(),
            count: find("count").unwrap_or_default(),
            channel: find("channel"),
            segment: find("segment"),
        })
    }
}

fn canonical_header(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('\u{feff}').to_lowercase();
    match name.as_str() {
        "variant" => "cohort".to_string(),
        "step" => "stage".to_string(),
        _ => name,
    }
}

pub fn read_events_from_path(path: &Path, stages: &[String]) -> Result<Ingested, IngestError> {
    let file = std::fs::File::open(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    read_events(file, stages)
}

/// Parses funnel events from CSV. Structural problems (missing columns, I/O)
/// fail the whole read; bad rows are skipped and reported in the summary.
pub fn read_events<R: io::Read>(reader: R, stages: &[String]) -> Result<Ingested, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns = ColumnMap::from_headers(reader.headers()?)?;
    let mut ingested = Ingested::default();
    let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
    // Every aggregate is a sum over a subset of accepted rows, so keeping the
    // grand total within u64 keeps every per-cohort and per-day sum within it.
    let mut accepted_total: u64 = 0;

    for result in reader.records() {
        ingested.summary.rows_read += 1;
        let record = match result {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                let line = err.position().map(|pos| pos.line()).unwrap_or_default();
                skip_row(&mut ingested.summary, line, err.to_string());
                continue;
            }
        };
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();

        match parse_row(&record, &columns) {
            Ok(event) => {
                if stages.iter().any(|stage| *stage == event.stage) {
                    match accepted_total.checked_add(event.count) {
                        Some(total) => {
                            accepted_total = total;
                            ingested.records.push(event);
                            ingested.summary.rows_accepted += 1;
                        }
                        None => skip_row(
                            &mut ingested.summary,
                            line,
                            format!("count {} overflows the dataset total", event.count),
                        ),
                    }
                } else {
                    *unknown.entry(event.stage).or_insert(0) += 1;
                }
            }
            Err(reason) => skip_row(&mut ingested.summary, line, reason),
        }
    }

    ingested.summary.unknown_stages = unknown.into_iter().collect();

    if ingested.summary.rows_skipped > 0 {
        warn!(
            skipped = ingested.summary.rows_skipped,
            read = ingested.summary.rows_read,
            "skipped malformed rows"
        );
    }
    if !ingested.summary.unknown_stages.is_empty() {
        warn!(
            rows = ingested.summary.unknown_stage_rows(),
            "dropped rows with unknown stages"
        );
    }
    debug!(accepted = ingested.summary.rows_accepted, "ingest finished");

    Ok(ingested)
}

fn skip_row(summary: &mut IngestSummary, line: u64, reason: String) {
    summary.rows_skipped += 1;
    if summary.issues.len() < MAX_REPORTED_ISSUES {
        summary.issues.push(RowIssue { line, reason });
    }
}

fn parse_row(record: &csv::StringRecord, columns: &ColumnMap) -> Result<EventRecord, String> {
    let field = |idx: usize| record.get(idx).unwrap_or("");

    let raw_date = field(columns.date);
    let date = parse_date(raw_date).ok_or_else(|| format!("unparseable date \"{raw_date}\""))?;

    let cohort = field(columns.cohort).to_lowercase();
    if cohort.is_empty() {
        return Err("blank cohort".to_string());
    }
    let stage = field(columns.stage).to_lowercase();
    if stage.is_empty() {
        return Err("blank stage".to_string());
    }

    let count = parse_count(field(columns.count))?;

    Ok(EventRecord {
        date,
        cohort,
        stage,
        count,
        channel: optional_dimension(record, columns.channel),
        segment: optional_dimension(record, columns.segment),
    })
}

fn optional_dimension(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|idx| record.get(idx))
        .map(str::to_lowercase)
        .filter(|value| !value.is_empty())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y/%m/%d") {
        return Some(date);
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(datetime.date());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|datetime| datetime.date_naive())
}

fn parse_count(raw: &str) -> Result<u64, String> {
    if let Ok(count) = raw.parse::<u64>() {
        return Ok(count);
    }
    match raw.parse::<f64>() {
        Ok(value) if value < 0.0 => Err(format!("negative count {raw}")),
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value <= u64::MAX as f64 => {
            Ok(value as u64)
        }
        Ok(_) => Err(format!("count {raw} is not a whole number")),
        Err(_) if raw.is_empty() => Err("missing count".to_string()),
        Err(_) => Err(format!("non-numeric count \"{raw}\"")),
    }
}
