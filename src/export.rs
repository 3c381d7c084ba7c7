//! CSV export of the derived tables. Headers are the row field names and
//! undefined values are written as empty cells.

use std::io;

use serde::Serialize;

use crate::models::{AnomalyRow, FunnelRow, LiftRow};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush CSV output: {0}")]
    Io(#[from] io::Error),
    #[error("exported CSV is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Which table to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Table {
    Funnel,
    Lift,
    Anomalies,
}

impl Table {
    pub fn download_name(self) -> &'static str {
        match self {
            Table::Funnel => "funnel_summary.csv",
            Table::Lift => "lift_summary.csv",
            Table::Anomalies => "daily_anomalies.csv",
        }
    }
}

fn write_rows<W: io::Write, T: Serialize>(
    writer: W,
    rows: &[T],
    headers: &[&str],
) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        // serde only emits a header alongside the first row
        writer.write_record(headers)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn rows_to_string<T: Serialize>(rows: &[T], headers: &[&str]) -> Result<String, ExportError> {
    let mut buffer = Vec::new();
    write_rows(&mut buffer, rows, headers)?;
    Ok(String::from_utf8(buffer)?)
}

pub const FUNNEL_HEADERS: [&str; 4] = [
    "cohort",
    "stage",
    "count",
    "conversion_rate_from_prior_stage",
];

pub const LIFT_HEADERS: [&str; 5] = [
    "stage",
    "control_rate",
    "test_rate",
    "absolute_lift",
    "relative_lift",
];

pub const ANOMALY_HEADERS: [&str; 6] = [
    "date",
    "metric_value",
    "rolling_mean",
    "rolling_stddev",
    "z_score",
    "is_anomaly",
];

pub fn write_funnel_csv<W: io::Write>(writer: W, rows: &[FunnelRow]) -> Result<(), ExportError> {
    write_rows(writer, rows, &FUNNEL_HEADERS)
}

pub fn write_lift_csv<W: io::Write>(writer: W, rows: &[LiftRow]) -> Result<(), ExportError> {
    write_rows(writer, rows, &LIFT_HEADERS)
}

pub fn write_anomalies_csv<W: io::Write>(
    writer: W,
    rows: &[AnomalyRow],
) -> Result<(), ExportError> {
    write_rows(writer, rows, &ANOMALY_HEADERS)
}

pub fn funnel_to_string(rows: &[FunnelRow]) -> Result<String, ExportError> {
    rows_to_string(rows, &FUNNEL_HEADERS)
}

pub fn lift_to_string(rows: &[LiftRow]) -> Result<String, ExportError> {
    rows_to_string(rows, &LIFT_HEADERS)
}

pub fn anomalies_to_string(rows: &[AnomalyRow]) -> Result<String, ExportError> {
    rows_to_string(rows, &ANOMALY_HEADERS)
}

#[cfg(test)]
fn read_rows<R: io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<Vec<T>, csv::Error> {
    csv::Reader::from_reader(reader).deserialize().collect()
}

#[cfg(test)]
pub fn read_funnel_csv<R: io::Read>(reader: R) -> Result<Vec<FunnelRow>, csv::Error> {
    read_rows(reader)
}

#[cfg(test)]
pub fn read_lift_csv<R: io::Read>(reader: R) -> Result<Vec<LiftRow>, csv::Error> {
    read_rows(reader)
}
