use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub date: NaiveDate,
    pub cohort: String,
    pub stage: String,
    pub count: u64,
    pub channel: Option<String>,
    pub segment: Option<String>,
}

/// One stage of one cohort's funnel. `None` rates mean the prior stage had no
/// events, which is not the same as a 0% conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelRow {
    pub cohort: String,
    pub stage: String,
    pub count: u64,
    pub conversion_rate_from_prior_stage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftRow {
    pub stage: String,
    pub control_rate: Option<f64>,
    pub test_rate: Option<f64>,
    pub absolute_lift: Option<f64>,
    pub relative_lift: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub date: NaiveDate,
    pub metric_value: Option<f64>,
    pub rolling_mean: Option<f64>,
    pub rolling_stddev: Option<f64>,
    pub z_score: Option<f64>,
    pub is_anomaly: bool,
}

/// A stage with more events than the stage before it in the same cohort. Its
/// conversion rate is above 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageIncrease {
    pub cohort: String,
    pub stage: String,
    pub prior_stage: String,
    pub count: u64,
    pub prior_count: u64,
}

/// Last-stage over first-stage conversion for a single cohort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortConversion {
    pub cohort: String,
    pub first_stage_count: u64,
    pub last_stage_count: u64,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStageCounts {
    pub date: NaiveDate,
    /// Counts in configured stage order.
    pub counts: Vec<u64>,
}

impl DailyStageCounts {
    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .fold(0u64, |total, count| total.saturating_add(*count))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIssue {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub rows_read: usize,
    pub rows_accepted: usize,
    pub rows_skipped: usize,
    pub issues: Vec<RowIssue>,
    /// Unknown stage name and how many rows carried it.
    pub unknown_stages: Vec<(String, usize)>,
}

impl IngestSummary {
    pub fn unknown_stage_rows(&self) -> usize {
        self.unknown_stages.iter().map(|(_, count)| count).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.rows_skipped == 0 && self.unknown_stages.is_empty()
    }
}
