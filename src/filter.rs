use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::EventRecord;

/// Dashboard-style restriction of a dataset. `None`, an empty string and
/// `"all"` all mean "no restriction"; dates are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub cohort: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub end_date: Option<NaiveDate>,
}

/// Browsers submit empty date inputs as `start_date=`.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn selected(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty() && value != "all")
}

fn matches_dimension(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted {
        Some(wanted) => actual == Some(wanted.as_str()),
        None => true,
    }
}

impl EventFilter {
    pub fn is_empty(&self) -> bool {
        selected(&self.cohort).is_none()
            && selected(&self.channel).is_none()
            && selected(&self.segment).is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        let cohort = selected(&self.cohort);
        let channel = selected(&self.channel);
        let segment = selected(&self.segment);

        matches_dimension(&cohort, Some(record.cohort.as_str()))
            && matches_dimension(&channel, record.channel.as_deref())
            && matches_dimension(&segment, record.segment.as_deref())
            && self.start_date.map_or(true, |start| record.date >= start)
            && self.end_date.map_or(true, |end| record.date <= end)
    }

    pub fn apply(&self, records: &[EventRecord]) -> Vec<EventRecord> {
        records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect()
    }

    /// Short human-readable label, used in report headers.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for (name, value) in [
            ("cohort", selected(&self.cohort)),
            ("channel", selected(&self.channel)),
            ("segment", selected(&self.segment)),
        ] {
            if let Some(value) = value {
                parts.push(format!("{name}={value}"));
            }
        }
        if let Some(start) = self.start_date {
            parts.push(format!("from {start}"));
        }
        if let Some(end) = self.end_date {
            parts.push(format!("to {end}"));
        }
        if parts.is_empty() {
            "all events".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Distinct values available for each filter drop-down.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub cohorts: Vec<String>,
    pub channels: Vec<String>,
    pub segments: Vec<String>,
}

impl FilterOptions {
    pub fn from_records(records: &[EventRecord]) -> Self {
        fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
            let mut values: Vec<String> = values.map(String::from).collect();
            values.sort();
            values.dedup();
            values
        }

        Self {
            cohorts: distinct(records.iter().map(|record| record.cohort.as_str())),
            channels: distinct(records.iter().filter_map(|record| record.channel.as_deref())),
            segments: distinct(records.iter().filter_map(|record| record.segment.as_deref())),
        }
    }
}
