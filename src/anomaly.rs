//! Daily z-score anomaly flags.

use crate::config::AnomalyMetric;
use crate::funnel::ratio;
use crate::models::{AnomalyRow, DailyStageCounts};

pub fn metric_value(day: &DailyStageCounts, metric: AnomalyMetric) -> Option<f64> {
    match metric {
        AnomalyMetric::TotalCount => Some(day.total() as f64),
        AnomalyMetric::OverallConversion => {
            let first = day.counts.first().copied().unwrap_or(0);
            let last = day.counts.last().copied().unwrap_or(0);
            ratio(last, first)
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample (n - 1) standard deviation; needs at least two values.
pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mu = mean(values)?;
    let sum_sq: f64 = values.iter().map(|value| (value - mu).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

pub fn z_score(value: f64, mean: f64, stddev: f64) -> Option<f64> {
    if stddev > 0.0 {
        Some((value - mean) / stddev)
    } else {
        None
    }
}

/// Scores every day against the mean and spread of the whole series. Days
/// whose metric is undefined keep a row but are never flagged, and a flat
/// series (zero spread) flags nothing.
pub fn detect_anomalies(
    daily: &[DailyStageCounts],
    metric: AnomalyMetric,
    threshold: f64,
) -> Vec<AnomalyRow> {
    let values: Vec<Option<f64>> = daily.iter().map(|day| metric_value(day, metric)).collect();
    let defined: Vec<f64> = values.iter().flatten().copied().collect();

    let rolling_mean = mean(&defined);
    let rolling_stddev = sample_stddev(&defined);

    daily
        .iter()
        .zip(values)
        .map(|(day, metric_value)| {
            let z = match (metric_value, rolling_mean, rolling_stddev) {
                (Some(value), Some(mu), Some(sd)) => z_score(value, mu, sd),
                _ => None,
            };
            AnomalyRow {
                date: day.date,
                metric_value,
                rolling_mean,
                rolling_stddev,
                z_score: z,
                is_anomaly: z.is_some_and(|z| z.abs() > threshold),
            }
        })
        .collect()
}
