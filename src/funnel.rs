use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::config::AnalyzerSettings;
use crate::models::{
    CohortConversion, DailyStageCounts, EventRecord, FunnelRow, LiftRow, StageIncrease,
};

/// `numerator / denominator`, or `None` when the denominator is zero.
pub fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

/// Control first, test second, every other cohort alphabetically.
pub fn ordered_cohorts(records: &[EventRecord], settings: &AnalyzerSettings) -> Vec<String> {
    let mut others: Vec<String> = records
        .iter()
        .map(|record| record.cohort.clone())
        .filter(|cohort| *cohort != settings.control_label && *cohort != settings.test_label)
        .collect();
    others.sort();
    others.dedup();

    let mut cohorts = Vec::with_capacity(others.len() + 2);
    for label in [&settings.control_label, &settings.test_label] {
        if records.iter().any(|record| record.cohort == *label) {
            cohorts.push(label.clone());
        }
    }
    cohorts.extend(others);
    cohorts
}

fn stage_totals(records: &[EventRecord], stages: &[String]) -> HashMap<String, Vec<u64>> {
    let index: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(idx, stage)| (stage.as_str(), idx))
        .collect();

    let mut totals: HashMap<String, Vec<u64>> = HashMap::new();
    for record in records {
        let Some(&idx) = index.get(record.stage.as_str()) else {
            continue;
        };
        let entry = totals
            .entry(record.cohort.clone())
            .or_insert_with(|| vec![0; stages.len()]);
        // ingest keeps the grand total within u64
        entry[idx] = entry[idx].saturating_add(record.count);
    }
    totals
}

/// Per-cohort stage counts with stage-to-stage conversion. The first stage
/// converts at 1.0 whenever it has any events.
pub fn compute_funnel(records: &[EventRecord], settings: &AnalyzerSettings) -> Vec<FunnelRow> {
    let totals = stage_totals(records, &settings.stages);
    let mut rows = Vec::new();

    for cohort in ordered_cohorts(records, settings) {
        let counts = match totals.get(&cohort) {
            Some(counts) => counts.clone(),
            None => vec![0; settings.stages.len()],
        };

        for (idx, stage) in settings.stages.iter().enumerate() {
            let count = counts[idx];
            let conversion_rate_from_prior_stage = if idx == 0 {
                (count > 0).then_some(1.0)
            } else {
                ratio(count, counts[idx - 1])
            };
            rows.push(FunnelRow {
                cohort: cohort.clone(),
                stage: stage.clone(),
                count,
                conversion_rate_from_prior_stage,
            });
        }
    }

    rows
}

/// Stages whose count went up from the prior stage. Expects the row order
/// produced by [`compute_funnel`].
pub fn stage_increases(funnel: &[FunnelRow]) -> Vec<StageIncrease> {
    funnel
        .windows(2)
        .filter(|pair| pair[0].cohort == pair[1].cohort && pair[1].count > pair[0].count)
        .map(|pair| StageIncrease {
            cohort: pair[1].cohort.clone(),
            stage: pair[1].stage.clone(),
            prior_stage: pair[0].stage.clone(),
            count: pair[1].count,
            prior_count: pair[0].count,
        })
        .collect()
}

fn rate_for(funnel: &[FunnelRow], cohort: &str, stage: &str) -> Option<f64> {
    funnel
        .iter()
        .find(|row| row.cohort == cohort && row.stage == stage)
        .and_then(|row| row.conversion_rate_from_prior_stage)
}

pub fn lift_between(stage: &str, control_rate: Option<f64>, test_rate: Option<f64>) -> LiftRow {
    let absolute_lift = match (control_rate, test_rate) {
        (Some(control), Some(test)) => Some(test - control),
        _ => None,
    };
    let relative_lift = match (absolute_lift, control_rate) {
        (Some(absolute), Some(control)) if control > 0.0 => Some(absolute / control),
        _ => None,
    };
    LiftRow {
        stage: stage.to_string(),
        control_rate,
        test_rate,
        absolute_lift,
        relative_lift,
    }
}

/// Test-versus-control lift on each stage's conversion rate.
pub fn compute_lift(funnel: &[FunnelRow], settings: &AnalyzerSettings) -> Vec<LiftRow> {
    settings
        .stages
        .iter()
        .map(|stage| {
            lift_between(
                stage,
                rate_for(funnel, &settings.control_label, stage),
                rate_for(funnel, &settings.test_label, stage),
            )
        })
        .collect()
}

pub fn cohort_conversions(funnel: &[FunnelRow], settings: &AnalyzerSettings) -> Vec<CohortConversion> {
    let (Some(first), Some(last)) = (settings.stages.first(), settings.stages.last()) else {
        return Vec::new();
    };

    let mut cohorts: Vec<&str> = Vec::new();
    for row in funnel {
        if !cohorts.contains(&row.cohort.as_str()) {
            cohorts.push(&row.cohort);
        }
    }

    cohorts
        .into_iter()
        .map(|cohort| {
            let count_at = |stage: &str| {
                funnel
                    .iter()
                    .find(|row| row.cohort == cohort && row.stage == stage)
                    .map(|row| row.count)
                    .unwrap_or(0)
            };
            let first_stage_count = count_at(first.as_str());
            let last_stage_count = count_at(last.as_str());
            CohortConversion {
                cohort: cohort.to_string(),
                first_stage_count,
                last_stage_count,
                rate: ratio(last_stage_count, first_stage_count),
            }
        })
        .collect()
}

/// Lift of the end-to-end conversion, labelled `overall`.
pub fn overall_lift(conversions: &[CohortConversion], settings: &AnalyzerSettings) -> LiftRow {
    let rate = |label: &str| {
        conversions
            .iter()
            .find(|conversion| conversion.cohort == label)
            .and_then(|conversion| conversion.rate)
    };
    lift_between(
        "overall",
        rate(settings.control_label.as_str()),
        rate(settings.test_label.as_str()),
    )
}

/// Stage counts summed across cohorts for each date, oldest first.
pub fn daily_series(records: &[EventRecord], stages: &[String]) -> Vec<DailyStageCounts> {
    let mut days: BTreeMap<NaiveDate, Vec<u64>> = BTreeMap::new();

    for record in records {
        let Some(idx) = stages.iter().position(|stage| *stage == record.stage) else {
            continue;
        };
        let counts = days
            .entry(record.date)
            .or_insert_with(|| vec![0; stages.len()]);
        counts[idx] = counts[idx].saturating_add(record.count);
    }

    days.into_iter()
        .map(|(date, counts)| DailyStageCounts { date, counts })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn record(cohort: &str, stage: &str, count: u64, day: u32) -> EventRecord {
        EventRecord {
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            cohort: cohort.to_string(),
            stage: stage.to_string(),
            count,
            channel: None,
            segment: None,
        }
    }

    fn scenario() -> Vec<EventRecord> {
        let stages = ["impression", "click", "apply", "approve"];
        let mut records = Vec::new();
        for (stage, count) in stages.iter().zip([100, 50, 25, 10]) {
            records.push(record("control", stage, count, 1));
        }
        for (stage, count) in stages.iter().zip([100, 60, 30, 15]) {
            records.push(record("test", stage, count, 1));
        }
        records
    }

    fn rates(funnel: &[FunnelRow], cohort: &str) -> Vec<f64> {
        funnel
            .iter()
            .filter(|row| row.cohort == cohort)
            .map(|row| row.conversion_rate_from_prior_stage.unwrap())
            .collect()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < EPS, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn funnel_rates_follow_the_scenario() {
        let settings = AnalyzerSettings::default();
        let funnel = compute_funnel(&scenario(), &settings);

        assert_eq!(funnel.len(), 8);
        assert_close(&rates(&funnel, "control"), &[1.0, 0.5, 0.5, 0.4]);
        assert_close(&rates(&funnel, "test"), &[1.0, 0.6, 0.5, 0.5]);
    }

    #[test]
    fn lift_at_approve_is_ten_points_and_twenty_five_percent() {
        let settings = AnalyzerSettings::default();
        let funnel = compute_funnel(&scenario(), &settings);
        let lift = compute_lift(&funnel, &settings);

        let approve = lift.iter().find(|row| row.stage == "approve").unwrap();
        assert!((approve.absolute_lift.unwrap() - 0.10).abs() < EPS);
        assert!((approve.relative_lift.unwrap() - 0.25).abs() < EPS);

        for row in &lift {
            let expected = row.test_rate.unwrap() - row.control_rate.unwrap();
            assert!((row.absolute_lift.unwrap() - expected).abs() < EPS);
        }
    }

    #[test]
    fn counts_sum_across_days_and_missing_stages_are_zero() {
        let settings = AnalyzerSettings::default();
        let records = vec![
            record("control", "impression", 40, 1),
            record("control", "impression", 60, 2),
            record("control", "click", 30, 2),
        ];
        let funnel = compute_funnel(&records, &settings);

        assert_eq!(funnel[0].count, 100);
        assert_eq!(funnel[1].count, 30);
        assert_eq!(funnel[2].count, 0);
        assert_eq!(funnel[2].conversion_rate_from_prior_stage, Some(0.0));
        assert_eq!(funnel[3].count, 0);
        assert_eq!(funnel[3].conversion_rate_from_prior_stage, None);
    }

    #[test]
    fn rates_are_bounded_or_undefined() {
        let settings = AnalyzerSettings::default();
        let mut records = scenario();
        records.push(record("holdout", "click", 5, 3));
        let funnel = compute_funnel(&records, &settings);

        for (idx, row) in funnel.iter().enumerate() {
            let stage_idx = idx % settings.stages.len();
            let prior = if stage_idx == 0 { row.count } else { funnel[idx - 1].count };
            match row.conversion_rate_from_prior_stage {
                Some(rate) => {
                    assert!(prior > 0);
                    assert!((0.0..=1.0).contains(&rate));
                }
                None => assert_eq!(prior, 0),
            }
        }
    }

    #[test]
    fn more_clicks_than_impressions_is_reported_not_clamped() {
        let settings = AnalyzerSettings::default();
        let records = vec![
            record("control", "impression", 10, 1),
            record("control", "click", 40, 1),
            record("control", "apply", 4, 1),
        ];
        let funnel = compute_funnel(&records, &settings);
        assert_eq!(funnel[1].conversion_rate_from_prior_stage, Some(4.0));

        let increases = stage_increases(&funnel);
        assert_eq!(
            increases,
            vec![StageIncrease {
                cohort: "control".into(),
                stage: "click".into(),
                prior_stage: "impression".into(),
                count: 40,
                prior_count: 10,
            }]
        );
    }

    #[test]
    fn monotone_funnels_have_no_increases() {
        let funnel = compute_funnel(&scenario(), &AnalyzerSettings::default());
        assert!(stage_increases(&funnel).is_empty());
    }

    #[test]
    fn increases_do_not_span_cohorts() {
        let settings = AnalyzerSettings::default();
        // control ends at 0 approvals, test starts at 100 impressions
        let records = vec![
            record("control", "impression", 10, 1),
            record("test", "impression", 100, 1),
        ];
        let funnel = compute_funnel(&records, &settings);
        assert!(stage_increases(&funnel).is_empty());
    }

    #[test]
    fn huge_counts_saturate_instead_of_wrapping() {
        let settings = AnalyzerSettings::default();
        let records = vec![
            record("control", "impression", u64::MAX, 1),
            record("control", "impression", 2, 1),
        ];
        let funnel = compute_funnel(&records, &settings);
        assert_eq!(funnel[0].count, u64::MAX);

        let daily = daily_series(&records, &settings.stages);
        assert_eq!(daily[0].counts[0], u64::MAX);
        assert_eq!(daily[0].total(), u64::MAX);
    }

    #[test]
    fn zero_control_rate_leaves_relative_lift_undefined() {
        let row = lift_between("click", Some(0.0), Some(0.2));
        assert_eq!(row.absolute_lift, Some(0.2));
        assert_eq!(row.relative_lift, None);

        let missing = lift_between("click", None, Some(0.2));
        assert_eq!(missing.absolute_lift, None);
        assert_eq!(missing.relative_lift, None);

        let flat = lift_between("click", Some(0.3), Some(0.3));
        assert_eq!(flat.relative_lift, Some(0.0));
    }

    #[test]
    fn lift_without_test_cohort_is_undefined() {
        let settings = AnalyzerSettings::default();
        let records: Vec<EventRecord> = scenario()
            .into_iter()
            .filter(|record| record.cohort == "control")
            .collect();
        let lift = compute_lift(&compute_funnel(&records, &settings), &settings);

        assert_eq!(lift.len(), 4);
        assert!(lift.iter().all(|row| row.test_rate.is_none()));
        assert!(lift.iter().all(|row| row.absolute_lift.is_none()));
    }

    #[test]
    fn cohort_order_puts_control_and_test_first() {
        let settings = AnalyzerSettings::default();
        let records = vec![
            record("beta", "click", 1, 1),
            record("test", "click", 1, 1),
            record("alpha", "click", 1, 1),
            record("control", "click", 1, 1),
            record("beta", "click", 1, 2),
        ];
        assert_eq!(
            ordered_cohorts(&records, &settings),
            vec!["control", "test", "alpha", "beta"]
        );
    }

    #[test]
    fn overall_conversion_and_lift() {
        let settings = AnalyzerSettings::default();
        let funnel = compute_funnel(&scenario(), &settings);
        let conversions = cohort_conversions(&funnel, &settings);

        assert_eq!(conversions[0].cohort, "control");
        assert_eq!(conversions[0].rate, Some(0.1));
        assert_eq!(conversions[1].rate, Some(0.15));

        let overall = overall_lift(&conversions, &settings);
        assert_eq!(overall.stage, "overall");
        assert!((overall.relative_lift.unwrap() - 0.5).abs() < EPS);
    }

    #[test]
    fn empty_input_gives_empty_tables() {
        let settings = AnalyzerSettings::default();
        let funnel = compute_funnel(&[], &settings);
        assert!(funnel.is_empty());
        assert!(cohort_conversions(&funnel, &settings).is_empty());
        assert!(daily_series(&[], &settings.stages).is_empty());

        let lift = compute_lift(&funnel, &settings);
        assert!(lift.iter().all(|row| row.absolute_lift.is_none()));
    }

    #[test]
    fn daily_series_is_sorted_and_summed_across_cohorts() {
        let settings = AnalyzerSettings::default();
        let records = vec![
            record("test", "click", 4, 3),
            record("control", "impression", 10, 1),
            record("test", "impression", 5, 1),
            record("control", "click", 2, 3),
        ];
        let series = daily_series(&records, &settings.stages);

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(series[0].counts, vec![15, 0, 0, 0]);
        assert_eq!(series[1].counts, vec![0, 6, 0, 0]);
        assert_eq!(series[1].total(), 6);
    }
}
