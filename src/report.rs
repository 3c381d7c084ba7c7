use std::fmt::Write;

use crate::analysis::Analysis;
use crate::models::{IngestSummary, LiftRow};

/// Formats an optional ratio as a percentage, `n/a` when undefined.
pub fn percent(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.1}%", value * 100.0),
        None => "n/a".to_string(),
    }
}

/// Formats an optional difference in percentage points with an explicit sign.
pub fn points(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:+.1} pts", value * 100.0),
        None => "n/a".to_string(),
    }
}

pub fn number(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(value) => format!("{value:.decimals$}"),
        None => "n/a".to_string(),
    }
}

fn lift_line(output: &mut String, row: &LiftRow) {
    let relative = match row.relative_lift {
        Some(value) => format!("{:+.1}%", value * 100.0),
        None => "n/a".to_string(),
    };
    let _ = writeln!(
        output,
        "| {} | {} | {} | {} | {} |",
        row.stage,
        percent(row.control_rate),
        percent(row.test_rate),
        points(row.absolute_lift),
        relative
    );
}

pub fn build_report(label: &str, analysis: &Analysis, summary: &IngestSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Funnel & Lift Report");
    let _ = writeln!(
        output,
        "Generated for {} ({} vs {}, stages: {})",
        label,
        analysis.test_label,
        analysis.control_label,
        analysis.stages.join(" > ")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Funnel");

    if analysis.funnel.is_empty() {
        let _ = writeln!(output, "No events recorded for this selection.");
    } else {
        let _ = writeln!(output, "| Cohort | Stage | Count | Conversion from prior |");
        let _ = writeln!(output, "|---|---|---:|---:|");
        for row in &analysis.funnel {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                row.cohort,
                row.stage,
                row.count,
                percent(row.conversion_rate_from_prior_stage)
            );
        }
        let _ = writeln!(output);
        for conversion in &analysis.conversions {
            let _ = writeln!(
                output,
                "- {}: {} of {} reached the last stage ({})",
                conversion.cohort,
                conversion.last_stage_count,
                conversion.first_stage_count,
                percent(conversion.rate)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Lift");
    let _ = writeln!(output, "| Stage | Control | Test | Absolute | Relative |");
    let _ = writeln!(output, "|---|---:|---:|---:|---:|");
    for row in &analysis.lift {
        lift_line(&mut output, row);
    }
    lift_line(&mut output, &analysis.overall_lift);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Daily Anomalies");
    let _ = writeln!(
        output,
        "Metric {}, flagged when |z| > {}",
        analysis.anomaly_metric.label(),
        analysis.z_threshold
    );

    let flagged: Vec<_> = analysis.flagged().collect();
    if analysis.anomalies.is_empty() {
        let _ = writeln!(output, "No daily data for this selection.");
    } else if flagged.is_empty() {
        let _ = writeln!(
            output,
            "No anomalous days across {} days.",
            analysis.anomalies.len()
        );
    } else {
        for row in flagged {
            let _ = writeln!(
                output,
                "- {}: value {} (mean {}, stddev {}, z {})",
                row.date,
                number(row.metric_value, 4),
                number(row.rolling_mean, 4),
                number(row.rolling_stddev, 4),
                number(row.z_score, 2)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Data Quality");
    let _ = writeln!(
        output,
        "{} rows read, {} accepted, {} skipped.",
        summary.rows_read, summary.rows_accepted, summary.rows_skipped
    );
    for issue in &summary.issues {
        let _ = writeln!(output, "- line {}: {}", issue.line, issue.reason);
    }
    if summary.rows_skipped > summary.issues.len() {
        let _ = writeln!(
            output,
            "- ... and {} more",
            summary.rows_skipped - summary.issues.len()
        );
    }
    for (stage, count) in &summary.unknown_stages {
        let _ = writeln!(output, "- dropped {count} rows with unknown stage \"{stage}\"");
    }
    for increase in &analysis.stage_increases {
        let _ = writeln!(
            output,
            "- {} {} ({}) exceeds {} ({}); its conversion rate is above 100%",
            increase.cohort,
            increase.stage,
            increase.count,
            increase.prior_stage,
            increase.prior_count
        );
    }

    output
}
