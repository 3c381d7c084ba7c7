//! Server-side HTML for the dashboard. Charts are drawn client-side by
//! Chart.js from JSON embedded in the page.

use std::fmt::Write;

use serde_json::json;

use crate::analysis::Analysis;
use crate::filter::{EventFilter, FilterOptions};
use crate::ingest::REQUIRED_COLUMNS;
use crate::models::{IngestSummary, LiftRow, StageIncrease};
use crate::report::{number, percent, points};
use crate::web::Dataset;

const CHART_JS: &str = "https://cdn.jsdelivr.net/npm/chart.js@4.4.1/dist/chart.umd.min.js";

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 1100px; color: #1f2933; }
h1 { margin-bottom: 0.2rem; }
.muted { color: #616e7c; }
.error { background: #fde8e8; border: 1px solid #f8b4b4; padding: 0.6rem 1rem; border-radius: 4px; }
.notice { background: #fff8e1; border: 1px solid #ffe082; padding: 0.6rem 1rem; border-radius: 4px; }
table { border-collapse: collapse; width: 100%; margin: 0.8rem 0 1.6rem; }
th, td { border-bottom: 1px solid #e4e7eb; padding: 0.35rem 0.6rem; text-align: left; }
td.num, th.num { text-align: right; font-variant-numeric: tabular-nums; }
tr.flagged { background: #fde8e8; font-weight: 600; }
.cards { display: flex; gap: 1rem; flex-wrap: wrap; }
.card { border: 1px solid #e4e7eb; border-radius: 6px; padding: 0.8rem 1.2rem; min-width: 180px; }
.card .value { font-size: 1.6rem; font-weight: 600; }
form.filters { display: flex; gap: 0.8rem; flex-wrap: wrap; align-items: end; }
.charts { display: grid; grid-template-columns: 1fr 1fr; gap: 1.5rem; }
"#;

pub fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Query string that reproduces `filter`, including the leading `?`.
pub fn filter_query(filter: &EventFilter) -> String {
    let mut pairs = Vec::new();
    for (name, value) in [
        ("cohort", filter.cohort.clone()),
        ("channel", filter.channel.clone()),
        ("segment", filter.segment.clone()),
        ("start_date", filter.start_date.map(|date| date.to_string())),
        ("end_date", filter.end_date.map(|date| date.to_string())),
    ] {
        if let Some(value) = value.filter(|value| !value.is_empty() && value != "all") {
            pairs.push(format!("{name}={}", urlencoding::encode(&value)));
        }
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

/// JSON is embedded inside a `<script>` element, so `</` must not appear.
fn script_json(value: &serde_json::Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn page(title: &str, body: &str, scripts: &str) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "<!doctype html>");
    let _ = writeln!(output, "<html lang=\"en\">");
    let _ = writeln!(output, "<head>");
    let _ = writeln!(output, "<meta charset=\"utf-8\">");
    let _ = writeln!(output, "<title>{}</title>", escape(title));
    let _ = writeln!(output, "<style>{STYLE}</style>");
    let _ = writeln!(output, "</head>");
    let _ = writeln!(output, "<body>");
    output.push_str(body);
    output.push_str(scripts);
    let _ = writeln!(output, "</body>");
    let _ = writeln!(output, "</html>");
    output
}

fn dataset_line(dataset: &Dataset) -> String {
    format!(
        "Active dataset: {} ({} events, id {})",
        escape(&dataset.source.describe()),
        dataset.records.len(),
        dataset.id
    )
}

pub fn upload_page(dataset: &Dataset, error: Option<&str>) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "<h1>Funnel &amp; Lift Dashboard</h1>");
    let _ = writeln!(body, "<p class=\"muted\">{}</p>", dataset_line(dataset));

    if let Some(error) = error {
        let _ = writeln!(body, "<p class=\"error\">{}</p>", escape(error));
    }

    let _ = writeln!(
        body,
        "<p>Upload a CSV with the columns <code>{}</code>. Optional columns \
         <code>channel</code> and <code>segment</code> enable extra filters.</p>",
        REQUIRED_COLUMNS.join(", ")
    );
    let _ = writeln!(
        body,
        "<form method=\"post\" action=\"/upload\" enctype=\"multipart/form-data\">\
         <input type=\"file\" name=\"file\" accept=\".csv\"> \
         <button type=\"submit\">Upload</button></form>"
    );
    let _ = writeln!(
        body,
        "<p><a href=\"/load-sample\">Use the sample dataset</a> · \
         <a href=\"/dashboard\">Open the dashboard</a></p>"
    );

    page("Funnel & Lift Dashboard", &body, "")
}

fn select(body: &mut String, name: &str, values: &[String], current: &Option<String>) {
    let current = current.as_deref().unwrap_or("all");
    let _ = write!(body, "<label>{name}<br><select name=\"{name}\">");
    for value in std::iter::once("all").chain(values.iter().map(String::as_str)) {
        let selected = if value == current { " selected" } else { "" };
        let _ = write!(
            body,
            "<option value=\"{0}\"{1}>{0}</option>",
            escape(value),
            selected
        );
    }
    let _ = writeln!(body, "</select></label>");
}

fn filter_form(body: &mut String, filter: &EventFilter, options: &FilterOptions) {
    let _ = writeln!(body, "<form class=\"filters\" method=\"get\" action=\"/dashboard\">");
    select(body, "cohort", &options.cohorts, &filter.cohort);
    if !options.channels.is_empty() {
        select(body, "channel", &options.channels, &filter.channel);
    }
    if !options.segments.is_empty() {
        select(body, "segment", &options.segments, &filter.segment);
    }
    for (name, value) in [("start_date", filter.start_date), ("end_date", filter.end_date)] {
        let value = value.map(|date| date.to_string()).unwrap_or_default();
        let _ = writeln!(
            body,
            "<label>{name}<br><input type=\"date\" name=\"{name}\" value=\"{value}\"></label>"
        );
    }
    let _ = writeln!(body, "<button type=\"submit\">Apply</button>");
    let _ = writeln!(body, "<a href=\"/dashboard\">Reset</a>");
    let _ = writeln!(body, "</form>");
}

fn lift_row(body: &mut String, row: &LiftRow) {
    let relative = match row.relative_lift {
        Some(value) => format!("{:+.1}%", value * 100.0),
        None => "n/a".to_string(),
    };
    let _ = writeln!(
        body,
        "<tr><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td>\
         <td class=\"num\">{}</td><td class=\"num\">{}</td></tr>",
        escape(&row.stage),
        percent(row.control_rate),
        percent(row.test_rate),
        points(row.absolute_lift),
        relative
    );
}

fn quality_notes(body: &mut String, summary: &IngestSummary, increases: &[StageIncrease]) {
    if summary.is_clean() && increases.is_empty() {
        return;
    }
    let _ = writeln!(body, "<div class=\"notice\"><strong>Data quality:</strong> ");
    if !summary.is_clean() {
        let _ = writeln!(
            body,
            "{} of {} rows skipped.",
            summary.rows_skipped, summary.rows_read
        );
    }
    let _ = writeln!(body, "<ul>");
    for issue in &summary.issues {
        let _ = writeln!(
            body,
            "<li>line {}: {}</li>",
            issue.line,
            escape(&issue.reason)
        );
    }
    for (stage, count) in &summary.unknown_stages {
        let _ = writeln!(
            body,
            "<li>{count} rows with unknown stage \"{}\" dropped</li>",
            escape(stage)
        );
    }
    for increase in increases {
        let _ = writeln!(
            body,
            "<li>{} {} ({}) exceeds {} ({}), so its conversion is above 100%</li>",
            escape(&increase.cohort),
            escape(&increase.stage),
            increase.count,
            escape(&increase.prior_stage),
            increase.prior_count
        );
    }
    let _ = writeln!(body, "</ul></div>");
}

fn charts_script(analysis: &Analysis) -> String {
    let cohorts: Vec<&str> = analysis
        .conversions
        .iter()
        .map(|conversion| conversion.cohort.as_str())
        .collect();
    let funnel_sets: Vec<serde_json::Value> = cohorts
        .iter()
        .map(|cohort| {
            let counts: Vec<u64> = analysis
                .funnel
                .iter()
                .filter(|row| row.cohort == *cohort)
                .map(|row| row.count)
                .collect();
            json!({ "label": cohort, "data": counts })
        })
        .collect();

    let dates: Vec<String> = analysis.daily.iter().map(|day| day.date.to_string()).collect();
    let daily_sets: Vec<serde_json::Value> = analysis
        .stages
        .iter()
        .enumerate()
        .map(|(idx, stage)| {
            let counts: Vec<u64> = analysis.daily.iter().map(|day| day.counts[idx]).collect();
            json!({ "label": stage, "data": counts, "fill": false, "tension": 0.2 })
        })
        .collect();

    let data = json!({
        "funnel": { "labels": analysis.stages, "datasets": funnel_sets },
        "daily": { "labels": dates, "datasets": daily_sets },
    });

    let mut script = String::new();
    let _ = writeln!(script, "<script src=\"{CHART_JS}\"></script>");
    let _ = writeln!(script, "<script>");
    let _ = writeln!(script, "const chartData = {};", script_json(&data));
    let _ = writeln!(
        script,
        "new Chart(document.getElementById('funnelChart'), {{ type: 'bar', data: chartData.funnel }});"
    );
    let _ = writeln!(
        script,
        "new Chart(document.getElementById('dailyChart'), {{ type: 'line', data: chartData.daily }});"
    );
    let _ = writeln!(script, "</script>");
    script
}

pub fn dashboard_page(
    dataset: &Dataset,
    filter: &EventFilter,
    options: &FilterOptions,
    analysis: &Analysis,
) -> String {
    let mut body = String::new();
    let query = filter_query(filter);

    let _ = writeln!(body, "<h1>Funnel &amp; Lift Dashboard</h1>");
    let _ = writeln!(
        body,
        "<p class=\"muted\">{} · <a href=\"/\">Upload another file</a> · \
         <a href=\"/load-sample\">Load sample</a></p>",
        dataset_line(dataset)
    );
    filter_form(&mut body, filter, options);
    quality_notes(&mut body, &dataset.summary, &analysis.stage_increases);

    let _ = writeln!(body, "<h2>Overall conversion</h2>");
    let _ = writeln!(body, "<div class=\"cards\">");
    if analysis.conversions.is_empty() {
        let _ = writeln!(body, "<p>No data for this selection.</p>");
    }
    for conversion in &analysis.conversions {
        let _ = writeln!(
            body,
            "<div class=\"card\"><div class=\"muted\">{}</div><div class=\"value\">{}</div>\
             <div class=\"muted\">{} of {}</div></div>",
            escape(&conversion.cohort),
            percent(conversion.rate),
            conversion.last_stage_count,
            conversion.first_stage_count
        );
    }
    let _ = writeln!(body, "</div>");

    let _ = writeln!(body, "<div class=\"charts\">");
    let _ = writeln!(body, "<div><h3>Funnel by cohort</h3><canvas id=\"funnelChart\"></canvas></div>");
    let _ = writeln!(body, "<div><h3>Daily stage counts</h3><canvas id=\"dailyChart\"></canvas></div>");
    let _ = writeln!(body, "</div>");

    let _ = writeln!(
        body,
        "<h2>Funnel</h2><p><a href=\"/export/funnel.csv{query}\">Download CSV</a></p>"
    );
    let _ = writeln!(
        body,
        "<table><tr><th>Cohort</th><th>Stage</th><th class=\"num\">Count</th>\
         <th class=\"num\">Conversion from prior stage</th></tr>"
    );
    if analysis.funnel.is_empty() {
        let _ = writeln!(body, "<tr><td colspan=\"4\">No data</td></tr>");
    }
    for row in &analysis.funnel {
        let _ = writeln!(
            body,
            "<tr><td>{}</td><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td></tr>",
            escape(&row.cohort),
            escape(&row.stage),
            row.count,
            percent(row.conversion_rate_from_prior_stage)
        );
    }
    let _ = writeln!(body, "</table>");

    let _ = writeln!(
        body,
        "<h2>Lift ({} vs {})</h2><p><a href=\"/export/lift.csv{query}\">Download CSV</a></p>",
        escape(&analysis.test_label),
        escape(&analysis.control_label)
    );
    let _ = writeln!(
        body,
        "<table><tr><th>Stage</th><th class=\"num\">Control</th><th class=\"num\">Test</th>\
         <th class=\"num\">Absolute</th><th class=\"num\">Relative</th></tr>"
    );
    for row in &analysis.lift {
        lift_row(&mut body, row);
    }
    lift_row(&mut body, &analysis.overall_lift);
    let _ = writeln!(body, "</table>");

    let flagged = analysis.flagged().count();
    let _ = writeln!(
        body,
        "<h2>Daily anomalies</h2><p class=\"muted\">Metric {}, flagged when |z| &gt; {}. \
         {} of {} days flagged. <a href=\"/export/anomalies.csv{query}\">Download CSV</a></p>",
        analysis.anomaly_metric.label(),
        analysis.z_threshold,
        flagged,
        analysis.anomalies.len()
    );
    let _ = writeln!(
        body,
        "<table><tr><th>Date</th><th class=\"num\">Value</th><th class=\"num\">Mean</th>\
         <th class=\"num\">Std dev</th><th class=\"num\">z</th><th>Flag</th></tr>"
    );
    if analysis.anomalies.is_empty() {
        let _ = writeln!(body, "<tr><td colspan=\"6\">No data</td></tr>");
    }
    for row in &analysis.anomalies {
        let (class, flag) = if row.is_anomaly {
            (" class=\"flagged\"", "ANOMALY")
        } else {
            ("", "")
        };
        let _ = writeln!(
            body,
            "<tr{class}><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td>\
             <td class=\"num\">{}</td><td class=\"num\">{}</td><td>{flag}</td></tr>",
            row.date,
            number(row.metric_value, 4),
            number(row.rolling_mean, 4),
            number(row.rolling_stddev, 4),
            number(row.z_score, 2)
        );
    }
    let _ = writeln!(body, "</table>");

    page("Funnel & Lift Dashboard", &body, &charts_script(analysis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::config::AnalyzerSettings;
    use crate::web::DatasetSource;
    use chrono::NaiveDate;

    fn dataset(csv: &str) -> Dataset {
        Dataset::parse(
            DatasetSource::Upload {
                filename: "<x>.csv".into(),
            },
            csv.as_bytes(),
            &AnalyzerSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape("<a href=\"x\">&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn filter_query_skips_defaults_and_encodes() {
        assert_eq!(filter_query(&EventFilter::default()), "");
        let filter = EventFilter {
            cohort: Some("all".into()),
            channel: Some("paid search".into()),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 2),
            ..EventFilter::default()
        };
        assert_eq!(
            filter_query(&filter),
            "?channel=paid%20search&start_date=2024-01-02"
        );

        let filter = EventFilter {
            segment: Some("new & returning/é".into()),
            ..EventFilter::default()
        };
        assert_eq!(filter_query(&filter), "?segment=new%20%26%20returning%2F%C3%A9");
    }

    #[test]
    fn script_json_cannot_close_the_tag() {
        let value = json!({ "label": "</script><script>alert(1)" });
        assert!(!script_json(&value).contains("</script>"));
    }

    #[test]
    fn dashboard_lists_tables_and_flags() {
        let dataset = dataset(
            "date,cohort,stage,count\n\
             2024-01-01,control,impression,100\n\
             2024-01-01,test,impression,100\n\
             2024-01-01,test,click,7\n\
             2024-01-01,test,<b>,1\n",
        );
        let settings = AnalyzerSettings::default();
        let analysis = analyze(&dataset.records, &settings);
        let options = FilterOptions::from_records(&dataset.records);
        let html = dashboard_page(&dataset, &EventFilter::default(), &options, &analysis);

        assert!(html.contains("upload &quot;&lt;x&gt;.csv&quot;"));
        assert!(html.contains("<td>control</td><td>click</td><td class=\"num\">0</td>"));
        assert!(html.contains("0 of 1 days flagged"));
        assert!(html.contains("rows with unknown stage \"&lt;b&gt;\" dropped"));
        assert!(html.contains("id=\"funnelChart\""));
        assert!(html.contains("href=\"/export/lift.csv\""));
    }

    #[test]
    fn dashboard_flags_stages_that_outnumber_the_prior_stage() {
        let dataset = dataset(
            "date,cohort,stage,count\n\
             2024-01-01,control,impression,10\n\
             2024-01-01,control,click,40\n",
        );
        assert!(dataset.summary.is_clean());
        let analysis = analyze(&dataset.records, &AnalyzerSettings::default());
        let options = FilterOptions::from_records(&dataset.records);
        let html = dashboard_page(&dataset, &EventFilter::default(), &options, &analysis);

        assert!(html.contains("<strong>Data quality:</strong>"));
        assert!(html.contains("control click (40) exceeds impression (10)"));
        assert!(!html.contains("rows skipped."));
    }

    #[test]
    fn upload_page_shows_errors() {
        let dataset = dataset("date,cohort,stage,count\n");
        let html = upload_page(&dataset, Some("Only .csv files are supported."));
        assert!(html.contains("class=\"error\">Only .csv files are supported."));
        assert!(html.contains("date, cohort, stage, count"));
        assert!(html.contains("enctype=\"multipart/form-data\""));
    }
}
