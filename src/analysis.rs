use serde::Serialize;
use tracing::{debug, warn};

use crate::anomaly;
use crate::config::{AnalyzerSettings, AnomalyMetric};
use crate::funnel;
use crate::models::{
    AnomalyRow, CohortConversion, DailyStageCounts, EventRecord, FunnelRow, LiftRow,
    StageIncrease,
};

/// Every derived table for one dataset. Built per request and thrown away.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub stages: Vec<String>,
    pub control_label: String,
    pub test_label: String,
    pub funnel: Vec<FunnelRow>,
    /// Stages counted higher than the stage before them.
    pub stage_increases: Vec<StageIncrease>,
    pub lift: Vec<LiftRow>,
    pub conversions: Vec<CohortConversion>,
    pub overall_lift: LiftRow,
    pub daily: Vec<DailyStageCounts>,
    pub anomaly_metric: AnomalyMetric,
    pub z_threshold: f64,
    pub anomalies: Vec<AnomalyRow>,
}

impl Analysis {
    pub fn is_empty(&self) -> bool {
        self.funnel.is_empty()
    }

    pub fn flagged(&self) -> impl Iterator<Item = &AnomalyRow> {
        self.anomalies.iter().filter(|row| row.is_anomaly)
    }
}

pub fn analyze(records: &[EventRecord], settings: &AnalyzerSettings) -> Analysis {
    let funnel = funnel::compute_funnel(records, settings);
    let stage_increases = funnel::stage_increases(&funnel);
    let lift = funnel::compute_lift(&funnel, settings);
    let conversions = funnel::cohort_conversions(&funnel, settings);
    let overall_lift = funnel::overall_lift(&conversions, settings);
    let daily = funnel::daily_series(records, &settings.stages);
    let anomalies =
        anomaly::detect_anomalies(&daily, settings.anomaly_metric, settings.z_threshold);

    let analysis = Analysis {
        stages: settings.stages.clone(),
        control_label: settings.control_label.clone(),
        test_label: settings.test_label.clone(),
        funnel,
        stage_increases,
        lift,
        conversions,
        overall_lift,
        daily,
        anomaly_metric: settings.anomaly_metric,
        z_threshold: settings.z_threshold,
        anomalies,
    };

    debug!(
        records = records.len(),
        days = analysis.daily.len(),
        flagged = analysis.flagged().count(),
        "analysis complete"
    );
    if !analysis.stage_increases.is_empty() {
        warn!(
            stages = analysis.stage_increases.len(),
            "stage counts increase along the funnel"
        );
    }

    analysis
}
