use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod analysis;
mod anomaly;
mod config;
mod export;
mod filter;
mod funnel;
mod ingest;
mod models;
mod render;
mod report;
mod web;

use config::{AnalyzerSettings, AnomalyMetric, AppConfig};
use export::Table;
use filter::EventFilter;

#[derive(Parser)]
#[command(name = "funnel-dashboard")]
#[command(about = "Funnel conversion, cohort lift and daily anomaly dashboard", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to ./funnel-dashboard.toml when present)
    #[arg(long, global = true, env = "FUNNEL_DASHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: AnalyzerOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AnalyzerOverrides {
    /// Ordered funnel stages, comma separated
    #[arg(long, global = true, value_delimiter = ',')]
    stages: Option<Vec<String>>,
    #[arg(long, global = true)]
    control_label: Option<String>,
    #[arg(long, global = true)]
    test_label: Option<String>,
    /// Absolute z-score above which a day is flagged
    #[arg(long, global = true)]
    z_threshold: Option<f64>,
    #[arg(long, global = true, value_enum)]
    anomaly_metric: Option<AnomalyMetric>,
}

impl AnalyzerOverrides {
    fn apply(self, settings: &mut AnalyzerSettings) {
        if let Some(stages) = self.stages {
            settings.stages = stages;
        }
        if let Some(label) = self.control_label {
            settings.control_label = label;
        }
        if let Some(label) = self.test_label {
            settings.test_label = label;
        }
        if let Some(threshold) = self.z_threshold {
            settings.z_threshold = threshold;
        }
        if let Some(metric) = self.anomaly_metric {
            settings.anomaly_metric = metric;
        }
    }
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    cohort: Option<String>,
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    segment: Option<String>,
    /// First date to include (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,
    /// Last date to include (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<NaiveDate>,
}

impl From<FilterArgs> for EventFilter {
    fn from(args: FilterArgs) -> Self {
        EventFilter {
            cohort: args.cohort,
            channel: args.channel,
            segment: args.segment,
            start_date: args.start_date,
            end_date: args.end_date,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        #[arg(long, default_value = config::DEFAULT_CONFIG_FILE)]
        out: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the web dashboard
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print funnel, lift and anomaly figures for a CSV file
    Analyze {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// Emit the full analysis as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export one derived table as CSV
    Export {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, value_enum)]
        table: Table,
        #[command(flatten)]
        filter: FilterArgs,
        /// Destination file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter \"{level}\""))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

fn load_events(
    csv: &Path,
    filter: FilterArgs,
    settings: &AnalyzerSettings,
) -> anyhow::Result<(ingest::Ingested, EventFilter, Vec<models::EventRecord>)> {
    let ingested = ingest::read_events_from_path(csv, &settings.stages)
        .with_context(|| format!("failed to load events from {}", csv.display()))?;
    let filter = EventFilter::from(filter);
    let records = filter.apply(&ingested.records);
    debug!(
        total = ingested.records.len(),
        selected = records.len(),
        "events loaded"
    );
    Ok((ingested, filter, records))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    if let Commands::InitConfig { out, force } = &cli.command {
        if out.exists() && !force {
            anyhow::bail!("{} already exists; pass --force to overwrite", out.display());
        }
        std::fs::write(out, AppConfig::default_toml()?)
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("Default configuration written to {}.", out.display());
        return Ok(());
    }

    let mut app_config = AppConfig::load_or_default(cli.config.as_deref())?;
    cli.overrides.apply(&mut app_config.analyzer);
    let settings = app_config
        .analyzer
        .clone()
        .normalized()
        .context("invalid analyzer settings")?;

    match cli.command {
        Commands::InitConfig { .. } => {}
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                app_config.server.bind = bind;
            }
            info!(
                stages = %settings.stages.join(","),
                threshold = settings.z_threshold,
                "analyzer configured"
            );
            web::serve(settings, &app_config.server).await?;
        }
        Commands::Analyze { csv, filter, json } => {
            let (ingested, _, records) = load_events(&csv, filter, &settings)?;
            let analysis = analysis::analyze(&records, &settings);

            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
                return Ok(());
            }

            if analysis.is_empty() {
                println!("No events found for this selection.");
                return Ok(());
            }

            println!("Funnel conversion by cohort:");
            for conversion in &analysis.conversions {
                println!(
                    "- {}: {} of {} reached {} ({})",
                    conversion.cohort,
                    conversion.last_stage_count,
                    conversion.first_stage_count,
                    settings.stages.last().map(String::as_str).unwrap_or_default(),
                    report::percent(conversion.rate)
                );
            }
            println!("Lift ({} vs {}):", settings.test_label, settings.control_label);
            for row in analysis.lift.iter().chain(std::iter::once(&analysis.overall_lift)) {
                println!(
                    "- {}: {} vs {} ({})",
                    row.stage,
                    report::percent(row.test_rate),
                    report::percent(row.control_rate),
                    report::points(row.absolute_lift)
                );
            }
            let flagged: Vec<_> = analysis.flagged().collect();
            println!(
                "{} of {} days flagged (|z| > {}).",
                flagged.len(),
                analysis.anomalies.len(),
                settings.z_threshold
            );
            for row in flagged {
                println!("- {} z {}", row.date, report::number(row.z_score, 2));
            }
            if ingested.summary.rows_skipped > 0 {
                println!(
                    "Skipped {} malformed rows of {}.",
                    ingested.summary.rows_skipped, ingested.summary.rows_read
                );
            }
            for increase in &analysis.stage_increases {
                println!(
                    "Warning: {} {} ({}) exceeds {} ({}).",
                    increase.cohort,
                    increase.stage,
                    increase.count,
                    increase.prior_stage,
                    increase.prior_count
                );
            }
        }
        Commands::Report { csv, filter, out } => {
            let (ingested, filter, records) = load_events(&csv, filter, &settings)?;
            let analysis = analysis::analyze(&records, &settings);
            let report = report::build_report(&filter.describe(), &analysis, &ingested.summary);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export {
            csv,
            table,
            filter,
            out,
        } => {
            let (_, _, records) = load_events(&csv, filter, &settings)?;
            let analysis = analysis::analyze(&records, &settings);

            let mut writer: Box<dyn std::io::Write> = match &out {
                Some(path) => Box::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?,
                ),
                None => Box::new(std::io::stdout().lock()),
            };
            match table {
                Table::Funnel => export::write_funnel_csv(&mut writer, &analysis.funnel)?,
                Table::Lift => export::write_lift_csv(&mut writer, &analysis.lift)?,
                Table::Anomalies => export::write_anomalies_csv(&mut writer, &analysis.anomalies)?,
            }
            if let Some(path) = out {
                eprintln!("Exported {} to {}.", table.download_name(), path.display());
            }
        }
    }

    Ok(())
}
