use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cohort_indicators::aggregate::ModuleSort;
use cohort_indicators::cache::IndicatorCache;
use cohort_indicators::config::AnalyticsConfig;
use cohort_indicators::db;
use cohort_indicators::indicators::{IndicatorService, Scope};
use cohort_indicators::report::{self, ReportInput};
use cohort_indicators::source::FileSource;

#[derive(Parser)]
#[command(name = "cohort-indicators")]
#[command(about = "Cohort dashboard indicators and student early-warning alerts", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "COHORT_INDICATORS_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of exported API payloads, overrides `data_root`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct ScopeArgs {
    /// Department code, e.g. INFO
    #[arg(long)]
    department: String,
    /// Academic year, e.g. 2024-2025
    #[arg(long)]
    year: String,
    /// Semester index (1-6), all semesters of the year when omitted
    #[arg(long)]
    semester: Option<u32>,
    /// Restrict to one track (parcours)
    #[arg(long)]
    track: Option<String>,
    /// Restrict to one enrollment modality (FI, FA, FC)
    #[arg(long)]
    modality: Option<String>,
    /// Recompute even when a cached value exists
    #[arg(long)]
    force_refresh: bool,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        Scope::new(&self.department, &self.year)
            .with_semester(self.semester)
            .with_track(self.track.clone())
            .with_modality(self.modality.clone())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the cache schema
    InitDb,
    /// Cohort descriptive statistics and rates
    Stats {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Statistics per track
    Tracks {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Per-module analysis
    Modules {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "failure-rate")]
        sort: ModuleSort,
    },
    /// Cohort absenteeism
    Absences {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Alerts and risk scores, riskiest students first
    Alerts {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Alerts and risk score of one student
    Student {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        id: String,
    },
    /// Compare cohort statistics across academic years
    Interannual {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Academic years to compare, e.g. --years 2023-2024,2024-2025
        #[arg(long, value_delimiter = ',', required = true)]
        years: Vec<String>,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Drop every cached indicator of a department
    ClearCache {
        #[arg(long)]
        department: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize indicator")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cohort_indicators=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = AnalyticsConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_root = dir;
    }

    if let Commands::InitDb = cli.command {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to create the cache schema")?;
        let pool = db::connect(url)
            .await
            .context("failed to connect to Postgres")?;
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let cache = IndicatorCache::connect(config.database_url.as_deref()).await;
    info!(
        backend = cache.backend_name(),
        data_root = %config.data_root.display(),
        "indicator service ready"
    );
    let source = FileSource::new(config.data_root.clone());
    let service = IndicatorService::new(source, cache, config);

    match cli.command {
        Commands::InitDb => {}
        Commands::Stats { scope } => {
            let stats = service
                .cohort_statistics(&scope.scope(), scope.force_refresh)
                .await?;
            print_json(&stats)?;
        }
        Commands::Tracks { scope } => {
            let tracks = service
                .track_breakdown(&scope.scope(), scope.force_refresh)
                .await?;
            print_json(&tracks)?;
        }
        Commands::Modules { scope, sort } => {
            let modules = service
                .module_analysis(&scope.scope(), sort, scope.force_refresh)
                .await?;
            print_json(&modules)?;
        }
        Commands::Absences { scope } => {
            let absences = service
                .absenteeism(&scope.scope(), scope.force_refresh)
                .await?;
            print_json(&absences)?;
        }
        Commands::Alerts { scope, limit } => {
            let evaluations = service
                .cohort_alerts(&scope.scope(), scope.force_refresh)
                .await?;
            let flagged: Vec<_> = evaluations
                .iter()
                .filter(|e| !e.alerts.is_empty())
                .take(limit)
                .collect();
            if flagged.is_empty() {
                println!("No alerts for this scope.");
                return Ok(());
            }
            print_json(&flagged)?;
        }
        Commands::Student { scope, id } => {
            let evaluation = service
                .student_evaluation(&scope.scope(), &id, scope.force_refresh)
                .await?
                .with_context(|| format!("student {id} not found in this scope"))?;
            print_json(&evaluation)?;
        }
        Commands::Interannual { scope, years } => {
            let comparison = service
                .interannual(&scope.scope(), &years, scope.force_refresh)
                .await?;
            print_json(&comparison)?;
        }
        Commands::Report { scope: args, out } => {
            let scope = args.scope();
            let statistics = service
                .cohort_statistics(&scope, args.force_refresh)
                .await?;
            let modules = service
                .module_analysis(&scope, ModuleSort::FailureRate, args.force_refresh)
                .await?;
            let absenteeism = service.absenteeism(&scope, args.force_refresh).await?;
            let evaluations = service.cohort_alerts(&scope, args.force_refresh).await?;

            let report = report::build_report(&ReportInput {
                scope: &scope,
                generated_on: chrono::Local::now().date_naive(),
                statistics: &statistics,
                modules: &modules,
                absenteeism: &absenteeism,
                evaluations: &evaluations,
            });
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::ClearCache { department } => {
            let removed = service.clear_department(&department).await;
            println!("Removed {removed} cached indicators for {department}.");
        }
    }

    Ok(())
}
