use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cohort_risk_dashboard::charts::{parse_x_values, DEFAULT_X_VALUES};
use cohort_risk_dashboard::models::{ModelType, TrainRequest};
use cohort_risk_dashboard::report::{self, ReportContext};
use cohort_risk_dashboard::sort::{SortDirection, SortKey};
use cohort_risk_dashboard::{
    risk, Backend, CascadeController, ChartCategory, ChartRegistry, ChartRequest, Config,
    DashboardError, HttpBackend, PredictionWorkflow, SortState,
};

#[derive(Parser)]
#[command(name = "cohort-dashboard")]
#[command(about = "Student outcome and risk prediction dashboard", long_about = None)]
struct Cli {
    /// Dashboard API base url
    #[arg(long, global = true, env = "DASHBOARD_API_URL")]
    api_url: Option<String>,
    /// Request timeout in seconds
    #[arg(long, global = true, env = "DASHBOARD_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List datasets with their student counts
    Directions,
    /// List trained models
    Models {
        #[arg(long)]
        direction: Option<i64>,
    },
    /// Print the student table, optionally with predictions and sorting
    Students {
        #[arg(long)]
        direction: i64,
        #[arg(long)]
        model: Option<i64>,
        /// Sort key as column[:asc|desc]; the last one given is primary
        #[arg(long)]
        sort: Vec<String>,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Score students against a model
    #[command(group(
        ArgGroup::new("targets")
            .args(["ids", "all"])
            .required(true)
            .multiple(false)
    ))]
    Predict {
        #[arg(long)]
        direction: i64,
        #[arg(long)]
        model: i64,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        #[arg(long)]
        all: bool,
    },
    /// Train a new model on a dataset
    Train {
        #[arg(long)]
        direction: i64,
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
        #[arg(long)]
        target: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "logit")]
        model_type: ModelType,
    },
    /// Show training metrics of a model
    Metrics {
        #[arg(long)]
        model: i64,
    },
    /// Generate a markdown dashboard report
    Report {
        #[arg(long)]
        direction: i64,
        #[arg(long)]
        model: i64,
        /// Chart as subject:category[:x1,x2,...]
        #[arg(long)]
        chart: Vec<String>,
        #[arg(long, default_value = "dashboard.md")]
        out: PathBuf,
        #[arg(long)]
        preview: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match cli.api_url {
        Some(url) => Config::new(url),
        None => Config::from_env()?,
    };
    if let Some(secs) = cli.timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    config.validate()?;

    let backend: Arc<dyn Backend> = Arc::new(
        HttpBackend::new(&config.api_url, config.request_timeout)
            .context("failed to build HTTP client")?,
    );
    let charts = Arc::new(ChartRegistry::new(backend.clone()));
    let cascade = Arc::new(CascadeController::new(backend.clone(), charts));

    match cli.command {
        Commands::Directions => {
            cascade.load_directions().await?;
            let state = cascade.snapshot().await;
            if state.directions.is_empty() {
                println!("No datasets found.");
            }
            for direction in state.directions {
                println!(
                    "- [{}] {} ({} students)",
                    direction.id, direction.name, direction.count_student
                );
            }
        }
        Commands::Models { direction } => {
            let models = backend.list_models(direction).await?;
            if models.is_empty() {
                println!("No models found.");
            }
            for model in models {
                println!("- [{}] {}", model.id, model.name);
            }
        }
        Commands::Students {
            direction,
            model,
            sort,
            csv,
        } => {
            let sort = parse_sort(&sort)?;
            let students = match model {
                Some(model) => {
                    open(&cascade, direction, model).await?;
                    cascade.sorted_students(&sort).await
                }
                None => sort.sorted(&backend.students(Some(direction)).await?),
            };

            if let Some(path) = csv {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let written = report::export_csv(file, &students, model)?;
                println!("Wrote {written} students to {}.", path.display());
                return Ok(());
            }

            let columns = ["full_name", "math_score", "russian_score", "ege_score"];
            let header: Vec<String> = columns
                .iter()
                .map(|c| format!("{c} {}", sort.indicator(c)))
                .collect();
            println!("{}", header.join(" | "));
            for student in &students {
                let probability = model
                    .and_then(|m| student.prediction_for(m))
                    .map(|p| format!("{:.1}%", p.predicted_prob * 100.0))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} | {} | {} | {} | sessions {}/4 | {}",
                    student.full_name,
                    display(student.math_score),
                    display(student.russian_score),
                    display(student.ege_score),
                    student.sessions_passed(),
                    probability
                );
            }
        }
        Commands::Predict {
            direction,
            model,
            ids,
            all,
        } => {
            open(&cascade, direction, model).await?;
            let workflow = PredictionWorkflow::new(cascade.clone());
            let outcome = if all {
                let visible: Vec<i64> = cascade.students().await.iter().map(|s| s.id).collect();
                if let (Some(first), Some(last)) = (visible.first(), visible.last()) {
                    cascade.toggle_student(*first, 0, false, &visible).await;
                    cascade
                        .toggle_student(*last, visible.len() - 1, true, &visible)
                        .await;
                }
                workflow.run_for_selection().await
            } else {
                let ids: BTreeSet<i64> = ids.into_iter().collect();
                workflow.run_batch(&ids, Some(model)).await
            }?;
            println!("Scored {} students with model {model}.", outcome.submitted);
        }
        Commands::Train {
            direction,
            fields,
            target,
            name,
            model_type,
        } => {
            let request = TrainRequest {
                fields,
                target,
                model_name: name,
                direction_id: direction,
                model_type,
            };
            request.validate().map_err(DashboardError::Validation)?;
            let result = backend.train_model(&request).await?;
            println!("Training finished.");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Metrics { model } => {
            let metrics = backend.model_metrics(model).await?;
            println!("Features: {}", metrics.feature_columns.join(", "));
            println!("{}", serde_json::to_string_pretty(&metrics.metrics)?);
        }
        Commands::Report {
            direction,
            model,
            chart,
            out,
            preview,
        } => {
            cascade.load_directions().await?;
            open(&cascade, direction, model).await?;

            for raw in &chart {
                let request = parse_chart(raw)?;
                match cascade.add_chart(request).await {
                    Ok(chart) => tracing::info!(chart_id = %chart.id, "chart ready"),
                    Err(e @ DashboardError::DuplicateChart { .. }) => {
                        tracing::warn!(error = %e, "skipping chart");
                    }
                    Err(e) => return Err(e).with_context(|| format!("chart '{raw}'")),
                }
            }

            let state = cascade.snapshot().await;
            let direction_name = state
                .directions
                .iter()
                .find(|d| d.id == direction)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| direction.to_string());
            let model_name = state
                .models
                .iter()
                .find(|m| m.id == model)
                .map(|m| m.name.clone())
                .unwrap_or_else(|| model.to_string());
            let charts = cascade.current_charts().await;

            let output = report::build_report(&ReportContext {
                direction: &direction_name,
                model_id: model,
                model_name: &model_name,
                students: &state.students,
                charts: &charts,
                preview_limit: preview.unwrap_or(config.preview_limit),
            });
            std::fs::write(&out, output)?;

            let summary = risk::summarize(&state.students, model);
            println!(
                "Report written to {} ({} students, {} high risk).",
                out.display(),
                summary.total,
                summary.high_risk
            );
        }
    }

    Ok(())
}

async fn open(cascade: &CascadeController, direction: i64, model: i64) -> anyhow::Result<()> {
    cascade
        .select_direction(Some(direction))
        .await
        .with_context(|| format!("failed to open dataset {direction}"))?;
    let report = cascade
        .select_model(Some(model))
        .await
        .with_context(|| format!("failed to open model {model}"))?;
    for (chart_id, message) in &report.failed {
        tracing::warn!(%chart_id, %message, "chart kept stale data");
    }
    Ok(())
}

fn parse_sort(keys: &[String]) -> anyhow::Result<SortState> {
    let mut parsed = Vec::new();
    for raw in keys {
        let (key, direction) = match raw.split_once(':') {
            Some((key, "asc")) => (key, SortDirection::Asc),
            Some((key, "desc")) => (key, SortDirection::Desc),
            Some((_, other)) => anyhow::bail!("unknown sort direction '{other}' in '{raw}'"),
            None => (raw.as_str(), SortDirection::Asc),
        };
        parsed.push(SortKey {
            key: key.to_string(),
            direction,
        });
    }
    Ok(SortState::from_keys(parsed))
}

fn parse_chart(raw: &str) -> anyhow::Result<ChartRequest> {
    let mut parts = raw.splitn(3, ':');
    let subject = parts.next().unwrap_or_default().trim();
    let category: ChartCategory = parts
        .next()
        .context("chart needs subject:category")?
        .parse()
        .map_err(anyhow::Error::msg)?;
    Ok(match category {
        ChartCategory::ProbabilityIntervals => ChartRequest::probability_intervals(subject),
        ChartCategory::MarginEffect => {
            let x_values = parse_x_values(parts.next().unwrap_or(DEFAULT_X_VALUES));
            ChartRequest::margin_effect(subject, x_values)
        }
    })
}

fn display(value: Option<i32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
