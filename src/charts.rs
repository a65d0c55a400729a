//! Per-model chart configurations and their cached series.
//!
//! Each model owns an immutable snapshot (`Arc<Vec<Chart>>`). Writers build a
//! new vector and swap it in, so readers never see a half-applied update.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::backend::{Backend, BackendResult};
use crate::error::{DashboardError, Level, Result};
use crate::models::{DirectionId, ModelId};

pub const DEFAULT_X_VALUES: &str = "1, 10, 15";

/// Interval label to mean probability, in the order the backend sent them.
pub type Buckets = Vec<(String, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartCategory {
    ProbabilityIntervals,
    MarginEffect,
}

impl ChartCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartCategory::ProbabilityIntervals => "probability_intervals",
            ChartCategory::MarginEffect => "margin_effect",
        }
    }

    pub fn y_label(&self) -> &'static str {
        match self {
            ChartCategory::ProbabilityIntervals => "Probability",
            ChartCategory::MarginEffect => "Effect",
        }
    }
}

impl fmt::Display for ChartCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChartCategory {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim() {
            "probability_intervals" => Ok(ChartCategory::ProbabilityIntervals),
            "margin_effect" => Ok(ChartCategory::MarginEffect),
            other => Err(format!(
                "unknown chart category '{other}' (expected probability_intervals or margin_effect)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginPoint {
    pub x: f64,
    pub y: f64,
}

/// Series data, shaped by chart category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "snake_case")]
pub enum ChartSeries {
    /// Interval label (`"<lower>-<upper>"`) to mean probability.
    ProbabilityIntervals(Buckets),
    /// Points in the order the x-values were requested.
    MarginEffect(Vec<MarginPoint>),
}

impl ChartSeries {
    pub fn category(&self) -> ChartCategory {
        match self {
            ChartSeries::ProbabilityIntervals(_) => ChartCategory::ProbabilityIntervals,
            ChartSeries::MarginEffect(_) => ChartCategory::MarginEffect,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ChartSeries::ProbabilityIntervals(buckets) => buckets.is_empty(),
            ChartSeries::MarginEffect(points) => points.is_empty(),
        }
    }

    /// Buckets ordered by the numeric lower bound of their label.
    ///
    /// Labels whose lower bound does not parse keep their relative order and
    /// follow every parsable bucket.
    pub fn sorted_buckets(&self) -> Vec<(&str, f64)> {
        let ChartSeries::ProbabilityIntervals(buckets) = self else {
            return Vec::new();
        };
        let mut rows: Vec<(&str, f64, Option<f64>)> = buckets
            .iter()
            .map(|(label, value)| (label.as_str(), *value, lower_bound(label)))
            .collect();
        rows.sort_by(|a, b| match (a.2, b.2) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        rows.into_iter().map(|(label, value, _)| (label, value)).collect()
    }

    pub fn points(&self) -> &[MarginPoint] {
        match self {
            ChartSeries::MarginEffect(points) => points,
            ChartSeries::ProbabilityIntervals(_) => &[],
        }
    }
}

fn lower_bound(label: &str) -> Option<f64> {
    label
        .split('-')
        .next()
        .and_then(|lower| lower.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// What the user asks for when adding a chart.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub subject: String,
    pub category: ChartCategory,
    /// Only used by margin-effect charts.
    pub x_values: Vec<f64>,
    pub title: Option<String>,
}

impl ChartRequest {
    pub fn probability_intervals(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            category: ChartCategory::ProbabilityIntervals,
            x_values: Vec::new(),
            title: None,
        }
    }

    pub fn margin_effect(subject: impl Into<String>, x_values: Vec<f64>) -> Self {
        Self {
            subject: subject.into(),
            category: ChartCategory::MarginEffect,
            x_values,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: String,
    pub model_id: ModelId,
    pub direction_id: Option<DirectionId>,
    pub title: String,
    pub subject: String,
    pub x_label: String,
    pub y_label: String,
    #[serde(default)]
    pub x_values: Vec<f64>,
    pub series: ChartSeries,
    pub refreshed_at: DateTime<Utc>,
}

impl Chart {
    pub fn category(&self) -> ChartCategory {
        self.series.category()
    }
}

/// Deterministic chart id: `<model>_<subject>_<category>`, lower-cased, with
/// every whitespace run replaced by one underscore.
pub fn chart_id(model: ModelId, subject: &str, category: ChartCategory) -> String {
    let raw = format!("{model}_{subject}_{category}").to_lowercase();
    let mut id = String::with_capacity(raw.len());
    let mut in_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            if !in_space {
                id.push('_');
            }
            in_space = true;
        } else {
            id.push(ch);
            in_space = false;
        }
    }
    id
}

/// Parses a comma-separated list of x-values, discarding non-numeric entries.
pub fn parse_x_values(input: &str) -> Vec<f64> {
    input
        .split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .collect()
}

/// Outcome of refreshing every chart of one model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    /// Chart id and failure message. These charts kept their previous data.
    pub failed: Vec<(String, String)>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.refreshed.len() + self.failed.len()
    }
}

#[derive(Default)]
struct Charts {
    by_model: HashMap<ModelId, Arc<Vec<Chart>>>,
    /// Bumped by `clear_all`.
    generation: u64,
    /// Bumped per model by `clear_model`.
    cleared: HashMap<ModelId, u64>,
}

impl Charts {
    /// Tag a fetch for `model` is issued under. Any clear touching the
    /// model changes it.
    fn tag(&self, model: ModelId) -> (u64, u64) {
        (
            self.generation,
            self.cleared.get(&model).copied().unwrap_or_default(),
        )
    }
}

pub struct ChartRegistry {
    backend: Arc<dyn Backend>,
    charts: RwLock<Charts>,
}

impl ChartRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            charts: RwLock::new(Charts::default()),
        }
    }

    /// Snapshot of the charts registered under `model`.
    pub async fn charts(&self, model: ModelId) -> Arc<Vec<Chart>> {
        let charts = self.charts.read().await;
        charts.by_model.get(&model).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> HashMap<ModelId, Arc<Vec<Chart>>> {
        self.charts.read().await.by_model.clone()
    }

    /// True when any model has at least one chart.
    pub async fn has_charts(&self) -> bool {
        let charts = self.charts.read().await;
        charts.by_model.values().any(|list| !list.is_empty())
    }

    /// Fetches the series for a new chart and registers it under `model`.
    ///
    /// If the model's charts are cleared while the series is loading, the
    /// chart is dropped and `Superseded` is returned.
    pub async fn add_chart(
        &self,
        model: ModelId,
        direction: Option<DirectionId>,
        request: ChartRequest,
    ) -> Result<Chart> {
        let subject = request.subject.trim();
        if subject.is_empty() {
            return Err(DashboardError::validation("select a subject for the chart"));
        }
        if request.category == ChartCategory::MarginEffect && request.x_values.is_empty() {
            return Err(DashboardError::validation(
                "enter numeric x-values separated by commas",
            ));
        }

        let id = chart_id(model, subject, request.category);
        let tag = {
            let charts = self.charts.read().await;
            let exists = charts
                .by_model
                .get(&model)
                .is_some_and(|list| list.iter().any(|c| c.id == id));
            if exists {
                tracing::warn!(target: "charts", chart_id = %id, "duplicate chart rejected");
                return Err(DashboardError::DuplicateChart { chart_id: id });
            }
            charts.tag(model)
        };

        let series = fetch_series(
            self.backend.as_ref(),
            model,
            direction,
            subject,
            request.category,
            &request.x_values,
        )
        .await
        .map_err(|e| DashboardError::fetch(Level::Charts, e))?;

        let chart = Chart {
            id: id.clone(),
            model_id: model,
            direction_id: direction,
            title: request
                .title
                .clone()
                .unwrap_or_else(|| format!("{subject} ({})", request.category)),
            subject: subject.to_string(),
            x_label: subject.to_string(),
            y_label: request.category.y_label().to_string(),
            x_values: request.x_values.clone(),
            series,
            refreshed_at: Utc::now(),
        };

        let mut charts = self.charts.write().await;
        if charts.tag(model) != tag {
            tracing::debug!(target: "charts", model, chart_id = %id, "charts cleared while loading, dropping chart");
            return Err(DashboardError::Superseded { chart_id: id });
        }
        let current = charts.by_model.get(&model).cloned().unwrap_or_default();
        // Another add for the same id may have landed while we were fetching.
        if current.iter().any(|c| c.id == id) {
            return Err(DashboardError::DuplicateChart { chart_id: id });
        }
        let mut next = current.to_vec();
        next.push(chart.clone());
        charts.by_model.insert(model, Arc::new(next));
        tracing::info!(target: "charts", model, chart_id = %id, "chart added");
        Ok(chart)
    }

    /// Removes a chart. Returns whether anything was removed.
    pub async fn remove_chart(&self, model: ModelId, chart_id: &str) -> bool {
        let mut charts = self.charts.write().await;
        let Some(current) = charts.by_model.get(&model).cloned() else {
            return false;
        };
        if !current.iter().any(|c| c.id == chart_id) {
            return false;
        }
        let next: Vec<Chart> = current
            .iter()
            .filter(|c| c.id != chart_id)
            .cloned()
            .collect();
        charts.by_model.insert(model, Arc::new(next));
        tracing::info!(target: "charts", model, chart_id, "chart removed");
        true
    }

    /// Re-fetches every chart of `model` concurrently.
    ///
    /// A failing chart keeps its previous series and does not stop the
    /// others. Charts removed while the fetches were running stay removed,
    /// and if the model's charts were cleared meanwhile the results are
    /// dropped.
    pub async fn refresh_all(&self, model: ModelId) -> RefreshReport {
        let (current, tag) = {
            let charts = self.charts.read().await;
            (
                charts.by_model.get(&model).cloned().unwrap_or_default(),
                charts.tag(model),
            )
        };
        if current.is_empty() {
            return RefreshReport::default();
        }

        let backend = self.backend.as_ref();
        let results = join_all(current.iter().map(|chart| async move {
            let result = fetch_series(
                backend,
                model,
                chart.direction_id,
                &chart.subject,
                chart.category(),
                &chart.x_values,
            )
            .await;
            (chart.id.clone(), result)
        }))
        .await;

        let mut report = RefreshReport::default();
        let mut fresh: HashMap<String, ChartSeries> = HashMap::new();
        for (id, result) in results {
            match result {
                Ok(series) => {
                    fresh.insert(id.clone(), series);
                    report.refreshed.push(id);
                }
                Err(e) => {
                    tracing::warn!(target: "charts", chart_id = %id, error = %e, "chart refresh failed, keeping previous data");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        let mut charts = self.charts.write().await;
        let latest = match charts.by_model.get(&model) {
            Some(latest) if charts.tag(model) == tag => latest.clone(),
            _ => {
                tracing::debug!(target: "charts", model, "charts cleared during refresh, dropping results");
                return report;
            }
        };
        let refreshed_at = Utc::now();
        let next: Vec<Chart> = latest
            .iter()
            .map(|chart| match fresh.remove(&chart.id) {
                Some(series) => Chart {
                    series,
                    refreshed_at,
                    ..chart.clone()
                },
                None => chart.clone(),
            })
            .collect();
        charts.by_model.insert(model, Arc::new(next));
        tracing::info!(
            target: "charts",
            model,
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "charts refreshed"
        );
        report
    }

    pub async fn clear_model(&self, model: ModelId) {
        let mut charts = self.charts.write().await;
        *charts.cleared.entry(model).or_default() += 1;
        if charts.by_model.remove(&model).is_some() {
            tracing::info!(target: "charts", model, "charts cleared for model");
        }
    }

    pub async fn clear_all(&self) {
        let mut charts = self.charts.write().await;
        charts.generation += 1;
        if !charts.by_model.is_empty() {
            tracing::info!(target: "charts", models = charts.by_model.len(), "all charts cleared");
        }
        charts.by_model.clear();
    }
}

async fn fetch_series(
    backend: &dyn Backend,
    model: ModelId,
    direction: Option<DirectionId>,
    subject: &str,
    category: ChartCategory,
    x_values: &[f64],
) -> BackendResult<ChartSeries> {
    match category {
        ChartCategory::ProbabilityIntervals => backend
            .probability_intervals(model, subject, direction)
            .await
            .map(ChartSeries::ProbabilityIntervals),
        ChartCategory::MarginEffect => backend
            .margin_effect(model, subject, x_values)
            .await
            .map(ChartSeries::MarginEffect),
    }
}
