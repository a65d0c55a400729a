//! Request/response contract with the prediction backend.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::charts::{Buckets, MarginPoint};
use crate::error::BackendError;
use crate::models::{
    Direction, DirectionId, ModelId, ModelMetrics, ModelSummary, Student, StudentDraft, StudentId,
    StudentPatch, TrainRequest,
};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Everything the dashboard needs from the backend.
///
/// Implementations own transport concerns (timeouts, retries, atomicity of
/// batch scoring). Every failure is reported as a [`BackendError`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_directions(&self) -> BackendResult<Vec<Direction>>;

    async fn create_direction(&self, id: DirectionId, name: &str) -> BackendResult<()>;

    async fn update_direction(&self, id: DirectionId, name: &str) -> BackendResult<()>;

    async fn delete_direction(&self, id: DirectionId) -> BackendResult<()>;

    /// Lists models, scoped to a direction when one is given.
    async fn list_models(&self, direction: Option<DirectionId>) -> BackendResult<Vec<ModelSummary>>;

    async fn model_metrics(&self, model: ModelId) -> BackendResult<ModelMetrics>;

    /// Feature columns a model was trained on. These are the chart subjects.
    async fn feature_columns(&self, model: ModelId) -> BackendResult<Vec<String>>;

    async fn delete_model(&self, model: ModelId) -> BackendResult<()>;

    async fn train_model(&self, request: &TrainRequest) -> BackendResult<serde_json::Value>;

    /// Scores all `ids` against `model` in one request.
    async fn predict(&self, ids: &[StudentId], model: ModelId) -> BackendResult<()>;

    async fn probability_intervals(
        &self,
        model: ModelId,
        subject: &str,
        direction: Option<DirectionId>,
    ) -> BackendResult<Buckets>;

    /// Margin effect of `subject` at each of `x_values`, in input order.
    async fn margin_effect(
        &self,
        model: ModelId,
        subject: &str,
        x_values: &[f64],
    ) -> BackendResult<Vec<MarginPoint>>;

    async fn students_with_predictions(
        &self,
        direction: DirectionId,
        model: ModelId,
    ) -> BackendResult<Vec<Student>>;

    async fn students(&self, direction: Option<DirectionId>) -> BackendResult<Vec<Student>>;

    async fn create_student(&self, draft: &StudentDraft) -> BackendResult<()>;

    async fn update_student(&self, id: StudentId, patch: &StudentPatch) -> BackendResult<()>;

    async fn delete_student(&self, id: StudentId) -> BackendResult<()>;
}

#[derive(Debug, Serialize)]
struct PredictBody<'a> {
    ids: &'a [StudentId],
    model_id: ModelId,
}

#[derive(Debug, Serialize)]
struct MarginEffectBody<'a> {
    target_name: &'a str,
    x_values: &'a [f64],
    model_id: ModelId,
}

#[derive(Debug, Deserialize)]
struct MarginEffectResponse {
    #[serde(default)]
    effects: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbabilityIntervalsResponse {
    #[serde(default, deserialize_with = "ordered_buckets")]
    probability_intervals: Buckets,
}

/// Reads a JSON object of label to value without reordering its keys.
fn ordered_buckets<'de, D>(deserializer: D) -> Result<Buckets, D::Error>
where
    D: Deserializer<'de>,
{
    struct BucketsVisitor;

    impl<'de> Visitor<'de> for BucketsVisitor {
        type Value = Buckets;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of interval labels to probabilities")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Buckets, A::Error> {
            let mut buckets = Vec::with_capacity(map.size_hint().unwrap_or_default());
            while let Some((label, value)) = map.next_entry::<String, f64>()? {
                buckets.push((label, value));
            }
            Ok(buckets)
        }
    }

    deserializer.deserialize_map(BucketsVisitor)
}

#[derive(Debug, Deserialize)]
struct LoadedModelResponse {
    #[serde(default)]
    feature_columns: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DirectionBody<'a> {
    name: &'a str,
}

/// Pairs requested x-values with returned effects. Surplus on either side is dropped.
pub fn zip_margin_effects(x_values: &[f64], effects: &[f64]) -> Vec<MarginPoint> {
    x_values
        .iter()
        .zip(effects)
        .map(|(x, y)| MarginPoint { x: *x, y: *y })
        .collect()
}

/// JSON-over-HTTP client for the dashboard REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::transport("client", e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> BackendResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::transport(endpoint, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(target: "backend", %endpoint, status = status.as_u16(), "request rejected");
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> BackendResult<T> {
        let response = self.send(endpoint, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::decode(endpoint, e.to_string()))
    }

    async fn execute(&self, endpoint: &str, request: RequestBuilder) -> BackendResult<()> {
        self.send(endpoint, request).await.map(|_| ())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_directions(&self) -> BackendResult<Vec<Direction>> {
        let request = self.client.get(self.url("directions/all/"));
        self.fetch("directions/all", request).await
    }

    async fn create_direction(&self, id: DirectionId, name: &str) -> BackendResult<()> {
        let request = self
            .client
            .post(self.url("directions/"))
            .query(&[("direction_id", id.to_string()), ("name", name.to_string())]);
        self.execute("directions/create", request).await
    }

    async fn update_direction(&self, id: DirectionId, name: &str) -> BackendResult<()> {
        let request = self
            .client
            .put(self.url(&format!("directions/{id}")))
            .json(&DirectionBody { name });
        self.execute("directions/update", request).await
    }

    async fn delete_direction(&self, id: DirectionId) -> BackendResult<()> {
        let request = self.client.delete(self.url(&format!("directions/{id}")));
        self.execute("directions/delete", request).await
    }

    async fn list_models(&self, direction: Option<DirectionId>) -> BackendResult<Vec<ModelSummary>> {
        let path = match direction {
            Some(id) => format!("ml/direction/{id}"),
            None => "ml/".to_string(),
        };
        let request = self.client.get(self.url(&path));
        self.fetch("ml/list", request).await
    }

    async fn model_metrics(&self, model: ModelId) -> BackendResult<ModelMetrics> {
        let request = self.client.get(self.url(&format!("ml/{model}/metrics")));
        self.fetch("ml/metrics", request).await
    }

    async fn feature_columns(&self, model: ModelId) -> BackendResult<Vec<String>> {
        let request = self
            .client
            .get(self.url("ml/load"))
            .query(&[("model_id", model)]);
        let loaded: LoadedModelResponse = self.fetch("ml/load", request).await?;
        Ok(loaded.feature_columns)
    }

    async fn delete_model(&self, model: ModelId) -> BackendResult<()> {
        let request = self.client.delete(self.url(&format!("ml/{model}")));
        self.execute("ml/delete", request).await
    }

    async fn train_model(&self, request: &TrainRequest) -> BackendResult<serde_json::Value> {
        let builder = self.client.post(self.url("ml/train/")).json(request);
        self.fetch("ml/train", builder).await
    }

    async fn predict(&self, ids: &[StudentId], model: ModelId) -> BackendResult<()> {
        let request = self
            .client
            .post(self.url("ml/predict/by_ids"))
            .json(&PredictBody {
                ids,
                model_id: model,
            });
        self.execute("ml/predict/by_ids", request).await
    }

    async fn probability_intervals(
        &self,
        model: ModelId,
        subject: &str,
        direction: Option<DirectionId>,
    ) -> BackendResult<Buckets> {
        let mut query = vec![
            ("model_id", model.to_string()),
            ("target_feature", subject.to_string()),
        ];
        if let Some(direction) = direction {
            query.push(("direction_id", direction.to_string()));
        }
        let request = self
            .client
            .get(self.url("analysis/probability-intervals"))
            .query(&query);
        let response: ProbabilityIntervalsResponse =
            self.fetch("analysis/probability-intervals", request).await?;
        Ok(response.probability_intervals)
    }

    async fn margin_effect(
        &self,
        model: ModelId,
        subject: &str,
        x_values: &[f64],
    ) -> BackendResult<Vec<MarginPoint>> {
        let request = self
            .client
            .post(self.url("ml/margin_effect"))
            .json(&MarginEffectBody {
                target_name: subject,
                x_values,
                model_id: model,
            });
        let response: MarginEffectResponse = self.fetch("ml/margin_effect", request).await?;
        Ok(zip_margin_effects(x_values, &response.effects))
    }

    async fn students_with_predictions(
        &self,
        direction: DirectionId,
        model: ModelId,
    ) -> BackendResult<Vec<Student>> {
        let request = self
            .client
            .get(self.url("students/with_relations"))
            .query(&[("direction_id", direction), ("model_id", model)]);
        self.fetch("students/with_relations", request).await
    }

    async fn students(&self, direction: Option<DirectionId>) -> BackendResult<Vec<Student>> {
        let mut request = self.client.get(self.url("students/by_filters"));
        if let Some(direction) = direction {
            request = request.query(&[("direction_id", direction)]);
        }
        self.fetch("students/by_filters", request).await
    }

    async fn create_student(&self, draft: &StudentDraft) -> BackendResult<()> {
        let request = self.client.post(self.url("students/")).json(draft);
        self.execute("students/create", request).await
    }

    async fn update_student(&self, id: StudentId, patch: &StudentPatch) -> BackendResult<()> {
        let request = self
            .client
            .put(self.url(&format!("students/{id}")))
            .json(patch);
        self.execute("students/update", request).await
    }

    async fn delete_student(&self, id: StudentId) -> BackendResult<()> {
        let request = self.client.delete(self.url(&format!("students/{id}")));
        self.execute("students/delete", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_effects_pair_by_position() {
        let points = zip_margin_effects(&[1.0, 10.0, 15.0], &[0.02, 0.05]);
        assert_eq!(
            points,
            vec![
                MarginPoint { x: 1.0, y: 0.02 },
                MarginPoint { x: 10.0, y: 0.05 }
            ]
        );
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let backend = HttpBackend::new("http://localhost:7000/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:7000");
        assert_eq!(
            backend.url("/directions/all/"),
            "http://localhost:7000/directions/all/"
        );
    }

    #[test]
    fn wire_bodies_use_backend_field_names() {
        let body = serde_json::to_value(PredictBody {
            ids: &[1, 2],
            model_id: 7,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"ids": [1, 2], "model_id": 7}));

        let response: ProbabilityIntervalsResponse = serde_json::from_value(serde_json::json!({
            "probability_intervals": {"0.0-12.5": 0.4, "12.5-25.0": 0.6}
        }))
        .unwrap();
        assert_eq!(response.probability_intervals.len(), 2);
    }

    #[test]
    fn interval_labels_keep_wire_order() {
        let response: ProbabilityIntervalsResponse = serde_json::from_str(
            r#"{"probability_intervals": {"zeta": 0.1, "12.5-25.0": 0.6, "alpha": 0.3}}"#,
        )
        .unwrap();
        let labels: Vec<&str> = response
            .probability_intervals
            .iter()
            .map(|(label, _)| label.as_str())
            .collect();
        assert_eq!(labels, vec!["zeta", "12.5-25.0", "alpha"]);

        let empty: ProbabilityIntervalsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.probability_intervals.is_empty());
    }
}
