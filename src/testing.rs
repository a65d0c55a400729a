//! In-memory backend for tests and offline demos.
//!
//! Every call is keyed (see the `*_key` helpers). A key can be set to fail,
//! or held behind a gate so tests can control the order in which concurrent
//! responses land.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::backend::{zip_margin_effects, Backend, BackendResult};
use crate::charts::{Buckets, MarginPoint};
use crate::error::BackendError;
use crate::models::{
    Direction, DirectionId, ModelId, ModelMetrics, ModelSummary, Prediction, Student,
    StudentDraft, StudentId, StudentPatch, TrainRequest,
};

#[derive(Default)]
struct Script {
    directions: Vec<Direction>,
    models: Vec<(DirectionId, ModelSummary, Vec<String>)>,
    students: Vec<Student>,
    predictions: HashMap<(StudentId, ModelId), Prediction>,
    intervals: HashMap<(ModelId, String), Buckets>,
    effects: HashMap<(ModelId, String), Vec<f64>>,
    failing: HashSet<String>,
    gates: HashMap<String, Arc<Notify>>,
    calls: Vec<String>,
    next_probability: f64,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.lock().next_probability = 0.75;
        backend
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn students_key(direction: DirectionId, model: ModelId) -> String {
        format!("students:{direction}:{model}")
    }

    pub fn models_key(direction: Option<DirectionId>) -> String {
        match direction {
            Some(id) => format!("models:{id}"),
            None => "models:all".to_string(),
        }
    }

    pub fn intervals_key(model: ModelId, subject: &str) -> String {
        format!("intervals:{model}:{subject}")
    }

    pub fn margin_key(model: ModelId, subject: &str) -> String {
        format!("margin:{model}:{subject}")
    }

    pub fn predict_key(model: ModelId) -> String {
        format!("predict:{model}")
    }

    pub fn features_key(model: ModelId) -> String {
        format!("features:{model}")
    }

    pub fn add_direction(&self, id: DirectionId, name: &str) {
        self.lock().directions.push(Direction {
            id,
            name: name.to_string(),
            count_student: 0,
        });
    }

    pub fn add_model(&self, direction: DirectionId, id: ModelId, name: &str, features: &[&str]) {
        self.lock().models.push((
            direction,
            ModelSummary {
                id,
                name: name.to_string(),
                description: None,
            },
            features.iter().map(|f| f.to_string()).collect(),
        ));
    }

    pub fn add_student(&self, student: Student) {
        let mut script = self.lock();
        if let Some(direction) = script
            .directions
            .iter_mut()
            .find(|d| d.id == student.direction_id)
        {
            direction.count_student += 1;
        }
        script.students.push(student);
    }

    pub fn set_prediction(&self, student: StudentId, model: ModelId, probability: f64) {
        self.lock()
            .predictions
            .insert((student, model), prediction(student, model, probability));
    }

    /// Probability assigned to students scored by the next `predict` call.
    pub fn set_next_probability(&self, probability: f64) {
        self.lock().next_probability = probability;
    }

    pub fn set_intervals(
        &self,
        model: ModelId,
        subject: &str,
        buckets: impl IntoIterator<Item = (String, f64)>,
    ) {
        self.lock()
            .intervals
            .insert((model, subject.to_string()), buckets.into_iter().collect());
    }

    pub fn set_margin_effects(&self, model: ModelId, subject: &str, effects: &[f64]) {
        self.lock()
            .effects
            .insert((model, subject.to_string()), effects.to_vec());
    }

    pub fn fail(&self, key: impl Into<String>) {
        self.lock().failing.insert(key.into());
    }

    pub fn recover(&self, key: &str) {
        self.lock().failing.remove(key);
    }

    /// Holds the next call for `key` until the returned gate is notified.
    pub fn hold(&self, key: impl Into<String>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().gates.insert(key.into(), gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    async fn enter(&self, key: String) -> BackendResult<()> {
        let gate = {
            let mut script = self.lock();
            script.calls.push(key.clone());
            script.gates.remove(&key)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.lock().failing.contains(&key) {
            return Err(BackendError::transport(key, "scripted failure"));
        }
        Ok(())
    }
}

fn prediction(student: StudentId, model: ModelId, probability: f64) -> Prediction {
    Prediction {
        model_id: Some(model),
        student_id: Some(student),
        predicted_prob: probability,
        predicted_class: i32::from(probability > 0.5),
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn list_directions(&self) -> BackendResult<Vec<Direction>> {
        self.enter("directions".to_string()).await?;
        Ok(self.lock().directions.clone())
    }

    async fn create_direction(&self, id: DirectionId, name: &str) -> BackendResult<()> {
        self.enter(format!("directions:create:{id}")).await?;
        self.add_direction(id, name);
        Ok(())
    }

    async fn update_direction(&self, id: DirectionId, name: &str) -> BackendResult<()> {
        self.enter(format!("directions:update:{id}")).await?;
        let mut script = self.lock();
        if let Some(direction) = script.directions.iter_mut().find(|d| d.id == id) {
            direction.name = name.to_string();
        }
        Ok(())
    }

    async fn delete_direction(&self, id: DirectionId) -> BackendResult<()> {
        self.enter(format!("directions:delete:{id}")).await?;
        self.lock().directions.retain(|d| d.id != id);
        Ok(())
    }

    async fn list_models(&self, direction: Option<DirectionId>) -> BackendResult<Vec<ModelSummary>> {
        self.enter(Self::models_key(direction)).await?;
        Ok(self
            .lock()
            .models
            .iter()
            .filter(|(d, _, _)| direction.map_or(true, |id| *d == id))
            .map(|(_, model, _)| model.clone())
            .collect())
    }

    async fn model_metrics(&self, model: ModelId) -> BackendResult<ModelMetrics> {
        self.enter(format!("metrics:{model}")).await?;
        let script = self.lock();
        let (direction, _, features) = script
            .models
            .iter()
            .find(|(_, m, _)| m.id == model)
            .ok_or_else(|| BackendError::Status {
                endpoint: format!("metrics:{model}"),
                status: 404,
            })?;
        Ok(ModelMetrics {
            metrics: serde_json::json!({"Correct Predictions (%)": 81.5}),
            feature_columns: features.clone(),
            direction_id: Some(*direction),
        })
    }

    async fn feature_columns(&self, model: ModelId) -> BackendResult<Vec<String>> {
        self.enter(Self::features_key(model)).await?;
        Ok(self
            .lock()
            .models
            .iter()
            .find(|(_, m, _)| m.id == model)
            .map(|(_, _, features)| features.clone())
            .unwrap_or_default())
    }

    async fn delete_model(&self, model: ModelId) -> BackendResult<()> {
        self.enter(format!("models:delete:{model}")).await?;
        self.lock().models.retain(|(_, m, _)| m.id != model);
        Ok(())
    }

    async fn train_model(&self, request: &TrainRequest) -> BackendResult<serde_json::Value> {
        self.enter("train".to_string()).await?;
        let mut script = self.lock();
        let id = script.models.iter().map(|(_, m, _)| m.id).max().unwrap_or(0) + 1;
        script.models.push((
            request.direction_id,
            ModelSummary {
                id,
                name: request.model_name.clone(),
                description: Some(request.model_type.as_str().to_string()),
            },
            request.fields.clone(),
        ));
        Ok(serde_json::json!({"status": "trained", "model_id": id}))
    }

    async fn predict(&self, ids: &[StudentId], model: ModelId) -> BackendResult<()> {
        self.enter(Self::predict_key(model)).await?;
        let mut script = self.lock();
        let probability = script.next_probability;
        for id in ids {
            script
                .predictions
                .insert((*id, model), prediction(*id, model, probability));
        }
        Ok(())
    }

    async fn probability_intervals(
        &self,
        model: ModelId,
        subject: &str,
        _direction: Option<DirectionId>,
    ) -> BackendResult<Buckets> {
        self.enter(Self::intervals_key(model, subject)).await?;
        Ok(self
            .lock()
            .intervals
            .get(&(model, subject.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn margin_effect(
        &self,
        model: ModelId,
        subject: &str,
        x_values: &[f64],
    ) -> BackendResult<Vec<MarginPoint>> {
        self.enter(Self::margin_key(model, subject)).await?;
        let effects = self
            .lock()
            .effects
            .get(&(model, subject.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(zip_margin_effects(x_values, &effects))
    }

    async fn students_with_predictions(
        &self,
        direction: DirectionId,
        model: ModelId,
    ) -> BackendResult<Vec<Student>> {
        self.enter(Self::students_key(direction, model)).await?;
        let script = self.lock();
        Ok(script
            .students
            .iter()
            .filter(|s| s.direction_id == direction)
            .map(|s| Student {
                prediction: script
                    .predictions
                    .get(&(s.id, model))
                    .cloned()
                    .into_iter()
                    .collect(),
                ..s.clone()
            })
            .collect())
    }

    async fn students(&self, direction: Option<DirectionId>) -> BackendResult<Vec<Student>> {
        self.enter("students:list".to_string()).await?;
        Ok(self
            .lock()
            .students
            .iter()
            .filter(|s| direction.map_or(true, |id| s.direction_id == id))
            .cloned()
            .collect())
    }

    async fn create_student(&self, draft: &StudentDraft) -> BackendResult<()> {
        self.enter("students:create".to_string()).await?;
        let id = self.lock().students.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        self.add_student(Student {
            id,
            full_name: draft.full_name.clone(),
            math_score: Some(draft.math_score),
            russian_score: Some(draft.russian_score),
            ege_score: Some(draft.ege_score),
            session_1_passed: draft.session_1_passed,
            session_2_passed: draft.session_2_passed,
            session_3_passed: draft.session_3_passed,
            session_4_passed: draft.session_4_passed,
            direction_id: draft.direction_id,
            prediction: Vec::new(),
        });
        Ok(())
    }

    async fn update_student(&self, id: StudentId, patch: &StudentPatch) -> BackendResult<()> {
        self.enter(format!("students:update:{id}")).await?;
        let mut script = self.lock();
        let student = script
            .students
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BackendError::Status {
                endpoint: format!("students:update:{id}"),
                status: 404,
            })?;
        if let Some(name) = &patch.full_name {
            student.full_name = name.clone();
        }
        if patch.math_score.is_some() {
            student.math_score = patch.math_score;
        }
        if patch.russian_score.is_some() {
            student.russian_score = patch.russian_score;
        }
        if patch.ege_score.is_some() {
            student.ege_score = patch.ege_score;
        }
        if let Some(direction) = patch.direction_id {
            student.direction_id = direction;
        }
        Ok(())
    }

    async fn delete_student(&self, id: StudentId) -> BackendResult<()> {
        self.enter(format!("students:delete:{id}")).await?;
        self.lock().students.retain(|s| s.id != id);
        Ok(())
    }
}

/// A student with the given scores and no predictions.
pub fn student(id: StudentId, name: &str, direction: DirectionId, math: i32, russian: i32) -> Student {
    Student {
        id,
        full_name: name.to_string(),
        math_score: Some(math),
        russian_score: Some(russian),
        ege_score: Some(math + russian),
        session_1_passed: true,
        session_2_passed: math > 50,
        session_3_passed: false,
        session_4_passed: false,
        direction_id: direction,
        prediction: Vec::new(),
    }
}
