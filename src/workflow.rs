//! Batch prediction for selected students.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cascade::CascadeController;
use crate::charts::RefreshReport;
use crate::error::{DashboardError, Result};
use crate::models::{ModelId, StudentId};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub charts: RefreshReport,
}

type InFlight = Arc<Mutex<BTreeSet<StudentId>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, BTreeSet<StudentId>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks ids as in flight and releases them on drop, including when the
/// batch future is cancelled.
struct InFlightGuard {
    set: InFlight,
    ids: Vec<StudentId>,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, ids: &BTreeSet<StudentId>) -> Result<Self> {
        let mut marked = lock(set);
        if ids.iter().any(|id| marked.contains(id)) {
            return Err(DashboardError::validation(
                "a prediction is already running for some of these students",
            ));
        }
        marked.extend(ids.iter().copied());
        Ok(Self {
            set: set.clone(),
            ids: ids.iter().copied().collect(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut marked = lock(&self.set);
        for id in &self.ids {
            marked.remove(id);
        }
    }
}

pub struct PredictionWorkflow {
    cascade: Arc<CascadeController>,
    in_flight: InFlight,
}

impl PredictionWorkflow {
    pub fn new(cascade: Arc<CascadeController>) -> Self {
        Self {
            cascade,
            in_flight: Arc::default(),
        }
    }

    /// Ids whose rows are locked by a running batch.
    pub fn in_flight(&self) -> BTreeSet<StudentId> {
        lock(&self.in_flight).clone()
    }

    pub fn is_in_flight(&self, id: StudentId) -> bool {
        lock(&self.in_flight).contains(&id)
    }

    pub fn is_busy(&self) -> bool {
        !lock(&self.in_flight).is_empty()
    }

    /// Scores `ids` against `model` in one backend request.
    ///
    /// On success the selection is cleared and the student list reloaded.
    /// Charts of the model are refreshed whether or not scoring succeeded.
    pub async fn run_batch(
        &self,
        ids: &BTreeSet<StudentId>,
        model: Option<ModelId>,
    ) -> Result<BatchOutcome> {
        let model = model.ok_or_else(|| DashboardError::validation("select a model for the prediction"))?;
        if ids.is_empty() {
            return Err(DashboardError::validation("select at least one student"));
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, ids)?;
        let batch: Vec<StudentId> = ids.iter().copied().collect();
        tracing::info!(target: "prediction", model, count = batch.len(), "submitting batch prediction");

        let scored = match self.cascade.backend().predict(&batch, model).await {
            Ok(()) => {
                self.cascade.clear_selection().await;
                if let Err(e) = self.cascade.reload_students().await {
                    tracing::warn!(target: "prediction", error = %e, "students not reloaded after prediction");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "prediction", model, error = %e, "batch prediction failed");
                Err(DashboardError::Workflow(e.to_string()))
            }
        };

        let charts = self.cascade.charts().refresh_all(model).await;
        scored.map(|()| BatchOutcome {
            submitted: batch.len(),
            charts,
        })
    }

    /// Runs a batch for the current selection and model.
    pub async fn run_for_selection(&self) -> Result<BatchOutcome> {
        let ids = self.cascade.selection().await.ids().clone();
        let model = self.cascade.selected_model().await;
        self.run_batch(&ids, model).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::charts::{ChartRegistry, ChartRequest};
    use crate::testing::{student, ScriptedBackend};

    async fn setup() -> (Arc<ScriptedBackend>, Arc<CascadeController>, PredictionWorkflow) {
        let backend = Arc::new(ScriptedBackend::new());
        backend.add_direction(1, "Applied Informatics");
        backend.add_model(1, 10, "logit-2024", &["math_score"]);
        backend.add_student(student(1, "Anna Petrova", 1, 72, 80));
        backend.add_student(student(2, "Ivan Sokolov", 1, 45, 61));
        backend.add_student(student(3, "Pavel Orlov", 1, 58, 70));
        backend.set_intervals(10, "math_score", BTreeMap::from([("0.0-50.0".to_string(), 0.2)]));

        let charts = Arc::new(ChartRegistry::new(backend.clone()));
        let cascade = Arc::new(CascadeController::new(backend.clone(), charts));
        cascade.select_direction(Some(1)).await.unwrap();
        cascade.select_model(Some(10)).await.unwrap();
        let workflow = PredictionWorkflow::new(cascade.clone());
        (backend, cascade, workflow)
    }

    #[tokio::test]
    async fn preconditions_issue_no_request() {
        let (backend, _cascade, workflow) = setup().await;
        let ids = BTreeSet::from([1]);

        assert!(workflow.run_batch(&ids, None).await.unwrap_err().is_validation());
        assert!(workflow
            .run_batch(&BTreeSet::new(), Some(10))
            .await
            .unwrap_err()
            .is_validation());
        assert_eq!(backend.count_calls("predict:"), 0);
    }

    #[tokio::test]
    async fn success_clears_selection_and_reloads_students() {
        let (backend, cascade, workflow) = setup().await;
        cascade.toggle_student(1, 0, false, &[1, 2, 3]).await;
        cascade.toggle_student(3, 2, true, &[1, 2, 3]).await;
        backend.set_next_probability(0.82);

        let outcome = workflow.run_for_selection().await.unwrap();
        assert_eq!(outcome.submitted, 3);
        assert!(cascade.selection().await.is_empty());
        assert!(!workflow.is_busy());

        let students = cascade.students().await;
        assert!(students
            .iter()
            .all(|s| s.prediction_for(10).map(|p| p.predicted_prob) == Some(0.82)));
    }

    #[tokio::test]
    async fn failure_still_clears_in_flight_and_refreshes_charts() {
        let (backend, cascade, workflow) = setup().await;
        cascade
            .add_chart(ChartRequest::probability_intervals("math_score"))
            .await
            .unwrap();
        cascade.toggle_student(2, 1, false, &[1, 2, 3]).await;
        backend.fail(ScriptedBackend::predict_key(10));
        let refreshes_before = backend.count_calls(&ScriptedBackend::intervals_key(10, "math_score"));

        let err = workflow.run_for_selection().await.unwrap_err();
        assert!(matches!(err, DashboardError::Workflow(_)));
        assert!(workflow.in_flight().is_empty());
        assert_eq!(
            backend.count_calls(&ScriptedBackend::intervals_key(10, "math_score")),
            refreshes_before + 1
        );
        // A failed batch keeps the selection for a retry.
        assert!(cascade.selection().await.contains(&2));
    }

    #[tokio::test]
    async fn rows_are_locked_while_the_batch_runs() {
        let (backend, _cascade, workflow) = setup().await;
        let workflow = Arc::new(workflow);
        let gate = backend.hold(ScriptedBackend::predict_key(10));

        let running = {
            let workflow = workflow.clone();
            tokio::spawn(async move { workflow.run_batch(&BTreeSet::from([1, 2]), Some(10)).await })
        };
        while backend.count_calls(&ScriptedBackend::predict_key(10)) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(workflow.is_in_flight(1));
        assert!(workflow.is_in_flight(2));
        let overlap = workflow.run_batch(&BTreeSet::from([2, 3]), Some(10)).await;
        assert!(overlap.unwrap_err().is_validation());

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert!(!workflow.is_busy());
    }
}
