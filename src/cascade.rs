//! Dependent selection chain: direction -> model -> students.
//!
//! Every fetch is tagged with the selection epoch it was issued under. A
//! response whose tag no longer matches the current selection is dropped, so
//! a slow answer for an old direction never lands under a newer one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::Backend;
use crate::charts::{Chart, ChartRegistry, ChartRequest, RefreshReport};
use crate::error::{DashboardError, Level, Result};
use crate::models::{Direction, DirectionId, ModelId, ModelSummary, Student, StudentId};
use crate::selection::SelectionSet;
use crate::sort::SortState;

/// Result of asking for a new direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionChange {
    Applied,
    /// Charts exist; the candidate waits for confirm or cancel.
    PendingConfirmation { candidate: DirectionId },
    Unchanged,
}

/// Read-only view handed to rendering code.
#[derive(Debug, Clone, Default)]
pub struct CascadeState {
    pub directions: Vec<Direction>,
    pub models: Vec<ModelSummary>,
    pub students: Vec<Student>,
    pub subjects: Vec<String>,
    pub selected_direction: Option<DirectionId>,
    pub pending_direction: Option<DirectionId>,
    pub selected_model: Option<ModelId>,
    pub errors: BTreeMap<Level, String>,
    pub loading: BTreeSet<Level>,
    pub selection: SelectionSet<StudentId>,
}

impl CascadeState {
    pub fn error(&self, level: Level) -> Option<&str> {
        self.errors.get(&level).map(String::as_str)
    }

    pub fn is_loading(&self, level: Level) -> bool {
        self.loading.contains(&level)
    }
}

#[derive(Default)]
struct Inner {
    view: CascadeState,
    direction_epoch: u64,
    model_epoch: u64,
}

impl Inner {
    fn finish(&mut self, level: Level, outcome: std::result::Result<(), String>) {
        self.view.loading.remove(&level);
        match outcome {
            Ok(()) => {
                self.view.errors.remove(&level);
            }
            Err(message) => {
                self.view.errors.insert(level, message);
            }
        }
    }
}

pub struct CascadeController {
    backend: Arc<dyn Backend>,
    charts: Arc<ChartRegistry>,
    inner: RwLock<Inner>,
}

impl CascadeController {
    pub fn new(backend: Arc<dyn Backend>, charts: Arc<ChartRegistry>) -> Self {
        Self {
            backend,
            charts,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn charts(&self) -> &Arc<ChartRegistry> {
        &self.charts
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub async fn snapshot(&self) -> CascadeState {
        self.inner.read().await.view.clone()
    }

    pub async fn selected_direction(&self) -> Option<DirectionId> {
        self.inner.read().await.view.selected_direction
    }

    pub async fn pending_direction(&self) -> Option<DirectionId> {
        self.inner.read().await.view.pending_direction
    }

    pub async fn selected_model(&self) -> Option<ModelId> {
        self.inner.read().await.view.selected_model
    }

    pub async fn students(&self) -> Vec<Student> {
        self.inner.read().await.view.students.clone()
    }

    pub async fn sorted_students(&self, sort: &SortState) -> Vec<Student> {
        sort.sorted(&self.inner.read().await.view.students)
    }

    pub async fn error(&self, level: Level) -> Option<String> {
        self.inner.read().await.view.errors.get(&level).cloned()
    }

    pub async fn load_directions(&self) -> Result<()> {
        self.inner.write().await.view.loading.insert(Level::Directions);
        let result = self.backend.list_directions().await;

        let mut inner = self.inner.write().await;
        match result {
            Ok(directions) => {
                tracing::debug!(target: "cascade", count = directions.len(), "directions loaded");
                inner.view.directions = directions;
                inner.finish(Level::Directions, Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "cascade", error = %e, "failed to load directions");
                inner.finish(Level::Directions, Err(e.to_string()));
                Err(DashboardError::fetch(Level::Directions, e))
            }
        }
    }

    /// Requests a direction change.
    ///
    /// Clearing the direction always applies at once. Switching to another
    /// direction while any model has charts waits for confirmation, since the
    /// switch discards every chart.
    pub async fn select_direction(&self, direction: Option<DirectionId>) -> Result<DirectionChange> {
        {
            let mut inner = self.inner.write().await;
            if direction == inner.view.selected_direction {
                if inner.view.pending_direction.take().is_some() {
                    tracing::debug!(target: "cascade", "pending direction dropped by reselecting the current one");
                }
                return Ok(DirectionChange::Unchanged);
            }
        }

        let guarded = self.charts.has_charts().await;
        match direction {
            None => {
                self.apply_direction(None).await;
                Ok(DirectionChange::Applied)
            }
            Some(candidate) if guarded => {
                self.inner.write().await.view.pending_direction = Some(candidate);
                tracing::info!(target: "cascade", candidate, "direction change waiting for confirmation");
                Ok(DirectionChange::PendingConfirmation { candidate })
            }
            Some(_) => {
                self.charts.clear_all().await;
                self.apply_direction(direction).await;
                self.load_models().await?;
                Ok(DirectionChange::Applied)
            }
        }
    }

    /// Applies the pending direction and discards every chart.
    pub async fn confirm_direction_change(&self) -> Result<DirectionChange> {
        let candidate = self
            .inner
            .write()
            .await
            .view
            .pending_direction
            .take()
            .ok_or_else(|| DashboardError::validation("no direction change is pending"))?;

        self.charts.clear_all().await;
        self.apply_direction(Some(candidate)).await;
        self.load_models().await?;
        Ok(DirectionChange::Applied)
    }

    /// Drops the pending direction. Returns whether one was pending.
    pub async fn cancel_direction_change(&self) -> bool {
        let cancelled = self.inner.write().await.view.pending_direction.take();
        if let Some(candidate) = cancelled {
            tracing::info!(target: "cascade", candidate, "direction change cancelled");
        }
        cancelled.is_some()
    }

    async fn apply_direction(&self, direction: Option<DirectionId>) {
        let mut inner = self.inner.write().await;
        inner.direction_epoch += 1;
        inner.model_epoch += 1;
        let view = &mut inner.view;
        view.selected_direction = direction;
        view.pending_direction = None;
        view.selected_model = None;
        view.models.clear();
        view.students.clear();
        view.subjects.clear();
        view.selection.clear();
        for level in [Level::Models, Level::Students, Level::Subjects] {
            view.errors.remove(&level);
            view.loading.remove(&level);
        }
        tracing::info!(target: "cascade", ?direction, "direction applied");
    }

    /// Loads the model list for the applied direction.
    pub async fn load_models(&self) -> Result<()> {
        let (direction, epoch) = {
            let mut inner = self.inner.write().await;
            let Some(direction) = inner.view.selected_direction else {
                inner.view.models.clear();
                return Ok(());
            };
            inner.view.loading.insert(Level::Models);
            (direction, inner.direction_epoch)
        };

        let result = self.backend.list_models(Some(direction)).await;

        let mut inner = self.inner.write().await;
        if inner.direction_epoch != epoch {
            tracing::debug!(target: "cascade", direction, "discarding stale model list");
            return Ok(());
        }
        match result {
            Ok(models) => {
                tracing::debug!(target: "cascade", direction, count = models.len(), "models loaded");
                inner.view.models = models;
                inner.finish(Level::Models, Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "cascade", direction, error = %e, "failed to load models");
                inner.finish(Level::Models, Err(e.to_string()));
                Err(DashboardError::fetch(Level::Models, e))
            }
        }
    }

    /// Selects a model under the applied direction, then loads its students
    /// and refreshes its charts.
    pub async fn select_model(&self, model: Option<ModelId>) -> Result<RefreshReport> {
        {
            let mut inner = self.inner.write().await;
            if model.is_some() && inner.view.selected_direction.is_none() {
                return Err(DashboardError::validation("select a direction first"));
            }
            if model == inner.view.selected_model {
                return Ok(RefreshReport::default());
            }
            inner.model_epoch += 1;
            let view = &mut inner.view;
            view.selected_model = model;
            view.students.clear();
            view.subjects.clear();
            for level in [Level::Students, Level::Subjects] {
                view.errors.remove(&level);
                view.loading.remove(&level);
            }
            tracing::info!(target: "cascade", ?model, "model selected");
        }

        let Some(model) = model else {
            return Ok(RefreshReport::default());
        };
        self.reload_students().await?;
        Ok(self.charts.refresh_all(model).await)
    }

    /// Re-fetches students with predictions for the current (direction, model).
    ///
    /// On failure the previous list stays in place and the error is recorded
    /// for the students section.
    pub async fn reload_students(&self) -> Result<()> {
        let (direction, model, tag) = {
            let mut inner = self.inner.write().await;
            let (Some(direction), Some(model)) =
                (inner.view.selected_direction, inner.view.selected_model)
            else {
                inner.view.students.clear();
                return Ok(());
            };
            inner.view.loading.insert(Level::Students);
            (direction, model, (inner.direction_epoch, inner.model_epoch))
        };

        let result = self.backend.students_with_predictions(direction, model).await;

        let mut inner = self.inner.write().await;
        if (inner.direction_epoch, inner.model_epoch) != tag {
            tracing::debug!(target: "cascade", direction, model, "discarding stale student list");
            return Ok(());
        }
        match result {
            Ok(students) => {
                tracing::debug!(target: "cascade", direction, model, count = students.len(), "students loaded");
                inner.view.students = students;
                inner.finish(Level::Students, Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "cascade", direction, model, error = %e, "failed to load students");
                inner.finish(Level::Students, Err(e.to_string()));
                Err(DashboardError::fetch(Level::Students, e))
            }
        }
    }

    /// Feature columns of the selected model, offered as chart subjects.
    pub async fn load_subjects(&self) -> Result<Vec<String>> {
        let (model, epoch) = {
            let mut inner = self.inner.write().await;
            let model = inner
                .view
                .selected_model
                .ok_or_else(|| DashboardError::validation("select a model first"))?;
            inner.view.loading.insert(Level::Subjects);
            (model, inner.model_epoch)
        };

        let result = self.backend.feature_columns(model).await;

        let mut inner = self.inner.write().await;
        if inner.model_epoch != epoch {
            tracing::debug!(target: "cascade", model, "discarding stale subject list");
            return Ok(inner.view.subjects.clone());
        }
        match result {
            Ok(subjects) => {
                inner.view.subjects = subjects.clone();
                inner.finish(Level::Subjects, Ok(()));
                Ok(subjects)
            }
            Err(e) => {
                inner.view.subjects.clear();
                inner.finish(Level::Subjects, Err(e.to_string()));
                Err(DashboardError::fetch(Level::Subjects, e))
            }
        }
    }

    /// Adds a chart under the selected model.
    pub async fn add_chart(&self, request: ChartRequest) -> Result<Chart> {
        let (direction, model) = {
            let inner = self.inner.read().await;
            (inner.view.selected_direction, inner.view.selected_model)
        };
        let model = model.ok_or_else(|| DashboardError::validation("select a model first"))?;
        self.charts.add_chart(model, direction, request).await
    }

    pub async fn remove_chart(&self, chart_id: &str) -> bool {
        match self.selected_model().await {
            Some(model) => self.charts.remove_chart(model, chart_id).await,
            None => false,
        }
    }

    /// Charts of the selected model.
    pub async fn current_charts(&self) -> Arc<Vec<Chart>> {
        match self.selected_model().await {
            Some(model) => self.charts.charts(model).await,
            None => Arc::default(),
        }
    }

    /// Deletes a model on the backend and drops everything that hangs off it.
    pub async fn delete_model(&self, model: ModelId) -> Result<()> {
        self.backend.delete_model(model).await?;
        self.charts.clear_model(model).await;
        if self.selected_model().await == Some(model) {
            self.select_model(None).await?;
        }
        self.load_models().await
    }

    pub async fn toggle_student(&self, id: StudentId, index: usize, extend: bool, visible: &[StudentId]) {
        self.inner
            .write()
            .await
            .view
            .selection
            .toggle(id, index, extend, visible);
    }

    pub async fn clear_selection(&self) {
        self.inner.write().await.view.selection.clear();
    }

    pub async fn selection(&self) -> SelectionSet<StudentId> {
        self.inner.read().await.view.selection.clone()
    }
}
