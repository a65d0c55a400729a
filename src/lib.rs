//! Interactive state for a student risk dashboard: the direction -> model ->
//! students cascade, per-model charts, table sorting, row selection and
//! batch prediction, all driven through a [`backend::Backend`].

pub mod backend;
pub mod cascade;
pub mod charts;
pub mod config;
pub mod error;
pub mod models;
pub mod report;
pub mod risk;
pub mod selection;
pub mod sort;
pub mod testing;
pub mod workflow;

pub use backend::{Backend, HttpBackend};
pub use cascade::{CascadeController, CascadeState, DirectionChange};
pub use charts::{Chart, ChartCategory, ChartRegistry, ChartRequest, ChartSeries, RefreshReport};
pub use config::Config;
pub use error::{BackendError, DashboardError, Level};
pub use selection::SelectionSet;
pub use sort::{SortDirection, SortKey, SortState};
pub use workflow::{BatchOutcome, PredictionWorkflow};
