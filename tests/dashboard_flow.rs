use std::collections::BTreeMap;
use std::sync::Arc;

use cohort_risk_dashboard::charts::{parse_x_values, DEFAULT_X_VALUES};
use cohort_risk_dashboard::report::{build_report, ReportContext};
use cohort_risk_dashboard::testing::{student, ScriptedBackend};
use cohort_risk_dashboard::{
    CascadeController, ChartRegistry, ChartRequest, ChartSeries, DashboardError, DirectionChange,
    PredictionWorkflow, SortDirection, SortKey, SortState,
};

fn seeded() -> Arc<ScriptedBackend> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.add_direction(1, "Applied Informatics");
    backend.add_direction(2, "Economics");
    backend.add_model(1, 10, "logit-2024", &["math_score", "russian_score"]);
    backend.add_student(student(1, "Anna Petrova", 1, 72, 80));
    backend.add_student(student(2, "Ivan Sokolov", 1, 45, 61));
    backend.add_student(student(3, "Kiara Ode", 1, 88, 70));
    backend.add_student(student(4, "Maks Orlov", 1, 60, 66));
    backend.add_student(student(5, "Lena Brandt", 2, 77, 90));
    backend.set_intervals(
        10,
        "math_score",
        BTreeMap::from([
            ("50.0-100.0".to_string(), 0.82),
            ("0.0-50.0".to_string(), 0.31),
        ]),
    );
    backend.set_margin_effects(10, "russian_score", &[0.01, 0.02, 0.025]);
    backend
}

fn controller(backend: &Arc<ScriptedBackend>) -> Arc<CascadeController> {
    let charts = Arc::new(ChartRegistry::new(backend.clone()));
    Arc::new(CascadeController::new(backend.clone(), charts))
}

async fn open_with_charts(cascade: &CascadeController) {
    cascade.load_directions().await.unwrap();
    assert_eq!(
        cascade.select_direction(Some(1)).await.unwrap(),
        DirectionChange::Applied
    );
    cascade.select_model(Some(10)).await.unwrap();
    cascade
        .add_chart(ChartRequest::probability_intervals("math_score"))
        .await
        .unwrap();
    cascade
        .add_chart(ChartRequest::margin_effect(
            "russian_score",
            parse_x_values(DEFAULT_X_VALUES),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn sorted_range_selection_is_scored_and_reported() {
    let backend = seeded();
    let cascade = controller(&backend);
    open_with_charts(&cascade).await;

    let sort = SortState::from_keys(vec![SortKey {
        key: "math_score".to_string(),
        direction: SortDirection::Desc,
    }]);
    let visible: Vec<i64> = cascade
        .sorted_students(&sort)
        .await
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(visible, vec![3, 1, 4, 2]);

    cascade.toggle_student(visible[0], 0, false, &visible).await;
    cascade.toggle_student(visible[2], 2, true, &visible).await;
    assert_eq!(cascade.selection().await.to_vec(), vec![1, 3, 4]);

    backend.set_next_probability(0.8);
    let workflow = PredictionWorkflow::new(cascade.clone());
    let outcome = workflow.run_for_selection().await.unwrap();
    assert_eq!(outcome.submitted, 3);
    assert_eq!(outcome.charts.attempted(), 2);
    assert!(outcome.charts.is_clean());
    assert!(cascade.selection().await.is_empty());
    assert!(!workflow.is_busy());

    let students = cascade.students().await;
    let scored: Vec<i64> = students
        .iter()
        .filter(|s| s.prediction_for(10).is_some())
        .map(|s| s.id)
        .collect();
    assert_eq!(scored, vec![1, 3, 4]);
    assert_eq!(backend.count_calls(&ScriptedBackend::intervals_key(10, "math_score")), 2);

    let charts = cascade.current_charts().await;
    let report = build_report(&ReportContext {
        direction: "Applied Informatics",
        model_id: 10,
        model_name: "logit-2024",
        students: &students,
        charts: &charts,
        preview_limit: 5,
    });
    assert!(report.contains("- Students: 4"));
    assert!(report.contains("- Low risk: 3"));
    assert!(report.contains("- 0.0-50.0: 31.0%"));
    assert!(report.contains("- x = 15: 0.0250"));
}

#[tokio::test]
async fn direction_switch_with_charts_needs_confirmation() {
    let backend = seeded();
    let cascade = controller(&backend);
    open_with_charts(&cascade).await;

    assert_eq!(
        cascade.select_direction(Some(2)).await.unwrap(),
        DirectionChange::PendingConfirmation { candidate: 2 }
    );
    assert_eq!(cascade.pending_direction().await, Some(2));
    assert!(cascade.cancel_direction_change().await);
    assert_eq!(cascade.selected_direction().await, Some(1));
    assert_eq!(cascade.selected_model().await, Some(10));
    assert_eq!(cascade.current_charts().await.len(), 2);

    cascade.select_direction(Some(2)).await.unwrap();
    assert_eq!(
        cascade.confirm_direction_change().await.unwrap(),
        DirectionChange::Applied
    );
    assert_eq!(cascade.selected_direction().await, Some(2));
    assert_eq!(cascade.selected_model().await, None);
    assert!(cascade.students().await.is_empty());
    assert!(!cascade.charts().has_charts().await);
    assert!(cascade.snapshot().await.models.is_empty());
}

#[tokio::test]
async fn failed_batch_keeps_selection_and_charts_keep_old_data() {
    let backend = seeded();
    let cascade = controller(&backend);
    open_with_charts(&cascade).await;

    let visible: Vec<i64> = cascade.students().await.iter().map(|s| s.id).collect();
    cascade.toggle_student(visible[1], 1, false, &visible).await;

    backend.fail(ScriptedBackend::predict_key(10));
    backend.fail(ScriptedBackend::intervals_key(10, "math_score"));
    let workflow = PredictionWorkflow::new(cascade.clone());
    let err = workflow.run_for_selection().await.unwrap_err();
    assert!(matches!(err, DashboardError::Workflow(_)));
    assert_eq!(cascade.selection().await.to_vec(), vec![visible[1]]);
    assert!(!workflow.is_in_flight(visible[1]));

    let charts = cascade.current_charts().await;
    let intervals = charts
        .iter()
        .find(|c| matches!(c.series, ChartSeries::ProbabilityIntervals(_)))
        .unwrap();
    assert_eq!(
        intervals.series.sorted_buckets(),
        vec![("0.0-50.0", 0.31), ("50.0-100.0", 0.82)]
    );

    let duplicate = cascade
        .add_chart(ChartRequest::probability_intervals("math_score"))
        .await
        .unwrap_err();
    assert!(duplicate.is_validation());
}
