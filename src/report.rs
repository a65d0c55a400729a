use std::fmt::Write;
use std::io;

use serde::Serialize;

use crate::charts::{Chart, ChartSeries};
use crate::models::{ModelId, Student};
use crate::risk;

pub struct ReportContext<'a> {
    pub direction: &'a str,
    pub model_id: ModelId,
    pub model_name: &'a str,
    pub students: &'a [Student],
    pub charts: &'a [Chart],
    pub preview_limit: usize,
}

pub fn build_report(context: &ReportContext<'_>) -> String {
    let summary = risk::summarize(context.students, context.model_id);
    let ranked = risk::rank_by_probability(context.students, context.model_id);

    let mut output = String::new();

    let _ = writeln!(output, "# Student Risk Dashboard");
    let _ = writeln!(
        output,
        "Dataset {} scored by model {}",
        context.direction, context.model_name
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");

    if summary.total == 0 {
        let _ = writeln!(output, "No students for this selection.");
    } else {
        let _ = writeln!(output, "- Students: {}", summary.total);
        let _ = writeln!(
            output,
            "- Average success probability: {:.1}%",
            summary.average_probability
        );
        let _ = writeln!(output, "- Average math score: {:.1}", summary.average_math);
        let _ = writeln!(
            output,
            "- Average russian score: {:.1}",
            summary.average_russian
        );
        let _ = writeln!(output, "- High risk: {}", summary.high_risk);
        let _ = writeln!(output, "- Low risk: {}", summary.low_risk);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Probability Students");

    if ranked.is_empty() {
        let _ = writeln!(output, "No students for this selection.");
    } else {
        for row in risk::preview(&ranked, context.preview_limit, false) {
            let _ = writeln!(
                output,
                "- {} (math {}, russian {}) probability {} risk {}",
                row.full_name,
                score(row.math_score),
                score(row.russian_score),
                row.probability_label(),
                row.risk.label()
            );
        }
        if ranked.len() > context.preview_limit {
            let _ = writeln!(
                output,
                "- ... and {} more",
                ranked.len() - context.preview_limit
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Charts");

    if context.charts.is_empty() {
        let _ = writeln!(output, "No charts configured for this model.");
    }
    for chart in context.charts {
        let _ = writeln!(output);
        let _ = writeln!(output, "### {}", chart.title);
        let _ = writeln!(output, "{} vs {}", chart.y_label, chart.x_label);
        if chart.series.is_empty() {
            let _ = writeln!(output, "No data.");
            continue;
        }
        match &chart.series {
            ChartSeries::ProbabilityIntervals(_) => {
                for (label, value) in chart.series.sorted_buckets() {
                    let _ = writeln!(output, "- {label}: {:.1}%", value * 100.0);
                }
            }
            ChartSeries::MarginEffect(points) => {
                for point in points {
                    let _ = writeln!(output, "- x = {}: {:.4}", point.x, point.y);
                }
            }
        }
    }

    output
}

fn score(value: Option<i32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[derive(Debug, Serialize)]
struct StudentRow<'a> {
    id: i64,
    full_name: &'a str,
    math_score: Option<i32>,
    russian_score: Option<i32>,
    ege_score: Option<i32>,
    session_1_passed: bool,
    session_2_passed: bool,
    session_3_passed: bool,
    session_4_passed: bool,
    predicted_prob: Option<f64>,
    predicted_class: Option<i32>,
}

/// Writes the student table, in the given order, as CSV.
pub fn export_csv<W: io::Write>(
    writer: W,
    students: &[Student],
    model: Option<ModelId>,
) -> anyhow::Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    for student in students {
        let prediction = model.and_then(|m| student.prediction_for(m));
        csv.serialize(StudentRow {
            id: student.id,
            full_name: &student.full_name,
            math_score: student.math_score,
            russian_score: student.russian_score,
            ege_score: student.ege_score,
            session_1_passed: student.session_1_passed,
            session_2_passed: student.session_2_passed,
            session_3_passed: student.session_3_passed,
            session_4_passed: student.session_4_passed,
            predicted_prob: prediction.map(|p| p.predicted_prob),
            predicted_class: prediction.map(|p| p.predicted_class),
        })?;
    }
    csv.flush()?;
    Ok(students.len())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::charts::{ChartRequest, MarginPoint};
    use crate::models::Prediction;
    use crate::testing::student;

    fn chart(title: &str, series: ChartSeries) -> Chart {
        let request = ChartRequest::probability_intervals("math_score");
        Chart {
            id: title.to_lowercase(),
            model_id: 3,
            direction_id: Some(1),
            title: title.to_string(),
            subject: request.subject.clone(),
            x_label: request.subject,
            y_label: "Probability".to_string(),
            x_values: Vec::new(),
            series,
            refreshed_at: Utc::now(),
        }
    }

    #[test]
    fn report_lists_summary_students_and_charts() {
        let mut top = student(1, "Anna Petrova", 1, 72, 80);
        top.prediction.push(Prediction {
            model_id: Some(3),
            student_id: Some(1),
            predicted_prob: 0.91,
            predicted_class: 1,
        });
        let students = vec![student(2, "Ivan Sokolov", 1, 45, 61), top];
        let charts = vec![
            chart(
                "Math intervals",
                ChartSeries::ProbabilityIntervals(vec![
                    ("50.0-100.0".to_string(), 0.8),
                    ("0.0-50.0".to_string(), 0.3),
                ]),
            ),
            chart(
                "Math effect",
                ChartSeries::MarginEffect(vec![MarginPoint { x: 10.0, y: 0.0125 }]),
            ),
        ];

        let report = build_report(&ReportContext {
            direction: "Applied Informatics",
            model_id: 3,
            model_name: "logit-2024",
            students: &students,
            charts: &charts,
            preview_limit: 5,
        });

        assert!(report.contains("- Students: 2"));
        assert!(report.contains("- Low risk: 1"));
        let anna = report.find("Anna Petrova").unwrap();
        let ivan = report.find("Ivan Sokolov").unwrap();
        assert!(anna < ivan);
        let low = report.find("- 0.0-50.0: 30.0%").unwrap();
        let high = report.find("- 50.0-100.0: 80.0%").unwrap();
        assert!(low < high);
        assert!(report.contains("- x = 10: 0.0125"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = build_report(&ReportContext {
            direction: "Economics",
            model_id: 1,
            model_name: "econ",
            students: &[],
            charts: &[],
            preview_limit: 5,
        });
        assert!(report.contains("No students for this selection."));
        assert!(report.contains("No charts configured for this model."));
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let students = vec![student(1, "Anna Petrova", 1, 72, 80)];
        let mut buffer = Vec::new();
        let written = export_csv(&mut buffer, &students, Some(3)).unwrap();
        assert_eq!(written, 1);

        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id,full_name,math_score"));
        assert!(lines.next().unwrap().starts_with("1,Anna Petrova,72,80,152"));
    }
}
