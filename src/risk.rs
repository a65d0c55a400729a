use std::cmp::Ordering;

use serde::Serialize;

use crate::models::{ModelId, Student};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    High,
    Low,
    Unknown,
}

impl RiskClass {
    pub fn from_class(class: Option<i32>) -> Self {
        match class {
            Some(0) => RiskClass::High,
            Some(1) => RiskClass::Low,
            _ => RiskClass::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskClass::High => "high",
            RiskClass::Low => "low",
            RiskClass::Unknown => "no data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedStudent {
    pub student_id: i64,
    pub full_name: String,
    pub math_score: Option<i32>,
    pub russian_score: Option<i32>,
    pub ege_score: Option<i32>,
    pub probability: Option<f64>,
    pub risk: RiskClass,
}

impl RankedStudent {
    /// Probability as a percentage with one decimal, or "no data".
    pub fn probability_label(&self) -> String {
        match self.probability {
            Some(p) => format!("{:.1}%", p * 100.0),
            None => "no data".to_string(),
        }
    }

    pub fn is_favourable(&self) -> bool {
        self.probability.is_some_and(|p| p > 0.5)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub total: usize,
    pub average_math: f64,
    pub average_russian: f64,
    /// Mean predicted probability in percent, over students with a prediction.
    pub average_probability: f64,
    pub high_risk: usize,
    pub low_risk: usize,
}

/// Orders students by predicted probability, highest first. Students without
/// a prediction rank last, in their original order.
pub fn rank_by_probability(students: &[Student], model: ModelId) -> Vec<RankedStudent> {
    let mut ranked: Vec<RankedStudent> = students
        .iter()
        .map(|student| {
            let prediction = student.prediction_for(model);
            RankedStudent {
                student_id: student.id,
                full_name: student.full_name.clone(),
                math_score: student.math_score,
                russian_score: student.russian_score,
                ege_score: student.ege_score,
                probability: prediction.map(|p| p.predicted_prob),
                risk: RiskClass::from_class(prediction.map(|p| p.predicted_class)),
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        let a = a.probability.unwrap_or(-1.0);
        let b = b.probability.unwrap_or(-1.0);
        b.partial_cmp(&a).unwrap_or(Ordering::Equal)
    });
    ranked
}

/// Rows shown in the summary panel: the first `limit` unless expanded.
pub fn preview(ranked: &[RankedStudent], limit: usize, show_all: bool) -> &[RankedStudent] {
    if show_all {
        ranked
    } else {
        &ranked[..ranked.len().min(limit)]
    }
}

pub fn summarize(students: &[Student], model: ModelId) -> DashboardSummary {
    let total = students.len();
    if total == 0 {
        return DashboardSummary {
            total: 0,
            average_math: 0.0,
            average_russian: 0.0,
            average_probability: 0.0,
            high_risk: 0,
            low_risk: 0,
        };
    }

    let average_math = students
        .iter()
        .map(|s| f64::from(s.math_score.unwrap_or(0)))
        .sum::<f64>()
        / total as f64;
    let average_russian = students
        .iter()
        .map(|s| f64::from(s.russian_score.unwrap_or(0)))
        .sum::<f64>()
        / total as f64;

    let predictions: Vec<_> = students
        .iter()
        .filter_map(|s| s.prediction_for(model))
        .collect();
    let average_probability = if predictions.is_empty() {
        0.0
    } else {
        predictions.iter().map(|p| p.predicted_prob).sum::<f64>() / predictions.len() as f64
            * 100.0
    };

    DashboardSummary {
        total,
        average_math,
        average_russian,
        average_probability,
        high_risk: predictions.iter().filter(|p| p.predicted_class == 0).count(),
        low_risk: predictions.iter().filter(|p| p.predicted_class == 1).count(),
    }
}
