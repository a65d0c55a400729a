use serde::{Deserialize, Serialize};

pub type DirectionId = i64;
pub type ModelId = i64;
pub type StudentId = i64;

/// Score columns. They can be model features but never a training target.
pub const SCORE_COLUMNS: [&str; 3] = ["math_score", "russian_score", "ege_score"];

pub const SESSION_COLUMNS: [&str; 4] = [
    "session_1_passed",
    "session_2_passed",
    "session_3_passed",
    "session_4_passed",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub id: DirectionId,
    pub name: String,
    #[serde(default)]
    pub count_student: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: ModelId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Logit,
    Probit,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Logit => "logit",
            ModelType::Probit => "probit",
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "logit" => Ok(ModelType::Logit),
            "probit" => Ok(ModelType::Probit),
            other => Err(format!("unknown model type '{other}' (expected logit or probit)")),
        }
    }
}

/// A student's score under one model. Class 0 is high risk, class 1 is low risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default, alias = "prediction_id")]
    pub model_id: Option<ModelId>,
    #[serde(default)]
    pub student_id: Option<StudentId>,
    pub predicted_prob: f64,
    pub predicted_class: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub full_name: String,
    #[serde(default)]
    pub math_score: Option<i32>,
    #[serde(default)]
    pub russian_score: Option<i32>,
    #[serde(default)]
    pub ege_score: Option<i32>,
    #[serde(default)]
    pub session_1_passed: bool,
    #[serde(default)]
    pub session_2_passed: bool,
    #[serde(default)]
    pub session_3_passed: bool,
    #[serde(default)]
    pub session_4_passed: bool,
    pub direction_id: DirectionId,
    #[serde(default)]
    pub prediction: Vec<Prediction>,
}

impl Student {
    /// Resolves the prediction made by `model_id`.
    ///
    /// When the backend tags predictions with their model, only a matching
    /// tag is accepted. Untagged lists are assumed to be pre-filtered for the
    /// requested model and the first entry is used.
    pub fn prediction_for(&self, model_id: ModelId) -> Option<&Prediction> {
        if self.prediction.iter().any(|p| p.model_id.is_some()) {
            self.prediction
                .iter()
                .find(|p| p.model_id == Some(model_id))
        } else {
            self.prediction.first()
        }
    }

    pub fn sessions_passed(&self) -> usize {
        [
            self.session_1_passed,
            self.session_2_passed,
            self.session_3_passed,
            self.session_4_passed,
        ]
        .iter()
        .filter(|passed| **passed)
        .count()
    }
}

/// Body for creating a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentDraft {
    pub full_name: String,
    pub math_score: i32,
    pub russian_score: i32,
    pub ege_score: i32,
    #[serde(default)]
    pub session_1_passed: bool,
    #[serde(default)]
    pub session_2_passed: bool,
    #[serde(default)]
    pub session_3_passed: bool,
    #[serde(default)]
    pub session_4_passed: bool,
    pub direction_id: DirectionId,
}

/// Partial update; absent fields are left untouched by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub math_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub russian_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ege_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_1_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_2_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_3_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_4_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_id: Option<DirectionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub fields: Vec<String>,
    pub target: String,
    pub model_name: String,
    pub direction_id: DirectionId,
    #[serde(default)]
    pub model_type: ModelType,
}

impl TrainRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.is_empty() {
            return Err("select at least one feature column".to_string());
        }
        if self.target.trim().is_empty() {
            return Err("select a target column".to_string());
        }
        if SCORE_COLUMNS.contains(&self.target.as_str()) {
            return Err(format!("'{}' cannot be used as a target", self.target));
        }
        if self.fields.iter().any(|field| field == &self.target) {
            return Err(format!(
                "target '{}' cannot also be a feature column",
                self.target
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err("model name must not be blank".to_string());
        }
        Ok(())
    }
}

/// Training metadata for a stored model. Metrics are passed through for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub feature_columns: Vec<String>,
    #[serde(default)]
    pub direction_id: Option<DirectionId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(model_id: Option<ModelId>, prob: f64) -> Prediction {
        Prediction {
            model_id,
            student_id: Some(1),
            predicted_prob: prob,
            predicted_class: i32::from(prob > 0.5),
        }
    }

    #[test]
    fn tagged_predictions_resolve_by_model() {
        let student: Student = serde_json::from_value(serde_json::json!({
            "id": 1,
            "full_name": "Anna Petrova",
            "math_score": 71,
            "direction_id": 3,
            "prediction": [
                {"model_id": 4, "predicted_prob": 0.2, "predicted_class": 0},
                {"model_id": 9, "predicted_prob": 0.8, "predicted_class": 1}
            ]
        }))
        .unwrap();

        assert_eq!(student.prediction_for(9).unwrap().predicted_prob, 0.8);
        assert!(student.prediction_for(5).is_none());
        assert_eq!(student.russian_score, None);
    }

    #[test]
    fn prediction_accepts_legacy_tag_name() {
        let prediction: Prediction = serde_json::from_value(serde_json::json!({
            "prediction_id": 6, "predicted_prob": 0.4, "predicted_class": 0
        }))
        .unwrap();
        assert_eq!(prediction.model_id, Some(6));
        assert_eq!(
            serde_json::to_value(&prediction).unwrap()["model_id"],
            serde_json::json!(6)
        );
    }

    #[test]
    fn untagged_predictions_use_first_entry() {
        let mut student: Student = serde_json::from_value(serde_json::json!({
            "id": 2,
            "full_name": "Ivan Sokolov",
            "direction_id": 3
        }))
        .unwrap();
        assert!(student.prediction_for(1).is_none());

        student.prediction = vec![prediction(None, 0.7), prediction(None, 0.1)];
        assert_eq!(student.prediction_for(1).unwrap().predicted_prob, 0.7);
    }

    #[test]
    fn train_request_rejects_score_target_and_overlap() {
        let mut request = TrainRequest {
            fields: vec!["math_score".to_string(), "session_1_passed".to_string()],
            target: "session_4_passed".to_string(),
            model_name: "spring".to_string(),
            direction_id: 1,
            model_type: ModelType::Probit,
        };
        assert!(request.validate().is_ok());

        request.target = "ege_score".to_string();
        assert!(request.validate().is_err());

        request.target = "session_1_passed".to_string();
        assert!(request.validate().unwrap_err().contains("feature"));

        request.target = "session_4_passed".to_string();
        request.model_name = "  ".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn model_type_parses_case_insensitively() {
        assert_eq!("Probit".parse::<ModelType>().unwrap(), ModelType::Probit);
        assert!("tree".parse::<ModelType>().is_err());
        assert_eq!(
            serde_json::to_value(ModelType::Logit).unwrap(),
            serde_json::json!("logit")
        );
    }
}
