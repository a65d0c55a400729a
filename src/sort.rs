//! Multi-key table sorting.
//!
//! Keys are kept in activation order. The most recently activated key is the
//! primary comparator and earlier keys break ties.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::models::Student;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub key: String,
    pub direction: SortDirection,
}

/// A single cell value as seen by the comparator.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl From<Option<i32>> for FieldValue {
    fn from(value: Option<i32>) -> Self {
        value.map_or(FieldValue::Null, |v| FieldValue::Number(f64::from(v)))
    }
}

pub trait SortableRecord {
    fn field(&self, key: &str) -> FieldValue;
}

impl SortableRecord for Student {
    fn field(&self, key: &str) -> FieldValue {
        match key {
            "id" => FieldValue::Number(self.id as f64),
            "full_name" => FieldValue::Text(self.full_name.clone()),
            "math_score" => self.math_score.into(),
            "russian_score" => self.russian_score.into(),
            "ege_score" => self.ege_score.into(),
            "session_1_passed" => FieldValue::Bool(self.session_1_passed),
            "session_2_passed" => FieldValue::Bool(self.session_2_passed),
            "session_3_passed" => FieldValue::Bool(self.session_3_passed),
            "session_4_passed" => FieldValue::Bool(self.session_4_passed),
            "direction_id" => FieldValue::Number(self.direction_id as f64),
            _ => FieldValue::Null,
        }
    }
}

/// Active sort keys for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortState {
    keys: Vec<SortKey>,
}

impl SortState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: Vec<SortKey>) -> Self {
        let mut state = Self::new();
        for key in keys {
            state.keys.retain(|existing| existing.key != key.key);
            state.keys.push(key);
        }
        state
    }

    /// Advances `key` through `unset -> asc -> desc -> unset`.
    pub fn toggle(&mut self, key: &str) {
        match self.keys.iter().position(|k| k.key == key) {
            None => self.keys.push(SortKey {
                key: key.to_string(),
                direction: SortDirection::Asc,
            }),
            Some(index) => match self.keys[index].direction {
                SortDirection::Asc => self.keys[index].direction = SortDirection::Desc,
                SortDirection::Desc => {
                    self.keys.remove(index);
                }
            },
        }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn direction_of(&self, key: &str) -> Option<SortDirection> {
        self.keys
            .iter()
            .find(|k| k.key == key)
            .map(|k| k.direction)
    }

    /// Header badge for a column.
    pub fn indicator(&self, key: &str) -> String {
        let Some(index) = self.keys.iter().position(|k| k.key == key) else {
            return "⇅".to_string();
        };
        let arrow = match self.keys[index].direction {
            SortDirection::Asc => "↑",
            SortDirection::Desc => "↓",
        };
        if self.keys.len() > 1 {
            format!("{arrow} {}", index + 1)
        } else {
            arrow.to_string()
        }
    }

    pub fn sorted<R: SortableRecord + Clone>(&self, records: &[R]) -> Vec<R> {
        sort_records(records, &self.keys)
    }
}

/// Returns a stably sorted copy of `records`.
pub fn sort_records<R: SortableRecord + Clone>(records: &[R], keys: &[SortKey]) -> Vec<R> {
    let mut sorted = records.to_vec();
    if keys.is_empty() {
        return sorted;
    }
    sorted.sort_by(|a, b| compare_records(a, b, keys));
    sorted
}

pub fn compare_records<R: SortableRecord>(a: &R, b: &R, keys: &[SortKey]) -> Ordering {
    for key in keys.iter().rev() {
        let ordering = compare_values(&a.field(&key.key), &b.field(&key.key), key.direction);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Nulls go last in both directions. Mixed kinds compare as lower-cased text.
pub fn compare_values(a: &FieldValue, b: &FieldValue, direction: SortDirection) -> Ordering {
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
        (FieldValue::Null, _) => Ordering::Greater,
        (_, FieldValue::Null) => Ordering::Less,
        (FieldValue::Number(x), FieldValue::Number(y)) => direction.apply(x.total_cmp(y)),
        (FieldValue::Bool(x), FieldValue::Bool(y)) => direction.apply(x.cmp(y)),
        _ => direction.apply(text_of(a).cmp(&text_of(b))),
    }
}

fn text_of(value: &FieldValue) -> String {
    match value {
        FieldValue::Number(n) => n.to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Text(s) => s.to_lowercase(),
        FieldValue::Null => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        name: &'static str,
        math: Option<i32>,
        russian: Option<i32>,
        passed: bool,
    }

    impl SortableRecord for Row {
        fn field(&self, key: &str) -> FieldValue {
            match key {
                "name" => FieldValue::Text(self.name.to_string()),
                "math" => self.math.into(),
                "russian" => self.russian.into(),
                "passed" => FieldValue::Bool(self.passed),
                _ => FieldValue::Null,
            }
        }
    }

    fn row(name: &'static str, math: Option<i32>, russian: Option<i32>, passed: bool) -> Row {
        Row {
            name,
            math,
            russian,
            passed,
        }
    }

    fn names(rows: &[Row]) -> Vec<&'static str> {
        rows.iter().map(|r| r.name).collect()
    }

    #[test]
    fn no_keys_keeps_input_order() {
        let rows = vec![
            row("c", Some(3), None, false),
            row("a", Some(1), None, true),
            row("b", Some(2), None, false),
        ];
        assert_eq!(SortState::new().sorted(&rows), rows);
    }

    #[test]
    fn last_activated_key_is_primary() {
        let rows = vec![
            row("a", Some(10), Some(5), false),
            row("b", Some(5), Some(10), false),
            row("c", Some(1), Some(5), false),
        ];
        let mut state = SortState::new();
        state.toggle("math");
        state.toggle("russian");

        // russian is primary; the russian=5 tie is broken by math ascending.
        assert_eq!(names(&state.sorted(&rows)), vec!["c", "a", "b"]);

        // math alone would order c, b, a.
        let mut math_only = SortState::new();
        math_only.toggle("math");
        assert_eq!(names(&math_only.sorted(&rows)), vec!["c", "b", "a"]);
    }

    #[test]
    fn three_clicks_remove_the_key() {
        let mut state = SortState::new();
        state.toggle("name");
        let before = state.keys().len();

        state.toggle("math");
        assert_eq!(state.direction_of("math"), Some(SortDirection::Asc));
        state.toggle("math");
        assert_eq!(state.direction_of("math"), Some(SortDirection::Desc));
        state.toggle("math");
        assert_eq!(state.direction_of("math"), None);
        assert_eq!(state.keys().len(), before);
    }

    #[test]
    fn nulls_sort_last_in_both_directions() {
        let rows = vec![
            row("missing", None, None, false),
            row("high", Some(90), None, false),
            row("low", Some(40), None, false),
        ];
        let mut state = SortState::new();
        state.toggle("math");
        assert_eq!(names(&state.sorted(&rows)), vec!["low", "high", "missing"]);
        state.toggle("math");
        assert_eq!(names(&state.sorted(&rows)), vec!["high", "low", "missing"]);
    }

    #[test]
    fn booleans_and_text_compare_as_expected() {
        let rows = vec![
            row("bob", None, None, true),
            row("Alice", None, None, false),
            row("carol", None, None, true),
        ];
        let by_name = SortState::from_keys(vec![SortKey {
            key: "name".to_string(),
            direction: SortDirection::Asc,
        }]);
        assert_eq!(names(&by_name.sorted(&rows)), vec!["Alice", "bob", "carol"]);

        let by_passed = SortState::from_keys(vec![SortKey {
            key: "passed".to_string(),
            direction: SortDirection::Desc,
        }]);
        // Stable among equal keys.
        assert_eq!(names(&by_passed.sorted(&rows)), vec!["bob", "carol", "Alice"]);
    }

    #[test]
    fn indicator_shows_priority_when_several_keys_are_active() {
        let mut state = SortState::new();
        assert_eq!(state.indicator("math"), "⇅");
        state.toggle("math");
        assert_eq!(state.indicator("math"), "↑");
        state.toggle("russian");
        state.toggle("russian");
        assert_eq!(state.indicator("math"), "↑ 1");
        assert_eq!(state.indicator("russian"), "↓ 2");
    }
}
