use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Point of an agent execution a guardrail is applied at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailStage {
    Input,
    Output,
}

impl fmt::Display for GuardrailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardrailStage::Input => f.write_str("input"),
            GuardrailStage::Output => f.write_str("output"),
        }
    }
}

const ALL_STAGES: &[GuardrailStage] = &[GuardrailStage::Input, GuardrailStage::Output];

/// Validator run on agent input (`{task, context}`) and output (`{result}`).
///
/// `validate` returns the rejection reason on failure.
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn stages(&self) -> &[GuardrailStage] {
        ALL_STAGES
    }

    fn applies_to(&self, stage: GuardrailStage) -> bool {
        self.stages().contains(&stage)
    }

    fn validate(&self, payload: &Map<String, Value>, stage: GuardrailStage) -> Result<(), String>;
}

/// Run every guardrail that applies to `stage`, stopping at the first rejection
pub fn apply_guardrails(
    guardrails: &[Arc<dyn Guardrail>],
    payload: &Map<String, Value>,
    stage: GuardrailStage,
) -> Result<(), (String, String)> {
    for guardrail in guardrails.iter().filter(|g| g.applies_to(stage)) {
        guardrail
            .validate(payload, stage)
            .map_err(|reason| (guardrail.name().to_string(), reason))?;
    }
    Ok(())
}

pub struct ContentFilterGuardrail {
    patterns: Vec<Regex>,
}

impl ContentFilterGuardrail {
    pub fn new(blocked_terms: &[String]) -> Self {
        let patterns = blocked_terms
            .iter()
            .filter(|term| !term.trim().is_empty())
            .filter_map(|term| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(term.trim()));
                match Regex::new(&pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        tracing::warn!("Invalid blocked term {:?}: {}", term, e);
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }
}

impl Guardrail for ContentFilterGuardrail {
    fn name(&self) -> &str {
        "content_filter"
    }

    fn description(&self) -> &str {
        "Filter harmful or inappropriate content"
    }

    fn validate(&self, payload: &Map<String, Value>, _stage: GuardrailStage) -> Result<(), String> {
        let Some(text) = ["text", "task", "prompt", "result"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
        else {
            return Ok(());
        };

        for pattern in &self.patterns {
            if let Some(found) = pattern.find(text) {
                tracing::warn!("Content filter blocked text containing: {}", found.as_str());
                return Err(format!(
                    "Content filter detected potentially harmful content: {}",
                    found.as_str()
                ));
            }
        }
        Ok(())
    }
}

/// Checks `required` fields and `properties.*.type` of a JSON-schema-like object
pub struct DataValidationGuardrail {
    schema: Value,
}

impl DataValidationGuardrail {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }
}

impl Guardrail for DataValidationGuardrail {
    fn name(&self) -> &str {
        "data_validation"
    }

    fn description(&self) -> &str {
        "Validate data format and structure"
    }

    fn validate(&self, payload: &Map<String, Value>, _stage: GuardrailStage) -> Result<(), String> {
        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !payload.contains_key(field) {
                    return Err(format!("Missing required field: {}", field));
                }
            }
        }

        let Some(properties) = self.schema.get("properties").and_then(Value::as_object) else {
            return Ok(());
        };
        for (field, field_schema) in properties {
            let (Some(value), Some(expected)) = (
                payload.get(field),
                field_schema.get("type").and_then(Value::as_str),
            ) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                let article = if expected == "integer" || expected == "array" || expected == "object" {
                    "an"
                } else {
                    "a"
                };
                return Err(format!("Field '{}' must be {} {}", field, article, expected));
            }
        }
        Ok(())
    }
}

/// Per-identifier call counters; input stage only
pub struct RateLimitGuardrail {
    limits: HashMap<String, u32>,
    counters: Mutex<HashMap<(String, String), u32>>,
}

impl RateLimitGuardrail {
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn reset_counter(&self, key: &str, identifier: &str) {
        self.lock().remove(&(key.to_string(), identifier.to_string()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), u32>> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Looks at the payload itself, then its `context` object
    fn identifier(payload: &Map<String, Value>, key: &str) -> Option<String> {
        let scopes = [Some(payload), payload.get("context").and_then(Value::as_object)];
        scopes.into_iter().flatten().find_map(|scope| {
            let value = scope
                .get(key)
                .or_else(|| (key == "user_id").then(|| scope.get("user")).flatten())?;
            match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        })
    }
}

impl Guardrail for RateLimitGuardrail {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn description(&self) -> &str {
        "Enforce rate limits"
    }

    fn stages(&self) -> &[GuardrailStage] {
        &[GuardrailStage::Input]
    }

    fn validate(&self, payload: &Map<String, Value>, _stage: GuardrailStage) -> Result<(), String> {
        let mut counters = self.lock();
        for (key, limit) in &self.limits {
            let Some(identifier) = Self::identifier(payload, key) else {
                continue;
            };
            let count = counters.entry((key.clone(), identifier.clone())).or_insert(0);
            *count += 1;
            if *count > *limit {
                tracing::warn!("Rate limit exceeded for {}={}: {} > {}", key, identifier, count, limit);
                return Err(format!("Rate limit exceeded for {}", key));
            }
        }
        Ok(())
    }
}

pub struct CompositeGuardrail {
    name: String,
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl CompositeGuardrail {
    pub fn new(name: impl Into<String>, guardrails: Vec<Arc<dyn Guardrail>>) -> Self {
        Self {
            name: name.into(),
            guardrails,
        }
    }
}

impl Guardrail for CompositeGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Combines multiple guardrails"
    }

    fn validate(&self, payload: &Map<String, Value>, stage: GuardrailStage) -> Result<(), String> {
        apply_guardrails(&self.guardrails, payload, stage).map_err(|(_, reason)| reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn filter() -> ContentFilterGuardrail {
        ContentFilterGuardrail::new(&["illegal activity".to_string(), "violence".to_string()])
    }

    #[test]
    fn test_content_filter_whole_words_case_insensitive() {
        let filter = filter();
        let err = filter
            .validate(&payload(json!({"task": "Describe VIOLENCE in films"})), GuardrailStage::Input)
            .unwrap_err();
        assert_eq!(err, "Content filter detected potentially harmful content: VIOLENCE");

        assert!(filter
            .validate(&payload(json!({"task": "nonviolence movements"})), GuardrailStage::Input)
            .is_ok());
        assert!(filter
            .validate(&payload(json!({"result": "plan some illegal activity"})), GuardrailStage::Output)
            .is_err());
        assert!(filter
            .validate(&payload(json!({"other": "violence"})), GuardrailStage::Input)
            .is_ok());
    }

    #[test]
    fn test_data_validation() {
        let guardrail = DataValidationGuardrail::new(json!({
            "required": ["task"],
            "properties": {"task": {"type": "string"}, "count": {"type": "integer"}}
        }));

        assert!(guardrail
            .validate(&payload(json!({"task": "x", "count": 2})), GuardrailStage::Input)
            .is_ok());
        assert_eq!(
            guardrail.validate(&Map::new(), GuardrailStage::Input).unwrap_err(),
            "Missing required field: task"
        );
        assert_eq!(
            guardrail
                .validate(&payload(json!({"task": "x", "count": 1.5})), GuardrailStage::Input)
                .unwrap_err(),
            "Field 'count' must be an integer"
        );
    }

    #[test]
    fn test_rate_limit_counts_per_user_and_resets() {
        let guardrail = RateLimitGuardrail::new(HashMap::from([("user_id".to_string(), 2)]));
        let alice = payload(json!({"task": "t", "context": {"user": "alice"}}));
        let bob = payload(json!({"user_id": "bob"}));

        assert!(guardrail.validate(&alice, GuardrailStage::Input).is_ok());
        assert!(guardrail.validate(&alice, GuardrailStage::Input).is_ok());
        assert_eq!(
            guardrail.validate(&alice, GuardrailStage::Input).unwrap_err(),
            "Rate limit exceeded for user_id"
        );
        assert!(guardrail.validate(&bob, GuardrailStage::Input).is_ok());

        guardrail.reset_counter("user_id", "alice");
        assert!(guardrail.validate(&alice, GuardrailStage::Input).is_ok());
        guardrail.reset();
        assert!(guardrail.validate(&alice, GuardrailStage::Input).is_ok());
        assert!(!guardrail.applies_to(GuardrailStage::Output));
    }

    #[test]
    fn test_composite_short_circuits_in_order() {
        let limiter = Arc::new(RateLimitGuardrail::new(HashMap::from([("user_id".to_string(), 0)])));
        let composite = CompositeGuardrail::new(
            "all",
            vec![Arc::new(filter()) as Arc<dyn Guardrail>, limiter.clone()],
        );

        let err = composite
            .validate(&payload(json!({"task": "violence", "user_id": "u"})), GuardrailStage::Input)
            .unwrap_err();
        assert!(err.starts_with("Content filter"));

        let err = composite
            .validate(&payload(json!({"task": "fine", "user_id": "u"})), GuardrailStage::Input)
            .unwrap_err();
        assert_eq!(err, "Rate limit exceeded for user_id");

        assert!(composite
            .validate(&payload(json!({"result": "fine", "user_id": "u"})), GuardrailStage::Output)
            .is_ok());
    }
}
