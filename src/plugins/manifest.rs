use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use super::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Text,
    Number,
    Boolean,
    Select,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputOption {
    pub value: Value,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    pub id: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<InputOption>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    #[serde(rename = "class")]
    class_name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    description: Option<String>,
    default_prompt: Option<String>,
    #[serde(default)]
    inputs: Vec<PluginInput>,
}

/// Parsed `manifest.json` of a plugin directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub dependencies: Vec<String>,
    pub description: String,
    pub default_prompt: String,
    pub inputs: Vec<PluginInput>,
}

impl PluginManifest {
    /// Parse a manifest read from `path`, naming the file in parse errors
    pub fn parse_at(content: &str, path: &Path) -> Result<Self, PluginError> {
        Self::parse(content).map_err(|e| match e {
            PluginError::ManifestParse { message, .. } => PluginError::ManifestParse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, PluginError> {
        let value: Value = serde_json::from_str(content).map_err(|e| PluginError::ManifestParse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        let raw: RawManifest = serde_json::from_value(value)
            .map_err(|e| PluginError::ManifestInvalid(e.to_string()))?;

        for (field, text) in [
            ("name", &raw.name),
            ("version", &raw.version),
            ("class", &raw.class_name),
        ] {
            if text.trim().is_empty() {
                return Err(PluginError::ManifestInvalid(format!("{} must not be empty", field)));
            }
        }
        for input in &raw.inputs {
            if input.input_type == InputType::Select && input.options.is_empty() {
                return Err(PluginError::ManifestInvalid(format!(
                    "select input {} has no options",
                    input.id
                )));
            }
        }

        Ok(Self {
            description: raw
                .description
                .unwrap_or_else(|| format!("{} plugin", raw.name)),
            default_prompt: raw
                .default_prompt
                .unwrap_or_else(|| format!("Use {} plugin", raw.name)),
            name: raw.name,
            version: raw.version,
            class_name: raw.class_name,
            dependencies: raw.dependencies,
            inputs: raw.inputs,
        })
    }

    /// Validate and coerce caller inputs against the declared inputs.
    /// Undeclared keys are dropped.
    pub fn validate_input(&self, data: &Map<String, Value>) -> Result<Map<String, Value>, PluginError> {
        let mut result = Map::new();

        for input in &self.inputs {
            let id = &input.id;
            let value = match data.get(id) {
                Some(value) => value,
                None => match &input.default {
                    Some(default) => {
                        result.insert(id.clone(), default.clone());
                        continue;
                    }
                    None => {
                        return Err(PluginError::InvalidInput(format!(
                            "Missing required input: {}",
                            id
                        )))
                    }
                },
            };

            let coerced = match input.input_type {
                InputType::Text => match value {
                    Value::String(_) => value.clone(),
                    _ => return Err(invalid(format!("Input {} must be a string", id))),
                },
                InputType::Number => {
                    let number = match value {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse::<f64>().ok(),
                        _ => None,
                    };
                    number
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| invalid(format!("Input {} must be a number", id)))?
                }
                InputType::Boolean => match value {
                    Value::Bool(_) => value.clone(),
                    Value::String(s) => {
                        Value::Bool(matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"))
                    }
                    _ => return Err(invalid(format!("Input {} must be a boolean", id))),
                },
                InputType::Select => {
                    if !input.options.iter().any(|opt| &opt.value == value) {
                        let allowed: Vec<String> = input
                            .options
                            .iter()
                            .map(|opt| match &opt.value {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect();
                        return Err(invalid(format!(
                            "Input {} must be one of: {}",
                            id,
                            allowed.join(", ")
                        )));
                    }
                    value.clone()
                }
            };
            result.insert(id.clone(), coerced);
        }

        Ok(result)
    }
}

fn invalid(message: String) -> PluginError {
    PluginError::InvalidInput(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> PluginManifest {
        PluginManifest::parse(
            r#"{
                "name": "weather",
                "version": "1.0.0",
                "class": "WeatherPlugin",
                "dependencies": ["geo"],
                "inputs": [
                    {"id": "city", "type": "text", "label": "City"},
                    {"id": "days", "type": "number", "label": "Days", "default": 3},
                    {"id": "metric", "type": "boolean", "label": "Metric", "default": true},
                    {"id": "detail", "type": "select", "label": "Detail", "default": "short",
                     "options": [{"value": "short", "label": "Short"}, {"value": "long", "label": "Long"}]}
                ]
            }"#,
        )
        .unwrap()
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_fills_defaults() {
        let manifest = manifest();
        assert_eq!(manifest.class_name, "WeatherPlugin");
        assert_eq!(manifest.dependencies, vec!["geo"]);
        assert_eq!(manifest.description, "weather plugin");
        assert_eq!(manifest.default_prompt, "Use weather plugin");
    }

    #[test]
    fn test_parse_rejects_bad_manifests() {
        assert!(matches!(
            PluginManifest::parse("{not json"),
            Err(PluginError::ManifestParse { .. })
        ));
        assert!(matches!(
            PluginManifest::parse(r#"{"name": "x", "version": "1"}"#),
            Err(PluginError::ManifestInvalid(_))
        ));
        assert!(matches!(
            PluginManifest::parse(
                r#"{"name": "x", "version": "1", "class": "X",
                    "inputs": [{"id": "a", "type": "color", "label": "A"}]}"#
            ),
            Err(PluginError::ManifestInvalid(_))
        ));
        assert!(matches!(
            PluginManifest::parse(
                r#"{"name": "x", "version": "1", "class": "X",
                    "inputs": [{"id": "a", "type": "select", "label": "A"}]}"#
            ),
            Err(PluginError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn test_validate_input_coerces_and_defaults() {
        let validated = manifest()
            .validate_input(&inputs(json!({"city": "Oslo", "days": "5", "metric": "no", "extra": 1})))
            .unwrap();

        assert_eq!(validated["city"], json!("Oslo"));
        assert_eq!(validated["days"], json!(5.0));
        assert_eq!(validated["metric"], json!(false));
        assert_eq!(validated["detail"], json!("short"));
        assert!(!validated.contains_key("extra"));
    }

    #[test]
    fn test_validate_input_errors() {
        let manifest = manifest();

        let err = manifest.validate_input(&Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "Missing required input: city");

        let err = manifest
            .validate_input(&inputs(json!({"city": 7})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Input city must be a string");

        let err = manifest
            .validate_input(&inputs(json!({"city": "Oslo", "days": "many"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Input days must be a number");

        let err = manifest
            .validate_input(&inputs(json!({"city": "Oslo", "detail": "huge"})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Input detail must be one of: short, long");
    }

    #[test]
    fn test_parse_at_names_the_manifest_file() {
        let err = PluginManifest::parse_at("{not json", Path::new("plugins/weather/manifest.json")).unwrap_err();
        match err {
            PluginError::ManifestParse { path, .. } => assert_eq!(path, "plugins/weather/manifest.json"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
