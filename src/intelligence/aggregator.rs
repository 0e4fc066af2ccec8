use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::roles::SourcedResult;

pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    pub confidence: f32,
    pub source: String,
    pub source_priority: u8,
    #[serde(default)]
    pub metadata: Value,
}

impl Suggestion {
    /// Ranking score; priority is normalised from 1..=10 to 0.1..=1.0
    pub fn score(&self) -> f32 {
        self.confidence * 0.7 + (self.source_priority as f32 / 10.0) * 0.3
    }
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(default)]
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    metadata: Value,
}

fn default_confidence() -> f32 {
    0.5
}

/// Merges suggestion lists produced by several plugins for one request
pub struct SuggestionAggregator {
    threshold: f32,
    matcher: SkimMatcherV2,
}

impl SuggestionAggregator {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }

    /// Collect the `suggestions` arrays of every result, merge near
    /// duplicates (keeping the more confident one) and rank by score.
    pub fn aggregate(&self, results: &[SourcedResult]) -> Vec<Suggestion> {
        let mut all = Vec::new();
        for result in results {
            let Some(items) = result.result.get("suggestions").and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                match serde_json::from_value::<RawSuggestion>(item.clone()) {
                    Ok(raw) => all.push(Suggestion {
                        text: raw.text,
                        confidence: raw.confidence,
                        source: result.source.clone(),
                        source_priority: result.priority,
                        metadata: raw.metadata,
                    }),
                    Err(e) => tracing::debug!("Ignoring malformed suggestion from {}: {}", result.source, e),
                }
            }
        }

        let mut unique = self.deduplicate(all);
        unique.sort_by(|a, b| b.score().total_cmp(&a.score()));
        unique
    }

    fn deduplicate(&self, suggestions: Vec<Suggestion>) -> Vec<Suggestion> {
        let mut unique: Vec<Suggestion> = Vec::with_capacity(suggestions.len());

        for current in suggestions {
            let duplicate = unique
                .iter_mut()
                .find(|existing| self.similarity(&current.text, &existing.text) > self.threshold);
            match duplicate {
                Some(existing) => {
                    if current.confidence > existing.confidence {
                        *existing = current;
                    }
                }
                None => unique.push(current),
            }
        }

        unique
    }

    /// Similarity in `0.0..=1.0`: the fuzzy score of the shorter text inside
    /// the longer one relative to the longer text's perfect score
    pub fn similarity(&self, a: &str, b: &str) -> f32 {
        let a = normalize(a);
        let b = normalize(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }

        let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        let perfect = match self.matcher.fuzzy_match(&longer, &longer) {
            Some(score) if score > 0 => score,
            _ => return 0.0,
        };
        self.matcher
            .fuzzy_match(&longer, &shorter)
            .map(|score| (score as f32 / perfect as f32).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }
}

impl Default for SuggestionAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_THRESHOLD)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Groups analysis issues from several plugins by `line:column`, tagging
/// each with the plugin that reported it
pub fn aggregate_issues(results: &[SourcedResult]) -> BTreeMap<String, Vec<Value>> {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for result in results {
        let Some(issues) = result.result.get("issues").and_then(Value::as_array) else {
            continue;
        };
        for issue in issues {
            let mut issue = issue.clone();
            let line = issue.get("line").and_then(Value::as_u64).unwrap_or(0);
            let column = issue.get("column").and_then(Value::as_u64).unwrap_or(0);
            if let Value::Object(fields) = &mut issue {
                fields.insert("detected_by".to_string(), Value::String(result.source.clone()));
            }
            grouped
                .entry(format!("{}:{}", line, column))
                .or_default()
                .push(issue);
        }
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(source: &str, priority: u8, suggestions: Value) -> SourcedResult {
        SourcedResult {
            source: source.to_string(),
            priority,
            result: json!({ "suggestions": suggestions }),
        }
    }

    #[test]
    fn test_duplicates_keep_higher_confidence() {
        let aggregator = SuggestionAggregator::default();
        let suggestions = aggregator.aggregate(&[
            result("tabnine", 5, json!([{"text": "use a HashMap here", "confidence": 0.6}])),
            result("codiga", 5, json!([{"text": "Use a  hashmap here", "confidence": 0.9}])),
        ]);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].source, "codiga");
        assert_eq!(suggestions[0].confidence, 0.9);
    }

    #[test]
    fn test_ranked_by_confidence_and_priority() {
        let aggregator = SuggestionAggregator::default();
        let suggestions = aggregator.aggregate(&[
            result("low", 1, json!([{"text": "add logging", "confidence": 0.8}])),
            result("high", 10, json!([{"text": "remove the cache", "confidence": 0.7}])),
            result("none", 5, json!([{"text": "rename variable"}])),
        ]);

        let texts: Vec<&str> = suggestions.iter().map(|s| s.text.as_str()).collect();
        // 0.79, 0.59, 0.5
        assert_eq!(texts, vec!["remove the cache", "add logging", "rename variable"]);
        assert_eq!(suggestions[2].confidence, 0.5);
    }

    #[test]
    fn test_similarity_bounds() {
        let aggregator = SuggestionAggregator::default();
        assert_eq!(aggregator.similarity("Same Text", "same   text"), 1.0);
        assert_eq!(aggregator.similarity("add logging", "remove the cache"), 0.0);
        assert_eq!(aggregator.similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_results_without_suggestions_are_ignored() {
        let aggregator = SuggestionAggregator::default();
        let suggestions = aggregator.aggregate(&[SourcedResult {
            source: "plain".to_string(),
            priority: 5,
            result: json!({"response": "hi"}),
        }]);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn test_issues_grouped_by_location() {
        let results = vec![
            SourcedResult {
                source: "lint".to_string(),
                priority: 5,
                result: json!({"issues": [{"line": 3, "column": 1, "msg": "unused"}]}),
            },
            SourcedResult {
                source: "sec".to_string(),
                priority: 5,
                result: json!({"issues": [{"line": 3, "column": 1, "msg": "unsafe"}, {"msg": "global"}]}),
            },
        ];

        let grouped = aggregate_issues(&results);
        assert_eq!(grouped["3:1"].len(), 2);
        assert_eq!(grouped["3:1"][1]["detected_by"], "sec");
        assert_eq!(grouped["0:0"].len(), 1);
    }
}
