use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::capability::{
    CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType, ProviderError,
    VectorMatch, VectorOperation, VectorRequest,
};

const CAPABILITIES: &[CapabilityType] = &[CapabilityType::VectorStorage];
const DEFAULT_COLLECTION: &str = "default";
const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone)]
struct Record {
    vector: Vec<f32>,
    metadata: Value,
}

/// In-process vector store keyed by collection; ranks queries by cosine similarity
pub struct MemoryVectorProvider {
    name: String,
    // collection -> id -> record, ids kept in insertion order
    collections: RwLock<HashMap<String, Vec<(String, Record)>>>,
}

impl MemoryVectorProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    async fn run(&self, request: VectorRequest) -> Result<CapabilityOutput> {
        let collection = request
            .collection
            .clone()
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());

        match request.operation {
            VectorOperation::Upsert => self.upsert(&collection, request).await,
            VectorOperation::Query => {
                let query = request.query_vector.ok_or_else(|| {
                    ProviderError::InvalidConfig("query requires query_vector".to_string())
                })?;
                let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K);
                let collections = self.collections.read().await;
                if let Some(records) = collections.get(&collection) {
                    check_dimension(&collection, records, &query)?;
                }

                let mut matches: Vec<VectorMatch> = collections
                    .get(&collection)
                    .map(|records| {
                        records
                            .iter()
                            .map(|(id, r)| VectorMatch {
                                id: id.clone(),
                                score: cosine_similarity(&query, &r.vector),
                                metadata: r.metadata.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                matches.sort_by(|a, b| b.score.total_cmp(&a.score));
                matches.truncate(top_k);

                Ok(vector_output(
                    VectorOperation::Query,
                    matches.iter().map(|m| m.id.clone()).collect(),
                    matches,
                ))
            }
            VectorOperation::Get => {
                let collections = self.collections.read().await;
                let matches: Vec<VectorMatch> = collections
                    .get(&collection)
                    .map(|records| {
                        records
                            .iter()
                            .filter(|(id, _)| request.ids.is_empty() || request.ids.contains(id))
                            .map(|(id, r)| VectorMatch {
                                id: id.clone(),
                                score: 1.0,
                                metadata: r.metadata.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Ok(vector_output(
                    VectorOperation::Get,
                    matches.iter().map(|m| m.id.clone()).collect(),
                    matches,
                ))
            }
            VectorOperation::Delete => {
                let mut collections = self.collections.write().await;
                let mut removed = Vec::new();
                if let Some(records) = collections.get_mut(&collection) {
                    records.retain(|(id, _)| {
                        if request.ids.contains(id) {
                            removed.push(id.clone());
                            false
                        } else {
                            true
                        }
                    });
                }
                Ok(vector_output(VectorOperation::Delete, removed, Vec::new()))
            }
            VectorOperation::Count => {
                let count = self
                    .collections
                    .read()
                    .await
                    .get(&collection)
                    .map_or(0, Vec::len);
                Ok(CapabilityOutput::Vector {
                    operation: VectorOperation::Count,
                    ids: Vec::new(),
                    matches: Vec::new(),
                    count,
                })
            }
        }
    }

    async fn upsert(&self, collection: &str, request: VectorRequest) -> Result<CapabilityOutput> {
        if request.vectors.is_empty() {
            return Err(ProviderError::InvalidConfig("upsert requires vectors".to_string()).into());
        }
        if !request.ids.is_empty() && request.ids.len() != request.vectors.len() {
            return Err(ProviderError::InvalidConfig(format!(
                "{} ids for {} vectors",
                request.ids.len(),
                request.vectors.len()
            ))
            .into());
        }

        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        match records.first() {
            Some(_) => {
                for vector in &request.vectors {
                    check_dimension(collection, records, vector)?;
                }
            }
            None => {
                let dimension = request.vectors[0].len();
                if let Some(other) = request.vectors.iter().find(|v| v.len() != dimension) {
                    return Err(dimension_error(collection, dimension, other.len()));
                }
            }
        }
        let mut ids = Vec::with_capacity(request.vectors.len());

        for (i, vector) in request.vectors.into_iter().enumerate() {
            let id = request
                .ids
                .get(i)
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let record = Record {
                vector,
                metadata: request.metadata.get(i).cloned().unwrap_or(Value::Null),
            };

            match records.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, slot)) => *slot = record,
                None => records.push((id.clone(), record)),
            }
            ids.push(id);
        }

        tracing::debug!("Upserted {} vectors into {}", ids.len(), collection);
        Ok(vector_output(VectorOperation::Upsert, ids, Vec::new()))
    }
}

fn vector_output(operation: VectorOperation, ids: Vec<String>, matches: Vec<VectorMatch>) -> CapabilityOutput {
    CapabilityOutput::Vector {
        operation,
        count: ids.len(),
        ids,
        matches,
    }
}

/// Every record of a collection shares the dimension of its first record
fn check_dimension(collection: &str, records: &[(String, Record)], vector: &[f32]) -> Result<()> {
    match records.first() {
        Some((_, first)) if first.vector.len() != vector.len() => {
            Err(dimension_error(collection, first.vector.len(), vector.len()))
        }
        _ => Ok(()),
    }
}

fn dimension_error(collection: &str, expected: usize, actual: usize) -> anyhow::Error {
    ProviderError::InvalidConfig(format!(
        "collection {} holds {}-dimensional vectors, got {}",
        collection, expected, actual
    ))
    .into()
}

/// Callers guarantee equal lengths
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl CapabilityProvider for MemoryVectorProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn shutdown(&self) -> Result<()> {
        self.collections.write().await.clear();
        Ok(())
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        match request {
            CapabilityRequest::Vector(vector) => self.run(vector).await,
            other => Err(ProviderError::Unsupported {
                provider: self.name.clone(),
                capability: other.capability(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seed(provider: &MemoryVectorProvider) {
        let mut request = VectorRequest::new(VectorOperation::Upsert);
        request.ids = vec!["x".to_string(), "y".to_string(), "xy".to_string()];
        request.vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        request.metadata = vec![json!({"axis": "x"}), json!({"axis": "y"})];
        provider.execute(CapabilityRequest::Vector(request)).await.unwrap();
    }

    async fn run(provider: &MemoryVectorProvider, request: VectorRequest) -> (Vec<String>, Vec<VectorMatch>, usize) {
        match provider.execute(CapabilityRequest::Vector(request)).await.unwrap() {
            CapabilityOutput::Vector { ids, matches, count, .. } => (ids, matches, count),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine_similarity() {
        let provider = MemoryVectorProvider::new("memory");
        seed(&provider).await;

        let mut query = VectorRequest::new(VectorOperation::Query);
        query.query_vector = Some(vec![1.0, 0.1]);
        query.top_k = Some(2);

        let (ids, matches, _) = run(&provider, query).await;
        assert_eq!(ids, vec!["x", "xy"]);
        assert_eq!(matches[0].metadata, json!({"axis": "x"}));
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let provider = MemoryVectorProvider::new("memory");
        seed(&provider).await;

        let mut replace = VectorRequest::new(VectorOperation::Upsert);
        replace.ids = vec!["x".to_string()];
        replace.vectors = vec![vec![-1.0, 0.0]];
        run(&provider, replace).await;
        assert_eq!(run(&provider, VectorRequest::new(VectorOperation::Count)).await.2, 3);

        let mut delete = VectorRequest::new(VectorOperation::Delete);
        delete.ids = vec!["y".to_string(), "missing".to_string()];
        let (removed, _, _) = run(&provider, delete).await;
        assert_eq!(removed, vec!["y"]);

        let (ids, _, _) = run(&provider, VectorRequest::new(VectorOperation::Get)).await;
        assert_eq!(ids, vec!["x", "xy"]);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let provider = MemoryVectorProvider::new("memory");
        seed(&provider).await;

        let mut count = VectorRequest::new(VectorOperation::Count);
        count.collection = Some("other".to_string());
        assert_eq!(run(&provider, count).await.2, 0);
    }

    #[tokio::test]
    async fn test_mismatched_ids_rejected() {
        let provider = MemoryVectorProvider::new("memory");
        let mut request = VectorRequest::new(VectorOperation::Upsert);
        request.ids = vec!["only-one".to_string()];
        request.vectors = vec![vec![1.0], vec![2.0]];
        assert!(provider.execute(CapabilityRequest::Vector(request)).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let provider = MemoryVectorProvider::new("memory");
        seed(&provider).await;

        let mut upsert = VectorRequest::new(VectorOperation::Upsert);
        upsert.ids = vec!["z".to_string()];
        upsert.vectors = vec![vec![1.0, 0.0, 0.0]];
        let err = provider.execute(CapabilityRequest::Vector(upsert)).await.unwrap_err();
        assert!(err.to_string().contains("2-dimensional"));

        let mut query = VectorRequest::new(VectorOperation::Query);
        query.query_vector = Some(vec![1.0]);
        assert!(provider.execute(CapabilityRequest::Vector(query)).await.is_err());

        let mut mixed = VectorRequest::new(VectorOperation::Upsert);
        mixed.collection = Some("fresh".to_string());
        mixed.vectors = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(provider.execute(CapabilityRequest::Vector(mixed)).await.is_err());

        let mut count = VectorRequest::new(VectorOperation::Count);
        count.collection = Some("fresh".to_string());
        let (_, _, stored) = run(&provider, count).await;
        assert_eq!(stored, 0);
    }
}
