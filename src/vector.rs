// src/vector.rs
// Qdrant adapter: named-vector-aware search, scroll, upsert, retrieve,
// delete. Payloads cross this boundary as serde_json values; conversion to
// and from the protobuf Value type happens here and nowhere else.

use std::collections::HashMap;

use anyhow::{Context, Result};
use qdrant_client::qdrant::{
    value::Kind, vector_output, vectors_config, vectors_output::VectorsOptions, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, GetPointsBuilder, ListValue,
    PointId, PointStruct, ScrollPointsBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Collections that are never used as knowledge corpus.
pub const IGNORED_COLLECTIONS: &[&str] = &["memory_raw"];

/// The personal/episodic memory collection.
pub const MEMORY_COLLECTION: &str = "memory_raw";

/// Embedding dimensions for text-embedding-3-large.
pub const EMBEDDING_DIM: u64 = 3072;

/// A search or scroll hit with its payload decoded to JSON.
#[derive(Debug, Clone)]
pub struct Hit {
    pub collection: String,
    pub id: String,
    pub score: f32,
    pub payload: JsonValue,
}

/// A point retrieved by id, vector included when requested.
#[derive(Debug, Clone)]
pub struct RetrievedPoint {
    pub id: String,
    pub payload: JsonValue,
    pub vector: Option<Vec<f32>>,
}

pub struct VectorStore {
    client: Qdrant,
}

impl VectorStore {
    pub fn new(url: &str) -> Result<Self> {
        // Skip compatibility check to allow minor version mismatches between
        // client and server.
        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .context("Failed to connect to Qdrant")?;
        Ok(Self { client })
    }

    pub async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let exists = self.client.collection_exists(collection).await?;
        if !exists {
            match self
                .client
                .create_collection(
                    CreateCollectionBuilder::new(collection)
                        .vectors_config(VectorParamsBuilder::new(EMBEDDING_DIM, Distance::Cosine)),
                )
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    // Another process may have created it between the exists
                    // check and the create call.
                    if e.to_string().contains("already exists") {
                        debug!("collection {} already exists", collection);
                    } else {
                        return Err(e)
                            .context(format!("Failed to create collection: {collection}"));
                    }
                }
            }
        }
        Ok(())
    }

    /// All collection names except the ignored set.
    pub async fn corpus_collections(&self) -> Result<Vec<String>> {
        let resp = self.client.list_collections().await?;
        Ok(resp
            .collections
            .into_iter()
            .map(|c| c.name)
            .filter(|name| !IGNORED_COLLECTIONS.contains(&name.as_str()))
            .collect())
    }

    /// First named vector of a collection, if it was created with named
    /// vectors. Search requests against such collections must carry the name.
    pub async fn first_named_vector(&self, collection: &str) -> Option<String> {
        let info = match self.client.collection_info(collection).await {
            Ok(i) => i,
            Err(e) => {
                debug!("collection_info failed for {}: {}", collection, e);
                return None;
            }
        };
        let params = info.result?.config?.params?;
        match params.vectors_config?.config? {
            vectors_config::Config::ParamsMap(map) => map.map.keys().next().cloned(),
            vectors_config::Config::Params(_) => None,
        }
    }

    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: u64,
        score_threshold: Option<f32>,
        filter: Option<Filter>,
    ) -> Result<Vec<Hit>> {
        let mut builder = SearchPointsBuilder::new(collection, vector.to_vec(), limit)
            .with_payload(true);
        if let Some(thr) = score_threshold {
            builder = builder.score_threshold(thr);
        }
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        if let Some(name) = self.first_named_vector(collection).await {
            builder = builder.vector_name(name);
        }

        let results = self
            .client
            .search_points(builder)
            .await
            .with_context(|| format!("Qdrant search failed for {collection}"))?;

        Ok(results
            .result
            .into_iter()
            .map(|p| Hit {
                collection: collection.to_string(),
                id: p.id.as_ref().map(point_id_string).unwrap_or_default(),
                score: p.score,
                payload: payload_to_json(&p.payload),
            })
            .collect())
    }

    /// Scroll all points matching a filter, paging internally.
    pub async fn scroll(
        &self,
        collection: &str,
        filter: Option<Filter>,
        limit: usize,
        with_payload: bool,
    ) -> Result<Vec<RetrievedPoint>> {
        let mut out = Vec::new();
        let mut offset: Option<PointId> = None;
        let page: u32 = 256;

        loop {
            let mut builder = ScrollPointsBuilder::new(collection)
                .limit(page)
                .with_payload(with_payload)
                .with_vectors(false);
            if let Some(ref f) = filter {
                builder = builder.filter(f.clone());
            }
            if let Some(ref off) = offset {
                builder = builder.offset(off.clone());
            }

            let response = self.client.scroll(builder).await?;
            if response.result.is_empty() {
                break;
            }

            for point in &response.result {
                let id = point.id.as_ref().map(point_id_string).unwrap_or_default();
                out.push(RetrievedPoint {
                    id,
                    payload: payload_to_json(&point.payload),
                    vector: None,
                });
                if out.len() >= limit {
                    return Ok(out);
                }
            }

            offset = response.next_page_offset.clone();
            if offset.is_none() {
                break;
            }
        }

        Ok(out)
    }

    pub async fn retrieve(
        &self,
        collection: &str,
        ids: &[String],
        with_vectors: bool,
    ) -> Result<Vec<RetrievedPoint>> {
        let point_ids: Vec<PointId> = ids.iter().map(|s| PointId::from(s.clone())).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, point_ids)
                    .with_payload(true)
                    .with_vectors(with_vectors),
            )
            .await
            .with_context(|| format!("Qdrant retrieve failed for {collection}"))?;

        Ok(response
            .result
            .into_iter()
            .map(|p| {
                let vector = p.vectors.as_ref().and_then(dense_vector);
                RetrievedPoint {
                    id: p.id.as_ref().map(point_id_string).unwrap_or_default(),
                    payload: payload_to_json(&p.payload),
                    vector,
                }
            })
            .collect())
    }

    pub async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: &JsonValue,
    ) -> Result<()> {
        let point = PointStruct::new(
            PointId::from(id.to_string()),
            vector,
            json_object_to_payload(payload),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![point]).wait(true))
            .await
            .with_context(|| format!("Qdrant upsert failed for {collection}"))?;
        Ok(())
    }

    pub async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|s| PointId::from(s.clone())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(point_ids)
                    .wait(true),
            )
            .await
            .with_context(|| format!("Qdrant delete failed for {collection}"))?;
        Ok(())
    }

    pub async fn delete_by_filter(&self, collection: &str, filter: Filter) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .with_context(|| format!("Qdrant filtered delete failed for {collection}"))?;
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self.client.collection_exists(MEMORY_COLLECTION).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

/// `must` condition matching one payload field to a string value.
pub fn match_field(key: &str, value: &str) -> Condition {
    Condition::matches(key, value.to_string())
}

fn point_id_string(id: &PointId) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match &id.point_id_options {
        Some(PointIdOptions::Num(n)) => n.to_string(),
        Some(PointIdOptions::Uuid(u)) => u.clone(),
        None => String::new(),
    }
}

fn dense_vector(v: &qdrant_client::qdrant::VectorsOutput) -> Option<Vec<f32>> {
    match &v.vectors_options {
        Some(VectorsOptions::Vector(vec)) => match vec.clone().into_vector() {
            vector_output::Vector::Dense(dense) => Some(dense.data),
            _ => None,
        },
        _ => None,
    }
}

// ---- serde_json <-> protobuf Value conversion ----

pub fn json_to_qdrant(v: &JsonValue) -> QdrantValue {
    let kind = match v {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(b) => Kind::BoolValue(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Kind::StringValue(s.clone()),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_qdrant).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

pub fn qdrant_to_json(v: &QdrantValue) -> JsonValue {
    match &v.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::IntegerValue(i)) => JsonValue::from(*i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map(JsonValue::Number).unwrap_or(JsonValue::Null)
        }
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(st)) => JsonValue::Object(
            st.fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_to_json(v)))
                .collect(),
        ),
    }
}

/// Flatten a JSON object into the payload map Qdrant expects.
/// Non-object values get wrapped under a single `value` key.
pub fn json_object_to_payload(v: &JsonValue) -> HashMap<String, QdrantValue> {
    match v {
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
            .collect(),
        other => HashMap::from([("value".to_string(), json_to_qdrant(other))]),
    }
}

pub fn payload_to_json(map: &HashMap<String, QdrantValue>) -> JsonValue {
    JsonValue::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), qdrant_to_json(v)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrips_through_qdrant_value() {
        let original = json!({
            "text": "hello",
            "tags": ["format:prose", "topic:fm"],
            "feedback": {"positive_signals": 3, "negative_signals": 1},
            "base_importance": 0.7,
            "archived": false,
            "thread_id": null,
        });
        let payload = json_object_to_payload(&original);
        let back = payload_to_json(&payload);
        assert_eq!(back, original);
    }

    #[test]
    fn scalar_payload_wraps_under_value_key() {
        let payload = json_object_to_payload(&json!("bare"));
        assert!(payload.contains_key("value"));
    }
}
