//! Splitting oversized FHIR Bundles into size-bounded chunks and putting
//! them back together after pseudonymization.
//!
//! Resources are handled as opaque `serde_json::Value` trees. The only
//! structural contracts are `resourceType`, `id`, `type`, `entry` and the
//! per-entry `resource` object; everything else passes through untouched.

use fhirpipe_core::error::PipelineError;
use serde_json::{json, Map, Value};

/// Bundle types that carry a `total` field per FHIR R4. Emitting `total`
/// on any other type (collection, document, ...) is a protocol violation.
const TOTAL_BEARING_TYPES: &[&str] = &["searchset", "history"];

#[derive(Debug, Clone, PartialEq)]
pub struct BundleMetadata {
    pub id: String,
    pub bundle_type: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BundleChunk {
    pub chunk_id: String,
    pub entries: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SplitResult {
    pub metadata: BundleMetadata,
    pub chunks: Vec<BundleChunk>,
    pub original_size: usize,
    pub was_split: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitStats {
    pub bundle_id: String,
    pub original_size: usize,
    pub original_entry_count: usize,
    pub chunks_created: usize,
    pub smallest_chunk_size: usize,
    pub largest_chunk_size: usize,
    pub average_chunk_size: usize,
}

/// Compact JSON byte length of a value; the size measure used for all
/// threshold decisions.
pub fn json_size(value: &Value) -> usize {
    // Serializing a Value cannot fail in practice; if it ever does, MAX
    // routes the resource into the oversize path instead of past it.
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
}

/// The error raised for a resource too large to send and impossible to
/// split. Carries enough context for the operator to find the record.
pub fn oversized_resource_error(
    resource_type: &str,
    resource_id: &str,
    size: usize,
    threshold: usize,
) -> PipelineError {
    PipelineError::non_transient(format!(
        "resource {} (id '{}') is {} bytes, exceeding the {} byte split threshold; \
         only Bundles can be split - reduce the resource size or raise \
         bundle_split_threshold_mb",
        resource_type, resource_id, size, threshold
    ))
}

/// Pulls `id`, `type` and the optional `timestamp` out of a Bundle,
/// rejecting values that are not structurally a Bundle.
pub fn extract_metadata(bundle: &Value) -> Result<BundleMetadata, PipelineError> {
    let obj = bundle
        .as_object()
        .ok_or_else(|| PipelineError::non_transient("bundle is not a JSON object"))?;

    match obj.get("resourceType").and_then(Value::as_str) {
        Some("Bundle") => {}
        other => {
            return Err(PipelineError::non_transient(format!(
                "expected resourceType 'Bundle', got {:?}",
                other.unwrap_or("<missing>")
            )));
        }
    }

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::non_transient("bundle has no 'id'"))?;
    let bundle_type = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::non_transient(format!("bundle '{}' has no 'type'", id)))?;

    if let Some(entry) = obj.get("entry") {
        if !entry.is_array() {
            return Err(PipelineError::non_transient(format!(
                "bundle '{}' has a non-array 'entry'",
                id
            )));
        }
    }

    Ok(BundleMetadata {
        id: id.to_string(),
        bundle_type: bundle_type.to_string(),
        timestamp: obj
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn entry_resource_type(entry: &Value) -> &str {
    entry
        .get("resource")
        .and_then(|r| r.get("resourceType"))
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
}

fn entry_resource_id(entry: &Value) -> &str {
    entry
        .get("resource")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
}

/// Splits a Bundle into chunks whose estimated sizes stay within
/// `threshold`. Entries are walked greedily in original order; a partition
/// closes when the next entry would push it over the threshold. A single
/// entry larger than the threshold cannot be placed anywhere and fails
/// the split.
pub fn split_bundle(bundle: &Value, threshold: usize) -> Result<SplitResult, PipelineError> {
    let metadata = extract_metadata(bundle)?;
    let entries: Vec<Value> = bundle
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let original_size = json_size(bundle);

    if original_size <= threshold {
        let chunks = vec![BundleChunk {
            chunk_id: format!("{}-chunk-0", metadata.id),
            entries,
        }];
        return Ok(SplitResult {
            metadata,
            chunks,
            original_size,
            was_split: false,
        });
    }

    let mut partitions: Vec<Vec<Value>> = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    let mut current_size: usize = 0;

    for entry in entries {
        let entry_size = json_size(&entry);
        if entry_size > threshold {
            // Bundles nested inside entries are unusual and are not
            // re-split; an oversized entry fails the whole split.
            return Err(oversized_resource_error(
                entry_resource_type(&entry),
                entry_resource_id(&entry),
                entry_size,
                threshold,
            ));
        }
        if current_size + entry_size > threshold && !current.is_empty() {
            partitions.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += entry_size;
        current.push(entry);
    }
    if !current.is_empty() {
        partitions.push(current);
    }

    let chunks = partitions
        .into_iter()
        .enumerate()
        .map(|(i, entries)| BundleChunk {
            chunk_id: format!("{}-chunk-{}", metadata.id, i),
            entries,
        })
        .collect();

    Ok(SplitResult {
        metadata,
        chunks,
        original_size,
        was_split: true,
    })
}

/// Materializes a chunk as a standalone FHIR Bundle ready to be sent.
/// `total` is emitted only for the bundle types whose R4 definition
/// carries one.
pub fn chunk_to_bundle(chunk: &BundleChunk, metadata: &BundleMetadata) -> Value {
    let mut bundle = json!({
        "resourceType": "Bundle",
        "id": chunk.chunk_id,
        "type": metadata.bundle_type,
        "entry": chunk.entries,
    });
    if let Some(ts) = &metadata.timestamp {
        bundle["timestamp"] = Value::String(ts.clone());
    }
    if TOTAL_BEARING_TYPES.contains(&metadata.bundle_type.as_str()) {
        bundle["total"] = json!(chunk.entries.len());
    }
    bundle
}

/// Reassembles pseudonymized chunk bundles into one Bundle.
///
/// The first chunk is the structural carrier: all of its top-level fields
/// are kept (the pseudonymizer may have added metadata such as
/// `meta.security`), then `id` and `type` are restored from the original
/// metadata and the entries of every chunk are concatenated in order.
pub fn reassemble(metadata: &BundleMetadata, chunks: &[Value]) -> Result<Value, PipelineError> {
    let first = chunks
        .first()
        .ok_or_else(|| PipelineError::non_transient("cannot reassemble zero chunks"))?;

    let mut carrier: Map<String, Value> = first
        .as_object()
        .cloned()
        .ok_or_else(|| PipelineError::non_transient("chunk is not a JSON object"))?;

    let mut entries: Vec<Value> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let obj = chunk.as_object().ok_or_else(|| {
            PipelineError::non_transient(format!("chunk {} is not a JSON object", i))
        })?;
        match obj.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            _ => {
                return Err(PipelineError::non_transient(format!(
                    "chunk {} is not a Bundle",
                    i
                )));
            }
        }
        match obj.get("entry") {
            None => {}
            Some(Value::Array(chunk_entries)) => entries.extend(chunk_entries.iter().cloned()),
            Some(_) => {
                return Err(PipelineError::non_transient(format!(
                    "chunk {} has a non-array 'entry'",
                    i
                )));
            }
        }
    }

    carrier.insert("resourceType".to_string(), json!("Bundle"));
    carrier.insert("id".to_string(), json!(metadata.id));
    carrier.insert("type".to_string(), json!(metadata.bundle_type));
    if TOTAL_BEARING_TYPES.contains(&metadata.bundle_type.as_str()) {
        carrier.insert("total".to_string(), json!(entries.len()));
    } else {
        carrier.remove("total");
    }
    carrier.insert("entry".to_string(), Value::Array(entries));

    Ok(Value::Object(carrier))
}

/// Summary numbers for one split, for the job log.
pub fn split_stats(result: &SplitResult) -> SplitStats {
    let sizes: Vec<usize> = result
        .chunks
        .iter()
        .map(|c| json_size(&chunk_to_bundle(c, &result.metadata)))
        .collect();
    let total: usize = sizes.iter().sum();
    SplitStats {
        bundle_id: result.metadata.id.clone(),
        original_size: result.original_size,
        original_entry_count: result.chunks.iter().map(|c| c.entries.len()).sum(),
        chunks_created: result.chunks.len(),
        smallest_chunk_size: sizes.iter().copied().min().unwrap_or(0),
        largest_chunk_size: sizes.iter().copied().max().unwrap_or(0),
        average_chunk_size: if sizes.is_empty() { 0 } else { total / sizes.len() },
    }
}
