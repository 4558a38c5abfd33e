#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **drylab-schema** – Schema resolution and validation for drylab.
//!
//! Resolves a [`SchemaId`](drylab_types::SchemaId) of the form `NAME@VERSION`
//! to a compiled JSON Schema validator, loaded from a well-known directory
//! as `NAME.vVERSION.json`, and caches it for the lifetime of the registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use drylab_types::{Blob, SchemaId};
use jsonschema::{Draft, JSONSchema};
use tracing::{debug, warn};

/// Errors that can occur while resolving or applying a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// No validator document could be found or compiled for the schema id.
    #[error("unknown schema: {0}")]
    UnknownSchema(SchemaId),
    /// The validator rejected the payload.
    #[error("invalid payload for schema {schema}: {reason}")]
    InvalidPayload {
        /// The schema that rejected the payload.
        schema: SchemaId,
        /// Human-readable validation failure detail.
        reason: String,
    },
}

/// A compiled schema document plus the metadata needed to apply it.
struct CompiledSchema {
    compiled: JSONSchema,
    payload_is_utf8: bool,
}

/// Resolves schema identifiers to validators and caches them by process
/// lifetime (in practice, the lifetime of the `SchemaRegistry` instance).
#[derive(Clone)]
pub struct SchemaRegistry {
    schema_dir: PathBuf,
    cache: Arc<DashMap<SchemaId, Arc<CompiledSchema>>>,
}

impl SchemaRegistry {
    /// Create a registry that loads schema documents from `schema_dir`.
    pub fn new(schema_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema_dir: schema_dir.into(),
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Validate `blob` against the schema named by `schema_id`.
    ///
    /// Returns `Ok(())` on success, or a [`SchemaError`] describing why the
    /// blob was rejected. Neither error kind is retried here; the caller
    /// (the ledger) decides how to report the outcome to its own caller.
    pub fn validate(&self, schema_id: &SchemaId, blob: &Blob) -> Result<(), SchemaError> {
        let schema = self.resolve(schema_id)?;

        if schema.payload_is_utf8 {
            let text = std::str::from_utf8(blob).map_err(|e| SchemaError::InvalidPayload {
                schema: schema_id.clone(),
                reason: format!("payload is not valid utf-8: {e}"),
            })?;
            let instance: serde_json::Value =
                serde_json::from_str(text).unwrap_or(serde_json::Value::String(text.to_string()));
            self.run(schema_id, &schema, &instance)
        } else {
            let instance: serde_json::Value = serde_json::from_slice(blob).map_err(|e| {
                SchemaError::InvalidPayload {
                    schema: schema_id.clone(),
                    reason: format!("payload is not valid json: {e}"),
                }
            })?;
            self.run(schema_id, &schema, &instance)
        }
    }

    fn run(
        &self,
        schema_id: &SchemaId,
        schema: &CompiledSchema,
        instance: &serde_json::Value,
    ) -> Result<(), SchemaError> {
        schema.compiled.validate(instance).map_err(|errors| {
            let reason = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            SchemaError::InvalidPayload {
                schema: schema_id.clone(),
                reason,
            }
        })
    }

    fn resolve(&self, schema_id: &SchemaId) -> Result<Arc<CompiledSchema>, SchemaError> {
        if let Some(entry) = self.cache.get(schema_id) {
            return Ok(entry.clone());
        }

        let (name, version) = split_schema_id(schema_id);
        let file_name = format!("{name}.v{version}.json");
        let path = self.schema_dir.join(&file_name);

        let compiled = Self::load_and_compile(&path).map_err(|e| {
            warn!(schema = %schema_id, path = %path.display(), error = %e, "failed to load schema document");
            SchemaError::UnknownSchema(schema_id.clone())
        })?;

        let entry = Arc::new(compiled);
        self.cache.insert(schema_id.clone(), entry.clone());
        debug!(schema = %schema_id, path = %path.display(), "schema loaded and cached");
        Ok(entry)
    }

    fn load_and_compile(path: &Path) -> anyhow::Result<CompiledSchema> {
        let text = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;

        let payload_is_utf8 = doc
            .get("payload_encoding")
            .and_then(|v| v.as_str())
            .map(|v| v == "utf-8")
            .unwrap_or(false);

        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&doc)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(CompiledSchema {
            compiled,
            payload_is_utf8,
        })
    }
}

/// Split a schema id into `(name, version)`, defaulting the version to `1`
/// if the `@VERSION` suffix is absent.
fn split_schema_id(schema_id: &SchemaId) -> (&str, &str) {
    match schema_id.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, version),
        Some((name, _)) => (name, "1"),
        None => (schema_id.as_str(), "1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_schema(dir: &Path, file_name: &str, contents: &str) {
        fs::write(dir.join(file_name), contents).unwrap();
    }

    #[test]
    fn split_schema_id_defaults_version() {
        assert_eq!(split_schema_id(&"FOO@2".to_string()), ("FOO", "2"));
        assert_eq!(split_schema_id(&"FOO".to_string()), ("FOO", "1"));
    }

    #[test]
    fn unknown_schema_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::new(dir.path());
        let err = registry.validate(&"NOPE@1".to_string(), &b"x".to_vec()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownSchema(_)));
    }

    #[test]
    fn accepts_any_json_object() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path(), "ANY.v1.json", r#"{"type": "object"}"#);
        let registry = SchemaRegistry::new(dir.path());

        registry.validate(&"ANY@1".to_string(), &br#"{"a": 1}"#.to_vec()).unwrap();
        let err = registry.validate(&"ANY@1".to_string(), &b"not json".to_vec()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPayload { .. }));
    }

    #[test]
    fn utf8_payload_encoding_decodes_before_validating() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(
            dir.path(),
            "TEXT.v1.json",
            r#"{"type": "string", "payload_encoding": "utf-8"}"#,
        );
        let registry = SchemaRegistry::new(dir.path());

        registry
            .validate(&"TEXT@1".to_string(), &b"hello".to_vec())
            .unwrap();
    }

    #[test]
    fn schema_is_cached_after_first_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path(), "CACHED.v1.json", r#"{"type": "object"}"#);
        let registry = SchemaRegistry::new(dir.path());

        registry
            .validate(&"CACHED@1".to_string(), &br#"{}"#.to_vec())
            .unwrap();

        // Remove the backing file; cached validator should still be used.
        fs::remove_file(dir.path().join("CACHED.v1.json")).unwrap();
        registry
            .validate(&"CACHED@1".to_string(), &br#"{}"#.to_vec())
            .unwrap();
    }
}
