// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolves a `{file, schema}` reference inside a schemas-base directory
//! into a fully dereferenced JSON Schema suitable for a structured-output
//! request: `$ref`s are inlined, `allOf` is merged, and every object schema
//! ends with `additionalProperties: false` unless explicitly overridden.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Maximum `$ref` recursion depth before `resolve` gives up.
pub const MAX_REF_DEPTH: usize = 50;

/// A schema reference could not be resolved.
#[derive(Debug, Error, Clone)]
pub enum SchemaPointerError {
    /// A pointer segment, or bare name, did not resolve inside its file.
    #[error("could not resolve '{pointer}' in schema file '{file}'")]
    NotFound { pointer: String, file: String },

    /// `$ref` recursion exceeded [`MAX_REF_DEPTH`].
    #[error("schema $ref depth exceeded {MAX_REF_DEPTH} while resolving '{pointer}' in '{file}'")]
    DepthExceeded { pointer: String, file: String },

    /// The schema file could not be read from disk.
    #[error("failed to read schema file '{file}': {message}")]
    Io { file: String, message: String },

    /// The schema file was not valid JSON.
    #[error("failed to parse schema file '{file}': {message}")]
    Parse { file: String, message: String },
}

/// Resolves and caches JSON Schema documents under a single base directory.
pub struct SchemaResolver {
    base_dir: PathBuf,
    file_cache: DashMap<PathBuf, Value>,
}

impl SchemaResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            file_cache: DashMap::new(),
        }
    }

    /// Resolves `schema_name` inside `file` into a fully dereferenced schema.
    pub fn resolve(&self, file: &str, schema_name: &str) -> Result<Value, SchemaPointerError> {
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let root = self.lookup(file, schema_name, &mut visited)?;
        let resolved = self.resolve_value(root, file, &mut visited, 0)?;
        Ok(close_additional_properties(resolved))
    }

    fn load_file(&self, file: &str) -> Result<Value, SchemaPointerError> {
        let path = self.base_dir.join(file);
        if let Some(cached) = self.file_cache.get(&path) {
            return Ok(cached.clone());
        }

        let content = std::fs::read_to_string(&path).map_err(|err| SchemaPointerError::Io {
            file: file.to_string(),
            message: err.to_string(),
        })?;

        let parsed: Value = serde_json::from_str(&content).map_err(|err| SchemaPointerError::Parse {
            file: file.to_string(),
            message: err.to_string(),
        })?;

        self.file_cache.insert(path, parsed.clone());
        Ok(parsed)
    }

    /// Looks up `name` (a JSON Pointer or a bare name) inside `file`'s
    /// document: `definitions`, then `$defs`, then the top-level map.
    fn lookup(
        &self,
        file: &str,
        name: &str,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<Value, SchemaPointerError> {
        let doc = self.load_file(file)?;
        let stripped = name.trim_start_matches('#');

        if let Some(pointer) = stripped.strip_prefix('/') {
            return self.lookup_pointer(&doc, pointer, file, name);
        }
        if stripped.is_empty() {
            return Ok(doc);
        }

        let _ = visited;
        for section in ["definitions", "$defs"] {
            if let Some(found) = doc.get(section).and_then(|m| m.get(stripped)) {
                return Ok(found.clone());
            }
        }
        if let Some(found) = doc.get(stripped) {
            return Ok(found.clone());
        }

        Err(SchemaPointerError::NotFound {
            pointer: name.to_string(),
            file: file.to_string(),
        })
    }

    fn lookup_pointer(
        &self,
        doc: &Value,
        pointer: &str,
        file: &str,
        original: &str,
    ) -> Result<Value, SchemaPointerError> {
        let mut current = doc;
        for segment in pointer.split('/') {
            let unescaped = segment.replace("~1", "/").replace("~0", "~");
            current = current
                .get(&unescaped)
                .ok_or_else(|| SchemaPointerError::NotFound {
                    pointer: original.to_string(),
                    file: file.to_string(),
                })?;
        }
        Ok(current.clone())
    }

    /// Splits a `$ref` string into an optional external file and a pointer
    /// or bare name, and resolves the file relative to `current_file`'s
    /// directory.
    fn parse_ref<'a>(&self, current_file: &str, raw_ref: &'a str) -> (String, &'a str) {
        match raw_ref.split_once('#') {
            Some((file_part, pointer_part)) if !file_part.is_empty() => {
                let resolved_file = join_relative(current_file, file_part);
                (resolved_file, pointer_part)
            }
            Some((_, pointer_part)) => (current_file.to_string(), pointer_part),
            None => (current_file.to_string(), raw_ref),
        }
    }

    fn resolve_value(
        &self,
        value: Value,
        current_file: &str,
        visited: &mut HashSet<(String, String)>,
        depth: usize,
    ) -> Result<Value, SchemaPointerError> {
        if depth > MAX_REF_DEPTH {
            return Err(SchemaPointerError::DepthExceeded {
                pointer: "<nested>".to_string(),
                file: current_file.to_string(),
            });
        }

        match value {
            Value::Object(map) => self.resolve_object(map, current_file, visited, depth),
            Value::Array(items) => {
                let resolved = items
                    .into_iter()
                    .map(|item| self.resolve_value(item, current_file, visited, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(resolved))
            }
            other => Ok(other),
        }
    }

    fn resolve_object(
        &self,
        mut map: Map<String, Value>,
        current_file: &str,
        visited: &mut HashSet<(String, String)>,
        depth: usize,
    ) -> Result<Value, SchemaPointerError> {
        if let Some(Value::String(raw_ref)) = map.remove("$ref") {
            let (target_file, pointer) = self.parse_ref(current_file, &raw_ref);
            let key = (target_file.clone(), pointer.to_string());

            if visited.contains(&key) {
                debug!(file = %target_file, pointer, "breaking cyclic $ref");
                return Ok(Value::Object(Map::new()));
            }
            visited.insert(key);

            let target = self.lookup(&target_file, pointer, visited)?;
            return self.resolve_value(target, &target_file, visited, depth + 1);
        }

        if let Some(Value::Array(subschemas)) = map.remove("allOf") {
            let resolved_subschemas = subschemas
                .into_iter()
                .map(|item| self.resolve_value(item, current_file, visited, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;

            let mut merged = Map::new();
            for (key, value) in map {
                merged.insert(key, self.resolve_value(value, current_file, visited, depth + 1)?);
            }
            merged = merge_all_of(merged, resolved_subschemas);
            return Ok(Value::Object(merged));
        }

        let mut resolved = Map::new();
        for (key, value) in map {
            resolved.insert(key, self.resolve_value(value, current_file, visited, depth + 1)?);
        }
        Ok(Value::Object(resolved))
    }
}

/// Merges a list of already-resolved `allOf` subschemas into `parent`.
/// `required` is unioned, `properties` shallow-merged, other keys favor
/// whichever writer (parent, then subschemas in order) set them first.
fn merge_all_of(mut parent: Map<String, Value>, subschemas: Vec<Value>) -> Map<String, Value> {
    for subschema in subschemas {
        let Value::Object(sub_map) = subschema else {
            continue;
        };

        for (key, value) in sub_map {
            match key.as_str() {
                "required" => {
                    let entry = parent
                        .entry("required".to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let (Value::Array(existing), Value::Array(incoming)) = (entry.clone(), &value) {
                        let mut merged = existing;
                        for item in incoming {
                            if !merged.contains(item) {
                                merged.push(item.clone());
                            }
                        }
                        *entry = Value::Array(merged);
                    }
                }
                "properties" => {
                    let entry = parent
                        .entry("properties".to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let (Value::Object(existing), Value::Object(incoming)) = (entry, value) {
                        for (prop_key, prop_value) in incoming {
                            existing.entry(prop_key).or_insert(prop_value);
                        }
                    }
                }
                _ => {
                    parent.entry(key).or_insert(value);
                }
            }
        }
    }
    parent
}

/// Recursively injects `additionalProperties: false` into every object
/// schema (`type: "object"` or any schema with a `properties` map) that
/// does not already set it explicitly.
fn close_additional_properties(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object")
                || map.contains_key("properties");

            if is_object_schema && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }

            let closed: Map<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, close_additional_properties(value)))
                .collect();
            Value::Object(closed)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(close_additional_properties).collect()),
        other => other,
    }
}

/// Joins a file-relative `$ref` target against the directory of
/// `current_file`.
fn join_relative(current_file: &str, target: &str) -> String {
    match Path::new(current_file).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(target).to_string_lossy().into_owned(),
        _ => target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile_stub::TempDir;

    /// Minimal drop-in for `tempfile` so this module has no extra
    /// dev-dependency: a self-cleaning temp directory under `std::env::temp_dir()`.
    mod tempfile_stub {
        use std::path::PathBuf;

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> std::io::Result<Self> {
                let dir = std::env::temp_dir().join(format!(
                    "stepflow-schema-test-{}-{}",
                    std::process::id(),
                    COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                ));
                std::fs::create_dir_all(&dir)?;
                Ok(Self(dir))
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }

        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn resolves_bare_name_from_definitions() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{
                "definitions": {
                    "Intent": {"type": "object", "properties": {"action": {"type": "string"}}}
                }
            }"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "Intent").unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn resolves_json_pointer_with_defs() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{
                "$defs": {
                    "Output": {"type": "object", "properties": {"x": {"type": "string"}}}
                }
            }"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "#/$defs/Output").unwrap();
        assert_eq!(schema["properties"]["x"]["type"], "string");
    }

    #[test]
    fn strips_malformed_leading_hashes() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{"$defs": {"Output": {"type": "object"}}}"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "##/$defs/Output").unwrap();
        assert_eq!(schema["type"], "object");
    }

    #[test]
    fn resolves_ref_within_same_file() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{
                "definitions": {
                    "Base": {"type": "object", "properties": {"id": {"type": "string"}}},
                    "Wrapper": {"allOf": [{"$ref": "#/definitions/Base"}, {"properties": {"extra": {"type": "number"}}, "required": ["extra"]}]}
                }
            }"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "Wrapper").unwrap();
        assert_eq!(schema["properties"]["id"]["type"], "string");
        assert_eq!(schema["properties"]["extra"]["type"], "number");
        assert_eq!(schema["required"], serde_json::json!(["extra"]));
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn breaks_cycles_with_empty_object() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{
                "definitions": {
                    "A": {"type": "object", "properties": {"next": {"$ref": "#/definitions/B"}}},
                    "B": {"type": "object", "properties": {"next": {"$ref": "#/definitions/A"}}}
                }
            }"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "A").unwrap();
        // The cycle back to A resolves to an empty object rather than looping.
        assert!(schema["properties"]["next"]["properties"]["next"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn missing_pointer_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "steps.json", r#"{"definitions": {}}"#);

        let resolver = SchemaResolver::new(dir.path());
        let err = resolver.resolve("steps.json", "Missing").unwrap_err();
        assert!(matches!(err, SchemaPointerError::NotFound { .. }));
    }

    #[test]
    fn preserves_explicit_additional_properties() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{"definitions": {"Open": {"type": "object", "properties": {}, "additionalProperties": true}}}"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let schema = resolver.resolve("steps.json", "Open").unwrap();
        assert_eq!(schema["additionalProperties"], true);
    }

    #[test]
    fn resolve_is_idempotent_modulo_identity() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "steps.json",
            r#"{"definitions": {"Intent": {"type": "object", "properties": {"action": {"type": "string"}}}}}"#,
        );

        let resolver = SchemaResolver::new(dir.path());
        let first = resolver.resolve("steps.json", "Intent").unwrap();
        let second = resolver.resolve("steps.json", "Intent").unwrap();
        assert_eq!(first, second);
    }
}
