//! # Schema registry.
//!
//! Maps `(type, version)` to a validator. The validator decodes the payload
//! into its typed model; decoding rejects unknown fields, missing fields and
//! wrong types, so "valid" means "exactly the registered shape".
//!
//! ## Rules
//! - A registered `(type, version)` is immutable: registering it again fails.
//! - The *current* version of a type is the highest registered one; the
//!   dispatcher stamps it on every envelope of that type.
//! - Unknown types and unknown versions are rejected, never passed through.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SchemaError;

use super::payloads::*;

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Versioned payload validators keyed by `(type, version)`.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: HashMap<(String, u32), Validator>,
    current: HashMap<String, u32>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in payload registered.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register_builtin();
        r
    }

    fn register_builtin(&mut self) {
        // Builtins are distinct by construction; a duplicate here is a bug.
        let results = [
            self.register::<RunQueuedV1>(),
            self.register::<BuildStartedV1>(),
            self.register::<BuildPhaseStartedV1>(),
            self.register::<BuildPhaseCompletedV1>(),
            self.register::<BuildCompletedV1>(),
            self.register::<ConsoleLineV1>(),
            self.register::<RunStartedV1>(),
            self.register::<RunWarningV1>(),
            self.register::<EnginePhaseStartedV1>(),
            self.register::<EnginePhaseCompletedV1>(),
            self.register::<EngineFieldsDeclaredV1>(),
            self.register::<EngineTableSummarizedV1>(),
            self.register::<EngineSheetCompletedV1>(),
            self.register::<EngineWorkbookCompletedV1>(),
            self.register::<RunCompletedV1>(),
        ];
        debug_assert!(results.iter().all(Result::is_ok));
    }

    /// Registers a typed payload under its `(TYPE, VERSION)`.
    pub fn register<P: EventPayload>(&mut self) -> Result<(), SchemaError> {
        let key = (P::TYPE.to_owned(), P::VERSION);
        if self.validators.contains_key(&key) {
            return Err(SchemaError::AlreadyRegistered {
                event_type: P::TYPE.to_owned(),
                version: P::VERSION,
            });
        }

        let validator: Validator =
            Arc::new(|v: &Value| P::deserialize(v).map(|_| ()).map_err(|e| e.to_string()));
        self.validators.insert(key, validator);

        let cur = self.current.entry(P::TYPE.to_owned()).or_insert(P::VERSION);
        *cur = (*cur).max(P::VERSION);
        Ok(())
    }

    /// Validates a payload against `(event_type, version)` and hands it back.
    pub fn validate(
        &self,
        event_type: &str,
        version: u32,
        payload: Value,
    ) -> Result<Value, SchemaError> {
        let Some(validator) = self.validators.get(&(event_type.to_owned(), version)) else {
            return Err(if self.current.contains_key(event_type) {
                SchemaError::UnknownVersion {
                    event_type: event_type.to_owned(),
                    version,
                }
            } else {
                SchemaError::UnknownType {
                    event_type: event_type.to_owned(),
                }
            });
        };

        validator(&payload).map_err(|reason| SchemaError::InvalidPayload {
            event_type: event_type.to_owned(),
            version,
            reason,
        })?;
        Ok(payload)
    }

    /// Highest registered version of a type.
    pub fn current_version(&self, event_type: &str) -> Result<u32, SchemaError> {
        self.current
            .get(event_type)
            .copied()
            .ok_or_else(|| SchemaError::UnknownType {
                event_type: event_type.to_owned(),
            })
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut t: Vec<&str> = self.current.keys().map(String::as_str).collect();
        t.sort_unstable();
        t
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("types", &self.types())
            .finish()
    }
}
