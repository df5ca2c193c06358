// ==============================================================================
// resolver.rs - Study Identifier Resolution
// ==============================================================================
// Description: Maps numeric study ids to study names, cached per codec instance
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-10-06
// Version: 1.0.0
// ==============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Resolver failures never reach callers; the numeric id is used instead
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Study catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Study lookup failed for {study_id}: {details}")]
    LookupFailed { study_id: i32, details: String },
}

/// Catalog lookup consumed by the codec
pub trait StudyResolver: Send + Sync {
    fn resolve_study_name(&self, study_id: i32) -> Result<Option<String>, ResolutionError>;
}

/// Fixed id -> name table
#[derive(Debug, Clone, Default)]
pub struct StaticStudyResolver {
    names: HashMap<i32, String>,
}

impl StaticStudyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_study(mut self, study_id: i32, name: impl Into<String>) -> Self {
        self.names.insert(study_id, name.into());
        self
    }
}

impl StudyResolver for StaticStudyResolver {
    fn resolve_study_name(&self, study_id: i32) -> Result<Option<String>, ResolutionError> {
        Ok(self.names.get(&study_id).cloned())
    }
}

/// Lazily populated study name cache, never invalidated during a run
pub struct StudyNameCache {
    resolver: Arc<dyn StudyResolver>,
    names: HashMap<i32, String>,
}

impl StudyNameCache {
    pub fn new(resolver: Arc<dyn StudyResolver>) -> Self {
        Self {
            resolver,
            names: HashMap::new(),
        }
    }

    /// Study name for `study_id`; the resolver is asked at most once per id
    pub fn resolve(&mut self, study_id: i32) -> &str {
        let resolver = &self.resolver;
        self.names.entry(study_id).or_insert_with(|| {
            match resolver.resolve_study_name(study_id) {
                Ok(Some(name)) => name,
                Ok(None) => study_id.to_string(),
                Err(e) => {
                    debug!("Falling back to numeric study id {}: {}", study_id, e);
                    study_id.to_string()
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
