//! Requester name lookup

use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("No name registered for {0}")]
    NotFound(String),

    #[error("Name backend unavailable: {0}")]
    Backend(String),
}

/// Resolves a requester id to the name printed on the label
pub trait NameLookup: Send + Sync {
    /// Display name of `user_id`
    fn lookup(&self, user_id: &str) -> Result<String, LookupError>;
}

/// In-memory names, loaded from the service config
#[derive(Debug, Clone, Default)]
pub struct MapLookup {
    names: HashMap<String, String>,
}

impl MapLookup {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

impl NameLookup for MapLookup {
    fn lookup(&self, user_id: &str) -> Result<String, LookupError> {
        self.names
            .get(user_id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(user_id.to_string()))
    }
}

/// Never fails: a failed lookup yields the placeholder
pub struct FallbackLookup {
    inner: Box<dyn NameLookup>,
    placeholder: String,
}

impl FallbackLookup {
    pub fn new(inner: Box<dyn NameLookup>, placeholder: impl Into<String>) -> Self {
        Self {
            inner,
            placeholder: placeholder.into(),
        }
    }

    /// Name of `user_id`, or the placeholder
    pub fn name_for(&self, user_id: &str) -> String {
        match self.inner.lookup(user_id) {
            Ok(name) => name,
            Err(e) => {
                warn!("Name lookup failed, using placeholder: {}", e);
                self.placeholder.clone()
            }
        }
    }
}

impl NameLookup for FallbackLookup {
    fn lookup(&self, user_id: &str) -> Result<String, LookupError> {
        Ok(self.name_for(user_id))
    }
}
