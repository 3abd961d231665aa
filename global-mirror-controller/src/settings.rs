use std::collections::HashSet;
use std::time::Duration;

use kube::core::{Expression, Selector};

use crate::{Error, Result};

/// Runtime configuration for the mirror engine.
#[derive(Clone, Debug)]
pub struct MirrorSettings {
    /// Namespace that receives every mirrored object.
    pub global_namespace: String,
    /// Label selector applied to both watched source kinds.
    pub selector: Selector,
    /// Namespaces eligible as mirror sources. `None` means all namespaces
    /// except the global namespace itself.
    pub source_namespaces: Option<HashSet<String>>,
    pub sync_timeout: Duration,
    pub gc_interval: Duration,
    pub gc_grace: Duration,
}

impl MirrorSettings {
    pub fn new(
        global_namespace: impl Into<String>,
        selector: &str,
        source_namespaces: &[String],
        sync_timeout: Duration,
        gc_interval: Duration,
        gc_grace: Duration,
    ) -> Result<Self> {
        let source_namespaces = if source_namespaces.is_empty() {
            None
        } else {
            Some(source_namespaces.iter().cloned().collect())
        };
        Ok(Self {
            global_namespace: global_namespace.into(),
            selector: parse_selector(selector)?,
            source_namespaces,
            sync_timeout,
            gc_interval,
            gc_grace,
        })
    }

    /// Whether objects from this namespace may be mirrored.
    pub(crate) fn namespace_allowed(&self, namespace: &str) -> bool {
        if namespace == self.global_namespace {
            return false;
        }
        match &self.source_namespaces {
            Some(namespaces) => namespaces.contains(namespace),
            None => true,
        }
    }
}

/// Parses a comma-separated list of `key=value`, `key!=value` and bare
/// `key` expressions into a selector.
pub(crate) fn parse_selector(expr: &str) -> Result<Selector> {
    let mut expressions = Vec::new();
    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::InvalidSelector(expr.into()));
        }
        let expression = if let Some((key, value)) = part.split_once("!=") {
            Expression::NotEqual(key.trim().into(), value.trim().into())
        } else if let Some((key, value)) = part.split_once('=') {
            Expression::Equal(key.trim().into(), value.trim_start_matches('=').trim().into())
        } else {
            Expression::Exists(part.into())
        };
        expressions.push(expression);
    }
    Ok(expressions.into_iter().collect())
}
