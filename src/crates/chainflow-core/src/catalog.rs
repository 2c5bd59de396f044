//! Protocol action catalog
//!
//! Protocols and their actions live in an arena keyed by `(protocol,
//! action)`; plan nodes link to them through [`NodeSource`] ids only. The
//! calculated-field solver pulls a node's [`ActionDef`] from here to learn
//! its derived fields and required queries.

use crate::plan::NodeSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A derived field: a CEL expression plus the inputs it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculatedField {
    /// CEL expression producing the field value.
    pub expr: String,
    /// Input paths; only `calculated.`-prefixed entries order computation.
    #[serde(default)]
    pub inputs: Vec<String>,
}

/// An action definition, as far as the engine core needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    /// Derived fields in declaration order.
    #[serde(default)]
    pub calculated_fields: Vec<(String, CalculatedField)>,
    /// Query ids that must be present in `runtime.query` before solving.
    #[serde(default)]
    pub requires_queries: Vec<String>,
    /// Risk classification for policy gating.
    #[serde(default)]
    pub risk_level: crate::policy::RiskLevel,
    /// Risk tags for policy gating.
    #[serde(default)]
    pub risk_tags: Vec<String>,
}

/// Arena of action definitions keyed by `(protocol, action)`.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: BTreeMap<(String, String), ActionDef>,
}

impl ActionCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action definition.
    pub fn insert(
        &mut self,
        protocol: impl Into<String>,
        action: impl Into<String>,
        def: ActionDef,
    ) {
        self.actions.insert((protocol.into(), action.into()), def);
    }

    /// Look up by ids.
    pub fn get(&self, protocol: &str, action: &str) -> Option<&ActionDef> {
        self.actions.get(&(protocol.to_string(), action.to_string()))
    }

    /// Look up the action a plan node was expanded from.
    pub fn for_source(&self, source: Option<&NodeSource>) -> Option<&ActionDef> {
        let source = source?;
        let action = source.action.as_deref()?;
        self.get(&source.protocol, action)
    }
}
