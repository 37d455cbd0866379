//! # Query Patterns
//!
//! A pattern binds any subset of entity, attribute and value. Reads pick the
//! index whose sort order turns the bound components into the longest
//! contiguous prefix, then filter the remaining bound components.

use crate::index::IndexOrder;
use crate::schema::Schema;
use crate::{Attribute, Datom, EntityId, Value};
use serde::{Deserialize, Serialize};

/// Datom filter with optional entity, attribute and value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Pattern {
    /// Matches every datom.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Every datom of one entity.
    #[must_use]
    pub fn entity(entity: EntityId) -> Self {
        Self {
            entity: Some(entity),
            ..Self::default()
        }
    }

    /// Every datom of one attribute.
    #[must_use]
    pub fn attribute(attribute: impl Into<Attribute>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<Attribute>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Whether every bound component equals the datom's.
    #[must_use]
    pub fn matches(&self, datom: &Datom) -> bool {
        self.entity.is_none_or(|e| datom.e == e)
            && self.attribute.as_ref().is_none_or(|a| &datom.a == a)
            && self.value.as_ref().is_none_or(|v| &datom.v == v)
    }

    /// The index to scan for this pattern.
    ///
    /// - entity bound: EAVT
    /// - attribute and value bound, attribute in AVET: AVET
    /// - attribute bound: AEVT
    /// - otherwise a full EAVT scan
    #[must_use]
    pub fn choose_index(&self, schema: &Schema) -> IndexOrder {
        match (&self.entity, &self.attribute, &self.value) {
            (Some(_), _, _) => IndexOrder::Eavt,
            (None, Some(a), Some(_)) if schema.in_avet(a) => IndexOrder::Avet,
            (None, Some(_), _) => IndexOrder::Aevt,
            (None, None, _) => IndexOrder::Eavt,
        }
    }
}
