//! # Schema
//!
//! Attribute declarations: value type, cardinality, uniqueness and index
//! membership. The schema travels with every snapshot and is persisted as
//! the versioned schema record.

use crate::primitives::MAX_ATTRIBUTE_LENGTH;
use crate::{Attribute, Datom, TesseraError, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many values an entity may hold for one attribute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

/// Uniqueness constraint on an attribute's values across entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unique {
    /// Unique, and a tempid asserting an existing value resolves to its entity.
    Identity,
    /// Unique; a second entity asserting the value is rejected.
    Value,
}

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub value_type: ValueType,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub unique: Option<Unique>,
    #[serde(default)]
    pub indexed: bool,
}

impl AttributeSpec {
    /// A cardinality-one attribute of the given type.
    #[must_use]
    pub fn one(value_type: ValueType) -> Self {
        Self {
            value_type,
            cardinality: Cardinality::One,
            unique: None,
            indexed: false,
        }
    }

    /// A cardinality-many attribute of the given type.
    #[must_use]
    pub fn many(value_type: ValueType) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::one(value_type)
        }
    }

    /// Mark the attribute unique.
    #[must_use]
    pub fn unique(mut self, unique: Unique) -> Self {
        self.unique = Some(unique);
        self
    }

    /// Include the attribute in the AVET index.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Unique attributes always live in AVET.
    #[must_use]
    pub fn in_avet(&self) -> bool {
        self.indexed || self.unique.is_some()
    }

    #[must_use]
    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}

/// Attribute declarations keyed by attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    attributes: BTreeMap<Attribute, AttributeSpec>,
}

impl Schema {
    /// An empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration.
    #[must_use]
    pub fn with(mut self, attribute: impl Into<Attribute>, spec: AttributeSpec) -> Self {
        self.attributes.insert(attribute.into(), spec);
        self
    }

    /// Declare or replace an attribute.
    pub fn insert(&mut self, attribute: Attribute, spec: AttributeSpec) {
        self.attributes.insert(attribute, spec);
    }

    #[must_use]
    pub fn get(&self, attribute: &Attribute) -> Option<&AttributeSpec> {
        self.attributes.get(attribute)
    }

    #[must_use]
    pub fn contains(&self, attribute: &Attribute) -> bool {
        self.attributes.contains_key(attribute)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Attribute, &AttributeSpec)> {
        self.attributes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Whether datoms of this attribute belong in AVET.
    #[must_use]
    pub fn in_avet(&self, attribute: &Attribute) -> bool {
        self.get(attribute).is_some_and(AttributeSpec::in_avet)
    }

    /// Check that every attribute identifier is well-formed.
    pub fn validate(&self) -> Result<(), TesseraError> {
        for attribute in self.attributes.keys() {
            let raw = attribute.as_str();
            if raw.is_empty() || raw.len() > MAX_ATTRIBUTE_LENGTH {
                return Err(TesseraError::InvalidOperation(format!(
                    "attribute identifier '{raw}' must be 1..={MAX_ATTRIBUTE_LENGTH} bytes"
                )));
            }
            if raw.starts_with('/') || raw.ends_with('/') {
                return Err(TesseraError::InvalidOperation(format!(
                    "attribute identifier '{raw}' has an empty namespace or name"
                )));
            }
        }
        Ok(())
    }

    /// Add every attribute of `other` that this schema lacks.
    ///
    /// Returns the number of attributes added. An attribute declared in both
    /// with different specs is rejected: redefining an attribute that may
    /// already hold data is not supported.
    pub fn extend_from(&mut self, other: &Schema) -> Result<usize, TesseraError> {
        let mut added = 0;
        for (attribute, spec) in other.iter() {
            match self.attributes.get(attribute) {
                Some(existing) if existing != spec => {
                    return Err(TesseraError::InvalidOperation(format!(
                        "attribute {attribute} is already declared with a different definition"
                    )));
                }
                Some(_) => {}
                None => {
                    self.attributes.insert(attribute.clone(), spec.clone());
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// A permissive schema covering every attribute seen in `datoms`.
    ///
    /// Used by recovery when the schema record itself is unreadable: every
    /// attribute becomes cardinality-many with no uniqueness so no recovered
    /// datom is rejected.
    #[must_use]
    pub fn infer<'a>(datoms: impl IntoIterator<Item = &'a Datom>) -> Self {
        let mut schema = Self::new();
        for datom in datoms {
            if !schema.contains(&datom.a) {
                schema.insert(datom.a.clone(), AttributeSpec::many(ValueType::Any));
            }
        }
        schema
    }
}

/// The persisted, versioned form of the schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaRecord {
    /// Layout/schema version, advanced only by the migration engine.
    pub version: u32,
    pub schema: Schema,
}

impl SchemaRecord {
    #[must_use]
    pub fn new(version: u32, schema: Schema) -> Self {
        Self { version, schema }
    }
}

// =============================================================================
// TESTS
// =============================================================================
