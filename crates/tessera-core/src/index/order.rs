use crate::query::Pattern;
use crate::Datom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sort order of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    /// Entity, attribute, value. Holds every datom.
    Eavt,
    /// Attribute, entity, value. Holds every datom.
    Aevt,
    /// Attribute, value, entity. Holds datoms of indexed or unique attributes.
    Avet,
}

impl IndexOrder {
    pub const ALL: [IndexOrder; 3] = [Self::Eavt, Self::Aevt, Self::Avet];

    /// Total order of two datoms. The transaction id is not part of identity.
    #[must_use]
    pub fn compare(self, x: &Datom, y: &Datom) -> Ordering {
        match self {
            Self::Eavt => x.e.cmp(&y.e).then_with(|| x.a.cmp(&y.a)).then_with(|| x.v.cmp(&y.v)),
            Self::Aevt => x.a.cmp(&y.a).then_with(|| x.e.cmp(&y.e)).then_with(|| x.v.cmp(&y.v)),
            Self::Avet => x.a.cmp(&y.a).then_with(|| x.v.cmp(&y.v)).then_with(|| x.e.cmp(&y.e)),
        }
    }

    /// Position of `datom` relative to the range selected by `pattern`.
    ///
    /// Components are compared in index order and comparison stops at the
    /// first component the pattern leaves unbound, so every datom inside the
    /// contiguous range compares `Equal`.
    #[must_use]
    pub fn compare_prefix(self, datom: &Datom, pattern: &Pattern) -> Ordering {
        let entity = pattern.entity.map(|e| datom.e.cmp(&e));
        let attribute = pattern.attribute.as_ref().map(|a| datom.a.cmp(a));
        let value = pattern.value.as_ref().map(|v| datom.v.cmp(v));

        let steps = match self {
            Self::Eavt => [entity, attribute, value],
            Self::Aevt => [attribute, entity, value],
            Self::Avet => [attribute, value, entity],
        };
        for step in steps {
            match step {
                None => return Ordering::Equal,
                Some(Ordering::Equal) => {}
                Some(other) => return other,
            }
        }
        Ordering::Equal
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Eavt => "eavt",
            Self::Aevt => "aevt",
            Self::Avet => "avet",
        }
    }
}

impl fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
