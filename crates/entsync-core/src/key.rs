//! Entity identities.

use crate::value::{Value, hash_values};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Persistent identity of an entity: its type name plus primary key values.
///
/// Used wherever a reference must outlive the instance it points to, e.g. the
/// previous value of a reference attribute inside recorded changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity: String,
    pub id: Vec<Value>,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }

    /// Single-column key.
    pub fn single(entity: impl Into<String>, id: impl Into<Value>) -> Self {
        Self::new(entity, vec![id.into()])
    }

    /// True when any key component is NULL (not yet assigned).
    pub fn is_incomplete(&self) -> bool {
        self.id.is_empty() || self.id.iter().any(Value::is_null)
    }

    pub fn is_composite(&self) -> bool {
        self.id.len() > 1
    }
}

// Floats inside keys compare by value but hash by bits; keys holding NaN are
// not expected.
impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        hash_values(&self.id).hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.entity)?;
        for (i, v) in self.id.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_equality_and_hash() {
        let a = EntityKey::single("Order", 1_i64);
        let b = EntityKey::single("Order", 1_i64);
        let c = EntityKey::single("Invoice", 1_i64);
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_incomplete() {
        assert!(EntityKey::new("Order", vec![Value::Null]).is_incomplete());
        assert!(EntityKey::new("Order", vec![]).is_incomplete());
        assert!(!EntityKey::single("Order", 5_i64).is_incomplete());
    }

    #[test]
    fn test_display() {
        let key = EntityKey::new("Line", vec![Value::BigInt(1), Value::Int(2)]);
        assert_eq!(key.to_string(), "Line[1, 2]");
        assert!(key.is_composite());
    }
}
