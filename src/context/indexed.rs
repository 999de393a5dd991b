//! Container types with strongly-typed indexes
use std::collections::HashMap;

/// Stores a set of `(Value, Index)` tuples, with lookup in both directions.
///
/// Implemented using a `Vec<Value>` and a `HashMap<Value, Index>`.
///
/// The `Index` type should be a wrapper around a `usize` and be convertible
/// in both directions; it is typically passed around using `Copy`.  A
/// suitable index type can be constructed with [`define_index`].
#[derive(Debug)]
pub struct IndexMap<Value, Index> {
    data: Vec<Value>,
    map: HashMap<Value, Index>,
}

impl<Value, Index> Default for IndexMap<Value, Index> {
    fn default() -> Self {
        Self {
            data: vec![],
            map: HashMap::new(),
        }
    }
}

impl<Value, Index> IndexMap<Value, Index>
where
    Value: Eq + std::hash::Hash + Clone,
    Index: Eq + std::hash::Hash + Copy + From<usize>,
    usize: From<Index>,
{
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn get_by_index(&self, v: Index) -> Option<&Value> {
        self.data.get(usize::from(v))
    }
    /// Insert the given value into the map, returning a handle.
    ///
    /// If the value is already in the map, the handle will be to the
    /// existing instance (so it will not be inserted twice).
    pub fn insert(&mut self, v: Value) -> Index {
        *self.map.entry(v.clone()).or_insert_with(|| {
            let out = Index::from(self.data.len());
            self.data.push(v);
            out
        })
    }
    pub fn clear(&mut self) {
        self.data.clear();
        self.map.clear();
    }
}

/// Defines an index type suitable for use in an [`IndexMap`]
macro_rules! define_index {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(usize);
        impl $name {
            /// Returns the inner index value
            pub fn get(self) -> usize {
                self.0
            }
        }
        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                Self(v)
            }
        }
        impl From<$name> for usize {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}
pub(crate) use define_index;

#[cfg(test)]
mod test {
    use super::*;

    define_index!(TestIndex, "An index for testing purposes");

    #[test]
    fn test_index_map_dedup() {
        let mut m: IndexMap<u32, TestIndex> = IndexMap::default();
        let a = m.insert(123);
        let b = m.insert(456);
        let c = m.insert(123);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_by_index(a), Some(&123));
    }

    #[test]
    fn test_index_map_clear() {
        let mut m: IndexMap<u32, TestIndex> = IndexMap::default();
        m.insert(1);
        m.insert(2);
        assert!(!m.is_empty());
        m.clear();
        assert!(m.is_empty());
        let i = m.insert(2);
        assert_eq!(usize::from(i), 0);
    }
}
