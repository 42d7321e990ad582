//! Typed per-connection user data.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

// ============================================================================
// TypedKey
// ============================================================================

/// Key of a value stored in [`UserData`].
///
/// The value type is part of the key, so a lookup with the wrong type
/// finds nothing.
///
/// ```
/// use wsnext::connection::{TypedKey, UserData};
///
/// const NICKNAME: TypedKey<String> = TypedKey::new("nickname");
///
/// let data = UserData::default();
/// data.put(&NICKNAME, "ann".to_string());
/// assert_eq!(data.get(&NICKNAME).as_deref(), Some("ann"));
/// ```
pub struct TypedKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    /// Creates a key.
    #[inline]
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key name.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for TypedKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedKey<T> {}

impl<T> fmt::Debug for TypedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedKey").field(&self.name).finish()
    }
}

// ============================================================================
// UserData
// ============================================================================

type Value = Box<dyn Any + Send + Sync>;

/// Mutable key-value store attached to a connection.
#[derive(Default)]
pub struct UserData {
    values: Mutex<FxHashMap<&'static str, Value>>,
}

impl UserData {
    /// Stores a value, returning the previous one of the same type.
    pub fn put<T: Send + Sync + 'static>(&self, key: &TypedKey<T>, value: T) -> Option<T> {
        self.values
            .lock()
            .insert(key.name, Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    /// Returns a copy of the value.
    #[must_use]
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &TypedKey<T>) -> Option<T> {
        self.values
            .lock()
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` with a reference to the value.
    pub fn with<T: Send + Sync + 'static, R>(
        &self,
        key: &TypedKey<T>,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        self.values
            .lock()
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
            .map(f)
    }

    /// Removes the value.
    ///
    /// A value stored under the same name with another type is left in place.
    pub fn remove<T: Send + Sync + 'static>(&self, key: &TypedKey<T>) -> Option<T> {
        let mut values = self.values.lock();
        if !values.get(key.name)?.is::<T>() {
            return None;
        }
        values
            .remove(key.name)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Returns `true` if a value of the key's type is present.
    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self, key: &TypedKey<T>) -> bool {
        self.values
            .lock()
            .get(key.name)
            .is_some_and(|value| value.is::<T>())
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Removes all values.
    pub fn clear(&self) {
        self.values.lock().clear();
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.lock();
        f.debug_set().entries(values.keys()).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const COUNT: TypedKey<u32> = TypedKey::new("count");
    const COUNT_AS_STRING: TypedKey<String> = TypedKey::new("count");

    #[test]
    fn test_put_get_replace() {
        let data = UserData::default();
        assert_eq!(data.put(&COUNT, 1), None);
        assert_eq!(data.put(&COUNT, 2), Some(1));
        assert_eq!(data.get(&COUNT), Some(2));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_wrong_type_finds_nothing() {
        let data = UserData::default();
        data.put(&COUNT, 7);
        assert_eq!(data.get(&COUNT_AS_STRING), None);
        assert!(!data.contains(&COUNT_AS_STRING));
        assert_eq!(data.remove(&COUNT_AS_STRING), None);
        assert!(data.contains(&COUNT));
    }

    #[test]
    fn test_remove_and_clear() {
        let data = UserData::default();
        data.put(&COUNT, 3);
        assert_eq!(data.remove(&COUNT), Some(3));
        assert!(data.is_empty());

        data.put(&COUNT, 4);
        data.clear();
        assert!(data.is_empty());
    }

    #[test]
    fn test_with_borrows() {
        let data = UserData::default();
        data.put(&COUNT_AS_STRING, "abc".to_string());
        assert_eq!(data.with(&COUNT_AS_STRING, String::len), Some(3));
    }
}
