use std::collections::BTreeMap;

use crate::DiceError;

/// Minimal string key-value capability the run ledger persists through.
pub trait KeyValueStore {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`DiceError::Storage`] when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, DiceError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns [`DiceError::Storage`] when the backend rejects the write.
    fn set(&mut self, key: &str, value: &str) -> Result<(), DiceError>;

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    /// Returns [`DiceError::Storage`] when the backend rejects the delete.
    fn remove(&mut self, key: &str) -> Result<(), DiceError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &mut T {
    fn get(&self, key: &str) -> Result<Option<String>, DiceError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DiceError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), DiceError> {
        (**self).remove(key)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, DiceError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DiceError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), DiceError> {
        (**self).remove(key)
    }
}

/// Process-local store. Contents vanish with the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, DiceError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DiceError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), DiceError> {
        self.values.remove(key);
        Ok(())
    }
}
