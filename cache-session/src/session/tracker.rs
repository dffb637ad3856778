//! Change tracking for session fields.
//!
//! A [`ChangeTracker`] keeps two maps: the live view of the record, and the
//! patch of fields written since the tracker was created. Together with the
//! [`LoadState`] they allow reads and writes to happen before the stored
//! record has been fetched: when it finally is, every field in the patch is
//! laid over the loaded values, so writes made before the load are never
//! clobbered by it.
//!
//! # Examples
//!
//! ```
//! use cache_session::session::tracker::{ChangeTracker, LoadState};
//! use serde_json::{Map, json};
//!
//! let mut tracker = ChangeTracker::new();
//! tracker.set("user", json!("alice"));
//!
//! let mut stored = Map::new();
//! stored.insert("user".to_string(), json!("bob"));
//! stored.insert("theme".to_string(), json!("dark"));
//! tracker.hydrate(stored);
//!
//! assert_eq!(tracker.state(), LoadState::Loaded);
//! assert_eq!(tracker.get("user"), Some(json!("alice")));
//! assert_eq!(tracker.get("theme"), Some(json!("dark")));
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use derive_more::with_trait::Debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::FieldMap;

/// Whether the stored record has been merged into the live view yet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// The stored record has not been fetched. The live view only holds
    /// fields written since the tracker was created.
    #[default]
    Unloaded,
    /// The stored record has been fetched and merged, or there is no stored
    /// record to fetch.
    Loaded,
}

/// A session field shared between the session and the caller.
///
/// Binding a field makes the session observe whatever value the caller last
/// put in the binding. The current value is copied into the session record
/// every time the session is written.
///
/// # Examples
///
/// ```
/// use cache_session::session::tracker::{Binding, ChangeTracker};
/// use serde_json::json;
///
/// let cart = Binding::new(&vec!["apple".to_string()])?;
/// let mut tracker = ChangeTracker::new();
/// tracker.bind("cart", &cart);
///
/// cart.set(&vec!["apple".to_string(), "pear".to_string()])?;
/// assert_eq!(tracker.get("cart"), Some(json!(["apple", "pear"])));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug)]
pub struct Binding<T> {
    cell: Arc<Mutex<Value>>,
    #[debug(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Binding<T> {
    /// Creates a binding holding `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn new(value: &T) -> serde_json::Result<Self> {
        Ok(Self {
            cell: Arc::new(Mutex::new(serde_json::to_value(value)?)),
            _marker: PhantomData,
        })
    }

    /// Returns the current value of the binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the held value cannot be deserialized as `T`.
    pub fn get(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.snapshot())
    }

    /// Replaces the value of the binding.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn set(&self, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }
}

impl<T> Binding<T> {
    fn snapshot(&self) -> Value {
        read_cell(&self.cell)
    }
}

fn read_cell(cell: &Mutex<Value>) -> Value {
    cell.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Tracks the live view of a session record and the fields changed in it.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    state: LoadState,
    fields: FieldMap,
    dirty: FieldMap,
    #[debug(skip)]
    bindings: BTreeMap<String, Arc<Mutex<Value>>>,
}

impl ChangeTracker {
    /// Creates a tracker for a record that exists in the store but has not
    /// been fetched yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker for a brand new record. There is nothing to fetch,
    /// so the tracker starts out loaded.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            state: LoadState::Loaded,
            ..Self::default()
        }
    }

    /// Returns whether the stored record has been merged in.
    #[must_use]
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Returns `true` if the stored record has been merged in.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    /// Returns `true` if any field was written since the tracker was created.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Returns the names of the fields written since the tracker was created.
    pub fn dirty_keys(&self) -> impl Iterator<Item = &str> {
        self.dirty.keys().map(String::as_str)
    }

    /// Returns the value of a field, or `None` if it is absent or null.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let value = match self.bindings.get(key) {
            Some(cell) => read_cell(cell),
            None => self.fields.get(key)?.clone(),
        };
        (!value.is_null()).then_some(value)
    }

    /// Returns the value of a field like [`get`](Self::get), then nulls the
    /// field so that later reads see it as absent.
    pub fn get_once(&mut self, key: &str) -> Option<Value> {
        let value = self.get(key);
        self.bindings.remove(key);
        self.fields.insert(key.to_string(), Value::Null);
        self.dirty.insert(key.to_string(), Value::Null);
        value
    }

    /// Sets a field and returns `true` if this changed the record.
    ///
    /// Setting a bound field ends the binding.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        let unbound = self.bindings.remove(&key).is_some();
        unbound | self.assign(key, value)
    }

    /// Nulls every given field. Returns `true` if this changed the record.
    pub fn delete<I, K>(&mut self, keys: I) -> bool
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        keys.into_iter()
            .fold(false, |changed, key| self.set(key, Value::Null) | changed)
    }

    /// Binds a field to a shared cell. The field is written with the current
    /// value of the binding right away, and again on every
    /// [`flush_bindings`](Self::flush_bindings).
    pub fn bind<T>(&mut self, key: impl Into<String>, binding: &Binding<T>) {
        let key = key.into();
        let value = binding.snapshot();
        self.fields.insert(key.clone(), value.clone());
        self.dirty.insert(key.clone(), value);
        self.bindings.insert(key, Arc::clone(&binding.cell));
    }

    /// Copies the current value of every binding into the record. Returns
    /// `true` if any of them changed since the last flush.
    pub fn flush_bindings(&mut self) -> bool {
        let values: Vec<(String, Value)> = self
            .bindings
            .iter()
            .map(|(key, cell)| (key.clone(), read_cell(cell)))
            .collect();
        values
            .into_iter()
            .fold(false, |changed, (key, value)| self.assign(key, value) | changed)
    }

    /// Merges the stored record into the live view. Fields written before the
    /// merge take precedence over the stored values. Does nothing if the
    /// tracker is already loaded.
    pub fn hydrate(&mut self, stored: FieldMap) {
        if self.is_loaded() {
            return;
        }
        let mut fields = stored;
        for (key, value) in &self.dirty {
            fields.insert(key.clone(), value.clone());
        }
        self.fields = fields;
        self.state = LoadState::Loaded;
    }

    /// Returns the full live view, with bound fields at their current value.
    #[must_use]
    pub fn snapshot(&self) -> FieldMap {
        let mut fields = self.fields.clone();
        for (key, cell) in &self.bindings {
            fields.insert(key.clone(), read_cell(cell));
        }
        fields
    }

    /// Marks every field of the live view as written.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = self.snapshot();
    }

    fn assign(&mut self, key: String, value: Value) -> bool {
        let changed = self.fields.get(&key) != Some(&value);
        if changed {
            self.dirty.insert(key.clone(), value.clone());
        }
        self.fields.insert(key, value);
        changed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stored(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn get_missing_and_null_are_absent() {
        let mut tracker = ChangeTracker::fresh();
        tracker.set("nothing", Value::Null);

        assert_eq!(tracker.get("missing"), None);
        assert_eq!(tracker.get("nothing"), None);
    }

    #[test]
    fn set_before_load_survives_hydrate() {
        let mut tracker = ChangeTracker::new();
        tracker.set("user", json!("alice"));
        assert_eq!(tracker.get("user"), Some(json!("alice")));

        tracker.hydrate(stored(json!({"user": "bob", "theme": "dark"})));

        assert_eq!(tracker.get("user"), Some(json!("alice")));
        assert_eq!(tracker.get("theme"), Some(json!("dark")));
    }

    #[test]
    fn delete_before_load_survives_hydrate() {
        let mut tracker = ChangeTracker::new();
        tracker.delete(["user"]);

        tracker.hydrate(stored(json!({"user": "bob"})));

        assert_eq!(tracker.get("user"), None);
    }

    #[test]
    fn hydrate_is_idempotent() {
        let mut tracker = ChangeTracker::new();
        tracker.hydrate(stored(json!({"user": "bob"})));
        tracker.hydrate(stored(json!({"user": "mallory"})));

        assert_eq!(tracker.get("user"), Some(json!("bob")));
    }

    #[test]
    fn set_same_value_is_not_dirty() {
        let mut tracker = ChangeTracker::new();
        tracker.hydrate(stored(json!({"user": "bob"})));

        assert!(!tracker.set("user", json!("bob")));
        assert!(!tracker.is_dirty());

        assert!(tracker.set("user", json!("alice")));
        assert_eq!(tracker.dirty_keys().collect::<Vec<_>>(), vec!["user"]);
    }

    #[test]
    fn set_new_key_is_dirty_even_when_null() {
        let mut tracker = ChangeTracker::fresh();

        assert!(tracker.set("flag", Value::Null));
        assert!(tracker.is_dirty());
        assert!(tracker.snapshot().contains_key("flag"));
    }

    #[test]
    fn get_once_clears_the_field() {
        let mut tracker = ChangeTracker::fresh();
        tracker.set("flash", json!("saved"));

        assert_eq!(tracker.get_once("flash"), Some(json!("saved")));
        assert_eq!(tracker.get("flash"), None);
        assert_eq!(tracker.get_once("flash"), None);
        assert_eq!(tracker.snapshot().get("flash"), Some(&Value::Null));
    }

    #[test]
    fn get_once_on_loaded_field_is_dirty() {
        let mut tracker = ChangeTracker::new();
        tracker.hydrate(stored(json!({"flash": "saved"})));

        assert_eq!(tracker.get_once("flash"), Some(json!("saved")));
        assert_eq!(tracker.dirty_keys().collect::<Vec<_>>(), vec!["flash"]);
    }

    #[test]
    fn delete_many_keys() {
        let mut tracker = ChangeTracker::fresh();
        tracker.set("a", json!(1));
        tracker.set("b", json!(2));
        tracker.set("c", json!(3));

        assert!(tracker.delete(["a", "b"]));

        assert_eq!(tracker.get("a"), None);
        assert_eq!(tracker.get("b"), None);
        assert_eq!(tracker.get("c"), Some(json!(3)));
    }

    #[test]
    fn bound_field_follows_binding() {
        let counter = Binding::new(&1_u32).unwrap();
        let mut tracker = ChangeTracker::fresh();
        tracker.bind("counter", &counter);

        counter.set(&2).unwrap();
        assert_eq!(tracker.get("counter"), Some(json!(2)));
        assert_eq!(tracker.snapshot().get("counter"), Some(&json!(2)));

        assert!(tracker.flush_bindings());
        assert!(!tracker.flush_bindings());
    }

    #[test]
    fn binding_wins_over_loaded_value() {
        let counter = Binding::new(&5_u32).unwrap();
        let mut tracker = ChangeTracker::new();
        tracker.bind("counter", &counter);

        tracker.hydrate(stored(json!({"counter": 1})));

        assert_eq!(tracker.get("counter"), Some(json!(5)));
    }

    #[test]
    fn set_ends_binding() {
        let counter = Binding::new(&1_u32).unwrap();
        let mut tracker = ChangeTracker::fresh();
        tracker.bind("counter", &counter);

        tracker.set("counter", json!(10));
        counter.set(&2).unwrap();

        assert_eq!(tracker.get("counter"), Some(json!(10)));
        assert_eq!(counter.get().unwrap(), 2);
    }

    #[test]
    fn mark_all_dirty_covers_loaded_fields() {
        let mut tracker = ChangeTracker::new();
        tracker.hydrate(stored(json!({"user": "bob", "theme": "dark"})));

        tracker.mark_all_dirty();

        assert_eq!(
            tracker.dirty_keys().collect::<Vec<_>>(),
            vec!["theme", "user"]
        );
    }
}
