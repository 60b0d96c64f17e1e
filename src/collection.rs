//! Collection engine.
//!
//! `Collection` holds the logic; it is plain synchronous code with no
//! knowledge of locking. `CollectionHandle` is what callers actually
//! hold — it wraps a `Collection` in a `tokio::sync::Mutex` so every
//! externally callable operation acquires the lock on entry and
//! releases it on exit, including via the error path (the lock
//! discipline). A suspension only ever happens at that one `.lock()`
//! await point; nothing here performs file I/O.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::btree::BTree;
use crate::error::{ErrorKind, Result};
use crate::id;
use crate::index::{Index, IndexManager};
use crate::schema::{IndexDefinition, Schema};
use crate::value::Value;

/// The caller-visible projection of a record: every declared field not
/// marked `hidden`, plus the implicit `id`.
pub type View = HashMap<String, Value>;

const ID_FIELD: &str = "id";

#[derive(Clone)]
struct StoredRecord {
	values: HashMap<String, Value>,
}

/// Per-index entry/byte counts, for `getIndexStats`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
	pub name: String,
	pub field: String,
	pub unique: bool,
	pub entry_count: usize,
	pub memory_bytes: usize,
}

/// Aggregate collection counters, for `getStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
	pub record_count: usize,
	pub index_count: usize,
	pub index_memory_bytes: usize,
}

type ModifyListener = Box<dyn Fn() + Send + Sync>;

/// The synchronous core of a collection: schema, primary store, indexes
/// and modification subscribers.
pub struct Collection {
	schema: Schema,
	records: BTree<String, StoredRecord>,
	indexes: IndexManager,
	listeners: Vec<(u64, ModifyListener)>,
	next_listener_id: u64,
}

impl Collection {
	pub fn new(schema: Schema) -> Self {
		let mut indexes = IndexManager::new();
		for definition in schema.derive_indexes() {
			indexes.create_index(definition);
		}
		Collection {
			schema,
			records: BTree::default(),
			indexes,
			listeners: Vec::new(),
			next_listener_id: 0,
		}
	}

	pub fn schema(&self) -> &Schema {
		&self.schema
	}

	fn project(&self, id: &str, stored: &StoredRecord) -> View {
		let mut view = View::new();
		view.insert(ID_FIELD.to_string(), Value::Text(id.to_string()));
		for field in self.schema.fields_in_order() {
			if field.hidden {
				continue;
			}
			if let Some(value) = stored.values.get(&field.name) {
				view.insert(field.name.clone(), value.clone());
			}
		}
		view
	}

	fn project_internal(&self, id: &str, stored: &StoredRecord) -> View {
		let mut view = View::new();
		view.insert(ID_FIELD.to_string(), Value::Text(id.to_string()));
		for field in self.schema.fields_in_order() {
			if let Some(value) = stored.values.get(&field.name) {
				view.insert(field.name.clone(), value.clone());
			}
		}
		view
	}

	fn fire_modify(&self) {
		for (_, listener) in &self.listeners {
			listener();
		}
	}

	pub fn insert(&mut self, assignment: HashMap<String, Value>) -> Result<View> {
		self.schema.validate(&assignment)?;
		let values = self.schema.ordered_values(&assignment);
		let named = self.schema.named_values(&values);

		let new_id = loop {
			let candidate = id::generate();
			if !self.records.contains(&candidate) {
				break candidate;
			}
		};

		self.indexes.add_to_all(&new_id, &named)?;
		let view = self.project(&new_id, &StoredRecord { values: named.clone() });
		self.records.insert(new_id.clone(), StoredRecord { values: named });
		self.fire_modify();
		debug!(id = %new_id, "inserted record");
		Ok(view)
	}

	pub fn get(&self, id: &str) -> Option<View> {
		self.records.search(&id.to_string()).map(|stored| self.project(id, stored))
	}

	pub fn update(&mut self, id: &str, partial: HashMap<String, Value>) -> Result<Option<View>> {
		let Some(existing) = self.records.search(&id.to_string()) else {
			return Ok(None);
		};

		let mut merged = existing.values.clone();
		for (field, value) in &partial {
			merged.insert(field.clone(), value.clone());
		}
		self.schema.validate(&merged)?;

		self.indexes.update_in_all(id, &existing.values, &merged)?;

		let view = self.project(id, &StoredRecord { values: merged.clone() });
		self.records.insert(id.to_string(), StoredRecord { values: merged });
		self.fire_modify();
		debug!(id, "updated record");
		Ok(Some(view))
	}

	pub fn remove(&mut self, id: &str) -> bool {
		let Some(stored) = self.records.search(&id.to_string()) else {
			return false;
		};
		self.indexes.remove_from_all(id, &stored.values);
		self.records.delete(&id.to_string());
		self.fire_modify();
		debug!(id, "removed record");
		true
	}

	pub fn all(&self) -> Vec<View> {
		self.records.iter().into_iter().map(|(id, stored)| self.project(&id, &stored)).collect()
	}

	pub fn all_internal(&self) -> Vec<View> {
		self.records.iter().into_iter().map(|(id, stored)| self.project_internal(&id, &stored)).collect()
	}

	pub fn find(&self, predicate: impl Fn(&View) -> bool) -> Vec<View> {
		self.all().into_iter().filter(|view| predicate(view)).collect()
	}

	pub fn first(&self, predicate: impl Fn(&View) -> bool) -> Option<View> {
		for (id, stored) in self.records.iter() {
			let view = self.project(&id, &stored);
			if predicate(&view) {
				return Some(view);
			}
		}
		None
	}

	pub fn find_by_field(&self, field: &str, value: &Value) -> Option<View> {
		if let Some(index) = self.indexes.index_for_field(field) {
			let found_id = index.search(value)?;
			return self.get(found_id);
		}
		self.first(|view| view.get(field).map(|v| v == value).unwrap_or(false))
	}

	pub fn find_by_range(&self, field: &str, min: &Value, max: &Value) -> Result<Vec<View>> {
		let index = self
			.indexes
			.index_for_field(field)
			.ok_or_else(|| ErrorKind::MissingIndex(field.to_string()))?;
		Ok(index
			.range_search(min, max)
			.into_iter()
			.filter_map(|id| self.get(&id))
			.collect())
	}

	pub fn create_index(&mut self, definition: IndexDefinition) -> Result<()> {
		if self.indexes.get(&definition.name).is_some() {
			return Err(ErrorKind::InvalidOptions("name", format!("index `{}` already exists", definition.name)).into());
		}
		let field = definition.field.clone();
		let name = definition.name.clone();
		let mut candidate = Index::new(definition);
		for (id, stored) in self.records.iter() {
			if let Some(value) = stored.values.get(&field) {
				candidate.add(value, &id)?;
			}
		}
		self.indexes.install(candidate);
		trace!(index = %name, field = %field, "index created");
		Ok(())
	}

	pub fn drop_index(&mut self, name: &str) -> bool {
		let dropped = self.indexes.drop_index(name);
		if dropped {
			trace!(index = name, "index dropped");
		}
		dropped
	}

	pub fn list_indexes(&self) -> Vec<IndexDefinition> {
		self.indexes.list().into_iter().cloned().collect()
	}

	pub fn get_index_stats(&self) -> Vec<IndexStats> {
		self.indexes
			.list()
			.into_iter()
			.map(|definition| {
				let index = self.indexes.get(&definition.name).expect("listed index exists");
				IndexStats {
					name: definition.name.clone(),
					field: definition.field.clone(),
					unique: definition.unique,
					entry_count: index.entry_count(),
					memory_bytes: index.memory_estimate(),
				}
			})
			.collect()
	}

	pub fn get_stats(&self) -> CollectionStats {
		let stats = self.get_index_stats();
		CollectionStats {
			record_count: self.records.len(),
			index_count: stats.len(),
			index_memory_bytes: stats.iter().map(|s| s.memory_bytes).sum(),
		}
	}

	/// In-place retention: keeps records satisfying `predicate`, removes
	/// the rest through the same index-synchronized path as `remove`.
	/// Fires the modification event once, not once per removed record.
	pub fn filter(&mut self, predicate: impl Fn(&View) -> bool) {
		let to_remove: Vec<String> = self
			.records
			.iter()
			.into_iter()
			.filter_map(|(id, stored)| {
				let view = self.project(&id, &stored);
				if predicate(&view) {
					None
				} else {
					Some(id)
				}
			})
			.collect();
		if to_remove.is_empty() {
			return;
		}
		for id in &to_remove {
			if let Some(stored) = self.records.search(id) {
				self.indexes.remove_from_all(id, &stored.values);
			}
			self.records.delete(id);
		}
		self.fire_modify();
		debug!(removed = to_remove.len(), "filter retained a subset of records");
	}

	pub fn on_modify(&mut self, listener: ModifyListener) -> u64 {
		let token = self.next_listener_id;
		self.next_listener_id += 1;
		self.listeners.push((token, listener));
		token
	}

	pub fn off_modify(&mut self, token: u64) -> bool {
		let before = self.listeners.len();
		self.listeners.retain(|(id, _)| *id != token);
		self.listeners.len() != before
	}

	/// Replaces the primary store and indexes wholesale with records
	/// loaded from disk; used on container load, before any external
	/// operation has been observed.
	pub fn seed(&mut self, records: Vec<(String, HashMap<String, Value>)>) -> Result<()> {
		for (id, values) in records {
			self.indexes.add_to_all(&id, &values)?;
			self.records.insert(id, StoredRecord { values });
		}
		Ok(())
	}
}

/// A shared, lock-guarded handle to a [`Collection`]. Every method here
/// is the async, externally callable counterpart of the same-named
/// method on `Collection`.
#[derive(Clone)]
pub struct CollectionHandle {
	inner: Arc<Mutex<Collection>>,
}

impl CollectionHandle {
	pub fn new(collection: Collection) -> Self {
		CollectionHandle {
			inner: Arc::new(Mutex::new(collection)),
		}
	}

	pub async fn insert(&self, assignment: HashMap<String, Value>) -> Result<View> {
		self.inner.lock().await.insert(assignment)
	}

	pub async fn get(&self, id: &str) -> Option<View> {
		self.inner.lock().await.get(id)
	}

	pub async fn update(&self, id: &str, partial: HashMap<String, Value>) -> Result<Option<View>> {
		self.inner.lock().await.update(id, partial)
	}

	pub async fn remove(&self, id: &str) -> bool {
		self.inner.lock().await.remove(id)
	}

	pub async fn all(&self) -> Vec<View> {
		self.inner.lock().await.all()
	}

	pub async fn all_internal(&self) -> Vec<View> {
		self.inner.lock().await.all_internal()
	}

	pub async fn find(&self, predicate: impl Fn(&View) -> bool) -> Vec<View> {
		self.inner.lock().await.find(predicate)
	}

	pub async fn first(&self, predicate: impl Fn(&View) -> bool) -> Option<View> {
		self.inner.lock().await.first(predicate)
	}

	pub async fn find_by_field(&self, field: &str, value: &Value) -> Option<View> {
		self.inner.lock().await.find_by_field(field, value)
	}

	pub async fn find_by_range(&self, field: &str, min: &Value, max: &Value) -> Result<Vec<View>> {
		self.inner.lock().await.find_by_range(field, min, max)
	}

	pub async fn create_index(&self, definition: IndexDefinition) -> Result<()> {
		self.inner.lock().await.create_index(definition)
	}

	pub async fn drop_index(&self, name: &str) -> bool {
		self.inner.lock().await.drop_index(name)
	}

	pub async fn list_indexes(&self) -> Vec<IndexDefinition> {
		self.inner.lock().await.list_indexes()
	}

	pub async fn get_index_stats(&self) -> Vec<IndexStats> {
		self.inner.lock().await.get_index_stats()
	}

	pub async fn get_stats(&self) -> CollectionStats {
		self.inner.lock().await.get_stats()
	}

	pub async fn filter(&self, predicate: impl Fn(&View) -> bool) {
		self.inner.lock().await.filter(predicate)
	}

	pub async fn on_modify(&self, listener: ModifyListener) -> u64 {
		self.inner.lock().await.on_modify(listener)
	}

	pub async fn off_modify(&self, token: u64) -> bool {
		self.inner.lock().await.off_modify(token)
	}

	pub async fn schema_snapshot(&self) -> Schema {
		self.inner.lock().await.schema().clone()
	}

	pub(crate) fn inner(&self) -> &Arc<Mutex<Collection>> {
		&self.inner
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::FieldDefinition;
	use crate::value::Kind;

	fn users_schema() -> Schema {
		Schema::new(vec![
			FieldDefinition::new("name", Kind::Text).required(),
			FieldDefinition::new("email", Kind::Text).unique().required(),
			FieldDefinition::new("age", Kind::Real).indexed(),
			FieldDefinition::new("ssn", Kind::Text).hidden(),
		])
		.unwrap()
	}

	fn assignment(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
	}

	#[test]
	fn insert_then_get_round_trips_and_hides_hidden_fields() {
		let mut collection = Collection::new(users_schema());
		let view = collection
			.insert(assignment(&[
				("name", Value::Text("Alice".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(28.0)),
				("ssn", Value::Text("000-00-0000".into())),
			]))
			.unwrap();
		assert!(!view.contains_key("ssn"));
		let id = match view.get("id").unwrap() {
			Value::Text(s) => s.clone(),
			_ => panic!("id must be text"),
		};
		let fetched = collection.get(&id).unwrap();
		assert_eq!(fetched.get("name"), Some(&Value::Text("Alice".into())));
		assert!(!fetched.contains_key("ssn"));
	}

	#[test]
	fn insert_rejects_duplicate_unique_value_and_leaves_size_unchanged() {
		let mut collection = Collection::new(users_schema());
		collection
			.insert(assignment(&[
				("name", Value::Text("Alice".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(28.0)),
			]))
			.unwrap();
		collection
			.insert(assignment(&[
				("name", Value::Text("Bob".into())),
				("email", Value::Text("b@x".into())),
				("age", Value::Real(32.0)),
			]))
			.unwrap();
		let err = collection
			.insert(assignment(&[
				("name", Value::Text("Eve".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(40.0)),
			]))
			.unwrap_err();
		assert!(matches!(err.0, ErrorKind::UniqueViolation(ref i, ref v) if i == "email_idx" && v == "a@x"));
		assert_eq!(collection.get_stats().record_count, 2);
	}

	#[test]
	fn find_by_field_and_find_by_range_match_the_walkthrough_scenario() {
		let mut collection = Collection::new(users_schema());
		collection
			.insert(assignment(&[
				("name", Value::Text("Alice".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(28.0)),
			]))
			.unwrap();
		collection
			.insert(assignment(&[
				("name", Value::Text("Bob".into())),
				("email", Value::Text("b@x".into())),
				("age", Value::Real(32.0)),
			]))
			.unwrap();

		let found = collection.find_by_field("email", &Value::Text("a@x".into())).unwrap();
		assert_eq!(found.get("name"), Some(&Value::Text("Alice".into())));

		let in_range = collection.find_by_range("age", &Value::Real(18.0), &Value::Real(30.0)).unwrap();
		assert_eq!(in_range.len(), 1);
		assert_eq!(in_range[0].get("name"), Some(&Value::Text("Alice".into())));
	}

	#[test]
	fn find_by_range_without_an_index_is_missing_index() {
		let collection = Collection::new(users_schema());
		let err = collection.find_by_range("name", &Value::Text("a".into()), &Value::Text("z".into())).unwrap_err();
		assert!(matches!(err.0, ErrorKind::MissingIndex(ref f) if f == "name"));
	}

	#[test]
	fn update_changes_indexed_value_and_rolls_back_on_unique_violation() {
		let mut collection = Collection::new(users_schema());
		let alice = collection
			.insert(assignment(&[
				("name", Value::Text("Alice".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(28.0)),
			]))
			.unwrap();
		collection
			.insert(assignment(&[
				("name", Value::Text("Bob".into())),
				("email", Value::Text("b@x".into())),
				("age", Value::Real(32.0)),
			]))
			.unwrap();
		let alice_id = match alice.get("id").unwrap() {
			Value::Text(s) => s.clone(),
			_ => unreachable!(),
		};

		let err = collection
			.update(&alice_id, assignment(&[("email", Value::Text("b@x".into()))]))
			.unwrap_err();
		assert!(matches!(err.0, ErrorKind::UniqueViolation(_, _)));
		// old value must still resolve after the rollback
		assert!(collection.find_by_field("email", &Value::Text("a@x".into())).is_some());

		let updated = collection.update(&alice_id, assignment(&[("age", Value::Real(29.0))])).unwrap().unwrap();
		assert_eq!(updated.get("age"), Some(&Value::Real(29.0)));
	}

	#[test]
	fn remove_clears_indexes_and_filter_retains_a_predicate() {
		let mut collection = Collection::new(users_schema());
		let alice = collection
			.insert(assignment(&[
				("name", Value::Text("Alice".into())),
				("email", Value::Text("a@x".into())),
				("age", Value::Real(28.0)),
			]))
			.unwrap();
		collection
			.insert(assignment(&[
				("name", Value::Text("Bob".into())),
				("email", Value::Text("b@x".into())),
				("age", Value::Real(32.0)),
			]))
			.unwrap();
		let alice_id = match alice.get("id").unwrap() {
			Value::Text(s) => s.clone(),
			_ => unreachable!(),
		};
		assert!(collection.remove(&alice_id));
		assert!(collection.find_by_field("email", &Value::Text("a@x".into())).is_none());

		collection.filter(|view| matches!(view.get("name"), Some(Value::Text(n)) if n == "Bob"));
		assert_eq!(collection.get_stats().record_count, 1);
	}

	#[test]
	fn create_index_rolls_back_when_existing_records_violate_uniqueness() {
		let mut collection = Collection::new(Schema::new(vec![FieldDefinition::new("code", Kind::Text)]).unwrap());
		collection.insert(assignment(&[("code", Value::Text("x".into()))])).unwrap();
		collection.insert(assignment(&[("code", Value::Text("x".into()))])).unwrap();
		let err = collection
			.create_index(IndexDefinition {
				name: "code_idx".into(),
				field: "code".into(),
				unique: true,
			})
			.unwrap_err();
		assert!(matches!(err.0, ErrorKind::UniqueViolation(_, _)));
		assert!(collection.list_indexes().iter().all(|i| i.name != "code_idx"));
	}
}
