//! Secondary index / index manager.
//!
//! Each `Index` wraps an ordered map from field value to the ids that
//! currently hold it. The base design in the source material stores a
//! single id per value, which is fine for unique indexes but loses
//! entries under duplicate values in a non-unique one: removing one of
//! two records sharing a value would wipe the index entry for the one
//! left behind. We resolve that (§9, open question 1) by backing every
//! index with a value → id-list multimap; `search` still surfaces one
//! id per the original contract, but removal only ever drops the id it
//! was asked to drop.

use std::collections::HashMap;

use crate::btree::BTree;
use crate::error::{ErrorKind, Result};
use crate::schema::IndexDefinition;
use crate::value::Value;

/// A single named index over one field.
pub struct Index {
	definition: IndexDefinition,
	map: BTree<Value, Vec<String>>,
}

impl Index {
	pub fn new(definition: IndexDefinition) -> Self {
		Index {
			definition,
			map: BTree::default(),
		}
	}

	pub fn name(&self) -> &str {
		&self.definition.name
	}

	pub fn field(&self) -> &str {
		&self.definition.field
	}

	pub fn is_unique(&self) -> bool {
		self.definition.unique
	}

	pub fn definition(&self) -> &IndexDefinition {
		&self.definition
	}

	/// Adds `id` under `value`. A no-op when `value` is null/absent —
	/// nulls are never indexed. Unique indexes reject a
	/// value already present.
	pub fn add(&mut self, value: &Value, id: &str) -> Result<()> {
		if value.is_null() {
			return Ok(());
		}
		if self.definition.unique {
			if self.map.contains(value) {
				return Err(ErrorKind::UniqueViolation(self.definition.name.clone(), display_value(value)).into());
			}
			self.map.insert(value.clone(), vec![id.to_string()]);
			return Ok(());
		}
		let mut bucket = self.map.search(value).cloned().unwrap_or_default();
		bucket.push(id.to_string());
		self.map.insert(value.clone(), bucket);
		Ok(())
	}

	/// Removes `id` from under `value`. A no-op when `value` is
	/// null/absent, or when the id was never recorded there.
	pub fn remove(&mut self, value: &Value, id: &str) {
		if value.is_null() {
			return;
		}
		let Some(bucket) = self.map.search(value) else {
			return;
		};
		let mut bucket = bucket.clone();
		bucket.retain(|existing| existing != id);
		if bucket.is_empty() {
			self.map.delete(value);
		} else {
			self.map.insert(value.clone(), bucket);
		}
	}

	/// Returns at most one id holding `value` (the first one recorded).
	pub fn search(&self, value: &Value) -> Option<&str> {
		self.map.search(value).and_then(|ids| ids.first()).map(String::as_str)
	}

	/// Returns every id holding `value`, ascending insertion order within
	/// the bucket.
	pub fn search_all(&self, value: &Value) -> Vec<String> {
		self.map.search(value).cloned().unwrap_or_default()
	}

	/// Every id whose indexed value falls in `[min, max]`, in ascending
	/// key order (ids sharing a key appear in insertion order).
	pub fn range_search(&self, min: &Value, max: &Value) -> Vec<String> {
		self.map
			.range(min, max)
			.into_iter()
			.flat_map(|(_, ids)| ids.into_iter())
			.collect()
	}

	/// Number of distinct values currently indexed.
	pub fn entry_count(&self) -> usize {
		self.map.len()
	}

	/// A rough estimate of the bytes this index occupies, used by
	/// `getStats`/`getIndexStats` — not an exact accounting.
	pub fn memory_estimate(&self) -> usize {
		self.map
			.iter()
			.into_iter()
			.map(|(value, ids)| value_byte_estimate(&value) + ids.iter().map(|id| id.len()).sum::<usize>())
			.sum()
	}
}

fn value_byte_estimate(value: &Value) -> usize {
	match value {
		Value::Text(s) => s.len(),
		Value::Real(_) | Value::Instant(_) => 8,
		Value::Boolean(_) => 1,
		Value::Null => 0,
	}
}

fn display_value(value: &Value) -> String {
	match value {
		Value::Text(s) => s.clone(),
		Value::Real(f) => f.to_string(),
		Value::Boolean(b) => b.to_string(),
		Value::Instant(ms) => ms.to_string(),
		Value::Null => "null".to_string(),
	}
}

/// Aggregates every index declared on a collection and keeps them in
/// sync with the records map.
#[derive(Default)]
pub struct IndexManager {
	indexes: HashMap<String, Index>,
}

impl IndexManager {
	pub fn new() -> Self {
		IndexManager::default()
	}

	pub fn create_index(&mut self, definition: IndexDefinition) {
		self.indexes.insert(definition.name.clone(), Index::new(definition));
	}

	pub fn drop_index(&mut self, name: &str) -> bool {
		self.indexes.remove(name).is_some()
	}

	pub fn get(&self, name: &str) -> Option<&Index> {
		self.indexes.get(name)
	}

	/// Installs an index already populated by the caller (used by
	/// `createIndex`, which builds against existing records before
	/// deciding whether the new index is retained).
	pub fn install(&mut self, index: Index) {
		self.indexes.insert(index.name().to_string(), index);
	}

	pub fn list(&self) -> Vec<&IndexDefinition> {
		self.indexes.values().map(Index::definition).collect()
	}

	/// The index over `field`, if the schema declared one.
	pub fn index_for_field(&self, field: &str) -> Option<&Index> {
		self.indexes.values().find(|index| index.field() == field)
	}

	/// Adds `id` to every index whose field is present in `values`, with
	/// atomic rollback: the first index to reject the add (a unique
	/// violation) undoes every index already updated for this record
	/// before the error surfaces.
	pub fn add_to_all(&mut self, id: &str, values: &HashMap<String, Value>) -> Result<()> {
		let mut applied: Vec<(String, Value)> = Vec::new();
		for (name, index) in self.indexes.iter_mut() {
			let Some(value) = values.get(index.field()) else {
				continue;
			};
			match index.add(value, id) {
				Ok(()) => applied.push((name.clone(), value.clone())),
				Err(err) => {
					for (applied_name, applied_value) in applied {
						self.indexes.get_mut(&applied_name).unwrap().remove(&applied_value, id);
					}
					return Err(err);
				}
			}
		}
		Ok(())
	}

	/// Removes `id` from every index whose field is present in `values`.
	pub fn remove_from_all(&mut self, id: &str, values: &HashMap<String, Value>) {
		for index in self.indexes.values_mut() {
			if let Some(value) = values.get(index.field()) {
				index.remove(value, id);
			}
		}
	}

	/// Moves `id` from its old indexed values to its new ones, one index
	/// at a time, with the same rollback guarantee as `addToAll`: a
	/// unique violation on any index undoes every index already moved
	/// for this update before the error surfaces.
	pub fn update_in_all(&mut self, id: &str, old: &HashMap<String, Value>, new: &HashMap<String, Value>) -> Result<()> {
		let mut applied: Vec<(String, Value, Value)> = Vec::new();
		let names: Vec<String> = self.indexes.keys().cloned().collect();

		for name in names {
			let (old_value, new_value) = {
				let index = &self.indexes[&name];
				let field = index.field();
				(
					old.get(field).cloned().unwrap_or(Value::Null),
					new.get(field).cloned().unwrap_or(Value::Null),
				)
			};
			if old_value == new_value {
				continue;
			}

			let index = self.indexes.get_mut(&name).unwrap();
			index.remove(&old_value, id);
			match index.add(&new_value, id) {
				Ok(()) => applied.push((name, old_value, new_value)),
				Err(err) => {
					let _ = index.add(&old_value, id);
					for (rb_name, rb_old, rb_new) in applied.into_iter().rev() {
						let rb_index = self.indexes.get_mut(&rb_name).unwrap();
						rb_index.remove(&rb_new, id);
						let _ = rb_index.add(&rb_old, id);
					}
					return Err(err);
				}
			}
		}
		Ok(())
	}
}
