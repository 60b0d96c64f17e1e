//! Schema model — field definitions, record validation, and the
//! index/relation artifacts a schema implies.
//!
//! A `Schema` is a named set of `FieldDefinition`s. Declaration order is
//! not meaningful to callers, but the codec needs *some* stable order
//! to write fields without a name alongside every value, so `Schema`
//! keeps the order fields were declared in and uses it consistently as
//! the on-disk field order.

use std::collections::HashMap;

use crate::error::{ErrorKind, Result};
use crate::value::{Kind, Value};

/// How a relation's reference multiplicity is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
	OneToOne,
	OneToMany,
	ManyToOne,
	ManyToMany,
}

/// What happens to referring records when a relation's target is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
	Cascade,
	SetNull,
	Restrict,
}

/// A field's `relation?` attribute: a foreign key to another collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationHint {
	pub target: String,
	pub cardinality: Cardinality,
	pub on_delete: DeletePolicy,
}

/// One field of a schema: `{kind, indexed?, unique?, required?, default?,
/// hidden?, relation?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
	pub name: String,
	pub kind: Kind,
	pub indexed: bool,
	pub unique: bool,
	pub required: bool,
	pub default: Option<Value>,
	pub hidden: bool,
	pub relation: Option<RelationHint>,
}

impl FieldDefinition {
	pub fn new(name: impl Into<String>, kind: Kind) -> Self {
		FieldDefinition {
			name: name.into(),
			kind,
			indexed: false,
			unique: false,
			required: false,
			default: None,
			hidden: false,
			relation: None,
		}
	}

	pub fn indexed(mut self) -> Self {
		self.indexed = true;
		self
	}

	/// A unique field is implicitly indexed (one index is derived
	/// per field marked `indexed` *or* `unique`).
	pub fn unique(mut self) -> Self {
		self.unique = true;
		self
	}

	pub fn required(mut self) -> Self {
		self.required = true;
		self
	}

	pub fn hidden(mut self) -> Self {
		self.hidden = true;
		self
	}

	pub fn with_default(mut self, value: Value) -> Self {
		self.default = Some(value);
		self
	}

	pub fn relation(mut self, target: impl Into<String>, cardinality: Cardinality, on_delete: DeletePolicy) -> Self {
		self.relation = Some(RelationHint {
			target: target.into(),
			cardinality,
			on_delete,
		});
		self
	}
}

/// An auto-created secondary index, one per indexed or unique field.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
	pub name: String,
	pub field: String,
	pub unique: bool,
}

/// A fully-qualified outgoing relation, derived from a field's
/// `relation?` attribute plus the collection that declares it.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDefinition {
	pub name: String,
	pub source_collection: String,
	pub target_collection: String,
	pub source_field: String,
	pub target_field: String,
	pub cardinality: Cardinality,
	pub on_delete: DeletePolicy,
}

/// A collection's declared structure: field name → field definition.
#[derive(Debug, Clone)]
pub struct Schema {
	order: Vec<String>,
	fields: HashMap<String, FieldDefinition>,
}

impl Schema {
	pub fn new(fields: Vec<FieldDefinition>) -> Result<Schema> {
		let mut order = Vec::with_capacity(fields.len());
		let mut map = HashMap::with_capacity(fields.len());
		for field in fields {
			if map.contains_key(&field.name) {
				return Err(ErrorKind::SchemaError(field.name.clone(), "duplicate field name".into()).into());
			}
			order.push(field.name.clone());
			map.insert(field.name.clone(), field);
		}
		Ok(Schema { order, fields: map })
	}

	pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
		self.fields.get(name)
	}

	pub fn field_names(&self) -> &[String] {
		&self.order
	}

	/// Fields in declaration order — the order the codec persists them in.
	pub fn fields_in_order(&self) -> Vec<&FieldDefinition> {
		self.order.iter().map(|name| &self.fields[name]).collect()
	}

	/// Validates a candidate assignment: required fields present and
	/// non-null, present values matching their declared kind, no fields
	/// beyond the ones the schema declares.
	pub fn validate(&self, values: &HashMap<String, Value>) -> Result<()> {
		for (name, _) in values {
			if !self.fields.contains_key(name) {
				return Err(ErrorKind::SchemaError(name.clone(), "field is not declared by the schema".into()).into());
			}
		}
		for field in self.fields_in_order() {
			match values.get(&field.name) {
				Some(Value::Null) | None => {
					if field.required {
						return Err(ErrorKind::SchemaError(field.name.clone(), "required field is missing".into()).into());
					}
				}
				Some(value) => {
					if value.kind() != Some(field.kind) {
						return Err(ErrorKind::SchemaError(
							field.name.clone(),
							format!("expected {}, found {}", field.kind.name(), kind_name_of(value)),
						)
						.into());
					}
				}
			}
		}
		Ok(())
	}

	/// Expands a (possibly partial) assignment into the full ordered
	/// value list the codec and primary store expect: declared fields
	/// missing from `values` fall back to their default, or `Null`.
	pub fn ordered_values(&self, values: &HashMap<String, Value>) -> Vec<Value> {
		self.fields_in_order()
			.into_iter()
			.map(|field| {
				values
					.get(&field.name)
					.cloned()
					.or_else(|| field.default.clone())
					.unwrap_or(Value::Null)
			})
			.collect()
	}

	/// Rebuilds a name-keyed assignment from an ordered value list, the
	/// inverse of [`Schema::ordered_values`] — used when a record is
	/// read back off the primary store or decoded from disk.
	pub fn named_values(&self, values: &[Value]) -> HashMap<String, Value> {
		self.order
			.iter()
			.cloned()
			.zip(values.iter().cloned())
			.collect()
	}

	/// One index per field marked `indexed` or `unique`, named `<field>_idx`.
	pub fn derive_indexes(&self) -> Vec<IndexDefinition> {
		self.fields_in_order()
			.into_iter()
			.filter(|field| field.indexed || field.unique)
			.map(|field| IndexDefinition {
				name: format!("{}_idx", field.name),
				field: field.name.clone(),
				unique: field.unique,
			})
			.collect()
	}

	/// One outgoing relation per field carrying a `relation?` attribute,
	/// named `<source_collection>_<field>_<target>`.
	pub fn derive_relations(&self, source_collection: &str) -> Vec<RelationDefinition> {
		self.fields_in_order()
			.into_iter()
			.filter_map(|field| {
				field.relation.as_ref().map(|hint| RelationDefinition {
					name: format!("{}_{}_{}", source_collection, field.name, hint.target),
					source_collection: source_collection.to_string(),
					target_collection: hint.target.clone(),
					source_field: field.name.clone(),
					target_field: "id".to_string(),
					cardinality: hint.cardinality,
					on_delete: hint.on_delete,
				})
			})
			.collect()
	}

	/// Merges a schema decoded off disk into this one, adding any field
	/// the registry didn't already declare (merging its
	/// schema into the registry if absent"). Fields present in both keep
	/// the registry's richer definition.
	pub fn merge_from_disk(&mut self, decoded: Vec<(String, Kind)>) {
		for (name, kind) in decoded {
			if !self.fields.contains_key(&name) {
				self.order.push(name.clone());
				self.fields.insert(name.clone(), FieldDefinition::new(name, kind));
			}
		}
	}
}

fn kind_name_of(value: &Value) -> &'static str {
	match value {
		Value::Text(_) => Kind::Text.name(),
		Value::Real(_) => Kind::Real.name(),
		Value::Boolean(_) => Kind::Boolean.name(),
		Value::Instant(_) => Kind::Instant.name(),
		Value::Null => "null",
	}
}
