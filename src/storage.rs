//! Storage manager.
//!
//! `Storage` owns the schema registry, the live collection map, the
//! relation table, and the auto-commit debounce. It is the only type
//! that knows about both `Collection`s and the on-disk `Container`:
//! `collection.rs` and `container.rs` stay ignorant of each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::collection::{Collection, CollectionHandle, CollectionStats, View};
use crate::container::{CollectionSnapshot, Container, LoadedCollection};
use crate::error::{ErrorKind, Result};
use crate::relation;
use crate::relation::DeletePlan;
use crate::schema::{Cardinality, DeletePolicy, RelationDefinition, Schema};
use crate::value::Value;

const AUTO_COMMIT_QUIET_PERIOD: Duration = Duration::from_millis(100);
const DEFAULT_FILENAME: &str = "./data/database.mdb";

/// Configuration accepted by [`Storage::open`] (
/// `open(schemas, {persist?, autoCommit?, filepath?})`).
#[derive(Debug, Clone)]
pub struct OpenOptions {
	pub persist: bool,
	pub auto_commit: bool,
	pub filepath: Option<PathBuf>,
}

impl Default for OpenOptions {
	fn default() -> Self {
		OpenOptions {
			persist: false,
			auto_commit: true,
			filepath: None,
		}
	}
}

/// The return shape of `get_relation`/`list_relations`: everything a
/// caller needs to display or re-derive a relation without reaching
/// back into the schema registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationMetadata {
	pub name: String,
	pub source_collection: String,
	pub target_collection: String,
	pub source_field: String,
	pub target_field: String,
	pub cardinality: Cardinality,
	pub on_delete: DeletePolicy,
}

impl From<&RelationDefinition> for RelationMetadata {
	fn from(def: &RelationDefinition) -> Self {
		RelationMetadata {
			name: def.name.clone(),
			source_collection: def.source_collection.clone(),
			target_collection: def.target_collection.clone(),
			source_field: def.source_field.clone(),
			target_field: def.target_field.clone(),
			cardinality: def.cardinality,
			on_delete: def.on_delete,
		}
	}
}

/// Per-collection counters reported by `getHealth`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionHealth {
	pub name: String,
	pub record_count: usize,
	pub index_count: usize,
}

/// `getHealth()`'s report: file path, on-disk size, per-collection counts.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
	pub path: PathBuf,
	pub file_size_bytes: u64,
	pub collections: Vec<CollectionHealth>,
}

fn resolve_path(filepath: Option<PathBuf>) -> PathBuf {
	let mut path = filepath.unwrap_or_else(|| PathBuf::from(DEFAULT_FILENAME));
	if path.extension().and_then(|ext| ext.to_str()) != Some("mdb") {
		let mut with_ext = path.clone().into_os_string();
		with_ext.push(".mdb");
		path = PathBuf::from(with_ext);
	}
	path
}

struct Inner {
	path: PathBuf,
	options: OpenOptions,
	schemas: Mutex<HashMap<String, Schema>>,
	collections: Mutex<HashMap<String, CollectionHandle>>,
	relations: Mutex<HashMap<String, RelationDefinition>>,
	/// Records/indexes read off disk, waiting to be replayed into a
	/// collection the first time it's instantiated. Drained entry by
	/// entry as each collection comes up.
	pending_load: Mutex<Option<HashMap<String, LoadedCollection>>>,
	initialized: Mutex<bool>,
	commit_lock: Mutex<()>,
	auto_commit_generation: AtomicU64,
	auto_commit_armed: AtomicBool,
}

/// The storage manager: schema registry, lazily-instantiated
/// collections, relation table, and auto-commit.
#[derive(Clone)]
pub struct Storage {
	inner: Arc<Inner>,
}

impl Storage {
	/// Registers `schemas` and configures persistence/auto-commit. Does
	/// not touch the filesystem — that happens on `initialize()` or on
	/// first `collection()` access in persistent mode.
	pub fn open(schemas: Vec<(String, Schema)>, options: OpenOptions) -> Storage {
		let path = resolve_path(options.filepath.clone());
		debug!(path = %path.display(), persist = options.persist, auto_commit = options.auto_commit, "opening storage manager");
		Storage {
			inner: Arc::new(Inner {
				path,
				options,
				schemas: Mutex::new(schemas.into_iter().collect()),
				collections: Mutex::new(HashMap::new()),
				relations: Mutex::new(HashMap::new()),
				pending_load: Mutex::new(None),
				initialized: Mutex::new(false),
				commit_lock: Mutex::new(()),
				auto_commit_generation: AtomicU64::new(0),
				auto_commit_armed: AtomicBool::new(false),
			}),
		}
	}

	pub fn path(&self) -> &Path {
		&self.inner.path
	}

	/// Idempotent. In persistent mode, loads the container (if not
	/// already loaded) and instantiates every collection it names,
	/// merging each stored schema into the registry when the registry
	/// doesn't already know that collection.
	pub async fn initialize(&self) -> Result<()> {
		let mut initialized = self.inner.initialized.lock().await;
		if *initialized {
			return Ok(());
		}
		if !self.inner.options.persist {
			*initialized = true;
			return Ok(());
		}

		let container = match Container::load(&self.inner.path).await {
			Ok(container) => container,
			Err(err) => {
				// Unreadable container: initialize empty anyway so later
				// calls don't retry the same bad file.
				warn!(path = %self.inner.path.display(), error = %err, "container failed to load; starting empty");
				*self.inner.pending_load.lock().await = Some(HashMap::new());
				*initialized = true;
				return Err(err);
			}
		};
		let loaded = container.into_collections();
		debug!(collections = loaded.len(), path = %self.inner.path.display(), "loaded container from disk");

		let names: Vec<String> = loaded.keys().cloned().collect();
		*self.inner.pending_load.lock().await = Some(loaded);
		*initialized = true;
		drop(initialized);

		for name in names {
			self.collection(&name).await?;
		}
		Ok(())
	}

	/// Instantiates (lazily, on first access) the named collection.
	/// Rejects names the schema registry doesn't know.
	pub async fn collection(&self, name: &str) -> Result<CollectionHandle> {
		if self.inner.options.persist {
			let already_initialized = *self.inner.initialized.lock().await;
			if !already_initialized {
				self.initialize_without_reentering(name).await?;
			}
		}

		if let Some(handle) = self.inner.collections.lock().await.get(name) {
			return Ok(handle.clone());
		}

		let mut schemas = self.inner.schemas.lock().await;
		let mut schema = schemas
			.get(name)
			.cloned()
			.ok_or_else(|| ErrorKind::NotFound(format!("collection `{}` is not registered", name)))?;

		let mut pending = self.inner.pending_load.lock().await;
		let loaded_entry = pending.as_mut().and_then(|map| map.remove(name));
		drop(pending);

		if let Some(loaded) = &loaded_entry {
			schema.merge_from_disk(loaded.schema_fields.clone());
		}
		schemas.insert(name.to_string(), schema.clone());
		drop(schemas);

		let schema_for_seed = schema.clone();
		let mut collection = Collection::new(schema);
		if let Some(loaded) = loaded_entry {
			for index in loaded.indexes {
				// schema-derived indexes already exist; only install ones
				// the stored directory names that the schema didn't imply.
				if collection.list_indexes().iter().all(|existing| existing.name != index.name) {
					collection.create_index(index)?;
				}
			}
			let seeded = loaded
				.records
				.into_iter()
				.map(|(id, values)| (id, schema_for_seed.named_values(&values)))
				.collect();
			collection.seed(seeded)?;
		}

		let storage = self.clone();
		let owned_name = name.to_string();
		collection.on_modify(Box::new(move || {
			storage.arm_auto_commit(&owned_name);
		}));

		let handle = CollectionHandle::new(collection);
		self.inner.collections.lock().await.insert(name.to_string(), handle.clone());
		trace!(collection = name, "collection instantiated");
		Ok(handle)
	}

	/// `initialize()`'s body, inlined for the re-entrant call from
	/// `collection()` (which must not await `collection()` itself while
	/// `initialize()` already holds the lock that guards it).
	async fn initialize_without_reentering(&self, _requested: &str) -> Result<()> {
		self.initialize().await
	}

	fn arm_auto_commit(&self, collection: &str) {
		let generation = self.inner.auto_commit_generation.fetch_add(1, Ordering::SeqCst) + 1;
		trace!(collection, generation, "modification observed");

		if !self.inner.options.auto_commit {
			return;
		}

		if self.inner.auto_commit_armed.swap(true, Ordering::SeqCst) {
			return;
		}

		let storage = self.clone();
		tokio::spawn(async move {
			let mut target_generation = generation;
			loop {
				tokio::time::sleep(AUTO_COMMIT_QUIET_PERIOD).await;
				let current = storage.inner.auto_commit_generation.load(Ordering::SeqCst);
				if current != target_generation {
					target_generation = current;
					continue;
				}
				break;
			}
			storage.inner.auto_commit_armed.store(false, Ordering::SeqCst);
			if let Err(err) = storage.commit_all().await {
				warn!(error = %err, "auto-commit rewrite failed; will retry on next modification");
			}
		});
	}

	/// Pulls the named collection's internal projection, schema and
	/// index directory into the container and rewrites the file.
	pub async fn commit(&self, name: &str) -> Result<()> {
		self.commit_many(&[name.to_string()]).await
	}

	/// Commits every live collection in one atomic rewrite of the file.
	pub async fn commit_all(&self) -> Result<()> {
		let names: Vec<String> = self.inner.collections.lock().await.keys().cloned().collect();
		self.commit_many(&names).await
	}

	async fn commit_many(&self, names: &[String]) -> Result<()> {
		let _guard = self.inner.commit_lock.lock().await;

		// Snapshot which handles/schemas exist, then release both maps
		// before touching any individual collection's own lock — a
		// commit must not block unrelated `collection()` lookups for
		// its whole duration (per-collection locks are held
		// independently).
		let handles: Vec<(String, CollectionHandle, Option<Schema>)> = {
			let collections = self.inner.collections.lock().await;
			let schemas = self.inner.schemas.lock().await;
			names
				.iter()
				.filter_map(|name| collections.get(name).map(|handle| (name.clone(), handle.clone(), schemas.get(name).cloned())))
				.collect()
		};

		let mut owned: Vec<(String, Schema, Vec<crate::schema::IndexDefinition>, Vec<(String, Vec<Value>)>)> = Vec::new();
		for (name, handle, registered_schema) in handles {
			let locked = handle.inner().lock().await;
			let schema = registered_schema.unwrap_or_else(|| locked.schema().clone());
			let indexes = locked.list_indexes();
			let records: Vec<(String, Vec<Value>)> = locked
				.all_internal()
				.into_iter()
				.map(|view| {
					let id = match view.get("id") {
						Some(Value::Text(s)) => s.clone(),
						_ => String::new(),
					};
					let ordered: Vec<Value> = schema.field_names().iter().map(|field| view.get(field).cloned().unwrap_or(Value::Null)).collect();
					(id, ordered)
				})
				.collect();
			owned.push((name, schema, indexes, records));
		}

		let snapshots: Vec<CollectionSnapshot<'_>> = owned
			.iter()
			.map(|(name, schema, indexes, records)| CollectionSnapshot {
				name,
				schema,
				indexes,
				records,
			})
			.collect();

		Container::save(&self.inner.path, &snapshots).await?;
		debug!(path = %self.inner.path.display(), collections = snapshots.len(), "committed to disk");
		Ok(())
	}

	/// Registers a relation after checking both collections are known
	/// to the schema registry.
	pub async fn define_relation(&self, spec: RelationDefinition) -> Result<RelationMetadata> {
		let schemas = self.inner.schemas.lock().await;
		if !schemas.contains_key(&spec.source_collection) {
			return Err(ErrorKind::NotFound(format!("collection `{}` is not registered", spec.source_collection)).into());
		}
		if !schemas.contains_key(&spec.target_collection) {
			return Err(ErrorKind::NotFound(format!("collection `{}` is not registered", spec.target_collection)).into());
		}
		drop(schemas);

		let metadata = RelationMetadata::from(&spec);
		self.inner.relations.lock().await.insert(spec.name.clone(), spec);
		Ok(metadata)
	}

	pub async fn list_relations(&self) -> Vec<RelationMetadata> {
		self.inner.relations.lock().await.values().map(RelationMetadata::from).collect()
	}

	pub async fn get_relation(&self, name: &str) -> Option<RelationMetadata> {
		self.inner.relations.lock().await.get(name).map(RelationMetadata::from)
	}

	pub async fn get_relation_metadata(&self, name: &str) -> Option<RelationMetadata> {
		self.get_relation(name).await
	}

	/// Runs `validateIntegrity` for every registered relation.
	pub async fn validate_relations(&self) -> Result<HashMap<String, relation::IntegrityReport>> {
		let relations: Vec<RelationDefinition> = self.inner.relations.lock().await.values().cloned().collect();
		let mut reports = HashMap::new();
		for spec in relations {
			let sources = self.collection(&spec.source_collection).await?.all().await;
			let targets = self.collection(&spec.target_collection).await?.all().await;
			let report = relation::validate_integrity(&sources, &spec.source_field, &targets, &spec.target_field);
			reports.insert(spec.name.clone(), report);
		}
		Ok(reports)
	}

	/// `innerJoin` for a named relation.
	pub async fn inner_join(&self, relation_name: &str) -> Result<Vec<(View, View)>> {
		let spec = self.require_relation(relation_name).await?;
		let sources = self.collection(&spec.source_collection).await?.all().await;
		let targets = self.collection(&spec.target_collection).await?.all().await;
		Ok(relation::inner_join(&sources, &targets, &spec.source_field, &spec.target_field))
	}

	/// `leftJoin` for a named relation.
	pub async fn left_join(&self, relation_name: &str) -> Result<Vec<relation::JoinRow>> {
		let spec = self.require_relation(relation_name).await?;
		let sources = self.collection(&spec.source_collection).await?.all().await;
		let targets = self.collection(&spec.target_collection).await?.all().await;
		Ok(relation::left_join(&sources, &targets, &spec.source_field, &spec.target_field))
	}

	/// `rightJoin` for a named relation.
	pub async fn right_join(&self, relation_name: &str) -> Result<Vec<relation::JoinRow>> {
		let spec = self.require_relation(relation_name).await?;
		let sources = self.collection(&spec.source_collection).await?.all().await;
		let targets = self.collection(&spec.target_collection).await?.all().await;
		Ok(relation::right_join(&sources, &targets, &spec.source_field, &spec.target_field))
	}

	/// `getRelated(sourceRecord)` for a named relation.
	pub async fn get_related(&self, relation_name: &str, source_record: &View) -> Result<Vec<View>> {
		let spec = self.require_relation(relation_name).await?;
		let targets = self.collection(&spec.target_collection).await?.all().await;
		Ok(relation::get_related(source_record, &spec.source_field, &targets, &spec.target_field, spec.cardinality))
	}

	/// Removes `id` from `collection`, first applying the delete policy
	/// of every relation that targets `collection` (
	/// `handleDelete` runs "before the target is actually removed").
	pub async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
		let handle = self.collection(collection).await?;
		let Some(target_view) = handle.get(id).await else {
			return Ok(false);
		};

		let relations: Vec<RelationDefinition> = self
			.inner
			.relations
			.lock()
			.await
			.values()
			.filter(|spec| spec.target_collection == collection)
			.cloned()
			.collect();

		for spec in relations {
			let source_handle = self.collection(&spec.source_collection).await?;
			let sources = source_handle.all().await;
			let target_value = target_view.get(&spec.target_field).cloned().unwrap_or(Value::Text(id.to_string()));
			let plan = relation::plan_delete(&sources, &spec.source_field, &target_value, spec.on_delete);
			match plan {
				DeletePlan::Clear => {}
				DeletePlan::Cascade(ids) => {
					for source_id in ids {
						source_handle.remove(&source_id).await;
					}
				}
				DeletePlan::SetNull(ids) => {
					for source_id in ids {
						let mut patch = HashMap::new();
						patch.insert(spec.source_field.clone(), Value::Null);
						source_handle.update(&source_id, patch).await?;
					}
				}
				DeletePlan::Restrict(count) => {
					return Err(ErrorKind::IntegrityError(count).into());
				}
			}
		}

		Ok(handle.remove(id).await)
	}

	async fn require_relation(&self, name: &str) -> Result<RelationDefinition> {
		self.inner
			.relations
			.lock()
			.await
			.get(name)
			.cloned()
			.ok_or_else(|| ErrorKind::NotFound(format!("relation `{}` is not registered", name)).into())
	}

	/// File path, on-disk size (0 if not yet written), and per-collection
	/// record/index counts for every currently-instantiated collection.
	pub async fn get_health(&self) -> HealthReport {
		let file_size_bytes = tokio::fs::metadata(&self.inner.path).await.map(|meta| meta.len()).unwrap_or(0);

		let collections = self.inner.collections.lock().await;
		let mut report = Vec::with_capacity(collections.len());
		for (name, handle) in collections.iter() {
			let stats: CollectionStats = handle.get_stats().await;
			report.push(CollectionHealth {
				name: name.clone(),
				record_count: stats.record_count,
				index_count: stats.index_count,
			});
		}
		report.sort_by(|a, b| a.name.cmp(&b.name));

		HealthReport {
			path: self.inner.path.clone(),
			file_size_bytes,
			collections: report,
		}
	}
}
