//! End-to-end scenarios exercised purely through the public API, as an
//! external consumer would.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use modb::{Cardinality, DeletePolicy, ErrorKind, FieldDefinition, IndexDefinition, Kind, OpenOptions, RelationDefinition, Schema, Storage, Value};

fn users_schema() -> Schema {
	Schema::new(vec![
		FieldDefinition::new("name", Kind::Text).required(),
		FieldDefinition::new("email", Kind::Text).unique().required(),
		FieldDefinition::new("age", Kind::Real).indexed(),
	])
	.unwrap()
}

fn posts_schema() -> Schema {
	Schema::new(vec![
		FieldDefinition::new("userId", Kind::Text)
			.indexed()
			.relation("users", Cardinality::ManyToOne, DeletePolicy::Cascade),
		FieldDefinition::new("title", Kind::Text),
	])
	.unwrap()
}

fn assignment(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
	pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Installs a `fmt` subscriber gated by `RUST_LOG`, so a failing test's
/// `trace!`/`debug!` spans show up. Safe to call from every test; only
/// the first call actually installs anything.
fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn text(view: &HashMap<String, Value>, field: &str) -> String {
	match view.get(field) {
		Some(Value::Text(s)) => s.clone(),
		other => panic!("expected text field `{}`, found {:?}", field, other),
	}
}

fn open_memory(schemas: Vec<(&str, Schema)>) -> Storage {
	Storage::open(
		schemas.into_iter().map(|(name, schema)| (name.to_string(), schema)).collect(),
		OpenOptions {
			persist: false,
			auto_commit: false,
			filepath: None,
		},
	)
}

/// Scenario 1: unique/indexed fields, `findByField`, `findByRange`, and
/// a rejected duplicate leaving collection size unchanged.
#[tokio::test]
async fn scenario_1_unique_and_range_lookups() {
	init_tracing();
	let storage = open_memory(vec![("users", users_schema())]);
	let users = storage.collection("users").await.unwrap();

	users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	users
		.insert(assignment(&[("name", Value::Text("Bob".into())), ("email", Value::Text("b@x".into())), ("age", Value::Real(32.0))]))
		.await
		.unwrap();

	let found = users.find_by_field("email", &Value::Text("a@x".into())).await.unwrap();
	assert_eq!(text(&found, "name"), "Alice");

	let in_range = users.find_by_range("age", &Value::Real(18.0), &Value::Real(30.0)).await.unwrap();
	assert_eq!(in_range.len(), 1);
	assert_eq!(text(&in_range[0], "name"), "Alice");

	let err = users
		.insert(assignment(&[("name", Value::Text("Eve".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(40.0))]))
		.await
		.unwrap_err();
	assert!(matches!(err.0, ErrorKind::UniqueViolation(ref index, ref value) if index == "email_idx" && value == "a@x"));
	assert_eq!(users.all().await.len(), 2);
}

/// Scenario 2: a `many-to-one` / `cascade` relation — inner join sees
/// every post, and removing its author cascades the delete.
#[tokio::test]
async fn scenario_2_cascade_relation_and_inner_join() {
	init_tracing();
	let storage = open_memory(vec![("users", users_schema()), ("posts", posts_schema())]);
	let users = storage.collection("users").await.unwrap();
	let posts = storage.collection("posts").await.unwrap();

	let alice = users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	let bob = users
		.insert(assignment(&[("name", Value::Text("Bob".into())), ("email", Value::Text("b@x".into())), ("age", Value::Real(32.0))]))
		.await
		.unwrap();
	let alice_id = text(&alice, "id");
	let bob_id = text(&bob, "id");

	posts.insert(assignment(&[("userId", Value::Text(alice_id.clone())), ("title", Value::Text("p1".into()))])).await.unwrap();
	posts.insert(assignment(&[("userId", Value::Text(alice_id.clone())), ("title", Value::Text("p2".into()))])).await.unwrap();
	posts.insert(assignment(&[("userId", Value::Text(bob_id.clone())), ("title", Value::Text("p3".into()))])).await.unwrap();

	storage
		.define_relation(RelationDefinition {
			name: "posts_userId_users".into(),
			source_collection: "posts".into(),
			target_collection: "users".into(),
			source_field: "userId".into(),
			target_field: "id".into(),
			cardinality: Cardinality::ManyToOne,
			on_delete: DeletePolicy::Cascade,
		})
		.await
		.unwrap();

	let joined = storage.inner_join("posts_userId_users").await.unwrap();
	assert_eq!(joined.len(), 3);

	assert!(storage.remove("users", &alice_id).await.unwrap());

	let remaining = posts.all().await;
	assert_eq!(remaining.len(), 1);
	assert_eq!(text(&remaining[0], "title"), "p3");
}

/// Scenario 3: `commitAll()` then a fresh manager on the same file sees
/// byte-equal multisets of records.
#[tokio::test]
async fn scenario_3_commit_then_reopen_preserves_multisets() {
	init_tracing();
	let dir = tempdir().unwrap();
	let path = dir.path().join("database.mdb");

	let storage = Storage::open(
		vec![("users".to_string(), users_schema()), ("posts".to_string(), posts_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path.clone()),
		},
	);
	let users = storage.collection("users").await.unwrap();
	let posts = storage.collection("posts").await.unwrap();

	let alice = users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	users
		.insert(assignment(&[("name", Value::Text("Bob".into())), ("email", Value::Text("b@x".into())), ("age", Value::Real(32.0))]))
		.await
		.unwrap();
	let alice_id = text(&alice, "id");
	posts.insert(assignment(&[("userId", Value::Text(alice_id)), ("title", Value::Text("p1".into()))])).await.unwrap();

	storage.commit_all().await.unwrap();

	let reopened = Storage::open(
		vec![("users".to_string(), users_schema()), ("posts".to_string(), posts_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path),
		},
	);
	reopened.initialize().await.unwrap();

	let mut before_users: Vec<String> = users.all().await.iter().map(|v| text(v, "name")).collect();
	let mut after_users: Vec<String> = reopened.collection("users").await.unwrap().all().await.iter().map(|v| text(v, "name")).collect();
	before_users.sort();
	after_users.sort();
	assert_eq!(before_users, after_users);

	assert_eq!(reopened.collection("posts").await.unwrap().all().await.len(), 1);
}

/// Scenario 5: creating a unique index against data that already
/// violates uniqueness fails and the index is not retained.
#[tokio::test]
async fn scenario_5_create_unique_index_against_existing_duplicates() {
	init_tracing();
	let storage = open_memory(vec![("users", users_schema())]);
	let users = storage.collection("users").await.unwrap();

	users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	users
		.insert(assignment(&[("name", Value::Text("Carol".into())), ("email", Value::Text("c@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();

	let err = users
		.create_index(IndexDefinition {
			name: "age_dup".into(),
			field: "age".into(),
			unique: true,
		})
		.await
		.unwrap_err();
	assert!(matches!(err.0, ErrorKind::UniqueViolation(_, _)));
	assert!(users.list_indexes().await.iter().all(|i| i.name != "age_dup"));

	users
		.insert(assignment(&[("name", Value::Text("Dave".into())), ("email", Value::Text("d@x".into())), ("age", Value::Real(50.0))]))
		.await
		.unwrap();
	users
		.create_index(IndexDefinition {
			name: "age_dup2".into(),
			field: "age".into(),
			unique: false,
		})
		.await
		.unwrap();
	assert!(users.list_indexes().await.iter().any(|i| i.name == "age_dup2"));
}

/// Scenario 6: a corrupted container file raises `FormatError` on
/// `initialize()`, leaves in-memory state empty, and a later commit
/// overwrites the bad file.
#[tokio::test]
async fn scenario_6_corrupted_file_recovers_on_next_commit() {
	init_tracing();
	let dir = tempdir().unwrap();
	let path = dir.path().join("database.mdb");
	tokio::fs::write(&path, b"definitely not a modb container").await.unwrap();

	let storage = Storage::open(
		vec![("users".to_string(), users_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path.clone()),
		},
	);
	let err = storage.initialize().await.unwrap_err();
	assert!(matches!(err.0, ErrorKind::FormatError(_, _)));

	let users = storage.collection("users").await.unwrap();
	assert_eq!(users.all().await.len(), 0);

	users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	storage.commit_all().await.unwrap();

	let reopened = Storage::open(
		vec![("users".to_string(), users_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path),
		},
	);
	reopened.initialize().await.unwrap();
	assert_eq!(reopened.collection("users").await.unwrap().all().await.len(), 1);
}

/// Auto-commit coalesces several rapid modifications into a single
/// rewrite: the file only appears after the quiet period, and holds
/// every insert made during the burst.
#[tokio::test]
async fn auto_commit_coalesces_a_burst_of_inserts() {
	init_tracing();
	let dir = tempdir().unwrap();
	let path = dir.path().join("database.mdb");

	let storage = Storage::open(
		vec![("users".to_string(), users_schema())],
		OpenOptions {
			persist: true,
			auto_commit: true,
			filepath: Some(path.clone()),
		},
	);
	let users = storage.collection("users").await.unwrap();
	assert!(tokio::fs::metadata(&path).await.is_err());

	for i in 0..5 {
		users
			.insert(assignment(&[("name", Value::Text(format!("user{}", i))), ("email", Value::Text(format!("u{}@x", i))), ("age", Value::Real(20.0))]))
			.await
			.unwrap();
	}

	tokio::time::sleep(std::time::Duration::from_millis(300)).await;
	assert!(tokio::fs::metadata(&path).await.is_ok());

	let reopened = Storage::open(
		vec![("users".to_string(), users_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path),
		},
	);
	reopened.initialize().await.unwrap();
	assert_eq!(reopened.collection("users").await.unwrap().all().await.len(), 5);
}

/// A `restrict` relation refuses the delete and leaves both collections
/// untouched; a `set-null` relation nulls out the foreign key instead
/// of removing the row.
#[tokio::test]
async fn restrict_and_set_null_delete_policies() {
	init_tracing();
	let storage = open_memory(vec![("users", users_schema()), ("posts", posts_schema())]);
	let users = storage.collection("users").await.unwrap();
	let posts = storage.collection("posts").await.unwrap();

	let alice = users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	let alice_id = text(&alice, "id");
	let post = posts.insert(assignment(&[("userId", Value::Text(alice_id.clone())), ("title", Value::Text("p1".into()))])).await.unwrap();
	let post_id = text(&post, "id");

	storage
		.define_relation(RelationDefinition {
			name: "posts_userId_users".into(),
			source_collection: "posts".into(),
			target_collection: "users".into(),
			source_field: "userId".into(),
			target_field: "id".into(),
			cardinality: Cardinality::ManyToOne,
			on_delete: DeletePolicy::Restrict,
		})
		.await
		.unwrap();

	let err = storage.remove("users", &alice_id).await.unwrap_err();
	assert!(matches!(err.0, ErrorKind::IntegrityError(1)));
	assert_eq!(users.all().await.len(), 1);
	assert_eq!(posts.all().await.len(), 1);

	storage.define_relation(RelationDefinition {
		name: "posts_userId_users".into(),
		source_collection: "posts".into(),
		target_collection: "users".into(),
		source_field: "userId".into(),
		target_field: "id".into(),
		cardinality: Cardinality::ManyToOne,
		on_delete: DeletePolicy::SetNull,
	})
	.await
	.unwrap();

	assert!(storage.remove("users", &alice_id).await.unwrap());
	let survivor = posts.get(&post_id).await.unwrap();
	assert_eq!(survivor.get("userId"), Some(&Value::Null));
}

/// Boundary behaviors: empty collection `all`, `findByRange` on an
/// empty index, id-collision retry, and nulls never indexed.
#[tokio::test]
async fn boundary_behaviors() {
	init_tracing();
	let storage = open_memory(vec![("users", users_schema())]);
	let users = storage.collection("users").await.unwrap();

	assert!(users.all().await.is_empty());
	assert_eq!(users.find_by_range("age", &Value::Real(0.0), &Value::Real(100.0)).await.unwrap().len(), 0);

	let view = users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into()))]))
		.await
		.unwrap();
	assert_eq!(view.get("age"), Some(&Value::Null));
	assert!(users.find_by_field("age", &Value::Null).await.is_none());

	let removed_id = text(&view, "id");
	assert!(users.remove(&removed_id).await);
	assert!(users.find_by_field("email", &Value::Text("a@x".into())).await.is_none());
	assert!(users.all().await.is_empty());
}

/// `getHealth` reports the file path, on-disk size, and per-collection
/// counts after a commit.
#[tokio::test]
async fn get_health_reports_counts_after_commit() {
	init_tracing();
	let dir = tempdir().unwrap();
	let path = dir.path().join("database.mdb");
	let storage = Storage::open(
		vec![("users".to_string(), users_schema())],
		OpenOptions {
			persist: true,
			auto_commit: false,
			filepath: Some(path.clone()),
		},
	);
	let users = storage.collection("users").await.unwrap();
	users
		.insert(assignment(&[("name", Value::Text("Alice".into())), ("email", Value::Text("a@x".into())), ("age", Value::Real(28.0))]))
		.await
		.unwrap();
	storage.commit_all().await.unwrap();

	let health = storage.get_health().await;
	assert_eq!(health.path, path);
	assert!(health.file_size_bytes > 0);
	let users_health = health.collections.iter().find(|c| c.name == "users").unwrap();
	assert_eq!(users_health.record_count, 1);
	assert!(users_health.index_count >= 2);
}
