//! Rename Propagation Tests
//!
//! `@class` writes diff the prior and new class documents; detected
//! renames rewrite all existing data:
//! - a key rename moves every record's value to the new key
//! - a class id rename moves every record to the new home
//! - a type change is delete-plus-create, never a rename

use std::sync::Arc;

use metastore::core::{Id, Record, SecurityContext};
use metastore::engine::Engine;
use metastore::schema::{ClassDef, PropDef, SchemaRegistry, CLASS};
use metastore::storage::{FileBackend, StorageBackend};
use serde_json::json;
use tempfile::TempDir;

fn setup() -> (TempDir, Engine) {
    let tmp = TempDir::new().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(tmp.path()).unwrap());
    let registry = Arc::new(SchemaRegistry::new(backend));
    (tmp, Engine::new(registry))
}

fn user_class_with(props: Vec<PropDef>) -> Record {
    ClassDef::new("user", "User").with_props(props).to_record()
}

async fn seed_users(engine: &Engine, ctx: &SecurityContext) -> Vec<Id> {
    let mut ids = Vec::new();
    for name in ["A", "B"] {
        let input = Record::from_value(json!({
            "class_id": "user",
            "name": name,
            "email": format!("{}@x.co", name)
        }))
        .unwrap();
        ids.push(
            engine
                .set_object("user", input, ctx)
                .await
                .unwrap()
                .id
                .unwrap(),
        );
    }
    ids
}

// =============================================================================
// Property Renames
// =============================================================================

/// Scenario: replace `email` with `email_address` (same type).
/// Every stored record shows the value under the new key only.
#[tokio::test]
async fn test_prop_rename_rewrites_every_record() {
    let (_tmp, engine) = setup();
    let admin = SecurityContext::system();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("email").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let ctx = SecurityContext::for_user("u1");
    let ids = seed_users(&engine, &ctx).await;

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("email_address").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    for id in &ids {
        let record = engine.get_object("user", id, &ctx).await.unwrap().unwrap();
        assert!(record.get("email").is_none());
        let value = record.get("email_address").unwrap().as_str().unwrap();
        assert!(value.ends_with("@x.co"));
    }
}

/// rename a→b then b→a is the identity on all records.
#[tokio::test]
async fn test_prop_rename_roundtrip_is_identity() {
    let (_tmp, engine) = setup();
    let admin = SecurityContext::system();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("email").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let ctx = SecurityContext::for_user("u1");
    let ids = seed_users(&engine, &ctx).await;
    let before: Vec<_> = {
        let mut records = Vec::new();
        for id in &ids {
            records.push(engine.get_object("user", id, &ctx).await.unwrap().unwrap());
        }
        records
    };

    for key in ["mail", "email"] {
        engine
            .set_object(
                CLASS,
                user_class_with(vec![
                    PropDef::string("name").required().order(1),
                    PropDef::string(key).order(2),
                ]),
                &admin,
            )
            .await
            .unwrap();
    }

    for (id, original) in ids.iter().zip(before) {
        let record = engine.get_object("user", id, &ctx).await.unwrap().unwrap();
        assert_eq!(record.get("email"), original.get("email"));
        assert!(record.get("mail").is_none());
    }
}

/// A type change disqualifies the match: the old key's data is left
/// behind as deleted, not migrated.
#[tokio::test]
async fn test_type_change_is_not_a_rename() {
    let (_tmp, engine) = setup();
    let admin = SecurityContext::system();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("age").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let ctx = SecurityContext::for_user("u1");
    let input = Record::from_value(
        json!({"class_id": "user", "name": "A", "age": "30"}),
    )
    .unwrap();
    let stored = engine.set_object("user", input, &ctx).await.unwrap();
    let id = stored.id.unwrap();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::integer("years").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let record = engine.get_object("user", &id, &ctx).await.unwrap().unwrap();
    // conservative: no value migration across types; the old key's
    // data is left in place as undeclared residue
    assert!(record.get("years").is_none());
    assert_eq!(record.get("age"), Some(&json!("30")));
}

// =============================================================================
// Class Renames
// =============================================================================

/// Scenario: the class id changes; every record becomes fetchable
/// under the new id and unfetchable under the old.
#[tokio::test]
async fn test_class_rename_moves_all_records() {
    let (_tmp, engine) = setup();
    let admin = SecurityContext::system();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("email").order(2),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let ctx = SecurityContext::for_user("u1");
    let ids = seed_users(&engine, &ctx).await;

    let renamed = ClassDef::new("person", "User")
        .with_props(vec![
            PropDef::string("name").required().order(1),
            PropDef::string("email").order(2),
        ])
        .to_record();
    engine
        .set_object_at(CLASS, renamed, Some(Id::Str("user".into())), &admin)
        .await
        .unwrap();

    for id in &ids {
        assert!(engine.get_object("user", id, &ctx).await.unwrap().is_none());
        let moved = engine.get_object("person", id, &ctx).await.unwrap().unwrap();
        assert_eq!(moved.class_id, "person");
    }

    // the schema followed the data
    assert!(engine.registry().get_class("user").await.unwrap().is_none());
    assert!(engine.registry().get_class("person").await.unwrap().is_some());
}

/// Two same-typed adds and removes pair first-by-insertion.
#[tokio::test]
async fn test_simultaneous_renames_pair_in_order() {
    let (_tmp, engine) = setup();
    let admin = SecurityContext::system();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("first").order(2),
                PropDef::string("second").order(3),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let ctx = SecurityContext::for_user("u1");
    let input = Record::from_value(json!({
        "class_id": "user", "name": "A", "first": "1", "second": "2"
    }))
    .unwrap();
    let stored = engine.set_object("user", input, &ctx).await.unwrap();
    let id = stored.id.unwrap();

    engine
        .set_object(
            CLASS,
            user_class_with(vec![
                PropDef::string("name").required().order(1),
                PropDef::string("alpha").order(2),
                PropDef::string("beta").order(3),
            ]),
            &admin,
        )
        .await
        .unwrap();

    let record = engine.get_object("user", &id, &ctx).await.unwrap().unwrap();
    assert_eq!(record.get("alpha"), Some(&json!("1")));
    assert_eq!(record.get("beta"), Some(&json!("2")));
    assert!(record.get("first").is_none());
    assert!(record.get("second").is_none());
}
