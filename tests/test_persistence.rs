use std::fs;
use std::path::Path;

use boxdb::config::DEFAULT_FILE_NAME;
use boxdb::{
    Entity, EntityDef, EntityId, Error, Predicate, PropertyDef, Schema, Store, StoreConfig,
    TypeTag, Value,
};

fn config() -> StoreConfig {
    StoreConfig::new().page_size(1024).sync_on_commit(false)
}

fn note_def() -> EntityDef {
    EntityDef::new("Note")
        .id("id")
        .property(PropertyDef::new("title", TypeTag::String))
        .property(PropertyDef::new("rank", TypeTag::Int))
}

fn schema() -> Schema {
    Schema::new().entity(note_def())
}

fn note(title: &str, rank: i32) -> Entity {
    Entity::new().set("title", title).set("rank", rank)
}

fn open(dir: &Path, schema: &Schema) -> Store {
    Store::open_with_config(dir, schema, config()).unwrap()
}

#[test]
fn test_reopen_keeps_committed_data() {
    let dir = tempfile::tempdir().unwrap();
    let (ids, version) = {
        let store = open(dir.path(), &schema());
        let notes = store.entity_box("Note").unwrap();
        let ids = notes
            .put_many(&[note("first", 1), note("second", 2), note("third", 3)])
            .unwrap();
        notes.remove(ids[1]).unwrap();
        (ids, store.version())
    };

    let store = open(dir.path(), &schema());
    assert_eq!(store.version(), version);
    let notes = store.entity_box("Note").unwrap();
    assert_eq!(notes.count().unwrap(), 2);
    assert!(notes.get(ids[1]).unwrap().is_none());
    assert_eq!(
        notes.get(ids[2]).unwrap().unwrap().get("title"),
        &Value::from("third")
    );

    // Ids keep growing after a reopen.
    let next = notes.put(&note("fourth", 4)).unwrap();
    assert!(next > ids[2]);
}

#[test]
fn test_open_existing_uses_persisted_schema() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), &schema());
        store.entity_box("Note").unwrap().put(&note("kept", 7)).unwrap();
    }

    let store = Store::open_existing(dir.path(), config()).unwrap();
    assert_eq!(store.type_names(), vec!["Note".to_string()]);
    assert_eq!(store.schema(), schema());
    let found = store
        .entity_box("Note")
        .unwrap()
        .query(Predicate::eq("rank", 7))
        .unwrap()
        .find()
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn test_unpublished_commit_is_lost_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (kept, version) = {
        let store = open(dir.path(), &schema());
        let kept = store.entity_box("Note").unwrap().put(&note("kept", 1)).unwrap();
        let version = store.version();

        let mut txn = store.begin_write().unwrap();
        txn.put("Note", &note("lost", 2)).unwrap();
        txn.put("Note", &Entity::with_id(kept).set("title", "changed").set("rank", 9))
            .unwrap();
        txn.commit_without_publish().unwrap();
        (kept, version)
    };

    let store = open(dir.path(), &schema());
    assert_eq!(store.version(), version);
    let notes = store.entity_box("Note").unwrap();
    assert_eq!(notes.count().unwrap(), 1);
    assert_eq!(
        notes.get(kept).unwrap().unwrap().get("title"),
        &Value::from("kept")
    );
    notes.put(&note("after", 3)).unwrap();
    assert_eq!(notes.count().unwrap(), 2);
}

#[test]
fn test_schema_evolution() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), &schema());
        store
            .entity_box("Note")
            .unwrap()
            .put_many(&[note("a", 2), note("b", 1), note("c", 2)])
            .unwrap();
    }

    let evolved = Schema::new()
        .entity(
            EntityDef::new("Note")
                .id("id")
                .property(PropertyDef::new("title", TypeTag::String))
                .property(PropertyDef::new("rank", TypeTag::Int).indexed())
                .property(PropertyDef::new("slug", TypeTag::String).unique()),
        )
        .entity(
            EntityDef::new("Tag")
                .id("id")
                .property(PropertyDef::new("label", TypeTag::String).not_null()),
        );
    let store = open(dir.path(), &evolved);
    assert_eq!(store.type_names().len(), 2);

    let notes = store.entity_box("Note").unwrap();
    let by_rank = notes.query(Predicate::eq("rank", 2)).unwrap();
    assert!(!by_rank.explain().is_full_scan());
    assert_eq!(by_rank.count().unwrap(), 2);

    // Old records read the new property as null.
    assert_eq!(
        notes.query(Predicate::is_null("slug")).unwrap().count().unwrap(),
        3
    );
    notes
        .put(&note("d", 5).set("slug", "d"))
        .unwrap();
    assert!(matches!(
        notes.put(&note("e", 6).set("slug", "d")),
        Err(Error::DuplicateValue { .. })
    ));

    let tags = store.entity_box("Tag").unwrap();
    tags.put(&Entity::new().set("label", "x")).unwrap();
    assert!(matches!(
        tags.put(&Entity::new()),
        Err(Error::NullNotAllowed(_))
    ));

    // Reopening with the same schema changes nothing.
    let version = store.version();
    drop((notes, tags, store));
    let store = open(dir.path(), &evolved);
    assert_eq!(store.version(), version);
}

#[test]
fn test_incompatible_schemas_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    drop(open(dir.path(), &schema()));

    let retyped = Schema::new().entity(
        EntityDef::new("Note")
            .id("id")
            .property(PropertyDef::new("title", TypeTag::String))
            .property(PropertyDef::new("rank", TypeTag::Long)),
    );
    let removed = Schema::new().entity(
        EntityDef::new("Note")
            .id("id")
            .property(PropertyDef::new("title", TypeTag::String)),
    );
    let new_required = Schema::new().entity(
        note_def().property(PropertyDef::new("body", TypeTag::String).not_null()),
    );
    for bad in [retyped, removed, new_required, Schema::new()] {
        let err = Store::open_with_config(dir.path(), &bad, config()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)), "{}", err);
    }

    // The store is untouched by the failed attempts.
    let store = open(dir.path(), &schema());
    assert_eq!(store.schema(), schema());
}

#[test]
fn test_unique_index_over_duplicates_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), &schema());
        store
            .entity_box("Note")
            .unwrap()
            .put_many(&[note("same", 1), note("same", 2)])
            .unwrap();
    }

    let unique_title = Schema::new().entity(
        EntityDef::new("Note")
            .id("id")
            .property(PropertyDef::new("title", TypeTag::String).unique())
            .property(PropertyDef::new("rank", TypeTag::Int)),
    );
    let err = Store::open_with_config(dir.path(), &unique_title, config()).unwrap_err();
    assert!(matches!(err, Error::DuplicateValue { .. }), "{}", err);

    let store = open(dir.path(), &schema());
    assert_eq!(store.entity_box("Note").unwrap().count().unwrap(), 2);
}

#[test]
fn test_directory_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("occupied");
    fs::write(&file, b"not a directory").unwrap();

    let err = Store::open_with_config(file.join("store"), &schema(), config()).unwrap_err();
    assert!(matches!(err, Error::DirectoryUnavailable { .. }), "{}", err);
}

#[test]
fn test_corrupt_page_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let marker = "corruption-marker-".repeat(30);
    let filler = "x".repeat(540);
    let ids = {
        let store = open(dir.path(), &schema());
        // Each record is large enough to need a page of its own.
        store
            .entity_box("Note")
            .unwrap()
            .put_many(&[note(&filler, 1), note(&marker, 2), note(&filler, 3)])
            .unwrap()
    };

    let path = dir.path().join(DEFAULT_FILE_NAME);
    let mut bytes = fs::read(&path).unwrap();
    let offset = bytes
        .windows(marker.len())
        .position(|w| w == marker.as_bytes())
        .unwrap();
    bytes[offset + 5] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let store = open(dir.path(), &schema());
    let notes = store.entity_box("Note").unwrap();
    assert!(matches!(notes.get(ids[1]), Err(Error::CorruptPage(_))));
    assert!(notes.get(ids[0]).unwrap().is_some());
    assert!(notes.get(ids[2]).unwrap().is_some());
    assert!(matches!(notes.all(), Err(Error::CorruptPage(_))));
}

#[test]
fn test_store_full() {
    let store = Store::in_memory_with_config(&schema(), config().max_pages(12)).unwrap();
    let notes = store.entity_box("Note").unwrap();
    let blob = "y".repeat(500);

    let mut stored = 0;
    let err = loop {
        match notes.put(&note(&blob, stored)) {
            Ok(_) => stored += 1,
            Err(e) => break e,
        }
        assert!(stored < 100, "store never filled up");
    };
    assert!(matches!(err, Error::StoreFull(_)), "{}", err);

    // The failed commit left nothing behind.
    assert_eq!(notes.count().unwrap(), stored as usize);
    assert_eq!(store.stats().allocator.in_flight, 0);
    assert_eq!(
        notes.query(Predicate::eq("rank", 0)).unwrap().count().unwrap(),
        1
    );
}

#[test]
fn test_compaction_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (kept, version) = {
        let store = open(dir.path(), &schema());
        let notes = store.entity_box("Note").unwrap();
        let entities: Vec<Entity> = (0..40).map(|i| note(&format!("note {}", i), i)).collect();
        let ids = notes.put_many(&entities).unwrap();
        let kept: Vec<EntityId> = ids.iter().copied().step_by(5).collect();
        store
            .run_in_write(|txn| {
                for id in ids.iter().filter(|id| !kept.contains(id)) {
                    txn.remove("Note", *id)?;
                }
                Ok(())
            })
            .unwrap();

        let stats = store.compact_with_threshold(0.9).unwrap();
        assert!(stats.sparse_pages > 0);
        assert!(stats.records_moved > 0);
        assert_eq!(notes.count().unwrap(), kept.len());
        (kept, store.version())
    };

    let store = open(dir.path(), &schema());
    assert_eq!(store.version(), version);
    let notes = store.entity_box("Note").unwrap();
    let found: Vec<EntityId> = notes.all().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(found, kept);
    for id in kept {
        assert!(notes.get(id).unwrap().is_some());
    }
}
