use boxdb::query::{parse_query, Plan};
use boxdb::{
    CancellationToken, Entity, EntityDef, EntityId, Error, OrderKey, Predicate, PropertyDef,
    Schema, Store, StoreConfig, TypeTag, Value,
};

fn schema() -> Schema {
    Schema::new().entity(
        EntityDef::new("Person")
            .id("id")
            .property(PropertyDef::new("name", TypeTag::String))
            .property(PropertyDef::new("age", TypeTag::Int).indexed())
            .property(PropertyDef::new("score", TypeTag::Double))
            .property(PropertyDef::new("city", TypeTag::String).indexed()),
    )
}

fn store_with(people: &[(&str, i32, Option<&str>)]) -> (Store, Vec<EntityId>) {
    let store =
        Store::in_memory_with_config(&schema(), StoreConfig::new().page_size(1024)).unwrap();
    let entities: Vec<Entity> = people
        .iter()
        .map(|(name, age, city)| {
            Entity::new()
                .set("name", *name)
                .set("age", *age)
                .set("score", f64::from(*age) / 2.0)
                .set("city", city.map(str::to_string))
        })
        .collect();
    let ids = store.entity_box("Person").unwrap().put_many(&entities).unwrap();
    (store, ids)
}

fn ages(entities: &[Entity]) -> Vec<i64> {
    entities
        .iter()
        .filter_map(|e| e.get("age").as_i64())
        .collect()
}

#[test]
fn test_age_range_ascending() {
    let (store, _) = store_with(&[
        ("d", 20, None),
        ("a", 5, None),
        ("c", 15, None),
        ("b", 10, None),
    ]);
    let people = store.entity_box("Person").unwrap();

    let query = people
        .query(Predicate::ge("age", 10).and(Predicate::lt("age", 20)))
        .unwrap()
        .order_by("age");
    assert_eq!(ages(&query.find().unwrap()), vec![10, 15]);

    let parsed = Predicate::parse("age >= 10 and age < 20").unwrap();
    let query = people.query(parsed).unwrap().order_by("age");
    assert_eq!(ages(&query.find().unwrap()), vec![10, 15]);
}

#[test]
fn test_unordered_results_in_id_order() {
    let (store, ids) = store_with(&[
        ("x", 30, Some("oslo")),
        ("y", 10, Some("rome")),
        ("z", 20, Some("oslo")),
    ]);
    let people = store.entity_box("Person").unwrap();

    let found = people.query(Predicate::gt("age", 0)).unwrap().find_ids().unwrap();
    assert_eq!(found, ids);

    let in_oslo = people
        .query(Predicate::eq("city", "oslo"))
        .unwrap()
        .find_ids()
        .unwrap();
    assert_eq!(in_oslo, vec![ids[0], ids[2]]);
}

#[test]
fn test_plans() {
    let (store, ids) = store_with(&[("x", 1, None)]);
    let people = store.entity_box("Person").unwrap();

    let plan = people.query(Predicate::eq("age", 1)).unwrap().explain();
    assert!(matches!(plan, Plan::IndexEq { .. }));

    let plan = people
        .query(Predicate::eq("city", "a").or(Predicate::lt("age", 3)))
        .unwrap()
        .explain();
    assert!(matches!(plan, Plan::Union(_)));

    let plan = people
        .query(Predicate::contains("name", "x"))
        .unwrap()
        .explain();
    assert_eq!(plan, Plan::FullScan);

    let by_id = people.query(Predicate::eq("id", ids[0].get() as i64)).unwrap();
    assert!(matches!(by_id.explain(), Plan::IdRange { .. }));
    assert_eq!(by_id.find_ids().unwrap(), vec![ids[0]]);
}

#[test]
fn test_null_semantics() {
    let (store, ids) = store_with(&[("a", 1, Some("oslo")), ("b", 2, None)]);
    let people = store.entity_box("Person").unwrap();

    let count = |p: Predicate| people.query(p).unwrap().count().unwrap();
    assert_eq!(count(Predicate::is_null("city")), 1);
    assert_eq!(count(Predicate::is_not_null("city")), 1);
    // Comparisons never match null, not even `!=`.
    assert_eq!(count(Predicate::not_eq("city", "oslo")), 0);
    assert_eq!(count(Predicate::not_eq("city", "oslo").not()), 2);

    let nulls_first = people.query_all().unwrap().order_by("city").find_ids().unwrap();
    assert_eq!(nulls_first, vec![ids[1], ids[0]]);
    let nulls_last = people
        .query_all()
        .unwrap()
        .order_by_desc("city")
        .find_ids()
        .unwrap();
    assert_eq!(nulls_last, vec![ids[0], ids[1]]);
}

#[test]
fn test_ordering_ties_limit_offset() {
    let (store, ids) = store_with(&[
        ("a", 3, None),
        ("b", 1, None),
        ("c", 3, None),
        ("d", 2, None),
        ("e", 3, None),
    ]);
    let people = store.entity_box("Person").unwrap();

    let desc = people.query_all().unwrap().order_by_desc("age");
    assert_eq!(
        desc.find_ids().unwrap(),
        vec![ids[0], ids[2], ids[4], ids[3], ids[1]]
    );

    let page = people
        .query_all()
        .unwrap()
        .order(OrderKey::desc("age"))
        .offset(1)
        .limit(3);
    assert_eq!(page.find_ids().unwrap(), vec![ids[2], ids[4], ids[3]]);
    // Count ignores paging.
    assert_eq!(page.count().unwrap(), 5);

    let unordered = people.query_all().unwrap().offset(3).limit(10);
    assert_eq!(unordered.find_ids().unwrap(), vec![ids[3], ids[4]]);
}

#[test]
fn test_text_predicates() {
    let (store, _) = store_with(&[("Alice", 1, None), ("bob", 2, None), ("ALINA", 3, None)]);
    let people = store.entity_box("Person").unwrap();

    let names = |p: Predicate| -> Vec<Value> {
        people
            .query(p)
            .unwrap()
            .property_values("name")
            .unwrap()
    };
    assert_eq!(names(Predicate::starts_with("name", "Al")), vec![Value::from("Alice")]);
    assert_eq!(
        names(Predicate::starts_with("name", "al").case_insensitive()),
        vec![Value::from("Alice"), Value::from("ALINA")]
    );
    assert_eq!(names(Predicate::ends_with("name", "b")), vec![Value::from("bob")]);
    assert_eq!(
        names(Predicate::contains("name", "LI").case_insensitive()).len(),
        2
    );
}

#[test]
fn test_in_and_between() {
    let (store, _) = store_with(&[("a", 1, None), ("b", 2, None), ("c", 3, None), ("d", 4, None)]);
    let people = store.entity_box("Person").unwrap();

    let found = people
        .query(Predicate::in_values("age", [4, 1, 9]))
        .unwrap()
        .find()
        .unwrap();
    assert_eq!(ages(&found), vec![1, 4]);

    let found = people
        .query(Predicate::between("score", 1.0, 1.5))
        .unwrap()
        .find()
        .unwrap();
    assert_eq!(ages(&found), vec![2, 3]);

    let empty = people.query(Predicate::between("age", 3, 2)).unwrap();
    assert_eq!(empty.count().unwrap(), 0);
}

#[test]
fn test_invalid_predicates() {
    let (store, _) = store_with(&[]);
    let people = store.entity_box("Person").unwrap();

    for predicate in [
        Predicate::eq("height", 3),
        Predicate::eq("age", "ten"),
        Predicate::eq("age", 1i64 << 40),
        Predicate::starts_with("age", "1"),
        Predicate::eq("name", Value::Null),
    ] {
        assert!(
            matches!(people.query(predicate.clone()), Err(Error::InvalidPredicate(_))),
            "{}",
            predicate
        );
    }
    assert!(matches!(
        people.query_all().unwrap().order_by("height").find(),
        Err(Error::InvalidPredicate(_))
    ));
}

#[test]
fn test_cancelled_query() {
    let people: Vec<(&str, i32, Option<&str>)> = (0..50).map(|i| ("p", i, None)).collect();
    let (store, _) = store_with(&people);
    let token = CancellationToken::new();
    let query = store
        .entity_box("Person")
        .unwrap()
        .query_all()
        .unwrap()
        .with_cancellation(token.clone());

    let mut seen = 0;
    let mut cancelled = false;
    for entity in query.iter().unwrap() {
        match entity {
            Ok(_) => {
                seen += 1;
                if seen == 10 {
                    token.cancel();
                }
            }
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(seen, 10);
    assert!(cancelled);
    let filtered = store
        .entity_box("Person")
        .unwrap()
        .query(Predicate::ge("age", 0))
        .unwrap()
        .with_cancellation(token);
    assert!(matches!(filtered.count(), Err(Error::Cancelled)));
}

#[test]
fn test_iterator_restarts_on_same_snapshot() {
    let (store, _) = store_with(&[("a", 1, None), ("b", 2, None)]);
    let people = store.entity_box("Person").unwrap();

    let read = store.begin_read();
    let read_box = read.entity_box("Person").unwrap();
    let query = read_box.query_all().unwrap();
    let mut iter = query.iter().unwrap();
    assert_eq!(iter.by_ref().count(), 2);

    people.put(&Entity::new().set("name", "c").set("age", 3)).unwrap();
    iter.restart();
    assert_eq!(iter.count(), 2);
    assert_eq!(people.query_all().unwrap().count().unwrap(), 3);
}

#[test]
fn test_remove_by_query() {
    let (store, _) = store_with(&[("a", 1, None), ("b", 2, None), ("c", 3, None)]);
    let people = store.entity_box("Person").unwrap();

    let removed = people.query(Predicate::le("age", 2)).unwrap().remove().unwrap();
    assert_eq!(removed, 2);
    assert_eq!(ages(&people.all().unwrap()), vec![3]);

    let mut txn = store.begin_write().unwrap();
    {
        let mut tx_box = txn.entity_box("Person").unwrap();
        tx_box.put(&Entity::new().set("name", "d").set("age", 4)).unwrap();
        let removed = tx_box.query(Predicate::ge("age", 3)).unwrap().remove().unwrap();
        assert_eq!(removed, 2);
        assert!(tx_box.is_empty());
    }
    txn.commit().unwrap();
    assert!(people.is_empty().unwrap());
}

#[test]
fn test_parsed_query_clauses() {
    let (store, ids) = store_with(&[
        ("ann", 31, Some("oslo")),
        ("al", 45, None),
        ("bo", 38, Some("rome")),
        ("amy", 29, Some("oslo")),
    ]);
    let people = store.entity_box("Person").unwrap();

    let parsed =
        parse_query("age >= 30 and (name startswith \"a\" or city is null) order by age desc limit 5")
            .unwrap();
    let mut query = people.query(parsed.predicate.unwrap()).unwrap();
    for key in parsed.order {
        query = query.order(key);
    }
    let query = query.limit(parsed.limit.unwrap());
    assert_eq!(query.find_ids().unwrap(), vec![ids[1], ids[0]]);
}
