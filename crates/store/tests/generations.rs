//! Generation walk and index maintenance against both drivers.

mod common;

use ballast_core::Generation;
use ballast_store::{FindOpts, IndexValueList, MemoryKv, ObjectStore, SaveOpts, SqliteKv, StoreConfig};
use common::{types, widget, Settings, Widget};
use std::sync::Arc;

fn memory_store() -> ObjectStore {
    ObjectStore::in_memory(types())
}

fn raw_list(store: &ObjectStore, path: &str) -> IndexValueList {
    IndexValueList::unmarshal(&store.get_raw(path).unwrap().expect("index entry present")).unwrap()
}

#[test]
fn first_save_assigns_generation_one() {
    let store = memory_store();
    let mut w = widget("p", "kafka", "stream", 1);
    let changed = store.save(&mut w, SaveOpts::default()).unwrap();
    assert!(changed);
    assert_eq!(w.metadata.generation, Generation(1));

    // lastgen index points at gen 1
    assert_eq!(
        store.get_raw("/index/lastgen/p/widget/kafka").unwrap().as_deref(),
        Some(&b"1"[..])
    );

    // gen 0 reads resolve through the lastgen index
    let found: Widget = store
        .find_one_as("widget", FindOpts::by_key("p/widget/kafka").gen(Generation::EMPTY))
        .unwrap()
        .expect("object found");
    assert_eq!(found, w);
}

#[test]
fn resave_of_identical_object_is_noop() {
    let store = memory_store();
    let mut w = widget("p", "kafka", "stream", 1);
    store.save(&mut w, SaveOpts::default()).unwrap();

    let mut again = widget("p", "kafka", "stream", 1);
    let changed = store.save(&mut again, SaveOpts::default()).unwrap();
    assert!(!changed);
    assert_eq!(again.metadata.generation, Generation(1));

    // exactly one stored version, lastgen unchanged
    let versions = store.range_raw("/object/p/widget/kafka@").unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].0.ends_with("@1"));
    assert_eq!(
        store.get_raw("/index/lastgen/p/widget/kafka").unwrap().as_deref(),
        Some(&b"1"[..])
    );
}

#[test]
fn mutation_bumps_generation_and_moves_listgen() {
    let store = memory_store();
    let mut w = widget("p", "kafka", "stream", 1);
    store.save(&mut w, SaveOpts::default()).unwrap();

    let mut w2 = widget("p", "kafka", "stream", 3);
    let changed = store.save(&mut w2, SaveOpts::default()).unwrap();
    assert!(changed);
    assert_eq!(w2.metadata.generation, Generation(2));
    assert_eq!(
        store.get_raw("/index/lastgen/p/widget/kafka").unwrap().as_deref(),
        Some(&b"2"[..])
    );

    let at_one = raw_list(&store, "/index/listgen/p/widget/kafka/replicas=1");
    assert_eq!(at_one.generations().collect::<Vec<_>>(), vec![Generation(1)]);
    let at_three = raw_list(&store, "/index/listgen/p/widget/kafka/replicas=3");
    assert_eq!(at_three.generations().collect::<Vec<_>>(), vec![Generation(2)]);
}

#[test]
fn find_by_field_with_first_and_last() {
    let store = memory_store();
    for replicas in [1u64, 3, 5] {
        let mut w = widget("p", "kafka", "stream", replicas);
        store.save(&mut w, SaveOpts::default()).unwrap();
    }

    // all three generations share flavor=stream
    let all = store
        .find_list("widget", FindOpts::by_field("p/widget/kafka", "flavor", "stream".into()))
        .unwrap();
    assert_eq!(all.len(), 3);

    let first: Widget = store
        .find_one_as(
            "widget",
            FindOpts::by_field("p/widget/kafka", "flavor", "stream".into()).first(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(first.metadata.generation, Generation(1));
    assert_eq!(first.replicas, 1);

    let last: Widget = store
        .find_one_as(
            "widget",
            FindOpts::by_field("p/widget/kafka", "flavor", "stream".into()).last(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(last.metadata.generation, Generation(3));
    assert_eq!(last.replicas, 5);
}

#[test]
fn find_by_prefix_returns_all_versions_sorted() {
    let store = memory_store();
    for (name, replicas) in [("a", 1u64), ("b", 2)] {
        let mut w = widget("p", name, "stream", replicas);
        store.save(&mut w, SaveOpts::default()).unwrap();
    }
    let objs = store.find_list("widget", FindOpts::by_prefix("p/widget/")).unwrap();
    assert_eq!(objs.len(), 2);
    assert_eq!(objs[0].name(), "a");
    assert_eq!(objs[1].name(), "b");
}

#[test]
fn shape_mismatches_are_rejected() {
    let store = memory_store();
    let err = store.find_one("widget", FindOpts::by_prefix("p/")).unwrap_err();
    assert!(matches!(err, ballast_core::BallastError::ShapeMismatch(_)));
    let err = store.find_list("widget", FindOpts::by_key("p/widget/kafka")).unwrap_err();
    assert!(matches!(err, ballast_core::BallastError::ShapeMismatch(_)));
    let err = store
        .find_list("widget", FindOpts::by_key("p/widget/kafka").gen(Generation(1)).first())
        .unwrap_err();
    assert!(matches!(err, ballast_core::BallastError::Malformed(_)));
}

#[test]
fn replace_or_force_gen_scrubs_displaced_index_entries() {
    let store = memory_store();
    let mut w = widget("p", "kafka", "stream", 1);
    store.save(&mut w, SaveOpts::default()).unwrap();

    // overwrite generation 1 with different indexed values
    let mut forced = widget("p", "kafka", "batch", 9);
    forced.metadata.generation = Generation(1);
    let changed = store.save(&mut forced, SaveOpts::replace()).unwrap();
    assert!(changed);

    // stale entries for the displaced object are gone
    assert!(store.get_raw("/index/listgen/p/widget/kafka/replicas=1").unwrap().is_none());
    assert!(store.get_raw("/index/listgen/p/widget/kafka/flavor=stream").unwrap().is_none());
    let at_nine = raw_list(&store, "/index/listgen/p/widget/kafka/replicas=9");
    assert_eq!(at_nine.generations().collect::<Vec<_>>(), vec![Generation(1)]);

    let read: Widget =
        store.find_one_as("widget", FindOpts::by_key("p/widget/kafka")).unwrap().unwrap();
    assert_eq!(read.flavor, "batch");
}

#[test]
fn replace_without_generation_is_malformed() {
    let store = memory_store();
    let mut w = widget("p", "kafka", "stream", 1);
    let err = store.save(&mut w, SaveOpts::replace()).unwrap_err();
    assert!(matches!(err, ballast_core::BallastError::Malformed(_)));
}

#[test]
fn delete_removes_history_and_indexes() {
    let store = memory_store();
    for replicas in [1u64, 3] {
        let mut w = widget("p", "kafka", "stream", replicas);
        store.save(&mut w, SaveOpts::default()).unwrap();
    }
    store.delete("widget", "p/widget/kafka").unwrap();

    assert!(store.range_raw("/object/p/widget/kafka@").unwrap().is_empty());
    assert!(store.get_raw("/index/lastgen/p/widget/kafka").unwrap().is_none());
    assert!(store.get_raw("/index/listgen/p/widget/kafka/replicas=1").unwrap().is_none());
    assert!(store.get_raw("/index/listgen/p/widget/kafka/flavor=stream").unwrap().is_none());
    assert!(store
        .find_one("widget", FindOpts::by_key("p/widget/kafka"))
        .unwrap()
        .is_none());
}

#[test]
fn non_versioned_kind_is_single_slot() {
    let store = memory_store();
    let mut s = Settings {
        metadata: ballast_core::Metadata::new("settings", "system", "main"),
        body: "a".into(),
    };
    store.save(&mut s, SaveOpts::default()).unwrap();
    s.body = "b".into();
    store.save(&mut s, SaveOpts::default()).unwrap();

    let versions = store.range_raw("/object/system/settings/main@").unwrap();
    assert_eq!(versions.len(), 1);
    let read: Settings =
        store.find_one_as("settings", FindOpts::by_key("system/settings/main")).unwrap().unwrap();
    assert_eq!(read.body, "b");
}

#[test]
fn sqlite_driver_walks_generations_like_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let kv = Arc::new(SqliteKv::open(path.to_str().unwrap()).unwrap());
    let store = ObjectStore::new(kv, types(), StoreConfig::default());

    let mut w = widget("p", "kafka", "stream", 1);
    assert!(store.save(&mut w, SaveOpts::default()).unwrap());
    assert_eq!(w.metadata.generation, Generation(1));

    let mut same = widget("p", "kafka", "stream", 1);
    assert!(!store.save(&mut same, SaveOpts::default()).unwrap());

    let mut bumped = widget("p", "kafka", "stream", 3);
    assert!(store.save(&mut bumped, SaveOpts::default()).unwrap());
    assert_eq!(bumped.metadata.generation, Generation(2));

    let last: Widget =
        store.find_one_as("widget", FindOpts::by_key("p/widget/kafka")).unwrap().unwrap();
    assert_eq!(last.replicas, 3);
}

#[test]
fn store_prefix_applies_to_every_key() {
    let kv = Arc::new(MemoryKv::new());
    let cfg = StoreConfig { prefix: "team-a".into(), ..StoreConfig::default() };
    let store = ObjectStore::new(kv.clone(), types(), cfg);
    let mut w = widget("p", "kafka", "stream", 1);
    store.save(&mut w, SaveOpts::default()).unwrap();

    use ballast_store::KvStore;
    assert!(kv.get("/team-a/object/p/widget/kafka@1").unwrap().is_some());
    assert!(kv.get("/object/p/widget/kafka@1").unwrap().is_none());
}
