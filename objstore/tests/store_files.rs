use std::fs::{self, create_dir_all, remove_dir_all};
use std::path::PathBuf;

use rand::{rngs::StdRng, Rng, SeedableRng};

use objstore::{ObjectKey, ObjectStore, StoreConfig, StoreError};

fn key(t: i32, i: i32) -> ObjectKey {
    ObjectKey::new(t, i)
}

fn test_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!("/tmp/objstore-test/{}", name));
    remove_dir_all(&dir).unwrap_or(());
    create_dir_all(&dir).unwrap();
    dir
}

/// keys with parents and attributes, enough to call two stores isomorphic
fn snapshot(store: &mut ObjectStore) -> Vec<(ObjectKey, Option<ObjectKey>, Vec<(i32, Vec<u8>)>)> {
    let mut keys = store.descendants(ObjectKey::ROOT).unwrap();
    keys.push(ObjectKey::ROOT);
    keys.sort_by_key(|k| (k.object_type, k.object_instance));
    keys.into_iter()
        .map(|k| {
            let attrs = store
                .attribute_ids(k)
                .unwrap()
                .into_iter()
                .map(|id| (id, store.attribute_get(k, id).unwrap().to_vec()))
                .collect();
            (k, store.parent_of(k).unwrap(), attrs)
        })
        .collect()
}

#[test]
fn round_trip_two_objects() {
    let dir = test_dir("two-objects");
    let mut store = ObjectStore::new(StoreConfig::with_id(1)).unwrap();
    store.create(ObjectKey::ROOT, key(1, 1)).unwrap();
    store.create(key(1, 1), key(2, 1)).unwrap();
    store.attribute_set(key(1, 1), 5, &[1, 2, 3]).unwrap();
    store.attribute_set(key(2, 1), 5, &[1, 2, 3]).unwrap();
    store.save(&dir).unwrap();

    let mut loaded = ObjectStore::new(StoreConfig::with_id(1)).unwrap();
    loaded.load(&dir).unwrap();
    assert_eq!(snapshot(&mut loaded), snapshot(&mut store));
    assert_eq!(loaded.parent_of(key(2, 1)).unwrap(), Some(key(1, 1)));
    assert_eq!(loaded.attribute_get(key(2, 1), 5).unwrap(), &[1, 2, 3]);

    remove_dir_all(&dir).unwrap();
}

#[test]
fn round_trip_random_forest() {
    let dir = test_dir("random-forest");
    let mut rng = StdRng::seed_from_u64(42);
    let mut store = ObjectStore::new(StoreConfig::with_id(2)).unwrap();

    let mut known = vec![ObjectKey::ROOT];
    for i in 1..=300 {
        let parent = known[rng.gen_range(0..known.len())];
        let k = key(rng.gen_range(1..10), i);
        store.create(parent, k).unwrap();
        known.push(k);
        for _ in 0..rng.gen_range(0..4) {
            let id = rng.gen_range(0..20);
            let len = rng.gen_range(0..12);
            let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            store.attribute_set(k, id, &value).unwrap();
        }
    }
    // root attributes round-trip too
    store.attribute_set(ObjectKey::ROOT, 1, &[7; 8]).unwrap();
    store.save(&dir).unwrap();

    let mut loaded = ObjectStore::new(StoreConfig::with_id(2)).unwrap();
    loaded.load(&dir).unwrap();
    assert_eq!(snapshot(&mut loaded), snapshot(&mut store));

    // a second generation proves the walk order never mattered
    loaded.save(&dir).unwrap();
    let mut second = ObjectStore::new(StoreConfig::with_id(2)).unwrap();
    second.load(&dir).unwrap();
    assert_eq!(snapshot(&mut second), snapshot(&mut store));

    remove_dir_all(&dir).unwrap();
}

#[test]
fn simple_values_survive_as_integers() {
    let dir = test_dir("simple-values");
    let mut store = ObjectStore::new(StoreConfig::with_id(3)).unwrap();
    store.create(ObjectKey::ROOT, key(1, 1)).unwrap();
    store.attribute_set_simple(key(1, 1), 2, -99).unwrap();
    store.attribute_set(key(1, 1), 3, &[]).unwrap();
    store.save(&dir).unwrap();

    let text = fs::read_to_string(dir.join(store.store_file_name())).unwrap();
    assert!(text.contains("SAV 1 -99"));
    assert!(text.contains("CAV 1 0"));

    let mut loaded = ObjectStore::new(StoreConfig::with_id(3)).unwrap();
    loaded.load(&dir).unwrap();
    assert_eq!(loaded.attribute_simple(key(1, 1), 2).unwrap(), -99);
    assert!(loaded.attribute_exists(key(1, 1), 3));
    assert_eq!(loaded.attribute_get(key(1, 1), 3).unwrap(), &[] as &[u8]);

    remove_dir_all(&dir).unwrap();
}

#[test]
fn child_before_parent_needs_the_second_pass() {
    let dir = test_dir("child-first");
    let config = StoreConfig::with_id(4);
    let name = format!("om_{}", config.store_id);
    fs::write(
        dir.join(&name),
        "OBJ 1 1 2 1\n  AID 5\n    CAV 1 3 1 2 3\nOBJ 0 0 1 1\n",
    )
    .unwrap();

    let mut store = ObjectStore::new(config).unwrap();
    store.load(&dir).unwrap();
    assert_eq!(store.parent_of(key(2, 1)).unwrap(), Some(key(1, 1)));
    assert_eq!(store.attribute_get(key(2, 1), 5).unwrap(), &[1, 2, 3]);
    // the resolved link is a real child-list membership, so the tree walk
    // reaches the out-of-order object
    let all = store.descendants(ObjectKey::ROOT).unwrap();
    assert!(all.contains(&key(2, 1)));

    remove_dir_all(&dir).unwrap();
}

#[test]
fn orphan_stays_unresolved_but_present() {
    let dir = test_dir("orphan");
    let config = StoreConfig::with_id(5);
    let name = format!("om_{}", config.store_id);
    fs::write(dir.join(&name), "OBJ 8 8 9 9\n").unwrap();

    let mut store = ObjectStore::new(config).unwrap();
    store.load(&dir).unwrap();
    assert!(store.exists(key(9, 9)));
    assert_eq!(store.parent_of(key(9, 9)).unwrap(), Some(key(8, 8)));
    assert!(!store
        .descendants(ObjectKey::ROOT)
        .unwrap()
        .contains(&key(9, 9)));

    remove_dir_all(&dir).unwrap();
}

#[test]
fn backup_rotation() {
    let dir = test_dir("rotation");
    let mut store = ObjectStore::new(StoreConfig::with_id(6)).unwrap();
    store.create(ObjectKey::ROOT, key(1, 1)).unwrap();
    let name = store.store_file_name();

    store.save(&dir).unwrap();
    assert!(dir.join(&name).is_file());
    assert!(!dir.join(format!("{}_BACKUP", name)).is_file());

    store.create(ObjectKey::ROOT, key(1, 2)).unwrap();
    store.save(&dir).unwrap();
    assert!(dir.join(format!("{}_BACKUP", name)).is_file());

    store.save(&dir).unwrap();
    assert!(dir.join(format!("{}_BACKUP_tmp", name)).is_file());

    // the backup is the previous generation, one object short
    let mut backup_store = ObjectStore::new(StoreConfig::with_id(6)).unwrap();
    fs::rename(dir.join(format!("{}_BACKUP", name)), dir.join(&name)).unwrap();
    backup_store.load(&dir).unwrap();
    assert_eq!(backup_store.object_count(), 3);

    remove_dir_all(&dir).unwrap();
}

#[test]
fn failed_loads() {
    let dir = test_dir("failed-loads");
    let mut store = ObjectStore::new(StoreConfig::with_id(7)).unwrap();
    store.create(ObjectKey::ROOT, key(1, 1)).unwrap();

    // no file at all: the store is left exactly as it was
    assert!(matches!(store.load(&dir), Err(StoreError::Io(_))));
    assert!(store.exists(key(1, 1)));

    // a bad record: the store is re-initialized and holds what parsed
    let name = store.store_file_name();
    fs::write(dir.join(&name), "OBJ 0 0 3 3\nBOGUS 1 2\n").unwrap();
    assert!(matches!(store.load(&dir), Err(StoreError::Format(_))));
    assert!(store.exists(key(3, 3)));
    assert!(!store.exists(key(1, 1)));

    remove_dir_all(&dir).unwrap();
}
