use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::Value;

use esgf_harvest::error::HarvestError;
use esgf_harvest::record::{AttachedParameters, Record};
use esgf_harvest::store::{
    ATTACH_BATCH, MemoryStore, MetadataStore, SqliteStore, StoreKind, TRANSIENT_STORE_FILENAME,
    open_store,
};

fn records(ids: &[&str]) -> Vec<Record> {
    ids.iter()
        .map(|id| Record::new(*id).with_extra("project", "CMIP5"))
        .collect()
}

fn ids(store: &dyn MetadataStore) -> Vec<String> {
    store
        .records()
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect()
}

// Same assertions for every backing.
fn exercise(store: &mut dyn MetadataStore) {
    assert_eq!(store.count().unwrap(), 0);

    store.set_records(records(&["a", "b"])).unwrap();
    assert_eq!(ids(store), ["a", "b"]);

    store.add_records(records(&["c"])).unwrap();
    assert_eq!(store.count().unwrap(), 3);
    assert_eq!(ids(store), ["a", "b", "c"]);

    let mut visited = Vec::new();
    store
        .for_each_record(&mut |record| {
            visited.push(record.id.clone());
            Ok(())
        })
        .unwrap();
    assert_eq!(visited, ["a", "b", "c"]);

    store.set_records(records(&["z"])).unwrap();
    assert_eq!(ids(store), ["z"]);
    assert_eq!(store.records().unwrap(), records(&["z"]));

    let params = AttachedParameters::from([("selection".to_string(), Value::from("cli"))]);
    store.attach_parameters(&params).unwrap();
    assert_eq!(
        store.records().unwrap()[0].attached_parameters.as_ref(),
        Some(&params)
    );
    assert_matches!(
        store.attach_parameters(&params),
        Err(HarvestError::AlreadyAttached(id)) if id == "z"
    );
}

#[test]
fn memory_store_behaves() {
    let mut store = MemoryStore::new();
    exercise(&mut store);
}

#[test]
fn sqlite_store_behaves() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("store.db")).unwrap();
    let mut store = SqliteStore::open(&path).unwrap();
    exercise(&mut store);
    store.destroy().unwrap();
    assert!(!path.as_std_path().exists());
}

#[test]
fn open_store_follows_kind() {
    let temp = tempfile::tempdir().unwrap();
    let data_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    let mut store = open_store(StoreKind::Sqlite, &data_dir).unwrap();
    store.add_records(records(&["a"])).unwrap();
    assert!(data_dir.join(TRANSIENT_STORE_FILENAME).as_std_path().is_file());
    store.close().unwrap();
    assert!(!data_dir.join(TRANSIENT_STORE_FILENAME).as_std_path().exists());

    let store = open_store(StoreKind::Memory, &data_dir).unwrap();
    assert_eq!(store.count().unwrap(), 0);
    assert!(!data_dir.join(TRANSIENT_STORE_FILENAME).as_std_path().exists());
}

#[test]
fn sqlite_attach_spans_batches_and_rolls_back() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("store.db")).unwrap();
    let mut store = SqliteStore::open(&path).unwrap();
    let total = ATTACH_BATCH as usize * 2 + 5;
    let mut batch = (0..total)
        .map(|index| Record::new(format!("r{index}")))
        .collect::<Vec<_>>();
    let early = AttachedParameters::from([("run".to_string(), Value::from(1))]);
    batch[total - 1].attach(&early).unwrap();
    store.add_records(batch).unwrap();

    let params = AttachedParameters::from([("run".to_string(), Value::from(2))]);
    let last = format!("r{}", total - 1);
    assert_matches!(
        store.attach_parameters(&params),
        Err(HarvestError::AlreadyAttached(id)) if id == last
    );
    assert!(store.get(0).unwrap().unwrap().attached_parameters.is_none());

    store.delete(total as i64 - 1).unwrap();
    store.attach_parameters(&params).unwrap();
    let mut attached = 0;
    store
        .for_each_record(&mut |record| {
            assert_eq!(record.attached_parameters.as_ref(), Some(&params));
            attached += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(attached, total - 1);
    store.destroy().unwrap();
}
