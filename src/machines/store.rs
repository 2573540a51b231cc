use std::sync::Arc;

use crate::{
    error::Result,
    machinery::store::{Key, PartialKey, Store},
    resources::machine::MachineRecord,
};

const MACHINES_COLLECTION: &str = "machines";

/// Durable machine records, one per id, last-write-wins. Reads reflect
/// exactly the last written record; nothing here synthesizes state.
pub struct MachineStore {
    store: Arc<Store>,
}

impl MachineStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn key(id: &str) -> Key<MachineRecord> {
        Key::<MachineRecord>::collection(MACHINES_COLLECTION).key(id)
    }

    pub fn write(&self, record: &MachineRecord) -> Result<()> {
        self.store.put(&Self::key(&record.id), record)
    }

    pub fn read(&self, id: &str) -> Result<Option<MachineRecord>> {
        self.store.get(&Self::key(id))
    }

    pub fn list_all(&self) -> Result<Vec<MachineRecord>> {
        self.store
            .list(&PartialKey::<MachineRecord>::collection(MACHINES_COLLECTION))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(&Self::key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::machine::{MachineConfig, MachineStatus};

    async fn machine_store() -> (MachineStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = Store::new(dir.path())
            .await
            .expect("failed to create store");
        (MachineStore::new(Arc::new(store)), dir)
    }

    fn record(id: &str, status: MachineStatus) -> MachineRecord {
        MachineRecord {
            id: id.to_string(),
            status,
            ip: None,
            config: MachineConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (store, _dir) = machine_store().await;

        assert!(store.read("m-1").expect("read failed").is_none());

        store
            .write(&record("m-1", MachineStatus::Pending))
            .expect("write failed");

        let found = store.read("m-1").expect("read failed").expect("missing");
        assert_eq!(found.status, MachineStatus::Pending);
        assert_eq!(found.config, MachineConfig::default());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (store, _dir) = machine_store().await;

        store
            .write(&record("m-1", MachineStatus::Pending))
            .expect("write failed");
        store
            .write(&record("m-1", MachineStatus::Running))
            .expect("write failed");

        let found = store.read("m-1").expect("read failed").expect("missing");
        assert_eq!(found.status, MachineStatus::Running);

        let all = store.list_all().expect("list failed");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (store, _dir) = machine_store().await;

        store
            .write(&record("m-1", MachineStatus::Pending))
            .expect("write failed");
        store
            .write(&record("m-2", MachineStatus::Running))
            .expect("write failed");

        let all = store.list_all().expect("list failed");
        assert_eq!(all.len(), 2);

        store.delete("m-1").expect("delete failed");
        assert!(store.read("m-1").expect("read failed").is_none());

        let all = store.list_all().expect("list failed");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "m-2");

        // repeated delete is a no-op
        store.delete("m-1").expect("delete failed");
    }
}
