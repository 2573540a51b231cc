// heed based KV store. One flat keyspace of "collection/key" entries,
// values encoded as JSON. Writes are last-write-wins.

use heed::{
    Database, Env, EnvOpenOptions,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{marker::PhantomData, path::Path};
use tokio::fs::create_dir_all;

use crate::error::Result;

/// Fully qualified key for a value of type `D`.
pub struct Key<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

/// Collection prefix for scanning all values of type `D` under it.
pub struct PartialKey<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

impl<D> Key<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn collection(collection: impl AsRef<str>) -> KeyBuilder<D> {
        KeyBuilder {
            collection: collection.as_ref().to_string(),
            _marker: PhantomData,
        }
    }
}

impl<D> PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn collection(collection: impl AsRef<str>) -> Self {
        PartialKey(format!("{}/", collection.as_ref()), PhantomData)
    }
}

pub struct KeyBuilder<D>
where
    D: Serialize + DeserializeOwned,
{
    collection: String,
    _marker: PhantomData<D>,
}

impl<D> KeyBuilder<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn key(self, key: impl AsRef<str>) -> Key<D> {
        Key(
            format!("{}/{}", self.collection, key.as_ref()),
            PhantomData,
        )
    }
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if !dir_path.exists() {
            create_dir_all(dir_path).await?;
        }

        let env = unsafe { EnvOpenOptions::new().open(dir_path)? };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    pub fn get<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<Option<D>> {
        let rtxn = self.env.read_txn()?;
        let value = self.db.get(&rtxn, &key.0)?;
        Ok(value.map(serde_json::from_slice).transpose()?)
    }

    pub fn list<D: Serialize + DeserializeOwned>(&self, key: &PartialKey<D>) -> Result<Vec<D>> {
        let rtxn = self.env.read_txn()?;
        let mut iter = self.db.prefix_iter(&rtxn, &key.0)?;

        let mut values = Vec::new();
        while let Some(Ok((_, v))) = iter.next() {
            let value: D = serde_json::from_slice(v)?;
            values.push(value);
        }
        Ok(values)
    }

    pub fn list_keys<D: Serialize + DeserializeOwned>(
        &self,
        key: &PartialKey<D>,
    ) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut iter = self.db.prefix_iter(&rtxn, &key.0)?;

        let mut keys = Vec::new();
        while let Some(Ok((k, _))) = iter.next() {
            keys.push(k.to_string());
        }
        Ok(keys)
    }

    pub fn put<D: Serialize + DeserializeOwned>(&self, key: &Key<D>, value: &D) -> Result<()> {
        let value = serde_json::to_string(value)?.into_bytes();

        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &key.0, &value)?;
        wtxn.commit()?;

        Ok(())
    }

    pub fn delete<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, &key.0)?;
        wtxn.commit()?;

        Ok(())
    }
}
