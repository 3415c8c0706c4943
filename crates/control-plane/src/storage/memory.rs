use super::{apply_updates, FieldUpdate, Item, ItemKey, MetadataStore, SortOrder};
use async_trait::async_trait;
use faas_common::Result;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// In-memory metadata store for development and tests
#[derive(Default)]
pub struct InMemoryMetadataStore {
    partitions: RwLock<BTreeMap<String, BTreeMap<String, Item>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records
    pub async fn len(&self) -> usize {
        self.partitions.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn matching<'a>(partition: &'a BTreeMap<String, Item>, sk_prefix: &str) -> Vec<&'a Item> {
    partition
        .range(sk_prefix.to_string()..)
        .take_while(|(sk, _)| sk.starts_with(sk_prefix))
        .map(|(_, item)| item)
        .collect()
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put(&self, key: &ItemKey, item: Item) -> Result<()> {
        self.partitions
            .write()
            .await
            .entry(key.pk.clone())
            .or_default()
            .insert(key.sk.clone(), item);
        Ok(())
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(&key.pk)
            .and_then(|partition| partition.get(&key.sk))
            .cloned())
    }

    async fn update(&self, key: &ItemKey, updates: &[FieldUpdate]) -> Result<Option<Item>> {
        let mut partitions = self.partitions.write().await;
        let item = match partitions
            .get_mut(&key.pk)
            .and_then(|partition| partition.get_mut(&key.sk))
        {
            Some(item) => item,
            None => return Ok(None),
        };

        apply_updates(item, updates);
        Ok(Some(item.clone()))
    }

    async fn delete(&self, key: &ItemKey) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(&key.pk) else {
            return Ok(false);
        };

        let removed = partition.remove(&key.sk).is_some();
        if partition.is_empty() {
            partitions.remove(&key.pk);
        }
        Ok(removed)
    }

    async fn query(
        &self,
        pk: &str,
        sk_prefix: &str,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Item>> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(pk) else {
            return Ok(Vec::new());
        };

        let limit = limit.unwrap_or(usize::MAX);
        let items = match order {
            SortOrder::Ascending => matching(partition, sk_prefix)
                .into_iter()
                .take(limit)
                .cloned()
                .collect(),
            SortOrder::Descending => matching(partition, sk_prefix)
                .into_iter()
                .rev()
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(items)
    }

    async fn scan(&self, pk_prefix: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .filter(|(pk, _)| pk.starts_with(pk_prefix))
            .flat_map(|(_, partition)| matching(partition, sk_prefix).into_iter().cloned())
            .collect())
    }
}
