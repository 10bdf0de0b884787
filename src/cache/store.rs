use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use kube::ResourceExt;

use super::CacheError;
use crate::common::object_key;

type Index = BTreeMap<String, BTreeSet<String>>;
type IndexValues = Vec<(&'static str, String)>;

/// Objects of one kind keyed by `namespace/name`, with field indexes pointing back to those keys.
#[derive(Debug)]
pub struct Store<K> {
    objects: BTreeMap<String, Arc<K>>,
    indexes: HashMap<&'static str, Index>,
    /// Index values each object was stored under.
    indexed_by: HashMap<String, IndexValues>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.iter().map(|(key, object)| (key.clone(), Arc::clone(object))).collect(),
            indexes: self.indexes.clone(),
            indexed_by: self.indexed_by.clone(),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self { objects: BTreeMap::new(), indexes: HashMap::new(), indexed_by: HashMap::new() }
    }
}

impl<K: ResourceExt> Store<K> {
    /// Stores the object, replacing its index entries, and returns the previous version.
    pub fn insert(&mut self, object: K, index_values: IndexValues) -> Option<Arc<K>> {
        let key = object_key(&object);
        self.purge_index_entries(&key);
        for (index_name, value) in &index_values {
            self.indexes.entry(*index_name).or_default().entry(value.clone()).or_default().insert(key.clone());
        }
        if !index_values.is_empty() {
            self.indexed_by.insert(key.clone(), index_values);
        }
        self.objects.insert(key, Arc::new(object))
    }

    pub fn delete(&mut self, key: &str) -> Option<Arc<K>> {
        self.purge_index_entries(key);
        self.objects.remove(key)
    }

    fn purge_index_entries(&mut self, key: &str) {
        let Some(index_values) = self.indexed_by.remove(key) else {
            return;
        };
        for (index_name, value) in index_values {
            let Some(index) = self.indexes.get_mut(index_name) else {
                continue;
            };
            if let Some(keys) = index.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&value);
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<K>> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<K>> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn has_index_entry(&self, index_name: &str, value: &str) -> bool {
        self.indexes.get(index_name).is_some_and(|index| index.contains_key(value))
    }

    /// Objects whose index `index_name` contains `value`. An indexed key without an object is reported as stale.
    pub fn list_by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<K>>, CacheError> {
        let Some(keys) = self.indexes.get(index_name).and_then(|index| index.get(value)) else {
            return Ok(Vec::new());
        };
        keys.iter()
            .map(|key| self.objects.get(key).cloned().ok_or_else(|| CacheError::StaleIndex(index_name.to_owned(), key.clone())))
            .collect()
    }

    /// Same as [`Store::list_by_index`] ordered by creation timestamp then `namespace/name`.
    pub fn list_by_index_sorted(&self, index_name: &str, value: &str) -> Result<Vec<Arc<K>>, CacheError> {
        let mut objects = self.list_by_index(index_name, value)?;
        sort_resources(&mut objects);
        Ok(objects)
    }

    pub fn list_sorted(&self) -> Vec<Arc<K>> {
        let mut objects: Vec<_> = self.objects.values().cloned().collect();
        sort_resources(&mut objects);
        objects
    }
}

/// Deterministic order used for every tie break: oldest first, then by `namespace/name`.
pub fn sort_resources<K: ResourceExt>(objects: &mut [Arc<K>]) {
    objects.sort_by(|a, b| {
        a.creation_timestamp()
            .cmp(&b.creation_timestamp())
            .then_with(|| object_key(a.as_ref()).cmp(&object_key(b.as_ref())))
    });
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    use super::*;

    fn secret(name: &str, ts: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("ns".to_owned()),
                creation_timestamp: Some(serde_json::from_value(serde_json::json!(ts)).unwrap()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn insert_replaces_index_entries() {
        let mut store = Store::default();
        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![("idx", "one".to_owned())]);
        assert_eq!(store.list_by_index("idx", "one").unwrap().len(), 1);

        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![("idx", "two".to_owned())]);
        assert!(store.list_by_index("idx", "one").unwrap().is_empty());
        assert_eq!(store.list_by_index("idx", "two").unwrap().len(), 1);
        assert!(!store.has_index_entry("idx", "one"));
    }

    #[test]
    fn delete_purges_all_index_entries() {
        let mut store = Store::default();
        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![("idx", "one".to_owned()), ("other", "x".to_owned())]);
        assert!(store.delete("ns/a").is_some());
        assert!(store.list_by_index("idx", "one").unwrap().is_empty());
        assert!(!store.has_index_entry("other", "x"));
        assert!(store.is_empty());
    }

    #[test]
    fn purge_leaves_other_objects_indexed() {
        let mut store = Store::default();
        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![("idx", "shared".to_owned())]);
        store.insert(secret("b", "2024-01-01T00:00:00Z"), vec![("idx", "shared".to_owned()), ("idx", "own".to_owned())]);
        store.delete("ns/b");
        let names: Vec<_> = store.list_by_index("idx", "shared").unwrap().iter().map(|s| s.name_any()).collect();
        assert_eq!(names, vec!["a"]);
        assert!(!store.has_index_entry("idx", "own"));
        assert!(!store.indexed_by.contains_key("ns/b"));

        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![]);
        assert!(!store.has_index_entry("idx", "shared"));
        assert!(store.indexed_by.is_empty());
    }

    #[test]
    fn sorted_by_timestamp_then_name() {
        let mut store = Store::default();
        store.insert(secret("c", "2024-01-01T00:00:00Z"), vec![]);
        store.insert(secret("b", "2024-01-02T00:00:00Z"), vec![]);
        store.insert(secret("a", "2024-01-01T00:00:00Z"), vec![]);
        let names: Vec<_> = store.list_sorted().iter().map(|s| s.name_any()).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }
}
