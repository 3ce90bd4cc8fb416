//! Instance cache
//!
//! Keys are exact strings; alias resolution happens before a key is built.
//! Each key owns a once-cell so concurrent first requests share one load,
//! and a failed load leaves nothing behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use super::instance::LoadedExtensionInstance;
use crate::core::error::{ConsumetError, Result};

type Slot = Arc<OnceCell<LoadedExtensionInstance>>;

#[derive(Default)]
pub struct InstanceCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| ConsumetError::InitializationError("instance cache lock poisoned".to_string()))
    }

    /// Cached instance for `key`, or the result of `create`
    ///
    /// `create` runs at most once per key while its result is cached.
    pub async fn get_or_try_create<F, Fut>(&self, key: &str, create: F) -> Result<LoadedExtensionInstance>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LoadedExtensionInstance>>,
    {
        let slot = {
            let mut slots = self.lock()?;
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot.get_or_try_init(create).await.map(Arc::clone);

        if result.is_err() {
            let mut slots = self.lock()?;
            let unfilled = slots
                .get(key)
                .map_or(false, |current| Arc::ptr_eq(current, &slot) && current.get().is_none());
            if unfilled {
                slots.remove(key);
            }
        }

        result
    }

    pub fn get(&self, key: &str) -> Option<LoadedExtensionInstance> {
        self.lock()
            .ok()
            .and_then(|slots| slots.get(key).and_then(|slot| slot.get().cloned()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Cache an already built instance, replacing any previous one
    pub fn insert(&self, key: &str, instance: LoadedExtensionInstance) -> Result<()> {
        let slot = Arc::new(OnceCell::new_with(Some(instance)));
        self.lock()?.insert(key.to_string(), slot);
        Ok(())
    }

    /// Remove `key` and tear down its instance
    pub async fn remove(&self, key: &str) -> bool {
        let slot = match self.lock() {
            Ok(mut slots) => slots.remove(key),
            Err(_) => None,
        };

        match slot.and_then(|slot| slot.get().cloned()) {
            Some(instance) => {
                teardown(key, instance).await;
                true
            }
            None => false,
        }
    }

    /// Remove every key starting with `prefix`, returning how many were removed
    pub async fn remove_prefixed(&self, prefix: &str) -> usize {
        let removed: Vec<(String, Slot)> = match self.lock() {
            Ok(mut slots) => {
                let keys: Vec<String> = slots
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| slots.remove(&k).map(|slot| (k, slot)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };

        let mut count = 0;
        for (key, slot) in removed {
            if let Some(instance) = slot.get().cloned() {
                teardown(&key, instance).await;
                count += 1;
            }
        }
        count
    }

    /// Keys of loaded instances
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .map(|slots| {
                slots
                    .iter()
                    .filter(|(_, slot)| slot.initialized())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn teardown(key: &str, instance: LoadedExtensionInstance) {
    if let Err(e) = instance.teardown().await {
        tracing::warn!(cache_key = %key, error = %e, "Failed to tear down instance");
    } else {
        tracing::debug!(cache_key = %key, backend = instance.backend(), "Instance removed from cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::static_module::StaticModule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build(id: &str) -> LoadedExtensionInstance {
        StaticModule::builder(id).data("name", id).shared()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let cache = InstanceCache::new();
        let created = AtomicUsize::new(0);

        let first = cache
            .get_or_try_create("zoro:createZoro", || async {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(build("zoro"))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_try_create("zoro:createZoro", || async {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(build("zoro"))
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = InstanceCache::new();

        let err = cache
            .get_or_try_create("gogo:createGogo", || async {
                Err(ConsumetError::NetworkError("offline".to_string()))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok = cache
            .get_or_try_create("gogo:createGogo", || async { Ok(build("gogo")) })
            .await;
        assert!(ok.is_ok());
        assert_eq!(cache.keys(), vec!["gogo:createGogo".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_load() {
        let cache = Arc::new(InstanceCache::new());
        let created = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let created = created.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_create("flixhq:createFlixHQ", || async move {
                        created.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(build("flixhq"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let instances: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|h| h.unwrap())
            .collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_remove_prefixed() {
        let cache = InstanceCache::new();
        cache.insert("zoro:createZoro", build("zoro")).unwrap();
        cache.insert("zoro:createZoroBackup", build("zoro")).unwrap();
        cache.insert("zoro-anime:createZoro", build("zoro-anime")).unwrap();

        assert_eq!(cache.remove_prefixed("zoro:").await, 2);
        assert_eq!(cache.keys(), vec!["zoro-anime:createZoro".to_string()]);

        assert!(cache.remove("zoro-anime:createZoro").await);
        assert!(!cache.remove("zoro-anime:createZoro").await);
    }
}
