//! Read-only indexed views of cluster state, fed by watch streams and
//! eventually consistent with the cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use spark_application_crd::constants::LABEL_APP_NAME;
use spark_application_crd::SparkApplication;

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits a `namespace/name` key.
pub fn split_object_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
        .filter(|(namespace, name)| !namespace.is_empty() && !name.is_empty())
}

pub struct ObjectStore<K> {
    objects: RwLock<HashMap<String, Arc<K>>>,
    synced: AtomicBool,
}

impl<K> Default for ObjectStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> ObjectStore<K>
where
    K: Resource<DynamicType = ()>,
{
    fn key_of(object: &K) -> String {
        object_key(&object.namespace().unwrap_or_default(), &object.name_any())
    }

    /// Inserts or replaces an object, returning the previous version.
    pub fn apply(&self, object: K) -> Option<Arc<K>> {
        let key = Self::key_of(&object);
        self.objects
            .write()
            .expect("store poisoned")
            .insert(key, Arc::new(object))
    }

    pub fn remove(&self, object: &K) -> Option<Arc<K>> {
        let key = Self::key_of(object);
        self.objects.write().expect("store poisoned").remove(&key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .expect("store poisoned")
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("store poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Marks the initial list as received.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

pub type ApplicationStore = ObjectStore<SparkApplication>;

/// Pod view filtered to operator-launched driver and executor pods by the
/// watch-level label selector; indexed here by the application name label.
#[derive(Default)]
pub struct PodStore {
    inner: ObjectStore<Pod>,
}

impl PodStore {
    pub fn apply(&self, pod: Pod) -> Option<Arc<Pod>> {
        self.inner.apply(pod)
    }

    pub fn remove(&self, pod: &Pod) -> Option<Arc<Pod>> {
        self.inner.remove(pod)
    }

    /// All pods of one application, drivers and executors alike.
    pub fn list_for_app(&self, namespace: &str, app_name: &str) -> Vec<Arc<Pod>> {
        self.inner
            .objects
            .read()
            .expect("store poisoned")
            .values()
            .filter(|pod| {
                pod.namespace().as_deref() == Some(namespace)
                    && pod.labels().get(LABEL_APP_NAME).map(String::as_str) == Some(app_name)
            })
            .cloned()
            .collect()
    }

    pub fn mark_synced(&self) {
        self.inner.mark_synced()
    }

    pub fn has_synced(&self) -> bool {
        self.inner.has_synced()
    }
}
