//! Deterministic in-process [`PlatformClient`].
//!
//! Stores objects as JSON, applies merge patches like the API server, records
//! every call, and can be told to fail specific verbs.  Used by the
//! integration tests to run whole pipelines without a cluster.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{merge_patch, object_name, PlatformClient, ResourceKind};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Create,
    Read,
    Patch,
    PatchStatus,
    Delete,
    List,
}

impl Verb {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read | Self::List)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    /// Body for creates and patches.
    pub body: Option<Value>,
}

type Key = (String, ResourceKind, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    failures: BTreeMap<(Verb, ResourceKind), String>,
    revision: u64,
}

impl State {
    fn bump(&mut self, obj: &mut Value) {
        self.revision += 1;
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".into(), json!(self.revision.to_string()));
        }
    }

    fn check_failure(&self, verb: Verb, kind: ResourceKind) -> Result<()> {
        match self.failures.get(&(verb, kind)) {
            Some(msg) => Err(Error::reconcile(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

fn not_found(kind: ResourceKind, name: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: format!("{kind} {name:?} not found"),
        reason: "NotFound".into(),
        code: 404,
    }))
}

fn key(namespace: &str, kind: ResourceKind, name: &str) -> Key {
    (namespace.to_string(), kind, name.to_string())
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    let labels = obj.pointer("/metadata/labels");
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == v),
            None => labels.and_then(|l| l.get(term)).is_some(),
        })
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from later asserts.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed an object without recording a call.
    pub fn insert(&self, namespace: &str, kind: ResourceKind, mut body: Value) {
        let mut state = self.lock();
        let name = object_name(&body).unwrap_or_default().to_string();
        if let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".into(), json!(namespace));
        }
        state.bump(&mut body);
        state.objects.insert(key(namespace, kind, &name), body);
    }

    /// Current stored object, without recording a call.
    pub fn get(&self, namespace: &str, kind: ResourceKind, name: &str) -> Option<Value> {
        self.lock().objects.get(&key(namespace, kind, name)).cloned()
    }

    pub fn names(&self, namespace: &str, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(ns, k, _)| ns == namespace && *k == kind)
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls that changed state (create, patch, patch_status, delete).
    pub fn writes(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every `verb` on `kind` fail until [`Self::clear_failures`].
    pub fn fail_on(&self, verb: Verb, kind: ResourceKind, message: &str) {
        self.lock()
            .failures
            .insert((verb, kind), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn record(
        state: &mut State,
        verb: Verb,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        body: Option<&Value>,
    ) {
        state.calls.push(Call {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            body: body.cloned(),
        });
    }

    fn apply_patch(
        &self,
        verb: Verb,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let mut state = self.lock();
        Self::record(&mut state, verb, kind, namespace, name, Some(patch));
        state.check_failure(verb, kind)?;
        let k = key(namespace, kind, name);
        let mut obj = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(kind, name))?;
        merge_patch(&mut obj, patch);
        state.bump(&mut obj);
        state.objects.insert(k, obj.clone());
        Ok(obj)
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn create(&self, namespace: &str, kind: ResourceKind, body: &Value) -> Result<Value> {
        let mut state = self.lock();
        let name = object_name(body)
            .ok_or_else(|| Error::validation(format!("{kind} body has no metadata.name")))?
            .to_string();
        Self::record(&mut state, Verb::Create, kind, namespace, &name, Some(body));
        state.check_failure(Verb::Create, kind)?;

        let k = key(namespace, kind, &name);
        if state.objects.contains_key(&k) {
            return Err(Error::Conflict(format!("{kind} {name:?} already exists")));
        }
        let mut obj = body.clone();
        let uid = format!("uid-{}", state.revision + 1);
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".into(), json!(namespace));
            meta.insert("uid".into(), json!(uid));
        }
        state.bump(&mut obj);
        state.objects.insert(k, obj.clone());
        Ok(obj)
    }

    async fn read(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<Value>> {
        let mut state = self.lock();
        Self::record(&mut state, Verb::Read, kind, namespace, name, None);
        state.check_failure(Verb::Read, kind)?;
        Ok(state.objects.get(&key(namespace, kind, name)).cloned())
    }

    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        self.apply_patch(Verb::Patch, namespace, kind, name, patch)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        self.apply_patch(Verb::PatchStatus, namespace, kind, name, patch)
    }

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<bool> {
        let mut state = self.lock();
        Self::record(&mut state, Verb::Delete, kind, namespace, name, None);
        state.check_failure(Verb::Delete, kind)?;
        Ok(state.objects.remove(&key(namespace, kind, name)).is_some())
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        let mut state = self.lock();
        Self::record(&mut state, Verb::List, kind, namespace, "", None);
        state.check_failure(Verb::List, kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|((ns, k, _), obj)| {
                ns == namespace && *k == kind && labels_match(obj, label_selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": name}})
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let p = InMemoryPlatform::new();
        p.create("ns", ResourceKind::Secret, &secret("a")).await.unwrap();
        let err = p
            .create("ns", ResourceKind::Secret, &secret("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn patch_of_missing_object_is_404() {
        let p = InMemoryPlatform::new();
        let err = p
            .patch("ns", ResourceKind::Secret, "nope", &json!({"data": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref ae)) if ae.code == 404));
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_namespace() {
        let p = InMemoryPlatform::new();
        p.insert(
            "ns",
            ResourceKind::Job,
            json!({"metadata": {"name": "a", "labels": {"app": "x", "tier": "db"}}}),
        );
        p.insert(
            "ns",
            ResourceKind::Job,
            json!({"metadata": {"name": "b", "labels": {"app": "y"}}}),
        );
        p.insert(
            "other",
            ResourceKind::Job,
            json!({"metadata": {"name": "c", "labels": {"app": "x"}}}),
        );
        let found = p.list("ns", ResourceKind::Job, "app=x").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(object_name(&found[0]), Some("a"));
    }

    #[tokio::test]
    async fn injected_failures_apply_per_verb() {
        let p = InMemoryPlatform::new();
        p.fail_on(Verb::Create, ResourceKind::Secret, "boom");
        assert!(p.create("ns", ResourceKind::Secret, &secret("a")).await.is_err());
        p.clear_failures();
        assert!(p.create("ns", ResourceKind::Secret, &secret("a")).await.is_ok());
        assert_eq!(p.writes().len(), 2);
    }
}
