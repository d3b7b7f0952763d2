//! Scripted in-memory provider shared by the engine scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use stackflow_engine::{
    AttributeDelta, AttributeSchema, Attributes, CreatedResource, Provider, ProviderError,
    ProviderResult, ResourceSchema,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

/// Objects live in a map keyed by id. Every resource carries a `name`
/// attribute, which is what failures, delays and gates are keyed on.
#[derive(Default)]
pub struct ScriptedProvider {
    objects: Mutex<BTreeMap<String, Attributes>>,
    log: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    fail: Mutex<BTreeSet<String>>,
    fail_reads: Mutex<bool>,
    delays: Mutex<BTreeMap<String, Duration>>,
    gates: Mutex<BTreeMap<String, Arc<Barrier>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every mutation of `name` fail permanently
    pub fn fail_on(&self, name: &str) {
        self.fail.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_reads(&self) {
        *self.fail_reads.lock().unwrap() = true;
    }

    pub fn delay(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Mutations of every name in `names` wait on one shared barrier
    pub fn gate(&self, names: &[&str]) {
        let barrier = Arc::new(Barrier::new(names.len()));
        let mut gates = self.gates.lock().unwrap();
        for name in names {
            gates.insert(name.to_string(), barrier.clone());
        }
    }

    /// Provider calls in completion order, e.g. `create:a`, `delete:a`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not in log {:?}", entry, self.log()))
    }

    /// Most mutations ever running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn object_named(&self, name: &str) -> Option<(String, Attributes)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(_, a)| a.get("name") == Some(&json!(name)))
            .map(|(id, a)| (id.clone(), a.clone()))
    }

    /// Change an object behind the engine's back
    pub fn tamper(&self, id: &str, attribute: &str, value: Value) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(id) {
            object.insert(attribute.to_string(), value);
        }
    }

    fn name_of(attributes: &Attributes) -> String {
        attributes
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn name_for_id(&self, id: &str) -> String {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .map(Self::name_of)
            .unwrap_or_default()
    }

    async fn script(&self, name: &str) -> ProviderResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.run_script(name).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_script(&self, name: &str) -> ProviderResult<()> {
        let gate = self.gates.lock().unwrap().get(name).cloned();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        let delay = self.delays.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.lock().unwrap().contains(name) {
            return Err(ProviderError::permanent(format!("{} refused", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn schema(&self, _resource_type: &str) -> Option<ResourceSchema> {
        Some(
            ResourceSchema::new(2)
                .attribute("name", AttributeSchema::forces_replacement())
                .attribute("location", AttributeSchema::forces_replacement())
                .attribute("size", AttributeSchema::in_place())
                .attribute("tags", AttributeSchema::in_place().unordered())
                .attribute("id", AttributeSchema::computed())
                .attribute("arn", AttributeSchema::computed()),
        )
    }

    async fn create(&self, _resource_type: &str, attributes: &Attributes) -> ProviderResult<CreatedResource> {
        let name = Self::name_of(attributes);
        self.script(&name).await?;
        let id = format!("{}-{}", name, self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = attributes.clone();
        stored.insert("arn".to_string(), json!(format!("arn:scripted:{}", id)));
        self.objects.lock().unwrap().insert(id.clone(), stored.clone());
        self.log.lock().unwrap().push(format!("create:{}", name));
        Ok(CreatedResource {
            id,
            attributes: stored,
            private: None,
        })
    }

    async fn read(&self, _resource_type: &str, id: &str) -> ProviderResult<Option<Attributes>> {
        if *self.fail_reads.lock().unwrap() {
            return Err(ProviderError::transient("read unavailable"));
        }
        Ok(self.objects.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, _resource_type: &str, id: &str, delta: &AttributeDelta) -> ProviderResult<Attributes> {
        let name = self.name_for_id(id);
        self.script(&name).await?;
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found(id.to_string()))?;
        for (key, value) in &delta.desired {
            object.insert(key.clone(), value.clone());
        }
        let updated = object.clone();
        drop(objects);
        self.log.lock().unwrap().push(format!("update:{}", name));
        Ok(updated)
    }

    async fn delete(&self, _resource_type: &str, id: &str) -> ProviderResult<()> {
        let name = self.name_for_id(id);
        self.script(&name).await?;
        self.objects
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| ProviderError::not_found(id.to_string()))?;
        self.log.lock().unwrap().push(format!("delete:{}", name));
        Ok(())
    }
}
