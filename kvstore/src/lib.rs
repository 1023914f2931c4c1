//! An in-memory key-value state machine for the `raft-rsm` replica, plus a
//! typed client.
//!
//! The state machine understands three operations (`Set`, `Get` and `Cas`)
//! with `serde_json` request/response payloads. `Get` is advisory-readonly
//! but still travels through the replicated log. A CAS mismatch is a normal
//! operation response (the old value), not an error of the RSM layer.

use std::collections::BTreeMap;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use raft_rsm::Command;
use raft_rsm::RsmClient;
use raft_rsm::RsmNetwork;
use raft_rsm::StateMachine;

pub type Key = String;
pub type Value = String;

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An operation of the key-value state machine: its wire name, its advisory
/// readonly flag, and its request/response payload types.
pub trait Operation {
    const NAME: &'static str;
    const READ_ONLY: bool;
    type Request: Serialize + DeserializeOwned + Send;
    type Response: Serialize + DeserializeOwned + Send;
}

/// Unconditionally bind a key to a value.
pub enum Set {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: Key,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse;

impl Operation for Set {
    const NAME: &'static str = "Set";
    const READ_ONLY: bool = false;
    type Request = SetRequest;
    type Response = SetResponse;
}

/// Read the value bound to a key.
pub enum Get {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: Key,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Value,
}

impl Operation for Get {
    const NAME: &'static str = "Get";
    const READ_ONLY: bool = true;
    type Request = GetRequest;
    type Response = GetResponse;
}

/// Compare-and-set: bind `target_value` iff the current value equals
/// `expected_value`; returns the old value either way.
pub enum Cas {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasRequest {
    pub key: Key,
    pub expected_value: Value,
    pub target_value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasResponse {
    pub old_value: Value,
}

impl Operation for Cas {
    const NAME: &'static str = "Cas";
    const READ_ONLY: bool = false;
    type Request = CasRequest;
    type Response = CasResponse;
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory ordered map with a default value for missing keys.
pub struct Store {
    default_value: Value,
    entries: BTreeMap<Key, Value>,
}

impl Store {
    pub fn new(default_value: Value) -> Self {
        Self {
            default_value,
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: Key, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Value {
        self.entries.get(key).cloned().unwrap_or_else(|| self.default_value.clone())
    }

    /// Compare-and-set; returns the previous value.
    pub fn cas(&mut self, key: &str, expected_value: &str, target_value: Value) -> Value {
        let old_value = self.get(key);
        if old_value == expected_value {
            self.set(key.to_string(), target_value);
        }
        old_value
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in key order.
    pub fn snapshot_entries(&self) -> Vec<(Key, Value)> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn install(&mut self, entries: Vec<(Key, Value)>) {
        self.clear();
        self.entries.extend(entries);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Value::new())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The key-value state machine plugged into a replica.
pub struct KvStateMachine {
    store: Store,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self {
            store: Store::default(),
        }
    }

    /// Read access to the underlying store, for inspection in tests.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for KvStateMachine {
    fn reset(&mut self) {
        self.store.clear();
    }

    fn apply(&mut self, command: &Command) -> Result<Vec<u8>> {
        tracing::trace!(op=%command.op, request_id=%command.request_id, "applying command");
        match command.op.as_str() {
            Set::NAME => {
                let req: SetRequest = decode::<Set>(&command.request)?;
                self.store.set(req.key, req.value);
                encode::<Set>(&SetResponse)
            }
            Get::NAME => {
                let req: GetRequest = decode::<Get>(&command.request)?;
                let value = self.store.get(&req.key);
                encode::<Get>(&GetResponse { value })
            }
            Cas::NAME => {
                let req: CasRequest = decode::<Cas>(&command.request)?;
                let old_value = self.store.cas(&req.key, &req.expected_value, req.target_value);
                encode::<Cas>(&CasResponse { old_value })
            }
            other => bail!("unknown command type: {}", other),
        }
    }

    fn make_snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.store.snapshot_entries())?)
    }

    fn install_snapshot(&mut self, snapshot: &[u8]) -> Result<()> {
        let entries: Vec<(Key, Value)> = serde_json::from_slice(snapshot).context("undecodable snapshot")?;
        self.store.install(entries);
        Ok(())
    }
}

fn decode<O: Operation>(raw: &[u8]) -> Result<O::Request> {
    serde_json::from_slice(raw).with_context(|| format!("undecodable {} request", O::NAME))
}

fn encode<O: Operation>(response: &O::Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A typed key-value client over the RSM client library.
pub struct KvClient<N: RsmNetwork> {
    rsm: RsmClient<N>,
}

impl<N: RsmNetwork> KvClient<N> {
    pub fn new(rsm: RsmClient<N>) -> Self {
        Self { rsm }
    }

    pub async fn set(&self, key: Key, value: Value) -> Result<()> {
        self.execute::<Set>(&SetRequest { key, value }).await?;
        Ok(())
    }

    pub async fn get(&self, key: Key) -> Result<Value> {
        Ok(self.execute::<Get>(&GetRequest { key }).await?.value)
    }

    /// Compare-and-set; returns the value observed before the operation.
    pub async fn cas(&self, key: Key, expected: Value, target: Value) -> Result<Value> {
        let req = CasRequest {
            key,
            expected_value: expected,
            target_value: target,
        };
        Ok(self.execute::<Cas>(&req).await?.old_value)
    }

    async fn execute<O: Operation>(&self, request: &O::Request) -> Result<O::Response> {
        let raw = serde_json::to_vec(request)?;
        let response = self.rsm.execute(O::NAME, raw, O::READ_ONLY).await;
        serde_json::from_slice(&response).with_context(|| format!("undecodable {} response", O::NAME))
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
