// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! In-process stand-in for a host engine, with failure injection. Clones
//! share state, so a test can keep one handle to inspect what the code under
//! test pushed through another.

use super::{
    BASELINE_ENTITY_ID, DcgmClient, DcgmConnector, DeviceAttribute, EntityPair, FieldValue,
    MetricField,
};
use crate::error::{DCGM_ST_CONNECTION_NOT_VALID, DcgmError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// `DCGM_ST_BADPARAM`
const DCGM_ST_BADPARAM: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub entity_id: u32,
    pub field: MetricField,
    pub value: FieldValue,
    pub timestamp_us: i64,
}

#[derive(Debug)]
struct State {
    gpus: Vec<u32>,
    next_id: u32,
    attributes: HashMap<(u32, DeviceAttribute), String>,
    injections: Vec<Injection>,
    create_calls: Vec<u32>,
    connects: u32,
    reachable: bool,
    broken: bool,
    shortfall: u32,
    echo_baseline: bool,
    foreign_entities: Vec<EntityPair>,
    failing_attributes: HashSet<DeviceAttribute>,
    failing_fields: HashSet<(u32, MetricField)>,
    call_delay: Duration,
}

impl Default for State {
    fn default() -> Self {
        Self {
            gpus: vec![BASELINE_ENTITY_ID],
            next_id: BASELINE_ENTITY_ID + 1,
            attributes: HashMap::new(),
            injections: Vec::new(),
            create_calls: Vec::new(),
            connects: 0,
            reachable: true,
            broken: false,
            shortfall: 0,
            echo_baseline: false,
            foreign_entities: Vec::new(),
            failing_attributes: HashSet::new(),
            failing_fields: HashSet::new(),
            call_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDcgm {
    state: Arc<Mutex<State>>,
}

impl InMemoryDcgm {
    /// A host engine exposing only the baseline GPU.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Creates `n` fewer entities than requested.
    pub fn with_shortfall(self, n: u32) -> Self {
        self.lock().shortfall = n;
        self
    }

    /// Also reports the baseline GPU in creation results.
    pub fn echoing_baseline(self) -> Self {
        self.lock().echo_baseline = true;
        self
    }

    /// Adds a non-GPU entity to creation results.
    pub fn with_foreign_entity(self, entity: EntityPair) -> Self {
        self.lock().foreign_entities.push(entity);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Every subsequent call on any client fails with a connection error.
    pub fn break_connection(&self) {
        self.lock().broken = true;
    }

    pub fn fail_attribute(&self, attribute: DeviceAttribute) {
        self.lock().failing_attributes.insert(attribute);
    }

    pub fn fail_field(&self, entity_id: u32, field: MetricField) {
        self.lock().failing_fields.insert((entity_id, field));
    }

    /// Makes every field injection block for `delay`.
    pub fn set_call_delay(&self, delay: Duration) {
        self.lock().call_delay = delay;
    }

    pub fn attribute(&self, entity_id: u32, attribute: DeviceAttribute) -> Option<String> {
        self.lock().attributes.get(&(entity_id, attribute)).cloned()
    }

    pub fn attribute_count(&self) -> usize {
        self.lock().attributes.len()
    }

    pub fn injections(&self) -> Vec<Injection> {
        self.lock().injections.clone()
    }

    pub fn injections_for(&self, entity_id: u32) -> Vec<Injection> {
        self.lock()
            .injections
            .iter()
            .filter(|i| i.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn clear_injections(&self) {
        self.lock().injections.clear();
    }

    /// Counts passed to each `create_fake_entities` call.
    pub fn create_calls(&self) -> Vec<u32> {
        self.lock().create_calls.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl DcgmConnector for InMemoryDcgm {
    fn connect(&self) -> Result<Box<dyn DcgmClient>, DcgmError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(DcgmError::Connection {
                address: "in-memory".to_string(),
                reason: "host engine unreachable".to_string(),
            });
        }
        state.connects += 1;
        Ok(Box::new(InMemoryClient {
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryClient {
    state: Arc<Mutex<State>>,
}

impl InMemoryClient {
    fn lock_connected(&self, call: &'static str) -> Result<MutexGuard<'_, State>, DcgmError> {
        let state = lock(&self.state);
        if state.broken {
            return Err(DcgmError::Api {
                call,
                code: DCGM_ST_CONNECTION_NOT_VALID,
            });
        }
        Ok(state)
    }
}

impl DcgmClient for InMemoryClient {
    fn create_fake_entities(&mut self, count: u32) -> Result<Vec<EntityPair>, DcgmError> {
        let mut state = self.lock_connected("dcgmCreateFakeEntities")?;
        state.create_calls.push(count);

        let mut created = Vec::new();
        if state.echo_baseline {
            created.push(EntityPair::gpu(BASELINE_ENTITY_ID));
        }
        for _ in 0..count.saturating_sub(state.shortfall) {
            let id = state.next_id;
            state.next_id += 1;
            state.gpus.push(id);
            created.push(EntityPair::gpu(id));
        }
        created.extend(state.foreign_entities.iter().copied());
        Ok(created)
    }

    fn set_device_attribute(
        &mut self,
        entity_id: u32,
        attribute: DeviceAttribute,
        value: &str,
    ) -> Result<(), DcgmError> {
        let mut state = self.lock_connected("dcgmInjectFieldValue")?;
        if state.failing_attributes.contains(&attribute) || !state.gpus.contains(&entity_id) {
            return Err(DcgmError::Api {
                call: "dcgmInjectFieldValue",
                code: DCGM_ST_BADPARAM,
            });
        }
        state
            .attributes
            .insert((entity_id, attribute), value.to_string());
        Ok(())
    }

    fn inject_field_value(
        &mut self,
        entity_id: u32,
        field: MetricField,
        value: FieldValue,
        timestamp_us: i64,
    ) -> Result<(), DcgmError> {
        let delay = lock(&self.state).call_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.lock_connected("dcgmInjectFieldValue")?;
        if state.failing_fields.contains(&(entity_id, field)) || !state.gpus.contains(&entity_id) {
            return Err(DcgmError::Api {
                call: "dcgmInjectFieldValue",
                code: DCGM_ST_BADPARAM,
            });
        }
        state.injections.push(Injection {
            entity_id,
            field,
            value,
            timestamp_us,
        });
        Ok(())
    }

    fn list_entities(&mut self) -> Result<Vec<u32>, DcgmError> {
        Ok(self.lock_connected("dcgmGetAllDevices")?.gpus.clone())
    }
}
