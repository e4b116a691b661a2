// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Typed access to the DCGM host engine.
//!
//! Every call returns a [`DcgmError`] that is either fatal (the connection is
//! unusable) or retryable (only that call failed), so callers can decide
//! whether to keep going with the rest of a batch.

pub mod ffi;
#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;

use crate::error::DcgmError;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use ffi::LibDcgmConnector;
#[cfg(any(test, feature = "test-helpers"))]
pub use memory::InMemoryDcgm;

/// `DCGM_FE_GPU`
pub const ENTITY_GROUP_GPU: u32 = 1;

/// Id of the GPU the NVML injection layer exposes on its own. Never created
/// by us and never refreshed.
pub const BASELINE_ENTITY_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityPair {
    pub group: u32,
    pub id: u32,
}

impl EntityPair {
    pub fn gpu(id: u32) -> Self {
        Self {
            group: ENTITY_GROUP_GPU,
            id,
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.group == ENTITY_GROUP_GPU
    }
}

/// Descriptive device attributes, stored as DCGM string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    Name,
    Uuid,
    PciBusId,
}

impl DeviceAttribute {
    pub const ALL: [DeviceAttribute; 3] = [
        DeviceAttribute::Name,
        DeviceAttribute::Uuid,
        DeviceAttribute::PciBusId,
    ];

    pub fn field_id(self) -> u16 {
        match self {
            DeviceAttribute::Name => 50,
            DeviceAttribute::Uuid => 54,
            DeviceAttribute::PciBusId => 57,
        }
    }
}

impl fmt::Display for DeviceAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAttribute::Name => write!(f, "name"),
            DeviceAttribute::Uuid => write!(f, "UUID"),
            DeviceAttribute::PciBusId => write!(f, "PCI bus id"),
        }
    }
}

/// Telemetry fields refreshed on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    Temperature,
    Power,
    GpuUtil,
    MemCopyUtil,
    SmClock,
    MemClock,
    FbTotal,
    FbUsed,
    FbFree,
}

impl MetricField {
    pub fn field_id(self) -> u16 {
        match self {
            MetricField::SmClock => 100,
            MetricField::MemClock => 101,
            MetricField::Temperature => 150,
            MetricField::Power => 155,
            MetricField::GpuUtil => 203,
            MetricField::MemCopyUtil => 204,
            MetricField::FbTotal => 250,
            MetricField::FbFree => 251,
            MetricField::FbUsed => 252,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricField::Temperature => "DCGM_FI_DEV_GPU_TEMP",
            MetricField::Power => "DCGM_FI_DEV_POWER_USAGE",
            MetricField::GpuUtil => "DCGM_FI_DEV_GPU_UTIL",
            MetricField::MemCopyUtil => "DCGM_FI_DEV_MEM_COPY_UTIL",
            MetricField::SmClock => "DCGM_FI_DEV_SM_CLOCK",
            MetricField::MemClock => "DCGM_FI_DEV_MEM_CLOCK",
            MetricField::FbTotal => "DCGM_FI_DEV_FB_TOTAL",
            MetricField::FbUsed => "DCGM_FI_DEV_FB_USED",
            MetricField::FbFree => "DCGM_FI_DEV_FB_FREE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int64(i64),
    Double(f64),
    Str(String),
}

impl FieldValue {
    /// DCGM field type tag.
    pub fn type_tag(&self) -> u8 {
        match self {
            FieldValue::Int64(_) => b'i',
            FieldValue::Double(_) => b'd',
            FieldValue::Str(_) => b's',
        }
    }
}

/// Current wall clock time in microseconds, the resolution DCGM stores.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One open connection to a host engine. Calls block.
pub trait DcgmClient: Send {
    /// Creates `count` fake GPUs in one batch and returns the entities the
    /// host engine reports back.
    fn create_fake_entities(&mut self, count: u32) -> Result<Vec<EntityPair>, DcgmError>;

    fn set_device_attribute(
        &mut self,
        entity_id: u32,
        attribute: DeviceAttribute,
        value: &str,
    ) -> Result<(), DcgmError>;

    /// `timestamp_us` is microseconds since the epoch.
    fn inject_field_value(
        &mut self,
        entity_id: u32,
        field: MetricField,
        value: FieldValue,
        timestamp_us: i64,
    ) -> Result<(), DcgmError>;

    /// Ids of every GPU the host engine knows, including the baseline one.
    fn list_entities(&mut self) -> Result<Vec<u32>, DcgmError>;
}

/// Opens connections. Shared across threads so each refresh cycle can
/// connect on its own.
pub trait DcgmConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DcgmClient>, DcgmError>;
}
