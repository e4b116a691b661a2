// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `libdcgm.so` loaded at runtime from the DCGM build directory.

use super::{
    DcgmClient, DcgmConnector, DeviceAttribute, ENTITY_GROUP_GPU, EntityPair, FieldValue,
    MetricField, now_micros,
};
use crate::env::lib_dir;
use crate::error::DcgmError;
use libloading::{Library, library_filename};
use log::debug;
use std::ffi::{CString, c_char, c_int, c_uint};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DCGM_ST_OK: c_int = 0;
const MAX_NUM_DEVICES: usize = 32;
const MAX_HIERARCHY_INFO: usize = 256;
const MAX_STR_LENGTH: usize = 256;
const GPU_UUID_LENGTH: usize = 128;

/// Library names tried in order when the unversioned link is missing.
const VERSIONED_NAMES: [&str; 2] = ["libdcgm.so.4", "libdcgm.so.3"];

type DcgmHandle = usize;

type FnInit = unsafe extern "C" fn() -> c_int;
type FnShutdown = unsafe extern "C" fn() -> c_int;
type FnConnect = unsafe extern "C" fn(*const c_char, *mut DcgmHandle) -> c_int;
type FnDisconnect = unsafe extern "C" fn(DcgmHandle) -> c_int;
type FnGetAllDevices = unsafe extern "C" fn(DcgmHandle, *mut c_uint, *mut c_int) -> c_int;
type FnCreateFakeEntities = unsafe extern "C" fn(DcgmHandle, *mut CreateFakeEntities) -> c_int;
type FnInjectFieldValue = unsafe extern "C" fn(DcgmHandle, c_uint, *mut InjectFieldValue) -> c_int;

// Replicas of dcgm_structs.h

#[repr(C)]
#[derive(Clone, Copy)]
struct GroupEntityPair {
    entity_group_id: c_uint,
    entity_id: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MigEntityInfo {
    gpu_uuid: [c_char; GPU_UUID_LENGTH],
    nvml_gpu_index: c_uint,
    nvml_instance_id: c_uint,
    nvml_compute_instance_id: c_uint,
    nvml_mig_profile_id: c_uint,
    nvml_profile_slices: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MigHierarchyInfo {
    entity: GroupEntityPair,
    parent: GroupEntityPair,
    info: MigEntityInfo,
}

#[repr(C)]
struct CreateFakeEntities {
    version: c_uint,
    num_to_create: c_uint,
    entity_list: [MigHierarchyInfo; MAX_HIERARCHY_INFO],
}

#[repr(C)]
union InjectValue {
    i64: i64,
    dbl: f64,
    str: [c_char; MAX_STR_LENGTH],
}

#[repr(C)]
struct InjectFieldValue {
    version: c_uint,
    field_id: u16,
    field_type: u16,
    ts: i64,
    value: InjectValue,
}

const EMPTY_PAIR: GroupEntityPair = GroupEntityPair {
    entity_group_id: 0,
    entity_id: 0,
};

const EMPTY_HIERARCHY: MigHierarchyInfo = MigHierarchyInfo {
    entity: EMPTY_PAIR,
    parent: EMPTY_PAIR,
    info: MigEntityInfo {
        gpu_uuid: [0; GPU_UUID_LENGTH],
        nvml_gpu_index: 0,
        nvml_instance_id: 0,
        nvml_compute_instance_id: 0,
        nvml_mig_profile_id: 0,
        nvml_profile_slices: 0,
    },
};

/// `MAKE_DCGM_VERSION`: struct size in the low 24 bits, version on top.
const fn make_version(size: usize, version: u32) -> c_uint {
    (size as u32) | (version << 24)
}

const CREATE_FAKE_ENTITIES_VERSION: c_uint =
    make_version(size_of::<CreateFakeEntities>(), 2);
const INJECT_FIELD_VALUE_VERSION: c_uint = make_version(size_of::<InjectFieldValue>(), 1);

struct DcgmLibrary {
    init: FnInit,
    shutdown: FnShutdown,
    connect: FnConnect,
    disconnect: FnDisconnect,
    get_all_devices: FnGetAllDevices,
    create_fake_entities: FnCreateFakeEntities,
    inject_field_value: FnInjectFieldValue,
    // Keeps the function pointers above valid; dropped last.
    _lib: Library,
}

impl DcgmLibrary {
    fn load(path: &Path) -> Result<Self, DcgmError> {
        let lib_err = |reason: String| DcgmError::Library {
            path: path.to_path_buf(),
            reason,
        };
        // SAFETY: loading libdcgm runs its ELF constructors, which only set up
        // process-local state and have no preconditions on the caller.
        let lib = unsafe { Library::new(path) }.map_err(|e| lib_err(e.to_string()))?;

        let loaded = Self {
            init: symbol(&lib, path, b"dcgmInit\0")?,
            shutdown: symbol(&lib, path, b"dcgmShutdown\0")?,
            connect: symbol(&lib, path, b"dcgmConnect\0")?,
            disconnect: symbol(&lib, path, b"dcgmDisconnect\0")?,
            get_all_devices: symbol(&lib, path, b"dcgmGetAllDevices\0")?,
            create_fake_entities: symbol(&lib, path, b"dcgmCreateFakeEntities\0")?,
            inject_field_value: symbol(&lib, path, b"dcgmInjectFieldValue\0")?,
            _lib: lib,
        };

        // SAFETY: dcgmInit takes no arguments and must precede every other
        // DCGM call, which is guaranteed since the library was just loaded.
        check("dcgmInit", unsafe { (loaded.init)() })?;
        debug!("loaded {}", path.display());
        Ok(loaded)
    }
}

impl Drop for DcgmLibrary {
    fn drop(&mut self) {
        // SAFETY: every client holds an Arc on the library, so no handle is
        // still in use once the last reference is dropped.
        let rc = unsafe { (self.shutdown)() };
        if rc != DCGM_ST_OK {
            debug!("dcgmShutdown returned {rc}");
        }
    }
}

fn symbol<T: Copy>(lib: &Library, path: &Path, name: &'static [u8]) -> Result<T, DcgmError> {
    // SAFETY: T is the signature declared for `name` in dcgm_agent.h and the
    // returned pointer never outlives `lib`, which DcgmLibrary owns.
    unsafe { lib.get::<T>(name) }
        .map(|sym| *sym)
        .map_err(|e| DcgmError::Library {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn check(call: &'static str, rc: c_int) -> Result<(), DcgmError> {
    if rc == DCGM_ST_OK {
        Ok(())
    } else {
        Err(DcgmError::Api { call, code: rc })
    }
}

/// First DCGM library present under `<dcgm_dir>/lib`, or the unversioned
/// name when none is.
pub fn find_library(dcgm_dir: &Path) -> PathBuf {
    let dir = lib_dir(dcgm_dir);
    let unversioned = dir.join(library_filename("dcgm"));
    std::iter::once(unversioned.clone())
        .chain(VERSIONED_NAMES.iter().map(|name| dir.join(name)))
        .find(|candidate| candidate.exists())
        .unwrap_or(unversioned)
}

/// Connects to a host engine through `libdcgm.so`. The library is loaded on
/// the first connection and kept for the lifetime of the connector.
pub struct LibDcgmConnector {
    dcgm_dir: PathBuf,
    address: String,
    lib: Mutex<Option<Arc<DcgmLibrary>>>,
}

impl LibDcgmConnector {
    pub fn new(dcgm_dir: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        Self {
            dcgm_dir: dcgm_dir.into(),
            address: address.into(),
            lib: Mutex::new(None),
        }
    }

    fn library(&self) -> Result<Arc<DcgmLibrary>, DcgmError> {
        let mut slot = self.lib.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lib) = slot.as_ref() {
            return Ok(Arc::clone(lib));
        }
        let lib = Arc::new(DcgmLibrary::load(&find_library(&self.dcgm_dir))?);
        *slot = Some(Arc::clone(&lib));
        Ok(lib)
    }
}

impl DcgmConnector for LibDcgmConnector {
    fn connect(&self) -> Result<Box<dyn DcgmClient>, DcgmError> {
        let lib = self.library()?;
        let conn_err = |reason: String| DcgmError::Connection {
            address: self.address.clone(),
            reason,
        };
        let address =
            CString::new(self.address.as_str()).map_err(|e| conn_err(e.to_string()))?;
        let mut handle: DcgmHandle = 0;

        // SAFETY: `address` is NUL terminated and outlives the call; `handle`
        // is a valid out pointer.
        let rc = unsafe { (lib.connect)(address.as_ptr(), &mut handle) };
        if rc != DCGM_ST_OK {
            return Err(conn_err(format!("dcgmConnect returned {rc}")));
        }
        debug!("connected to host engine at {} (handle {handle})", self.address);

        Ok(Box::new(LibDcgmClient { lib, handle }))
    }
}

struct LibDcgmClient {
    lib: Arc<DcgmLibrary>,
    handle: DcgmHandle,
}

impl LibDcgmClient {
    fn inject(
        &mut self,
        entity_id: u32,
        field_id: u16,
        value: &FieldValue,
        timestamp_us: i64,
    ) -> Result<(), DcgmError> {
        let field_type = u16::from(value.type_tag());
        let value = match value {
            FieldValue::Int64(v) => InjectValue { i64: *v },
            FieldValue::Double(v) => InjectValue { dbl: *v },
            FieldValue::Str(s) => InjectValue {
                str: encode_str(s)?,
            },
        };
        let mut request = InjectFieldValue {
            version: INJECT_FIELD_VALUE_VERSION,
            field_id,
            field_type,
            ts: timestamp_us,
            value,
        };

        // SAFETY: `request` is a fully initialized dcgmInjectFieldValue_v1
        // exclusively borrowed for the duration of the call.
        let rc = unsafe { (self.lib.inject_field_value)(self.handle, entity_id, &mut request) };
        check("dcgmInjectFieldValue", rc)
    }
}

impl DcgmClient for LibDcgmClient {
    fn create_fake_entities(&mut self, count: u32) -> Result<Vec<EntityPair>, DcgmError> {
        let requested = usize::try_from(count)
            .ok()
            .filter(|n| *n <= MAX_HIERARCHY_INFO)
            .ok_or_else(|| DcgmError::InvalidArgument {
                call: "dcgmCreateFakeEntities",
                reason: format!("at most {MAX_HIERARCHY_INFO} entities per batch, got {count}"),
            })?;

        let mut request = Box::new(CreateFakeEntities {
            version: CREATE_FAKE_ENTITIES_VERSION,
            num_to_create: count,
            entity_list: [EMPTY_HIERARCHY; MAX_HIERARCHY_INFO],
        });
        for slot in request.entity_list.iter_mut().take(requested) {
            slot.entity.entity_group_id = ENTITY_GROUP_GPU;
        }

        // SAFETY: `request` points to a valid dcgmCreateFakeEntities_v2 that
        // DCGM fills in place; nothing else aliases it during the call.
        let rc = unsafe { (self.lib.create_fake_entities)(self.handle, &mut *request) };
        check("dcgmCreateFakeEntities", rc)?;

        let returned = usize::try_from(request.num_to_create)
            .unwrap_or(0)
            .min(MAX_HIERARCHY_INFO);
        Ok(request
            .entity_list
            .iter()
            .take(returned)
            .map(|e| EntityPair {
                group: e.entity.entity_group_id,
                id: e.entity.entity_id,
            })
            .collect())
    }

    fn set_device_attribute(
        &mut self,
        entity_id: u32,
        attribute: DeviceAttribute,
        value: &str,
    ) -> Result<(), DcgmError> {
        self.inject(
            entity_id,
            attribute.field_id(),
            &FieldValue::Str(value.to_string()),
            now_micros(),
        )
    }

    fn inject_field_value(
        &mut self,
        entity_id: u32,
        field: MetricField,
        value: FieldValue,
        timestamp_us: i64,
    ) -> Result<(), DcgmError> {
        self.inject(entity_id, field.field_id(), &value, timestamp_us)
    }

    fn list_entities(&mut self) -> Result<Vec<u32>, DcgmError> {
        let mut ids: [c_uint; MAX_NUM_DEVICES] = [0; MAX_NUM_DEVICES];
        let mut count: c_int = 0;

        // SAFETY: `ids` has room for DCGM_MAX_NUM_DEVICES entries, as the API
        // requires, and `count` is a valid out pointer.
        let rc = unsafe { (self.lib.get_all_devices)(self.handle, ids.as_mut_ptr(), &mut count) };
        check("dcgmGetAllDevices", rc)?;

        let count = usize::try_from(count).unwrap_or(0).min(MAX_NUM_DEVICES);
        Ok(ids.iter().take(count).copied().collect())
    }
}

impl Drop for LibDcgmClient {
    fn drop(&mut self) {
        // SAFETY: the handle came from dcgmConnect and is disconnected once.
        let rc = unsafe { (self.lib.disconnect)(self.handle) };
        if rc != DCGM_ST_OK {
            debug!("dcgmDisconnect returned {rc}");
        }
    }
}

/// Copies `s` into a NUL terminated DCGM string buffer, truncating to fit.
fn encode_str(s: &str) -> Result<[c_char; MAX_STR_LENGTH], DcgmError> {
    if s.contains('\0') {
        return Err(DcgmError::InvalidArgument {
            call: "dcgmInjectFieldValue",
            reason: "string value contains a NUL byte".to_string(),
        });
    }
    let mut buf: [c_char; MAX_STR_LENGTH] = [0; MAX_STR_LENGTH];
    for (dst, src) in buf
        .iter_mut()
        .take(MAX_STR_LENGTH - 1)
        .zip(s.as_bytes().iter())
    {
        *dst = *src as c_char;
    }
    Ok(buf)
}
