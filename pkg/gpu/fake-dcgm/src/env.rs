// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Environment overlay that makes a DCGM build run on top of the NVML
//! injection library instead of a real driver.

use std::path::{Path, PathBuf};

pub const NVML_INJECTION_LIB: &str = "libnvml_injection.so.1.0.0";

pub fn lib_dir(dcgm_dir: &Path) -> PathBuf {
    dcgm_dir.join("lib")
}

pub fn injection_lib(dcgm_dir: &Path) -> PathBuf {
    lib_dir(dcgm_dir).join(NVML_INJECTION_LIB)
}

/// Variables to set on the host engine, given a lookup for the inherited
/// environment. Search paths are prepended to, never replaced.
pub fn injection_env<F>(dcgm_dir: &Path, inherited: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let tests_dir = dcgm_dir.join("share").join("dcgm_tests");
    vec![
        (
            "LD_LIBRARY_PATH".to_string(),
            prepend_search_path(&lib_dir(dcgm_dir), inherited("LD_LIBRARY_PATH")),
        ),
        (
            "LD_PRELOAD".to_string(),
            injection_lib(dcgm_dir).display().to_string(),
        ),
        ("NVML_INJECTION_MODE".to_string(), "True".to_string()),
        (
            "PYTHONPATH".to_string(),
            prepend_search_path(&tests_dir, inherited("PYTHONPATH")),
        ),
    ]
}

/// Overlay computed against the current process environment.
pub fn injection_env_from_process(dcgm_dir: &Path) -> Vec<(String, String)> {
    injection_env(dcgm_dir, |key| std::env::var(key).ok())
}

fn prepend_search_path(entry: &Path, existing: Option<String>) -> String {
    match existing {
        Some(rest) if !rest.is_empty() => format!("{}:{rest}", entry.display()),
        _ => entry.display().to_string(),
    }
}
