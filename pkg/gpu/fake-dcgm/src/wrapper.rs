// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `dcgm.sh`, a wrapper running `dcgmi` with the NVML injection environment
//! so the fake GPUs can be inspected from a shell.

use crate::env::NVML_INJECTION_LIB;
use log::info;
use std::fs::{OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const WRAPPER_NAME: &str = "dcgm.sh";

pub fn wrapper_path(dcgm_dir: &Path) -> PathBuf {
    dcgm_dir.join(WRAPPER_NAME)
}

pub fn render(dcgm_dir: &Path) -> String {
    format!(
        r#"#!/bin/bash
# DCGM wrapper with injection environment
DCGM_DIR="{dir}"
export LD_LIBRARY_PATH=$DCGM_DIR/lib:$LD_LIBRARY_PATH
export LD_PRELOAD=$DCGM_DIR/lib/{lib}
export NVML_INJECTION_MODE=True
exec $DCGM_DIR/bin/dcgmi "$@"
"#,
        dir = dcgm_dir.display(),
        lib = NVML_INJECTION_LIB,
    )
}

/// Writes `<dcgm_dir>/dcgm.sh` with mode 0755, replacing any previous copy.
pub fn write_wrapper(dcgm_dir: &Path) -> std::io::Result<PathBuf> {
    let path = wrapper_path(dcgm_dir);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .mode(0o755)
        .open(&path)?;
    file.write_all(render(dcgm_dir).as_bytes())?;
    // mode() only applies when the file is created.
    std::fs::set_permissions(&path, Permissions::from_mode(0o755))?;

    info!("✓ Created wrapper: {}", path.display());
    Ok(path)
}
