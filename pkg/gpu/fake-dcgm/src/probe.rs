// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

/// Answers whether an endpoint is accepting connections.
///
/// Implementations never fail: any error means "not ready". Retrying is left
/// to the caller.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Readiness through a plain TCP connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpReadinessProbe;

#[async_trait]
impl ReadinessProbe for TcpReadinessProbe {
    async fn is_ready(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("readiness probe {addr}: {e}");
                false
            }
            Err(_) => {
                debug!("readiness probe {addr}: timed out after {timeout:?}");
                false
            }
        }
    }
}
