// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Synthetic telemetry.
//!
//! Values scale with the entity id so GPUs are distinguishable on a dashboard,
//! with a small random jitter on top, and are always clamped to a plausible
//! range.

use crate::dcgm::{BASELINE_ENTITY_ID, DcgmClient, FieldValue, MetricField, now_micros};
use crate::error::DcgmError;
use log::{debug, info, warn};
use rand::Rng;

/// Framebuffer size reported for every fake GPU, in MiB.
pub const FB_TOTAL_MIB: i64 = 16384;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuTelemetry {
    pub entity_id: u32,
    pub temperature: i64,
    pub power: f64,
    pub gpu_util: i64,
    pub mem_copy_util: i64,
    pub sm_clock: i64,
    pub mem_clock: i64,
    pub fb_total: i64,
    pub fb_used: i64,
    pub fb_free: i64,
}

impl GpuTelemetry {
    pub fn generate<R: Rng + ?Sized>(entity_id: u32, rng: &mut R) -> Self {
        let step = i64::from(entity_id) - 1;

        let temperature = (50 + step * 5 + rng.random_range(0..=5)).clamp(45, 85);
        let power = (150 + step * 20 + rng.random_range(-10..=10)).clamp(100, 300);
        let gpu_util = (30 + step * 10 + rng.random_range(-5..=5)).clamp(0, 100);
        let mem_copy_util = (40 + step * 5 + rng.random_range(-5..=5)).clamp(0, 100);
        let sm_clock = 1400 + rng.random_range(-50..=100);
        let mem_clock = 877 + rng.random_range(-20..=0);
        let fb_used = (4096 + step * 1024 + rng.random_range(-512..=512)).clamp(2048, 14336);

        Self {
            entity_id,
            temperature,
            power: power as f64,
            gpu_util,
            mem_copy_util,
            sm_clock,
            mem_clock,
            fb_total: FB_TOTAL_MIB,
            fb_used,
            fb_free: FB_TOTAL_MIB - fb_used,
        }
    }

    /// Samples in push order.
    pub fn samples(&self) -> [(MetricField, FieldValue); 9] {
        [
            (MetricField::Temperature, FieldValue::Int64(self.temperature)),
            (MetricField::Power, FieldValue::Double(self.power)),
            (MetricField::GpuUtil, FieldValue::Int64(self.gpu_util)),
            (MetricField::MemCopyUtil, FieldValue::Int64(self.mem_copy_util)),
            (MetricField::SmClock, FieldValue::Int64(self.sm_clock)),
            (MetricField::MemClock, FieldValue::Int64(self.mem_clock)),
            (MetricField::FbTotal, FieldValue::Int64(self.fb_total)),
            (MetricField::FbUsed, FieldValue::Int64(self.fb_used)),
            (MetricField::FbFree, FieldValue::Int64(self.fb_free)),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub entities: usize,
    pub pushed: usize,
    pub failed: usize,
}

pub struct TelemetryRefresher<'a> {
    client: &'a mut dyn DcgmClient,
}

impl<'a> TelemetryRefresher<'a> {
    pub fn new(client: &'a mut dyn DcgmClient) -> Self {
        Self { client }
    }

    /// Pushes a fresh set of samples for every id but the baseline GPU.
    ///
    /// Rejected samples are counted and skipped. A connection-level failure
    /// ends the cycle.
    pub fn refresh<R: Rng + ?Sized>(
        &mut self,
        entity_ids: &[u32],
        rng: &mut R,
    ) -> Result<RefreshReport, DcgmError> {
        info!("Injecting realistic metrics...");
        let mut report = RefreshReport::default();

        for &entity_id in entity_ids.iter().filter(|id| **id != BASELINE_ENTITY_ID) {
            let telemetry = GpuTelemetry::generate(entity_id, rng);
            for (field, value) in telemetry.samples() {
                match self
                    .client
                    .inject_field_value(entity_id, field, value, now_micros())
                {
                    Ok(()) => report.pushed += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Could not inject {} for GPU {entity_id}: {e}", field.name());
                        report.failed += 1;
                    }
                }
            }
            report.entities += 1;
            info!(
                "  GPU {entity_id}: {}°C, {}W, {}% util",
                telemetry.temperature, telemetry.power, telemetry.gpu_util
            );
        }

        info!("✓ Metrics injected");
        debug!("refresh report: {report:?}");
        Ok(report)
    }

    /// Refreshes every GPU the host engine currently knows.
    pub fn refresh_all<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<RefreshReport, DcgmError> {
        let ids = self.client.list_entities()?;
        self.refresh(&ids, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::{DcgmConnector, InMemoryDcgm};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn assert_in_range(t: &GpuTelemetry) {
        assert!((45..=85).contains(&t.temperature), "{t:?}");
        assert!((100.0..=300.0).contains(&t.power), "{t:?}");
        assert!((0..=100).contains(&t.gpu_util), "{t:?}");
        assert!((0..=100).contains(&t.mem_copy_util), "{t:?}");
        assert!((1350..=1500).contains(&t.sm_clock), "{t:?}");
        assert!((857..=877).contains(&t.mem_clock), "{t:?}");
        assert!((2048..=14336).contains(&t.fb_used), "{t:?}");
        assert_eq!(t.fb_total, FB_TOTAL_MIB);
        assert_eq!(t.fb_used + t.fb_free, t.fb_total);
    }

    #[test]
    fn test_values_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for entity_id in (1..=64).chain([1_000, u32::MAX - 1, u32::MAX]) {
            for _ in 0..50 {
                assert_in_range(&GpuTelemetry::generate(entity_id, &mut rng));
            }
        }
    }

    #[test]
    fn test_values_scale_with_entity_id() {
        let mut rng = StdRng::seed_from_u64(11);
        let first = GpuTelemetry::generate(1, &mut rng);
        assert!((50..=55).contains(&first.temperature));
        assert!((140.0..=160.0).contains(&first.power));

        // High ids saturate at the top of each range.
        let last = GpuTelemetry::generate(40, &mut rng);
        assert_eq!(last.temperature, 85);
        assert_eq!(last.power, 300.0);
        assert_eq!(last.gpu_util, 100);
        assert_eq!(last.fb_used, 14336);
        assert_eq!(last.fb_free, 2048);
    }

    #[test]
    fn test_refresh_skips_baseline_and_pushes_every_field() {
        let dcgm = InMemoryDcgm::new();
        let mut client = dcgm.connect().unwrap();
        client.create_fake_entities(2).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let report = TelemetryRefresher::new(client.as_mut())
            .refresh(&[0, 1, 2], &mut rng)
            .unwrap();

        assert_eq!(
            report,
            RefreshReport {
                entities: 2,
                pushed: 18,
                failed: 0
            }
        );
        assert!(dcgm.injections_for(0).is_empty());

        let pushed = dcgm.injections_for(2);
        assert_eq!(pushed.len(), 9);
        for injection in &pushed {
            match injection.field {
                MetricField::Power => assert!(matches!(injection.value, FieldValue::Double(_))),
                _ => assert!(matches!(injection.value, FieldValue::Int64(_))),
            }
            assert!(injection.timestamp_us > 0);
        }
    }

    #[test]
    fn test_rejected_sample_is_counted_not_fatal() {
        let dcgm = InMemoryDcgm::new();
        let mut client = dcgm.connect().unwrap();
        client.create_fake_entities(2).unwrap();
        dcgm.fail_field(1, MetricField::SmClock);

        let mut rng = StdRng::seed_from_u64(2);
        let report = TelemetryRefresher::new(client.as_mut())
            .refresh_all(&mut rng)
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 17);
        assert_eq!(dcgm.injections_for(2).len(), 9);
    }

    #[test]
    fn test_lost_connection_ends_cycle() {
        let dcgm = InMemoryDcgm::new();
        let mut client = dcgm.connect().unwrap();
        client.create_fake_entities(2).unwrap();
        dcgm.break_connection();

        let mut rng = StdRng::seed_from_u64(3);
        let err = TelemetryRefresher::new(client.as_mut())
            .refresh(&[1, 2], &mut rng)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(dcgm.injections().is_empty());
    }
}
