// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::dcgm::{BASELINE_ENTITY_ID, DcgmClient, DeviceAttribute};
use crate::error::{DcgmError, ProvisionError};
use log::{info, warn};

/// Model names handed out round-robin.
pub const GPU_MODELS: [&str; 6] = [
    "Tesla V100-SXM2-16GB",
    "Tesla V100-SXM2-32GB",
    "A100-SXM4-40GB",
    "A100-SXM4-80GB",
    "H100-SXM5-80GB",
    "A100-PCIE-40GB",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntity {
    pub entity_id: u32,
    pub model: String,
    pub uuid: String,
    pub pci_bus_id: String,
}

impl DeviceEntity {
    /// Attributes of the entity at 0-based `position` in a batch of
    /// `requested`.
    fn new(entity_id: u32, position: usize, model: &str, requested: u32) -> Self {
        let n = position + 1;
        Self {
            entity_id,
            model: model.to_string(),
            uuid: format!("GPU-{n:08x}-fake-dcgm-{n:04x}-{requested:04x}{n:08x}"),
            pci_bus_id: format!("00000000:{n:02x}:00.0"),
        }
    }

    pub fn attribute(&self, attribute: DeviceAttribute) -> &str {
        match attribute {
            DeviceAttribute::Name => &self.model,
            DeviceAttribute::Uuid => &self.uuid,
            DeviceAttribute::PciBusId => &self.pci_bus_id,
        }
    }
}

/// Creates fake GPUs and gives them descriptive attributes.
pub struct EntityProvisioner<'a> {
    client: &'a mut dyn DcgmClient,
}

impl<'a> EntityProvisioner<'a> {
    pub fn new(client: &'a mut dyn DcgmClient) -> Self {
        Self { client }
    }

    /// Creates `count` GPUs in one batch. Fewer than `count` coming back is an
    /// error, reported after the ones that were created got their attributes.
    pub fn create_entities(&mut self, count: u32) -> Result<Vec<DeviceEntity>, ProvisionError> {
        if count == 0 {
            info!("No fake GPUs requested");
            return Ok(Vec::new());
        }

        info!("Creating {count} fake GPUs...");
        let limit = usize::try_from(count).unwrap_or(usize::MAX);
        let ids: Vec<u32> = self
            .client
            .create_fake_entities(count)?
            .into_iter()
            .filter(|e| e.is_gpu() && e.id != BASELINE_ENTITY_ID)
            .map(|e| e.id)
            .take(limit)
            .collect();
        info!("✓ Created {} fake GPUs: {ids:?}", ids.len());

        let entities: Vec<DeviceEntity> = ids
            .iter()
            .zip(GPU_MODELS.iter().cycle())
            .enumerate()
            .map(|(position, (id, model))| DeviceEntity::new(*id, position, model, count))
            .collect();
        self.set_attributes(&entities)?;

        let created = u32::try_from(entities.len()).unwrap_or(u32::MAX);
        if created < count {
            warn!("Requested {count} fake GPUs but the host engine created {created}");
            return Err(ProvisionError::Shortfall {
                requested: count,
                created,
            });
        }
        Ok(entities)
    }

    fn set_attributes(&mut self, entities: &[DeviceEntity]) -> Result<(), DcgmError> {
        info!("Injecting GPU attributes (name, UUID, PCI)...");
        for entity in entities {
            for attribute in DeviceAttribute::ALL {
                match self.client.set_device_attribute(
                    entity.entity_id,
                    attribute,
                    entity.attribute(attribute),
                ) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(
                        "Could not inject {attribute} for GPU {}: {e}",
                        entity.entity_id
                    ),
                }
            }
            info!(
                "  GPU {}: {}, {}, {}",
                entity.entity_id, entity.model, entity.pci_bus_id, entity.uuid
            );
        }
        info!("✓ GPU attributes injected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::{DcgmConnector, EntityPair, InMemoryDcgm};

    fn provision(dcgm: &InMemoryDcgm, count: u32) -> Result<Vec<DeviceEntity>, ProvisionError> {
        let mut client = dcgm.connect().unwrap();
        EntityProvisioner::new(client.as_mut()).create_entities(count)
    }

    #[test]
    fn test_creates_requested_gpus_with_attributes() {
        let dcgm = InMemoryDcgm::new();
        let entities = provision(&dcgm, 4).unwrap();

        let ids: Vec<u32> = entities.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(dcgm.create_calls(), vec![4], "one batch call");

        assert_eq!(
            dcgm.attribute(1, DeviceAttribute::Name).as_deref(),
            Some("Tesla V100-SXM2-16GB")
        );
        assert_eq!(
            dcgm.attribute(1, DeviceAttribute::Uuid).as_deref(),
            Some("GPU-00000001-fake-dcgm-0001-000400000001")
        );
        assert_eq!(
            dcgm.attribute(1, DeviceAttribute::PciBusId).as_deref(),
            Some("00000000:01:00.0")
        );
        assert_eq!(
            dcgm.attribute(4, DeviceAttribute::Name).as_deref(),
            Some("A100-SXM4-80GB")
        );
        assert_eq!(dcgm.attribute_count(), 12);
    }

    #[test]
    fn test_models_wrap_around_catalog() {
        let dcgm = InMemoryDcgm::new();
        let entities = provision(&dcgm, 8).unwrap();

        assert_eq!(entities[5].model, "A100-PCIE-40GB");
        assert_eq!(entities[6].model, "Tesla V100-SXM2-16GB");
        assert_eq!(entities[7].model, "Tesla V100-SXM2-32GB");
        assert_eq!(entities[7].pci_bus_id, "00000000:08:00.0");
        assert_eq!(entities[7].uuid, "GPU-00000008-fake-dcgm-0008-000800000008");
    }

    #[test]
    fn test_zero_makes_no_call() {
        let dcgm = InMemoryDcgm::new();
        assert!(provision(&dcgm, 0).unwrap().is_empty());
        assert!(dcgm.create_calls().is_empty());
    }

    #[test]
    fn test_shortfall_is_reported_after_attributing_created() {
        let dcgm = InMemoryDcgm::new().with_shortfall(2);
        let err = provision(&dcgm, 3).unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Shortfall {
                requested: 3,
                created: 1
            }
        ));
        assert_eq!(
            dcgm.attribute(1, DeviceAttribute::Name).as_deref(),
            Some("Tesla V100-SXM2-16GB")
        );
    }

    #[test]
    fn test_baseline_and_foreign_entities_are_filtered() {
        let dcgm = InMemoryDcgm::new()
            .echoing_baseline()
            .with_foreign_entity(EntityPair { group: 5, id: 40 });
        let entities = provision(&dcgm, 2).unwrap();

        let ids: Vec<u32> = entities.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(dcgm.attribute(0, DeviceAttribute::Name), None);
    }

    #[test]
    fn test_attribute_failure_does_not_stop_provisioning() {
        let dcgm = InMemoryDcgm::new();
        dcgm.fail_attribute(DeviceAttribute::Uuid);

        let entities = provision(&dcgm, 2).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(dcgm.attribute(2, DeviceAttribute::Uuid), None);
        assert_eq!(
            dcgm.attribute(2, DeviceAttribute::PciBusId).as_deref(),
            Some("00000000:02:00.0")
        );
        assert_eq!(dcgm.attribute_count(), 4);
    }

    #[test]
    fn test_lost_connection_aborts() {
        let dcgm = InMemoryDcgm::new();
        let mut client = dcgm.connect().unwrap();
        dcgm.break_connection();

        let err = EntityProvisioner::new(client.as_mut())
            .create_entities(2)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Client(e) if e.is_fatal()));
    }
}
