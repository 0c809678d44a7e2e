//! In-process stand-ins for the compute and storage collaborators.
//!
//! Used by standalone mode so the control plane can be exercised without a
//! real orchestration backend: instances get synthetic addresses and
//! volumes get synthetic ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use tierscale_lifecycle::Provisioner;
use tierscale_state::{BindingId, Tier, TierscaleConfig};
use tierscale_stateful::StorageProvider;

/// Hands out `10.<tier>.0.<n>:<port>` addresses after an optional delay.
pub struct SimulatedProvisioner {
    ports: HashMap<String, u16>,
    next_host: AtomicU32,
    latency: Duration,
}

impl SimulatedProvisioner {
    pub fn new(config: &TierscaleConfig, latency: Duration) -> Self {
        Self {
            ports: config
                .services
                .iter()
                .map(|s| (s.name.clone(), s.port))
                .collect(),
            next_host: AtomicU32::new(0),
            latency,
        }
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn create(
        &self,
        service: &str,
        tier: Tier,
        instance_id: &str,
        ordinal: Option<u32>,
    ) -> anyhow::Result<String> {
        let port = *self
            .ports
            .get(service)
            .ok_or_else(|| anyhow::anyhow!("no port configured for service {service}"))?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let host = self.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        let subnet = match tier {
            Tier::Stateless => 1,
            Tier::Stateful => 2,
        };
        let address = format!("10.{subnet}.{}.{}:{port}", host / 250, host % 250 + 1);
        info!(%service, instance = %instance_id, ?ordinal, %address, "simulated instance allocated");
        Ok(address)
    }

    async fn terminate(&self, instance_id: &str) -> anyhow::Result<()> {
        info!(instance = %instance_id, "simulated instance released");
        Ok(())
    }
}

/// Mints volume ids; release only logs.
#[derive(Default)]
pub struct SimulatedStorage {
    next_volume: AtomicU32,
}

#[async_trait]
impl StorageProvider for SimulatedStorage {
    async fn bind(&self, service: &str, ordinal: u32) -> anyhow::Result<BindingId> {
        let n = self.next_volume.fetch_add(1, Ordering::Relaxed) + 1;
        let binding = format!("vol-{service}-{ordinal}-{n:04}");
        info!(%service, ordinal, %binding, "simulated volume created");
        Ok(binding)
    }

    async fn release(&self, service: &str, ordinal: u32, binding: &str) -> anyhow::Result<()> {
        info!(%service, ordinal, %binding, "simulated volume detached");
        Ok(())
    }
}
