//! Host metrics sampler
//!
//! Collects CPU, memory, disk, network and system facts through `sysinfo`
//! and submits them to `/core/agent/metrics/`. The sampler is available when
//! host metrics are enabled and `sysinfo` supports the platform.

use crate::api::{ApiClient, Endpoint, ShipError, Transport};
use crate::config::AgentConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use tracing::{debug, warn};

mod cpu_facts;
mod disk_facts;
mod memory_facts;
mod network_facts;
mod system_facts;

pub use cpu_facts::{collect_cpu_facts, CoreFacts, CpuFacts, LoadAverage};
pub use disk_facts::{collect_disk_facts, DiskFacts};
pub use memory_facts::{collect_memory_facts, MemoryFacts};
pub use network_facts::{collect_network_facts, NetworkFacts};
pub use system_facts::{collect_system_facts, SystemFacts};

/// One host sample, as submitted
#[derive(Debug, Clone, Serialize)]
pub struct HostSample {
    pub machine_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_source_id: Option<String>,
    pub collected_at: DateTime<Utc>,
    pub cpu: CpuFacts,
    pub memory: MemoryFacts,
    pub disks: Vec<DiskFacts>,
    pub network: Vec<NetworkFacts>,
    pub system: SystemFacts,
}

pub struct HostSampler {
    machine_id: String,
    hostname: String,
    log_source_id: Option<String>,
    available: bool,
    /// Kept between samples so CPU usage is measured over the interval
    system: Mutex<System>,
}

impl HostSampler {
    pub fn from_config(config: &AgentConfig) -> Self {
        let identity = config.identity();
        let available = config.host_metrics_enabled && sysinfo::IS_SUPPORTED_SYSTEM;
        if config.host_metrics_enabled && !available {
            warn!("Host metrics are not supported on this platform");
        }

        let mut system = System::new();
        if available {
            system.refresh_cpu();
        }

        Self {
            machine_id: identity.machine_id.clone(),
            hostname: identity.hostname.clone(),
            log_source_id: config.log_source_id.clone().filter(|id| !id.trim().is_empty()),
            available,
            system: Mutex::new(system),
        }
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn collect(&self) -> HostSample {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        HostSample {
            machine_id: self.machine_id.clone(),
            hostname: self.hostname.clone(),
            log_source_id: self.log_source_id.clone(),
            collected_at: Utc::now(),
            cpu: collect_cpu_facts(&mut system),
            memory: collect_memory_facts(&mut system),
            disks: collect_disk_facts(),
            network: collect_network_facts(),
            system: collect_system_facts(),
        }
    }
}

/// POST a host sample to `/core/agent/metrics/`
pub fn send_host_sample<T: Transport>(
    client: &ApiClient<T>,
    sample: &HostSample,
) -> Result<(), ShipError> {
    match client.post_json(&Endpoint::host_metrics(), sample) {
        Ok(_) => {
            debug!("Host metrics sent");
            Ok(())
        }
        Err(e) => {
            warn!("Failed to send host metrics: {}", e);
            Err(e)
        }
    }
}
