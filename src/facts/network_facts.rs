//! Network facts collector

use serde::Serialize;
use sysinfo::Networks;

/// Cumulative counters for one interface since boot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkFacts {
    pub name: String,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub packets_received: u64,
    pub packets_transmitted: u64,
    pub errors_on_received: u64,
    pub errors_on_transmitted: u64,
}

pub fn collect_network_facts() -> Vec<NetworkFacts> {
    let networks = Networks::new_with_refreshed_list();

    let mut interfaces: Vec<NetworkFacts> = networks
        .list()
        .iter()
        .map(|(name, data)| NetworkFacts {
            name: name.clone(),
            bytes_received: data.total_received(),
            bytes_transmitted: data.total_transmitted(),
            packets_received: data.total_packets_received(),
            packets_transmitted: data.total_packets_transmitted(),
            errors_on_received: data.total_errors_on_received(),
            errors_on_transmitted: data.total_errors_on_transmitted(),
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interfaces_sorted_and_named() {
        let interfaces = collect_network_facts();
        for pair in interfaces.windows(2) {
            assert!(pair[0].name <= pair[1].name);
        }
        assert!(interfaces.iter().all(|i| !i.name.is_empty()));
    }
}
