//! Consistent-hash device sharding.
//!
//! Builds a virtual-node ring over the `passing` instances of a
//! membership snapshot and maps each device key (`host:port`) to its
//! owning slot id. The ring is deterministic for a given instance set,
//! so every collector computes the same ownership independently.

/// Virtual nodes per instance on the ring.
const VNODES_PER_INSTANCE: u32 = 100;

use crate::Instance;

/// A consistent-hash ring over healthy instances.
#[derive(Debug, Clone)]
pub struct ShardRing {
    ring: Vec<(u64, String)>,
}

impl ShardRing {
    /// Builds the ring from a membership snapshot.
    ///
    /// Only instances whose aggregated health is `passing` are placed
    /// on the ring.
    #[must_use]
    pub fn new(instances: &[Instance]) -> Self {
        Self::with_vnodes(instances, VNODES_PER_INSTANCE)
    }

    /// Builds the ring with an explicit virtual-node count.
    #[must_use]
    pub fn with_vnodes(instances: &[Instance], vnodes: u32) -> Self {
        let mut ring = Vec::new();
        for instance in instances.iter().filter(|i| i.is_passing()) {
            for vnode in 0..vnodes {
                let position = fnv1a(format!("{}|{vnode}", instance.id).as_bytes());
                ring.push((position, instance.id.clone()));
            }
        }
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        Self { ring }
    }

    /// Whether no healthy instance is on the ring.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The slot id owning `device_key`, or `None` on an empty ring.
    #[must_use]
    pub fn owner(&self, device_key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let position = fnv1a(device_key.as_bytes());
        let index = match self.ring.binary_search_by_key(&position, |(p, _)| *p) {
            Ok(index) => index,
            Err(index) if index >= self.ring.len() => 0, // wrap around
            Err(index) => index,
        };
        Some(self.ring[index].1.as_str())
    }
}

/// 64-bit FNV-1a.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instance(id: &str, status: &str) -> Instance {
        Instance {
            id: id.to_string(),
            address: format!("host-{id}"),
            meta: HashMap::new(),
            status: status.to_string(),
        }
    }

    #[test]
    fn test_owner_is_deterministic() {
        let instances = vec![instance("0", "passing"), instance("1", "passing")];
        let ring_a = ShardRing::new(&instances);
        let ring_b = ShardRing::new(&instances);

        for n in 0..50 {
            let key = format!("core{n}.lhr:50051");
            assert_eq!(ring_a.owner(&key), ring_b.owner(&key));
        }
    }

    #[test]
    fn test_owner_stable_under_stable_membership() {
        let instances = vec![
            instance("0", "passing"),
            instance("1", "passing"),
            instance("2", "passing"),
        ];
        let ring = ShardRing::new(&instances);
        let owner = ring.owner("core1.lhr:50051").map(str::to_string);

        // Rebuilding from the same membership never moves a device.
        for _ in 0..10 {
            let rebuilt = ShardRing::new(&instances);
            assert_eq!(rebuilt.owner("core1.lhr:50051").map(str::to_string), owner);
        }
    }

    #[test]
    fn test_failing_instances_excluded() {
        let instances = vec![instance("0", "passing"), instance("1", "critical")];
        let ring = ShardRing::new(&instances);

        for n in 0..20 {
            assert_eq!(ring.owner(&format!("core{n}:50051")), Some("0"));
        }
    }

    #[test]
    fn test_empty_ring() {
        let ring = ShardRing::new(&[]);
        assert!(ring.is_empty());
        assert_eq!(ring.owner("core1:50051"), None);

        let unhealthy = vec![instance("0", "critical")];
        assert!(ShardRing::new(&unhealthy).is_empty());
    }

    #[test]
    fn test_distribution_covers_instances() {
        let instances = vec![
            instance("0", "passing"),
            instance("1", "passing"),
            instance("2", "passing"),
        ];
        let ring = ShardRing::new(&instances);

        let mut per_owner: HashMap<String, usize> = HashMap::new();
        for n in 0..300 {
            let owner = ring.owner(&format!("core{n}.lhr:50051")).unwrap();
            *per_owner.entry(owner.to_string()).or_insert(0) += 1;
        }
        // Every instance owns a share of a large device set.
        assert_eq!(per_owner.len(), 3, "owners: {per_owner:?}");
    }

    #[test]
    fn test_membership_growth_moves_only_a_subset() {
        let two = vec![instance("0", "passing"), instance("1", "passing")];
        let three = vec![
            instance("0", "passing"),
            instance("1", "passing"),
            instance("2", "passing"),
        ];
        let ring_two = ShardRing::new(&two);
        let ring_three = ShardRing::new(&three);

        let mut moved = 0;
        for n in 0..200 {
            let key = format!("core{n}.lhr:50051");
            if ring_two.owner(&key) != ring_three.owner(&key) {
                moved += 1;
            }
        }
        assert!(moved > 0, "a new instance must take over some devices");
        assert!(moved < 200, "a new instance must not take over everything");
    }
}
