//! Port allocation.
//!
//! Pure fixed-offset scheme: worker i gets `desktop_base + i` and
//! `shell_base + i`. No randomness and no state — re-running with the same
//! spec always yields the same mapping, which the firewall synchronizer's
//! idempotence depends on.

use crate::error::ConfigError;
use crate::fleet::FleetSpec;

/// The externally-reachable port pair for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PortPair {
    pub desktop: u16,
    pub shell: u16,
}

/// Allocate the port pair for `index` (1-based).
///
/// Total for any index within a validated spec; the range and collision
/// checks here make it safe to call for a single index without re-validating
/// the whole fleet.
pub fn allocate(index: u32, spec: &FleetSpec) -> Result<PortPair, ConfigError> {
    let desktop = checked_port(spec.desktop_base_port, index, spec.size, "desktop")?;
    let shell = checked_port(spec.shell_base_port, index, spec.size, "shell")?;

    for (namespace, port) in [("desktop", desktop), ("shell", shell)] {
        if spec.reserved_ports.contains(&port) {
            return Err(ConfigError::ReservedPortCollision {
                index,
                namespace,
                port,
            });
        }
    }
    if desktop == shell {
        return Err(ConfigError::NamespaceOverlap {
            index,
            port: desktop,
        });
    }

    Ok(PortPair { desktop, shell })
}

fn checked_port(
    base: u16,
    index: u32,
    size: u32,
    namespace: &'static str,
) -> Result<u16, ConfigError> {
    let port = base as u32 + index;
    u16::try_from(port).map_err(|_| ConfigError::PortRangeExceeded {
        size,
        namespace,
        port,
    })
}

/// Validate the whole fleet's allocation: every pair in range, no reserved
/// port hit, and the two namespaces disjoint across all indices.
pub fn validate_ports(spec: &FleetSpec) -> Result<(), ConfigError> {
    let mut desktops = Vec::with_capacity(spec.size as usize);
    for index in 1..=spec.size {
        let pair = allocate(index, spec)?;
        desktops.push(pair.desktop);
    }
    // Cross-namespace check: a shell port equal to any desktop port means
    // the two ranges overlap for this fleet size.
    for index in 1..=spec.size {
        let shell = spec.shell_base_port as u32 + index;
        if let Ok(shell) = u16::try_from(shell)
            && desktops.contains(&shell)
        {
            return Err(ConfigError::NamespaceOverlap { index, port: shell });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn spec(size: u32) -> FleetSpec {
        FleetSpec {
            size,
            desktop_base_port: 54040,
            shell_base_port: 52520,
            reserved_ports: [22, 51800].into_iter().collect(),
            domain: "freelancers.example.com".to_string(),
        }
    }

    #[test]
    fn fixed_offset_scheme() {
        let s = spec(3);
        let pair = allocate(2, &s).unwrap();
        assert_eq!(pair.desktop, 54042);
        assert_eq!(pair.shell, 52522);
    }

    #[test]
    fn allocation_is_deterministic() {
        let s = spec(5);
        for index in 1..=5 {
            assert_eq!(allocate(index, &s).unwrap(), allocate(index, &s).unwrap());
        }
    }

    #[test]
    fn all_ports_distinct_and_unreserved() {
        let s = spec(20);
        let mut seen = BTreeSet::new();
        for index in 1..=20 {
            let pair = allocate(index, &s).unwrap();
            assert!(seen.insert(pair.desktop));
            assert!(seen.insert(pair.shell));
            assert!(!s.reserved_ports.contains(&pair.desktop));
            assert!(!s.reserved_ports.contains(&pair.shell));
        }
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn range_overflow_is_config_error() {
        let s = FleetSpec {
            desktop_base_port: 65530,
            ..spec(10)
        };
        let err = allocate(10, &s).unwrap_err();
        assert!(matches!(err, ConfigError::PortRangeExceeded { .. }));
        assert!(validate_ports(&s).is_err());
    }

    #[test]
    fn reserved_port_collision_names_the_port() {
        let mut s = spec(3);
        s.reserved_ports.insert(54042);
        let err = allocate(2, &s).unwrap_err();
        match err {
            ConfigError::ReservedPortCollision { port, index, .. } => {
                assert_eq!(port, 54042);
                assert_eq!(index, 2);
            }
            other => panic!("expected ReservedPortCollision, got: {other:?}"),
        }
    }

    #[test]
    fn overlapping_namespaces_rejected() {
        let s = FleetSpec {
            desktop_base_port: 54040,
            shell_base_port: 54042,
            ..spec(5)
        };
        assert!(matches!(
            validate_ports(&s),
            Err(ConfigError::NamespaceOverlap { .. })
        ));
    }

    #[test]
    fn empty_fleet_validates() {
        assert!(validate_ports(&spec(0)).is_ok());
    }
}
