//! Stable MAC addresses for NICs declared without one.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Derive the MAC for NIC `nic_index` of VM `vmid`.
///
/// The generator is seeded with `vmid + nic_index`, so re-applying the same
/// spec always yields the same address (DHCP reservations keep working).
/// Two VMs whose sums coincide get the same MAC.
pub fn generate_mac(vmid: u32, nic_index: u32) -> String {
    let seed = u64::from(vmid) + u64::from(nic_index);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = [0u8; 6];
    rng.fill_bytes(&mut bytes);
    // unicast, locally administered
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    format_mac(&bytes)
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
