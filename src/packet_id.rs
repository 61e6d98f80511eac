use rand::Rng;

/// Issues the 16-bit identifiers that correlate requests with their
/// acknowledgments. Ids increase monotonically and wrap at 65536; the
/// random seed reduces the risk of colliding with ids from a previous
/// session on the same broker. No active tracking against in-flight ids
/// is performed.
pub struct PacketIdAllocator {
    packet_id: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen_range(1..=100u16) * 100;
        PacketIdAllocator::seeded(seed)
    }

    pub fn seeded(seed: u16) -> Self {
        PacketIdAllocator { packet_id: seed }
    }

    pub fn next_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1);
        self.packet_id
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        PacketIdAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn seed_is_in_expected_range() {
        for _ in 0..50 {
            let mut allocator = PacketIdAllocator::new();
            let first = allocator.next_id();
            assert!((101..=10001).contains(&first), "first id {}", first);
        }
    }

    #[test]
    fn ids_increase_monotonically() {
        let mut allocator = PacketIdAllocator::seeded(500);
        assert_eq!(allocator.next_id(), 501);
        assert_eq!(allocator.next_id(), 502);
        assert_eq!(allocator.next_id(), 503);
    }

    #[test]
    fn full_cycle_visits_every_value_once() {
        let mut allocator = PacketIdAllocator::seeded(4200);
        let mut seen = HashSet::with_capacity(65536);
        for _ in 0..65536u32 {
            assert!(seen.insert(allocator.next_id()));
        }
        assert_eq!(seen.len(), 65536);
        // The next call repeats the cycle.
        assert_eq!(allocator.next_id(), 4201);
    }

    #[test]
    fn wraps_at_65536() {
        let mut allocator = PacketIdAllocator::seeded(0xFFFE);
        assert_eq!(allocator.next_id(), 0xFFFF);
        assert_eq!(allocator.next_id(), 0);
        assert_eq!(allocator.next_id(), 1);
    }
}
