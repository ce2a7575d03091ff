/// Deterministic `group_key → shard` mapping.
///
/// Uses a fixed splitmix64 finalizer rather than `std::hash`, whose output
/// may differ between builds, so the same key lands on the same shard after
/// a restart.
#[derive(Debug, Clone, Copy)]
pub struct KeyRouter {
    shards: usize,
}

impl KeyRouter {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: shards.max(1),
        }
    }

    pub fn shard_for(&self, group_key: i64) -> usize {
        (mix64(group_key) % self.shards as u64) as usize
    }
}

pub fn mix64(key: i64) -> u64 {
    let mut z = (key as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
