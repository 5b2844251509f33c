use serde::{Deserialize, Serialize};

/// Largest capacity a queue can be built with. Larger or zero requests are
/// clamped to this bound, which is effectively unbounded.
pub const MAX_CAPACITY: usize = u32::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Requested element bound. `0` means unbounded.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl QueueConfig {
    pub fn bounded(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn unbounded() -> Self {
        Self { capacity: 0 }
    }

    /// The bound a queue built from this config actually enforces.
    pub fn effective_capacity(&self) -> usize {
        clamp_capacity(self.capacity)
    }
}

pub(crate) fn clamp_capacity(requested: usize) -> usize {
    if requested == 0 || requested > MAX_CAPACITY {
        MAX_CAPACITY
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_oversized_capacities_clamp() {
        assert_eq!(QueueConfig::unbounded().effective_capacity(), MAX_CAPACITY);
        assert_eq!(QueueConfig::bounded(0).effective_capacity(), MAX_CAPACITY);
        assert_eq!(QueueConfig::bounded(MAX_CAPACITY).effective_capacity(), MAX_CAPACITY);
        assert_eq!(QueueConfig::bounded(2).effective_capacity(), 2);
        assert_eq!(clamp_capacity(usize::MAX), MAX_CAPACITY);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: QueueConfig = serde_json::from_str("{}").expect("empty config parses");
        assert_eq!(config, QueueConfig::default());

        let config: QueueConfig =
            serde_json::from_str(r#"{"capacity": 64}"#).expect("capacity parses");
        assert_eq!(config.effective_capacity(), 64);
    }
}
