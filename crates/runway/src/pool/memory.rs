//! Host memory probing for low-memory eviction.

use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Source of the host's memory situation.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of memory still available, between 0 and 1. `None` when it
    /// cannot be determined.
    fn available_fraction(&self) -> Option<f64>;
}

/// Asks the OS through `sysinfo`. Only memory figures are refreshed.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl Default for SystemMemory {
    fn default() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl SystemMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemory").finish_non_exhaustive()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_fraction(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        fraction(system.available_memory(), system.total_memory())
    }
}

/// A probe that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<f64>);

impl MemoryProbe for FixedMemory {
    fn available_fraction(&self) -> Option<f64> {
        self.0
    }
}

fn fraction(available: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((available as f64 / total as f64).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        assert_eq!(fraction(4_000, 16_000), Some(0.25));
        assert_eq!(fraction(20, 10), Some(1.0));
        assert_eq!(fraction(10, 0), None);
    }

    #[test]
    fn test_system_memory_in_range() {
        let probe = SystemMemory::new();
        if let Some(available) = probe.available_fraction() {
            assert!((0.0..=1.0).contains(&available));
        }
    }
}
