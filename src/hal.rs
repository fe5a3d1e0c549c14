//! CPU Operations HAL
//!
//! Platform-agnostic CPU operations for interrupt masking, barriers and
//! processor identification. The core never touches hardware directly;
//! everything enters through this trait so the same code runs under a real
//! interrupt controller or on a host during tests.

use core::sync::atomic::{AtomicBool, Ordering};

/// CPU operations - the platform provides the implementation
pub trait Cpu: Send + Sync {
    /// Disable interrupts on the local processor, return previous state
    fn disable_irq(&self) -> bool;

    /// Restore interrupt state saved by `disable_irq`
    fn restore_irq(&self, was_enabled: bool);

    /// Full memory barrier
    fn memory_barrier(&self);

    /// Get current processor ID (for SMP)
    fn cpu_id(&self) -> usize;
}

/// RAII guard for disabling IRQs
pub struct IrqGuard<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
    was_enabled: bool,
}

impl<'a, C: Cpu + ?Sized> IrqGuard<'a, C> {
    pub fn new(cpu: &'a C) -> Self {
        let was_enabled = cpu.disable_irq();
        Self { cpu, was_enabled }
    }
}

impl<C: Cpu + ?Sized> Drop for IrqGuard<'_, C> {
    fn drop(&mut self) {
        self.cpu.restore_irq(self.was_enabled);
    }
}

// ============================================================================
// Hosted Implementation
// ============================================================================

/// Hosted `Cpu` implementation.
///
/// Tracks a simulated interrupt-enable flag and reports a fixed processor ID.
/// Used by unit tests and by embedders that drive the core from a single
/// context (early boot, simulation).
pub struct HostCpu {
    irq_enabled: AtomicBool,
    id: usize,
}

impl HostCpu {
    pub const fn new(id: usize) -> Self {
        Self {
            irq_enabled: AtomicBool::new(true),
            id,
        }
    }

    /// Whether the simulated interrupt flag is currently enabled
    pub fn irqs_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Relaxed)
    }
}

impl Cpu for HostCpu {
    fn disable_irq(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::AcqRel)
    }

    fn restore_irq(&self, was_enabled: bool) {
        if was_enabled {
            self.irq_enabled.store(true, Ordering::Release);
        }
    }

    fn memory_barrier(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn cpu_id(&self) -> usize {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_guard_restores_state() {
        let cpu = HostCpu::new(0);
        assert!(cpu.irqs_enabled());
        {
            let _guard = IrqGuard::new(&cpu);
            assert!(!cpu.irqs_enabled());
        }
        assert!(cpu.irqs_enabled());
    }

    #[test]
    fn test_nested_irq_guards() {
        let cpu = HostCpu::new(0);
        {
            let _outer = IrqGuard::new(&cpu);
            {
                let _inner = IrqGuard::new(&cpu);
                assert!(!cpu.irqs_enabled());
            }
            // Inner guard saw IRQs already disabled - must not re-enable
            assert!(!cpu.irqs_enabled());
        }
        assert!(cpu.irqs_enabled());
    }

    #[test]
    fn test_cpu_id() {
        assert_eq!(HostCpu::new(2).cpu_id(), 2);
    }
}
