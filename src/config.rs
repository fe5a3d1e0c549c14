//! Core Configuration
//!
//! Static capacities plus the runtime configuration consumed from the build
//! layer: processor count, tick period, scheduler policy per instance, and
//! clock-class availability.

/// Maximum number of processors supported
pub const MAX_CPUS: usize = 4;

/// Maximum number of threads (arena capacity)
pub const MAX_THREADS: usize = 64;

/// Number of distinct priority levels (0 = highest)
pub const PRIORITY_COUNT: usize = 256;

/// Maximum scheduler instances (each owns one or more processors)
pub const MAX_INSTANCES: usize = MAX_CPUS;

/// Watchdog nodes per (processor, clock class) set
pub const WATCHDOG_CAPACITY: usize = 96;

/// Maximum standalone thread queues (wait lists of out-of-scope blocking
/// objects such as message queues and condition variables)
pub const MAX_QUEUES: usize = 32;

/// Maximum mutex objects
pub const MAX_MUTEXES: usize = 32;

/// Maximum semaphore objects
pub const MAX_SEMAPHORES: usize = 32;

/// Ready-queue policy of a scheduler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Two-level bitmap over fixed priorities, O(1) highest-ready
    PriorityBitmap,
    /// Earliest-deadline-first, ordered by absolute deadline, O(log n)
    Edf,
}

/// One scheduler instance: a policy plus a contiguous processor range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    pub policy: SchedPolicy,
    /// First processor owned by this instance
    pub cpu_first: usize,
    /// Number of processors owned by this instance
    pub cpu_count: usize,
}

/// Errors from [`CoreConfig::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoCpus,
    TooManyCpus,
    NoInstances,
    /// Instance processor ranges must cover 0..cpu_count without overlap
    CpuRangeMismatch,
}

/// Configuration surface consumed from the excluded build layer.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Number of online processors
    pub cpu_count: usize,
    /// Clock tick period in nanoseconds
    pub tick_period_ns: u64,
    /// Scheduler instances; `None` entries are unused
    pub instances: [Option<InstanceConfig>; MAX_INSTANCES],
    /// Whether the monotonic nanosecond clock class is wired up
    pub has_monotonic: bool,
    /// Whether the wall-clock nanosecond class is wired up
    pub has_realtime: bool,
}

impl CoreConfig {
    /// One bitmap-policy instance owning every processor.
    pub const fn uniprocessor() -> Self {
        Self::symmetric(1)
    }

    /// One bitmap-policy instance owning `cpus` processors.
    pub const fn symmetric(cpus: usize) -> Self {
        let mut instances = [None; MAX_INSTANCES];
        instances[0] = Some(InstanceConfig {
            policy: SchedPolicy::PriorityBitmap,
            cpu_first: 0,
            cpu_count: cpus,
        });
        Self {
            cpu_count: cpus,
            tick_period_ns: 10_000_000, // 10 ms
            instances,
            has_monotonic: true,
            has_realtime: true,
        }
    }

    /// Check structural validity: processor ranges of the configured
    /// instances must tile 0..cpu_count exactly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.cpu_count > MAX_CPUS {
            return Err(ConfigError::TooManyCpus);
        }

        let mut covered = [false; MAX_CPUS];
        let mut any = false;
        for inst in self.instances.iter().flatten() {
            any = true;
            if inst.cpu_count == 0 {
                return Err(ConfigError::CpuRangeMismatch);
            }
            for cpu in inst.cpu_first..inst.cpu_first + inst.cpu_count {
                if cpu >= self.cpu_count || covered[cpu] {
                    return Err(ConfigError::CpuRangeMismatch);
                }
                covered[cpu] = true;
            }
        }
        if !any {
            return Err(ConfigError::NoInstances);
        }
        if covered[..self.cpu_count].iter().any(|c| !c) {
            return Err(ConfigError::CpuRangeMismatch);
        }
        Ok(())
    }

    /// The instance index owning a processor. Valid configs cover every
    /// processor, so this only returns `None` for out-of-range ids.
    pub fn instance_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.instances.iter().enumerate().find_map(|(i, inst)| {
            let inst = inst.as_ref()?;
            (cpu >= inst.cpu_first && cpu < inst.cpu_first + inst.cpu_count).then_some(i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniprocessor_valid() {
        assert_eq!(CoreConfig::uniprocessor().validate(), Ok(()));
    }

    #[test]
    fn test_symmetric_valid() {
        assert_eq!(CoreConfig::symmetric(4).validate(), Ok(()));
    }

    #[test]
    fn test_zero_cpus_rejected() {
        let mut cfg = CoreConfig::uniprocessor();
        cfg.cpu_count = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::NoCpus));
    }

    #[test]
    fn test_uncovered_cpu_rejected() {
        let mut cfg = CoreConfig::symmetric(2);
        cfg.instances[0] = Some(InstanceConfig {
            policy: SchedPolicy::PriorityBitmap,
            cpu_first: 0,
            cpu_count: 1,
        });
        assert_eq!(cfg.validate(), Err(ConfigError::CpuRangeMismatch));
    }

    #[test]
    fn test_overlapping_instances_rejected() {
        let mut cfg = CoreConfig::symmetric(2);
        cfg.instances[1] = Some(InstanceConfig {
            policy: SchedPolicy::Edf,
            cpu_first: 1,
            cpu_count: 1,
        });
        assert_eq!(cfg.validate(), Err(ConfigError::CpuRangeMismatch));
    }

    #[test]
    fn test_partitioned_instances() {
        let mut cfg = CoreConfig::symmetric(3);
        cfg.instances[0] = Some(InstanceConfig {
            policy: SchedPolicy::PriorityBitmap,
            cpu_first: 0,
            cpu_count: 2,
        });
        cfg.instances[1] = Some(InstanceConfig {
            policy: SchedPolicy::Edf,
            cpu_first: 2,
            cpu_count: 1,
        });
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.instance_of_cpu(0), Some(0));
        assert_eq!(cfg.instance_of_cpu(2), Some(1));
        assert_eq!(cfg.instance_of_cpu(3), None);
    }
}
