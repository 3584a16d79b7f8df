//! Best-effort CPU pinning
//!
//! Pinning is advisory. Callers log failures and keep going unpinned.

/// Why pinning did not happen
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// The platform has no pinning support
    #[error("CPU pinning is not supported on this platform")]
    Unsupported,
    /// The CPU index does not fit the platform's CPU set
    #[error("CPU {cpu} is outside the supported range")]
    OutOfRange {
        /// Requested CPU
        cpu: usize,
    },
    /// The OS rejected the request
    #[error("sched_setaffinity failed for CPU {cpu}: {source}")]
    Os {
        /// Requested CPU
        cpu: usize,
        /// OS error
        #[source]
        source: std::io::Error,
    },
}

/// Whether pinning can work on this platform
pub const fn is_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Pin the calling thread to `cpu`
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), AffinityError> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(AffinityError::OutOfRange { cpu });
    }
    // SAFETY: cpu_set_t is plain data; CPU_ZERO/CPU_SET only touch the set
    // and cpu is bounds-checked above.
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(AffinityError::Os {
            cpu,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Pin the calling thread to `cpu`
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> Result<(), AffinityError> {
    Err(AffinityError::Unsupported)
}

/// Number of CPUs available to this process
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// CPUs in the calling thread's affinity mask, ascending and never empty
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> Vec<usize> {
    // SAFETY: sched_getaffinity writes at most size_of::<cpu_set_t>() bytes
    // into the set, and CPU_ISSET only reads indices below CPU_SETSIZE.
    let cpus: Vec<usize> = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            Vec::new()
        } else {
            (0..libc::CPU_SETSIZE as usize)
                .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
                .collect()
        }
    };
    if cpus.is_empty() {
        (0..available_cpus()).collect()
    } else {
        cpus
    }
}

/// CPUs in the calling thread's affinity mask, ascending and never empty
#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> Vec<usize> {
    (0..available_cpus()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_cpu_is_an_error() {
        let result = std::thread::spawn(|| pin_current_thread(usize::MAX))
            .join()
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_allowed_cpus_are_sorted_and_pinnable() {
        let cpus = allowed_cpus();
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|pair| pair[0] < pair[1]));

        if is_supported() {
            let last = *cpus.last().unwrap();
            let result = std::thread::spawn(move || pin_current_thread(last))
                .join()
                .unwrap();
            assert!(result.is_ok());
        }
    }

    #[test]
    fn test_pin_to_cpu_zero() {
        let result = std::thread::spawn(|| pin_current_thread(0)).join().unwrap();
        if is_supported() {
            // a restricted cpuset may still refuse CPU 0; either way no panic
            let _ = result;
        } else {
            assert!(matches!(result, Err(AffinityError::Unsupported)));
        }
    }
}
