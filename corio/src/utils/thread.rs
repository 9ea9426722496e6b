use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;
use std::thread;

/// Number of CPUs the process may run on, at least 1.
pub(crate) fn available_cpus() -> usize {
    thread::available_parallelism().map_or(1, usize::from)
}

/// Pins the calling thread to one CPU, chosen round-robin from the worker
/// index among the CPUs the thread is currently allowed on.
pub(crate) fn pin_current_thread(index: usize) -> nix::Result<()> {
    // Pid 0 is the calling thread.
    let allowed = sched_getaffinity(Pid::from_raw(0))?;
    let cpus = (0..CpuSet::count())
        .filter(|&cpu| allowed.is_set(cpu).unwrap_or(false))
        .collect::<Vec<_>>();

    if cpus.is_empty() {
        return Err(nix::Error::EINVAL);
    }
    let cpu = cpus[index % cpus.len()];

    let mut set = CpuSet::new();
    set.set(cpu)?;

    sched_setaffinity(Pid::from_raw(0), &set)?;

    tracing::debug!(worker = index, cpu, "pinned worker thread");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_current_thread() -> anyhow::Result<()> {
        let cpus = available_cpus();
        assert!(cpus >= 1);

        // Run in a scratch thread, affinity is inherited by nothing else.
        let pinned = thread::spawn(move || -> nix::Result<usize> {
            pin_current_thread(cpus + 1)?;
            let set = sched_getaffinity(Pid::from_raw(0))?;
            Ok((0..CpuSet::count()).filter(|&cpu| set.is_set(cpu).unwrap_or(false)).count())
        })
        .join()
        .expect("pinning thread panicked")?;

        assert_eq!(pinned, 1);
        Ok(())
    }
}
