/// Resident set size of this process in MiB, from `/proc/self/statm`.
///
/// Returns `None` where procfs is unavailable.
pub fn resident_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions and only reads system configuration.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some((pages * page_size as u64) as f64 / (1024.0 * 1024.0))
}

/// Log resident memory at a named pipeline stage.
pub fn log_stage(stage: &str) {
    match resident_mb() {
        Some(mb) => tracing::info!(stage, resident_mb = (mb * 10.0).round() / 10.0, "memory"),
        None => tracing::debug!(stage, "resident memory unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_resident_mb_is_positive_on_linux() {
        assert!(resident_mb().unwrap() > 0.0);
    }
}
