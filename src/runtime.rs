use std::fs;

const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

/// Determines how many worker threads to size the tokio runtime with,
/// honoring a container CPU quota over the host's logical core count.
/// `MY_CPU_LIMIT` takes precedence over both when set.
pub fn get_container_cpu_limit() -> usize {
    if let Ok(v) = std::env::var("MY_CPU_LIMIT") {
        if let Some(n) = parse_cpu_value(&v) {
            return n;
        }
    }
    if let Some(n) = parse_cgroup_v2_cpu() {
        return n;
    }
    if let Some(n) = parse_cgroup_v1_cpu() {
        return n;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_cpu_value(raw: &str) -> Option<usize> {
    let trimmed = raw.trim();
    trimmed.parse::<f64>().ok().map(|v| v.ceil().max(1.0) as usize)
}

fn parse_cgroup_v2_cpu() -> Option<usize> {
    let content = fs::read_to_string(CGROUP_V2_MAX).ok()?;
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = period.parse().ok()?;
    if period <= 0.0 {
        return None;
    }
    Some((quota / period).ceil().max(1.0) as usize)
}

fn parse_cgroup_v1_cpu() -> Option<usize> {
    let quota: f64 = fs::read_to_string(CGROUP_V1_QUOTA).ok()?.trim().parse().ok()?;
    if quota <= 0.0 {
        return None;
    }
    let period: f64 = fs::read_to_string(CGROUP_V1_PERIOD).ok()?.trim().parse().ok()?;
    if period <= 0.0 {
        return None;
    }
    Some((quota / period).ceil().max(1.0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value_fractional_rounds_up() {
        assert_eq!(parse_cpu_value("1.5"), Some(2));
    }

    #[test]
    fn test_parse_cpu_value_invalid() {
        assert_eq!(parse_cpu_value("not-a-number"), None);
    }

    #[test]
    fn test_parse_cpu_value_zero_floors_to_one() {
        assert_eq!(parse_cpu_value("0"), Some(1));
    }

    #[test]
    fn test_get_container_cpu_limit_env_override() {
        std::env::set_var("MY_CPU_LIMIT", "4");
        assert_eq!(get_container_cpu_limit(), 4);
        std::env::remove_var("MY_CPU_LIMIT");
    }
}
