use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use serde::Serialize;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Networks, System};

const SMI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu: f32,
    pub memory: f32,
    pub network: NetworkTotals,
    pub gpu: Option<GpuInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkTotals {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub utilization: u32,
    pub temperature: u32,
}

pub trait Clock: Send {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Last good GPU reading. A failed query leaves the old value and timestamp
/// in place, so the next poll tries again.
#[derive(Debug, Clone)]
pub struct GpuCache {
    ttl: Duration,
    last_value: Option<GpuInfo>,
    last_fetch: Option<Instant>,
}

impl GpuCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_value: None,
            last_fetch: None,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.last_fetch
            .map(|at| now.saturating_duration_since(at) <= self.ttl)
            .unwrap_or(false)
    }

    pub fn value(&self) -> Option<GpuInfo> {
        self.last_value.clone()
    }

    /// Stores a successful reading; a `None` reading falls back to the cached value.
    pub fn update(&mut self, now: Instant, reading: Option<GpuInfo>) -> Option<GpuInfo> {
        if let Some(info) = reading {
            self.last_value = Some(info);
            self.last_fetch = Some(now);
        }
        self.last_value.clone()
    }
}

enum GpuSource {
    Nvml(Nvml),
    Smi,
}

pub struct MetricsCollector {
    sys: System,
    networks: Networks,
    gpu: GpuSource,
    gpu_cache: GpuCache,
    clock: Box<dyn Clock>,
}

impl MetricsCollector {
    pub fn new(gpu_cache: GpuCache, clock: Box<dyn Clock>) -> Self {
        let gpu = match Nvml::init() {
            Ok(nvml) => GpuSource::Nvml(nvml),
            Err(err) => {
                tracing::debug!(error = %err, "nvml unavailable, falling back to nvidia-smi");
                GpuSource::Smi
            }
        };
        Self {
            sys: System::new(),
            networks: Networks::new_with_refreshed_list(),
            gpu,
            gpu_cache,
            clock,
        }
    }

    pub fn collect(&mut self) -> SystemStats {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.networks.refresh();

        let cpu = self.sys.global_cpu_info().cpu_usage();
        let mem_total = self.sys.total_memory() as f32;
        let memory = if mem_total > 0.0 {
            (self.sys.used_memory() as f32 / mem_total) * 100.0
        } else {
            0.0
        };

        let mut network = NetworkTotals::default();
        for (_name, data) in &self.networks {
            network.bytes_sent = network.bytes_sent.saturating_add(data.total_transmitted());
            network.bytes_recv = network.bytes_recv.saturating_add(data.total_received());
        }

        SystemStats {
            cpu,
            memory,
            network,
            gpu: self.collect_gpu(),
        }
    }

    fn collect_gpu(&mut self) -> Option<GpuInfo> {
        let now = self.clock.now();
        if self.gpu_cache.is_fresh(now) {
            return self.gpu_cache.value();
        }
        let reading = match &self.gpu {
            GpuSource::Nvml(nvml) => query_nvml(nvml),
            GpuSource::Smi => query_smi(),
        };
        self.gpu_cache.update(now, reading)
    }
}

fn query_nvml(nvml: &Nvml) -> Option<GpuInfo> {
    let device = nvml.device_by_index(0).ok()?;
    Some(GpuInfo {
        name: device.name().ok()?,
        utilization: device.utilization_rates().ok()?.gpu,
        temperature: device.temperature(TemperatureSensor::Gpu).ok()?,
    })
}

fn query_smi() -> Option<GpuInfo> {
    let mut child = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,utilization.gpu,temperature.gpu",
            "--format=csv,noheader",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + SMI_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            _ => {
                tracing::debug!("nvidia-smi timed out");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }

    let out = child.wait_with_output().ok()?;
    if !out.status.success() {
        return None;
    }
    parse_smi_line(String::from_utf8_lossy(&out.stdout).lines().next()?)
}

/// Parses one `name, 37 %, 52` line; the name may itself contain commas.
pub fn parse_smi_line(line: &str) -> Option<GpuInfo> {
    let mut parts = line.trim().rsplitn(3, ',');
    let temperature = leading_number(parts.next()?)?;
    let utilization = leading_number(parts.next()?)?;
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(GpuInfo {
        name: name.to_string(),
        utilization,
        temperature,
    })
}

fn leading_number(field: &str) -> Option<u32> {
    field.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<Instant>>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap()
        }
    }

    fn gpu(util: u32) -> GpuInfo {
        GpuInfo {
            name: "NVIDIA GeForce RTX 4070".to_string(),
            utilization: util,
            temperature: 48,
        }
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        assert_eq!(parse_smi_line("NVIDIA GeForce RTX 4070, 37 %, 52\n"), Some(GpuInfo {
            name: "NVIDIA GeForce RTX 4070".to_string(),
            utilization: 37,
            temperature: 52,
        }));
        assert_eq!(
            parse_smi_line("Tesla T4, Rev. B, 0 %, 31").map(|g| g.name),
            Some("Tesla T4, Rev. B".to_string())
        );
        assert_eq!(parse_smi_line("garbage"), None);
        assert_eq!(parse_smi_line("GPU, [N/A], 40"), None);
    }

    #[test]
    fn cache_serves_value_until_ttl_expires() {
        let clock = ManualClock(Arc::new(Mutex::new(Instant::now())));
        let mut cache = GpuCache::new(Duration::from_secs(50));
        assert!(!cache.is_fresh(clock.now()));

        assert_eq!(cache.update(clock.now(), Some(gpu(10))), Some(gpu(10)));
        clock.advance(Duration::from_secs(49));
        assert!(cache.is_fresh(clock.now()));
        clock.advance(Duration::from_secs(2));
        assert!(!cache.is_fresh(clock.now()));
    }

    #[test]
    fn failed_refresh_keeps_previous_value_and_stays_stale() {
        let clock = ManualClock(Arc::new(Mutex::new(Instant::now())));
        let mut cache = GpuCache::new(Duration::from_secs(50));
        cache.update(clock.now(), Some(gpu(10)));
        clock.advance(Duration::from_secs(60));

        assert_eq!(cache.update(clock.now(), None), Some(gpu(10)));
        assert!(!cache.is_fresh(clock.now()));

        assert_eq!(cache.update(clock.now(), Some(gpu(90))), Some(gpu(90)));
        assert!(cache.is_fresh(clock.now()));
    }

    #[test]
    fn collector_reports_sane_host_numbers() {
        let clock = ManualClock(Arc::new(Mutex::new(Instant::now())));
        let mut collector = MetricsCollector::new(GpuCache::new(Duration::from_secs(50)), Box::new(clock));
        let stats = collector.collect();
        assert!((0.0..=100.0).contains(&stats.memory));
        assert!(stats.cpu >= 0.0);
    }
}
