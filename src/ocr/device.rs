//! Accelerated-hardware detection with a time-bounded result cache.
//!
//! Hardware state changes between runs (drivers load, devices are
//! hot-plugged), so a probe result is trusted only for a TTL. A probe that
//! exceeds its timeout counts as "unavailable" for the caller but is stored
//! already stale, so the next call probes again.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source of "now". Injected so TTL expiry can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The underlying hardware check. Blocking; may be slow.
pub trait HardwareProbe: Send + Sync {
    fn probe(&self) -> bool;
}

/// Last probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapability {
    pub available: bool,
    pub probed_at: Instant,
    pub ttl: Duration,
    /// Forced stale, e.g. after a timed-out probe.
    pub stale: bool,
}

impl DeviceCapability {
    pub fn is_stale(&self, now: Instant) -> bool {
        self.stale || now.saturating_duration_since(self.probed_at) >= self.ttl
    }
}

/// Cached accelerated-hardware availability.
///
/// Concurrent first callers converge on one probe: the cache lock is held
/// across the probe, so later callers wait and then read the fresh value.
pub struct DeviceProbe {
    probe: Arc<dyn HardwareProbe>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    timeout: Duration,
    cache: Mutex<Option<DeviceCapability>>,
    probes: AtomicUsize,
}

impl DeviceProbe {
    pub fn new(
        probe: Arc<dyn HardwareProbe>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            probe,
            clock,
            ttl,
            timeout,
            cache: Mutex::new(None),
            probes: AtomicUsize::new(0),
        }
    }

    /// Probe backed by [`SystemProbe`] and the wall clock.
    pub fn system(ttl: Duration, timeout: Duration) -> Self {
        Self::new(Arc::new(SystemProbe), Arc::new(SystemClock), ttl, timeout)
    }

    /// Whether accelerated recognition hardware is usable.
    ///
    /// Returns the cached value while it is fresh unless `force_refresh`.
    pub async fn is_available(&self, force_refresh: bool) -> bool {
        let mut cache = self.cache.lock().await;
        let now = self.clock.now();
        if let Some(cap) = cache.as_ref() {
            if !force_refresh && !cap.is_stale(now) {
                return cap.available;
            }
        }

        self.probes.fetch_add(1, Ordering::SeqCst);
        let probe = Arc::clone(&self.probe);
        let outcome =
            tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(move || probe.probe()))
                .await;

        let (available, stale) = match outcome {
            Ok(Ok(available)) => (available, false),
            Ok(Err(e)) => {
                warn!(error = %e, "device probe panicked; treating as unavailable");
                (false, true)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "device probe timed out; treating as unavailable"
                );
                (false, true)
            }
        };
        info!(available, forced = force_refresh, "device probe completed");

        *cache = Some(DeviceCapability {
            available,
            probed_at: self.clock.now(),
            ttl: self.ttl,
            stale,
        });
        available
    }

    /// Cached capability without probing.
    pub async fn cached(&self) -> Option<DeviceCapability> {
        *self.cache.lock().await
    }

    /// Number of underlying probes performed so far.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

// ── System probe ─────────────────────────────────────────────────────────

/// CUDA detection via the environment, `nvidia-smi` and toolkit directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn probe(&self) -> bool {
        if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
            if devices_hidden(&visible) {
                debug!(value = %visible, "CUDA_VISIBLE_DEVICES hides every device");
                return false;
            }
        }
        if nvidia_smi(&["--query-gpu=index", "--format=csv,noheader"])
            || nvidia_smi(&["-L"])
        {
            return true;
        }
        ["CUDA_PATH", "CUDA_HOME"]
            .iter()
            .filter_map(|k| std::env::var_os(k))
            .any(|dir| Path::new(&dir).is_dir())
    }
}

fn devices_hidden(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "-1" | "none" | "void" | "nodevfiles"
    )
}

/// True when `nvidia-smi` exits successfully and lists at least one device.
fn nvidia_smi(args: &[&str]) -> bool {
    match Command::new("nvidia-smi")
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(out) => out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
        Err(e) => {
            debug!(error = %e, "nvidia-smi not runnable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct FakeClock(StdMutex<Instant>);

    impl FakeClock {
        fn advance(&self, d: Duration) {
            *self.0.lock().unwrap() += d;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap()
        }
    }

    struct FakeProbe {
        available: AtomicBool,
        delay: Duration,
    }

    impl HardwareProbe for FakeProbe {
        fn probe(&self) -> bool {
            std::thread::sleep(self.delay);
            self.available.load(Ordering::SeqCst)
        }
    }

    fn setup(available: bool, delay: Duration) -> (Arc<FakeProbe>, Arc<FakeClock>, DeviceProbe) {
        let probe = Arc::new(FakeProbe {
            available: AtomicBool::new(available),
            delay,
        });
        let clock = Arc::new(FakeClock(StdMutex::new(Instant::now())));
        let device = DeviceProbe::new(
            probe.clone(),
            clock.clone(),
            Duration::from_secs(300),
            Duration::from_millis(200),
        );
        (probe, clock, device)
    }

    #[tokio::test]
    async fn cached_within_ttl() {
        let (probe, _clock, device) = setup(true, Duration::ZERO);
        assert!(device.is_available(false).await);
        probe.available.store(false, Ordering::SeqCst);
        assert!(device.is_available(false).await);
        assert_eq!(device.probe_count(), 1);
    }

    #[tokio::test]
    async fn force_refresh_always_probes() {
        let (probe, _clock, device) = setup(true, Duration::ZERO);
        assert!(device.is_available(false).await);
        probe.available.store(false, Ordering::SeqCst);
        assert!(!device.is_available(true).await);
        assert_eq!(device.probe_count(), 2);
    }

    #[tokio::test]
    async fn expired_ttl_reprobes() {
        let (probe, clock, device) = setup(false, Duration::ZERO);
        assert!(!device.is_available(false).await);
        probe.available.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(301));
        assert!(device.is_available(false).await);
        assert_eq!(device.probe_count(), 2);
    }

    #[tokio::test]
    async fn timeout_is_unavailable_and_stale() {
        let (_probe, _clock, device) = setup(true, Duration::from_secs(2));
        assert!(!device.is_available(false).await);
        let cap = device.cached().await.unwrap();
        assert!(cap.stale);
        assert!(cap.is_stale(Instant::now()));
    }

    #[test]
    fn hidden_device_values() {
        assert!(devices_hidden(""));
        assert!(devices_hidden("-1"));
        assert!(devices_hidden("NoDevFiles"));
        assert!(!devices_hidden("0"));
        assert!(!devices_hidden("0,1"));
    }
}
