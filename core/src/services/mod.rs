//! Service address allow-list.
//!
//! Traffic is only of interest when it involves a cluster service. The [ServiceIpCache] holds the
//! current set of service addresses and is refreshed in the background from a
//! [ServiceAddressProvider]. Each refresh first inserts every address of the new snapshot and only
//! then evicts addresses absent from it, so an address present in consecutive snapshots is never
//! observed missing by concurrent readers.

pub mod kubernetes;

pub use self::kubernetes::KubernetesProvider;

use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Source of the current set of service addresses.
pub trait ServiceAddressProvider: Send + Sync + 'static {
    /// Lists the addresses of every service.
    fn list_service_addresses(&self) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;
}

/// Concurrent set of service addresses.
#[derive(Debug, Default)]
pub struct ServiceIpCache {
    addrs: DashSet<IpAddr>,
}

impl ServiceIpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `addr` is a known service address.
    #[inline]
    pub fn is_service_ip(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(addr)
    }

    /// Replaces the held addresses with `snapshot`: upserts every snapshot address, then evicts
    /// the rest.
    pub fn refresh(&self, snapshot: &[IpAddr]) {
        for addr in snapshot {
            self.addrs.insert(*addr);
        }
        let current: HashSet<&IpAddr> = snapshot.iter().collect();
        self.addrs.retain(|addr| current.contains(addr));
    }

    /// Refreshes from `provider`. On failure the held addresses are left untouched.
    pub async fn refresh_from<P: ServiceAddressProvider>(&self, provider: &P) -> Result<usize> {
        let snapshot = provider.list_service_addresses().await?;
        log::debug!(
            "Discovered {} service IPs: {:?}",
            snapshot.len(),
            snapshot
        );
        self.refresh(&snapshot);
        Ok(snapshot.len())
    }

    /// Spawns a task that refreshes `cache` from `provider` every `period`, starting immediately.
    pub fn spawn<P: ServiceAddressProvider>(
        cache: Arc<Self>,
        provider: P,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = cache.refresh_from(&provider).await {
                    log::error!("Failed to get service IPs: {:#}", err);
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// Serves queued snapshots, failing when asked to.
    struct ScriptedProvider {
        snapshots: Mutex<Vec<Vec<IpAddr>>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl ServiceAddressProvider for Arc<ScriptedProvider> {
        async fn list_service_addresses(&self) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                bail!("API server unavailable");
            }
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots[0].clone())
            }
        }
    }

    #[test]
    fn refresh_upserts_then_evicts() {
        let cache = ServiceIpCache::new();
        cache.refresh(&[ip("10.96.0.1"), ip("10.96.0.10")]);
        assert!(cache.is_service_ip(&ip("10.96.0.1")));
        assert!(cache.is_service_ip(&ip("10.96.0.10")));

        cache.refresh(&[ip("10.96.0.10"), ip("10.96.0.20")]);
        assert!(!cache.is_service_ip(&ip("10.96.0.1")));
        assert!(cache.is_service_ip(&ip("10.96.0.10")));
        assert!(cache.is_service_ip(&ip("10.96.0.20")));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn provider_failure_keeps_snapshot() {
        let cache = ServiceIpCache::new();
        let provider = Arc::new(ScriptedProvider {
            snapshots: Mutex::new(vec![vec![ip("10.96.0.1")]]),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        assert_eq!(cache.refresh_from(&provider).await.unwrap(), 1);
        provider.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh_from(&provider).await.is_err());
        assert!(cache.is_service_ip(&ip("10.96.0.1")));
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_converges() {
        let cache = Arc::new(ServiceIpCache::new());
        let provider = Arc::new(ScriptedProvider {
            snapshots: Mutex::new(vec![vec![ip("10.96.0.1")], vec![ip("10.96.0.2")]]),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let handle = ServiceIpCache::spawn(
            Arc::clone(&cache),
            Arc::clone(&provider),
            Duration::from_secs(1),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.is_service_ip(&ip("10.96.0.1")));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!cache.is_service_ip(&ip("10.96.0.1")));
        assert!(cache.is_service_ip(&ip("10.96.0.2")));
        assert!(provider.calls.load(Ordering::SeqCst) >= 2);
        handle.abort();
    }

    #[test]
    fn retained_addresses_never_flicker() {
        let cache = Arc::new(ServiceIpCache::new());
        let stable = ip("10.96.0.10");
        cache.refresh(&[stable]);

        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    assert!(cache.is_service_ip(&stable));
                }
            })
        };
        for i in 0..1000u32 {
            let churn = IpAddr::from([10, 97, (i >> 8) as u8, i as u8]);
            cache.refresh(&[churn, stable]);
        }
        reader.join().unwrap();
    }
}
