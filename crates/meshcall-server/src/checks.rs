//! Health worker of the dev agent.
//!
//! Checks are probed with a plain TCP connect to the check URL's host and port;
//! the HTTP exchange itself is not performed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use meshcall_core::{HealthCheck, HealthStatus, MemoryCatalog, ServiceInstance};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wakes every `tick` and runs the checks whose own interval has elapsed.
pub fn spawn_health_worker(catalog: Arc<MemoryCatalog>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(tick = ?tick, "health worker started");
        let mut schedule = CheckSchedule::default();
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            schedule.run_due(&catalog, Instant::now()).await;
        }
    })
}

/// When each check last ran, keyed by service id.
#[derive(Debug, Default)]
pub struct CheckSchedule {
    last_run: HashMap<String, Instant>,
}

impl CheckSchedule {
    /// Runs the checks that never ran or whose interval has elapsed at `now`.
    /// Returns how many ran.
    pub async fn run_due(&mut self, catalog: &MemoryCatalog, now: Instant) -> usize {
        let checked = catalog.checked_instances();
        self.last_run
            .retain(|id, _| checked.iter().any(|(instance, _)| &instance.id == id));

        let mut ran = 0;
        for (instance, check) in checked {
            let due = match self.last_run.get(&instance.id) {
                Some(last) => now.saturating_duration_since(*last) >= check.interval,
                None => true,
            };
            if !due {
                continue;
            }
            self.last_run.insert(instance.id.clone(), now);
            run_check(catalog, &instance, &check).await;
            ran += 1;
        }
        ran
    }
}

/// One pass over every checked instance, regardless of intervals.
pub async fn run_checks(catalog: &MemoryCatalog) {
    for (instance, check) in catalog.checked_instances() {
        run_check(catalog, &instance, &check).await;
    }
}

async fn run_check(catalog: &MemoryCatalog, instance: &ServiceInstance, check: &HealthCheck) {
    let health = match check_target(check, instance) {
        Some(addr) => probe(addr).await,
        None => HealthStatus::Critical,
    };
    if health != instance.health {
        tracing::info!(id = %instance.id, from = %instance.health, to = %health, "check status changed");
        // Gone already if it was deregistered mid-pass.
        let _ = catalog.set_health(&instance.id, health);
    }
}

async fn probe(addr: SocketAddr) -> HealthStatus {
    match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_)) => HealthStatus::Passing,
        _ => HealthStatus::Critical,
    }
}

/// Host and port of the check URL, or the instance address when the URL has none usable.
fn check_target(check: &HealthCheck, instance: &ServiceInstance) -> Option<SocketAddr> {
    let rest = check
        .http
        .strip_prefix("https://")
        .or_else(|| check.http.strip_prefix("http://"))
        .unwrap_or(&check.http);
    let authority = rest.split('/').next().unwrap_or_default();
    authority.parse().ok().or(instance.address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_core::ServiceIdentity;
    use std::net::TcpListener;

    fn checked(url: String, address: SocketAddr) -> ServiceIdentity {
        checked_every("service1", url, address, Duration::from_secs(5))
    }

    fn checked_every(name: &str, url: String, address: SocketAddr, interval: Duration) -> ServiceIdentity {
        ServiceIdentity::new(name)
            .with_address(address)
            .with_check(HealthCheck::http(url, interval).skip_tls_verify())
    }

    #[test]
    fn target_comes_from_the_check_url() {
        let instance = ServiceInstance::new("service1", "service1", Some("127.0.0.1:1".parse().unwrap()));
        let check = HealthCheck::http("https://127.0.0.1:8080/health", Duration::from_secs(5));
        assert_eq!(check_target(&check, &instance), Some("127.0.0.1:8080".parse().unwrap()));

        let check = HealthCheck::http("https://service1.local/health", Duration::from_secs(5));
        assert_eq!(check_target(&check, &instance), Some("127.0.0.1:1".parse().unwrap()));
    }

    #[tokio::test]
    async fn listening_instances_become_passing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.register(&checked(format!("https://{addr}/health"), addr)).unwrap();
        assert!(catalog.instances("service1", true).is_empty());

        run_checks(&catalog).await;
        assert_eq!(catalog.instances("service1", true).len(), 1);

        drop(listener);
        run_checks(&catalog).await;
        assert!(catalog.instances("service1", true).is_empty());
    }

    #[tokio::test]
    async fn each_check_keeps_its_own_interval() {
        let fast = TcpListener::bind("127.0.0.1:0").unwrap();
        let slow = TcpListener::bind("127.0.0.1:0").unwrap();
        let (fast_addr, slow_addr) = (fast.local_addr().unwrap(), slow.local_addr().unwrap());
        let catalog = MemoryCatalog::new();
        catalog
            .register(&checked_every("fast", format!("http://{fast_addr}/health"), fast_addr, Duration::from_secs(1)))
            .unwrap();
        catalog
            .register(&checked_every("slow", format!("http://{slow_addr}/health"), slow_addr, Duration::from_secs(60)))
            .unwrap();

        let mut schedule = CheckSchedule::default();
        let start = Instant::now();
        assert_eq!(schedule.run_due(&catalog, start).await, 2);
        assert_eq!(catalog.instances("fast", true).len(), 1);
        assert_eq!(catalog.instances("slow", true).len(), 1);

        drop(fast);
        drop(slow);
        assert_eq!(schedule.run_due(&catalog, start + Duration::from_millis(500)).await, 0);
        assert_eq!(schedule.run_due(&catalog, start + Duration::from_secs(1)).await, 1);
        assert!(catalog.instances("fast", true).is_empty());
        assert_eq!(catalog.instances("slow", true).len(), 1);

        assert_eq!(schedule.run_due(&catalog, start + Duration::from_secs(60)).await, 2);
        assert!(catalog.instances("slow", true).is_empty());
    }

    #[tokio::test]
    async fn deregistered_checks_are_forgotten() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let catalog = MemoryCatalog::new();
        catalog.register(&checked(format!("http://{addr}/health"), addr)).unwrap();

        let mut schedule = CheckSchedule::default();
        let now = Instant::now();
        schedule.run_due(&catalog, now).await;
        catalog.deregister("service1");
        assert_eq!(schedule.run_due(&catalog, now).await, 0);
        assert!(schedule.last_run.is_empty());
    }
}
