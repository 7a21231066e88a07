use crate::protocol::ResolveResult;
use async_trait::async_trait;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Quiescence period before an interactively-typed destination is resolved
pub const DEBOUNCE_QUIESCENCE: Duration = Duration::from_millis(300);

/// Resolve a destination string to candidate IPs.
///
/// A literal IP short-circuits to a single-element result with no network
/// lookup.
pub fn resolve_blocking(address: &str) -> ResolveResult {
    let address = address.trim();

    if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        return ResolveResult {
            hostname: address.to_string(),
            ips: vec![ip.to_string()],
            success: true,
            error: None,
        };
    }

    let addr_with_port = format!("{}:0", address);
    match addr_with_port.to_socket_addrs() {
        Ok(addrs) => {
            let ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
            if ips.is_empty() {
                ResolveResult {
                    hostname: address.to_string(),
                    ips: Vec::new(),
                    success: false,
                    error: Some("No IP addresses found".to_string()),
                }
            } else {
                tracing::debug!("Resolved {} to {:?}", address, ips);
                ResolveResult {
                    hostname: address.to_string(),
                    ips,
                    success: true,
                    error: None,
                }
            }
        }
        Err(e) => ResolveResult {
            hostname: address.to_string(),
            ips: Vec::new(),
            success: false,
            error: Some(format!("DNS resolution failed: {}", e)),
        },
    }
}

/// Resolver backend abstraction, swappable in tests
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, address: &str) -> ResolveResult;
}

/// System resolver: getaddrinfo on a blocking worker thread
#[derive(Clone, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, address: &str) -> ResolveResult {
        let address = address.to_string();
        match tokio::task::spawn_blocking(move || resolve_blocking(&address)).await {
            Ok(result) => result,
            Err(e) => ResolveResult {
                hostname: String::new(),
                ips: Vec::new(),
                success: false,
                error: Some(format!("Resolver task failed: {}", e)),
            },
        }
    }
}

/// Debounced resolver for interactive destination input.
///
/// Each `submit` supersedes all earlier ones. A lookup only starts once the
/// input has been quiescent, and its result is delivered only if no newer
/// input arrived while it ran, so a consumer never sees a result older than
/// the latest input. Superseded lookups are simply discarded.
pub struct DebouncedResolver {
    resolver: Arc<dyn Resolve>,
    quiescence: Duration,
    generation: Arc<AtomicU64>,
}

impl DebouncedResolver {
    pub fn new(resolver: Arc<dyn Resolve>, quiescence: Duration) -> Self {
        Self {
            resolver,
            quiescence,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Submit the latest input; `deliver` runs only if this input is still the
    /// newest when its lookup completes.
    pub fn submit<F>(&self, address: String, deliver: F)
    where
        F: FnOnce(ResolveResult) + Send + 'static,
    {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let resolver = self.resolver.clone();
        let quiescence = self.quiescence;

        tokio::spawn(async move {
            tokio::time::sleep(quiescence).await;
            if generation.load(Ordering::SeqCst) != my_generation {
                return; // superseded while waiting for quiescence
            }

            let result = resolver.resolve(&address).await;
            if generation.load(Ordering::SeqCst) != my_generation {
                return; // superseded while the lookup ran
            }

            deliver(result);
        });
    }
}

impl Default for DebouncedResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver), DEBOUNCE_QUIESCENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct FakeResolver;

    #[async_trait]
    impl Resolve for FakeResolver {
        async fn resolve(&self, address: &str) -> ResolveResult {
            ResolveResult {
                hostname: address.to_string(),
                ips: vec!["192.168.1.50".to_string()],
                success: true,
                error: None,
            }
        }
    }

    #[test]
    fn test_literal_ip_is_already_resolved() {
        let result = resolve_blocking("10.0.0.5");
        assert!(result.success);
        assert_eq!(result.ips, vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn test_literal_ipv6() {
        let result = resolve_blocking("::1");
        assert!(result.success);
        assert_eq!(result.ips, vec!["::1".to_string()]);
    }

    #[test]
    fn test_unresolvable_hostname_fails_cleanly() {
        let result = resolve_blocking("definitely-not-a-real-host.invalid");
        assert!(!result.success);
        assert!(result.ips.is_empty());
        assert!(result.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_delivers_only_latest_input() {
        let debouncer = DebouncedResolver::new(
            Arc::new(FakeResolver),
            Duration::from_millis(300),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        for input in ["10", "10.0", "10.0.0.5"] {
            let tx = tx.clone();
            debouncer.submit(input.to_string(), move |r| {
                let _ = tx.send(r);
            });
        }
        drop(tx);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let delivered = rx.recv().await.expect("latest input should resolve");
        assert_eq!(delivered.hostname, "10.0.0.5");
        assert!(rx.recv().await.is_none(), "stale lookups must be discarded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_submit_resolves_after_quiescence() {
        let debouncer = DebouncedResolver::new(
            Arc::new(FakeResolver),
            Duration::from_millis(300),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        debouncer.submit("office-laptop".to_string(), move |r| {
            let _ = tx.send(r);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.ips, vec!["192.168.1.50".to_string()]);
    }
}
