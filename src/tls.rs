//! TLS management
//!
//! Two modes per HTTPS listener. Static mode loads the configured cert
//! groups at startup and answers SNI from a linear scan; an unknown name
//! gets no certificate and the handshake fails. Auto mode wraps the ACME
//! service: each handshake runs through a per-SNI singleflight whose
//! critical section invokes the server manager's before-hook (free port 80,
//! start the challenge server), obtains the certificate, then the
//! after-hook (stop the challenge server, restore the original listener).
//!
//! Minimum TLS version is 1.2 in both modes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig as RustlsServerConfig;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::acme::{certified_key_from_pem, AcmeService};
use crate::config::{CertConfig, Config};

/// Hook invoked around ACME acquisition. Provided by the server manager.
pub type AcmeHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ── singleflight ─────────────────────────────────────────────────

/// Request-deduplication primitive: concurrent calls with the same key share
/// one underlying execution; callers arriving after completion start a fresh
/// flight.
pub struct Singleflight<T: Clone> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell.get_or_try_init(f).await.map(Clone::clone);
        // Retire the flight so a later renewal starts fresh. Waiters that
        // already hold the cell still read the shared result.
        self.inflight.lock().remove(key);
        result
    }
}

// ── manager ──────────────────────────────────────────────────────

pub struct TlsManager {
    /// Cert groups by name, merged from every listener's `cert_map`
    cert_map: RwLock<HashMap<String, CertConfig>>,
    /// Loaded cert pairs by group name
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    acme: Option<Arc<AcmeService>>,
    singleflight: Singleflight<Arc<CertifiedKey>>,
    before_auto_cert: Mutex<Option<AcmeHook>>,
    after_auto_cert: Mutex<Option<AcmeHook>>,
}

impl TlsManager {
    pub fn new(config: &Config) -> Self {
        let auto_enabled = config
            .servers
            .iter()
            .any(|s| s.tls.as_ref().is_some_and(|t| t.auto_tls));
        let acme = auto_enabled.then(|| Arc::new(AcmeService::new(&config.features.auto_cert)));

        let manager = Self {
            cert_map: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            acme,
            singleflight: Singleflight::default(),
            before_auto_cert: Mutex::new(None),
            after_auto_cert: Mutex::new(None),
        };
        manager.init_cert_map(config);
        manager
    }

    pub fn acme(&self) -> Option<Arc<AcmeService>> {
        self.acme.clone()
    }

    pub fn register_before_auto_cert(&self, hook: AcmeHook) {
        *self.before_auto_cert.lock() = Some(hook);
    }

    pub fn register_after_auto_cert(&self, hook: AcmeHook) {
        *self.after_auto_cert.lock() = Some(hook);
    }

    /// Collect every listener's cert groups into one table.
    fn init_cert_map(&self, config: &Config) {
        let mut cert_map = self.cert_map.write();
        for server in &config.servers {
            if let Some(tls) = &server.tls {
                for (group, cert) in &tls.cert_map {
                    cert_map.insert(group.clone(), cert.clone());
                }
                // A bare cert pair is its own single-domain group.
                if tls.cert_map.is_empty() && !tls.cert_file.is_empty() {
                    cert_map.insert(
                        server.name.clone(),
                        CertConfig {
                            domains: server
                                .domains
                                .iter()
                                .flat_map(|d| d.domains.clone())
                                .collect(),
                            cert_file: tls.cert_file.clone(),
                            key_file: tls.key_file.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Load every configured cert pair. Called once at startup; groups that
    /// fail to load are dropped with an error log so the other listeners
    /// still come up.
    pub fn load_static_certs(&self) {
        let cert_map = self.cert_map.read().clone();
        let mut loaded = self.loaded.write();
        for (group, cert) in cert_map {
            match load_cert_pair(&cert) {
                Ok(key) => {
                    info!(group = %group, domains = ?cert.domains, "loaded certificate group");
                    loaded.insert(group, key);
                }
                Err(e) => {
                    error!(group = %group, error = %e, "failed to load certificate group");
                }
            }
        }
    }

    /// Linear scan over cert groups for the first whose domain list contains
    /// the SNI name. `None` for unknown names, so the handshake fails.
    pub fn select_cert(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        let cert_map = self.cert_map.read();
        let loaded = self.loaded.read();
        for (group, cert) in cert_map.iter() {
            if cert.domains.iter().any(|d| d == sni) {
                return loaded.get(group).cloned();
            }
        }
        None
    }

    /// Server config for a static-cert listener: SNI resolution against the
    /// loaded groups, TLS 1.2 minimum, h2 + http/1.1 ALPN.
    pub fn static_server_config(self: &Arc<Self>, use_http2: bool) -> Arc<RustlsServerConfig> {
        let mut config = RustlsServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver {
            manager: Arc::clone(self),
        }));
        config.alpn_protocols = alpn(use_http2);
        Arc::new(config)
    }

    /// Certificate for one SNI name in auto mode. Concurrent handshakes with
    /// the same name collapse into one hook-wrapped acquisition.
    pub async fn auto_certificate(&self, sni: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let acme = self
            .acme
            .clone()
            .context("auto certificate requested but ACME is not configured")?;

        let before = self.before_auto_cert.lock().clone();
        let after = self.after_auto_cert.lock().clone();
        let domain = sni.to_string();

        self.singleflight
            .run(&format!("cert:{sni}"), move || async move {
                info!(domain = %domain, "acquiring certificate, preparing port 80");
                if let Some(before) = &before {
                    if let Err(e) = before().await {
                        error!(error = %e, "before-auto-cert hook failed");
                    }
                }

                let result = acme.obtain(&domain).await;

                if let Some(after) = &after {
                    if let Err(e) = after().await {
                        error!(error = %e, "after-auto-cert hook failed");
                    }
                }

                match &result {
                    Ok(_) => info!(domain = %domain, "certificate acquisition complete"),
                    Err(e) => error!(domain = %domain, error = %e, "certificate acquisition failed"),
                }
                result
            })
            .await
    }

    /// Per-connection server config around an auto-obtained certificate.
    pub fn auto_server_config(
        &self,
        cert: Arc<CertifiedKey>,
        use_http2: bool,
    ) -> Arc<RustlsServerConfig> {
        let mut config = RustlsServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedResolver { cert }));
        config.alpn_protocols = alpn(use_http2);
        Arc::new(config)
    }
}

fn alpn(use_http2: bool) -> Vec<Vec<u8>> {
    if use_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

/// SNI callback for static mode.
#[derive(Debug)]
struct SniResolver {
    manager: Arc<TlsManager>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        let cert = self.manager.select_cert(sni);
        if cert.is_none() {
            debug!(sni, "no certificate group for SNI name");
        }
        cert
    }
}

/// Resolver that always answers with one certificate (auto-mode connections).
#[derive(Debug)]
struct FixedResolver {
    cert: Arc<CertifiedKey>,
}

impl ResolvesServerCert for FixedResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.cert))
    }
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsManager")
            .field("groups", &self.cert_map.read().len())
            .field("auto", &self.acme.is_some())
            .finish()
    }
}

fn load_cert_pair(cert: &CertConfig) -> anyhow::Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(&cert.cert_file)
        .with_context(|| format!("read certificate {}", cert.cert_file))?;
    let key_pem =
        std::fs::read(&cert.key_file).with_context(|| format!("read key {}", cert.key_file))?;
    certified_key_from_pem(&cert_pem, &key_pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_singleflight_coalesces_concurrent_calls() {
        let sf: Arc<Singleflight<u64>> = Arc::new(Singleflight::default());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                sf.run("k", || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(42u64)
                })
                .await
                .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_singleflight_reruns_after_completion() {
        let sf: Singleflight<u64> = Singleflight::default();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            sf.run("k", || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(1u64)
            })
            .await
            .unwrap();
        }
        // Sequential calls are separate flights.
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_singleflight_keys_are_independent() {
        let sf: Arc<Singleflight<String>> = Arc::new(Singleflight::default());
        let a = sf.run("a", || async { Ok("a".to_string()) }).await.unwrap();
        let b = sf.run("b", || async { Ok("b".to_string()) }).await.unwrap();
        assert_eq!(a, "a");
        assert_eq!(b, "b");
    }

    fn manager_with_group(domains: &[&str]) -> Arc<TlsManager> {
        let manager = Arc::new(TlsManager::new(&Config::default()));
        manager.cert_map.write().insert(
            "group-a".to_string(),
            CertConfig {
                domains: domains.iter().map(|d| (*d).to_string()).collect(),
                cert_file: String::new(),
                key_file: String::new(),
            },
        );
        manager
    }

    #[test]
    fn test_select_cert_unknown_sni_is_none() {
        let manager = manager_with_group(&["a.example"]);
        // Group exists but no loaded key and the SNI is unknown anyway.
        assert!(manager.select_cert("nope.example").is_none());
    }

    #[test]
    fn test_cert_map_built_from_bare_pair() {
        let mut config = Config::default();
        config.servers.push(crate::config::ServerConfig {
            name: "edge".to_string(),
            host: "0.0.0.0".to_string(),
            port: 443,
            use_http2: true,
            protocol: "https".to_string(),
            enabled: true,
            max_request_body: 0,
            tls: Some(crate::config::TlsFileConfig {
                cert_file: "/certs/edge.pem".to_string(),
                key_file: "/certs/edge.key".to_string(),
                auto_tls: false,
                cert_map: HashMap::new(),
            }),
            domains: vec![crate::config::DomainConfig {
                domains: vec!["edge.example".to_string()],
                ..Default::default()
            }],
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 60,
            read_header_timeout: 10,
            max_header_bytes: 1024,
        });

        let manager = TlsManager::new(&config);
        let cert_map = manager.cert_map.read();
        let group = cert_map.get("edge").unwrap();
        assert_eq!(group.domains, vec!["edge.example"]);
        assert_eq!(group.cert_file, "/certs/edge.pem");
    }

    #[test]
    fn test_auto_mode_detection() {
        let config = Config::default();
        assert!(TlsManager::new(&config).acme().is_none());

        let mut config = Config::default();
        config.servers.push(crate::config::ServerConfig {
            name: "edge".to_string(),
            host: "0.0.0.0".to_string(),
            port: 443,
            use_http2: true,
            protocol: "https".to_string(),
            enabled: true,
            max_request_body: 0,
            tls: Some(crate::config::TlsFileConfig {
                auto_tls: true,
                ..Default::default()
            }),
            domains: Vec::new(),
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 60,
            read_header_timeout: 10,
            max_header_bytes: 1024,
        });
        assert!(TlsManager::new(&config).acme().is_some());
    }
}
