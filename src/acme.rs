//! ACME certificate automation
//!
//! HTTP-01 order flow against any RFC 8555 CA. Account credentials and
//! issued certificates are cached under `./autocert`; pending challenge
//! tokens are served by the temporary port-80 server the server manager
//! brings up around each acquisition (see the TLS manager's hooks).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, KeyPair};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::config::AutoCertConfig;

/// On-disk cache location, relative to the working directory.
pub const CACHE_DIR: &str = "./autocert";

const ORDER_POLL_INTERVAL: Duration = Duration::from_millis(1500);
const ORDER_POLL_ATTEMPTS: usize = 20;

/// Pending HTTP-01 tokens, shared with the challenge server.
#[derive(Default)]
pub struct ChallengeStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    pub fn put(&self, token: String, key_authorization: String) {
        self.tokens.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.tokens.write().remove(token);
    }
}

pub struct AcmeService {
    config: AutoCertConfig,
    cache_dir: PathBuf,
    challenges: Arc<ChallengeStore>,
    /// Issued certificates by domain, rebuilt from disk on demand
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl AcmeService {
    pub fn new(config: &AutoCertConfig) -> Self {
        Self {
            config: config.clone(),
            cache_dir: PathBuf::from(CACHE_DIR),
            challenges: Arc::new(ChallengeStore::default()),
            certs: RwLock::new(HashMap::new()),
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.config.domains
    }

    pub fn challenges(&self) -> Arc<ChallengeStore> {
        Arc::clone(&self.challenges)
    }

    /// Router for the temporary port-80 challenge server.
    pub fn challenge_router(&self) -> Router {
        async fn serve_token(
            State(store): State<Arc<ChallengeStore>>,
            AxumPath(token): AxumPath<String>,
        ) -> Result<String, StatusCode> {
            store.get(&token).ok_or(StatusCode::NOT_FOUND)
        }

        Router::new()
            .route("/.well-known/acme-challenge/:token", get(serve_token))
            .with_state(self.challenges())
    }

    /// Certificate for a domain: memory cache, then disk cache, then a fresh
    /// order. Callers serialize through the TLS manager's singleflight, so
    /// at most one order per SNI name runs at a time.
    pub async fn obtain(&self, domain: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if !self.config.domains.iter().any(|d| d == domain) {
            bail!("domain {domain} not in the auto-cert whitelist");
        }

        if let Some(cert) = self.certs.read().get(domain) {
            return Ok(Arc::clone(cert));
        }
        if let Some(cert) = self.load_cached(domain)? {
            self.certs
                .write()
                .insert(domain.to_string(), Arc::clone(&cert));
            return Ok(cert);
        }

        info!(domain, "ordering certificate");
        let cert = self.order(domain).await?;
        self.certs
            .write()
            .insert(domain.to_string(), Arc::clone(&cert));
        Ok(cert)
    }

    /// Drop the in-memory entry so the next handshake re-reads disk / CA.
    pub fn invalidate(&self, domain: &str) {
        self.certs.write().remove(domain);
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.cache_dir.join(format!("{domain}.crt"))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.cache_dir.join(format!("{domain}.key"))
    }

    fn load_cached(&self, domain: &str) -> anyhow::Result<Option<Arc<CertifiedKey>>> {
        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        debug!(domain, "loading certificate from cache");
        let cert_pem = std::fs::read(&cert_path)?;
        let key_pem = std::fs::read(&key_path)?;
        Ok(Some(certified_key_from_pem(&cert_pem, &key_pem)?))
    }

    fn store(&self, domain: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cert_path(domain), cert_pem)?;
        std::fs::write(self.key_path(domain), key_pem)?;
        Ok(())
    }

    async fn account(&self) -> anyhow::Result<Account> {
        let credentials_path = self.cache_dir.join("account.json");
        if credentials_path.exists() {
            let raw = std::fs::read_to_string(&credentials_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&raw)?;
            if let Ok(account) = Account::from_credentials(credentials).await {
                return Ok(account);
            }
            warn!("stored ACME account unusable, registering a new one");
        }

        let contact = format!("mailto:{}", self.config.email);
        let contacts: Vec<&str> = if self.config.email.is_empty() {
            Vec::new()
        } else {
            vec![contact.as_str()]
        };
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.config.directory_url,
            None,
        )
        .await
        .context("create ACME account")?;

        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(&credentials_path, serde_json::to_string(&credentials)?)?;
        Ok(account)
    }

    async fn order(&self, domain: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let account = self.account().await?;
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .context("create ACME order")?;

        let authorizations = order.authorizations().await?;
        let mut served_tokens = Vec::new();
        for authz in &authorizations {
            if let Some(token) = self.answer_http01(&mut order, authz).await? {
                served_tokens.push(token);
            }
        }

        let status = self.poll_until_terminal(&mut order).await;
        for token in &served_tokens {
            self.challenges.remove(token);
        }
        let status = status?;
        if status != OrderStatus::Ready {
            bail!("ACME order for {domain} ended in {status:?}");
        }

        // CSR with a fresh ECDSA key; the CA returns the full chain.
        let key_pair = KeyPair::generate()?;
        let params = CertificateParams::new(vec![domain.to_string()])?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await.context("finalize order")?;

        let cert_pem = self.poll_certificate(&mut order).await?;
        let key_pem = key_pair.serialize_pem();
        self.store(domain, &cert_pem, &key_pem)?;
        info!(domain, "certificate issued");

        certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }

    async fn answer_http01(
        &self,
        order: &mut Order,
        authz: &Authorization,
    ) -> anyhow::Result<Option<String>> {
        match authz.status {
            AuthorizationStatus::Valid => return Ok(None),
            AuthorizationStatus::Pending => {}
            status => bail!("authorization in unexpected state {status:?}"),
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| anyhow!("no HTTP-01 challenge offered"))?;

        let key_authorization = order.key_authorization(challenge);
        self.challenges.put(
            challenge.token.clone(),
            key_authorization.as_str().to_string(),
        );
        order.set_challenge_ready(&challenge.url).await?;
        Ok(Some(challenge.token.clone()))
    }

    async fn poll_until_terminal(&self, order: &mut Order) -> anyhow::Result<OrderStatus> {
        for _ in 0..ORDER_POLL_ATTEMPTS {
            order.refresh().await?;
            let status = order.state().status;
            match status {
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                }
                status => return Ok(status),
            }
        }
        bail!("ACME order did not settle in time")
    }

    async fn poll_certificate(&self, order: &mut Order) -> anyhow::Result<String> {
        for _ in 0..ORDER_POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await? {
                return Ok(chain);
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }
        bail!("certificate not available after finalize")
    }
}

/// Build a rustls `CertifiedKey` from PEM cert chain + key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .context("parse certificate chain")?;
    if certs.is_empty() {
        bail!("certificate chain is empty");
    }
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))
            .context("parse private key")?
            .ok_or_else(|| anyhow!("no private key found"))?;
    let signing_key = any_supported_type(&key).context("unsupported key type")?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_store_round_trip() {
        let store = ChallengeStore::default();
        store.put("tok".to_string(), "tok.auth".to_string());
        assert_eq!(store.get("tok"), Some("tok.auth".to_string()));
        store.remove("tok");
        assert_eq!(store.get("tok"), None);
    }

    #[tokio::test]
    async fn test_obtain_rejects_unlisted_domain() {
        let service = AcmeService::new(&AutoCertConfig {
            email: "ops@example.com".to_string(),
            domains: vec!["acme.example".to_string()],
            directory_url: "https://acme.invalid/directory".to_string(),
        });
        assert!(service.obtain("other.example").await.is_err());
    }

    #[tokio::test]
    async fn test_challenge_router_serves_known_tokens() {
        use tower_service_call::call_router;

        let service = AcmeService::new(&AutoCertConfig::default());
        service
            .challenges()
            .put("abc".to_string(), "abc.keyauth".to_string());
        let router = service.challenge_router();

        let (status, body) = call_router(router.clone(), "/.well-known/acme-challenge/abc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "abc.keyauth");

        let (status, _) = call_router(router, "/.well-known/acme-challenge/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    /// Drive an axum router without binding a socket.
    mod tower_service_call {
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use axum::Router;
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        pub async fn call_router(router: Router, uri: &str) -> (StatusCode, String) {
            let response = router
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, String::from_utf8_lossy(&body).to_string())
        }
    }
}
