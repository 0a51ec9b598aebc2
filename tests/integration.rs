//! End-to-end pipeline tests
//!
//! Drives the assembled gateway against live loopback upstreams: topology
//! routing, rewrite rules, round-robin fairness, modifier output and the
//! gzip path.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hamburger::config::{ApiBackendConfig, Config, FrontServerConfig};
use hamburger::context::RequestCtx;
use hamburger::proxy::Gateway;
use hamburger::runtime::{ServiceMap, StaticRegistry, Topology};
use hamburger::stat::NoGeo;

fn ctx(host: &str, path: &str) -> RequestCtx {
    RequestCtx::new(Method::GET, host, path, None, HeaderMap::new(), None)
}

fn gateway(config: Config) -> Arc<Gateway> {
    Gateway::new(
        Arc::new(config),
        Arc::new(StaticRegistry::empty()),
        Arc::new(NoGeo),
    )
}

/// Upstream that answers `replies` requests with a fixed response and
/// records each request head.
async fn spawn_upstream(
    replies: usize,
    response: String,
) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        for _ in 0..replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16384];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (addr, rx)
}

fn install(
    gateway: &Gateway,
    entries: &[(&str, &str, &str, Vec<u16>)],
) {
    let mut topology = Topology::default();
    for (domain, frontend, backend, ports) in entries {
        topology.domains.insert(
            (*domain).to_string(),
            ServiceMap {
                frontend: (*frontend).to_string(),
                backend: (*backend).to_string(),
            },
        );
        if !frontend.is_empty() {
            topology
                .frontends
                .insert((*frontend).to_string(), (*domain).to_string());
        }
        if !ports.is_empty() {
            topology.ports.insert((*domain).to_string(), ports.clone());
        }
    }
    gateway.topology.install(topology);
}

#[tokio::test]
async fn test_pure_frontend_route_tags_and_forwards() {
    // The frontend static server is just another HTTP upstream here.
    let (addr, mut seen) = spawn_upstream(
        1,
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 4\r\n\r\nhome".to_string(),
    )
    .await;

    let mut config = Config::default();
    config.pxy_frontend.host = "127.0.0.1".to_string();
    config.pxy_frontend.port = addr.port();
    let gateway = gateway(config);
    install(&gateway, &[("foo.example", "web-a", "", vec![])]);

    let mut c = ctx("foo.example", "/index.html");
    let response = gateway.handle(&mut c, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"home");

    let head = seen.recv().await.unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /index.html http/1.1"));
    // Outbound carries the frontend tag and the original host.
    assert!(head.contains("x-hamburger-internal: web-a"));
    assert!(head.contains("x-forward-host: foo.example"));
}

#[tokio::test]
async fn test_backend_rewrite_and_round_robin() {
    // Three backend ports; requests must cycle through them in order.
    let mut addrs = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (addr, rx) = spawn_upstream(
            4,
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok".to_string(),
        )
        .await;
        addrs.push(addr.port());
        receivers.push(rx);
    }

    let mut config = Config::default();
    config.pxy_frontend.servers = vec![FrontServerConfig {
        name: "web-a".to_string(),
        root: String::new(),
        index: String::new(),
        backends: vec![ApiBackendConfig {
            api: "/api".to_string(),
            service: "svc-a".to_string(),
            use_rewrite: true,
            rewrite: "/v1".to_string(),
        }],
    }];
    let gateway = gateway(config);
    install(
        &gateway,
        &[("api.example", "web-a", "svc-a", addrs.clone())],
    );

    for _ in 0..4 {
        let mut c = RequestCtx::new(
            Method::POST,
            "api.example",
            "/api/users/42",
            None,
            HeaderMap::new(),
            None,
        );
        let response = gateway.handle(&mut c, Bytes::from_static(b"{}")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Round-robin walked the list in order and wrapped: 0,1,2,0.
    let mut hits = [0usize; 3];
    for (i, rx) in receivers.iter_mut().enumerate() {
        while let Ok(head) = rx.try_recv() {
            hits[i] += 1;
            // Rewrite replaced the /api prefix.
            assert!(
                head.starts_with("POST /v1/users/42"),
                "unexpected request line: {head}"
            );
        }
    }
    assert_eq!(hits.iter().sum::<usize>(), 4);
    assert_eq!(hits.iter().max(), Some(&2));
    assert_eq!(hits.iter().min(), Some(&1));
}

#[tokio::test]
async fn test_spa_fallback_routes_to_frontend() {
    let (front_addr, mut seen) = spawn_upstream(
        1,
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 3\r\n\r\nspa".to_string(),
    )
    .await;

    let mut config = Config::default();
    config.pxy_frontend.port = front_addr.port();
    config.pxy_frontend.servers = vec![FrontServerConfig {
        name: "web-a".to_string(),
        root: String::new(),
        index: String::new(),
        backends: vec![ApiBackendConfig {
            api: "/api".to_string(),
            service: "svc-a".to_string(),
            use_rewrite: false,
            rewrite: String::new(),
        }],
    }];
    let gateway = gateway(config);
    install(&gateway, &[("app.example", "web-a", "svc-a", vec![9001])]);

    // Not an /api path: falls back to the frontend even though a backend
    // exists for this domain.
    let mut c = ctx("app.example", "/dashboard/settings");
    let response = gateway.handle(&mut c, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"spa");

    let head = seen.recv().await.unwrap().to_ascii_lowercase();
    assert!(head.contains("x-hamburger-internal: web-a"));
}

#[tokio::test]
async fn test_gzip_end_to_end_with_cache() {
    let body = "lorem ipsum dolor sit amet ".repeat(2000); // ~54 KiB
    let upstream_response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (addr, _seen) = spawn_upstream(2, upstream_response).await;

    let mut config = Config::default();
    config.features.gzip.enabled = true;
    config.features.gzip.threshold = 1024;
    let gateway = gateway(config);
    install(&gateway, &[("api.example", "", "svc-a", vec![addr.port()])]);

    for _ in 0..2 {
        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        let mut c = RequestCtx::new(
            Method::GET,
            "api.example",
            "/page",
            None,
            headers,
            None,
        );
        let response = gateway.handle(&mut c, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
        assert_eq!(response.headers().get("vary").unwrap(), "Accept-Encoding");
        assert!(response.body().len() < body.len());

        // Payload must decode back to the upstream body.
        use std::io::Read;
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(response.body().as_ref())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body.as_bytes());
    }
}

#[tokio::test]
async fn test_frontend_and_backend_counters() {
    let (front_addr, _r1) = spawn_upstream(
        1,
        "HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nf".to_string(),
    )
    .await;
    let (back_addr, _r2) = spawn_upstream(
        1,
        "HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nb".to_string(),
    )
    .await;

    let mut config = Config::default();
    config.stat.enable_stat = true;
    config.pxy_frontend.port = front_addr.port();
    let gateway = gateway(config);
    install(
        &gateway,
        &[
            ("static.example", "web-a", "", vec![]),
            ("api.example", "", "svc-a", vec![back_addr.port()]),
        ],
    );

    let mut c = ctx("static.example", "/");
    gateway.handle(&mut c, Bytes::new()).await;
    let mut c = ctx("api.example", "/");
    gateway.handle(&mut c, Bytes::new()).await;

    use hamburger::stat::Counter;
    assert_eq!(gateway.stats.get(Counter::Total), 2);
    assert_eq!(gateway.stats.get(Counter::Static), 1);
    assert_eq!(gateway.stats.get(Counter::Api), 1);
    assert_eq!(gateway.stats.get(Counter::Fail), 0);
}
