//! `RustlsListener` and TLS configuration.

use std::io::{Error as IoError, Result as IoResult};

use tokio_rustls::rustls::RootCertStore;

pub(crate) mod config;
pub use config::{
    ArcPeerVerifier, ClientVerification, Keycert, RustlsConfig, ServerConfig, Verdict, reloading,
};

mod listener;
pub use listener::{HandshakeStream, RustlsAcceptor, RustlsListener};

/// Parse a PEM bundle into a root store.
pub(crate) fn read_trust_anchor(mut trust_anchor: &[u8]) -> IoResult<RootCertStore> {
    let certs = rustls_pemfile::certs(&mut trust_anchor).collect::<IoResult<Vec<_>>>()?;
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|err| IoError::other(err.to_string()))?;
    }
    Ok(store)
}

/// Load the platform's trust store.
pub(crate) fn system_trust_anchor() -> IoResult<RootCertStore> {
    let loaded = rustls_native_certs::load_native_certs();
    let mut store = RootCertStore::empty();
    for cert in loaded.certs {
        store
            .add(cert)
            .map_err(|err| IoError::other(err.to_string()))?;
    }
    if store.is_empty() {
        return Err(IoError::other("no usable system trust roots"));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use super::*;
    use crate::conn::{Acceptor, HttpBuilder, HttpConnection, Listener, TcpListener};
    use crate::handler::handler_fn;
    use crate::service::Service;
    use crate::test::SpyCodec;

    fn server_keycert() -> Keycert {
        Keycert::new()
            .cert_from_path("certs/cert.pem")
            .unwrap()
            .key_from_path("certs/key.pem")
            .unwrap()
    }

    fn client_roots() -> RootCertStore {
        let ca = std::fs::read("certs/ca.pem").unwrap();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }
        roots
    }

    fn noop_service() -> Service {
        Service::new(handler_fn(|_req, _ctx, _body, _sender| async move {
            Ok(())
        }))
    }

    async fn negotiate(client_alpn: Vec<Vec<u8>>, config: RustlsConfig) -> (SpyCodec, bool) {
        let mut acceptor = TcpListener::new("127.0.0.1:0")
            .rustls(config)
            .bind()
            .await;
        let addr = acceptor.holdings()[0]
            .local_addr
            .clone()
            .into_std()
            .unwrap();

        let codec = SpyCodec::new();
        let builder = Arc::new(HttpBuilder::new(Arc::new(codec.clone())));
        let service = noop_service();

        let client = tokio::spawn(async move {
            let mut client_config = ClientConfig::builder()
                .with_root_certificates(client_roots())
                .with_no_client_auth();
            client_config.alpn_protocols = client_alpn;
            let connector = TlsConnector::from(Arc::new(client_config));
            let stream = TcpStream::connect(addr).await.unwrap();
            let domain = ServerName::try_from("localhost").unwrap();
            match connector.connect(domain, stream).await {
                Ok(mut tls) => {
                    tls.shutdown().await.ok();
                    true
                }
                Err(_) => false,
            }
        });

        let accepted = acceptor.accept().await.unwrap();
        let handler = service.exchange_handler(
            accepted.local_addr,
            accepted.remote_addr,
            accepted.http_scheme,
        );
        let served = accepted.conn.serve(handler, builder, None).await;
        let handshake_ok = client.await.unwrap();
        assert_eq!(served.is_ok(), handshake_ok);
        (codec, handshake_ok)
    }

    #[tokio::test]
    async fn test_alpn_h2_selects_http2() {
        let (codec, ok) = negotiate(vec![b"h2".to_vec()], RustlsConfig::new(server_keycert())).await;
        assert!(ok);
        assert_eq!(codec.http2_calls(), 1);
        assert_eq!(codec.http1_calls(), 0);
    }

    #[tokio::test]
    async fn test_alpn_http11_selects_http1() {
        let (codec, ok) = negotiate(
            vec![b"http/1.1".to_vec()],
            RustlsConfig::new(server_keycert()),
        )
        .await;
        assert!(ok);
        assert_eq!(codec.http1_calls(), 1);
        assert_eq!(codec.http2_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_client_alpn_falls_back_to_http1() {
        let (codec, ok) = negotiate(vec![], RustlsConfig::new(server_keycert())).await;
        assert!(ok);
        assert_eq!(codec.http1_calls(), 1);
        assert_eq!(codec.http2_calls(), 0);
    }

    async fn mutual_handshake(verdict: fn() -> Verdict) -> (Arc<AtomicUsize>, bool) {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let verifier: ArcPeerVerifier = Arc::new(move |chain| {
            assert!(!chain.is_empty());
            observed.fetch_add(1, Ordering::SeqCst);
            verdict()
        });
        let config = RustlsConfig::new(server_keycert())
            .client_verification(ClientVerification::Required {
                trust_roots: Some(std::fs::read("certs/ca.pem").unwrap()),
            })
            .peer_verifier(verifier);

        let mut acceptor = TcpListener::new("127.0.0.1:0")
            .rustls(config)
            .bind()
            .await;
        let addr = acceptor.holdings()[0]
            .local_addr
            .clone()
            .into_std()
            .unwrap();

        let client = tokio::spawn(async move {
            let client_cert = std::fs::read("certs/client.pem").unwrap();
            let client_key = std::fs::read("certs/client.key").unwrap();
            let certs = rustls_pemfile::certs(&mut client_cert.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
            let key = rustls_pemfile::private_key(&mut client_key.as_slice())
                .unwrap()
                .unwrap();
            let client_config = ClientConfig::builder()
                .with_root_certificates(client_roots())
                .with_client_auth_cert(certs, key)
                .unwrap();
            let connector = TlsConnector::from(Arc::new(client_config));
            let stream = TcpStream::connect(addr).await.unwrap();
            let domain = ServerName::try_from("localhost").unwrap();
            // Best effort: the assertions run against the server's view.
            if let Ok(mut tls) = connector.connect(domain, stream).await {
                tls.write_all(b"ping").await.ok();
                tls.shutdown().await.ok();
            }
        });

        let codec = SpyCodec::new();
        let builder = Arc::new(HttpBuilder::new(Arc::new(codec.clone())));
        let service = noop_service();
        let accepted = acceptor.accept().await.unwrap();
        let handler = service.exchange_handler(
            accepted.local_addr,
            accepted.remote_addr,
            accepted.http_scheme,
        );
        let served = accepted.conn.serve(handler, builder, None).await;
        client.await.unwrap();
        (calls, served.is_ok())
    }

    #[tokio::test]
    async fn test_custom_verifier_admits_peer() {
        let (calls, ok) = mutual_handshake(|| Verdict::Verified(Vec::new())).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_verifier_rejects_peer() {
        let (calls, ok) = mutual_handshake(|| Verdict::Failed("peer denied".into())).await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_trust_anchor() {
        let ca = std::fs::read("certs/ca.pem").unwrap();
        let store = read_trust_anchor(&ca).unwrap();
        assert_eq!(store.len(), 1);
    }
}
