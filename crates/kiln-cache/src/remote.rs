//! The remote content store and its HTTP client.

use std::future::Future;
use std::sync::OnceLock;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{CacheError, Result};

/// A byte-blob key/value store, keyed by opaque content keys.
///
/// The seam between the disk cache and whatever holds the bytes remotely;
/// tests substitute an in-memory implementation.
pub trait Store: Send + Sync + 'static {
    /// Fetch the blob stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Store `data` under `key`, overwriting any prior value.
    fn put(&self, key: &str, data: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Get a shared HTTP client instance
fn client() -> &'static Client<HttpsConnector, Full<Bytes>> {
    static CLIENT: OnceLock<Client<HttpsConnector, Full<Bytes>>> = OnceLock::new();
    CLIENT.get_or_init(|| {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native roots")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Client::builder(TokioExecutor::new()).build(https)
    })
}

/// Content store spoken over plain HTTP.
///
/// `GET <base>/<key>` returns the blob, with an empty-body 204 standing in
/// for "absent". `POST <base>/<key>` stores one; any 2xx is success and the
/// response body carries nothing.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

impl Store for HttpStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(key);
        let request = Request::builder()
            .uri(url.as_str())
            .body(Full::new(Bytes::new()))
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        let response = client()
            .request(request)
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Err(CacheError::NotFound);
        }
        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?
            .to_bytes();
        Ok(body.to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let url = self.object_url(key);
        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(hyper::header::CONTENT_TYPE, "application/binary")
            .body(Full::new(Bytes::from(data)))
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        let response = client()
            .request(request)
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        // Headers are enough to signal success; the body is discarded.
        if !response.status().is_success() {
            return Err(CacheError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        Ok(())
    }
}
