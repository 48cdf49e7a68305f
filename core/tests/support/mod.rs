//! Shared plumbing for the live-server test suites: a reqwest-backed
//! transport and a helper that boots the mock server on a random port.

use std::sync::Arc;

use async_trait::async_trait;
use resource_core::{AbortSignal, ClientError, HttpMethod, HttpRequest, RawResponse, Transport};

/// Execute requests over real HTTP using reqwest, honoring the abort
/// signal by racing it against the exchange.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { client: reqwest::Client::new() })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(
        &self,
        request: HttpRequest,
        signal: AbortSignal,
    ) -> Result<RawResponse, ClientError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Patch => self.client.patch(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
            HttpMethod::Head => self.client.head(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let exchange = async move {
            let response = builder.send().await.map_err(|e| ClientError::Network(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (name.to_string(), value.to_str().unwrap_or_default().to_string())
                })
                .collect();
            let body = response.text().await.map_err(|e| ClientError::Network(e.to_string()))?;
            Ok(RawResponse { status, headers, body })
        };

        tokio::select! {
            biased;
            () = signal.cancelled() => Err(ClientError::Aborted { reason: signal.reason() }),
            result = exchange => result,
        }
    }
}

/// Boot the mock server on a random port and return its base URL.
pub async fn start_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move { mock_server::run(listener).await });
    format!("http://{addr}")
}

/// How many GETs the server has seen for `dataset`.
#[allow(dead_code)]
pub async fn hits(base: &str, dataset: &str) -> u64 {
    reqwest::get(format!("{base}/__hits/{dataset}"))
        .await
        .expect("hits request")
        .text()
        .await
        .expect("hits body")
        .trim()
        .parse()
        .expect("hits count")
}
