use crate::extractor::Extractor;
use crate::{Error, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy, Response};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

// region:        --- Constants

const HTTP_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0";

// endregion:     --- Constants

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub proxy: Option<String>,
    pub timeout: Duration,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub user_agent: String,
    /// Outbound requests per second shared by every source, 0 disables pacing.
    pub rate_limit: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: Duration::from_millis(HTTP_REQUEST_TIMEOUT_MS),
            insecure: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit: 0,
        }
    }
}

/// Context shared by every source of a run, recursion levels included.
pub struct Session {
    http_client: Client,
    api_keys: HashMap<String, Vec<String>>,
    extractor: Extractor,
    rate_limiter: Option<DefaultDirectRateLimiter>,
}

// region:        --- Constructors

impl Session {
    pub fn new(options: SessionOptions, api_keys: HashMap<String, Vec<String>>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.as_str())
            .danger_accept_invalid_certs(options.insecure);

        if let Some(proxy) = &options.proxy {
            builder = builder.proxy(Proxy::all(proxy.as_str())?);
        }
        let http_client = builder.build()?;
        debug!("HTTP Client created: {:?}", http_client);

        let rate_limiter =
            NonZeroU32::new(options.rate_limit).map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        let api_keys = api_keys
            .into_iter()
            .map(|(name, keys)| {
                let keys: Vec<String> = keys.into_iter().filter(|key| !key.trim().is_empty()).collect();
                (name.to_lowercase(), keys)
            })
            .filter(|(_, keys)| !keys.is_empty())
            .collect();

        Ok(Self {
            http_client,
            api_keys,
            extractor: Extractor::new(),
            rate_limiter,
        })
    }
}

// endregion:     --- Constructors

// region:        --- Accessors

impl Session {
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn api_keys(&self, source: &str) -> &[String] {
        self.api_keys
            .get(&source.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_key(&self, source: &str) -> bool {
        !self.api_keys(source).is_empty()
    }
}

// endregion:     --- Accessors

// region:        --- HTTP requests

impl Session {
    pub async fn simple_get(&self, ctx: &CancellationToken, url: &str) -> Result<Response> {
        self.get_with_headers(ctx, url, HeaderMap::new()).await
    }

    /// GET paced by the shared limiter. Cancelling `ctx` aborts the wait for a slot as well as
    /// the in-flight request. Non-success statuses are drained and turned into errors.
    #[instrument(name = "http_request", level = "debug", skip_all, fields(url = url))]
    pub async fn get_with_headers(
        &self,
        ctx: &CancellationToken,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Response> {
        self.wait_for_slot(ctx).await?;

        trace!("Sending request");
        let res = tokio::select! {
            res = self.http_client.get(url).headers(headers).send() => res?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };
        debug!("Receive with status: {}", res.status());

        if !res.status().is_success() {
            let status = res.status().as_u16();
            self.discard_response(Some(res)).await;
            return Err(Error::InvalidHttpResponse {
                url: url.to_string(),
                status,
            });
        }

        Ok(res)
    }

    /// Reads whatever is left of the body so the connection goes back to the pool.
    pub async fn discard_response(&self, response: Option<Response>) {
        if let Some(res) = response {
            if let Err(err) = res.bytes().await {
                trace!("Discarding body: {}", err);
            }
        }
    }

    async fn wait_for_slot(&self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                _ = limiter.until_ready() => {}
                _ = ctx.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }
}

// endregion:     --- HTTP requests

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(rate_limit: u32) -> Session {
        let options = SessionOptions {
            rate_limit,
            ..SessionOptions::default()
        };
        Session::new(options, HashMap::new()).unwrap()
    }

    #[tokio::test]
    async fn simple_get_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let session = session(0);
        let ctx = CancellationToken::new();
        let res = session
            .simple_get(&ctx, &format!("{}/ok", server.uri()))
            .await
            .unwrap();

        assert_eq!(res.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let session = session(0);
        let ctx = CancellationToken::new();
        let err = session.simple_get(&ctx, &server.uri()).await.unwrap_err();

        assert!(matches!(err, Error::InvalidHttpResponse { status: 429, .. }));
    }

    #[tokio::test]
    async fn cancel_aborts_pending_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let session = session(0);
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = session.simple_get(&ctx, &server.uri()).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_context_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let session = session(1);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = session.simple_get(&ctx, &server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn rate_limiter_paces_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        // 2 per second: the third call has to wait for a new slot
        let session = session(2);
        let ctx = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            session.simple_get(&ctx, &server.uri()).await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn discard_none_is_noop() {
        session(0).discard_response(None).await;
    }

    #[test]
    fn keys_are_normalized() {
        let mut keys = HashMap::new();
        keys.insert("SecurityTrails".to_string(), vec!["k1".to_string(), " ".to_string()]);
        keys.insert("empty".to_string(), vec![]);

        let session = Session::new(SessionOptions::default(), keys).unwrap();

        assert_eq!(session.api_keys("securitytrails"), ["k1".to_string()]);
        assert!(session.has_key("SECURITYTRAILS"));
        assert!(!session.has_key("empty"));
        assert!(session.api_keys("unknown").is_empty());
    }
}
