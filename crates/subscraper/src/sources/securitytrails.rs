use super::{ResultSender, Source, SourceState};
use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const SECURITYTRAILS_URL: &str = "https://api.securitytrails.com";

// region:        --- Source info

pub struct SecurityTrails {
    base_url: String,
    state: SourceState,
}

impl SecurityTrails {
    pub fn new() -> Self {
        Self::with_base_url(SECURITYTRAILS_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: SourceState::default(),
        }
    }
}

// endregion:     --- Source info

#[derive(Debug, Deserialize)]
struct SecurityTrailsResponse {
    #[serde(default)]
    subdomains: Vec<String>,
}

#[async_trait]
impl Source for SecurityTrails {
    fn name(&self) -> &'static str {
        "securitytrails"
    }

    fn description(&self) -> &'static str {
        "Use the securitytrails.com API to find subdomains (API key)"
    }

    fn is_default(&self) -> bool {
        true
    }

    fn has_recursive_support(&self) -> bool {
        true
    }

    fn needs_key(&self) -> bool {
        true
    }

    fn state(&self) -> &SourceState {
        &self.state
    }

    #[instrument(name = "enumerate", level = "debug", fields(source = %self.name()), skip_all)]
    async fn enumerate(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        session: &Session,
        results: &ResultSender,
    ) -> Result<()> {
        let key = self
            .state
            .next_key()
            .ok_or_else(|| Error::Source("securitytrails: no api key".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(&key)
                .map_err(|_| Error::Source("securitytrails: api key is not a valid header".into()))?,
        );

        let url = format!("{}/v1/domain/{}/subdomains", self.base_url, domain);
        let res = session.get_with_headers(ctx, &url, headers).await?;
        let body: SecurityTrailsResponse = match res.json().await {
            Ok(body) => body,
            Err(err) => {
                return Err(Error::Source(format!(
                    "securitytrails: invalid json body: {err}"
                )))
            }
        };
        debug!("{} labels", body.subdomains.len());

        // the API answers with bare labels
        for label in body.subdomains {
            let host = format!("{}.{}", label.trim_end_matches('.'), domain);
            if !results.subdomain(host).await {
                break;
            }
        }

        Ok(())
    }
}
