use super::{ResultSender, Source, SourceState};
use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

const HACKERTARGET_URL: &str = "https://api.hackertarget.com";

// region:        --- Source info

pub struct HackerTarget {
    base_url: String,
    state: SourceState,
}

impl HackerTarget {
    pub fn new() -> Self {
        Self::with_base_url(HACKERTARGET_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: SourceState::default(),
        }
    }
}

// endregion:     --- Source info

#[async_trait]
impl Source for HackerTarget {
    fn name(&self) -> &'static str {
        "hackertarget"
    }

    fn description(&self) -> &'static str {
        "Use hackertarget.com host search to find subdomains"
    }

    fn is_default(&self) -> bool {
        true
    }

    fn has_recursive_support(&self) -> bool {
        true
    }

    fn needs_key(&self) -> bool {
        false
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
        let url = format!("{}/hostsearch/?q={}", self.base_url, domain);
        let body = session.simple_get(ctx, &url).await?.text().await?;

        // quota notices come back with a 200
        if body.starts_with("API count exceeded") || body.starts_with("error") {
            return Err(Error::Source(format!("hackertarget: {}", body.trim())));
        }

        let extractor = session.extractor();
        let mut count = 0;
        // one "host,ip" pair per line
        for line in body.lines() {
            let Some(host) = line
                .split(',')
                .next()
                .and_then(|host| extractor.find_string(host, domain))
            else {
                continue;
            };
            trace!("Collecting: {:?}", host);
            count += 1;
            if !results.subdomain(host).await {
                break;
            }
        }
        debug!("{} collected", count);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::sources::ResultKind;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn run_against(body: &str) -> Vec<crate::sources::ScrapeResult> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hostsearch/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let source = Arc::new(HackerTarget::with_base_url(server.uri()));
        let session = Arc::new(Session::new(SessionOptions::default(), HashMap::new()).unwrap());
        source
            .run(CancellationToken::new(), "example.com".to_string(), session)
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_host_lines() {
        let results = run_against("www.example.com,1.2.3.4\napi.example.com,5.6.7.8\n\nbad line").await;

        let hosts: Vec<&str> = results
            .iter()
            .filter_map(|result| match &result.kind {
                ResultKind::Subdomain(host) => Some(host.as_str()),
                ResultKind::Error(_) => None,
            })
            .collect();
        assert_eq!(hosts, vec!["www.example.com", "api.example.com"]);
    }

    #[tokio::test]
    async fn quota_notice_is_an_error() {
        let results = run_against("API count exceeded - Increase Quota with Membership").await;

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].kind, ResultKind::Error(Error::Source(_))));
    }
}
