use super::{ResultSender, Source, SourceState};
use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

const WEB_ARCHIVE_URL: &str = "https://web.archive.org";

// region:        --- Source info

pub struct WebArchive {
    base_url: String,
    state: SourceState,
}

impl WebArchive {
    pub fn new() -> Self {
        Self::with_base_url(WEB_ARCHIVE_URL)
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
struct WebArchiveResponse(Vec<Vec<String>>);

#[async_trait]
impl Source for WebArchive {
    fn name(&self) -> &'static str {
        "webarchive"
    }

    fn description(&self) -> &'static str {
        "Use web.archive.org captured urls to find subdomains"
    }

    fn is_default(&self) -> bool {
        true
    }

    // archived urls of a subdomain are already part of the domain wide query
    fn has_recursive_support(&self) -> bool {
        false
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
        let url = format!(
            "{}/cdx/search/cdx?url={}&output=json&matchType=domain&fl=original&collapse=urlkey",
            self.base_url, domain
        );
        let res = session.simple_get(ctx, &url).await?;

        let urls: Vec<String> = match res.json::<WebArchiveResponse>().await {
            Ok(rows) => rows.0.into_iter().flatten().collect(),
            Err(err) => {
                return Err(Error::Source(format!("webarchive: invalid json body: {err}")))
            }
        };
        debug!("{} archived urls", urls.len());

        let extractor = session.extractor();
        let mut sent = HashSet::new();
        for url in urls {
            // header row
            if url == "original" {
                continue;
            }
            let host = match Url::parse(&url) {
                Ok(parsed) => parsed.host_str().map(str::to_string),
                Err(_) => {
                    trace!("Parsing url: {:?}", url);
                    None
                }
            };
            let Some(host) = host.and_then(|host| extractor.find_string(&host, domain)) else {
                continue;
            };
            if sent.insert(host.clone()) && !results.subdomain(host).await {
                return Ok(());
            }
        }

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
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hosts_from_archived_urls() {
        let server = MockServer::start().await;
        let body = serde_json::json!([
            ["original"],
            ["https://blog.example.com/2019/post"],
            ["http://blog.example.com:80/"],
            ["https://cdn.example.com/app.js"],
            ["not a url"],
        ]);
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .and(query_param("matchType", "domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let source = Arc::new(WebArchive::with_base_url(server.uri()));
        let session = Arc::new(Session::new(SessionOptions::default(), HashMap::new()).unwrap());
        let hosts: Vec<String> = source
            .run(CancellationToken::new(), "example.com".to_string(), session)
            .filter_map(|result| async move {
                match result.kind {
                    ResultKind::Subdomain(host) => Some(host),
                    ResultKind::Error(_) => None,
                }
            })
            .collect()
            .await;

        assert_eq!(hosts, vec!["blog.example.com", "cdn.example.com"]);
    }
}
