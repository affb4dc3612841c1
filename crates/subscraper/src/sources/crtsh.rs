use super::{ResultSender, Source, SourceState};
use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

const CRTSH_URL: &str = "https://crt.sh";
const CERTWATCH_DSN: &str = "host=crt.sh user=guest dbname=certwatch sslmode=disable connect_timeout=10";

// identities of every certificate naming the domain, newest log entries first
const CERTWATCH_QUERY: &str = "WITH ci AS (
    SELECT min(sub.CERTIFICATE_ID) ID,
        min(sub.ISSUER_CA_ID) ISSUER_CA_ID,
        array_agg(DISTINCT sub.NAME_VALUE) NAME_VALUES
    FROM (SELECT *
            FROM certificate_and_identities cai
            WHERE plainto_tsquery('certwatch', $1) @@ identities(cai.CERTIFICATE)
                AND cai.NAME_VALUE ILIKE ('%' || $1 || '%')
            LIMIT 10000
        ) sub
    GROUP BY sub.CERTIFICATE
)
SELECT array_to_string(ci.NAME_VALUES, chr(10)) NAME_VALUE
    FROM ci
        LEFT JOIN LATERAL (
            SELECT min(ctle.ENTRY_TIMESTAMP) ENTRY_TIMESTAMP
                FROM ct_log_entry ctle
                WHERE ctle.CERTIFICATE_ID = ci.ID
        ) le ON TRUE,
        ca
    WHERE ci.ISSUER_CA_ID = ca.ID
    ORDER BY le.ENTRY_TIMESTAMP DESC NULLS LAST";

// region:        --- Source info

pub struct CrtSh {
    base_url: String,
    /// Connection string of the certwatch database, `None` queries the HTTP endpoint only.
    database: Option<String>,
    state: SourceState,
}

impl CrtSh {
    pub fn new() -> Self {
        Self::with_base_url(CRTSH_URL).with_database(CERTWATCH_DSN)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: None,
            state: SourceState::default(),
        }
    }

    pub fn with_database(mut self, dsn: impl Into<String>) -> Self {
        self.database = Some(dsn.into());
        self
    }
}

// endregion:     --- Source info

#[derive(Debug, Deserialize)]
struct CrtShEntry {
    name_value: String,
}

#[async_trait]
impl Source for CrtSh {
    fn name(&self) -> &'static str {
        "crtsh"
    }

    fn description(&self) -> &'static str {
        "Use crt.sh certificate transparency logs to find subdomains"
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
        if let Some(dsn) = &self.database {
            let rows = self.query_database(ctx, dsn, domain, session, results).await;
            if !needs_http_fallback(&rows) {
                let count = rows?;
                debug!("{} certwatch rows", count);
                return Ok(());
            }
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Err(err) = rows {
                warn!("crtsh: certwatch query failed, falling back to http ({})", err);
                if !results.error(err).await {
                    return Ok(());
                }
            }
        }

        self.query_http(ctx, domain, session, results).await
    }
}

// region:        --- Queries

impl CrtSh {
    /// Streams the names of the certwatch rows, returns how many rows were read.
    async fn query_database(
        &self,
        ctx: &CancellationToken,
        dsn: &str,
        domain: &str,
        session: &Session,
        results: &ResultSender,
    ) -> Result<usize> {
        let (client, connection) = tokio::select! {
            res = tokio_postgres::connect(dsn, NoTls) => res?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };
        // the connection lives until the client is dropped
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("certwatch connection: {}", err);
            }
        });

        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 1] = [&domain];
        let rows = tokio::select! {
            res = client.query(CERTWATCH_QUERY, &params) => res?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };

        let extractor = session.extractor();
        let mut count = 0;
        for row in rows {
            let names: Option<String> = row.try_get(0)?;
            count += 1;
            for host in names
                .iter()
                .flat_map(|names| names.split('\n'))
                .filter_map(|name| extractor.find_string(name, domain))
            {
                trace!("Collecting: {:?}", host);
                if !results.subdomain(host).await {
                    return Ok(count);
                }
            }
        }

        Ok(count)
    }

    async fn query_http(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        session: &Session,
        results: &ResultSender,
    ) -> Result<()> {
        let url = format!("{}/?q=%25.{}&output=json", self.base_url, domain);
        let res = session.simple_get(ctx, &url).await?;

        let entries: Vec<CrtShEntry> = match res.json().await {
            Ok(entries) => entries,
            Err(err) => return Err(Error::Source(format!("crtsh: invalid json body: {err}"))),
        };
        debug!("{} certificate entries", entries.len());

        let extractor = session.extractor();
        for entry in entries {
            // one certificate lists all of its names, newline separated
            for host in entry
                .name_value
                .split('\n')
                .filter_map(|name| extractor.find_string(name, domain))
            {
                trace!("Collecting: {:?}", host);
                if !results.subdomain(host).await {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// The HTTP endpoint is only asked when the database gave nothing.
fn needs_http_fallback(rows: &Result<usize>) -> bool {
    match rows {
        Ok(count) => *count == 0,
        Err(Error::Cancelled) => false,
        Err(_) => true,
    }
}

// endregion:     --- Queries
