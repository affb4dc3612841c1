use crate::{Error, Result};
use serde::Serialize;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// region:        --- Models

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub host: String,
    pub source: &'static str,
}

#[derive(Debug)]
pub struct SourceError {
    pub source: &'static str,
    pub error: Error,
}

/// Outcome of one run, nested recursion levels included.
#[derive(Debug)]
pub struct Enumeration {
    pub domain: String,
    /// In discovery order, first source to report a name keeps it.
    pub subdomains: Vec<Discovery>,
    pub errors: Vec<SourceError>,
    pub timings: BTreeMap<&'static str, Duration>,
    pub skipped: Vec<&'static str>,
    pub elapsed: Duration,
}

impl Enumeration {
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.subdomains.iter().map(|discovery| discovery.host.as_str())
    }

    pub fn len(&self) -> usize {
        self.subdomains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subdomains.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn errors_of<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Error> + 'a {
        self.errors
            .iter()
            .filter(move |entry| entry.source == source)
            .map(|entry| &entry.error)
    }
}

// endregion:     --- Models

// region:        --- Report

#[derive(Debug, Serialize)]
struct Report<'a> {
    domain: &'a str,
    generated_at: String,
    elapsed_ms: u128,
    count: usize,
    subdomains: &'a [Discovery],
    errors: Vec<ReportError<'a>>,
    timings_ms: BTreeMap<&'static str, u128>,
    skipped: &'a [&'static str],
}

#[derive(Debug, Serialize)]
struct ReportError<'a> {
    source: &'a str,
    timeout: bool,
    error: String,
}

impl<'a> Report<'a> {
    fn new(result: &'a Enumeration) -> Result<Self> {
        Ok(Self {
            domain: &result.domain,
            generated_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
            elapsed_ms: result.elapsed.as_millis(),
            count: result.len(),
            subdomains: &result.subdomains,
            errors: result
                .errors
                .iter()
                .map(|entry| ReportError {
                    source: entry.source,
                    timeout: entry.error.is_timeout(),
                    error: entry.error.to_string(),
                })
                .collect(),
            timings_ms: result
                .timings
                .iter()
                .map(|(source, elapsed)| (*source, elapsed.as_millis()))
                .collect(),
            skipped: &result.skipped,
        })
    }
}

// endregion:     --- Report

// region:        --- Exporting utils

pub fn ensure_dir(dir: &Path) -> Result<bool> {
    if dir.is_dir() {
        Ok(false)
    } else {
        fs::create_dir_all(dir)?;
        Ok(true)
    }
}

pub fn export_to_json(result: &Enumeration, path: &Path) -> Result<()> {
    let json = to_string_pretty(&Report::new(result)?)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

pub fn export_to_text(result: &Enumeration, path: &Path) -> Result<()> {
    let mut content = String::new();
    for host in result.hosts() {
        writeln!(&mut content, "{}", host)?;
    }

    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

// endregion:     --- Exporting utils

#[cfg(test)]
mod tests {
    use super::*;

    fn enumeration() -> Enumeration {
        let mut timings = BTreeMap::new();
        timings.insert("a", Duration::from_millis(12));
        timings.insert("b", Duration::from_millis(30));

        Enumeration {
            domain: "example.com".to_string(),
            subdomains: vec![
                Discovery {
                    host: "www.example.com".to_string(),
                    source: "a",
                },
                Discovery {
                    host: "api.example.com".to_string(),
                    source: "b",
                },
            ],
            errors: vec![SourceError {
                source: "b",
                error: Error::Timeout {
                    source: "b",
                    after: Duration::from_secs(1),
                },
            }],
            timings,
            skipped: vec!["c"],
            elapsed: Duration::from_millis(42),
        }
    }

    #[test]
    fn json_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        export_to_json(&enumeration(), &path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["domain"], "example.com");
        assert_eq!(json["count"], 2);
        assert_eq!(json["subdomains"][1]["host"], "api.example.com");
        assert_eq!(json["errors"][0]["source"], "b");
        assert_eq!(json["errors"][0]["timeout"], true);
        assert_eq!(json["timings_ms"]["b"], 30);
        assert_eq!(json["skipped"][0], "c");
    }

    #[test]
    fn text_report_one_host_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");

        export_to_text(&enumeration(), &path).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "www.example.com\napi.example.com\n"
        );
    }

    #[test]
    fn errors_by_source() {
        let result = enumeration();

        assert_eq!(result.errors_of("b").count(), 1);
        assert_eq!(result.errors_of("a").count(), 0);
        assert!(result.errors_of("b").all(Error::is_timeout));
    }

    #[test]
    fn ensure_dir_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("output/subscraper");

        assert!(ensure_dir(&nested).unwrap());
        assert!(!ensure_dir(&nested).unwrap());
    }
}
