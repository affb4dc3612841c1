use crate::Result;
use std::io;
use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Terminal logs go to stderr so stdout only carries discovered hosts. `RUST_LOG` wins over
/// `verbose` when set.
pub fn init_tracing_subscriber(
    save_logs_file: bool,
    output_dir: &Path,
    filename: &str,
    verbose: bool,
) -> Result<()> {
    let fallback = if verbose { "subscraper=debug" } else { "subscraper=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);

    if save_logs_file {
        // one file per run, named after the run
        let file_appender = rolling::never(output_dir, format!("{}.log", filename));
        let subscriber = subscriber
            .with_ansi(false)
            .with_file(false)
            .with_target(false)
            .with_writer(file_appender)
            .finish();

        // terminal as an additional layer
        let stderr_layer = layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true)
            .with_file(false)
            .with_target(false)
            .with_writer(io::stderr);

        tracing::subscriber::set_global_default(subscriber.with(stderr_layer))?;
    } else {
        let subscriber = subscriber
            .without_time()
            .with_ansi(true)
            .with_file(false)
            .with_target(false)
            .with_writer(io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::fs;
    use tracing::warn;

    // the global subscriber can be set once per process, so a single test covers both calls
    #[test]
    fn log_file_is_written_once_per_process() {
        let dir = tempfile::tempdir().unwrap();

        init_tracing_subscriber(true, dir.path(), "run_1", false).unwrap();
        warn!("{:12} - {:?}", "DISCOVERED", "www.example.com");

        let logs = fs::read_to_string(dir.path().join("run_1.log")).unwrap();
        assert!(logs.contains("www.example.com"));
        assert!(!logs.contains('\u{1b}'), "no ansi codes in the file");

        let err = init_tracing_subscriber(false, dir.path(), "run_2", false).unwrap_err();
        assert!(matches!(err, Error::Subscriber(_)));
    }
}
