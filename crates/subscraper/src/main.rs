use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subscraper::config::default_config_path;
use subscraper::extractor::{is_hostname, normalize};
use subscraper::model::{ensure_dir, export_to_json, export_to_text};
use subscraper::utils::log::init_tracing_subscriber;
use subscraper::{
    Enumeration, Error, ProviderConfig, Registry, Result, Runner, RunnerOptions, Session,
    SessionOptions, Source,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTPUT_ROOT: &str = "output/subscraper";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about("Passive subdomain discovery")
        .subcommand(Command::new("sources").about("List all sources"))
        .subcommand(
            Command::new("enum")
                .about("Enumerate the subdomains of a domain")
                .arg(
                    Arg::new("domain")
                        .help("The domain to enumerate")
                        .value_name("DOMAIN")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("sources")
                        .short('s')
                        .long("sources")
                        .help("Comma separated sources to use instead of the defaults")
                        .value_name("SOURCES")
                        .value_delimiter(',')
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("all")
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("sources")
                        .help("Use every source, not only the defaults"),
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .help("Deadline of the whole run in seconds")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("600"),
                )
                .arg(
                    Arg::new("source-timeout")
                        .long("source-timeout")
                        .help("Deadline of a single source in seconds")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("recursive-depth")
                        .short('r')
                        .long("recursive-depth")
                        .help("Enumerate again the subdomains found by recursive sources, up to this depth")
                        .value_name("DEPTH")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("rate-limit")
                        .long("rate-limit")
                        .help("Maximum requests per second, 0 for no limit")
                        .value_name("RPS")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("proxy")
                        .long("proxy")
                        .help("HTTP proxy for every request")
                        .value_name("URL"),
                )
                .arg(
                    Arg::new("insecure")
                        .long("insecure")
                        .action(ArgAction::SetTrue)
                        .help("Do not verify TLS certificates"),
                )
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .help("Provider config with the API keys")
                        .value_name("FILE")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Output format")
                        .value_name("OUTPUT")
                        .value_parser(["text", "json", "both"])
                        .default_value("both"),
                )
                .arg(
                    Arg::new("logs")
                        .long("logs")
                        .action(ArgAction::SetTrue)
                        .help("Save logs into a .log file"),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Debug logs"),
                ),
        )
        .arg_required_else_help(true)
        .get_matches();

    match cli.subcommand() {
        Some(("sources", _)) => Registry::global().display_all(),
        Some(("enum", args)) => enumerate(args).await?,

        // fallback if a cmd is not handled (should not possible)
        _ => {
            error!("{:12} - Command not handled, exit program", "CLI ERROR");
            return Err(Error::CliUsage("Command not handled".into()));
        }
    }

    Ok(())
}

async fn enumerate(args: &ArgMatches) -> Result<()> {
    let domain = args
        .get_one::<String>("domain")
        .map(|domain| normalize(domain))
        .unwrap_or_default();
    if !is_hostname(&domain) {
        return Err(Error::CliUsage(format!("{:?} is not a domain name", domain)));
    }

    // create filename
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let filename = format!("{}", timestamp);

    // create output dir
    let output_dir = Path::new(OUTPUT_ROOT).join(&domain);
    ensure_dir(&output_dir)?;

    init_tracing_subscriber(
        args.get_flag("logs"),
        &output_dir,
        &filename,
        args.get_flag("verbose"),
    )?;

    let keys = load_provider_config(args.get_one::<PathBuf>("config"))?;
    let sources = select_sources(args)?;

    let session_options = SessionOptions {
        proxy: args.get_one::<String>("proxy").cloned(),
        insecure: args.get_flag("insecure"),
        rate_limit: args.get_one::<u32>("rate-limit").copied().unwrap_or_default(),
        ..SessionOptions::default()
    };
    let session = Arc::new(Session::new(session_options, keys.into_keys())?);

    let options = RunnerOptions {
        timeout: Duration::from_secs(args.get_one::<u64>("timeout").copied().unwrap_or(600)),
        source_timeout: args
            .get_one::<u64>("source-timeout")
            .map(|secs| Duration::from_secs(*secs)),
        max_depth: args
            .get_one::<usize>("recursive-depth")
            .copied()
            .unwrap_or_default(),
        ..RunnerOptions::default()
    };

    // print hosts as they come
    let (tx, mut rx) = mpsc::unbounded_channel::<subscraper::model::Discovery>();
    let printer = tokio::spawn(async move {
        while let Some(discovery) = rx.recv().await {
            println!("{}", discovery.host);
        }
    });

    // ctrl-c stops the run, what was found is still written
    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with partial results");
            interrupt.cancel();
        }
    });

    info!("Enumerating {} (run_{})", domain, timestamp);
    let runner = Runner::new(sources, session, options).with_listener(tx);
    let result = runner.enumerate_with_token(&domain, ctx).await?;
    drop(runner);
    if let Err(err) = printer.await {
        debug!("Printer task: {}", err);
    }

    summarize(&result);

    // write result
    if let Some(format) = args.get_one::<String>("output") {
        if format == "both" || format == "text" {
            let text_path = output_dir.join(&filename).with_extension("txt");
            export_to_text(&result, &text_path)?;
            info!("{:12} - {:?}", "WRITTEN", text_path);
        }

        if format == "both" || format == "json" {
            let json_path = output_dir.join(&filename).with_extension("json");
            export_to_json(&result, &json_path)?;
            info!("{:12} - {:?}", "WRITTEN", json_path);
        }
    }

    Ok(())
}

/// An explicit path must exist. The default one is created as a template on first use.
fn load_provider_config(path: Option<&PathBuf>) -> Result<ProviderConfig> {
    if let Some(path) = path {
        return ProviderConfig::load(path);
    }

    let path = match default_config_path() {
        Ok(path) => path,
        Err(err) => {
            warn!("No provider config: {}", err);
            return Ok(ProviderConfig::default());
        }
    };
    if !path.exists() {
        ProviderConfig::write_template(&path, Registry::global())?;
        warn!("Add your API keys to {:?} to enable more sources", path);
        return Ok(ProviderConfig::default());
    }

    ProviderConfig::load(&path)
}

fn select_sources(args: &ArgMatches) -> Result<Vec<Arc<dyn Source>>> {
    let registry = Registry::global();

    if args.get_flag("all") {
        return Ok(registry.all_sources());
    }
    match args.get_many::<String>("sources") {
        Some(names) => {
            let names: Vec<&String> = names.collect();
            registry.by_names(&names)
        }
        None => Ok(registry.default_sources()),
    }
}

fn summarize(result: &Enumeration) {
    for name in &result.skipped {
        info!("{:12} - {} (no api key)", "SKIPPED", name);
    }
    for (name, elapsed) in &result.timings {
        debug!("{:12} - {} in {:?}", "TIMING", name, elapsed);
    }
    for entry in &result.errors {
        warn!("{:12} - {}: {}", "SOURCE ERROR", entry.source, entry.error);
    }
    info!(
        "{:12} - {} subdomains for {} in {:?}",
        "DONE",
        result.len(),
        result.domain,
        result.elapsed
    );
}
