//! Passive subdomain discovery: query many public sources concurrently and merge what they
//! know about a domain into one deduplicated list.

pub mod config;
mod error;
pub mod extractor;
pub mod model;
pub mod registry;
pub mod runner;
pub mod session;
pub mod sources;
pub mod utils;

pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use extractor::Extractor;
pub use model::{Discovery, Enumeration, SourceError};
pub use registry::Registry;
pub use runner::{Runner, RunnerOptions};
pub use session::{Session, SessionOptions};
pub use sources::{ResultKind, ScrapeResult, Source};
