use derive_more::From;
use std::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    // -- Run setup (fatal before dispatch)
    Configuration(String),
    UnknownSource(String),
    CliUsage(String),

    // -- Per source (recorded, never fatal)
    Source(String),
    InvalidHttpResponse { url: String, status: u16 },
    Timeout { source: &'static str, after: Duration },
    Cancelled,

    #[from]
    SystemTime(std::time::SystemTimeError),

    #[from]
    Fmt(std::fmt::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Reqwest(reqwest::Error),

    #[from]
    Postgres(tokio_postgres::Error),

    #[from]
    Json(serde_json::Error),

    #[from]
    Yaml(serde_yaml::Error),

    #[from]
    TimeFormat(time::error::Format),

    #[from]
    Subscriber(tracing::subscriber::SetGlobalDefaultError),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Errors raised while resolving a run, before any source is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::UnknownSource(_))
    }
}

// region:    --- Error Boilerplate

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate
