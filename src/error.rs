use derive_more::{Display, From};

/// Top-level error for library entry points.
#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    Config(crate::config::ConfigError),

    #[from]
    Store(crate::models::store::StoreError),

    #[from]
    Download(crate::models::downloader::DownloadError),

    #[from]
    Build(crate::process::build::BuildError),

    #[from]
    Server(crate::process::server::ServerError),

    #[from]
    Transition(crate::lifecycle::state_machine::TransitionRejection),
}

impl std::error::Error for Error {}
