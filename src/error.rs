use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Target resolution failures share the runtime's wording.
    #[error(transparent)]
    Target(#[from] tprof_runtime::Error),

    #[error("failed to parse {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: syn::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no Cargo.toml found in {}", .0.display())]
    NoPackage(PathBuf),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
