use thiserror::Error;

/// Errors surfaced by the reconciliation engine.
///
/// `NotFound` is kept distinct from every other failure: existence checks and
/// the prefix lookup treat it as "absent", everything else propagates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not supported")]
    NotSupported(String),
    #[error("{0} not valid")]
    NotValid(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Invariant(String),
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("watch: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),
    #[error("{context}: {source}")]
    Context { context: String, #[source] source: Box<Error> },
    #[error("{} of {} staged changes failed: {}", .failures.len(), .total, summarize(.failures))]
    Batch { total: usize, failures: Vec<(String, Error)> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn summarize(failures: &[(String, Error)]) -> String {
    failures.iter().map(|(what, e)| format!("{what}: {e}")).collect::<Vec<_>>().join("; ")
}

impl Error {
    pub fn not_supported(msg: impl Into<String>) -> Self { Self::NotSupported(msg.into()) }
    pub fn not_valid(msg: impl Into<String>) -> Self { Self::NotValid(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn invariant(msg: impl Into<String>) -> Self { Self::Invariant(msg.into()) }

    /// Wrap with the operation that was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context { context: context.into(), source: Box::new(self) }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_not_supported(&self) -> bool {
        match self {
            Self::NotSupported(_) => true,
            Self::Context { source, .. } => source.is_not_supported(),
            _ => false,
        }
    }

    pub fn is_not_valid(&self) -> bool {
        match self {
            Self::NotValid(_) => true,
            Self::Context { source, .. } => source.is_not_valid(),
            _ => false,
        }
    }
}

/// Annotate the error branch of a result, mirroring `Error::context`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> { self.map_err(|e| e.context(context)) }
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> { self.map_err(|e| e.context(f())) }
}
