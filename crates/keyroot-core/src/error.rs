use thiserror::Error;

/// Result alias for core operations.
pub type KeyrootResult<T> = Result<T, KeyrootError>;

/// Coarse classification every error collapses to.
///
/// Callers branch on this rather than on individual variants; only
/// `AccessDenied` coming from an interactive key attempt is ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyInState,
    Busy,
    AccessDenied,
    IoFailure,
    PartialFailure,
}

#[derive(Error, Debug)]
pub enum KeyrootError {
    #[error("[KR1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[KR1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[KR1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[KR1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[KR1200] {0}")]
    InvalidArgument(String),

    #[error("[KR1201] {0}")]
    NotFound(String),

    #[error("[KR1300] {0}")]
    AlreadyInState(String),

    #[error("[KR1301] {0}")]
    Busy(String),

    #[error("[KR1400] {0}")]
    AccessDenied(String),

    #[error("[KR2000] provider error: {0}")]
    Provider(String),

    #[error("[KR3000] {} / {attempted} keys successfully loaded", .attempted - .failed)]
    PartialLoad { attempted: u64, failed: u64 },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<KeyrootError>,
    },
}

impl KeyrootError {
    pub fn code(&self) -> &'static str {
        match self {
            KeyrootError::Io(_) => "KR1000",
            KeyrootError::Toml(_) => "KR1001",
            KeyrootError::Yaml(_) => "KR1002",
            KeyrootError::InvalidConfig(_) => "KR1100",
            KeyrootError::InvalidArgument(_) => "KR1200",
            KeyrootError::NotFound(_) => "KR1201",
            KeyrootError::AlreadyInState(_) => "KR1300",
            KeyrootError::Busy(_) => "KR1301",
            KeyrootError::AccessDenied(_) => "KR1400",
            KeyrootError::Provider(_) => "KR2000",
            KeyrootError::PartialLoad { .. } => "KR3000",
            KeyrootError::Context { source, .. } => source.code(),
        }
    }

    /// Classify the error, looking through any `Context` wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyrootError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            KeyrootError::Io(_) | KeyrootError::Provider(_) => ErrorKind::IoFailure,
            KeyrootError::Toml(_)
            | KeyrootError::Yaml(_)
            | KeyrootError::InvalidConfig(_)
            | KeyrootError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KeyrootError::NotFound(_) => ErrorKind::NotFound,
            KeyrootError::AlreadyInState(_) => ErrorKind::AlreadyInState,
            KeyrootError::Busy(_) => ErrorKind::Busy,
            KeyrootError::AccessDenied(_) => ErrorKind::AccessDenied,
            KeyrootError::PartialLoad { .. } => ErrorKind::PartialFailure,
            KeyrootError::Context { source, .. } => source.kind(),
        }
    }

    /// Wrap the error with operation-level text.
    pub fn context(self, context: impl Into<String>) -> Self {
        KeyrootError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        KeyrootError::InvalidArgument(message.into())
    }
}

/// Attach operation-level context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> KeyrootResult<T>;
}

impl<T> ResultExt<T> for KeyrootResult<T> {
    fn context(self, context: &str) -> KeyrootResult<T> {
        self.map_err(|err| err.context(context))
    }
}
