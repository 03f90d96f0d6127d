use std::error::Error;
use std::fmt::{Display, Formatter};

/// Raised when a subscription future is consumed in both modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UsageError {
    /// `resolve` was called on an instance that has already been listened to.
    ResolveAfterListen,
    /// `listen` was called on an instance that has already been resolved.
    ListenAfterResolve,
}

impl UsageError {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageError::ResolveAfterListen => "subscription/resolve-after-listen",
            UsageError::ListenAfterResolve => "subscription/listen-after-resolve",
        }
    }
}

impl Display for UsageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageError::ResolveAfterListen => {
                write!(f, "Cannot resolve after listening ({})", self.as_str())
            }
            UsageError::ListenAfterResolve => {
                write!(f, "Cannot listen after resolving ({})", self.as_str())
            }
        }
    }
}

impl Error for UsageError {}
