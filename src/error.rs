use crate::{
    message::{codes, ProtocolError, RemoteError},
    types::TypeMismatch,
};
use std::{error::Error, io, time::Duration};
use thiserror::Error;

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A failure raised by a [`Method`](crate::method::Method).
///
/// May wrap the error that caused it. The server reports the innermost cause of the
/// chain (see [`root_cause`]), not the outermost message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MethodError {
    message: String,
    code: Option<String>,
    #[source]
    source: Option<BoxError>,
}

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Wraps `source` with a message of its own.
    pub fn wrap(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: Some(source.into()),
        }
    }

    /// Wraps `source`, reusing its text as the message.
    pub fn from_source(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self {
            message: source.to_string(),
            code: None,
            source: Some(source),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl From<io::Error> for MethodError {
    fn from(err: io::Error) -> Self {
        Self::from_source(err)
    }
}

/// A body that does not have the shape a method expects.
impl From<TypeMismatch> for MethodError {
    fn from(err: TypeMismatch) -> Self {
        Self::new(format!("invalid body: {err}")).with_code(codes::INVALID_BODY)
    }
}

/// Follows `source()` down to the innermost error.
pub fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut cause = err;
    while let Some(next) = cause.source() {
        cause = next;
    }
    cause
}

/// What an error turns into on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub message: String,
    pub code: Option<String>,
}

impl Translation {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<Translation> for RemoteError {
    fn from(t: Translation) -> Self {
        RemoteError {
            message: t.message,
            code: t.code,
        }
    }
}

type Matcher = Box<dyn Fn(&(dyn Error + 'static)) -> Option<Translation> + Send + Sync>;

/// Turns a method failure into the text the client sees.
///
/// Matchers run in registration order against the root cause; the first one that
/// returns `Some` wins. Without a match the root cause's own text is used.
#[derive(Default)]
pub struct ErrorTranslator {
    matchers: Vec<Matcher>,
}

impl ErrorTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles every root cause of concrete type `E`.
    pub fn register<E, F>(&mut self, extract: F) -> &mut Self
    where
        E: Error + 'static,
        F: Fn(&E) -> Translation + Send + Sync + 'static,
    {
        self.matchers
            .push(Box::new(move |err| err.downcast_ref::<E>().map(&extract)));
        self
    }

    /// Handles any root cause accepted by `predicate`.
    pub fn register_matcher<P, F>(&mut self, predicate: P, extract: F) -> &mut Self
    where
        P: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
        F: Fn(&(dyn Error + 'static)) -> Translation + Send + Sync + 'static,
    {
        self.matchers
            .push(Box::new(move |err| predicate(err).then(|| extract(err))));
        self
    }

    pub fn translate(&self, err: &(dyn Error + 'static)) -> RemoteError {
        let cause = root_cause(err);
        self.matchers
            .iter()
            .find_map(|matcher| matcher(cause))
            .unwrap_or_else(|| default_translation(cause))
            .into()
    }
}

fn default_translation(cause: &(dyn Error + 'static)) -> Translation {
    let code = cause
        .downcast_ref::<MethodError>()
        .and_then(|e| e.code.clone());
    Translation {
        message: cause.to_string(),
        code,
    }
}

/// Why a CALL could not produce a result, on the server side.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("method {0} does not exist")]
    MethodNotFound(String),

    #[error(transparent)]
    Invocation(RemoteError),
}

impl DispatchError {
    pub fn into_remote(self) -> RemoteError {
        match self {
            DispatchError::Protocol(e) => RemoteError::new(e.0).with_code(codes::PROTOCOL),
            DispatchError::MethodNotFound(name) => {
                RemoteError::new(format!("method {name} does not exist"))
                    .with_code(codes::METHOD_NOT_FOUND)
            }
            DispatchError::Invocation(e) => e,
        }
    }
}

/// Failures seen by a [`Client`](crate::net::client::Client) caller.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The server answered with an ERROR message.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("client is closed")]
    Closed,

    #[error("too many pending calls ({0})")]
    TooManyPending(usize),

    #[error("unexpected reply shape: {0}")]
    Decode(#[from] TypeMismatch),

    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RpcError::Connection(_) | RpcError::Closed | RpcError::Connect(_)
        )
    }

    /// The machine code of a server-side error, if any.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            RpcError::Remote(e) => e.code(),
            _ => None,
        }
    }
}
