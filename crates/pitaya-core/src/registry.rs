//! Handler registry.
//!
//! Handlers are registered once at startup through [`HandlerRegistryBuilder`]
//! and frozen into a [`HandlerRegistry`]. After that the registry is never
//! mutated, so dispatches read it through an `Arc` without locking.
//!
//! Two namespaces exist side by side:
//!
//! - **handlers** — session-bound, reached by `sys` requests from a frontend
//! - **remotes** — peer calls, reached by `user` requests from other servers
//!
//! The same `service.method` may appear in both.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = HandlerRegistryBuilder::<JsonCodec>::new();
//! builder
//!     .remote_with_arg("room.join", |name: String| async move {
//!         Ok(format!("joined:{}", name))
//!     })?
//!     .handler("room.join", |session: Session| async move {
//!         tracing::info!("session {} joined", session.id());
//!         Ok(())
//!     })?;
//! let registry = builder.build();
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, CodecError};
use crate::error::{DispatchError, HandlerError, RegistryError};
use crate::protos::RpcType;
use crate::route::Route;
use crate::session::{BoxFuture, Session};

/// Deferred encoding of a handler's return value.
pub type Encoder<C> = Box<dyn FnOnce(&C) -> Result<Vec<u8>, CodecError> + Send>;

/// What an invoked handler eventually yields.
pub type HandlerFuture<C> = BoxFuture<'static, Result<Encoder<C>, HandlerError>>;

type DecodeWithSession<C> =
    Box<dyn Fn(&C, Session, &[u8]) -> Result<HandlerFuture<C>, CodecError> + Send + Sync>;
type Decode<C> = Box<dyn Fn(&C, &[u8]) -> Result<HandlerFuture<C>, CodecError> + Send + Sync>;

/// A registered handler, tagged by calling convention.
///
/// Variants taking an argument decode it before the handler is called, so a
/// payload that does not decode never reaches handler code.
pub enum Invoker<C> {
    /// `handler(session, arg)`
    SessionWithArg(DecodeWithSession<C>),
    /// `handler(session)`
    Session(Box<dyn Fn(Session) -> HandlerFuture<C> + Send + Sync>),
    /// `remote(arg)`
    Arg(Decode<C>),
    /// `remote()`
    NoArg(Box<dyn Fn() -> HandlerFuture<C> + Send + Sync>),
}

impl<C> Invoker<C> {
    /// The namespace this calling convention belongs to.
    pub fn kind(&self) -> RpcType {
        match self {
            Invoker::SessionWithArg(_) | Invoker::Session(_) => RpcType::Sys,
            Invoker::Arg(_) | Invoker::NoArg(_) => RpcType::User,
        }
    }

    fn convention(&self) -> &'static str {
        match self {
            Invoker::SessionWithArg(_) => "(session, arg)",
            Invoker::Session(_) => "(session)",
            Invoker::Arg(_) => "(arg)",
            Invoker::NoArg(_) => "()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Value(&'static str),
}

impl ReturnType {
    fn of<R: 'static>() -> Self {
        if TypeId::of::<R>() == TypeId::of::<()>() {
            ReturnType::Void
        } else {
            ReturnType::Value(std::any::type_name::<R>())
        }
    }
}

/// Metadata and entry point of one registered method.
pub struct HandlerDescriptor<C> {
    qualified_name: String,
    argument_type: Option<&'static str>,
    return_type: ReturnType,
    invoker: Invoker<C>,
}

impl<C> std::fmt::Debug for HandlerDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("qualified_name", &self.qualified_name)
            .field("convention", &self.invoker.convention())
            .field("argument_type", &self.argument_type)
            .field("return_type", &self.return_type)
            .finish()
    }
}

fn erase<C, Fut, R>(fut: Fut) -> HandlerFuture<C>
where
    C: Codec,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    Box::pin(async move {
        let value = fut.await?;
        let encoder: Encoder<C> = Box::new(move |codec: &C| codec.encode(&value));
        Ok(encoder)
    })
}

impl<C: Codec> HandlerDescriptor<C> {
    fn new(invoker: Invoker<C>, argument_type: Option<&'static str>, return_type: ReturnType) -> Self {
        Self {
            qualified_name: String::new(),
            argument_type,
            return_type,
            invoker,
        }
    }

    /// Session-bound handler taking a decoded argument.
    pub fn session_with_arg<F, A, Fut, R>(f: F) -> Self
    where
        F: Fn(Session, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let invoker = Invoker::SessionWithArg(Box::new(
            move |codec: &C, session: Session, data: &[u8]| -> Result<HandlerFuture<C>, CodecError> {
                let arg: A = codec.decode(data)?;
                Ok(erase(f(session, arg)))
            },
        ));
        Self::new(invoker, Some(std::any::type_name::<A>()), ReturnType::of::<R>())
    }

    /// Session-bound handler without an argument.
    pub fn session<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let invoker = Invoker::Session(Box::new(move |session: Session| erase(f(session))));
        Self::new(invoker, None, ReturnType::of::<R>())
    }

    /// Remote taking a decoded argument.
    pub fn arg<F, A, Fut, R>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let invoker = Invoker::Arg(Box::new(
            move |codec: &C, data: &[u8]| -> Result<HandlerFuture<C>, CodecError> {
                let arg: A = codec.decode(data)?;
                Ok(erase(f(arg)))
            },
        ));
        Self::new(invoker, Some(std::any::type_name::<A>()), ReturnType::of::<R>())
    }

    /// Remote without an argument.
    pub fn no_arg<F, Fut, R>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let invoker = Invoker::NoArg(Box::new(move || erase(f())));
        Self::new(invoker, None, ReturnType::of::<R>())
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn kind(&self) -> RpcType {
        self.invoker.kind()
    }

    pub fn argument_type(&self) -> Option<&'static str> {
        self.argument_type
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    /// Decode the argument (if any) and call the handler.
    ///
    /// `session` must be `Some` for session-bound conventions and is ignored
    /// by remotes. The returned future has not been polled yet.
    pub fn invoke(
        &self,
        codec: &C,
        session: Option<Session>,
        data: &[u8],
    ) -> Result<HandlerFuture<C>, DispatchError> {
        let decode_failed = |source: CodecError| DispatchError::Decode {
            handler: self.qualified_name.clone(),
            source,
        };
        match (&self.invoker, session) {
            (Invoker::SessionWithArg(call), Some(session)) => {
                call(codec, session, data).map_err(decode_failed)
            }
            (Invoker::Session(call), Some(session)) => Ok(call(session)),
            (Invoker::Arg(call), _) => call(codec, data).map_err(decode_failed),
            (Invoker::NoArg(call), _) => Ok(call()),
            (_, None) => Err(DispatchError::Invocation {
                handler: self.qualified_name.clone(),
                source: HandlerError::new("session-bound handler invoked without a session"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Mutable registry used during startup.
pub struct HandlerRegistryBuilder<C> {
    handlers: HashMap<String, HandlerDescriptor<C>>,
    remotes: HashMap<String, HandlerDescriptor<C>>,
}

impl<C> std::fmt::Debug for HandlerRegistryBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistryBuilder")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: Codec> Default for HandlerRegistryBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> HandlerRegistryBuilder<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            remotes: HashMap::new(),
        }
    }

    /// Register `descriptor` as `qualified_name` in the `kind` namespace.
    pub fn register(
        &mut self,
        kind: RpcType,
        qualified_name: &str,
        mut descriptor: HandlerDescriptor<C>,
    ) -> Result<&mut Self, RegistryError> {
        let route = Route::parse(qualified_name)
            .map_err(|_| RegistryError::InvalidName(qualified_name.to_string()))?;
        if !route.server_type().is_empty() || route.service().is_empty() || route.method().is_empty()
        {
            return Err(RegistryError::InvalidName(qualified_name.to_string()));
        }
        if descriptor.kind() != kind {
            return Err(RegistryError::ConventionMismatch {
                kind,
                name: qualified_name.to_string(),
            });
        }

        let namespace = match kind {
            RpcType::Sys => &mut self.handlers,
            RpcType::User => &mut self.remotes,
        };
        if namespace.contains_key(qualified_name) {
            return Err(RegistryError::DuplicateHandler {
                kind,
                name: qualified_name.to_string(),
            });
        }

        descriptor.qualified_name = qualified_name.to_string();
        tracing::debug!(
            "[Registry] Registered {} {} {:?} -> {:?}",
            kind,
            qualified_name,
            descriptor.argument_type,
            descriptor.return_type
        );
        namespace.insert(qualified_name.to_string(), descriptor);
        Ok(self)
    }

    /// Register a session-bound handler: `f(session) -> R`.
    pub fn handler<F, Fut, R>(&mut self, name: &str, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(RpcType::Sys, name, HandlerDescriptor::session(f))
    }

    /// Register a session-bound handler: `f(session, arg) -> R`.
    pub fn handler_with_arg<F, A, Fut, R>(
        &mut self,
        name: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Session, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(RpcType::Sys, name, HandlerDescriptor::session_with_arg(f))
    }

    /// Register a remote: `f() -> R`.
    pub fn remote<F, Fut, R>(&mut self, name: &str, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(RpcType::User, name, HandlerDescriptor::no_arg(f))
    }

    /// Register a remote: `f(arg) -> R`.
    pub fn remote_with_arg<F, A, Fut, R>(
        &mut self,
        name: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(RpcType::User, name, HandlerDescriptor::arg(f))
    }

    /// Freeze the registry.
    pub fn build(self) -> HandlerRegistry<C> {
        tracing::info!(
            "[Registry] {} handlers and {} remotes registered",
            self.handlers.len(),
            self.remotes.len()
        );
        HandlerRegistry {
            handlers: self.handlers,
            remotes: self.remotes,
        }
    }
}

// ---------------------------------------------------------------------------
// Frozen registry
// ---------------------------------------------------------------------------

/// Immutable snapshot of every registered handler and remote.
pub struct HandlerRegistry<C> {
    handlers: HashMap<String, HandlerDescriptor<C>>,
    remotes: HashMap<String, HandlerDescriptor<C>>,
}

impl<C: Codec> HandlerRegistry<C> {
    pub fn lookup(
        &self,
        kind: RpcType,
        qualified_name: &str,
    ) -> Result<&HandlerDescriptor<C>, DispatchError> {
        let namespace = match kind {
            RpcType::Sys => &self.handlers,
            RpcType::User => &self.remotes,
        };
        namespace
            .get(qualified_name)
            .ok_or_else(|| DispatchError::HandlerNotFound {
                kind,
                name: qualified_name.to_string(),
            })
    }

    /// Sorted names registered in one namespace.
    pub fn names(&self, kind: RpcType) -> Vec<&str> {
        let namespace = match kind {
            RpcType::Sys => &self.handlers,
            RpcType::User => &self.remotes,
        };
        let mut names: Vec<&str> = namespace.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
