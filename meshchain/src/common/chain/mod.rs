// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Composition of connection-handling elements into a single pipeline
//!
//! Each element receives the call's [`Context`], its payload, and a [`Next`]
//! continuation representing "the rest of the chain". An element may delegate
//! to the continuation (with the same or a derived context), delegate more than
//! once, or return without delegating at all, which ends the call at that element.
//!
//! The continuation past the final element is terminal: establish calls return
//! the request's connection unchanged, and close calls succeed.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing_futures::Instrument;

use super::{Connection, Context, NetworkServiceRequest};

mod error;
pub use error::{ChainError, MalformedInput};

mod flow;
pub use flow::{intercept, Flow, Intercept, Interceptor};

pub type ArcServer = Arc<dyn NetworkServiceServer + Send + Sync + 'static>;

/// A chain element handling connection establishment and teardown
pub trait NetworkServiceServer {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>>;

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>>;
}

/// The remainder of a chain, as seen from one of its elements
///
/// Cloning is cheap and the clone is `'static`, so elements may hold onto it
/// past the end of the call that provided it.
#[derive(Clone)]
pub struct Next {
  elements: Arc<[ArcServer]>,
  position: usize,
  // Continuation of an enclosing chain, when this chain is itself an element
  outer: Option<Arc<Next>>,
}

impl Next {
  pub fn terminal() -> Self {
    Self {
      elements: Arc::from(Vec::<ArcServer>::new()),
      position: 0,
      outer: None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.position >= self.elements.len() && self.outer.is_none()
  }

  fn advance(&self) -> Self {
    Self {
      elements: Arc::clone(&self.elements),
      position: self.position + 1,
      outer: self.outer.clone(),
    }
  }

  pub fn request(
    &self,
    ctx: Context,
    request: NetworkServiceRequest,
  ) -> BoxFuture<'static, Result<Connection, ChainError>> {
    let this = self.clone();
    async move {
      if ctx.is_cancelled() {
        return Err(ChainError::Cancelled);
      }
      match this.elements.get(this.position) {
        Some(element) => {
          let element = Arc::clone(element);
          let rest = this.advance();
          element.request(ctx, request, rest).await
        }
        None => match this.outer {
          Some(outer) => outer.request(ctx, request).await,
          None => Ok(request.connection),
        },
      }
    }
    .boxed()
  }

  pub fn close(
    &self,
    ctx: Context,
    connection: Connection,
  ) -> BoxFuture<'static, Result<(), ChainError>> {
    let this = self.clone();
    async move {
      if ctx.is_cancelled() {
        return Err(ChainError::Cancelled);
      }
      match this.elements.get(this.position) {
        Some(element) => {
          let element = Arc::clone(element);
          let rest = this.advance();
          element.close(ctx, connection, rest).await
        }
        None => match this.outer {
          Some(outer) => outer.close(ctx, connection).await,
          None => Ok(()),
        },
      }
    }
    .boxed()
  }
}

impl std::fmt::Debug for Next {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Next")
      .field("position", &self.position)
      .field("remaining", &self.elements.len().saturating_sub(self.position))
      .field("nested", &self.outer.is_some())
      .finish()
  }
}

/// An ordered, immutable sequence of elements, usable as one element
#[derive(Clone)]
pub struct Chain {
  elements: Arc<[ArcServer]>,
}

impl Chain {
  pub fn new<TElements: IntoIterator<Item = ArcServer>>(elements: TElements) -> Self {
    Self {
      elements: elements.into_iter().collect::<Vec<_>>().into(),
    }
  }

  /// Appends elements after those already present
  pub fn extend<TElements: IntoIterator<Item = ArcServer>>(self, additional: TElements) -> Self {
    Self::new(self.elements.iter().cloned().chain(additional))
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  fn continuation(&self, outer: Next) -> Next {
    Next {
      elements: Arc::clone(&self.elements),
      position: 0,
      outer: if outer.is_terminal() {
        None
      } else {
        Some(Arc::new(outer))
      },
    }
  }

  /// Runs an establish call through the chain as the outermost pipeline
  pub fn handle_request(
    &self,
    ctx: Context,
    request: NetworkServiceRequest,
  ) -> BoxFuture<'static, Result<Connection, ChainError>> {
    self.continuation(Next::terminal()).request(ctx, request)
  }

  /// Runs a close call through the chain as the outermost pipeline
  pub fn handle_close(
    &self,
    ctx: Context,
    connection: Connection,
  ) -> BoxFuture<'static, Result<(), ChainError>> {
    self.continuation(Next::terminal()).close(ctx, connection)
  }
}

impl NetworkServiceServer for Chain {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    self.continuation(next).request(ctx, request)
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    self.continuation(next).close(ctx, connection)
  }
}

/// Ends a call successfully without consulting the rest of the chain
#[derive(Clone, Copy, Debug, Default)]
pub struct Terminal;

impl NetworkServiceServer for Terminal {
  fn request<'a>(
    &'a self,
    _ctx: Context,
    request: NetworkServiceRequest,
    _next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    future::ready(Ok(request.connection)).boxed()
  }

  fn close<'a>(
    &'a self,
    _ctx: Context,
    _connection: Connection,
    _next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    future::ready(Ok(())).boxed()
  }
}

/// Delegates every call unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl NetworkServiceServer for PassThrough {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    next.request(ctx, request)
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    next.close(ctx, connection)
  }
}

/// Wraps an element so that its work, and everything it delegates to, runs in a named span
pub struct Traced {
  element: &'static str,
  inner: ArcServer,
}

impl Traced {
  pub fn new(element: &'static str, inner: ArcServer) -> Self {
    Self { element, inner }
  }
}

pub fn traced(element: &'static str, inner: ArcServer) -> ArcServer {
  Arc::new(Traced::new(element, inner))
}

impl NetworkServiceServer for Traced {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    let span = tracing::debug_span!(
      "request",
      element = self.element,
      connection_id = %request.connection.id,
    );
    let element = self.element;
    // Interceptors do their work while the inner future is built, so build it inside the span
    let handled = span.in_scope(|| self.inner.request(ctx, request, next));
    async move {
      let result = handled.await;
      if let Err(e) = &result {
        tracing::trace!(element, error = %e, "Element returned error");
      }
      result
    }
    .instrument(span)
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    let span = tracing::debug_span!(
      "close",
      element = self.element,
      connection_id = %connection.id,
    );
    let element = self.element;
    let handled = span.in_scope(|| self.inner.close(ctx, connection, next));
    async move {
      let result = handled.await;
      if let Err(e) = &result {
        tracing::trace!(element, error = %e, "Element returned error");
      }
      result
    }
    .instrument(span)
    .boxed()
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Elements used by tests across the crate to observe what reaches the end of a chain

  use futures::future::{self, BoxFuture, FutureExt};
  use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
  };
  use url::Url;

  use super::{ChainError, NetworkServiceServer, Next};
  use crate::common::{Connection, Context, NetworkServiceRequest};

  #[derive(Clone, Debug, PartialEq, Eq)]
  pub enum Call {
    Request { target: Option<Url>, connection: Connection },
    Close { target: Option<Url>, connection: Connection },
  }

  impl Call {
    pub fn target(&self) -> Option<&str> {
      match self {
        Call::Request { target, .. } | Call::Close { target, .. } => target.as_ref().map(Url::as_str),
      }
    }

    pub fn is_request(&self) -> bool {
      matches!(self, Call::Request { .. })
    }
  }

  /// Records every call and accepts only requests targeting an allowed address
  #[derive(Default)]
  pub struct Recorder {
    accepted: Option<BTreeSet<String>>,
    calls: Mutex<Vec<Call>>,
  }

  impl Recorder {
    pub fn accepting_all() -> Arc<Self> {
      Arc::new(Self::default())
    }

    pub fn accepting<'a, T: IntoIterator<Item = &'a str>>(targets: T) -> Arc<Self> {
      Arc::new(Self {
        accepted: Some(targets.into_iter().map(String::from).collect()),
        calls: Default::default(),
      })
    }

    pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().unwrap().clone()
    }

    pub fn targets(&self) -> Vec<String> {
      self
        .calls()
        .iter()
        .map(|c| c.target().unwrap_or_default().to_string())
        .collect()
    }

    fn accepts(&self, target: Option<&Url>) -> bool {
      match &self.accepted {
        None => true,
        Some(accepted) => target.map_or(false, |t| accepted.contains(t.as_str())),
      }
    }
  }

  impl NetworkServiceServer for Recorder {
    fn request<'a>(
      &'a self,
      ctx: Context,
      request: NetworkServiceRequest,
      next: Next,
    ) -> BoxFuture<'a, Result<Connection, ChainError>> {
      let target = ctx.client_url().cloned();
      self.calls.lock().unwrap().push(Call::Request {
        target: target.clone(),
        connection: request.connection.clone(),
      });
      if !self.accepts(target.as_ref()) {
        let target = target.map(String::from).unwrap_or_default();
        return future::ready(Err(ChainError::refused(target, "not accepting"))).boxed();
      }
      next.request(ctx, request)
    }

    fn close<'a>(
      &'a self,
      ctx: Context,
      connection: Connection,
      next: Next,
    ) -> BoxFuture<'a, Result<(), ChainError>> {
      self.calls.lock().unwrap().push(Call::Close {
        target: ctx.client_url().cloned(),
        connection: connection.clone(),
      });
      next.close(ctx, connection)
    }
  }
}
