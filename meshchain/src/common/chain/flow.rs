// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Elements which decide up front whether a call continues
//!
//! An [`Interceptor`] inspects and may adjust a call's payload, then answers
//! with a [`Flow`]: either continue down the chain with a (possibly derived)
//! context, or end the call here with the given result. [`Intercept`] adapts
//! an interceptor into a full chain element.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;

use super::{ArcServer, ChainError, NetworkServiceServer, Next};
use crate::common::{Connection, Context, NetworkServiceRequest};

#[derive(Debug)]
pub enum Flow<T> {
  /// Delegate to the rest of the chain with this context
  Continue(Context),
  /// End the call with this result without delegating
  Return(Result<T, ChainError>),
}

impl<T> Flow<T> {
  pub fn proceed(ctx: &Context) -> Self {
    Flow::Continue(ctx.clone())
  }

  pub fn reject(error: ChainError) -> Self {
    Flow::Return(Err(error))
  }
}

pub trait Interceptor {
  fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection>;

  fn on_close(&self, ctx: &Context, _connection: &mut Connection) -> Flow<()> {
    Flow::proceed(ctx)
  }
}

impl<T: Interceptor + ?Sized> Interceptor for Arc<T> {
  fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection> {
    T::on_request(self, ctx, request)
  }

  fn on_close(&self, ctx: &Context, connection: &mut Connection) -> Flow<()> {
    T::on_close(self, ctx, connection)
  }
}

pub struct Intercept<T> {
  interceptor: T,
}

impl<T> Intercept<T> {
  pub fn new(interceptor: T) -> Self {
    Self { interceptor }
  }

  pub fn inner(&self) -> &T {
    &self.interceptor
  }
}

pub fn intercept<T: Interceptor + Send + Sync + 'static>(interceptor: T) -> ArcServer {
  Arc::new(Intercept::new(interceptor))
}

impl<T: Interceptor + Send + Sync> NetworkServiceServer for Intercept<T> {
  fn request<'a>(
    &'a self,
    ctx: Context,
    mut request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    match self.interceptor.on_request(&ctx, &mut request) {
      Flow::Continue(ctx) => next.request(ctx, request),
      Flow::Return(result) => future::ready(result).boxed(),
    }
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    mut connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    match self.interceptor.on_close(&ctx, &mut connection) {
      Flow::Continue(ctx) => next.close(ctx, connection),
      Flow::Return(result) => future::ready(result).boxed(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{intercept, Flow, Interceptor};
  use crate::common::{
    chain::{testing::Recorder, ArcServer, Chain, ChainError},
    Connection, Context, NetworkServiceRequest,
  };

  /// Lets through only connections whose id starts with a prefix
  struct IdPrefixGate(&'static str);

  impl Interceptor for IdPrefixGate {
    fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection> {
      if request.connection.id.starts_with(self.0) {
        Flow::proceed(ctx)
      } else {
        Flow::reject(ChainError::PermissionDenied(request.connection.id.clone()))
      }
    }
  }

  #[tokio::test]
  async fn continue_and_return_outcomes() {
    let recorder = Recorder::accepting_all();
    let chain = Chain::new(vec![
      intercept(IdPrefixGate("allowed-")),
      recorder.clone() as ArcServer,
    ]);
    chain
      .handle_request(Context::new(), Connection::new("allowed-1", Default::default()).into())
      .await
      .expect("Matching connections must continue");
    let err = chain
      .handle_request(Context::new(), Connection::new("denied-1", Default::default()).into())
      .await
      .expect_err("Non-matching connections must be returned early");
    assert!(matches!(err, ChainError::PermissionDenied(id) if id == "denied-1"));
    assert_eq!(recorder.calls().len(), 1);
  }

  #[tokio::test]
  async fn close_defaults_to_continue() {
    let recorder = Recorder::accepting_all();
    let chain = Chain::new(vec![
      intercept(Arc::new(IdPrefixGate("allowed-"))),
      recorder.clone() as ArcServer,
    ]);
    chain
      .handle_close(Context::new(), Connection::new("denied-1", Default::default()))
      .await
      .unwrap();
    assert!(!recorder.calls()[0].is_request());
  }
}
