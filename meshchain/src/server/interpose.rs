// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Routes connections through a locally registered cross-connect endpoint
//!
//! The first request for a connection is offered to each known cross-connect
//! endpoint in turn, by name, until one accepts it; the accepting endpoint is
//! recorded as that connection's route. Later requests for the connection must
//! present the same upstream address, and are sent along the recorded route;
//! those arriving while the first is still trying candidates wait for it to settle.
//!
//! Closing happens in two phases. The first close for a connection is sent to
//! its cross-connect endpoint; the second, which arrives back through that
//! endpoint once it has torn down its own leg, is sent to the upstream address.
//! Once the second phase succeeds the route is forgotten.

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt};
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use tokio::sync::watch;
use url::Url;

use crate::{
  common::{
    ChainError, Connection, Context, MalformedInput, NetworkServiceRequest, NetworkServiceServer,
    Next,
  },
  registry::{CrossConnectStore, NetworkServiceEndpoint},
  util::ConcurrentMap,
};

pub type CrossConnectRegistry = ConcurrentMap<String, NetworkServiceEndpoint>;
pub type RouteTable = ConcurrentMap<String, Arc<ActiveRoute>>;

/// Whether the request which created a route has settled on a cross-connect endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
  /// Candidates are still being tried
  Pending,
  Resolved,
  /// Every candidate failed or the creating request was cancelled; the route is being removed
  Abandoned,
}

/// Routing state for one interposed connection
#[derive(Debug)]
pub struct ActiveRoute {
  upstream: Url,
  cross_connect: ArcSwap<Url>,
  closing: AtomicBool,
  resolution_tx: watch::Sender<Resolution>,
  // Held so that publishing a resolution never fails for lack of receivers
  resolution_rx: watch::Receiver<Resolution>,
}

impl ActiveRoute {
  fn new(upstream: Url, cross_connect: Url) -> Self {
    let (resolution_tx, resolution_rx) = watch::channel(Resolution::Pending);
    Self {
      upstream,
      cross_connect: ArcSwap::from_pointee(cross_connect),
      closing: AtomicBool::new(false),
      resolution_tx,
      resolution_rx,
    }
  }

  pub fn resolution(&self) -> Resolution {
    *self.resolution_rx.borrow()
  }

  fn settle(&self, resolution: Resolution) {
    let _ = self.resolution_tx.send(resolution);
  }

  /// Waits until the creating request has either chosen an endpoint or given up
  async fn resolved(&self) -> Resolution {
    let mut resolution = self.resolution_rx.clone();
    loop {
      let current = *resolution.borrow();
      if current != Resolution::Pending {
        return current;
      }
      if resolution.changed().await.is_err() {
        return *resolution.borrow();
      }
    }
  }

  /// The client-facing address recorded when the route was created
  pub fn upstream(&self) -> &Url {
    &self.upstream
  }

  /// The cross-connect endpoint this connection is routed through
  pub fn cross_connect(&self) -> Url {
    Url::clone(&self.cross_connect.load())
  }

  pub fn is_closing(&self) -> bool {
    self.closing.load(Ordering::Acquire)
  }

  fn retarget(&self, cross_connect: Url) {
    self.cross_connect.store(Arc::new(cross_connect));
  }

  /// Marks the route as closing, returning whether it already was
  fn begin_closing(&self) -> bool {
    self.closing.swap(true, Ordering::AcqRel)
  }
}

/// A route inserted by the establish that is still trying candidates for it
///
/// Unless resolved, dropping the reservation removes the route and wakes any
/// concurrent requests waiting on it, including when the establish itself is dropped.
struct Reservation<'a> {
  routes: &'a RouteTable,
  connection_id: &'a str,
  route: Arc<ActiveRoute>,
  resolved: bool,
}

impl<'a> Reservation<'a> {
  fn resolve(mut self) {
    self.resolved = true;
    self.route.settle(Resolution::Resolved);
  }
}

impl<'a> Drop for Reservation<'a> {
  fn drop(&mut self) {
    if self.resolved {
      return;
    }
    let route = &self.route;
    self
      .routes
      .delete_if(&self.connection_id.to_string(), |current| Arc::ptr_eq(current, route));
    route.settle(Resolution::Abandoned);
  }
}

pub struct InterposeServer {
  name: String,
  cross_connects: Arc<CrossConnectRegistry>,
  routes: Arc<RouteTable>,
}

impl InterposeServer {
  pub fn new<TName: Into<String>>(name: TName) -> Self {
    Self::with_tables(name, Default::default(), Default::default())
  }

  /// Builds the element over externally owned tables, which may be shared or inspected
  pub fn with_tables<TName: Into<String>>(
    name: TName,
    cross_connects: Arc<CrossConnectRegistry>,
    routes: Arc<RouteTable>,
  ) -> Self {
    Self {
      name: name.into(),
      cross_connects,
      routes,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn cross_connects(&self) -> &Arc<CrossConnectRegistry> {
    &self.cross_connects
  }

  pub fn routes(&self) -> &Arc<RouteTable> {
    &self.routes
  }

  /// Recovers the id this component gave the connection when it first saw it
  ///
  /// A path may pass through this component more than once, as it does after
  /// returning from a cross-connect endpoint; the segment nearest the origin
  /// of the path is authoritative.
  pub fn connection_id<'c>(&self, connection: &'c Connection) -> Option<&'c str> {
    let segments = &connection.path.path_segments;
    let last = connection.path.index.min(segments.len().saturating_sub(1));
    (1..=last)
      .map(|i| &segments[i])
      .find(|segment| segment.name == self.name)
      .map(|segment| segment.id.as_str())
  }

  fn validate_path(connection: &Connection) -> Result<(), MalformedInput> {
    let path = &connection.path;
    if path.is_empty() {
      return Err(MalformedInput::EmptyPath);
    }
    if path.index == 0 {
      return Err(MalformedInput::NoPriorSegment(path.index));
    }
    if path.index >= path.len() {
      return Err(MalformedInput::IndexOutOfRange {
        index: path.index,
        len: path.len(),
      });
    }
    Ok(())
  }

  async fn establish(
    &self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
    connection_id: String,
    upstream: Url,
  ) -> Result<Connection, ChainError> {
    if request.connection.id != connection_id {
      return Err(
        MalformedInput::IdMismatch {
          connection_id: request.connection.id.clone(),
          segment_id: connection_id,
        }
        .into(),
      );
    }

    let mut reserved: Option<Reservation> = None;
    let mut attempts = 0usize;
    let mut last_error = None;
    for (name, candidate) in self.cross_connects.snapshot() {
      attempts += 1;
      let target = candidate.url;
      match &reserved {
        Some(reservation) => reservation.route.retarget(target.clone()),
        None => {
          let (route, existed) = self.routes.load_or_store(
            connection_id.clone(),
            Arc::new(ActiveRoute::new(upstream.clone(), target.clone())),
          );
          if existed {
            // A concurrent first request created the route; follow it instead
            tracing::debug!(connection_id = %connection_id, "Route created concurrently");
            return Self::follow(ctx, request, next, &connection_id, &route, &upstream).await;
          }
          reserved = Some(Reservation {
            routes: &self.routes,
            connection_id: &connection_id,
            route,
            resolved: false,
          });
        }
      }

      tracing::debug!(connection_id = %connection_id, cross_connect = %name, url = %target, "Offering connection to cross-connect endpoint");
      match next.request(ctx.with_client_url(target.clone()), request.clone()).await {
        Ok(connection) => {
          tracing::info!(connection_id = %connection_id, cross_connect = %name, url = %target, "Connection interposed");
          if let Some(reservation) = reserved.take() {
            reservation.resolve();
          }
          return Ok(connection);
        }
        Err(ChainError::Cancelled) => {
          last_error = Some(ChainError::Cancelled.to_string());
          break;
        }
        Err(e) => {
          tracing::warn!(connection_id = %connection_id, cross_connect = %name, url = %target, error = %e, "Cross-connect endpoint failed to accept connection");
          last_error = Some(e.to_string());
        }
      }
    }

    drop(reserved);
    if ctx.is_cancelled() {
      return Err(ChainError::Cancelled);
    }
    Err(ChainError::NoRouteAvailable {
      connection_id,
      upstream,
      attempts,
      last_error,
    })
  }

  async fn follow(
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
    connection_id: &str,
    route: &ActiveRoute,
    upstream: &Url,
  ) -> Result<Connection, ChainError> {
    if route.upstream() != upstream {
      return Err(ChainError::AddressMismatch {
        connection_id: connection_id.to_string(),
        recorded: route.upstream().clone(),
        actual: upstream.clone(),
      });
    }
    if route.resolution() == Resolution::Pending {
      tracing::debug!(connection_id, "Waiting for concurrent establish to choose a route");
    }
    let resolution = tokio::select! {
      _ = ctx.cancellation().cancelled() => return Err(ChainError::Cancelled),
      resolution = route.resolved() => resolution,
    };
    if resolution == Resolution::Abandoned {
      return Err(ChainError::NoRouteAvailable {
        connection_id: connection_id.to_string(),
        upstream: upstream.clone(),
        attempts: 0,
        last_error: Some("concurrent establish found no cross-connect endpoint".into()),
      });
    }
    next
      .request(ctx.with_client_url(route.cross_connect()), request)
      .await
  }
}

impl CrossConnectStore for InterposeServer {
  fn register_or_get(
    &self,
    name: &str,
    endpoint: NetworkServiceEndpoint,
  ) -> (Option<NetworkServiceEndpoint>, bool) {
    match self.cross_connects.load_or_store(name.to_string(), endpoint) {
      (existing, true) => (Some(existing), true),
      (_, false) => (None, false),
    }
  }

  fn remove(&self, name: &str) {
    self.cross_connects.delete(&name.to_string());
  }
}

impl NetworkServiceServer for InterposeServer {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    async move {
      Self::validate_path(&request.connection)?;
      let connection_id = self
        .connection_id(&request.connection)
        .ok_or_else(|| MalformedInput::NoOwnedSegment(self.name.clone()))?
        .to_string();
      let upstream = ctx
        .client_url()
        .cloned()
        .ok_or(MalformedInput::MissingClientUrl)?;

      match self.routes.load(&connection_id) {
        None => {
          self
            .establish(ctx, request, next, connection_id, upstream)
            .await
        }
        Some(route) => Self::follow(ctx, request, next, &connection_id, &route, &upstream).await,
      }
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    async move {
      let connection_id = self
        .connection_id(&connection)
        .unwrap_or(connection.id.as_str())
        .to_string();
      let route = self
        .routes
        .load(&connection_id)
        .ok_or_else(|| ChainError::MissingState(connection_id.clone()))?;

      if !route.begin_closing() {
        let target = route.cross_connect();
        tracing::debug!(connection_id = %connection_id, url = %target, "Closing cross-connect leg");
        return next.close(ctx.with_client_url(target), connection).await;
      }

      let target = route.upstream().clone();
      tracing::debug!(connection_id = %connection_id, url = %target, "Closing upstream leg");
      next.close(ctx.with_client_url(target), connection).await?;
      self
        .routes
        .delete_if(&connection_id, |current| Arc::ptr_eq(current, &route));
      Ok(())
    }
    .boxed()
  }
}
