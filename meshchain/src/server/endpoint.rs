// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A complete endpoint: the standard elements followed by caller-provided ones

use futures::{future::BoxFuture, stream::BoxStream};
use std::{
  sync::{Arc, Weak},
  time::Duration,
};

use super::{
  authorize::{ArcPolicy, AuthorizeServer},
  monitor::{ConnectionEvent, MonitorServer},
  setid::SetIdServer,
  timeout::{TimeoutServer, DEFAULT_TIMEOUT},
  updatepath::UpdatePathServer,
};
use crate::common::{
  chain::{intercept, traced},
  ArcServer, Chain, ChainError, Connection, Context, NetworkServiceRequest, NetworkServiceServer,
  Next,
};

#[derive(Clone, Debug)]
pub struct EndpointOptions {
  /// How long a connection may go unrefreshed when its path carries no expiry
  pub default_timeout: Duration,
}

impl Default for EndpointOptions {
  fn default() -> Self {
    Self {
      default_timeout: DEFAULT_TIMEOUT,
    }
  }
}

pub struct Endpoint {
  name: String,
  chain: Chain,
  monitor: Arc<MonitorServer>,
}

impl Endpoint {
  pub fn new<TName: Into<String>, TElements: IntoIterator<Item = ArcServer>>(
    name: TName,
    request_policy: ArcPolicy<NetworkServiceRequest>,
    close_policy: ArcPolicy<Connection>,
    additional: TElements,
  ) -> Arc<Self> {
    Self::with_options(
      name,
      request_policy,
      close_policy,
      additional,
      EndpointOptions::default(),
    )
  }

  pub fn with_options<TName: Into<String>, TElements: IntoIterator<Item = ArcServer>>(
    name: TName,
    request_policy: ArcPolicy<NetworkServiceRequest>,
    close_policy: ArcPolicy<Connection>,
    additional: TElements,
    options: EndpointOptions,
  ) -> Arc<Self> {
    let name = name.into();
    let monitor = Arc::new(MonitorServer::new());
    Arc::new_cyclic(|this: &Weak<Endpoint>| {
      let this = this.clone() as Weak<dyn NetworkServiceServer + Send + Sync>;
      let standard: Vec<ArcServer> = vec![
        traced(
          "authorize",
          intercept(AuthorizeServer::new(request_policy, close_policy)),
        ),
        traced("setid", intercept(SetIdServer::new(name.as_str()))),
        traced("monitor", Arc::clone(&monitor) as ArcServer),
        traced(
          "timeout",
          Arc::new(TimeoutServer::new(this, options.default_timeout)),
        ),
        traced("updatepath", Arc::new(UpdatePathServer::new(name.as_str()))),
      ];
      Self {
        chain: Chain::new(standard).extend(additional),
        name,
        monitor,
      }
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn handle_request(
    &self,
    ctx: Context,
    request: NetworkServiceRequest,
  ) -> BoxFuture<'static, Result<Connection, ChainError>> {
    self.chain.handle_request(ctx, request)
  }

  pub fn handle_close(
    &self,
    ctx: Context,
    connection: Connection,
  ) -> BoxFuture<'static, Result<(), ChainError>> {
    self.chain.handle_close(ctx, connection)
  }

  /// Subscribes to the connections this endpoint currently holds and to their changes
  pub fn monitor_connections(&self) -> BoxStream<'static, ConnectionEvent> {
    self.monitor.monitor_connections()
  }
}

impl NetworkServiceServer for Endpoint {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    self.chain.request(ctx, request, next)
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    self.chain.close(ctx, connection, next)
  }
}
