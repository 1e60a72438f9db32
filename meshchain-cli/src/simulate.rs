// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Runs one interposed connection through an in-process endpoint
//!
//! Cross-connect endpoints are registered through the interposing registry
//! element exactly as a deployment would register them; the downstream side
//! of the chain is simulated, accepting only connections addressed to the
//! chosen cross-connect endpoint.

use anyhow::{Context as AnyhowContext, Result};
use futures::{
  future::{self, BoxFuture, FutureExt},
  StreamExt,
};
use meshchain::{
  common::{
    chain::intercept, ArcServer, ChainError, Connection, Context, NetworkServiceRequest,
    NetworkServiceServer, Next, Path, PathSegment,
  },
  registry::{
    interpose_name, EndpointRegistry, InMemoryEndpointRegistry, InterposeRegistryServer,
    NetworkServiceEndpoint,
  },
  server::{AllowAll, Endpoint, ExcludedPrefixesServer, InterposeServer},
};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use url::Url;

#[derive(Clone, Debug)]
pub struct SimulateArgs {
  pub name: String,
  pub upstream: Url,
  pub cross_connects: Vec<NetworkServiceEndpoint>,
  pub accept: Option<String>,
  pub prefixes: Option<PathBuf>,
}

/// Stands in for everything past the endpoint: accepts calls for one address only
struct SimulatedDownstream {
  accepted: Option<Url>,
}

impl SimulatedDownstream {
  fn accepts(&self, target: Option<&Url>) -> bool {
    match (&self.accepted, target) {
      (None, _) => true,
      (Some(accepted), Some(target)) => accepted == target,
      (Some(_), None) => false,
    }
  }
}

impl NetworkServiceServer for SimulatedDownstream {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    let target = ctx.client_url().cloned();
    if !self.accepts(target.as_ref()) {
      let target = target.map(String::from).unwrap_or_default();
      tracing::info!(target = %target, "Simulated endpoint refusing connection");
      return future::ready(Err(ChainError::refused(target, "simulated refusal"))).boxed();
    }
    tracing::info!(target = ?target.as_ref().map(Url::as_str), connection_id = %request.connection.id, "Simulated endpoint accepted connection");
    next.request(ctx, request)
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    tracing::info!(target = ?ctx.client_url().map(Url::as_str), connection_id = %connection.id, "Simulated endpoint closed connection");
    next.close(ctx, connection)
  }
}

pub async fn simulate_main(config: SimulateArgs) -> Result<()> {
  let cancellation = CancellationToken::new();
  {
    let cancellation = cancellation.clone();
    tokio::task::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        cancellation.cancel();
      }
    });
  }

  let interpose = Arc::new(InterposeServer::new(config.name.as_str()));
  let registry = InterposeRegistryServer::new(
    interpose.clone(),
    Arc::new(InMemoryEndpointRegistry::new()),
  );
  for cross_connect in config.cross_connects.iter() {
    let mut registration = cross_connect.clone();
    registration.name = interpose_name(&cross_connect.name);
    registry
      .register(registration)
      .await
      .with_context(|| format!("Registering cross-connect endpoint {}", cross_connect.name))?;
  }

  let accepted = match &config.accept {
    None => None,
    Some(name) => Some(
      config
        .cross_connects
        .iter()
        .find(|c| &c.name == name)
        .map(|c| c.url.clone())
        .with_context(|| format!("No cross-connect endpoint named {}", name))?,
    ),
  };

  let mut additional: Vec<ArcServer> = Vec::new();
  if let Some(path) = &config.prefixes {
    additional.push(intercept(ExcludedPrefixesServer::from_file(path).await));
  }
  additional.push(interpose.clone());
  additional.push(Arc::new(SimulatedDownstream { accepted }));

  let endpoint = Endpoint::new(
    config.name.as_str(),
    Arc::new(AllowAll),
    Arc::new(AllowAll),
    additional,
  );
  let mut events = endpoint.monitor_connections();

  let ctx = Context::with_cancellation(cancellation).with_client_url(config.upstream.clone());
  let request = NetworkServiceRequest::new(Connection::new(
    "client-id",
    Path::new(0, vec![PathSegment::new("nsc", "client-id")]),
  ));
  let run = async {
    let connection = endpoint
      .handle_request(ctx.clone(), request)
      .await
      .context("Establishing simulated connection")?;
    tracing::info!(connection_id = %connection.id, "Connection established");
    endpoint
      .handle_close(ctx.clone(), connection.clone())
      .await
      .context("Closing cross-connect leg")?;
    endpoint
      .handle_close(ctx.clone(), connection)
      .await
      .context("Closing upstream leg")?;
    Result::<()>::Ok(())
  }
  .instrument(tracing::info_span!("simulate", endpoint = %config.name));
  let outcome = run.await;

  while let Some(Some(event)) = events.next().now_or_never() {
    println!("{}", serde_json::to_string(&event)?);
  }
  tracing::info!(
    active_routes = interpose.routes().len(),
    "Simulation complete"
  );
  outcome
}
