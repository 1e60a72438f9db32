// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Registry element capturing cross-connect endpoint registrations
//!
//! Cross-connect endpoints announce themselves under a reserved name prefix.
//! Such registrations are diverted into a [`CrossConnectStore`], normally the
//! local interposition element, and never reach the downstream registry.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;

use super::{CrossConnectStore, EndpointRegistry, NetworkServiceEndpoint, RegistryError};

pub const INTERPOSE_NAME_PREFIX: &str = "interpose-nse#";

/// The registration name a cross-connect endpoint called `name` announces itself with
pub fn interpose_name(name: &str) -> String {
  format!("{}{}", INTERPOSE_NAME_PREFIX, name)
}

pub fn is_interpose_name(name: &str) -> bool {
  name.starts_with(INTERPOSE_NAME_PREFIX)
}

pub struct InterposeRegistryServer {
  store: Arc<dyn CrossConnectStore + Send + Sync + 'static>,
  next: Arc<dyn EndpointRegistry + Send + Sync + 'static>,
}

impl InterposeRegistryServer {
  pub fn new(
    store: Arc<dyn CrossConnectStore + Send + Sync + 'static>,
    next: Arc<dyn EndpointRegistry + Send + Sync + 'static>,
  ) -> Self {
    Self { store, next }
  }
}

impl EndpointRegistry for InterposeRegistryServer {
  fn register<'a>(
    &'a self,
    endpoint: NetworkServiceEndpoint,
  ) -> BoxFuture<'a, Result<NetworkServiceEndpoint, RegistryError>> {
    if !is_interpose_name(&endpoint.name) {
      return self.next.register(endpoint);
    }
    let name = endpoint.name.clone();
    let registered = match self.store.register_or_get(&name, endpoint.clone()) {
      (Some(existing), true) => {
        tracing::debug!(name = %name, url = %existing.url, "Cross-connect endpoint already registered");
        existing
      }
      _ => {
        tracing::info!(name = %name, url = %endpoint.url, "Cross-connect endpoint registered");
        endpoint
      }
    };
    future::ready(Ok(registered)).boxed()
  }

  fn unregister<'a>(
    &'a self,
    name: &'a str,
  ) -> BoxFuture<'a, Result<Option<NetworkServiceEndpoint>, RegistryError>> {
    if !is_interpose_name(name) {
      return self.next.unregister(name);
    }
    self.store.remove(name);
    tracing::info!(name, "Cross-connect endpoint removed");
    future::ready(Ok(None)).boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use url::Url;

  use super::{interpose_name, is_interpose_name, InterposeRegistryServer};
  use crate::{
    registry::{EndpointRegistry, InMemoryEndpointRegistry, NetworkServiceEndpoint},
    server::InterposeServer,
  };

  fn endpoint(name: &str, url: &str) -> NetworkServiceEndpoint {
    NetworkServiceEndpoint::new(name, Url::parse(url).unwrap())
  }

  #[test]
  fn interpose_names_are_prefixed() {
    let name = interpose_name("vpp-cross-connect");
    assert!(is_interpose_name(&name));
    assert!(!is_interpose_name("vpp-cross-connect"));
  }

  #[tokio::test]
  async fn cross_connect_registrations_are_diverted() {
    let interpose = Arc::new(InterposeServer::new("nsc-endpoint"));
    let downstream = InMemoryEndpointRegistry::new();
    let registry = InterposeRegistryServer::new(interpose.clone(), Arc::new(downstream.clone()));

    let cross_name = interpose_name("cross-a");
    registry
      .register(endpoint(&cross_name, "unix:///run/cross-a.sock"))
      .await
      .unwrap();
    registry
      .register(endpoint("icmp-responder", "tcp://10.0.0.2:5001"))
      .await
      .unwrap();

    assert_eq!(interpose.cross_connects().len(), 1);
    assert_eq!(downstream.len(), 1);
    assert!(downstream.lookup("icmp-responder").is_some());
    assert!(downstream.lookup(&cross_name).is_none());
  }

  #[tokio::test]
  async fn repeat_registration_returns_existing_entry() {
    let interpose = Arc::new(InterposeServer::new("nsc-endpoint"));
    let registry =
      InterposeRegistryServer::new(interpose.clone(), Arc::new(InMemoryEndpointRegistry::new()));
    let cross_name = interpose_name("cross-a");
    registry
      .register(endpoint(&cross_name, "unix:///run/cross-a.sock"))
      .await
      .unwrap();
    let second = registry
      .register(endpoint(&cross_name, "unix:///run/other.sock"))
      .await
      .unwrap();
    assert_eq!(second.url.as_str(), "unix:///run/cross-a.sock");
  }

  #[tokio::test]
  async fn unregistration_removes_cross_connects() {
    let interpose = Arc::new(InterposeServer::new("nsc-endpoint"));
    let registry =
      InterposeRegistryServer::new(interpose.clone(), Arc::new(InMemoryEndpointRegistry::new()));
    let cross_name = interpose_name("cross-a");
    registry
      .register(endpoint(&cross_name, "unix:///run/cross-a.sock"))
      .await
      .unwrap();
    registry.unregister(&cross_name).await.unwrap();
    assert!(interpose.cross_connects().is_empty());
  }
}
