// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;

use super::{EndpointRegistry, NetworkServiceEndpoint, RegistryError};
use crate::util::ConcurrentMap;

/// Endpoint registry held entirely in process memory; later registrations replace earlier ones
#[derive(Clone, Default)]
pub struct InMemoryEndpointRegistry {
  endpoints: Arc<ConcurrentMap<String, NetworkServiceEndpoint>>,
}

impl InMemoryEndpointRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lookup(&self, name: &str) -> Option<NetworkServiceEndpoint> {
    self.endpoints.load(&name.to_string())
  }

  pub fn len(&self) -> usize {
    self.endpoints.len()
  }

  pub fn is_empty(&self) -> bool {
    self.endpoints.is_empty()
  }
}

impl EndpointRegistry for InMemoryEndpointRegistry {
  fn register<'a>(
    &'a self,
    endpoint: NetworkServiceEndpoint,
  ) -> BoxFuture<'a, Result<NetworkServiceEndpoint, RegistryError>> {
    if endpoint.name.is_empty() {
      return future::ready(Err(RegistryError::EmptyName)).boxed();
    }
    self.endpoints.store(endpoint.name.clone(), endpoint.clone());
    tracing::debug!(name = %endpoint.name, url = %endpoint.url, "Endpoint registered");
    future::ready(Ok(endpoint)).boxed()
  }

  fn unregister<'a>(
    &'a self,
    name: &'a str,
  ) -> BoxFuture<'a, Result<Option<NetworkServiceEndpoint>, RegistryError>> {
    let removed = self.endpoints.delete(&name.to_string());
    if removed.is_some() {
      tracing::debug!(name, "Endpoint unregistered");
    }
    future::ready(Ok(removed)).boxed()
  }
}
