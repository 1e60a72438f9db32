// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Endpoint registration, and the hooks through which local cross-connect
//! endpoints become known to the interposition element

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

pub mod interpose;
pub mod memory;

pub use interpose::{interpose_name, is_interpose_name, InterposeRegistryServer};
pub use memory::InMemoryEndpointRegistry;

/// A registered endpoint and the address it is reachable at
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceEndpoint {
  pub name: String,
  pub url: Url,
  #[serde(default)]
  pub network_service_names: Vec<String>,
}

impl NetworkServiceEndpoint {
  pub fn new<TName: Into<String>>(name: TName, url: Url) -> Self {
    Self {
      name: name.into(),
      url,
      network_service_names: Vec::new(),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("Endpoint registrations require a non-empty name")]
  EmptyName,
  #[error("Registry unavailable: {0}")]
  Unavailable(String),
}

/// Storage for the cross-connect endpoints known to an interposition element
///
/// Registration carries no connection-state side effects.
pub trait CrossConnectStore {
  /// Stores `endpoint` under `name` unless an entry already exists.
  ///
  /// Returns the pre-existing entry and `true` when one was present,
  /// otherwise `None` and `false`.
  fn register_or_get(
    &self,
    name: &str,
    endpoint: NetworkServiceEndpoint,
  ) -> (Option<NetworkServiceEndpoint>, bool);

  fn remove(&self, name: &str);
}

pub trait EndpointRegistry {
  fn register<'a>(
    &'a self,
    endpoint: NetworkServiceEndpoint,
  ) -> BoxFuture<'a, Result<NetworkServiceEndpoint, RegistryError>>;

  fn unregister<'a>(
    &'a self,
    name: &'a str,
  ) -> BoxFuture<'a, Result<Option<NetworkServiceEndpoint>, RegistryError>>;
}
