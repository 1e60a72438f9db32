// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-call context handed from one chain element to the next
//!
//! A [`Context`] is never mutated once built. Elements which need downstream
//! elements to see a different value derive a new context with one of the
//! `with_*` methods, leaving the caller's copy untouched, so concurrent calls
//! sharing a parent context cannot observe one another's changes.

use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Identity of the remote party that issued a call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
  pub identity: String,
  pub address: Option<SocketAddr>,
}

impl Peer {
  pub fn new<TIdentity: Into<String>>(identity: TIdentity) -> Self {
    Self {
      identity: identity.into(),
      address: None,
    }
  }
}

#[derive(Clone, Debug)]
pub struct Context {
  client_url: Option<Arc<Url>>,
  peer: Option<Arc<Peer>>,
  cancellation: CancellationToken,
}

impl Default for Context {
  fn default() -> Self {
    Self::new()
  }
}

impl Context {
  pub fn new() -> Self {
    Self::with_cancellation(CancellationToken::new())
  }

  /// Builds a root context whose calls end when `cancellation` is cancelled
  pub fn with_cancellation(cancellation: CancellationToken) -> Self {
    Self {
      client_url: None,
      peer: None,
      cancellation,
    }
  }

  /// The address the remainder of the chain is expected to connect to
  pub fn client_url(&self) -> Option<&Url> {
    self.client_url.as_deref()
  }

  pub fn with_client_url(&self, client_url: Url) -> Self {
    Self {
      client_url: Some(Arc::new(client_url)),
      ..self.clone()
    }
  }

  pub fn peer(&self) -> Option<&Peer> {
    self.peer.as_deref()
  }

  pub fn with_peer(&self, peer: Peer) -> Self {
    Self {
      peer: Some(Arc::new(peer)),
      ..self.clone()
    }
  }

  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancellation
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancellation.is_cancelled()
  }
}
