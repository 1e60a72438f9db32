// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Admission control for establish and close calls

use std::sync::Arc;

use crate::common::{
  chain::{Flow, Interceptor},
  ChainError, Connection, Context, NetworkServiceRequest, Peer,
};

/// Decides whether the calling peer may act on a payload
pub trait Policy<T: ?Sized> {
  fn check(&self, peer: Option<&Peer>, subject: &T) -> anyhow::Result<()>;
}

impl<T: ?Sized, F> Policy<T> for F
where
  F: Fn(Option<&Peer>, &T) -> anyhow::Result<()>,
{
  fn check(&self, peer: Option<&Peer>, subject: &T) -> anyhow::Result<()> {
    self(peer, subject)
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl<T: ?Sized> Policy<T> for AllowAll {
  fn check(&self, _peer: Option<&Peer>, _subject: &T) -> anyhow::Result<()> {
    Ok(())
  }
}

pub type ArcPolicy<T> = Arc<dyn Policy<T> + Send + Sync + 'static>;

pub struct AuthorizeServer {
  request_policy: ArcPolicy<NetworkServiceRequest>,
  close_policy: ArcPolicy<Connection>,
}

impl Default for AuthorizeServer {
  fn default() -> Self {
    Self::new(Arc::new(AllowAll), Arc::new(AllowAll))
  }
}

impl AuthorizeServer {
  pub fn new(
    request_policy: ArcPolicy<NetworkServiceRequest>,
    close_policy: ArcPolicy<Connection>,
  ) -> Self {
    Self {
      request_policy,
      close_policy,
    }
  }
}

fn denied(ctx: &Context, e: anyhow::Error) -> ChainError {
  tracing::info!(peer = ?ctx.peer().map(|p| p.identity.as_str()), error = %e, "Call denied by policy");
  ChainError::PermissionDenied(format!("{:#}", e))
}

impl Interceptor for AuthorizeServer {
  fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection> {
    match self.request_policy.check(ctx.peer(), request) {
      Ok(()) => Flow::proceed(ctx),
      Err(e) => Flow::reject(denied(ctx, e)),
    }
  }

  fn on_close(&self, ctx: &Context, connection: &mut Connection) -> Flow<()> {
    match self.close_policy.check(ctx.peer(), connection) {
      Ok(()) => Flow::proceed(ctx),
      Err(e) => Flow::reject(denied(ctx, e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{AllowAll, AuthorizeServer};
  use crate::common::{
    chain::{intercept, testing::Recorder},
    ArcServer, Chain, ChainError, Connection, Context, NetworkServiceRequest, Peer,
  };

  fn chain(authorize: AuthorizeServer) -> (Chain, Arc<Recorder>) {
    let recorder = Recorder::accepting_all();
    (
      Chain::new(vec![intercept(authorize), recorder.clone() as ArcServer]),
      recorder,
    )
  }

  #[tokio::test]
  async fn default_policy_allows_everything() {
    let (chain, recorder) = chain(AuthorizeServer::default());
    chain
      .handle_request(Context::new(), Connection::new("conn-1", Default::default()).into())
      .await
      .unwrap();
    chain
      .handle_close(Context::new(), Connection::new("conn-1", Default::default()))
      .await
      .unwrap();
    assert_eq!(recorder.calls().len(), 2);
  }

  #[tokio::test]
  async fn rejected_peers_never_reach_the_chain() {
    let request_policy = |peer: Option<&Peer>, _: &NetworkServiceRequest| -> anyhow::Result<()> {
      match peer {
        Some(peer) if peer.identity == "spiffe://example.org/trusted" => Ok(()),
        _ => Err(anyhow::anyhow!("peer is not trusted")),
      }
    };
    let (chain, recorder) = chain(AuthorizeServer::new(
      Arc::new(request_policy),
      Arc::new(AllowAll),
    ));

    let err = chain
      .handle_request(
        Context::new().with_peer(Peer::new("spiffe://example.org/untrusted")),
        Connection::new("conn-1", Default::default()).into(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::PermissionDenied(reason) if reason.contains("not trusted")));
    assert!(recorder.calls().is_empty());

    chain
      .handle_request(
        Context::new().with_peer(Peer::new("spiffe://example.org/trusted")),
        Connection::new("conn-1", Default::default()).into(),
      )
      .await
      .unwrap();
    assert_eq!(recorder.calls().len(), 1);
  }

  #[tokio::test]
  async fn close_policy_is_checked_separately() {
    let close_policy = |_: Option<&Peer>, _: &Connection| -> anyhow::Result<()> {
      Err(anyhow::anyhow!("closes are disabled"))
    };
    let (chain, recorder) = chain(AuthorizeServer::new(
      Arc::new(AllowAll),
      Arc::new(close_policy),
    ));
    let err = chain
      .handle_close(Context::new(), Connection::new("conn-1", Default::default()))
      .await
      .unwrap_err();
    assert!(matches!(err, ChainError::PermissionDenied(_)));
    assert!(recorder.calls().is_empty());
  }
}
