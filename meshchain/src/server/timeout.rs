// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Closes connections which are not refreshed before they expire

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
  },
  time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  ChainError, Connection, Context, NetworkServiceRequest, NetworkServiceServer, Next,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

struct Timer {
  generation: u64,
  cancellation: CancellationToken,
}

pub struct TimeoutServer {
  endpoint: Weak<dyn NetworkServiceServer + Send + Sync + 'static>,
  default_timeout: Duration,
  timers: Arc<DashMap<String, Timer>>,
  generations: AtomicU64,
}

impl TimeoutServer {
  /// Expired connections are closed by calling into `endpoint` from its outermost element
  pub fn new(
    endpoint: Weak<dyn NetworkServiceServer + Send + Sync + 'static>,
    default_timeout: Duration,
  ) -> Self {
    Self {
      endpoint,
      default_timeout,
      timers: Default::default(),
      generations: AtomicU64::new(0),
    }
  }

  pub fn pending(&self) -> usize {
    self.timers.len()
  }

  fn expiry_of(&self, connection: &Connection) -> Duration {
    connection
      .path
      .current()
      .and_then(|segment| segment.expires)
      .map(|expires| {
        expires
          .duration_since(SystemTime::now())
          .unwrap_or(Duration::ZERO)
      })
      .unwrap_or(self.default_timeout)
  }

  fn cancel(&self, connection_id: &str) {
    if let Some((_, timer)) = self.timers.remove(connection_id) {
      timer.cancellation.cancel();
    }
  }

  fn schedule(&self, connection: Connection) {
    let after = self.expiry_of(&connection);
    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
    let cancellation = CancellationToken::new();
    let previous = self.timers.insert(
      connection.id.clone(),
      Timer {
        generation,
        cancellation: cancellation.clone(),
      },
    );
    if let Some(previous) = previous {
      previous.cancellation.cancel();
    }

    let timers = Arc::clone(&self.timers);
    let endpoint = self.endpoint.clone();
    let span = tracing::debug_span!("timeout", connection_id = %connection.id);
    tracing::trace!(connection_id = %connection.id, ?after, "Scheduled idle close");
    tokio::task::spawn(
      async move {
        tokio::select! {
          _ = cancellation.cancelled() => return,
          _ = tokio::time::sleep(after) => {}
        }
        timers.remove_if(&connection.id, |_, timer| timer.generation == generation);
        let endpoint = match endpoint.upgrade() {
          Some(endpoint) => endpoint,
          None => return,
        };
        tracing::info!("Connection expired; closing");
        if let Err(e) = endpoint
          .close(Context::new(), connection, Next::terminal())
          .await
        {
          tracing::warn!(error = %e, "Failed to close expired connection");
        }
      }
      .instrument(span),
    );
  }
}

impl Drop for TimeoutServer {
  fn drop(&mut self) {
    for timer in self.timers.iter() {
      timer.cancellation.cancel();
    }
  }
}

impl NetworkServiceServer for TimeoutServer {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    async move {
      let connection = next.request(ctx, request).await?;
      self.schedule(connection.clone());
      Ok(connection)
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    self.cancel(&connection.id);
    next.close(ctx, connection)
  }
}
