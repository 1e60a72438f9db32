// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tracks live connections and publishes changes to subscribers

use futures::{
  future::{BoxFuture, FutureExt},
  stream::{self, BoxStream, StreamExt},
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::{
  common::{ChainError, Connection, Context, NetworkServiceRequest, NetworkServiceServer, Next},
  util::ConcurrentMap,
};

const EVENT_BUFFER: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventType {
  InitialStateTransfer,
  Update,
  Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
  #[serde(rename = "type")]
  pub event_type: ConnectionEventType,
  pub connections: BTreeMap<String, Connection>,
}

impl ConnectionEvent {
  fn single(event_type: ConnectionEventType, connection: Connection) -> Self {
    Self {
      event_type,
      connections: std::iter::once((connection.id.clone(), connection)).collect(),
    }
  }
}

pub struct MonitorServer {
  connections: ConcurrentMap<String, Connection>,
  events: broadcast::Sender<ConnectionEvent>,
}

impl Default for MonitorServer {
  fn default() -> Self {
    Self::new()
  }
}

impl MonitorServer {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    Self {
      connections: ConcurrentMap::new(),
      events,
    }
  }

  pub fn connections(&self) -> BTreeMap<String, Connection> {
    self.connections.snapshot().into_iter().collect()
  }

  /// Streams the currently known connections, then every later change
  ///
  /// Subscribers which fall too far behind skip the events they missed.
  pub fn monitor_connections(&self) -> BoxStream<'static, ConnectionEvent> {
    // Subscribe before taking the snapshot so no change falls between the two
    let receiver = self.events.subscribe();
    let initial = ConnectionEvent {
      event_type: ConnectionEventType::InitialStateTransfer,
      connections: self.connections(),
    };
    let updates = BroadcastStream::new(receiver).filter_map(|event| async move {
      match event {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "Connection monitor subscriber lagged");
          None
        }
      }
    });
    stream::once(async move { initial }).chain(updates).boxed()
  }

  fn publish(&self, event: ConnectionEvent) {
    // No receivers is not an error; there may simply be no subscribers yet
    let _ = self.events.send(event);
  }
}

impl NetworkServiceServer for MonitorServer {
  fn request<'a>(
    &'a self,
    ctx: Context,
    request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    async move {
      let connection = next.request(ctx, request).await?;
      self
        .connections
        .store(connection.id.clone(), connection.clone());
      self.publish(ConnectionEvent::single(
        ConnectionEventType::Update,
        connection.clone(),
      ));
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
    if let Some(removed) = self.connections.delete(&connection.id) {
      self.publish(ConnectionEvent::single(ConnectionEventType::Delete, removed));
    }
    next.close(ctx, connection)
  }
}
