// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use uuid::Uuid;

use crate::common::{
  chain::{Flow, Interceptor},
  Connection, Context, NetworkServiceRequest,
};

/// Gives connections arriving from another component an id of this endpoint's own
pub struct SetIdServer {
  name: String,
}

impl SetIdServer {
  pub fn new<TName: Into<String>>(name: TName) -> Self {
    Self { name: name.into() }
  }
}

impl Interceptor for SetIdServer {
  fn on_request(&self, ctx: &Context, request: &mut NetworkServiceRequest) -> Flow<Connection> {
    let connection = &mut request.connection;
    let owned = connection
      .path
      .current()
      .map_or(false, |segment| segment.name == self.name);
    if !owned {
      connection.id = Uuid::new_v4().to_string();
      tracing::trace!(connection_id = %connection.id, "Assigned connection id");
    }
    Flow::proceed(ctx)
  }
}
