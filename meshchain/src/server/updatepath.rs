// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Records this endpoint's hop in a connection's path

use futures::future::{self, BoxFuture, FutureExt};
use uuid::Uuid;

use crate::common::{
  ChainError, Connection, Context, MalformedInput, NetworkServiceRequest, NetworkServiceServer,
  Next, PathSegment,
};

pub struct UpdatePathServer {
  name: String,
}

impl UpdatePathServer {
  pub fn new<TName: Into<String>>(name: TName) -> Self {
    Self { name: name.into() }
  }

  /// Moves the path's index onto this endpoint's segment, adding one if needed
  ///
  /// Returns the index the path held beforehand.
  pub fn stamp(&self, connection: &mut Connection) -> Result<usize, MalformedInput> {
    let previous = connection.path.index;
    let path = &mut connection.path;

    if path.is_empty() {
      let id = fresh_id_unless_set(&connection.id);
      path.index = 0;
      path.path_segments.push(PathSegment::new(self.name.as_str(), id));
    } else if previous >= path.len() {
      return Err(MalformedInput::IndexOutOfRange {
        index: previous,
        len: path.len(),
      });
    } else if path.path_segments[previous].name == self.name {
      // Already positioned on our own segment
    } else if path
      .path_segments
      .get(previous + 1)
      .map_or(false, |segment| segment.name == self.name)
    {
      path.index = previous + 1;
    } else {
      let id = fresh_id_unless_set(&connection.id);
      path.path_segments.truncate(previous + 1);
      path.path_segments.push(PathSegment::new(self.name.as_str(), id));
      path.index = previous + 1;
    }

    let current = &path.path_segments[path.index];
    connection.id = current.id.clone();
    Ok(previous)
  }
}

fn fresh_id_unless_set(id: &str) -> String {
  if id.is_empty() {
    Uuid::new_v4().to_string()
  } else {
    id.to_string()
  }
}

impl NetworkServiceServer for UpdatePathServer {
  fn request<'a>(
    &'a self,
    ctx: Context,
    mut request: NetworkServiceRequest,
    next: Next,
  ) -> BoxFuture<'a, Result<Connection, ChainError>> {
    let previous = match self.stamp(&mut request.connection) {
      Ok(previous) => previous,
      Err(e) => return future::ready(Err(e.into())).boxed(),
    };
    next
      .request(ctx, request)
      .map(move |result| {
        result.map(|mut connection| {
          connection.path.index = previous;
          connection
        })
      })
      .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: Context,
    mut connection: Connection,
    next: Next,
  ) -> BoxFuture<'a, Result<(), ChainError>> {
    if let Err(e) = self.stamp(&mut connection) {
      return future::ready(Err(e.into())).boxed();
    }
    next.close(ctx, connection)
  }
}
