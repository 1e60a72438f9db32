// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection records carried through a chain

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::SystemTime};

/// One hop of a [`Path`], naming the component that handled it and the
/// connection id that component uses for it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
  pub name: String,
  pub id: String,
  #[serde(default)]
  pub expires: Option<SystemTime>,
}

impl PathSegment {
  pub fn new<TName: Into<String>, TId: Into<String>>(name: TName, id: TId) -> Self {
    Self {
      name: name.into(),
      id: id.into(),
      expires: None,
    }
  }

  pub fn with_expiry(mut self, expires: SystemTime) -> Self {
    self.expires = Some(expires);
    self
  }
}

/// The components a connection has traversed, and which of them is handling it now
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
  pub index: usize,
  pub path_segments: Vec<PathSegment>,
}

impl Path {
  pub fn new(index: usize, path_segments: Vec<PathSegment>) -> Self {
    Self {
      index,
      path_segments,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.path_segments.is_empty()
  }

  pub fn len(&self) -> usize {
    self.path_segments.len()
  }

  /// The segment at the current index, if the index is in range
  pub fn current(&self) -> Option<&PathSegment> {
    self.path_segments.get(self.index)
  }

  pub fn current_mut(&mut self) -> Option<&mut PathSegment> {
    self.path_segments.get_mut(self.index)
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpContext {
  #[serde(default)]
  pub excluded_prefixes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
  #[serde(default)]
  pub ip_context: IpContext,
  #[serde(default)]
  pub extra_context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
  pub id: String,
  #[serde(default)]
  pub network_service: String,
  #[serde(default)]
  pub path: Path,
  #[serde(default)]
  pub context: ConnectionContext,
}

impl Connection {
  pub fn new<TId: Into<String>>(id: TId, path: Path) -> Self {
    Self {
      id: id.into(),
      path,
      ..Default::default()
    }
  }
}

/// Payload of an establish call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceRequest {
  pub connection: Connection,
}

impl NetworkServiceRequest {
  pub fn new(connection: Connection) -> Self {
    Self { connection }
  }
}

impl From<Connection> for NetworkServiceRequest {
  fn from(connection: Connection) -> Self {
    Self::new(connection)
  }
}
