// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use url::Url;

/// Ways in which a connection's shape can be unfit for the element handling it
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedInput {
  #[error("path has no segments")]
  EmptyPath,
  #[error("path index {0} leaves no client or cross-connect segment before this component")]
  NoPriorSegment(usize),
  #[error("path index {index} is out of range for {len} segments")]
  IndexOutOfRange { index: usize, len: usize },
  #[error("path has no segment owned by {0}")]
  NoOwnedSegment(String),
  #[error("connection id {connection_id} does not match path segment id {segment_id}")]
  IdMismatch {
    connection_id: String,
    segment_id: String,
  },
  #[error("no upstream address was provided in the call context")]
  MissingClientUrl,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ChainError {
  #[error("Malformed connection: {0}")]
  MalformedInput(#[from] MalformedInput),
  #[error("Upstream address {actual} for connection {connection_id} does not match {recorded} selected before interposition")]
  AddressMismatch {
    connection_id: String,
    recorded: Url,
    actual: Url,
  },
  #[error("No cross-connect endpoint accepted connection {connection_id} to {upstream} after {attempts} attempts")]
  NoRouteAvailable {
    connection_id: String,
    upstream: Url,
    attempts: usize,
    last_error: Option<String>,
  },
  #[error("No active route found for connection {0}")]
  MissingState(String),
  #[error("Permission denied: {0}")]
  PermissionDenied(String),
  #[error("Call was cancelled")]
  Cancelled,
  #[error("Refused by {target}: {reason}")]
  Refused { target: String, reason: String },
}

impl ChainError {
  pub fn refused<TTarget: ToString, TReason: Into<String>>(target: TTarget, reason: TReason) -> Self {
    Self::Refused {
      target: target.to_string(),
      reason: reason.into(),
    }
  }

  /// Errors caused by the caller's input rather than by downstream availability
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      ChainError::MalformedInput(_)
        | ChainError::AddressMismatch { .. }
        | ChainError::MissingState(_)
        | ChainError::PermissionDenied(_)
    )
  }
}
