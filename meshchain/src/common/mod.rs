// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection records, per-call context, and the chain they travel through

pub mod chain;
pub mod connection;
pub mod context;

pub use chain::{ArcServer, Chain, ChainError, MalformedInput, NetworkServiceServer, Next};
pub use connection::{
  Connection, ConnectionContext, IpContext, NetworkServiceRequest, Path, PathSegment,
};
pub use context::{Context, Peer};
