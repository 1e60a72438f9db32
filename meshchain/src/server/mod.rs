// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Chain elements, and the endpoint assembled from them

pub mod authorize;
pub mod endpoint;
pub mod excluded_prefixes;
pub mod interpose;
pub mod monitor;
pub mod setid;
pub mod timeout;
pub mod updatepath;

pub use authorize::{AllowAll, AuthorizeServer, Policy};
pub use endpoint::{Endpoint, EndpointOptions};
pub use excluded_prefixes::{ExcludedPrefixesServer, IpPrefix, PrefixError};
pub use interpose::{ActiveRoute, InterposeServer, Resolution};
pub use monitor::{ConnectionEvent, ConnectionEventType, MonitorServer};
pub use setid::SetIdServer;
pub use timeout::TimeoutServer;
pub use updatepath::UpdatePathServer;
