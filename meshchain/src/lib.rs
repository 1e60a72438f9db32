// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod common;
pub mod util;

pub mod registry;
pub mod server;
