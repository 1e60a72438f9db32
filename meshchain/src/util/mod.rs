// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod concurrent_map;
pub mod validators;

pub use concurrent_map::ConcurrentMap;
