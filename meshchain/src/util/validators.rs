// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Error as AnyErr, Result};
use std::path::Path;
use url::Url;

use crate::registry::NetworkServiceEndpoint;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_url(v: &str) -> Result<Url> {
  let url = Url::parse(v).with_context(|| format!("Could not parse {:?} as a URL", v))?;
  if url.cannot_be_a_base() {
    return Err(AnyErr::msg("URL must be of the form scheme://address"));
  }
  Ok(url)
}

/// Parses a cross-connect endpoint given as `name=url`
pub fn parse_cross_connect(v: &str) -> Result<NetworkServiceEndpoint> {
  match v.split_once('=') {
    None => Err(AnyErr::msg("Could not match '=' in cross-connect string")),
    Some((name, _)) if name.trim().is_empty() => {
      Err(AnyErr::msg("Cross-connect name must not be empty"))
    }
    Some((name, url)) => Ok(NetworkServiceEndpoint::new(name.trim(), parse_url(url.trim())?)),
  }
}

pub fn validate_url(v: &str) -> Result<(), String> {
  parse_url(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_cross_connect(v: &str) -> Result<(), String> {
  parse_cross_connect(v)
    .map(|_| ())
    .map_err(|e| format!("{:#}", e))
}
