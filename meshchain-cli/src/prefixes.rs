// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use meshchain::server::excluded_prefixes::load_prefixes;
use std::path::PathBuf;

pub async fn prefixes_main(path: PathBuf) -> Result<()> {
  let prefixes = load_prefixes(&path)
    .await
    .with_context(|| format!("Loading excluded prefixes from {}", path.display()))?;
  tracing::info!(path = %path.display(), count = prefixes.len(), "Excluded prefixes loaded");
  for prefix in prefixes.iter() {
    println!("{}", prefix);
  }
  Ok(())
}
