//! Fans one action's input manifest out across the disk cache, then links
//! the materialized objects into the action's sandbox.

use std::time::Duration;

use camino::Utf8Path;
use futures_util::future::join_all;
use tracing::debug;

use kiln_proto::FileEntry;

use crate::disk::DiskCache;
use crate::error::{CacheError, Result};
use crate::remote::Store;

/// Ensure every input is cached, then symlink each one into `sandbox` at its
/// declared relative path.
///
/// All ensures run concurrently: inputs shared with other in-flight actions
/// coalesce onto their fetches. The first failure is surfaced after every
/// fetch has settled.
pub async fn materialize_inputs<S: Store>(
    cache: &DiskCache<S>,
    inputs: &[FileEntry],
    sandbox: &Utf8Path,
    timeout: Duration,
) -> Result<()> {
    let ensures = inputs
        .iter()
        .map(|input| cache.ensure_cached(&input.content_key, input.executable, timeout));

    for result in join_all(ensures).await {
        result?;
    }

    for input in inputs {
        link_object(&cache.object_path(&input.content_key), sandbox, &input.path)?;
    }

    debug!(inputs = inputs.len(), sandbox = %sandbox, "inputs materialized");
    Ok(())
}

/// Symlink a cached object into the sandbox, creating parent directories.
///
/// The cache directory stays the durable source of truth; the sandbox only
/// ever holds links into it.
fn link_object(object: &Utf8Path, sandbox: &Utf8Path, rel_path: &str) -> Result<()> {
    let dest = sandbox.join(rel_path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CacheError::Io(format!("failed to create {}: {}", parent, e)))?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(object, &dest)
            .map_err(|e| CacheError::Io(format!("failed to link {}: {}", dest, e)))?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = object;
        Err(CacheError::Io(
            "symlinks not supported on this platform".to_string(),
        ))
    }
}
