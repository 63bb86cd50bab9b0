//! Storage health check

use anyhow::Result;
use veil_core::NormalizedPath;

use crate::StorageStack;

/// Verify a volume is usable: its sector size is sane and the root lists.
pub fn check_health(stack: &dyn StorageStack, volume: &str) -> Result<()> {
    let sector = stack
        .sector_size(volume)
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))?;
    if sector == 0 || !sector.is_power_of_two() {
        anyhow::bail!("storage health check failed: volume {volume} reports sector size {sector}");
    }
    stack
        .list(&NormalizedPath::directory(volume, &[]))
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

/// Returns true if the volume is usable, false otherwise (non-panicking)
pub fn is_healthy(stack: &dyn StorageStack, volume: &str) -> bool {
    check_health(stack, volume).is_ok()
}
