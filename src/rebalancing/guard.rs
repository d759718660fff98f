use alloy::primitives::Address;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// RAII guard that holds a vault's in-progress claim.
/// Releases the claim on drop, on every exit path.
pub(super) struct InProgressGuard {
    vault: Address,
    in_progress: Arc<RwLock<HashSet<Address>>>,
}

impl InProgressGuard {
    /// Attempts to claim the in-progress slot for a vault.
    /// Returns `None` if another rebalance already holds it.
    pub(super) fn try_claim(
        vault: Address,
        in_progress: Arc<RwLock<HashSet<Address>>>,
    ) -> Option<Self> {
        {
            let mut guard = match in_progress.write() {
                Ok(guard) => guard,
                Err(poison) => poison.into_inner(),
            };

            if !guard.insert(vault) {
                return None;
            }
        }

        Some(Self { vault, in_progress })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut guard = match self.in_progress.write() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        guard.remove(&self.vault);
    }
}
