// ==============================================================================
// store/setup.rs - One-Time Setup Gate
// ==============================================================================
// Description: Runs store setup exactly once per load across all sink workers
// Author: Matt Barham
// Created: 2026-10-04
// Modified: 2026-10-12
// Version: 1.0.1
// ==============================================================================
// The first worker to reach the gate runs setup; every other worker waits on
// the same cell and then sees the same outcome. A failed setup is remembered
// so that no worker writes afterwards.
// ==============================================================================

use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::SetupError;

#[derive(Debug, Clone, Default)]
pub struct SetupGate {
    outcome: Arc<OnceCell<Result<(), SetupError>>>,
}

impl SetupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for setup, running `setup` if nobody has yet.
    ///
    /// `setup` is only polled by the caller that wins the race. If that caller
    /// is dropped mid-setup, the next waiter runs its own `setup` instead.
    pub async fn run_once<F>(&self, setup: F) -> Result<(), SetupError>
    where
        F: Future<Output = Result<(), SetupError>>,
    {
        if let Some(outcome) = self.outcome.get() {
            return outcome.clone();
        }

        let mut ran = false;
        let outcome = self
            .outcome
            .get_or_init(|| async {
                ran = true;
                info!("Running one-time store setup");
                setup.await
            })
            .await;

        if !ran {
            debug!("Store setup already performed by another worker");
        }
        outcome.clone()
    }

    /// True once setup has finished successfully
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome.get(), Some(Ok(())))
    }
}
