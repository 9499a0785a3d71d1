// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Replay Nonce Ledger
//!
//! Remembers the nonce of every accepted P2P message for the duration of
//! the acceptance window and rejects anything seen twice. The set is
//! capped so a flood of unique nonces cannot grow memory without bound; at
//! the cap, expired entries are swept inline and, if the set is still
//! full, new messages are rejected outright; rejecting is safer than
//! evicting live entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Clock-skew allowance for timestamps from the future.
const FUTURE_SKEW: Duration = Duration::from_secs(60);

/// Interval of the background sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Ledger {
    seen: HashMap<String, Instant>,
}

/// Bounded set of seen nonces with timestamp validation.
pub struct NonceLedger {
    inner: Arc<Mutex<Ledger>>,
    window: Duration,
    max_entries: usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl NonceLedger {
    /// Create a ledger and start its background sweeper.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(window: Duration, max_entries: usize) -> Self {
        let inner = Arc::new(Mutex::new(Ledger {
            seen: HashMap::new(),
        }));

        let sweeper_inner = inner.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let mut ledger = sweeper_inner.lock().expect("nonce ledger poisoned");
                let before = ledger.seen.len();
                ledger.seen.retain(|_, seen_at| seen_at.elapsed() < window);
                let swept = before - ledger.seen.len();
                drop(ledger);
                if swept > 0 {
                    debug!(swept, "nonce ledger sweep");
                }
            }
        });

        Self {
            inner,
            window,
            max_entries,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Accept a message nonce exactly once.
    ///
    /// Returns `false` for empty nonces, timestamps outside the acceptance
    /// window, replays, and when the ledger is full of live entries.
    pub fn check(&self, nonce: &str, timestamp: i64) -> bool {
        if nonce.is_empty() {
            return false;
        }

        let now = Utc::now().timestamp();
        if now - timestamp > self.window.as_secs() as i64 {
            return false; // too old
        }
        if timestamp - now > FUTURE_SKEW.as_secs() as i64 {
            return false; // from the future
        }

        let mut ledger = self.inner.lock().expect("nonce ledger poisoned");

        if ledger.seen.len() >= self.max_entries {
            let window = self.window;
            ledger.seen.retain(|_, seen_at| seen_at.elapsed() < window);
            if ledger.seen.len() >= self.max_entries {
                return false;
            }
        }

        if ledger.seen.contains_key(nonce) {
            return false;
        }
        ledger.seen.insert(nonce.to_string(), Instant::now());
        true
    }

    /// Number of tracked nonces (for monitoring).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("nonce ledger poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweeper.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("nonce ledger poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for NonceLedger {
    fn drop(&mut self) {
        self.stop();
    }
}
