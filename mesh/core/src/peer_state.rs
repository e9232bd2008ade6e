// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-peer rotation and health tracking.
//!
//! The convergence loop owns one `PeerState` per planned peer and drives it
//! from probe ticks: a fresh tunnel handshake marks the peer alive and keeps
//! its working endpoint, while a silent endpoint is given `endpoint_timeout`
//! before the loop rotates to the next candidate. A peer that has exhausted
//! every candidate without a handshake is a suspect.

use std::time::Duration;

use tokio::time::Instant;

/// Health classification of a single peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerHealth {
    /// Not yet handshaken, candidates remain to try.
    New,
    /// Handshake fresh within the liveness window.
    Alive,
    /// Every candidate endpoint tried without a handshake.
    Suspect,
}

/// Rotation and liveness state for one peer. In-memory only; owned
/// exclusively by the convergence loop's task.
#[derive(Clone, Debug)]
pub struct PeerState {
    /// Index of the active endpoint in the peer's endpoint list.
    pub endpoint_index: usize,
    /// When the active endpoint was last written to the tunnel backend.
    pub endpoint_set_at: Option<Instant>,
    /// Cached length of the peer's endpoint list.
    pub endpoint_count: usize,
    /// Distinct endpoints tried since the last successful handshake,
    /// capped at `endpoint_count`.
    pub endpoints_attempted: usize,
    /// Latest handshake observed from the tunnel backend.
    pub last_handshake: Option<Instant>,
    pub health: PeerHealth,
}

impl PeerState {
    pub fn new(endpoint_count: usize, now: Instant) -> Self {
        Self {
            endpoint_index: 0,
            endpoint_set_at: Some(now),
            endpoint_count,
            endpoints_attempted: 0,
            last_handshake: None,
            health: PeerHealth::New,
        }
    }

    /// Reclassifies the peer.
    ///
    /// A fresh handshake resets the attempt counter but keeps
    /// `endpoint_index`: the working endpoint is sticky. A single-endpoint
    /// peer has nothing to rotate to, so its one endpoint counts as
    /// attempted once `endpoint_timeout` elapses, making the peer eligible
    /// for `Suspect`.
    pub fn classify(&mut self, now: Instant, alive_freshness: Duration, endpoint_timeout: Duration) {
        if let Some(handshake) = self.last_handshake {
            if now.duration_since(handshake) <= alive_freshness {
                self.endpoints_attempted = 0;
                self.health = PeerHealth::Alive;
                return;
            }
        }

        if self.endpoint_count == 1 && self.endpoints_attempted == 0 {
            if let Some(set_at) = self.endpoint_set_at {
                if now.duration_since(set_at) >= endpoint_timeout {
                    self.endpoints_attempted = 1;
                }
            }
        }

        self.health = if self.endpoints_attempted < self.endpoint_count {
            PeerHealth::New
        } else {
            PeerHealth::Suspect
        };
    }

    /// True when the active endpoint has had its chance and another
    /// candidate should be written to the tunnel.
    pub fn should_rotate(
        &self,
        now: Instant,
        alive_freshness: Duration,
        endpoint_timeout: Duration,
    ) -> bool {
        if self.endpoint_count <= 1 {
            return false;
        }
        if let Some(handshake) = self.last_handshake {
            if now.duration_since(handshake) <= alive_freshness {
                return false;
            }
        }
        match self.endpoint_set_at {
            Some(set_at) => now.duration_since(set_at) >= endpoint_timeout,
            None => false,
        }
    }

    /// Advances to the next candidate endpoint, wrapping around.
    pub fn next_endpoint(&mut self) {
        self.endpoint_index = (self.endpoint_index + 1) % self.endpoint_count;
        self.endpoints_attempted = (self.endpoints_attempted + 1).min(self.endpoint_count);
    }
}
