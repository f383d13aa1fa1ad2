//! Per-peer state and timers.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use ferrotun_core::{RekeyConfig, KEY_LEN};
use ferrotun_crypto::{
    CookieGenerator, CryptoError, Handshake, HandshakeState, Identity, KeypairSet, PublicKey,
};
use tracing::debug;

use crate::lock;

/// Packets held while no usable keypair exists.
pub const MAX_STAGED_PACKETS: usize = 128;

/// Work a timer sweep found due for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// The initiation went unanswered for `rekey_timeout`.
    RetransmitHandshake,
    /// No response within `rekey_attempt_time`; give up on the attempt.
    AbandonHandshake,
    /// Data was received but nothing sent back for `keepalive_timeout`.
    SendKeepalive,
    /// The current keypair is old or busy enough to replace.
    Rekey,
    /// Nothing happened for three reject intervals; forget every key.
    ZeroKeys,
}

#[derive(Debug, Default)]
struct Timers {
    handshake_started: Option<Instant>,
    last_initiation_sent: Option<Instant>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    last_handshake: Option<Instant>,
}

pub struct Peer {
    public_key: PublicKey,
    handshake: Mutex<Handshake>,
    keypairs: KeypairSet,
    cookies: Mutex<CookieGenerator>,
    endpoint: Mutex<Option<SocketAddr>>,
    timers: Mutex<Timers>,
    staged: Mutex<VecDeque<Vec<u8>>>,
}

impl Peer {
    pub fn new(
        identity: &Identity,
        public_key: PublicKey,
        psk: Option<[u8; KEY_LEN]>,
        policy: &RekeyConfig,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            handshake: Mutex::new(Handshake::new(identity, public_key, psk)?),
            keypairs: KeypairSet::new(),
            cookies: Mutex::new(CookieGenerator::new(
                &public_key,
                policy.cookie_refresh_time(),
            )),
            endpoint: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            staged: Mutex::new(VecDeque::new()),
            public_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn keypairs(&self) -> &KeypairSet {
        &self.keypairs
    }

    pub(crate) fn handshake(&self) -> std::sync::MutexGuard<'_, Handshake> {
        lock(&self.handshake)
    }

    pub(crate) fn cookies(&self) -> std::sync::MutexGuard<'_, CookieGenerator> {
        lock(&self.cookies)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake().state()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *lock(&self.endpoint)
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *lock(&self.endpoint) = Some(endpoint);
    }

    /// Hold a packet until a keypair is available. The oldest packet is
    /// dropped once the queue is full.
    pub fn stage(&self, packet: Vec<u8>) {
        let mut staged = lock(&self.staged);
        if staged.len() >= MAX_STAGED_PACKETS {
            staged.pop_front();
        }
        staged.push_back(packet);
    }

    pub fn take_staged(&self) -> Vec<Vec<u8>> {
        lock(&self.staged).drain(..).collect()
    }

    pub fn staged_len(&self) -> usize {
        lock(&self.staged).len()
    }

    pub fn last_handshake(&self) -> Option<Instant> {
        lock(&self.timers).last_handshake
    }

    pub(crate) fn note_initiation_sent(&self, now: Instant, retransmit: bool) {
        let mut timers = lock(&self.timers);
        if !retransmit || timers.handshake_started.is_none() {
            timers.handshake_started = Some(now);
        }
        timers.last_initiation_sent = Some(now);
        timers.last_sent = Some(now);
    }

    pub(crate) fn note_handshake_complete(&self, now: Instant) {
        let mut timers = lock(&self.timers);
        timers.handshake_started = None;
        timers.last_initiation_sent = None;
        timers.last_handshake = Some(now);
    }

    pub(crate) fn note_handshake_abandoned(&self) {
        let mut timers = lock(&self.timers);
        timers.handshake_started = None;
        timers.last_initiation_sent = None;
    }

    pub(crate) fn note_sent(&self, now: Instant) {
        lock(&self.timers).last_sent = Some(now);
    }

    pub(crate) fn note_received(&self, now: Instant) {
        lock(&self.timers).last_received = Some(now);
    }

    pub(crate) fn forget_handshake_time(&self) {
        lock(&self.timers).last_handshake = None;
    }

    /// Decide which timers have fired at `now`.
    pub fn tick(&self, now: Instant, policy: &RekeyConfig) -> Vec<TimerAction> {
        let mut actions = Vec::new();
        let in_flight = self.handshake_state() == HandshakeState::InitiationSent;
        let current = self.keypairs.current();
        let timers = lock(&self.timers);

        if in_flight {
            if let Some(started) = timers.handshake_started {
                if now.saturating_duration_since(started) >= policy.rekey_attempt_time() {
                    actions.push(TimerAction::AbandonHandshake);
                } else if timers
                    .last_initiation_sent
                    .map_or(true, |sent| {
                        now.saturating_duration_since(sent) >= policy.rekey_timeout()
                    })
                {
                    actions.push(TimerAction::RetransmitHandshake);
                }
            }
        }

        if let (Some(received), Some(_)) = (timers.last_received, &current) {
            let answered = timers.last_sent.is_some_and(|sent| sent >= received);
            if !answered
                && now.saturating_duration_since(received) >= policy.keepalive_timeout()
            {
                actions.push(TimerAction::SendKeepalive);
            }
        }

        if !in_flight && current.is_some_and(|kp| kp.needs_rekey(policy, now)) {
            actions.push(TimerAction::Rekey);
        }

        if let Some(last) = timers.last_handshake {
            if now.saturating_duration_since(last) >= policy.reject_after_time() * 3 {
                actions.push(TimerAction::ZeroKeys);
            }
        }

        if !actions.is_empty() {
            debug!("timers due for {:?}: {:?}", self.public_key, actions);
        }
        actions
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &self.public_key)
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}
