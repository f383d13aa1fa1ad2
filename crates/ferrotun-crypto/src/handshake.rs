//! Noise IKpsk2 handshake engine.
//!
//! One [`Handshake`] exists per peer and holds at most one attempt in
//! flight. The initiator walks `Idle -> InitiationSent -> ResponseReceived`
//! and the responder `Idle -> InitiationReceived -> ResponseSent`; both end
//! in `Established` once [`Handshake::begin_session`] has turned the chain
//! key into a [`Keypair`]. Any authentication or curve failure moves the
//! attempt to `Aborted` and wipes every transient secret.
//!
//! Intermediate chain values live in [`SecretBytes`] locals and are only
//! written back to the struct once a step has fully succeeded, so every
//! early return drops (and wipes) them.
//!
//! MAC fields of the produced messages are left zero; [`crate::cookie`]
//! stamps them just before the message goes out.

use std::fmt;
use std::time::{Duration, Instant};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use ferrotun_core::{
    Initiation, Response, Timestamp, KEY_LEN, MAC_LEN, TAG_LEN, TIMESTAMP_LEN,
};

use crate::error::CryptoError;
use crate::kdf::{hash, kdf1, kdf2, kdf3, mix_hash, SecretBytes};
use crate::keypair::Keypair;
use crate::keys::{Identity, PrivateKey, PublicKey};

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Progress of the attempt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InitiationSent,
    InitiationReceived,
    ResponseSent,
    ResponseReceived,
    Established,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Chain key and transcript hash before any message-specific input.
fn initial_chain(responder_static: &PublicKey) -> (SecretBytes, SecretBytes) {
    let chain_key = Zeroizing::new(hash(&[CONSTRUCTION]));
    let mut h = Zeroizing::new(hash(&[&chain_key[..], IDENTIFIER]));
    mix_hash(&mut h, responder_static.as_bytes());
    (chain_key, h)
}

fn seal_field<const N: usize>(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<[u8; N], CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let ciphertext = cipher
        .encrypt(&Nonce::default(), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)?;
    ciphertext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Encryption)
}

fn open_field(
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(&Nonce::default(), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::HandshakeAuth)
}

/// An initiation whose static key and timestamp have been authenticated by
/// the local identity, but which has not yet been matched against a peer.
///
/// The device uses `remote_static` to find the peer, then hands this to
/// that peer's [`Handshake::consume_initiation`].
pub struct OpenedInitiation {
    remote_static: PublicKey,
    sender: u32,
    remote_ephemeral: PublicKey,
    timestamp: Timestamp,
    chain_key: SecretBytes,
    hash: SecretBytes,
}

impl OpenedInitiation {
    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn sender(&self) -> u32 {
        self.sender
    }
}

impl fmt::Debug for OpenedInitiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedInitiation")
            .field("remote_static", &self.remote_static)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

/// Authenticate the first half of an initiation against the local identity.
///
/// Needs no per-peer state, so a responder can run it before deciding
/// whether the sender is a known peer.
pub fn open_initiation(
    identity: &Identity,
    msg: &Initiation,
) -> Result<OpenedInitiation, CryptoError> {
    let remote_ephemeral = PublicKey::from(msg.ephemeral);
    let (chain_key, mut h) = initial_chain(identity.public_key());

    let chain_key = kdf1(&chain_key[..], remote_ephemeral.as_bytes());
    mix_hash(&mut h, remote_ephemeral.as_bytes());

    let ss = identity.private_key().shared_secret(&remote_ephemeral)?;
    let (chain_key, key) = kdf2(&chain_key[..], ss.as_bytes());
    drop(ss);

    let plain = open_field(&key, &msg.encrypted_static, &h[..])?;
    let remote_static = PublicKey::try_from(plain.as_slice())?;
    mix_hash(&mut h, &msg.encrypted_static);

    let ss = identity.private_key().shared_secret(&remote_static)?;
    let (chain_key, key) = kdf2(&chain_key[..], ss.as_bytes());
    drop(ss);

    let plain = open_field(&key, &msg.encrypted_timestamp, &h[..])?;
    let timestamp_bytes: [u8; TIMESTAMP_LEN] = plain
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::HandshakeAuth)?;
    mix_hash(&mut h, &msg.encrypted_timestamp);

    Ok(OpenedInitiation {
        remote_static,
        sender: msg.sender,
        remote_ephemeral,
        timestamp: Timestamp::from_bytes(timestamp_bytes),
        chain_key,
        hash: h,
    })
}

/// Per-peer handshake state.
pub struct Handshake {
    state: HandshakeState,
    role: Role,
    hash: SecretBytes,
    chain_key: SecretBytes,
    local_ephemeral: PrivateKey,
    remote_ephemeral: PublicKey,
    local_index: u32,
    remote_index: u32,
    remote_static: PublicKey,
    psk: SecretBytes,
    last_timestamp: Timestamp,
    last_initiation_consumed: Option<Instant>,
}

impl Handshake {
    /// Prepare handshake state for `remote_static`.
    ///
    /// A degenerate peer key is rejected before any message is exchanged.
    /// The static-static DH itself is redone for every attempt.
    pub fn new(
        identity: &Identity,
        remote_static: PublicKey,
        psk: Option<[u8; KEY_LEN]>,
    ) -> Result<Self, CryptoError> {
        drop(identity.private_key().shared_secret(&remote_static)?);
        Ok(Self {
            state: HandshakeState::Idle,
            role: Role::Initiator,
            hash: Zeroizing::new([0u8; KEY_LEN]),
            chain_key: Zeroizing::new([0u8; KEY_LEN]),
            local_ephemeral: PrivateKey::zeroed(),
            remote_ephemeral: PublicKey::default(),
            local_index: 0,
            remote_index: 0,
            remote_static,
            psk: Zeroizing::new(psk.unwrap_or([0u8; KEY_LEN])),
            last_timestamp: Timestamp::ZERO,
            last_initiation_consumed: None,
        })
    }

    /// Build a fresh initiation; any previous attempt is discarded.
    pub fn create_initiation(
        &mut self,
        identity: &Identity,
        local_index: u32,
        timestamp: Timestamp,
    ) -> Result<Initiation, CryptoError> {
        self.clear();

        let ephemeral = PrivateKey::generate()?;
        let ephemeral_public = ephemeral.public_key();

        let (chain_key, mut h) = initial_chain(&self.remote_static);

        let chain_key = kdf1(&chain_key[..], ephemeral_public.as_bytes());
        mix_hash(&mut h, ephemeral_public.as_bytes());

        let ss = ephemeral.shared_secret(&self.remote_static)?;
        let (chain_key, key) = kdf2(&chain_key[..], ss.as_bytes());
        drop(ss);
        let encrypted_static: [u8; KEY_LEN + TAG_LEN] =
            seal_field(&key, identity.public_key().as_bytes(), &h[..])?;
        mix_hash(&mut h, &encrypted_static);

        let ss = identity.private_key().shared_secret(&self.remote_static)?;
        let (chain_key, key) = kdf2(&chain_key[..], ss.as_bytes());
        drop(ss);
        let encrypted_timestamp: [u8; TIMESTAMP_LEN + TAG_LEN] =
            seal_field(&key, timestamp.as_bytes(), &h[..])?;
        mix_hash(&mut h, &encrypted_timestamp);

        self.chain_key = chain_key;
        self.hash = h;
        self.local_ephemeral = ephemeral;
        self.local_index = local_index;
        self.role = Role::Initiator;
        self.state = HandshakeState::InitiationSent;
        debug!("created initiation with index {}", local_index);

        Ok(Initiation {
            sender: local_index,
            ephemeral: ephemeral_public.to_bytes(),
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; MAC_LEN],
            mac2: [0u8; MAC_LEN],
        })
    }

    /// Finish processing an initiation addressed to this peer.
    ///
    /// Rejects stale timestamps and initiations arriving faster than
    /// `rate`. Nothing is written to `self` unless every check passes.
    pub fn consume_initiation(
        &mut self,
        opened: OpenedInitiation,
        now: Instant,
        rate: Duration,
    ) -> Result<(), CryptoError> {
        if opened.remote_static != self.remote_static {
            return Err(CryptoError::HandshakeAuth);
        }

        let timestamp = opened.timestamp;
        if !timestamp.is_after(&self.last_timestamp) {
            debug!("initiation timestamp is not newer than the last one");
            return Err(CryptoError::Replay);
        }
        if let Some(last) = self.last_initiation_consumed {
            if now.saturating_duration_since(last) < rate {
                debug!("initiation arrived faster than the rate limit");
                return Err(CryptoError::Replay);
            }
        }

        self.clear();
        self.chain_key = opened.chain_key;
        self.hash = opened.hash;
        self.remote_ephemeral = opened.remote_ephemeral;
        self.remote_index = opened.sender;
        self.last_timestamp = timestamp;
        self.last_initiation_consumed = Some(now);
        self.role = Role::Responder;
        self.state = HandshakeState::InitiationReceived;
        Ok(())
    }

    /// Answer a consumed initiation. Failure aborts the attempt.
    pub fn create_response(&mut self, local_index: u32) -> Result<Response, CryptoError> {
        if self.state != HandshakeState::InitiationReceived {
            return Err(CryptoError::InvalidState("no initiation to respond to"));
        }

        let result = self.build_response(local_index);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn build_response(&mut self, local_index: u32) -> Result<Response, CryptoError> {
        let ephemeral = PrivateKey::generate()?;
        let ephemeral_public = ephemeral.public_key();
        let mut h = self.hash.clone();

        let chain_key = kdf1(&self.chain_key[..], ephemeral_public.as_bytes());
        mix_hash(&mut h, ephemeral_public.as_bytes());

        let ss = ephemeral.shared_secret(&self.remote_ephemeral)?;
        let chain_key = kdf1(&chain_key[..], ss.as_bytes());
        drop(ss);

        let ss = ephemeral.shared_secret(&self.remote_static)?;
        let chain_key = kdf1(&chain_key[..], ss.as_bytes());
        drop(ss);

        let (chain_key, tau, key) = kdf3(&chain_key[..], &self.psk[..]);
        mix_hash(&mut h, &tau[..]);

        let encrypted_nothing: [u8; TAG_LEN] = seal_field(&key, &[], &h[..])?;
        mix_hash(&mut h, &encrypted_nothing);

        self.chain_key = chain_key;
        self.hash = h;
        self.local_index = local_index;
        self.state = HandshakeState::ResponseSent;
        debug!(
            "created response with index {} for remote {}",
            local_index, self.remote_index
        );

        Ok(Response {
            sender: local_index,
            receiver: self.remote_index,
            ephemeral: ephemeral_public.to_bytes(),
            encrypted_nothing,
            mac1: [0u8; MAC_LEN],
            mac2: [0u8; MAC_LEN],
        })
    }

    /// Process the response to our initiation.
    ///
    /// A response for another attempt is ignored without touching state;
    /// one that fails authentication aborts the attempt.
    pub fn consume_response(
        &mut self,
        identity: &Identity,
        msg: &Response,
    ) -> Result<(), CryptoError> {
        if self.state != HandshakeState::InitiationSent {
            return Err(CryptoError::InvalidState("no initiation in flight"));
        }
        if msg.receiver != self.local_index {
            return Err(CryptoError::InvalidState("response for another attempt"));
        }

        let result = self.absorb_response(identity, msg);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn absorb_response(&mut self, identity: &Identity, msg: &Response) -> Result<(), CryptoError> {
        let remote_ephemeral = PublicKey::from(msg.ephemeral);
        let mut h = self.hash.clone();

        let chain_key = kdf1(&self.chain_key[..], remote_ephemeral.as_bytes());
        mix_hash(&mut h, remote_ephemeral.as_bytes());

        let ss = self.local_ephemeral.shared_secret(&remote_ephemeral)?;
        let chain_key = kdf1(&chain_key[..], ss.as_bytes());
        drop(ss);

        let ss = identity.private_key().shared_secret(&remote_ephemeral)?;
        let chain_key = kdf1(&chain_key[..], ss.as_bytes());
        drop(ss);

        let (chain_key, tau, key) = kdf3(&chain_key[..], &self.psk[..]);
        mix_hash(&mut h, &tau[..]);

        open_field(&key, &msg.encrypted_nothing, &h[..])?;
        mix_hash(&mut h, &msg.encrypted_nothing);

        self.local_ephemeral.zeroize();
        self.chain_key = chain_key;
        self.hash = h;
        self.remote_ephemeral = remote_ephemeral;
        self.remote_index = msg.sender;
        self.state = HandshakeState::ResponseReceived;
        Ok(())
    }

    /// Derive the transport keypair and retire the attempt.
    ///
    /// Initiator and responder read the two outputs in mirrored order, so
    /// one side's send key is the other side's receive key.
    pub fn begin_session(
        &mut self,
        now: Instant,
        reject_after_messages: u64,
    ) -> Result<Keypair, CryptoError> {
        let is_initiator = match self.state {
            HandshakeState::ResponseReceived => true,
            HandshakeState::ResponseSent => false,
            _ => return Err(CryptoError::InvalidState("handshake not complete")),
        };

        let (first, second) = kdf2(&self.chain_key[..], &[]);
        let (send, receive) = if is_initiator {
            (first, second)
        } else {
            (second, first)
        };

        let keypair = Keypair::new(
            send,
            receive,
            is_initiator,
            self.local_index,
            self.remote_index,
            reject_after_messages,
            now,
        );

        self.clear();
        self.state = HandshakeState::Established;
        Ok(keypair)
    }

    /// Abandon the attempt in flight, wiping its secrets.
    pub fn abort(&mut self) {
        if self.state != HandshakeState::Idle {
            debug!("aborting handshake with index {}", self.local_index);
        }
        self.clear();
        self.state = HandshakeState::Aborted;
    }

    fn clear(&mut self) {
        self.hash.zeroize();
        self.chain_key.zeroize();
        self.local_ephemeral.zeroize();
        self.remote_ephemeral = PublicKey::default();
        self.local_index = 0;
        self.remote_index = 0;
    }

    /// True when no transient secret of an attempt remains in memory.
    pub fn is_wiped(&self) -> bool {
        crate::kdf::is_zero(&self.hash[..])
            && crate::kdf::is_zero(&self.chain_key[..])
            && self.local_ephemeral.is_zero()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Index of the attempt in flight; zero when none.
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.last_timestamp
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("remote_static", &self.remote_static)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Identity, Identity, Handshake, Handshake) {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();
        let a = Handshake::new(&alice, *bob.public_key(), None).unwrap();
        let b = Handshake::new(&bob, *alice.public_key(), None).unwrap();
        (alice, bob, a, b)
    }

    #[test]
    fn test_state_progression() {
        let (alice, bob, mut a, mut b) = pair();
        let now = Instant::now();

        assert_eq!(a.state(), HandshakeState::Idle);
        let init = a.create_initiation(&alice, 7, Timestamp::now()).unwrap();
        assert_eq!(a.state(), HandshakeState::InitiationSent);

        let opened = open_initiation(&bob, &init).unwrap();
        assert_eq!(opened.remote_static(), alice.public_key());
        assert_eq!(opened.sender(), 7);
        b.consume_initiation(opened, now, Duration::ZERO).unwrap();
        assert_eq!(b.state(), HandshakeState::InitiationReceived);
        assert_eq!(b.role(), Role::Responder);

        let resp = b.create_response(9).unwrap();
        assert_eq!(b.state(), HandshakeState::ResponseSent);
        assert_eq!(resp.receiver, 7);

        a.consume_response(&alice, &resp).unwrap();
        assert_eq!(a.state(), HandshakeState::ResponseReceived);
        assert_eq!(a.remote_index(), 9);

        let ka = a.begin_session(now, u64::MAX).unwrap();
        let kb = b.begin_session(now, u64::MAX).unwrap();
        assert_eq!(a.state(), HandshakeState::Established);
        assert_eq!(b.state(), HandshakeState::Established);
        assert!(ka.is_initiator());
        assert!(!kb.is_initiator());
        assert_eq!(ka.local_index(), 7);
        assert_eq!(ka.remote_index(), 9);
        assert_eq!(kb.local_index(), 9);
        assert_eq!(kb.remote_index(), 7);
    }

    #[test]
    fn test_psk_mismatch_aborts() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();
        let mut a = Handshake::new(&alice, *bob.public_key(), Some([1u8; KEY_LEN])).unwrap();
        let mut b = Handshake::new(&bob, *alice.public_key(), Some([2u8; KEY_LEN])).unwrap();

        let init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        let opened = open_initiation(&bob, &init).unwrap();
        b.consume_initiation(opened, Instant::now(), Duration::ZERO)
            .unwrap();
        let resp = b.create_response(2).unwrap();

        assert_eq!(
            a.consume_response(&alice, &resp),
            Err(CryptoError::HandshakeAuth)
        );
        assert_eq!(a.state(), HandshakeState::Aborted);
        assert!(a.is_wiped());
    }

    #[test]
    fn test_response_for_other_attempt_ignored() {
        let (alice, bob, mut a, mut b) = pair();

        let init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        let opened = open_initiation(&bob, &init).unwrap();
        b.consume_initiation(opened, Instant::now(), Duration::ZERO)
            .unwrap();
        let mut resp = b.create_response(2).unwrap();
        resp.receiver = 99;

        assert!(matches!(
            a.consume_response(&alice, &resp),
            Err(CryptoError::InvalidState(_))
        ));
        assert_eq!(a.state(), HandshakeState::InitiationSent);
        assert!(!a.is_wiped());
    }

    #[test]
    fn test_rate_limit() {
        let (alice, bob, mut a, mut b) = pair();
        let start = Instant::now();
        let rate = Duration::from_millis(50);

        let init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        b.consume_initiation(open_initiation(&bob, &init).unwrap(), start, rate)
            .unwrap();

        let ts = Timestamp::from_unix(u64::from(u32::MAX), 0);
        let init = a.create_initiation(&alice, 2, ts).unwrap();
        assert_eq!(
            b.consume_initiation(
                open_initiation(&bob, &init).unwrap(),
                start + Duration::from_millis(10),
                rate
            ),
            Err(CryptoError::Replay)
        );
        assert_eq!(b.remote_index(), 1);

        b.consume_initiation(
            open_initiation(&bob, &init).unwrap(),
            start + Duration::from_millis(60),
            rate,
        )
        .unwrap();
        assert_eq!(b.remote_index(), 2);
    }

    #[test]
    fn test_wrong_peer_rejected() {
        let (alice, bob, mut a, _) = pair();
        let carol = Identity::generate().unwrap();
        let mut c = Handshake::new(&bob, *carol.public_key(), None).unwrap();

        let init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        let opened = open_initiation(&bob, &init).unwrap();
        assert_eq!(
            c.consume_initiation(opened, Instant::now(), Duration::ZERO),
            Err(CryptoError::HandshakeAuth)
        );
        assert_eq!(c.state(), HandshakeState::Idle);
    }

    #[test]
    fn test_initiation_for_other_identity() {
        let (alice, _, mut a, _) = pair();
        let carol = Identity::generate().unwrap();

        let init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        assert_eq!(
            open_initiation(&carol, &init).err(),
            Some(CryptoError::HandshakeAuth)
        );
    }

    #[test]
    fn test_tampered_timestamp_rejected_before_peer_state() {
        let (alice, bob, mut a, b) = pair();

        let mut init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        init.encrypted_timestamp[0] ^= 0x80;
        assert_eq!(
            open_initiation(&bob, &init).err(),
            Some(CryptoError::HandshakeAuth)
        );
        assert_eq!(b.state(), HandshakeState::Idle);
        assert_eq!(b.last_timestamp(), Timestamp::ZERO);
    }

    #[test]
    fn test_degenerate_peer_key_rejected() {
        let alice = Identity::generate().unwrap();
        assert_eq!(
            Handshake::new(&alice, PublicKey::default(), None).err(),
            Some(CryptoError::InvalidCurvePoint)
        );
    }

    #[test]
    fn test_zero_ephemeral_rejected() {
        let (alice, bob, mut a, _) = pair();

        let mut init = a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        init.ephemeral = [0u8; KEY_LEN];
        assert_eq!(
            open_initiation(&bob, &init).err(),
            Some(CryptoError::InvalidCurvePoint)
        );
    }

    #[test]
    fn test_begin_session_requires_completion() {
        let (alice, _, mut a, _) = pair();
        assert!(a.begin_session(Instant::now(), u64::MAX).is_err());
        a.create_initiation(&alice, 1, Timestamp::now()).unwrap();
        assert!(a.begin_session(Instant::now(), u64::MAX).is_err());
    }

    #[test]
    fn test_new_rejects_zero_static() {
        let alice = Identity::generate().unwrap();
        assert_eq!(
            Handshake::new(&alice, PublicKey::default(), None).err(),
            Some(CryptoError::InvalidCurvePoint)
        );
    }
}
