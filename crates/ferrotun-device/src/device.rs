//! Device: the local identity, its peers and the packet path.
//!
//! `handle_message` is the receive path for every datagram that arrives on
//! the UDP binding; `encrypt` is the send path for packets read from the
//! interface; `sweep` runs the per-peer timers. None of them blocks on I/O.
//! Callers own the socket and send whatever datagrams come back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use ferrotun_common::Config;
use ferrotun_core::{
    message_type, CookieReply, Initiation, MessageType, RekeyConfig, Response, Timestamp,
    TransportHeader, KEY_LEN, MAX_CONTENT_SIZE, PADDING_MULTIPLE,
};
use ferrotun_crypto::{
    open_initiation, CookieChecker, CryptoError, Handshake, HandshakeState, Identity, Keypair,
    PublicKey,
};

use crate::error::DeviceError;
use crate::index::{IndexEntry, IndexTable};
use crate::link::LinkState;
use crate::load::HandshakeLoad;
use crate::lock;
use crate::peer::{Peer, TimerAction};
use crate::transport::UdpBinding;
use crate::tun::Tun;

/// Result of handling one inbound datagram.
#[derive(Debug)]
pub enum Outcome {
    /// Consumed; nothing to send or deliver.
    Done,
    /// Datagrams to send back to the source address.
    Reply(Vec<BytesMut>),
    /// A decrypted tunnel packet for the interface.
    Data { peer: PublicKey, packet: Vec<u8> },
}

pub struct Device {
    identity: Identity,
    policy: RekeyConfig,
    load: HandshakeLoad,
    peers: RwLock<HashMap<PublicKey, Arc<Peer>>>,
    index: IndexTable,
    checker: Mutex<CookieChecker>,
    link: LinkState,
    binding: UdpBinding,
}

/// Responder half of the handshake once the initiation has been accepted.
fn respond(
    handshake: &mut Handshake,
    index: u32,
    now: Instant,
    reject_after_messages: u64,
) -> Result<(Response, Keypair), CryptoError> {
    let response = handshake.create_response(index)?;
    let keypair = handshake.begin_session(now, reject_after_messages)?;
    Ok((response, keypair))
}

/// Length of the IP packet at the start of `packet`, if it has a
/// recognizable IPv4 or IPv6 header.
fn inner_packet_len(packet: &[u8]) -> Option<usize> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(usize::from(u16::from_be_bytes([packet[2], packet[3]]))),
        6 if packet.len() >= 40 => {
            Some(40 + usize::from(u16::from_be_bytes([packet[4], packet[5]])))
        }
        _ => None,
    }
}

/// Round up to the padding multiple without exceeding the MTU.
fn padded_len(len: usize, mtu: i32) -> usize {
    let rounded = len.div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE;
    match usize::try_from(mtu) {
        Ok(mtu) if mtu > 0 => rounded.min(mtu).max(len),
        _ => rounded,
    }
}

impl Device {
    pub fn new(identity: Identity, config: &Config) -> Self {
        let checker =
            CookieChecker::new(identity.public_key(), config.rekey.cookie_refresh_time());
        Self {
            identity,
            policy: config.rekey.clone(),
            load: HandshakeLoad::new(config.device.under_load_threshold),
            peers: RwLock::new(HashMap::new()),
            index: IndexTable::new(),
            checker: Mutex::new(checker),
            link: LinkState::new(config.device.mtu),
            binding: UdpBinding::new(config.device.listen_port),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn policy(&self) -> &RekeyConfig {
        &self.policy
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn binding(&self) -> &UdpBinding {
        &self.binding
    }

    pub fn index(&self) -> &IndexTable {
        &self.index
    }

    /// Whether handshake traffic at `now` requires cookies.
    pub fn under_load(&self, now: Instant) -> bool {
        self.load.is_under_load(now)
    }

    fn read_peers(&self) -> RwLockReadGuard<'_, HashMap<PublicKey, Arc<Peer>>> {
        match self.peers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_peers(&self) -> RwLockWriteGuard<'_, HashMap<PublicKey, Arc<Peer>>> {
        match self.peers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_peer(
        &self,
        public_key: PublicKey,
        psk: Option<[u8; KEY_LEN]>,
    ) -> Result<Arc<Peer>, DeviceError> {
        let mut peers = self.write_peers();
        if peers.contains_key(&public_key) {
            return Err(DeviceError::DuplicatePeer(public_key.to_hex()));
        }
        let peer = Arc::new(Peer::new(&self.identity, public_key, psk, &self.policy)?);
        peers.insert(public_key, Arc::clone(&peer));
        info!("peer {:?} added", public_key);
        Ok(peer)
    }

    pub fn peer(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        self.read_peers().get(public_key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.read_peers().len()
    }

    /// Remove a peer, wiping its handshake and keypairs.
    pub fn remove_peer(&self, public_key: &PublicKey) -> bool {
        let Some(peer) = self.write_peers().remove(public_key) else {
            return false;
        };
        self.abandon_handshake(&peer);
        peer.keypairs().clear();
        peer.take_staged();
        self.index.remove_peer(public_key);
        info!("peer {:?} removed", public_key);
        true
    }

    fn retire(&self, indices: Vec<u32>) {
        for index in indices {
            self.index.remove(index);
        }
    }

    fn lookup_peer(&self, entry: &IndexEntry) -> Result<Arc<Peer>, DeviceError> {
        self.peer(entry.peer())
            .ok_or_else(|| DeviceError::UnknownPeer(entry.peer().to_hex()))
    }

    /// Start a new handshake with `public_key`, superseding any attempt in flight.
    pub fn create_initiation(
        &self,
        public_key: &PublicKey,
        now: Instant,
    ) -> Result<BytesMut, DeviceError> {
        let peer = self
            .peer(public_key)
            .ok_or_else(|| DeviceError::UnknownPeer(public_key.to_hex()))?;
        self.initiate(&peer, now, false)
    }

    fn initiate(
        &self,
        peer: &Peer,
        now: Instant,
        retransmit: bool,
    ) -> Result<BytesMut, DeviceError> {
        let index = self.index.allocate_handshake(*peer.public_key());
        let result = {
            let mut handshake = peer.handshake();
            let previous = handshake.local_index();
            let result = handshake.create_initiation(&self.identity, index, Timestamp::now());
            if previous != 0 {
                self.index.remove_handshake(previous);
            }
            result
        };
        let initiation = match result {
            Ok(initiation) => initiation,
            Err(e) => {
                self.index.remove(index);
                return Err(e.into());
            }
        };

        let mut message = initiation.encode();
        peer.cookies().stamp(&mut message, now)?;
        peer.note_initiation_sent(now, retransmit);
        debug!("sending handshake initiation to {:?}", peer.public_key());
        Ok(message)
    }

    fn initiate_if_idle(
        &self,
        peer: &Peer,
        now: Instant,
    ) -> Result<Option<BytesMut>, DeviceError> {
        if peer.handshake_state() == HandshakeState::InitiationSent {
            return Ok(None);
        }
        self.initiate(peer, now, false).map(Some)
    }

    fn abandon_handshake(&self, peer: &Peer) {
        let index = {
            let mut handshake = peer.handshake();
            let index = handshake.local_index();
            handshake.abort();
            index
        };
        if index != 0 {
            self.index.remove_handshake(index);
        }
        peer.note_handshake_abandoned();
    }

    /// Validate MAC trailers and count the message toward handshake load.
    /// Under load, a message without a valid mac2 is answered with a cookie
    /// reply before any further work is done.
    fn check_macs(
        &self,
        packet: &[u8],
        sender: u32,
        src: SocketAddr,
        now: Instant,
    ) -> Result<Option<BytesMut>, DeviceError> {
        let mut checker = lock(&self.checker);
        if !checker.check_mac1(packet) {
            return Err(CryptoError::HandshakeAuth.into());
        }
        if self.load.record(now) && !checker.check_mac2(packet, &src, now)? {
            let reply = checker.create_reply(packet, sender, &src, now)?;
            debug!("under load, sending cookie reply to {}", src);
            return Ok(Some(reply.encode()));
        }
        Ok(None)
    }

    /// Process one datagram received from `src`.
    ///
    /// Errors mean the datagram was dropped; they are for local logging and
    /// must never be answered on the wire.
    pub fn handle_message(
        &self,
        packet: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Outcome, DeviceError> {
        match message_type(packet)? {
            MessageType::Initiation => self.handle_initiation(packet, src, now),
            MessageType::Response => self.handle_response(packet, src, now),
            MessageType::CookieReply => self.handle_cookie_reply(packet, now),
            MessageType::Transport => self.handle_transport(packet, src, now),
        }
    }

    fn handle_initiation(
        &self,
        packet: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Outcome, DeviceError> {
        let msg = Initiation::decode(packet)?;
        if let Some(reply) = self.check_macs(packet, msg.sender, src, now)? {
            return Ok(Outcome::Reply(vec![reply]));
        }

        let opened = open_initiation(&self.identity, &msg)?;
        let peer = self
            .peer(opened.remote_static())
            .ok_or_else(|| DeviceError::UnknownPeer(opened.remote_static().to_hex()))?;

        let index = self.index.allocate_handshake(*peer.public_key());
        let result = {
            let mut handshake = peer.handshake();
            let previous = handshake.local_index();
            let rate = self.policy.handshake_initiation_rate();
            match handshake.consume_initiation(opened, now, rate) {
                Ok(()) => {
                    if previous != 0 {
                        self.index.remove_handshake(previous);
                    }
                    respond(&mut handshake, index, now, self.policy.reject_after_messages)
                }
                Err(e) => Err(e),
            }
        };
        let (response, keypair) = match result {
            Ok(done) => done,
            Err(e) => {
                self.index.remove(index);
                return Err(e.into());
            }
        };

        let keypair = Arc::new(keypair);
        self.index.install_keypair(&keypair, *peer.public_key());
        let retired = peer.keypairs().install(Arc::clone(&keypair), &self.policy, now);
        self.retire(retired);

        peer.set_endpoint(src);
        peer.note_received(now);
        peer.note_handshake_complete(now);

        let mut message = response.encode();
        peer.cookies().stamp(&mut message, now)?;
        peer.note_sent(now);
        debug!("answered handshake initiation from {:?}", peer.public_key());
        Ok(Outcome::Reply(vec![message]))
    }

    fn handle_response(
        &self,
        packet: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Outcome, DeviceError> {
        let msg = Response::decode(packet)?;
        if let Some(reply) = self.check_macs(packet, msg.sender, src, now)? {
            return Ok(Outcome::Reply(vec![reply]));
        }

        let entry = match self.index.lookup(msg.receiver) {
            Some(entry @ IndexEntry::Handshake { .. }) => entry,
            _ => return Err(CryptoError::UnknownIndex(msg.receiver).into()),
        };
        let peer = self.lookup_peer(&entry)?;

        let (result, aborted) = {
            let mut handshake = peer.handshake();
            let result = handshake
                .consume_response(&self.identity, &msg)
                .and_then(|()| handshake.begin_session(now, self.policy.reject_after_messages));
            (result, handshake.state() == HandshakeState::Aborted)
        };
        let keypair = match result {
            Ok(keypair) => Arc::new(keypair),
            Err(e) => {
                if aborted {
                    self.index.remove(msg.receiver);
                    peer.note_handshake_abandoned();
                }
                return Err(e.into());
            }
        };

        // The response proves the responder holds the new keys
        self.index.install_keypair(&keypair, *peer.public_key());
        let mut retired = peer.keypairs().install(Arc::clone(&keypair), &self.policy, now);
        retired.extend(peer.keypairs().confirm(&keypair));
        self.retire(retired);

        peer.set_endpoint(src);
        peer.note_received(now);
        peer.note_handshake_complete(now);
        info!("handshake with {:?} complete", peer.public_key());

        let mut datagrams = Vec::new();
        for staged in peer.take_staged() {
            datagrams.push(self.seal_padded(&keypair, &staged, now)?);
        }
        if datagrams.is_empty() {
            datagrams.push(keypair.seal(&[], &self.policy, now)?);
        }
        peer.note_sent(now);
        Ok(Outcome::Reply(datagrams))
    }

    fn handle_cookie_reply(&self, packet: &[u8], now: Instant) -> Result<Outcome, DeviceError> {
        let msg = CookieReply::decode(packet)?;
        let entry = self
            .index
            .lookup(msg.receiver)
            .ok_or(CryptoError::UnknownIndex(msg.receiver))?;
        let peer = self.lookup_peer(&entry)?;
        peer.cookies().consume_reply(&msg, now)?;
        Ok(Outcome::Done)
    }

    fn handle_transport(
        &self,
        packet: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Outcome, DeviceError> {
        let (header, ciphertext) = TransportHeader::decode(packet)?;
        let (public_key, keypair) = match self.index.lookup(header.receiver) {
            Some(IndexEntry::Keypair { peer, keypair }) => (peer, keypair),
            _ => return Err(CryptoError::UnknownIndex(header.receiver).into()),
        };
        let peer = self
            .peer(&public_key)
            .ok_or_else(|| DeviceError::UnknownPeer(public_key.to_hex()))?;

        let mut plaintext = keypair.open(header.counter, ciphertext, &self.policy, now)?;

        // First packet under `next` confirms the initiator has it too
        let retired = peer.keypairs().confirm(&keypair);
        self.retire(retired);

        peer.set_endpoint(src);
        peer.note_received(now);

        if plaintext.is_empty() {
            debug!("keepalive from {:?}", public_key);
            return Ok(Outcome::Done);
        }

        let len = inner_packet_len(&plaintext)
            .filter(|len| *len <= plaintext.len())
            .unwrap_or(plaintext.len());
        plaintext.truncate(len);
        Ok(Outcome::Data {
            peer: public_key,
            packet: plaintext,
        })
    }

    fn seal_padded(
        &self,
        keypair: &Keypair,
        packet: &[u8],
        now: Instant,
    ) -> Result<BytesMut, CryptoError> {
        let mut padded = packet.to_vec();
        padded.resize(padded_len(packet.len(), self.link.mtu()), 0);
        keypair.seal(&padded, &self.policy, now)
    }

    /// Encrypt a packet read from the interface for `public_key`.
    ///
    /// Returns the datagrams to send to the peer's endpoint. Without a
    /// usable keypair the packet is staged and a handshake started; when
    /// the current keypair is due for rekeying an initiation follows the
    /// data.
    pub fn encrypt(
        &self,
        public_key: &PublicKey,
        packet: &[u8],
        now: Instant,
    ) -> Result<Vec<BytesMut>, DeviceError> {
        if packet.len() > MAX_CONTENT_SIZE {
            return Err(DeviceError::PacketTooLarge(packet.len()));
        }
        let peer = self
            .peer(public_key)
            .ok_or_else(|| DeviceError::UnknownPeer(public_key.to_hex()))?;

        let mut datagrams = Vec::new();
        let usable = peer
            .keypairs()
            .current()
            .filter(|current| !current.is_expired(&self.policy, now));
        let Some(current) = usable else {
            peer.stage(packet.to_vec());
            datagrams.extend(self.initiate_if_idle(&peer, now)?);
            return Ok(datagrams);
        };

        let mut queue = peer.take_staged();
        queue.push(packet.to_vec());
        let mut pending = queue.into_iter();
        while let Some(next) = pending.next() {
            match self.seal_padded(&current, &next, now) {
                Ok(message) => datagrams.push(message),
                Err(CryptoError::RekeyExpired) => {
                    debug!("current keypair for {:?} expired, staging", public_key);
                    peer.stage(next);
                    for rest in pending.by_ref() {
                        peer.stage(rest);
                    }
                    if !datagrams.is_empty() {
                        peer.note_sent(now);
                    }
                    datagrams.extend(self.initiate_if_idle(&peer, now)?);
                    return Ok(datagrams);
                }
                Err(e) => return Err(e.into()),
            }
        }
        peer.note_sent(now);

        if current.needs_rekey(&self.policy, now) {
            datagrams.extend(self.initiate_if_idle(&peer, now)?);
        }
        Ok(datagrams)
    }

    /// Run every peer's timers; returns datagrams with their destinations.
    pub fn sweep(&self, now: Instant) -> Vec<(SocketAddr, BytesMut)> {
        let peers: Vec<Arc<Peer>> = self.read_peers().values().cloned().collect();
        let mut out = Vec::new();

        for peer in peers {
            let retired = peer.keypairs().expire(&self.policy, now);
            self.retire(retired);

            let mut datagrams = Vec::new();
            for action in peer.tick(now, &self.policy) {
                match action {
                    TimerAction::RetransmitHandshake | TimerAction::Rekey => {
                        let retransmit = action == TimerAction::RetransmitHandshake;
                        match self.initiate(&peer, now, retransmit) {
                            Ok(message) => datagrams.push(message),
                            Err(e) => warn!("initiation to {:?} failed: {}", peer.public_key(), e),
                        }
                    }
                    TimerAction::AbandonHandshake => {
                        debug!("handshake with {:?} timed out", peer.public_key());
                        self.abandon_handshake(&peer);
                        peer.take_staged();
                    }
                    TimerAction::SendKeepalive => {
                        if let Some(current) = peer.keypairs().current() {
                            match current.seal(&[], &self.policy, now) {
                                Ok(message) => {
                                    datagrams.push(message);
                                    peer.note_sent(now);
                                }
                                Err(e) => {
                                    debug!("keepalive to {:?} failed: {}", peer.public_key(), e)
                                }
                            }
                        }
                    }
                    TimerAction::ZeroKeys => {
                        debug!("zeroing all keys of {:?}", peer.public_key());
                        self.abandon_handshake(&peer);
                        self.retire(peer.keypairs().clear());
                        peer.take_staged();
                        peer.forget_handshake_time();
                    }
                }
            }

            if peer.staged_len() > 0 {
                if let Some(current) = peer.keypairs().current() {
                    for staged in peer.take_staged() {
                        match self.seal_padded(&current, &staged, now) {
                            Ok(message) => datagrams.push(message),
                            Err(e) => debug!("staged packet dropped: {}", e),
                        }
                    }
                    peer.note_sent(now);
                }
            }

            match peer.endpoint() {
                Some(endpoint) => out.extend(datagrams.into_iter().map(|d| (endpoint, d))),
                None if !datagrams.is_empty() => debug!(
                    "no endpoint for {:?}, dropping {} datagrams",
                    peer.public_key(),
                    datagrams.len()
                ),
                None => {}
            }
        }

        out
    }

    /// Drive the link state from `tun`'s events until the interface closes.
    pub async fn run_event_reader(&self, tun: &dyn Tun) {
        let Some(events) = tun.events() else {
            warn!("event channel already taken");
            return;
        };
        crate::link::run_event_reader(events, tun, &self.link, &self.binding).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0, 1420), 0);
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(1419, 1420), 1420);
        assert_eq!(padded_len(1500, 1420), 1500);
        assert_eq!(padded_len(17, 0), 32);
    }

    #[test]
    fn test_inner_packet_len() {
        let mut v4 = vec![0u8; 32];
        v4[0] = 0x45;
        v4[3] = 24;
        assert_eq!(inner_packet_len(&v4), Some(24));

        let mut v6 = vec![0u8; 48];
        v6[0] = 0x60;
        v6[5] = 8;
        assert_eq!(inner_packet_len(&v6), Some(48));

        assert_eq!(inner_packet_len(b"hello"), None);
        assert_eq!(inner_packet_len(&[]), None);
    }
}
