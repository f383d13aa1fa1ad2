//! Two devices talking through `handle_message` without sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ferrotun_common::Config;
use ferrotun_core::{MessageType, RekeyConfig, COOKIE_LEN};
use ferrotun_crypto::{CryptoError, Identity, Keypair};
use ferrotun_device::{Device, DeviceError, Outcome, TimerAction};

struct Pair {
    a: Device,
    b: Device,
    addr_a: SocketAddr,
    addr_b: SocketAddr,
}

fn config(rekey: RekeyConfig, under_load_threshold: usize) -> Config {
    let mut config = Config {
        rekey,
        ..Config::default()
    };
    config.device.under_load_threshold = under_load_threshold;
    config
}

fn quiet_policy() -> RekeyConfig {
    RekeyConfig {
        handshake_initiation_rate_ms: 0,
        ..RekeyConfig::default()
    }
}

fn pair_with(config_a: &Config, config_b: &Config) -> Pair {
    let a = Device::new(Identity::generate().unwrap(), config_a);
    let b = Device::new(Identity::generate().unwrap(), config_b);
    a.add_peer(*b.public_key(), None).unwrap();
    b.add_peer(*a.public_key(), None).unwrap();
    Pair {
        a,
        b,
        addr_a: "127.0.0.1:40001".parse().unwrap(),
        addr_b: "127.0.0.1:40002".parse().unwrap(),
    }
}

fn pair() -> Pair {
    let config = config(quiet_policy(), 512);
    pair_with(&config, &config)
}

fn replies(outcome: Outcome) -> Vec<BytesMut> {
    match outcome {
        Outcome::Reply(datagrams) => datagrams,
        other => panic!("expected a reply, got {:?}", other),
    }
}

fn kind(datagram: &[u8]) -> MessageType {
    ferrotun_core::message_type(datagram).unwrap()
}

/// A minimal IPv4 packet so the receiver can strip padding.
fn ipv4_packet(payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet.extend_from_slice(payload);
    packet
}

/// Run a full handshake initiated by `a`, including the confirming keepalive.
fn handshake(p: &Pair, now: Instant) {
    let peer_b = *p.b.public_key();
    let init = p.a.create_initiation(&peer_b, now).unwrap();
    assert_eq!(kind(&init), MessageType::Initiation);

    let response = replies(p.b.handle_message(&init, p.addr_a, now).unwrap());
    assert_eq!(response.len(), 1);
    assert_eq!(kind(&response[0]), MessageType::Response);

    let confirm = replies(p.a.handle_message(&response[0], p.addr_b, now).unwrap());
    assert_eq!(confirm.len(), 1);
    assert_eq!(kind(&confirm[0]), MessageType::Transport);

    assert!(matches!(
        p.b.handle_message(&confirm[0], p.addr_a, now).unwrap(),
        Outcome::Done
    ));
}

fn current(device: &Device, peer: &Device) -> Arc<Keypair> {
    device
        .peer(peer.public_key())
        .unwrap()
        .keypairs()
        .current()
        .unwrap()
}

#[test]
fn test_full_handshake_and_data() {
    let p = pair();
    let now = Instant::now();
    handshake(&p, now);

    let ka = current(&p.a, &p.b);
    let kb = current(&p.b, &p.a);
    assert_eq!(ka.remote_index(), kb.local_index());
    assert_eq!(kb.remote_index(), ka.local_index());
    assert_eq!(p.a.peer(p.b.public_key()).unwrap().endpoint(), Some(p.addr_b));
    assert_eq!(p.b.peer(p.a.public_key()).unwrap().endpoint(), Some(p.addr_a));

    let packet = ipv4_packet(b"hello through the tunnel");
    let sent = p.a.encrypt(p.b.public_key(), &packet, now).unwrap();
    assert_eq!(sent.len(), 1);
    // Padded to a multiple of 16 plus header and tag
    assert_eq!((sent[0].len() - 32) % 16, 0);

    match p.b.handle_message(&sent[0], p.addr_a, now).unwrap() {
        Outcome::Data { peer, packet: received } => {
            assert_eq!(&peer, p.a.public_key());
            assert_eq!(received, packet);
        }
        other => panic!("expected data, got {:?}", other),
    }

    let back = ipv4_packet(b"and back");
    let sent = p.b.encrypt(p.a.public_key(), &back, now).unwrap();
    match p.a.handle_message(&sent[0], p.addr_b, now).unwrap() {
        Outcome::Data { packet, .. } => assert_eq!(packet, back),
        other => panic!("expected data, got {:?}", other),
    }
}

#[test]
fn test_transport_replay_dropped() {
    let p = pair();
    let now = Instant::now();
    handshake(&p, now);

    let sent = p.a.encrypt(p.b.public_key(), &ipv4_packet(b"once"), now).unwrap();
    p.b.handle_message(&sent[0], p.addr_a, now).unwrap();
    assert!(matches!(
        p.b.handle_message(&sent[0], p.addr_a, now),
        Err(DeviceError::Crypto(CryptoError::Replay))
    ));
}

#[test]
fn test_replayed_initiation_dropped() {
    let p = pair();
    let now = Instant::now();

    let init = p.a.create_initiation(p.b.public_key(), now).unwrap();
    p.b.handle_message(&init, p.addr_a, now).unwrap();
    let kb = current(&p.b, &p.a);

    assert!(matches!(
        p.b.handle_message(&init, p.addr_a, now + Duration::from_secs(1)),
        Err(DeviceError::Crypto(CryptoError::Replay))
    ));
    assert!(Arc::ptr_eq(&kb, &current(&p.b, &p.a)));
    assert!(p.b.peer(p.a.public_key()).unwrap().keypairs().next().is_none());
}

#[test]
fn test_unknown_peer_and_bad_mac() {
    let p = pair();
    let stranger = Device::new(Identity::generate().unwrap(), &Config::default());
    stranger.add_peer(*p.b.public_key(), None).unwrap();
    let now = Instant::now();

    let init = stranger.create_initiation(p.b.public_key(), now).unwrap();
    assert!(matches!(
        p.b.handle_message(&init, p.addr_a, now),
        Err(DeviceError::UnknownPeer(_))
    ));

    let mut init = p.a.create_initiation(p.b.public_key(), now).unwrap();
    let last = init.len() - 17;
    init[last] ^= 1;
    assert!(matches!(
        p.b.handle_message(&init, p.addr_a, now),
        Err(DeviceError::Crypto(CryptoError::HandshakeAuth))
    ));

    assert!(matches!(
        p.b.handle_message(&[9, 0, 0, 0], p.addr_a, now),
        Err(DeviceError::Crypto(CryptoError::MalformedMessage(_)))
    ));
}

#[test]
fn test_rekey_demotes_until_confirmed() {
    let policy = RekeyConfig {
        rekey_after_messages: 4,
        ..quiet_policy()
    };
    let config = config(policy, 512);
    let p = pair_with(&config, &config);
    let start = Instant::now();
    handshake(&p, start);

    let ka1 = current(&p.a, &p.b);
    let kb1 = current(&p.b, &p.a);

    // Send until the counter reaches the threshold and an initiation follows
    let mut late = None;
    let mut initiation = None;
    for i in 0..8u8 {
        let mut sent = p.a.encrypt(p.b.public_key(), &ipv4_packet(&[i]), start).unwrap();
        if sent.len() == 2 {
            assert_eq!(kind(&sent[1]), MessageType::Initiation);
            initiation = sent.pop();
            late = sent.pop();
            break;
        }
        p.b.handle_message(&sent[0], p.addr_a, start).unwrap();
    }
    let initiation = initiation.expect("rekey threshold never triggered a handshake");
    let late = late.unwrap();
    assert!(ka1.needs_rekey(p.a.policy(), start));

    let now = start + Duration::from_secs(1);
    let response = replies(p.b.handle_message(&initiation, p.addr_a, now).unwrap());

    // Responder keeps using the old keypair until the initiator confirms
    let peer_a = p.b.peer(p.a.public_key()).unwrap();
    assert!(Arc::ptr_eq(&kb1, &peer_a.keypairs().current().unwrap()));
    let kb2 = peer_a.keypairs().next().unwrap();

    let confirm = replies(p.a.handle_message(&response[0], p.addr_b, now).unwrap());
    let peer_b = p.a.peer(p.b.public_key()).unwrap();
    let ka2 = peer_b.keypairs().current().unwrap();
    assert!(!Arc::ptr_eq(&ka1, &ka2));
    assert!(Arc::ptr_eq(&ka1, &peer_b.keypairs().previous().unwrap()));
    assert!(!ka1.is_wiped());

    p.b.handle_message(&confirm[0], p.addr_a, now).unwrap();
    assert!(Arc::ptr_eq(&kb2, &peer_a.keypairs().current().unwrap()));
    assert!(Arc::ptr_eq(&kb1, &peer_a.keypairs().previous().unwrap()));
    assert!(!kb1.is_wiped());

    // A straggler sealed under the old keypair still decrypts
    match p.b.handle_message(&late, p.addr_a, now).unwrap() {
        Outcome::Data { packet, .. } => assert_eq!(packet.len(), 21),
        other => panic!("expected data, got {:?}", other),
    }

    // The next rotation finally discards the oldest keypair
    let later = now + Duration::from_secs(1);
    let init = p.a.create_initiation(p.b.public_key(), later).unwrap();
    let response = replies(p.b.handle_message(&init, p.addr_a, later).unwrap());
    p.a.handle_message(&response[0], p.addr_b, later).unwrap();
    assert!(ka1.is_wiped());
    assert!(p.a.index().lookup(ka1.local_index()).is_none());
}

#[test]
fn test_cookie_challenge_under_load() {
    let a_config = config(quiet_policy(), 512);
    let b_config = config(quiet_policy(), 0);
    let p = pair_with(&a_config, &b_config);
    let now = Instant::now();

    let init = p.a.create_initiation(p.b.public_key(), now).unwrap();
    let challenge = replies(p.b.handle_message(&init, p.addr_a, now).unwrap());
    assert_eq!(challenge.len(), 1);
    assert_eq!(kind(&challenge[0]), MessageType::CookieReply);
    assert_eq!(challenge[0].len(), 8 + 24 + COOKIE_LEN + 16);

    // No per-attempt state was committed on the responder
    assert!(p.b.index().is_empty());
    assert!(p.b.peer(p.a.public_key()).unwrap().keypairs().is_empty());

    assert!(matches!(
        p.a.handle_message(&challenge[0], p.addr_b, now).unwrap(),
        Outcome::Done
    ));

    let retry = p.a.create_initiation(p.b.public_key(), now).unwrap();
    let response = replies(p.b.handle_message(&retry, p.addr_a, now).unwrap());
    assert_eq!(kind(&response[0]), MessageType::Response);

    // The cookie is bound to the source address
    let elsewhere: SocketAddr = "127.0.0.1:40099".parse().unwrap();
    let again = p.a.create_initiation(p.b.public_key(), now).unwrap();
    let challenge = replies(p.b.handle_message(&again, elsewhere, now).unwrap());
    assert_eq!(kind(&challenge[0]), MessageType::CookieReply);
}

#[test]
fn test_initiation_flood_triggers_cookies() {
    let config = Config::default();
    let threshold = config.device.under_load_threshold;
    let victim = Device::new(Identity::generate().unwrap(), &config);
    let src: SocketAddr = "198.51.100.7:51820".parse().unwrap();
    let now = Instant::now();

    let mut first_cookie = None;
    for i in 0..threshold + 40 {
        let attacker = Device::new(Identity::generate().unwrap(), &config);
        attacker.add_peer(*victim.public_key(), None).unwrap();
        let init = attacker.create_initiation(victim.public_key(), now).unwrap();

        match victim.handle_message(&init, src, now) {
            Ok(Outcome::Reply(reply)) => {
                assert_eq!(kind(&reply[0]), MessageType::CookieReply);
                first_cookie.get_or_insert(i);
            }
            Err(DeviceError::UnknownPeer(_)) => assert!(first_cookie.is_none()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(first_cookie, Some(threshold - 1));
    assert!(victim.under_load(now));

    // A real peer has to echo a cookie while the flood lasts
    let peer = Device::new(Identity::generate().unwrap(), &config);
    peer.add_peer(*victim.public_key(), None).unwrap();
    victim.add_peer(*peer.public_key(), None).unwrap();
    let peer_addr: SocketAddr = "203.0.113.9:40000".parse().unwrap();

    let init = peer.create_initiation(victim.public_key(), now).unwrap();
    let challenge = replies(victim.handle_message(&init, peer_addr, now).unwrap());
    assert_eq!(kind(&challenge[0]), MessageType::CookieReply);
    peer.handle_message(&challenge[0], src, now).unwrap();

    let retry = peer.create_initiation(victim.public_key(), now).unwrap();
    let response = replies(victim.handle_message(&retry, peer_addr, now).unwrap());
    assert_eq!(kind(&response[0]), MessageType::Response);

    assert!(!victim.under_load(now + Duration::from_secs(2)));
}

#[test]
fn test_expired_current_keeps_staged_packets() {
    let p = pair();
    let start = Instant::now();
    handshake(&p, start);

    let later = start + p.a.policy().reject_after_time() + Duration::from_secs(1);
    let first = ipv4_packet(b"first");
    let second = ipv4_packet(b"second");

    let sent = p.a.encrypt(p.b.public_key(), &first, later).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(kind(&sent[0]), MessageType::Initiation);
    assert!(p.a.encrypt(p.b.public_key(), &second, later).unwrap().is_empty());
    assert_eq!(p.a.peer(p.b.public_key()).unwrap().staged_len(), 2);

    let response = replies(p.b.handle_message(&sent[0], p.addr_a, later).unwrap());
    let flushed = replies(p.a.handle_message(&response[0], p.addr_b, later).unwrap());
    assert_eq!(flushed.len(), 2);

    let mut delivered = Vec::new();
    for datagram in flushed {
        match p.b.handle_message(&datagram, p.addr_a, later).unwrap() {
            Outcome::Data { packet, .. } => delivered.push(packet),
            other => panic!("expected data, got {:?}", other),
        }
    }
    assert_eq!(delivered, vec![first, second]);
}

#[test]
fn test_staged_packets_flushed_after_handshake() {
    let p = pair();
    let now = Instant::now();

    let packet = ipv4_packet(b"queued");
    let sent = p.a.encrypt(p.b.public_key(), &packet, now).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(kind(&sent[0]), MessageType::Initiation);
    assert_eq!(p.a.peer(p.b.public_key()).unwrap().staged_len(), 1);

    // A second packet while the handshake is in flight does not re-initiate
    assert!(p.a.encrypt(p.b.public_key(), &packet, now).unwrap().is_empty());

    let response = replies(p.b.handle_message(&sent[0], p.addr_a, now).unwrap());
    let flushed = replies(p.a.handle_message(&response[0], p.addr_b, now).unwrap());
    assert_eq!(flushed.len(), 2);
    for datagram in flushed {
        match p.b.handle_message(&datagram, p.addr_a, now).unwrap() {
            Outcome::Data { packet: received, .. } => assert_eq!(received, packet),
            other => panic!("expected data, got {:?}", other),
        }
    }
}

#[test]
fn test_remove_peer_wipes() {
    let p = pair();
    let now = Instant::now();
    handshake(&p, now);

    let ka = current(&p.a, &p.b);
    assert!(p.a.remove_peer(p.b.public_key()));
    assert!(ka.is_wiped());
    assert!(p.a.index().is_empty());
    assert_eq!(p.a.peer_count(), 0);
    assert!(!p.a.remove_peer(p.b.public_key()));
}

#[test]
fn test_sweep_retransmits_then_abandons() {
    let p = pair();
    let policy = p.a.policy().clone();
    let start = Instant::now();

    p.a.create_initiation(p.b.public_key(), start).unwrap();
    // No endpoint known yet, so nothing is sent
    assert!(p.a.sweep(start + policy.rekey_timeout()).is_empty());

    let peer = p.a.peer(p.b.public_key()).unwrap();
    peer.set_endpoint(p.addr_b);
    let due = p.a.sweep(start + policy.rekey_timeout() * 2);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, p.addr_b);
    assert_eq!(kind(&due[0].1), MessageType::Initiation);
    assert_eq!(p.a.index().pending_handshakes(), 1);

    assert!(p.a.sweep(start + policy.rekey_attempt_time()).is_empty());
    assert_eq!(p.a.index().pending_handshakes(), 0);
    assert!(peer.tick(start + policy.rekey_attempt_time(), &policy).is_empty());
}

#[test]
fn test_sweep_keepalive_and_expiry() {
    let p = pair();
    let policy = p.b.policy().clone();
    let start = Instant::now();
    handshake(&p, start);

    // b receives data a second later and has nothing to send back
    let received = start + Duration::from_secs(1);
    let sent = p.a.encrypt(p.b.public_key(), &ipv4_packet(b"ping"), received).unwrap();
    p.b.handle_message(&sent[0], p.addr_a, received).unwrap();

    let peer_a = p.b.peer(p.a.public_key()).unwrap();
    let quiet = received + policy.keepalive_timeout();
    assert!(peer_a.tick(quiet - Duration::from_secs(1), &policy).is_empty());
    assert_eq!(peer_a.tick(quiet, &policy), vec![TimerAction::SendKeepalive]);
    let due = p.b.sweep(quiet);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, p.addr_a);
    assert!(peer_a.tick(quiet, &policy).is_empty());
    match p.a.handle_message(&due[0].1, p.addr_b, quiet).unwrap() {
        Outcome::Done => {}
        other => panic!("expected a keepalive, got {:?}", other),
    }

    let kb = current(&p.b, &p.a);
    p.b.sweep(start + policy.reject_after_time());
    assert!(kb.is_wiped());
    assert!(peer_a.keypairs().is_empty());
    assert!(p.b.index().lookup(kb.local_index()).is_none());

    p.b.sweep(start + policy.reject_after_time() * 3);
    assert!(peer_a.last_handshake().is_none());
}

#[test]
fn test_rekey_after_time_initiates() {
    let p = pair();
    let policy = p.a.policy().clone();
    let start = Instant::now();
    handshake(&p, start);

    let due = p.a.sweep(start + policy.rekey_after_time());
    assert!(due
        .iter()
        .any(|(_, datagram)| kind(datagram) == MessageType::Initiation));
}
