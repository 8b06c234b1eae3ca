// End-to-end peer/server exchange scenarios over the loopback tunnel.
#![cfg(test)]

use crate::{
    config::{IdentityPolicy, PeerConfig, ProvisioningMode, ServerConfig},
    inner::{EAP_TYPE_MSCHAPV2, EAP_TYPE_PWD},
    pac::{
        self,
        opaque::{self, PacOpaquePlain, WRAP_KEY_LEN},
        PacEntry, PacKey, PAC_KEY_LEN, PAC_TYPE_TUNNEL,
    },
    peer::{PeerState, SessionStatus, TeapPeer},
    server::{PasswordVerifier, ServerState, TeapServer},
    test_support::{loopback_pair, FakeAuthenticator, FakePeerMethod},
    tlv::{self, Status},
    tunnel::TlsTunnel,
    wire::{self, TeapFrame, TEAP_VERSION},
};

const SUITE_SHA256: u16 = 0xC02F;
const SUITE_ANON: u16 = 0x00A6;
const WRAP_KEY: [u8; WRAP_KEY_LEN] = [0x42; WRAP_KEY_LEN];

fn peer_config() -> PeerConfig {
    PeerConfig {
        identity: "alice".into(),
        password: Some("secret".into()),
        allowed_inner_types: vec![EAP_TYPE_MSCHAPV2, EAP_TYPE_PWD],
        ..PeerConfig::default()
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        authority_id: "srv1".into(),
        authority_id_info: "Example Authority".into(),
        ..ServerConfig::default()
    }
}

fn check_password() -> PasswordVerifier {
    Box::new(|user: &[u8], pass: &[u8]| user == b"alice" && pass == b"secret")
}

/// Shuttles messages between the two machines until one side stops.
fn run_exchange(
    peer: &mut TeapPeer,
    server: &mut TeapServer,
    limit: usize,
) -> (SessionStatus, SessionStatus) {
    let mut msg = server.initiate().expect("start");
    let mut peer_status = SessionStatus::InProgress;
    let mut server_status = SessionStatus::InProgress;

    for _ in 0..limit {
        let peer_out = peer.process(&msg).expect("peer process");
        peer_status = peer_out.status;
        let Some(peer_resp) = peer_out.response else {
            break;
        };
        if peer_status == SessionStatus::Failure {
            server_status = server.process(&peer_resp).expect("server informed").status;
            break;
        }

        let server_out = server.process(&peer_resp).expect("server process");
        server_status = server_out.status;
        let Some(next) = server_out.response else {
            break;
        };
        if server_status == SessionStatus::Failure {
            peer_status = peer.process(&next).expect("peer informed").status;
            break;
        }
        msg = next;
    }
    (peer_status, server_status)
}

#[test]
fn basic_password_auth_succeeds() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);
    assert_eq!(peer.state(), PeerState::Success);
    assert_eq!(server.state(), ServerState::Success);

    let peer_msk = peer.msk().expect("peer msk");
    let server_msk = server.msk().expect("server msk");
    assert_eq!(peer_msk, server_msk);
    assert_eq!(peer.emsk().expect("peer emsk"), server.emsk().expect("server emsk"));
    assert_ne!(peer_msk.as_slice(), peer.emsk().expect("emsk").as_slice());
}

#[test]
fn wrong_password_fails() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut config = peer_config();
    config.password = Some("wrong".into());
    let mut peer = TeapPeer::new(config, Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    let (peer_status, _server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Failure);
    assert_eq!(peer.state(), PeerState::Failure);
    assert!(peer.msk().is_none());
}

#[test]
fn inner_eap_with_crypto_binding_succeeds() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let msk = vec![0x11; 64];
    let emsk = vec![0x22; 64];

    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    peer.add_inner_method(Box::new(
        FakePeerMethod::new(EAP_TYPE_MSCHAPV2, msk.clone()).with_emsk(emsk.clone()),
    ));

    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");
    server.add_inner_authenticator(Box::new(
        FakeAuthenticator::new(EAP_TYPE_MSCHAPV2, msk)
            .with_emsk(emsk)
            .with_rounds(2),
    ));

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);
    assert_eq!(peer.msk().expect("peer msk"), server.msk().expect("server msk"));
}

#[test]
fn user_then_machine_sequencing_succeeds() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let user_msk = vec![0x33; 64];
    let machine_msk = vec![0x44; 64];

    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    peer.add_inner_method(Box::new(FakePeerMethod::new(EAP_TYPE_MSCHAPV2, user_msk.clone())));
    peer.add_inner_method(Box::new(FakePeerMethod::new(EAP_TYPE_PWD, machine_msk.clone())));

    let mut config = server_config();
    config.identity_policy = IdentityPolicy::UserThenMachine;
    let mut server =
        TeapServer::new(config, Box::new(server_tls), WRAP_KEY, check_password()).expect("server");
    server.add_inner_authenticator(Box::new(FakeAuthenticator::new(EAP_TYPE_MSCHAPV2, user_msk)));
    server.add_inner_authenticator(Box::new(FakeAuthenticator::new(EAP_TYPE_PWD, machine_msk)));

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 24);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);
    assert_eq!(peer.msk().expect("peer msk"), server.msk().expect("server msk"));
}

#[test]
fn inner_method_failure_fails_both_sides() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    peer.add_inner_method(Box::new(FakePeerMethod::new(EAP_TYPE_MSCHAPV2, vec![0x55; 64])));

    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");
    server.add_inner_authenticator(Box::new(
        FakeAuthenticator::new(EAP_TYPE_MSCHAPV2, vec![0x55; 64]).rejecting(),
    ));

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Failure);
    assert_eq!(server_status, SessionStatus::Failure);
}

#[test]
fn unsupported_inner_method_naks_and_fails() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    // Peer has no inner methods registered at all.
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");
    server.add_inner_authenticator(Box::new(FakeAuthenticator::new(
        EAP_TYPE_MSCHAPV2,
        vec![0x66; 64],
    )));

    let (_peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(server_status, SessionStatus::Failure);
}

#[test]
fn tampered_compound_mac_is_tunnel_compromise() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    // Run until the server issues its Result + Crypto-Binding message.
    let mut msg = server.initiate().expect("start");
    let mut binding_msg = None;
    for _ in 0..16 {
        let peer_out = peer.process(&msg).expect("peer");
        let Some(peer_resp) = peer_out.response else {
            break;
        };
        let server_out = server.process(&peer_resp).expect("server");
        let Some(next) = server_out.response else {
            break;
        };
        if server.state() == ServerState::CryptoBinding {
            binding_msg = Some(next);
            break;
        }
        msg = next;
    }
    let mut binding_msg = binding_msg.expect("binding message");

    // The Crypto-Binding TLV is last; its final 20 bytes are the MSK
    // compound MAC. Flip one bit of it.
    let last = binding_msg.len() - 1;
    binding_msg[last] ^= 0x01;

    let out = peer.process(&binding_msg).expect("peer rejects");
    assert_eq!(out.status, SessionStatus::Failure);
    assert_eq!(peer.state(), PeerState::Failure);

    // The failure response carries Result(Failure) + Error(2001); loopback
    // records are transparent, so strip the 4-byte record tag directly.
    let frame = TeapFrame::parse(out.response.as_deref().expect("response")).expect("frame");
    let parsed = tlv::parse_phase2(&frame.tls_data[4..]).expect("tlvs");
    assert_eq!(parsed.result, Some(Status::Failure));
    assert_eq!(parsed.error_code, Some(tlv::ERROR_TUNNEL_COMPROMISE));
}

#[test]
fn tampered_nonce_echo_rejected_by_server() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    // Run until the peer answers the binding request.
    let mut msg = server.initiate().expect("start");
    let mut peer_binding_resp = None;
    for _ in 0..16 {
        let peer_out = peer.process(&msg).expect("peer");
        let Some(peer_resp) = peer_out.response else {
            break;
        };
        if peer_out.status == SessionStatus::Success {
            peer_binding_resp = Some(peer_resp);
            break;
        }
        let server_out = server.process(&peer_resp).expect("server");
        msg = server_out.response.expect("server message");
    }
    let mut resp = peer_binding_resp.expect("peer binding response");

    // Clear the echoed nonce's low bit again (nonce[31] sits 41 bytes from
    // the end of the trailing 80-byte Crypto-Binding TLV).
    let idx = resp.len() - 41;
    resp[idx] ^= 0x01;

    let out = server.process(&resp).expect("server rejects");
    assert_eq!(out.status, SessionStatus::Failure);
    assert_eq!(server.state(), ServerState::FailureSendResult);
}

#[test]
fn unknown_mandatory_tlv_answered_with_nak() {
    let (client_tls, mut server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());

    // Establish the tunnel by hand.
    let start = wire::build_frame(TEAP_VERSION, true, &[], &[]);
    let hello = peer.process(&start).expect("start").response.expect("hello");
    let hello_frame = TeapFrame::parse(&hello).expect("frame");
    let flight = server_tls.handshake(hello_frame.tls_data).expect("flight");
    let reply = wire::build_frame(TEAP_VERSION, false, &flight, &[]);
    let finish = peer.process(&reply).expect("phase1").response.expect("finish");
    let finish_frame = TeapFrame::parse(&finish).expect("frame");
    server_tls.handshake(finish_frame.tls_data).expect("done");

    // Unknown mandatory TLV 0x2FFF.
    let mut tlvs = Vec::new();
    tlv::put_tlv_header(&mut tlvs, 0x2FFF | tlv::TLV_MANDATORY, 3);
    tlvs.extend_from_slice(&[0x01, 0x02, 0x03]);
    let record = server_tls.encrypt(&tlvs).expect("record");
    let msg = wire::build_frame(TEAP_VERSION, false, &record, &[]);

    let out = peer.process(&msg).expect("peer answers");
    assert_eq!(out.status, SessionStatus::InProgress);
    let frame = TeapFrame::parse(out.response.as_deref().expect("response")).expect("frame");
    let plain = server_tls.decrypt(frame.tls_data).expect("plain");
    let parsed = tlv::parse_phase2(&plain).expect("tlvs");
    let nak = parsed.nak.expect("nak tlv");
    assert_eq!(nak.nak_type, 0x2FFF);
}

#[test]
fn duplicate_result_tlv_forces_failure() {
    let (client_tls, mut server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());

    let start = wire::build_frame(TEAP_VERSION, true, &[], &[]);
    let hello = peer.process(&start).expect("start").response.expect("hello");
    let hello_frame = TeapFrame::parse(&hello).expect("frame");
    let flight = server_tls.handshake(hello_frame.tls_data).expect("flight");
    let reply = wire::build_frame(TEAP_VERSION, false, &flight, &[]);
    let finish = peer.process(&reply).expect("phase1").response.expect("finish");
    let finish_frame = TeapFrame::parse(&finish).expect("frame");
    server_tls.handshake(finish_frame.tls_data).expect("done");

    let mut tlvs = Vec::new();
    tlv::put_result(&mut tlvs, false, Status::Success);
    tlv::put_result(&mut tlvs, false, Status::Success);
    let record = server_tls.encrypt(&tlvs).expect("record");
    let msg = wire::build_frame(TEAP_VERSION, false, &record, &[]);

    let out = peer.process(&msg).expect("peer answers");
    assert_eq!(out.status, SessionStatus::Failure);
    assert_eq!(peer.state(), PeerState::Failure);
    let frame = TeapFrame::parse(out.response.as_deref().expect("response")).expect("frame");
    let plain = server_tls.decrypt(frame.tls_data).expect("plain");
    let parsed = tlv::parse_phase2(&plain).expect("tlvs");
    assert_eq!(parsed.result, Some(Status::Failure));
}

#[test]
fn pac_provisioning_on_request() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut config = peer_config();
    config.request_tunnel_pac = true;
    let mut peer = TeapPeer::new(config, Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);

    let entry = peer
        .pac_store()
        .find(b"srv1", PAC_TYPE_TUNNEL)
        .expect("provisioned pac");
    assert!(!entry.pac_opaque.is_empty());
    assert_eq!(entry.i_id, b"alice");

    // The server can unwrap its own opaque.
    let plain = opaque::open(&entry.pac_opaque, &WRAP_KEY).expect("unwrap");
    assert_eq!(plain.pac_key.as_bytes(), entry.pac_key.as_bytes());
    assert_eq!(plain.identity.as_deref(), Some(&b"alice"[..]));
}

#[test]
fn expired_pac_accepted_once_and_reprovisioned() {
    let stale_key = PacKey([0x0F; PAC_KEY_LEN]);
    let stale_opaque = opaque::seal(
        &PacOpaquePlain {
            pac_key: stale_key.clone(),
            lifetime: 1, // long past
            identity: Some(b"alice".to_vec()),
        },
        &WRAP_KEY,
    )
    .expect("seal");
    let stale_entry = PacEntry {
        pac_type: PAC_TYPE_TUNNEL,
        pac_key: stale_key,
        pac_opaque: stale_opaque.clone(),
        pac_info: pac::encode_pac_info(b"srv1", b"Example Authority", b"alice", 1, PAC_TYPE_TUNNEL),
        a_id: b"srv1".to_vec(),
        i_id: b"alice".to_vec(),
        a_id_info: b"Example Authority".to_vec(),
    };

    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), vec![stale_entry]);
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        check_password(),
    )
    .expect("server");

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    // The expired PAC still authenticates this session.
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);

    // And a replacement PAC was pushed before Success.
    let entry = peer
        .pac_store()
        .find(b"srv1", PAC_TYPE_TUNNEL)
        .expect("refreshed pac");
    assert_ne!(entry.pac_opaque, stale_opaque);
    let plain = opaque::open(&entry.pac_opaque, &WRAP_KEY).expect("unwrap");
    assert!(u64::from(plain.lifetime) > 1);
}

#[test]
fn anonymous_provisioning_end_to_end() {
    let (client_tls, server_tls) = loopback_pair(SUITE_ANON);
    let msk = vec![0x77; 64];

    let mut peer_cfg = peer_config();
    peer_cfg.provisioning = ProvisioningMode::Anonymous;
    let mut peer = TeapPeer::new(peer_cfg, Box::new(client_tls), Vec::new());
    peer.add_inner_method(Box::new(FakePeerMethod::new(EAP_TYPE_MSCHAPV2, msk.clone())));

    let mut server_cfg = server_config();
    server_cfg.provisioning = ProvisioningMode::Anonymous;
    let mut server =
        TeapServer::new(server_cfg, Box::new(server_tls), WRAP_KEY, check_password())
            .expect("server");
    server.add_inner_authenticator(Box::new(FakeAuthenticator::new(EAP_TYPE_MSCHAPV2, msk)));

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);

    // Anonymous provisioning always ends with a fresh Tunnel PAC.
    assert!(peer.pac_store().find(b"srv1", PAC_TYPE_TUNNEL).is_some());
}

#[test]
fn client_certificate_fast_path_skips_inner_auth() {
    let (client_tls, server_tls) = loopback_pair(SUITE_SHA256);
    let server_tls = server_tls.with_client_cert();
    let mut peer = TeapPeer::new(peer_config(), Box::new(client_tls), Vec::new());
    let mut server = TeapServer::new(
        server_config(),
        Box::new(server_tls),
        WRAP_KEY,
        Box::new(|_, _| false), // password path must never run
    )
    .expect("server");

    let (peer_status, server_status) = run_exchange(&mut peer, &mut server, 16);
    assert_eq!(peer_status, SessionStatus::Success);
    assert_eq!(server_status, SessionStatus::Success);
    assert_eq!(peer.msk().expect("peer msk"), server.msk().expect("server msk"));
}
