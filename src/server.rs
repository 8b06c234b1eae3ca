// TEAP server state machine: Start issuance, inner-method sequencing,
// crypto-binding challenge/verification, PAC provisioning.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::{
    config::{IdentityPolicy, ProvisioningMode, ServerConfig},
    crypto::{
        binding,
        keys::{KeyState, EMSK_LEN, MSK_LEN, SESSION_KEY_SEED_LEN, TLS_EXPORTER_LABEL},
        prf::{self, PrfError},
    },
    inner::{self, EapPacket, InnerAuthenticator, InnerError, MethodDecision, EAP_TYPE_NAK},
    pac::{
        self,
        opaque::{self, OpaqueError, PacOpaquePlain, WRAP_KEY_LEN},
        PacEntry, PacError, PacKey, PAC_TYPE_TUNNEL,
    },
    peer::SessionStatus,
    tlv::{
        self, CryptoBinding, Phase2Payload, Status, TlvCursor, TlvError, TlvType,
        ACTION_PROCESS_TLV, CB_SUBTYPE_REQUEST, CB_SUBTYPE_RESPONSE, CMAC_EMSK, CMAC_EMSK_AND_MSK,
        CMAC_MSK, ERROR_TUNNEL_COMPROMISE,
    },
    tunnel::{TlsTunnel, TunnelError},
    wire::{self, Reassembler, TeapFrame, WireError, TEAP_MIN_VERSION, TEAP_VERSION},
};

/// Server-side protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Before the Start message was issued.
    Start,
    /// TLS handshake in progress.
    Phase1,
    /// Final server handshake flight sent, waiting for completion.
    Phase1b,
    /// Tunnel up, first Phase-2 request about to go out.
    Phase2Start,
    /// Identity request outstanding.
    Phase2Id,
    /// Basic-Password-Auth request outstanding.
    Phase2BasicAuth,
    /// Inner EAP method exchange in flight.
    Phase2Method,
    /// Crypto-binding request outstanding.
    CryptoBinding,
    /// Final message including a provisioned PAC outstanding.
    RequestPac,
    /// Separate final result round outstanding.
    SuccessSendResult,
    /// Failure result sent, waiting for the acknowledgement.
    FailureSendResult,
    Success,
    Failure,
}

/// Result of feeding one inbound message to the server.
#[derive(Debug)]
pub struct ServerOutput {
    pub response: Option<Vec<u8>>,
    pub status: SessionStatus,
}

impl ServerOutput {
    fn respond(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            status: SessionStatus::InProgress,
        }
    }
}

/// Server-side error. Any error aborts the exchange; the outer EAP layer
/// then emits a cleartext EAP-Failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("outer framing error: {0}")]
    Wire(#[from] WireError),

    #[error("tlv error: {0}")]
    Tlv(#[from] TlvError),

    #[error("tls engine error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("prf selection error: {0}")]
    Prf(#[from] PrfError),

    #[error("pac error: {0}")]
    Pac(#[from] PacError),

    #[error("pac opaque error: {0}")]
    Opaque(#[from] OpaqueError),

    #[error("inner method error: {0}")]
    Inner(#[from] InnerError),

    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("peer answered with version {0} below supported minimum")]
    VersionTooLow(u8),

    #[error("crypto binding does not match tunnel state")]
    TunnelCompromise,

    #[error("cipher suite {0:#06x} not allowed for anonymous provisioning")]
    AnonCipherSuite(u16),

    #[error("message not valid in state {0:?}")]
    UnexpectedMessage(ServerState),

    #[error("session already terminated")]
    SessionDone,
}

/// Outcome of the session-ticket unwrap callback, shared with the TLS
/// engine closure.
#[derive(Debug, Default)]
struct TicketOutcome {
    accepted: bool,
    identity: Option<Vec<u8>>,
    expired: bool,
    near_expiry: bool,
}

/// Verifies Basic-Password-Auth credentials.
pub type PasswordVerifier = Box<dyn Fn(&[u8], &[u8]) -> bool>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// EAP-TEAP server session.
pub struct TeapServer {
    config: ServerConfig,
    tls: Box<dyn TlsTunnel>,
    verifier: PasswordVerifier,
    inner_queue: VecDeque<Box<dyn InnerAuthenticator>>,
    active_inner: Option<Box<dyn InnerAuthenticator>>,
    wrap_key: [u8; WRAP_KEY_LEN],
    state: ServerState,
    version: u8,
    version_negotiated: bool,
    keys: Option<KeyState>,
    server_outer_tlvs: Vec<u8>,
    peer_outer_tlvs: Vec<u8>,
    peer_outer_seen: bool,
    reassembler: Reassembler,
    sent_binding: Option<CryptoBinding>,
    sent_final: bool,
    sent_pac: bool,
    send_new_pac: bool,
    anon_provisioning: bool,
    method_completed: bool,
    identity_rounds_done: u8,
    next_identifier: u8,
    peer_identity: Vec<u8>,
    ticket: Rc<RefCell<TicketOutcome>>,
    msk: Option<[u8; MSK_LEN]>,
    emsk: Option<[u8; EMSK_LEN]>,
}

impl TeapServer {
    pub fn new(
        config: ServerConfig,
        mut tls: Box<dyn TlsTunnel>,
        wrap_key: [u8; WRAP_KEY_LEN],
        verifier: PasswordVerifier,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let ticket = Rc::new(RefCell::new(TicketOutcome::default()));
        let outcome = Rc::clone(&ticket);
        let soft_refresh = config.pac_soft_refresh_secs;
        let callback_key = wrap_key;
        tls.set_session_ticket_callback(Box::new(move |blob: &[u8]| {
            match opaque::open(blob, &callback_key) {
                Ok(plain) => {
                    let now = unix_now();
                    let mut state = outcome.borrow_mut();
                    state.accepted = true;
                    state.identity = plain.identity.clone();
                    state.expired = u64::from(plain.lifetime) <= now;
                    state.near_expiry = u64::from(plain.lifetime) <= now + soft_refresh;
                    Some(*plain.pac_key.as_bytes())
                }
                Err(err) => {
                    debug!(error = %err, "pac-opaque rejected, falling back to full handshake");
                    None
                }
            }
        }));

        Ok(Self {
            config,
            tls,
            verifier,
            inner_queue: VecDeque::new(),
            active_inner: None,
            wrap_key,
            state: ServerState::Start,
            version: TEAP_VERSION,
            version_negotiated: false,
            keys: None,
            server_outer_tlvs: Vec::new(),
            peer_outer_tlvs: Vec::new(),
            peer_outer_seen: false,
            reassembler: Reassembler::new(),
            sent_binding: None,
            sent_final: false,
            sent_pac: false,
            send_new_pac: false,
            anon_provisioning: false,
            method_completed: false,
            identity_rounds_done: 0,
            next_identifier: 1,
            peer_identity: Vec::new(),
            ticket,
            msk: None,
            emsk: None,
        })
    }

    /// Queues a server-side inner method; with [`IdentityPolicy::UserThenMachine`]
    /// each identity round consumes the next queued authenticator.
    pub fn add_inner_authenticator(&mut self, authenticator: Box<dyn InnerAuthenticator>) {
        self.inner_queue.push_back(authenticator);
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn msk(&self) -> Option<&[u8; MSK_LEN]> {
        self.msk.as_ref()
    }

    pub fn emsk(&self) -> Option<&[u8; EMSK_LEN]> {
        self.emsk.as_ref()
    }

    /// Whether this session will (re)provision a Tunnel PAC.
    pub fn pac_provisioning_pending(&self) -> bool {
        self.send_new_pac && !self.sent_pac
    }

    /// Builds the TEAP/Start message.
    ///
    /// The Authority-ID outer TLV bytes are cached verbatim; every compound
    /// MAC for this session replays exactly these bytes, never a re-encoded
    /// copy.
    pub fn initiate(&mut self) -> Result<Vec<u8>, ServerError> {
        if self.state != ServerState::Start {
            return Err(ServerError::UnexpectedMessage(self.state));
        }
        let mut outer = Vec::new();
        tlv::put_tlv(
            &mut outer,
            TlvType::AuthorityId,
            false,
            self.config.authority_id.as_bytes(),
        );
        self.server_outer_tlvs = outer.clone();
        self.state = ServerState::Phase1;
        debug!("issuing teap start");
        Ok(wire::build_frame(TEAP_VERSION, true, &[], &outer))
    }

    /// Processes one inbound EAP-TEAP response payload.
    pub fn process(&mut self, response: &[u8]) -> Result<ServerOutput, ServerError> {
        match self.state {
            ServerState::Success | ServerState::Failure => return Err(ServerError::SessionDone),
            ServerState::Start => return Err(ServerError::UnexpectedMessage(self.state)),
            _ => {}
        }

        let frame = TeapFrame::parse(response)?;
        if !self.version_negotiated {
            if frame.version() < TEAP_MIN_VERSION {
                return Err(ServerError::VersionTooLow(frame.version()));
            }
            self.version = frame.version().min(TEAP_VERSION);
            self.version_negotiated = true;
            debug!(version = self.version, "negotiated teap version");
        }
        if !self.peer_outer_seen {
            self.peer_outer_tlvs = frame.outer_tlvs.to_vec();
            self.peer_outer_seen = true;
        }

        let Some(tls_data) = self.reassembler.push(&frame)? else {
            return Ok(ServerOutput::respond(wire::build_fragment_ack(self.version)));
        };

        match self.state {
            ServerState::Phase1 | ServerState::Phase1b => self.handle_phase1(&tls_data),
            ServerState::FailureSendResult => {
                debug!("failure result acknowledged");
                self.state = ServerState::Failure;
                Ok(ServerOutput {
                    response: None,
                    status: SessionStatus::Failure,
                })
            }
            _ => self.handle_phase2_record(&tls_data),
        }
    }

    fn handle_phase1(&mut self, tls_data: &[u8]) -> Result<ServerOutput, ServerError> {
        let outgoing = self.tls.handshake(tls_data)?;
        if !self.tls.is_established() {
            return Ok(ServerOutput::respond(wire::build_frame(
                self.version,
                false,
                &outgoing,
                &[],
            )));
        }
        if !outgoing.is_empty() {
            // Flush the final server flight before starting Phase 2.
            self.state = ServerState::Phase1b;
            return Ok(ServerOutput::respond(wire::build_frame(
                self.version,
                false,
                &outgoing,
                &[],
            )));
        }

        self.finalize_tunnel()?;
        self.state = ServerState::Phase2Start;
        let tlvs = self.build_first_phase2()?;
        self.respond_encrypted(tlvs, SessionStatus::InProgress)
    }

    fn finalize_tunnel(&mut self) -> Result<(), ServerError> {
        let suite = self.tls.cipher_suite()?;
        let alg = prf::MacAlgorithm::classify(suite)?;

        let (accepted, resumed_identity, expired, near_expiry) = {
            let ticket = self.ticket.borrow();
            (
                ticket.accepted,
                ticket.identity.clone(),
                ticket.expired,
                ticket.near_expiry,
            )
        };
        if self.tls.resumed() {
            if !accepted {
                warn!("engine reports resumption without a ticket unwrap");
            }
            if let Some(identity) = resumed_identity {
                self.peer_identity = identity;
            }
            if expired {
                debug!("pac expired, accepted once; scheduling reprovision");
                self.send_new_pac = true;
            } else if near_expiry {
                debug!("pac near expiry, scheduling soft refresh");
                self.send_new_pac = true;
            }
        } else if self.config.provisioning == ProvisioningMode::Anonymous
            && prf::is_anon_provisioning_suite(suite)
        {
            debug!("anonymous provisioning tunnel established");
            self.anon_provisioning = true;
            self.send_new_pac = true;
        } else if self.config.provisioning == ProvisioningMode::Anonymous
            && !prf::is_anon_provisioning_suite(suite)
        {
            // Configured for anonymous provisioning but the suite carries
            // server authentication; treat as an authenticated tunnel.
            debug!(suite, "authenticated suite, anonymous provisioning not engaged");
        }

        let exported = self
            .tls
            .export_key(TLS_EXPORTER_LABEL, &[], SESSION_KEY_SEED_LEN)?;
        let mut seed = [0u8; SESSION_KEY_SEED_LEN];
        seed.copy_from_slice(&exported);
        self.keys = Some(KeyState::new(alg, &seed));
        seed.zeroize();
        Ok(())
    }

    fn requested_identity_type(&self) -> Option<u16> {
        match self.config.identity_policy {
            IdentityPolicy::AllowAny => None,
            IdentityPolicy::User | IdentityPolicy::RequestUserAcceptAny => Some(1),
            IdentityPolicy::Machine => Some(2),
            IdentityPolicy::UserThenMachine => {
                if self.identity_rounds_done == 0 {
                    Some(1)
                } else {
                    Some(2)
                }
            }
        }
    }

    fn build_first_phase2(&mut self) -> Result<Vec<u8>, ServerError> {
        if self.tls.resumed() || self.tls.client_certificate_verified() {
            // Tunnel authentication already proves the peer; go straight to
            // the result exchange.
            debug!("fast path: no inner authentication required");
            if let Some(keys) = self.keys.as_mut() {
                keys.basic_password_cmk();
            }
            return self.build_binding_round(true);
        }
        self.build_identity_round()
    }

    fn build_identity_round(&mut self) -> Result<Vec<u8>, ServerError> {
        let mut tlvs = Vec::new();
        if let Some(identity_type) = self.requested_identity_type() {
            tlv::put_identity_type(&mut tlvs, identity_type);
        }
        if self.inner_queue.is_empty() && self.active_inner.is_none() {
            // No inner EAP configured: password authentication.
            tlv::put_tlv(&mut tlvs, TlvType::BasicPasswordAuthReq, true, b"");
            self.state = ServerState::Phase2BasicAuth;
        } else {
            let identifier = self.next_identifier();
            tlv::put_eap_payload(&mut tlvs, &inner::build_identity_request(identifier));
            self.state = ServerState::Phase2Id;
        }
        Ok(tlvs)
    }

    fn next_identifier(&mut self) -> u8 {
        let id = self.next_identifier;
        self.next_identifier = self.next_identifier.wrapping_add(1);
        id
    }

    fn handle_phase2_record(&mut self, tls_data: &[u8]) -> Result<ServerOutput, ServerError> {
        let mut plaintext = self.tls.decrypt(tls_data)?;
        let result = self.handle_phase2(&plaintext);
        plaintext.zeroize();
        result
    }

    fn handle_phase2(&mut self, plaintext: &[u8]) -> Result<ServerOutput, ServerError> {
        let parsed = match tlv::parse_phase2(plaintext) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "phase-2 parse failed, forcing failure");
                return self.fail_with(None);
            }
        };

        if let Some(nak) = parsed.nak {
            warn!(nak_type = nak.nak_type, "peer rejected a mandatory tlv");
            return self.fail_with(None);
        }
        if parsed.result == Some(Status::Failure) {
            debug!("peer reported failure result");
            return self.fail_with(None);
        }
        if let Some(action) = parsed.request_action {
            self.note_request_action(action.action, parsed.request_action_tlvs);
        }

        match self.state {
            ServerState::Phase2Id => self.handle_identity_response(&parsed),
            ServerState::Phase2BasicAuth => self.handle_basic_auth_response(&parsed),
            ServerState::Phase2Method => self.handle_method_response(&parsed),
            ServerState::CryptoBinding | ServerState::RequestPac | ServerState::SuccessSendResult => {
                self.handle_binding_response(&parsed)
            }
            other => Err(ServerError::UnexpectedMessage(other)),
        }
    }

    fn note_request_action(&mut self, action: u8, nested: Option<&[u8]>) {
        if action != ACTION_PROCESS_TLV {
            debug!(action, "ignoring request-action");
            return;
        }
        let Some(nested) = nested else {
            return;
        };
        for item in TlvCursor::new(nested) {
            let Ok(tlv) = item else {
                return;
            };
            if tlv.kind() == Some(TlvType::Pac) {
                if pac::parse_pac_request(tlv.value) == Some(PAC_TYPE_TUNNEL) {
                    debug!("peer requested a tunnel pac");
                    self.send_new_pac = true;
                }
            }
        }
    }

    fn handle_identity_response(
        &mut self,
        parsed: &Phase2Payload<'_>,
    ) -> Result<ServerOutput, ServerError> {
        let Some(packet_bytes) = parsed.eap_payload else {
            warn!("expected identity response");
            return self.fail_with(None);
        };
        let packet = EapPacket::parse(packet_bytes)?;
        if packet.eap_type != Some(inner::EAP_TYPE_IDENTITY) {
            warn!(eap_type = ?packet.eap_type, "expected identity response");
            return self.fail_with(None);
        }
        self.peer_identity = packet.type_data.to_vec();
        debug!(identity_len = self.peer_identity.len(), "peer identity received");

        let Some(mut authenticator) = self.inner_queue.pop_front() else {
            warn!("no inner authenticator configured for this round");
            return self.fail_with(None);
        };
        if self.anon_provisioning
            && !inner::ANON_PROVISIONING_INNER_TYPES.contains(&authenticator.method_type())
        {
            warn!(
                method_type = authenticator.method_type(),
                "inner method not allowed during anonymous provisioning"
            );
            return self.fail_with(None);
        }

        let identifier = self.next_identifier();
        let identity = self.peer_identity.clone();
        let request = authenticator.initiate(identifier, &identity)?;
        self.active_inner = Some(authenticator);
        self.state = ServerState::Phase2Method;

        let mut tlvs = Vec::new();
        tlv::put_eap_payload(&mut tlvs, &request);
        self.respond_encrypted(tlvs, SessionStatus::InProgress)
    }

    fn handle_basic_auth_response(
        &mut self,
        parsed: &Phase2Payload<'_>,
    ) -> Result<ServerOutput, ServerError> {
        let Some(value) = parsed.basic_auth_resp else {
            warn!("expected basic password auth response");
            return self.fail_with(None);
        };
        let Some((identity, password)) = parse_basic_auth_resp(value) else {
            warn!("malformed basic password auth response");
            return self.fail_with(None);
        };

        if !(self.verifier)(identity, password) {
            debug!("basic password authentication rejected");
            return self.fail_with(None);
        }
        self.peer_identity = identity.to_vec();
        debug!("basic password authentication accepted");

        if let Some(keys) = self.keys.as_mut() {
            keys.basic_password_cmk();
        }
        let tlvs = self.build_binding_round(self.final_result())?;
        self.respond_encrypted(tlvs, SessionStatus::InProgress)
    }

    fn handle_method_response(
        &mut self,
        parsed: &Phase2Payload<'_>,
    ) -> Result<ServerOutput, ServerError> {
        let Some(packet_bytes) = parsed.eap_payload else {
            warn!("expected inner method response");
            return self.fail_with(None);
        };
        let packet = EapPacket::parse(packet_bytes)?;
        if packet.eap_type == Some(EAP_TYPE_NAK) {
            warn!("peer nak'd the inner method");
            return self.fail_with(None);
        }

        let Some(authenticator) = self.active_inner.as_mut() else {
            return Err(ServerError::UnexpectedMessage(self.state));
        };
        match authenticator.process(&packet)? {
            MethodDecision::Continue(request) => {
                let mut tlvs = Vec::new();
                tlv::put_eap_payload(&mut tlvs, &request);
                self.respond_encrypted(tlvs, SessionStatus::InProgress)
            }
            MethodDecision::Success => {
                debug!("inner method succeeded");
                let (msk, emsk) = {
                    let authenticator = self.active_inner.as_ref().expect("active method");
                    (authenticator.key(), authenticator.emsk())
                };
                if let Some(keys) = self.keys.as_mut() {
                    keys.advance(msk.as_deref(), emsk.as_deref());
                }
                self.method_completed = true;
                let tlvs = self.build_binding_round(self.final_result())?;
                self.respond_encrypted(tlvs, SessionStatus::InProgress)
            }
            MethodDecision::Failure => {
                debug!("inner method failed");
                self.fail_with(None)
            }
        }
    }

    /// True when nothing further stands between this round and `Success`.
    fn final_result(&self) -> bool {
        !self.more_identity_rounds_pending() && !self.config.separate_final_result
    }

    fn more_identity_rounds_pending(&self) -> bool {
        self.config.identity_policy == IdentityPolicy::UserThenMachine
            && self.identity_rounds_done < 2
            && !self.inner_queue.is_empty()
    }

    fn build_binding_round(&mut self, final_round: bool) -> Result<Vec<u8>, ServerError> {
        let keys = self.keys.as_ref().ok_or(ServerError::TunnelCompromise)?;
        let alg = keys.mac_algorithm();

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce[31] &= 0xFE;

        let flags = if keys.cmk_emsk_available() {
            CMAC_EMSK_AND_MSK
        } else {
            CMAC_MSK
        };
        let mut request = CryptoBinding {
            reserved: 0,
            version: self.version,
            received_version: self.version,
            flags,
            subtype: CB_SUBTYPE_REQUEST,
            nonce,
            emsk_compound_mac: [0u8; 20],
            msk_compound_mac: [0u8; 20],
        };
        request.msk_compound_mac = binding::compute_compound_mac(
            alg,
            &request,
            &self.server_outer_tlvs,
            &self.peer_outer_tlvs,
            keys.cmk_msk(),
        );
        if keys.cmk_emsk_available() {
            request.emsk_compound_mac = binding::compute_compound_mac(
                alg,
                &request,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_emsk(),
            );
        }

        let mut tlvs = Vec::new();
        if final_round {
            if self.method_completed {
                tlv::put_result(&mut tlvs, true, Status::Success);
            }
            tlv::put_result(&mut tlvs, false, Status::Success);
        } else {
            tlv::put_result(&mut tlvs, true, Status::Success);
        }
        tlvs.extend_from_slice(&request.to_tlv_bytes());

        if final_round && self.send_new_pac && !self.sent_pac {
            let pac_tlv = self.build_pac_tlv()?;
            tlv::put_tlv(&mut tlvs, TlvType::Pac, true, &pac_tlv);
            self.sent_pac = true;
            self.state = ServerState::RequestPac;
        } else {
            self.state = ServerState::CryptoBinding;
        }

        self.sent_binding = Some(request);
        self.sent_final = final_round;
        debug!(final_round, "crypto binding request issued");
        Ok(tlvs)
    }

    fn build_pac_tlv(&self) -> Result<Vec<u8>, ServerError> {
        let pac_key = PacKey::random();
        let lifetime = unix_now().saturating_add(self.config.pac_lifetime_secs);
        let lifetime = u32::try_from(lifetime).unwrap_or(u32::MAX);
        let identity = if self.peer_identity.is_empty() {
            None
        } else {
            Some(self.peer_identity.clone())
        };

        let plain = PacOpaquePlain {
            pac_key: pac_key.clone(),
            lifetime,
            identity,
        };
        let sealed = opaque::seal(&plain, &self.wrap_key)?;

        let a_id = self.config.authority_id.as_bytes();
        let entry = PacEntry {
            pac_type: PAC_TYPE_TUNNEL,
            pac_key,
            pac_opaque: sealed,
            pac_info: pac::encode_pac_info(
                a_id,
                self.config.authority_id_info.as_bytes(),
                &self.peer_identity,
                lifetime,
                PAC_TYPE_TUNNEL,
            ),
            a_id: a_id.to_vec(),
            i_id: self.peer_identity.clone(),
            a_id_info: self.config.authority_id_info.as_bytes().to_vec(),
        };
        debug!(lifetime, "tunnel pac built");
        Ok(pac::encode_pac_tlv(&entry))
    }

    fn handle_binding_response(
        &mut self,
        parsed: &Phase2Payload<'_>,
    ) -> Result<ServerOutput, ServerError> {
        let Some(cb) = &parsed.crypto_binding else {
            warn!("expected crypto binding response");
            return self.fail_with(Some(ERROR_TUNNEL_COMPROMISE));
        };
        if let Err(err) = self.validate_binding_response(cb) {
            warn!(error = %err, "crypto binding response invalid");
            return self.fail_with(Some(ERROR_TUNNEL_COMPROMISE));
        }

        if self.sent_pac && self.state == ServerState::RequestPac {
            match parsed.pac.and_then(pac::parse_pac_ack) {
                Some(true) => debug!("pac acknowledged"),
                Some(false) => warn!("peer declined the provisioned pac"),
                None => warn!("pac acknowledgement missing"),
            }
        }

        if self.method_completed {
            self.identity_rounds_done += 1;
            self.method_completed = false;
        }

        if self.sent_final {
            if parsed.result != Some(Status::Success) {
                warn!("final binding response without success result");
                return self.fail_with(None);
            }
            let keys = self.keys.as_ref().ok_or(ServerError::TunnelCompromise)?;
            self.msk = Some(keys.msk());
            self.emsk = Some(keys.emsk());
            self.state = ServerState::Success;
            debug!("teap session succeeded");
            return Ok(ServerOutput {
                response: None,
                status: SessionStatus::Success,
            });
        }

        // Intermediate round complete; continue the sequence.
        if self.more_identity_rounds_pending() {
            let tlvs = self.build_identity_round()?;
            return self.respond_encrypted(tlvs, SessionStatus::InProgress);
        }

        // Separate final-result round (or pending PAC delivery).
        let tlvs = self.build_binding_round(true)?;
        if self.state == ServerState::CryptoBinding {
            self.state = ServerState::SuccessSendResult;
        }
        self.respond_encrypted(tlvs, SessionStatus::InProgress)
    }

    fn validate_binding_response(&self, cb: &CryptoBinding) -> Result<(), ServerError> {
        let sent = self
            .sent_binding
            .as_ref()
            .ok_or(ServerError::TunnelCompromise)?;
        if cb.subtype != CB_SUBTYPE_RESPONSE {
            return Err(ServerError::TunnelCompromise);
        }
        if cb.flags == 0 || cb.flags > CMAC_EMSK_AND_MSK {
            return Err(ServerError::TunnelCompromise);
        }
        if cb.version != self.version || cb.received_version != self.version {
            return Err(ServerError::TunnelCompromise);
        }

        // Echoed nonce: first 31 bytes identical, low bit of the last byte
        // forced to 1, remaining bits of the last byte unchanged.
        let high_bits_match: bool = cb.nonce[..31].ct_eq(&sent.nonce[..31]).into();
        if !high_bits_match
            || (cb.nonce[31] & 0xFE) != (sent.nonce[31] & 0xFE)
            || cb.nonce[31] & 0x01 != 1
        {
            warn!("nonce echo check failed");
            return Err(ServerError::TunnelCompromise);
        }

        let keys = self.keys.as_ref().ok_or(ServerError::TunnelCompromise)?;
        let alg = keys.mac_algorithm();
        if cb.flags & CMAC_MSK != 0
            && !binding::verify_compound_mac(
                alg,
                cb,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_msk(),
                &cb.msk_compound_mac,
            )
        {
            warn!("peer msk compound mac mismatch");
            return Err(ServerError::TunnelCompromise);
        }
        if cb.flags & CMAC_EMSK != 0 {
            if !keys.cmk_emsk_available() {
                warn!("peer claims emsk binding but no emsk chain exists");
                return Err(ServerError::TunnelCompromise);
            }
            if !binding::verify_compound_mac(
                alg,
                cb,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_emsk(),
                &cb.emsk_compound_mac,
            ) {
                warn!("peer emsk compound mac mismatch");
                return Err(ServerError::TunnelCompromise);
            }
        }
        Ok(())
    }

    fn respond_encrypted(
        &mut self,
        mut tlvs: Vec<u8>,
        status: SessionStatus,
    ) -> Result<ServerOutput, ServerError> {
        let ciphertext = self.tls.encrypt(&tlvs)?;
        tlvs.zeroize();
        Ok(ServerOutput {
            response: Some(wire::build_frame(self.version, false, &ciphertext, &[])),
            status,
        })
    }

    fn fail_with(&mut self, error_code: Option<u32>) -> Result<ServerOutput, ServerError> {
        let mut tlvs = Vec::new();
        tlv::put_result(&mut tlvs, false, Status::Failure);
        if let Some(code) = error_code {
            tlv::put_error(&mut tlvs, code);
        }
        self.state = ServerState::FailureSendResult;
        let ciphertext = self.tls.encrypt(&tlvs)?;
        Ok(ServerOutput {
            response: Some(wire::build_frame(self.version, false, &ciphertext, &[])),
            status: SessionStatus::Failure,
        })
    }
}

fn parse_basic_auth_resp(value: &[u8]) -> Option<(&[u8], &[u8])> {
    if value.is_empty() {
        return None;
    }
    let user_len = value[0] as usize;
    if value.len() < 1 + user_len + 1 {
        return None;
    }
    let identity = &value[1..1 + user_len];
    let pass_len = value[1 + user_len] as usize;
    let pass_start = 2 + user_len;
    if value.len() < pass_start + pass_len {
        return None;
    }
    Some((identity, &value[pass_start..pass_start + pass_len]))
}

impl Drop for TeapServer {
    fn drop(&mut self) {
        self.wrap_key.zeroize();
        if let Some(msk) = self.msk.as_mut() {
            msk.zeroize();
        }
        if let Some(emsk) = self.emsk.as_mut() {
            emsk.zeroize();
        }
    }
}
