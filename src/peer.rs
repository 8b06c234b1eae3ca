// TEAP peer state machine: version negotiation, PAC selection, inner-method
// sequencing, crypto-binding validation, provisioning.

use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::{
    config::{PeerConfig, ProvisioningMode},
    crypto::{
        binding,
        keys::{KeyState, EMSK_LEN, MSK_LEN, SESSION_KEY_SEED_LEN, TLS_EXPORTER_LABEL},
        prf::{self, PrfError},
    },
    inner::{
        self, EapPacket, InnerEapMethod, InnerError, InnerStep, ANON_PROVISIONING_INNER_TYPES,
        EAP_CODE_REQUEST, EAP_TYPE_AKA, EAP_TYPE_AKA_PRIME, EAP_TYPE_IDENTITY,
    },
    pac::{self, PacEntry, PacError, PacStore, PAC_TYPE_TUNNEL},
    tlv::{
        self, CryptoBinding, Phase2Payload, Status, TlvCursor, TlvError, TlvType,
        ACTION_PROCESS_TLV, CB_SUBTYPE_REQUEST, CB_SUBTYPE_RESPONSE, CMAC_EMSK, CMAC_EMSK_AND_MSK,
        CMAC_MSK, ERROR_TUNNEL_COMPROMISE, ERROR_UNEXPECTED_TLVS_EXCHANGED,
    },
    tunnel::{TlsTunnel, TunnelError},
    wire::{self, Reassembler, TeapFrame, WireError, TEAP_MIN_VERSION, TEAP_VERSION},
};

/// Peer-side protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the server's TEAP/Start.
    Start,
    /// TLS handshake in progress.
    Phase1,
    /// Tunnel up, no Phase-2 exchange seen yet.
    Phase2Start,
    /// Answered an inner EAP Identity request.
    Phase2Identity,
    /// Answered a Basic-Password-Auth request.
    Phase2BasicAuth,
    /// Inner EAP method exchange in flight.
    Phase2Method,
    /// Intermediate crypto-binding round completed.
    CryptoBinding,
    /// Provisioned PAC received, acknowledgement sent.
    RequestPac,
    Success,
    Failure,
}

/// Externally visible per-message outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress,
    /// Inner method is waiting on an external round trip.
    Pending,
    Success,
    Failure,
}

/// Result of feeding one inbound message to the peer.
#[derive(Debug)]
pub struct PeerOutput {
    /// Outer response payload, absent when nothing should be sent.
    pub response: Option<Vec<u8>>,
    pub status: SessionStatus,
}

impl PeerOutput {
    fn respond(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            status: SessionStatus::InProgress,
        }
    }

    fn with_status(response: Vec<u8>, status: SessionStatus) -> Self {
        Self {
            response: Some(response),
            status,
        }
    }
}

/// Peer-side error. Any error aborts the exchange without a response; the
/// outer EAP layer then sees a cleartext EAP-Failure.
#[derive(Debug, Error)]
pub enum PeerError {
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

    #[error("inner method error: {0}")]
    Inner(#[from] InnerError),

    #[error("server offered version {0} below supported minimum")]
    VersionTooLow(u8),

    #[error("crypto binding does not match tunnel state")]
    TunnelCompromise,

    #[error("cipher suite {0:#06x} not allowed for anonymous provisioning")]
    AnonCipherSuite(u16),

    #[error("message not valid in state {0:?}")]
    UnexpectedMessage(PeerState),

    #[error("session already terminated")]
    SessionDone,
}

/// EAP-TEAP peer session.
///
/// One instance per authentication attempt; feed each inbound EAP-TEAP
/// request payload to [`TeapPeer::process`]. Key material is wiped when the
/// session is dropped or [`TeapPeer::reset`] is called.
pub struct TeapPeer {
    config: PeerConfig,
    tls: Box<dyn TlsTunnel>,
    state: PeerState,
    version: u8,
    keys: Option<KeyState>,
    pacs: PacStore,
    inner_methods: Vec<Box<dyn InnerEapMethod>>,
    active_inner: Option<usize>,
    inner_bound: bool,
    requires_binding: bool,
    using_pac: bool,
    anon_provisioning: bool,
    pac_requested: bool,
    server_outer_tlvs: Vec<u8>,
    peer_outer_tlvs: Vec<u8>,
    reassembler: Reassembler,
    pending_request: Option<Vec<u8>>,
    current_authority: Vec<u8>,
    msk: Option<[u8; MSK_LEN]>,
    emsk: Option<[u8; EMSK_LEN]>,
}

impl TeapPeer {
    pub fn new(config: PeerConfig, tls: Box<dyn TlsTunnel>, pac_entries: Vec<PacEntry>) -> Self {
        let pacs = PacStore::with_entries(config.pac_max_len, pac_entries);
        Self {
            config,
            tls,
            state: PeerState::Start,
            version: TEAP_VERSION,
            keys: None,
            pacs,
            inner_methods: Vec::new(),
            active_inner: None,
            inner_bound: false,
            requires_binding: false,
            using_pac: false,
            anon_provisioning: false,
            pac_requested: false,
            server_outer_tlvs: Vec::new(),
            peer_outer_tlvs: Vec::new(),
            reassembler: Reassembler::new(),
            pending_request: None,
            current_authority: Vec::new(),
            msk: None,
            emsk: None,
        }
    }

    /// Registers a peer-side inner EAP method implementation.
    pub fn add_inner_method(&mut self, method: Box<dyn InnerEapMethod>) {
        self.inner_methods.push(method);
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Exported MSK once the session reached `Success`.
    pub fn msk(&self) -> Option<&[u8; MSK_LEN]> {
        self.msk.as_ref()
    }

    pub fn emsk(&self) -> Option<&[u8; EMSK_LEN]> {
        self.emsk.as_ref()
    }

    pub fn pac_store(&self) -> &PacStore {
        &self.pacs
    }

    /// Hands back the PAC entries for persistence at session end.
    pub fn into_pac_entries(mut self) -> Vec<PacEntry> {
        std::mem::replace(&mut self.pacs, PacStore::new(0)).into_entries()
    }

    /// Drops all session key material; the instance is unusable afterwards.
    pub fn reset(&mut self) {
        self.keys = None;
        if let Some(msk) = self.msk.as_mut() {
            msk.zeroize();
        }
        if let Some(emsk) = self.emsk.as_mut() {
            emsk.zeroize();
        }
        self.msk = None;
        self.emsk = None;
        self.state = PeerState::Failure;
    }

    /// Processes one inbound EAP-TEAP request payload.
    ///
    /// While an inner method is pending the retransmitted request is not
    /// re-decrypted; the stored inner packet is replayed into the method.
    pub fn process(&mut self, request: &[u8]) -> Result<PeerOutput, PeerError> {
        if self.pending_request.is_some() {
            return self.resume_pending();
        }

        match self.state {
            PeerState::Success | PeerState::Failure => Err(PeerError::SessionDone),
            _ => {
                let frame = TeapFrame::parse(request)?;
                let Some(tls_data) = self.reassembler.push(&frame)? else {
                    debug!("buffered fragment, acking");
                    return Ok(PeerOutput::respond(wire::build_fragment_ack(self.version)));
                };
                match self.state {
                    PeerState::Start => self.handle_start(&frame),
                    PeerState::Phase1 => self.handle_phase1(&tls_data),
                    _ => self.handle_phase2_record(&tls_data),
                }
            }
        }
    }

    fn handle_start(&mut self, frame: &TeapFrame<'_>) -> Result<PeerOutput, PeerError> {
        if !frame.is_start() {
            return Err(PeerError::UnexpectedMessage(self.state));
        }
        if frame.version() < TEAP_MIN_VERSION {
            return Err(PeerError::VersionTooLow(frame.version()));
        }
        self.version = frame.version().min(TEAP_VERSION);
        debug!(version = self.version, "negotiated teap version");

        // The exact Start bytes are replayed into every compound MAC.
        self.server_outer_tlvs = frame.outer_tlvs.to_vec();
        if !frame.outer_tlvs.is_empty() {
            for item in TlvCursor::new(frame.outer_tlvs) {
                let tlv = item?;
                if tlv.kind() == Some(TlvType::AuthorityId) {
                    self.current_authority = tlv.value.to_vec();
                }
            }
        }

        if !self.current_authority.is_empty() {
            if let Some(entry) = self.pacs.find(&self.current_authority, PAC_TYPE_TUNNEL) {
                debug!("presenting tunnel pac for known authority");
                self.tls.set_session_ticket(&entry.pac_opaque)?;
                self.using_pac = true;
            }
        }
        if !self.using_pac && self.config.provisioning == ProvisioningMode::Anonymous {
            debug!("no pac for authority, entering anonymous provisioning");
            self.anon_provisioning = true;
        }

        let client_hello = self.tls.handshake(&[])?;
        self.state = PeerState::Phase1;
        Ok(PeerOutput::respond(wire::build_frame(
            self.version,
            false,
            &client_hello,
            &self.peer_outer_tlvs,
        )))
    }

    fn handle_phase1(&mut self, tls_data: &[u8]) -> Result<PeerOutput, PeerError> {
        let outgoing = self.tls.handshake(tls_data)?;
        if self.tls.is_established() {
            self.finalize_tunnel()?;
            self.state = PeerState::Phase2Start;
        }
        Ok(PeerOutput::respond(wire::build_frame(
            self.version,
            false,
            &outgoing,
            &[],
        )))
    }

    fn finalize_tunnel(&mut self) -> Result<(), PeerError> {
        let suite = self.tls.cipher_suite()?;
        let alg = prf::MacAlgorithm::classify(suite)?;
        if self.anon_provisioning && !prf::is_anon_provisioning_suite(suite) {
            return Err(PeerError::AnonCipherSuite(suite));
        }
        if !self.anon_provisioning && prf::is_anon_provisioning_suite(suite) {
            warn!(suite, "anonymous cipher suite outside provisioning");
        }

        let exported = self
            .tls
            .export_key(TLS_EXPORTER_LABEL, &[], SESSION_KEY_SEED_LEN)?;
        let mut seed = [0u8; SESSION_KEY_SEED_LEN];
        seed.copy_from_slice(&exported);
        self.keys = Some(KeyState::new(alg, &seed));
        seed.zeroize();
        debug!(?alg, "session key seed derived");
        Ok(())
    }

    fn handle_phase2_record(&mut self, tls_data: &[u8]) -> Result<PeerOutput, PeerError> {
        let mut plaintext = self.tls.decrypt(tls_data)?;
        let result = self.handle_phase2(&plaintext);
        plaintext.zeroize();
        result
    }

    fn handle_phase2(&mut self, plaintext: &[u8]) -> Result<PeerOutput, PeerError> {
        let parsed = match tlv::parse_phase2(plaintext) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Duplicate or structurally bad TLVs force the session down.
                warn!(error = %err, "phase-2 parse failed, forcing failure");
                return self.fail_with(None);
            }
        };

        if let Some(unknown) = parsed.unknown_mandatory.first() {
            debug!(tlv_type = unknown, "unknown mandatory tlv, sending nak");
            let mut tlvs = Vec::new();
            tlv::put_nak(&mut tlvs, 0, *unknown);
            return self.respond_encrypted(tlvs, SessionStatus::InProgress);
        }

        if let Some(code) = parsed.error_code {
            warn!(code, "server reported error tlv");
            return self.fail_with(None);
        }

        if parsed.result == Some(Status::Failure) {
            debug!("server reported failure result");
            return self.fail_with(None);
        }

        // A provisioned PAC is only valid alongside a success result.
        if parsed.pac.is_some() && parsed.result != Some(Status::Success) {
            warn!("pac tlv without success result");
            return self.fail_with(Some(ERROR_UNEXPECTED_TLVS_EXCHANGED));
        }

        let mut tlvs = Vec::new();
        let mut status = SessionStatus::InProgress;

        if let Some(identity_type) = parsed.identity_type {
            debug!(identity_type, "echoing identity type");
            tlv::put_identity_type(&mut tlvs, identity_type);
        }

        if let Some(prompt) = parsed.basic_auth_req {
            self.answer_basic_auth(prompt, &mut tlvs)?;
            if self.state == PeerState::Failure {
                return self.fail_with(None);
            }
        } else if let Some(packet) = parsed.eap_payload {
            match self.answer_eap_payload(packet, &mut tlvs)? {
                InnerOutcome::Responded => {}
                InnerOutcome::Pending => {
                    self.pending_request = Some(packet.to_vec());
                    return Ok(PeerOutput {
                        response: None,
                        status: SessionStatus::Pending,
                    });
                }
                InnerOutcome::Rejected => return self.fail_with(None),
            }
        }

        if let Some(cb) = &parsed.crypto_binding {
            match self.answer_crypto_binding(cb, &parsed, &mut tlvs) {
                Ok(final_success) => {
                    if final_success {
                        status = SessionStatus::Success;
                    }
                }
                Err(PeerError::TunnelCompromise) => {
                    return self.fail_with(Some(ERROR_TUNNEL_COMPROMISE));
                }
                Err(other) => return Err(other),
            }
        } else if parsed.result == Some(Status::Success) {
            if self.requires_binding {
                warn!("success result without required crypto binding");
                return self.fail_with(Some(ERROR_TUNNEL_COMPROMISE));
            }
            // Client-certificate or resumption fast path with no inner auth.
            tlv::put_result(&mut tlvs, false, Status::Success);
            self.finish_success()?;
            status = SessionStatus::Success;
        }

        self.maybe_request_pac(&mut tlvs);
        self.respond_encrypted(tlvs, status)
    }

    fn answer_basic_auth(&mut self, prompt: &[u8], tlvs: &mut Vec<u8>) -> Result<(), PeerError> {
        if !prompt.is_empty() {
            debug!(prompt_len = prompt.len(), "basic password auth prompt");
        }
        let Some(password) = self.config.password.clone() else {
            warn!("basic password auth requested but no password configured");
            self.state = PeerState::Failure;
            return Ok(());
        };

        let identity = self.config.identity.as_bytes();
        let password = password.as_bytes();
        let mut value = Vec::with_capacity(2 + identity.len() + password.len());
        value.push(identity.len() as u8);
        value.extend_from_slice(identity);
        value.push(password.len() as u8);
        value.extend_from_slice(password);
        tlv::put_tlv(tlvs, TlvType::BasicPasswordAuthResp, true, &value);
        value.zeroize();

        self.requires_binding = true;
        self.state = PeerState::Phase2BasicAuth;
        Ok(())
    }

    fn answer_eap_payload(
        &mut self,
        packet_bytes: &[u8],
        tlvs: &mut Vec<u8>,
    ) -> Result<InnerOutcome, PeerError> {
        let packet = EapPacket::parse(packet_bytes)?;
        if packet.code != EAP_CODE_REQUEST {
            warn!(code = packet.code, "unexpected inner eap code");
            return Ok(InnerOutcome::Rejected);
        }

        match packet.eap_type {
            Some(EAP_TYPE_IDENTITY) => {
                let response =
                    inner::build_identity_response(packet.identifier, self.config.identity.as_bytes());
                tlv::put_eap_payload(tlvs, &response);
                self.state = PeerState::Phase2Identity;
                Ok(InnerOutcome::Responded)
            }
            Some(method_type) => self.drive_inner_method(method_type, &packet, tlvs),
            None => {
                warn!("inner eap request without type");
                Ok(InnerOutcome::Rejected)
            }
        }
    }

    fn drive_inner_method(
        &mut self,
        method_type: u8,
        packet: &EapPacket<'_>,
        tlvs: &mut Vec<u8>,
    ) -> Result<InnerOutcome, PeerError> {
        // AKA offered while AKA' is locally preferred is a bidding-down
        // attempt; reject rather than negotiate.
        if method_type == EAP_TYPE_AKA
            && self.config.allowed_inner_types.contains(&EAP_TYPE_AKA_PRIME)
        {
            warn!("aka offered while aka' supported, rejecting bid-down");
            return Ok(InnerOutcome::Rejected);
        }
        if self.anon_provisioning && !ANON_PROVISIONING_INNER_TYPES.contains(&method_type) {
            warn!(method_type, "inner method not allowed during anonymous provisioning");
            return Ok(InnerOutcome::Rejected);
        }

        let index = match self.active_inner {
            Some(index) if self.inner_methods[index].method_type() == method_type => Some(index),
            _ => self
                .inner_methods
                .iter()
                .position(|method| method.method_type() == method_type),
        };
        let Some(index) = index else {
            debug!(method_type, "inner method unsupported, sending nak");
            let nak = inner::build_nak_response(packet.identifier, &self.config.allowed_inner_types);
            tlv::put_eap_payload(tlvs, &nak);
            return Ok(InnerOutcome::Responded);
        };

        self.active_inner = Some(index);
        self.requires_binding = true;
        match self.inner_methods[index].process(packet)? {
            InnerStep::Response(response) => {
                tlv::put_eap_payload(tlvs, &response);
                self.state = PeerState::Phase2Method;
                Ok(InnerOutcome::Responded)
            }
            InnerStep::Pending => Ok(InnerOutcome::Pending),
        }
    }

    fn resume_pending(&mut self) -> Result<PeerOutput, PeerError> {
        let stored = self.pending_request.take().expect("pending request present");
        let mut tlvs = Vec::new();
        match self.answer_eap_payload(&stored, &mut tlvs)? {
            InnerOutcome::Responded => self.respond_encrypted(tlvs, SessionStatus::InProgress),
            InnerOutcome::Pending => {
                self.pending_request = Some(stored);
                Ok(PeerOutput {
                    response: None,
                    status: SessionStatus::Pending,
                })
            }
            InnerOutcome::Rejected => self.fail_with(None),
        }
    }

    /// Validates a crypto-binding request and appends the answer; returns
    /// whether this message completed the session.
    fn answer_crypto_binding(
        &mut self,
        cb: &CryptoBinding,
        parsed: &Phase2Payload<'_>,
        tlvs: &mut Vec<u8>,
    ) -> Result<bool, PeerError> {
        self.validate_binding_request(cb)?;
        self.bind_round_keys();

        let keys = self.keys.as_ref().ok_or(PeerError::TunnelCompromise)?;
        let alg = keys.mac_algorithm();

        let msk_requested = cb.flags & CMAC_MSK != 0;
        let emsk_requested = cb.flags & CMAC_EMSK != 0;

        if cb.flags == CMAC_EMSK && !keys.cmk_emsk_available() {
            warn!("server demands emsk binding but no emsk chain exists");
            return Err(PeerError::TunnelCompromise);
        }
        if msk_requested
            && !binding::verify_compound_mac(
                alg,
                cb,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_msk(),
                &cb.msk_compound_mac,
            )
        {
            warn!("msk compound mac mismatch");
            return Err(PeerError::TunnelCompromise);
        }
        if emsk_requested
            && keys.cmk_emsk_available()
            && !binding::verify_compound_mac(
                alg,
                cb,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_emsk(),
                &cb.emsk_compound_mac,
            )
        {
            warn!("emsk compound mac mismatch");
            return Err(PeerError::TunnelCompromise);
        }

        // Build the response: echo with the nonce low bit set.
        let mut response = cb.clone();
        response.subtype = CB_SUBTYPE_RESPONSE;
        response.version = self.version;
        response.received_version = cb.version;
        response.nonce[31] |= 0x01;
        let include_emsk = emsk_requested && keys.cmk_emsk_available();
        response.flags = if include_emsk { CMAC_EMSK_AND_MSK } else { CMAC_MSK };
        response.msk_compound_mac = binding::compute_compound_mac(
            alg,
            &response,
            &self.server_outer_tlvs,
            &self.peer_outer_tlvs,
            keys.cmk_msk(),
        );
        response.emsk_compound_mac = if include_emsk {
            binding::compute_compound_mac(
                alg,
                &response,
                &self.server_outer_tlvs,
                &self.peer_outer_tlvs,
                keys.cmk_emsk(),
            )
        } else {
            [0u8; 20]
        };

        let final_round = parsed.result == Some(Status::Success);
        if let Some(result) = parsed.intermediate_result {
            tlv::put_result(tlvs, true, result);
        }
        if final_round {
            tlv::put_result(tlvs, false, Status::Success);
        }
        tlvs.extend_from_slice(&response.to_tlv_bytes());

        if let Some(pac_value) = parsed.pac {
            self.store_provisioned_pac(pac_value, tlvs)?;
        }

        if final_round {
            self.finish_success()?;
            Ok(true)
        } else {
            // Round complete; the next inner method starts fresh.
            self.active_inner = None;
            self.inner_bound = false;
            self.state = PeerState::CryptoBinding;
            Ok(false)
        }
    }

    fn validate_binding_request(&self, cb: &CryptoBinding) -> Result<(), PeerError> {
        if cb.subtype != CB_SUBTYPE_REQUEST {
            warn!(subtype = cb.subtype, "crypto binding is not a request");
            return Err(PeerError::TunnelCompromise);
        }
        if cb.flags == 0 || cb.flags > CMAC_EMSK_AND_MSK {
            warn!(flags = cb.flags, "crypto binding flags out of range");
            return Err(PeerError::TunnelCompromise);
        }
        if cb.version != self.version || cb.received_version != self.version {
            warn!(
                version = cb.version,
                received = cb.received_version,
                "crypto binding version mismatch"
            );
            return Err(PeerError::TunnelCompromise);
        }
        if cb.nonce[31] & 0x01 != 0 {
            warn!("request nonce has low bit set");
            return Err(PeerError::TunnelCompromise);
        }
        Ok(())
    }

    /// Folds this round's inner keys into the chain, exactly once per round.
    fn bind_round_keys(&mut self) {
        if self.inner_bound {
            return;
        }
        let Some(keys) = self.keys.as_mut() else {
            return;
        };
        if let Some(index) = self.active_inner {
            let method = &self.inner_methods[index];
            let msk = method.key();
            let emsk = method.emsk();
            keys.advance(msk.as_deref(), emsk.as_deref());
        } else if keys.simck_index() == 0 {
            // Basic-password or no inner auth: one-shot CMK, chain untouched.
            keys.basic_password_cmk();
        }
        // No new inner keys this round: the previous round's CMK stands.
        self.inner_bound = true;
    }

    fn store_provisioned_pac(
        &mut self,
        pac_value: &[u8],
        tlvs: &mut Vec<u8>,
    ) -> Result<(), PeerError> {
        let entry = pac::parse_pac_tlv(pac_value)?;
        debug!(pac_type = entry.pac_type, "storing provisioned pac");
        self.pacs.add_or_replace(entry)?;
        tlv::put_tlv(tlvs, TlvType::Pac, true, &pac::encode_pac_ack(true));
        self.state = PeerState::RequestPac;
        Ok(())
    }

    fn finish_success(&mut self) -> Result<(), PeerError> {
        let keys = self.keys.as_ref().ok_or(PeerError::TunnelCompromise)?;
        self.msk = Some(keys.msk());
        self.emsk = Some(keys.emsk());
        self.state = PeerState::Success;
        debug!("teap session succeeded");
        Ok(())
    }

    fn maybe_request_pac(&mut self, tlvs: &mut Vec<u8>) {
        if self.pac_requested
            || !self.config.request_tunnel_pac
            || self.using_pac
            || self.config.provisioning == ProvisioningMode::Disabled
            || self.state == PeerState::Success
            || self.state == PeerState::Failure
            || tlvs.is_empty()
        {
            return;
        }
        debug!("requesting tunnel pac provisioning");
        let mut nested = Vec::new();
        tlv::put_tlv(
            &mut nested,
            TlvType::Pac,
            true,
            &pac::encode_pac_request(PAC_TYPE_TUNNEL),
        );
        tlv::put_request_action(tlvs, Status::Success.to_wire() as u8, ACTION_PROCESS_TLV, &nested);
        self.pac_requested = true;
    }

    fn respond_encrypted(
        &mut self,
        mut tlvs: Vec<u8>,
        status: SessionStatus,
    ) -> Result<PeerOutput, PeerError> {
        if tlvs.is_empty() {
            return Ok(PeerOutput::with_status(
                wire::build_fragment_ack(self.version),
                status,
            ));
        }
        let ciphertext = self.tls.encrypt(&tlvs)?;
        tlvs.zeroize();
        Ok(PeerOutput::with_status(
            wire::build_frame(self.version, false, &ciphertext, &[]),
            status,
        ))
    }

    /// Protocol-level failure: acknowledge with Result(Failure) and an
    /// optional Error TLV, then terminate.
    fn fail_with(&mut self, error_code: Option<u32>) -> Result<PeerOutput, PeerError> {
        let mut tlvs = Vec::new();
        tlv::put_result(&mut tlvs, false, Status::Failure);
        if let Some(code) = error_code {
            tlv::put_error(&mut tlvs, code);
        }
        self.state = PeerState::Failure;
        let ciphertext = self.tls.encrypt(&tlvs)?;
        Ok(PeerOutput::with_status(
            wire::build_frame(self.version, false, &ciphertext, &[]),
            SessionStatus::Failure,
        ))
    }
}

enum InnerOutcome {
    Responded,
    Pending,
    Rejected,
}

impl Drop for TeapPeer {
    fn drop(&mut self) {
        if let Some(msk) = self.msk.as_mut() {
            msk.zeroize();
        }
        if let Some(emsk) = self.emsk.as_mut() {
            emsk.zeroize();
        }
    }
}
