// Test fixtures: an in-memory loopback TLS pair and scripted inner methods.

use std::{cell::RefCell, rc::Rc};

use rand::RngCore;

use crate::{
    crypto::prf::{self, MacAlgorithm},
    inner::{
        self, EapPacket, InnerAuthenticator, InnerEapMethod, InnerError, InnerStep,
        MethodDecision, EAP_CODE_RESPONSE,
    },
    tunnel::{SessionTicketCallback, TlsTunnel, TunnelError, TICKET_MASTER_SECRET_LEN},
};

const CLIENT_HELLO: &[u8] = b"tp-client-hello";
const SERVER_FLIGHT: &[u8] = b"tp-server-flight";
const CLIENT_FINISH: &[u8] = b"tp-client-finish";
const RECORD_TAG: &[u8; 4] = b"REC:";

struct Shared {
    suite: u16,
    master: [u8; TICKET_MASTER_SECRET_LEN],
    ticket: Option<Vec<u8>>,
    resumed: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// One endpoint of a scripted in-memory "TLS" tunnel.
///
/// Faithful in shape, not in cryptography: three-leg handshake, shared
/// master secret, deterministic exporter, optional ticket resumption. Good
/// enough to exercise every TEAP path that sits on top of the engine.
pub struct LoopbackTls {
    shared: Rc<RefCell<Shared>>,
    role: Role,
    established: bool,
    ticket_cb: Option<SessionTicketCallback>,
    client_cert: bool,
}

/// Builds a connected client/server tunnel pair negotiating `suite`.
pub fn loopback_pair(suite: u16) -> (LoopbackTls, LoopbackTls) {
    let shared = Rc::new(RefCell::new(Shared {
        suite,
        master: [0u8; TICKET_MASTER_SECRET_LEN],
        ticket: None,
        resumed: false,
    }));
    let client = LoopbackTls {
        shared: Rc::clone(&shared),
        role: Role::Client,
        established: false,
        ticket_cb: None,
        client_cert: false,
    };
    let server = LoopbackTls {
        shared,
        role: Role::Server,
        established: false,
        ticket_cb: None,
        client_cert: false,
    };
    (client, server)
}

impl LoopbackTls {
    /// Marks the peer as client-certificate authenticated.
    pub fn with_client_cert(mut self) -> Self {
        self.client_cert = true;
        self
    }
}

impl TlsTunnel for LoopbackTls {
    fn is_established(&self) -> bool {
        self.established
    }

    fn handshake(&mut self, incoming: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match (self.role, incoming) {
            (Role::Client, _) if incoming.is_empty() && !self.established => {
                Ok(CLIENT_HELLO.to_vec())
            }
            (Role::Server, _) if incoming == CLIENT_HELLO => {
                let ticket = self.shared.borrow().ticket.clone();
                let mut resumed = false;
                if let (Some(ticket), Some(cb)) = (ticket, self.ticket_cb.as_mut()) {
                    if let Some(master) = cb(&ticket) {
                        self.shared.borrow_mut().master = master;
                        resumed = true;
                    }
                }
                if !resumed {
                    let mut master = [0u8; TICKET_MASTER_SECRET_LEN];
                    rand::thread_rng().fill_bytes(&mut master);
                    self.shared.borrow_mut().master = master;
                }
                self.shared.borrow_mut().resumed = resumed;
                self.established = true;
                Ok(SERVER_FLIGHT.to_vec())
            }
            (Role::Client, _) if incoming == SERVER_FLIGHT => {
                self.established = true;
                Ok(CLIENT_FINISH.to_vec())
            }
            (Role::Server, _) if incoming == CLIENT_FINISH && self.established => Ok(Vec::new()),
            _ => Err(TunnelError::Handshake("unexpected handshake message".into())),
        }
    }

    fn export_key(&self, label: &str, context: &[u8], len: usize) -> Result<Vec<u8>, TunnelError> {
        if !self.established {
            return Err(TunnelError::NotEstablished);
        }
        let shared = self.shared.borrow();
        let mut out = vec![0u8; len];
        prf::prf(MacAlgorithm::Sha256, &shared.master, label, context, &mut out);
        Ok(out)
    }

    fn cipher_suite(&self) -> Result<u16, TunnelError> {
        if !self.established {
            return Err(TunnelError::NotEstablished);
        }
        Ok(self.shared.borrow().suite)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if !self.established {
            return Err(TunnelError::NotEstablished);
        }
        let mut record = RECORD_TAG.to_vec();
        record.extend_from_slice(plaintext);
        Ok(record)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if !self.established {
            return Err(TunnelError::NotEstablished);
        }
        if ciphertext.len() < RECORD_TAG.len() || &ciphertext[..RECORD_TAG.len()] != RECORD_TAG {
            return Err(TunnelError::Record("bad record framing".into()));
        }
        Ok(ciphertext[RECORD_TAG.len()..].to_vec())
    }

    fn set_session_ticket(&mut self, ticket: &[u8]) -> Result<(), TunnelError> {
        self.shared.borrow_mut().ticket = Some(ticket.to_vec());
        Ok(())
    }

    fn set_session_ticket_callback(&mut self, cb: SessionTicketCallback) {
        self.ticket_cb = Some(cb);
    }

    fn resumed(&self) -> bool {
        self.shared.borrow().resumed
    }

    fn client_certificate_verified(&self) -> bool {
        self.client_cert
    }
}

/// Scripted peer-side inner method: answers every request, optionally
/// reporting Pending a configured number of times first.
pub struct FakePeerMethod {
    method_type: u8,
    msk: Vec<u8>,
    emsk: Option<Vec<u8>>,
    pending_remaining: u8,
    done: bool,
}

impl FakePeerMethod {
    pub fn new(method_type: u8, msk: Vec<u8>) -> Self {
        Self {
            method_type,
            msk,
            emsk: None,
            pending_remaining: 0,
            done: false,
        }
    }

    pub fn with_emsk(mut self, emsk: Vec<u8>) -> Self {
        self.emsk = Some(emsk);
        self
    }

    pub fn pending_once(method_type: u8, msk: Vec<u8>) -> Self {
        let mut method = Self::new(method_type, msk);
        method.pending_remaining = 1;
        method
    }
}

impl InnerEapMethod for FakePeerMethod {
    fn method_type(&self) -> u8 {
        self.method_type
    }

    fn process(&mut self, request: &EapPacket<'_>) -> Result<InnerStep, InnerError> {
        if self.pending_remaining > 0 {
            self.pending_remaining -= 1;
            return Ok(InnerStep::Pending);
        }
        self.done = true;
        Ok(InnerStep::Response(inner::build_packet(
            EAP_CODE_RESPONSE,
            request.identifier,
            self.method_type,
            b"fake-response",
        )))
    }

    fn is_key_available(&self) -> bool {
        self.done
    }

    fn key(&self) -> Option<Vec<u8>> {
        self.done.then(|| self.msk.clone())
    }

    fn emsk(&self) -> Option<Vec<u8>> {
        if self.done {
            self.emsk.clone()
        } else {
            None
        }
    }
}

/// Scripted server-side inner method: a fixed number of challenge rounds,
/// then success (or failure when built with `rejecting`).
pub struct FakeAuthenticator {
    method_type: u8,
    msk: Vec<u8>,
    emsk: Option<Vec<u8>>,
    rounds: u8,
    rounds_done: u8,
    accept: bool,
    done: bool,
}

impl FakeAuthenticator {
    pub fn new(method_type: u8, msk: Vec<u8>) -> Self {
        Self {
            method_type,
            msk,
            emsk: None,
            rounds: 1,
            rounds_done: 0,
            accept: true,
            done: false,
        }
    }

    pub fn with_emsk(mut self, emsk: Vec<u8>) -> Self {
        self.emsk = Some(emsk);
        self
    }

    pub fn with_rounds(mut self, rounds: u8) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.accept = false;
        self
    }
}

impl InnerAuthenticator for FakeAuthenticator {
    fn method_type(&self) -> u8 {
        self.method_type
    }

    fn initiate(&mut self, identifier: u8, _identity: &[u8]) -> Result<Vec<u8>, InnerError> {
        self.rounds_done = 1;
        Ok(inner::build_packet(
            inner::EAP_CODE_REQUEST,
            identifier,
            self.method_type,
            b"fake-challenge",
        ))
    }

    fn process(&mut self, response: &EapPacket<'_>) -> Result<MethodDecision, InnerError> {
        if response.eap_type != Some(self.method_type) {
            return Ok(MethodDecision::Failure);
        }
        if self.rounds_done < self.rounds {
            self.rounds_done += 1;
            return Ok(MethodDecision::Continue(inner::build_packet(
                inner::EAP_CODE_REQUEST,
                response.identifier.wrapping_add(1),
                self.method_type,
                b"fake-challenge",
            )));
        }
        if self.accept {
            self.done = true;
            Ok(MethodDecision::Success)
        } else {
            Ok(MethodDecision::Failure)
        }
    }

    fn key(&self) -> Option<Vec<u8>> {
        self.done.then(|| self.msk.clone())
    }

    fn emsk(&self) -> Option<Vec<u8>> {
        if self.done {
            self.emsk.clone()
        } else {
            None
        }
    }
}
