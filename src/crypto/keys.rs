// TEAP key schedule: session key seed, S-IMCK chain, CMK, MSK/EMSK export.

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::prf::{self, MacAlgorithm};

/// TLS exporter label feeding the outer tunnel's keys into the schedule.
pub const TLS_EXPORTER_LABEL: &str = "EXPORTER: teap session key seed";

pub const SESSION_KEY_SEED_LEN: usize = 40;
pub const SIMCK_LEN: usize = 40;
pub const CMK_LEN: usize = 20;
pub const MSK_LEN: usize = 64;
pub const EMSK_LEN: usize = 64;

const IMSK_LEN: usize = 32;
const IMCK_LEN: usize = SIMCK_LEN + CMK_LEN;

const LABEL_IMCK: &str = "Inner Methods Compound Keys";
const LABEL_BIND_KEY: &str = "TEAPbindkey@ietf.org";
const LABEL_MSK: &str = "Session Key Generating Function";
const LABEL_EMSK: &str = "Extended Session Key Generating Function";

/// Per-session key-chain state, one instance per peer or server session.
///
/// Both S-IMCK chains start from the TLS-exported session key seed and are
/// overwritten in place as rounds complete; all fields are wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyState {
    #[zeroize(skip)]
    alg: MacAlgorithm,
    simck_msk: [u8; SIMCK_LEN],
    simck_emsk: [u8; SIMCK_LEN],
    cmk_msk: [u8; CMK_LEN],
    cmk_emsk: [u8; CMK_LEN],
    simck_index: u32,
    cmk_emsk_available: bool,
}

impl KeyState {
    /// Seeds both chains with the TLS-exported session key seed; `simck_index` = 0.
    pub fn new(alg: MacAlgorithm, session_key_seed: &[u8; SESSION_KEY_SEED_LEN]) -> Self {
        Self {
            alg,
            simck_msk: *session_key_seed,
            simck_emsk: *session_key_seed,
            cmk_msk: [0u8; CMK_LEN],
            cmk_emsk: [0u8; CMK_LEN],
            simck_index: 0,
            cmk_emsk_available: false,
        }
    }

    pub fn mac_algorithm(&self) -> MacAlgorithm {
        self.alg
    }

    pub fn simck_index(&self) -> u32 {
        self.simck_index
    }

    pub fn cmk_msk(&self) -> &[u8; CMK_LEN] {
        &self.cmk_msk
    }

    /// CMK from the EMSK-path chain; only meaningful when
    /// [`KeyState::cmk_emsk_available`] is true.
    pub fn cmk_emsk(&self) -> &[u8; CMK_LEN] {
        &self.cmk_emsk
    }

    pub fn cmk_emsk_available(&self) -> bool {
        self.cmk_emsk_available
    }

    /// Advances the chain after one validated inner-method round.
    ///
    /// Runs the MSK-path derivation always; the EMSK-path only when the
    /// inner method produced an EMSK (the EMSK chain cannot continue past a
    /// round that lacks one). Increments `simck_index` exactly once.
    pub fn advance(&mut self, inner_msk: Option<&[u8]>, inner_emsk: Option<&[u8]>) {
        let mut imsk = [0u8; IMSK_LEN];
        if let Some(msk) = inner_msk {
            let take = msk.len().min(IMSK_LEN);
            imsk[..take].copy_from_slice(&msk[..take]);
        }

        let mut imck = [0u8; IMCK_LEN];
        prf::prf(self.alg, &self.simck_msk, LABEL_IMCK, &imsk, &mut imck);
        self.simck_msk.copy_from_slice(&imck[..SIMCK_LEN]);
        self.cmk_msk.copy_from_slice(&imck[SIMCK_LEN..]);

        if let Some(emsk) = inner_emsk {
            let mut bound = [0u8; 64];
            let mut seed = [0u8; 4];
            seed[2..].copy_from_slice(&64u16.to_be_bytes());
            prf::prf(self.alg, emsk, LABEL_BIND_KEY, &seed, &mut bound);

            let mut imsk_emsk = [0u8; IMSK_LEN];
            imsk_emsk.copy_from_slice(&bound[..IMSK_LEN]);
            prf::prf(self.alg, &self.simck_emsk, LABEL_IMCK, &imsk_emsk, &mut imck);
            self.simck_emsk.copy_from_slice(&imck[..SIMCK_LEN]);
            self.cmk_emsk.copy_from_slice(&imck[SIMCK_LEN..]);
            self.cmk_emsk_available = true;

            bound.zeroize();
            imsk_emsk.zeroize();
        } else {
            self.cmk_emsk_available = false;
        }

        imsk.zeroize();
        imck.zeroize();
        self.simck_index += 1;
    }

    /// One-shot CMK for Basic-Password-Auth sessions with no inner EAP.
    ///
    /// Zero IMSK keyed by the current MSK-path S-IMCK; the chain is NOT
    /// advanced and `simck_index` does not change. RFC 7170 leaves this
    /// case undefined; this mirrors the interoperable reference behavior.
    pub fn basic_password_cmk(&mut self) {
        let imsk = [0u8; IMSK_LEN];
        let mut imck = [0u8; IMCK_LEN];
        prf::prf(self.alg, &self.simck_msk, LABEL_IMCK, &imsk, &mut imck);
        self.cmk_msk.copy_from_slice(&imck[SIMCK_LEN..]);
        self.cmk_emsk_available = false;
        imck.zeroize();
    }

    /// Outer-method MSK from the final S-IMCK.
    ///
    /// RFC 7170 does not say which chain feeds this; the MSK-path chain is
    /// used, matching deployed implementations.
    pub fn msk(&self) -> [u8; MSK_LEN] {
        let mut out = [0u8; MSK_LEN];
        prf::prf(self.alg, &self.simck_msk, LABEL_MSK, b"", &mut out);
        out
    }

    /// Outer-method EMSK from the final S-IMCK (MSK-path chain, as above).
    pub fn emsk(&self) -> [u8; EMSK_LEN] {
        let mut out = [0u8; EMSK_LEN];
        prf::prf(self.alg, &self.simck_msk, LABEL_EMSK, b"", &mut out);
        out
    }
}

impl std::fmt::Debug for KeyState {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyState")
            .field("alg", &self.alg)
            .field("simck_index", &self.simck_index)
            .field("cmk_emsk_available", &self.cmk_emsk_available)
            .finish_non_exhaustive()
    }
}
