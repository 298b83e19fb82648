use crate::errors::{LedgerError, LedgerResult};
use crate::games::outcome::{Entropy, OutcomeSource};
use crate::games::types::{FairnessProof, GameKind};
use crate::storage::LedgerStorage;
use schnorrkel::context::SigningContext;
use schnorrkel::vrf::{VRFInOut, VRFPreOut, VRFProof};
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, PublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"casino-ledger";
const VRF_OUTPUT_CONTEXT: &[u8] = b"casino-ledger-outcome";
const VRF_SEED_KEY: &[u8] = b"vrf:mini_secret_seed";

/// VRF-based outcome source
///
/// The round input goes through schnorrkel's VRF: the pre-output is unique
/// for a key and input, so the operator cannot re-roll a round. Outcome
/// bytes are the SHA-256 of the bytes derived from the VRF in/out; anyone
/// holding the public key can check the proof and recompute them.
pub struct VrfOutcomeSource {
    keypair: Arc<Keypair>,
}

impl VrfOutcomeSource {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    /// Random keypair, not persisted (for testing)
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        let mini = MiniSecretKey::generate_with(OsRng);
        Self::new(mini.expand_to_keypair(ExpansionMode::Ed25519))
    }

    /// Load the signing seed from storage, creating it on first start.
    pub fn load_or_create(storage: &LedgerStorage) -> LedgerResult<Self> {
        if let Some(existing) = storage.get(VRF_SEED_KEY)? {
            let seed: [u8; 32] = existing
                .try_into()
                .map_err(|_| LedgerError::Storage("VRF seed must be 32 bytes".to_string()))?;
            let mini = MiniSecretKey::from_bytes(&seed)
                .map_err(|e| LedgerError::Storage(format!("Invalid VRF seed: {:?}", e)))?;
            return Ok(Self::new(mini.expand_to_keypair(ExpansionMode::Ed25519)));
        }

        use rand_core::OsRng;
        let mini = MiniSecretKey::generate_with(OsRng);
        storage.put(VRF_SEED_KEY, &mini.to_bytes())?;
        tracing::info!("Generated new VRF signing key");

        Ok(Self::new(mini.expand_to_keypair(ExpansionMode::Ed25519)))
    }

    pub fn input_message(round_id: &str, game: GameKind, user_id: &str) -> String {
        format!("{}:{}:{}", round_id, game, user_id)
    }

    /// Evaluate the VRF on `message`: outcome bytes, pre-output, proof.
    fn vrf_sign(&self, message: &[u8]) -> ([u8; 32], [u8; 32], [u8; 64]) {
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let (inout, proof, _) = self.keypair.vrf_sign(ctx.bytes(message));
        (outcome_bytes(&inout), inout.to_preout().to_bytes(), proof.to_bytes())
    }

    /// Outcome bytes of a stored proof, or `None` when the proof does not
    /// verify for `expected_input`.
    pub fn verified_outcome(proof: &FairnessProof, expected_input: &str) -> LedgerResult<Option<[u8; 32]>> {
        if proof.input_message != expected_input {
            return Ok(None);
        }

        let pre_output_bytes = hex::decode(&proof.vrf_output)
            .map_err(|e| LedgerError::invalid(format!("Invalid VRF output hex: {}", e)))?;
        let proof_bytes = hex::decode(&proof.vrf_proof)
            .map_err(|e| LedgerError::invalid(format!("Invalid VRF proof hex: {}", e)))?;
        let public_key_bytes = hex::decode(&proof.public_key)
            .map_err(|e| LedgerError::invalid(format!("Invalid public key hex: {}", e)))?;

        let public_key = PublicKey::from_bytes(&public_key_bytes)
            .map_err(|e| LedgerError::invalid(format!("Invalid public key: {:?}", e)))?;
        // Bytes that are not a curve point cannot verify.
        let (Ok(pre_output), Ok(vrf_proof)) = (
            VRFPreOut::from_bytes(&pre_output_bytes),
            VRFProof::from_bytes(&proof_bytes),
        ) else {
            return Ok(None);
        };

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        match public_key.vrf_verify(ctx.bytes(expected_input.as_bytes()), &pre_output, &vrf_proof) {
            Ok((inout, _)) => Ok(Some(outcome_bytes(&inout))),
            Err(_) => Ok(None),
        }
    }

    /// Public verification of a stored proof.
    pub fn verify_proof(proof: &FairnessProof, expected_input: &str) -> LedgerResult<bool> {
        Ok(Self::verified_outcome(proof, expected_input)?.is_some())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }
}

impl OutcomeSource for VrfOutcomeSource {
    fn draw(&self, round_id: &str, game: GameKind, user_id: &str) -> LedgerResult<Entropy> {
        let input_message = Self::input_message(round_id, game, user_id);
        let (bytes, pre_output, proof) = self.vrf_sign(input_message.as_bytes());

        Ok(Entropy {
            bytes,
            proof: Some(FairnessProof {
                vrf_output: hex::encode(pre_output),
                vrf_proof: hex::encode(proof),
                public_key: self.public_key_hex(),
                input_message,
            }),
        })
    }
}

fn outcome_bytes(inout: &VRFInOut) -> [u8; 32] {
    let raw: [u8; 32] = inout.make_bytes(VRF_OUTPUT_CONTEXT);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&Sha256::digest(raw));
    bytes
}
