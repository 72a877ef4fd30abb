// The transaction model: one tagged record with five variants. The variant's
// validity predicate and its inclusion-eligibility predicate are the entire
// behavioral difference between them; everything else (fingerprinting,
// canonical encoding, fee handling) is shared.

use crate::core::contract;
use crate::core::monetary::GENESIS_SENDER;
use crate::error::{NodeError, Result};
use crate::utils::{
    current_timestamp, ecdsa_p256_sha256_sign_verify, deserialize, serialize, sha256_digest,
};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

/// Metadata budget per transaction, in bytes
pub const MAX_METADATA_BYTES: usize = 1024;

/// One collected signature on a multi-signature transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SignatureEntry {
    pub signer: String,
    pub signature: Vec<u8>,
}

/// Variant tag plus the variant-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum TxKind {
    /// Debit sender by amount+fee, credit recipient by amount
    Standard,
    /// Pending until enough signatures are collected, then behaves as a
    /// transfer from the pooled signers
    MultiSig {
        signers: Vec<String>,
        required_signatures: usize,
        collected_signatures: Vec<SignatureEntry>,
    },
    /// Held back from inclusion until the unlock time passes
    TimeLocked { unlock_time: i64 },
    /// Carries a blob in the metadata field; only the fee moves balances
    DataStorage { data_hash: Vec<u8> },
    /// Script evaluated under a bounded budget; effects are explicit
    /// credit tuples returned by the evaluator
    SmartContract { code_ref: Vec<u8>, args: Vec<i64> },
}

impl TxKind {
    pub fn tag(&self) -> &'static str {
        match self {
            TxKind::Standard => "standard",
            TxKind::MultiSig { .. } => "multi_sig",
            TxKind::TimeLocked { .. } => "time_locked",
            TxKind::DataStorage { .. } => "data_storage",
            TxKind::SmartContract { .. } => "smart_contract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    kind: TxKind,
    sender: String,
    recipient: String,
    amount: u64,
    fee: u64,
    timestamp: i64,
    metadata: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
}

impl Transaction {
    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_kind(&self) -> &TxKind {
        &self.kind
    }

    pub fn get_sender(&self) -> &str {
        &self.sender
    }

    pub fn get_recipient(&self) -> &str {
        &self.recipient
    }

    pub fn get_amount(&self) -> u64 {
        self.amount
    }

    pub fn get_fee(&self) -> u64 {
        self.fee
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    pub fn is_genesis_allocation(&self) -> bool {
        self.sender == GENESIS_SENDER
    }

    /// Total the sender side must fund
    pub fn debit_total(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize::<Transaction>(bytes)
    }

    /// Canonical bytes of everything the fingerprint covers: all fields
    /// except the id itself, the signature, and any collected signatures
    pub fn canonicalize(&self) -> Result<Vec<u8>> {
        let mut stripped = self.clone();
        stripped.id = Vec::new();
        stripped.signature = None;
        if let TxKind::MultiSig {
            collected_signatures,
            ..
        } = &mut stripped.kind
        {
            collected_signatures.clear();
        }
        serialize(&stripped)
    }

    /// Content-addressed id: hash of the canonical serialization
    pub fn fingerprint(&self) -> Result<Vec<u8>> {
        Ok(sha256_digest(&self.canonicalize()?))
    }

    /// Structural validity: field ranges, metadata budget, variant-specific
    /// required fields, fingerprint integrity, and the signature hook.
    pub fn verify_structure(&self, enforce_signatures: bool) -> Result<()> {
        if let Some(metadata) = &self.metadata {
            if metadata.len() > MAX_METADATA_BYTES {
                return Err(NodeError::Validation(format!(
                    "metadata {} bytes exceeds budget of {MAX_METADATA_BYTES}",
                    metadata.len()
                )));
            }
        }

        match &self.kind {
            TxKind::Standard => {
                if self.amount == 0 && !self.is_genesis_allocation() {
                    return Err(NodeError::Validation(
                        "standard transaction amount must be positive".to_string(),
                    ));
                }
            }
            TxKind::MultiSig {
                signers,
                required_signatures,
                collected_signatures,
            } => {
                if signers.is_empty() {
                    return Err(NodeError::Validation(
                        "multi-sig transaction has no signers".to_string(),
                    ));
                }
                if *required_signatures == 0 || *required_signatures > signers.len() {
                    return Err(NodeError::Validation(format!(
                        "required_signatures {} outside 1..={}",
                        required_signatures,
                        signers.len()
                    )));
                }
                if self.sender != signers.join(",") {
                    return Err(NodeError::Validation(
                        "multi-sig sender must be the joined signer list".to_string(),
                    ));
                }
                for entry in collected_signatures {
                    if !signers.iter().any(|s| s == &entry.signer) {
                        return Err(NodeError::Validation(format!(
                            "signature from non-signer {}",
                            entry.signer
                        )));
                    }
                }
                let mut seen: Vec<&str> = Vec::new();
                for entry in collected_signatures {
                    if seen.contains(&entry.signer.as_str()) {
                        return Err(NodeError::Validation(format!(
                            "duplicate signature from {}",
                            entry.signer
                        )));
                    }
                    seen.push(&entry.signer);
                }
            }
            TxKind::TimeLocked { unlock_time } => {
                if *unlock_time <= 0 {
                    return Err(NodeError::Validation(
                        "time-locked transaction needs a positive unlock time".to_string(),
                    ));
                }
            }
            TxKind::DataStorage { data_hash } => {
                let data = self.metadata.as_deref().ok_or_else(|| {
                    NodeError::Validation("data storage transaction carries no data".to_string())
                })?;
                if sha256_digest(data) != *data_hash {
                    return Err(NodeError::Validation(
                        "data hash does not match stored blob".to_string(),
                    ));
                }
            }
            TxKind::SmartContract { code_ref, .. } => {
                let code = self.metadata.as_deref().ok_or_else(|| {
                    NodeError::Validation("contract transaction carries no code".to_string())
                })?;
                if sha256_digest(code) != *code_ref {
                    return Err(NodeError::Validation(
                        "code_ref does not match contract source".to_string(),
                    ));
                }
            }
        }

        let expected = self.fingerprint()?;
        if expected != self.id {
            return Err(NodeError::Validation(format!(
                "fingerprint mismatch: computed {}, claimed {}",
                HEXLOWER.encode(&expected),
                HEXLOWER.encode(&self.id)
            )));
        }

        self.verify_signature(enforce_signatures)
    }

    /// Signature boundary. With enforcement off the hook accepts everything;
    /// it is still called from structural verification so the boundary is
    /// never silently skipped. With enforcement on, the sender (or each
    /// multi-sig signer) is treated as a hex-encoded ECDSA P-256 public key
    /// and the signature must cover the canonical bytes.
    pub fn verify_signature(&self, enforce: bool) -> Result<()> {
        if !enforce || self.is_genesis_allocation() {
            return Ok(());
        }

        let message = self.canonicalize()?;
        match &self.kind {
            TxKind::MultiSig {
                collected_signatures,
                ..
            } => {
                for entry in collected_signatures {
                    let key = HEXLOWER
                        .decode(entry.signer.as_bytes())
                        .map_err(|_| NodeError::Validation(format!(
                            "signer {} is not a hex public key",
                            entry.signer
                        )))?;
                    if !ecdsa_p256_sha256_sign_verify(&key, &entry.signature, &message) {
                        return Err(NodeError::Validation(format!(
                            "invalid signature from {}",
                            entry.signer
                        )));
                    }
                }
                Ok(())
            }
            _ => {
                let signature = self.signature.as_deref().ok_or_else(|| {
                    NodeError::Validation("signature missing".to_string())
                })?;
                let key = HEXLOWER
                    .decode(self.sender.as_bytes())
                    .map_err(|_| NodeError::Validation(format!(
                        "sender {} is not a hex public key",
                        self.sender
                    )))?;
                if !ecdsa_p256_sha256_sign_verify(&key, signature, &message) {
                    return Err(NodeError::Validation("invalid signature".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Whether the transaction may enter a block assembled at `now`
    pub fn is_eligible_for_inclusion(&self, now: i64) -> bool {
        match &self.kind {
            TxKind::MultiSig {
                required_signatures,
                collected_signatures,
                ..
            } => collected_signatures.len() >= *required_signatures,
            TxKind::TimeLocked { unlock_time } => *unlock_time <= now,
            TxKind::SmartContract { .. } => match self.metadata.as_deref() {
                Some(code) => match std::str::from_utf8(code) {
                    Ok(source) => contract::parse(source).is_ok(),
                    Err(_) => false,
                },
                None => false,
            },
            _ => true,
        }
    }

    /// Append a signature to a pending multi-sig transaction. Idempotent per
    /// signer; rejected once the required count is reached.
    pub fn add_signature(&mut self, signer: &str, signature: Vec<u8>) -> Result<()> {
        match &mut self.kind {
            TxKind::MultiSig {
                signers,
                required_signatures,
                collected_signatures,
            } => {
                if !signers.iter().any(|s| s == signer) {
                    return Err(NodeError::Validation(format!(
                        "{signer} is not a signer of this transaction"
                    )));
                }
                if collected_signatures.iter().any(|e| e.signer == signer) {
                    return Ok(());
                }
                if collected_signatures.len() >= *required_signatures {
                    return Err(NodeError::Validation(
                        "transaction is already fully signed".to_string(),
                    ));
                }
                collected_signatures.push(SignatureEntry {
                    signer: signer.to_string(),
                    signature,
                });
                Ok(())
            }
            _ => Err(NodeError::Validation(
                "signatures can only be added to multi-sig transactions".to_string(),
            )),
        }
    }

    /// Attach the sender's signature over the canonical bytes
    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }
}

/// Constructs each variant with defaults populated: timestamp stamped,
/// fingerprint computed into the id.
pub struct TransactionBuilder;

impl TransactionBuilder {
    pub fn standard(
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::Standard,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: current_timestamp()?,
            metadata: None,
            signature: None,
        })
    }

    pub fn standard_with_metadata(
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
        metadata: Vec<u8>,
    ) -> Result<Transaction> {
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::Standard,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: current_timestamp()?,
            metadata: Some(metadata),
            signature: None,
        })
    }

    pub fn multi_sig(
        signers: Vec<String>,
        recipient: &str,
        amount: u64,
        fee: u64,
        required_signatures: usize,
    ) -> Result<Transaction> {
        let sender = signers.join(",");
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::MultiSig {
                signers,
                required_signatures,
                collected_signatures: Vec::new(),
            },
            sender,
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: current_timestamp()?,
            metadata: None,
            signature: None,
        })
    }

    pub fn time_locked(
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
        unlock_time: i64,
    ) -> Result<Transaction> {
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::TimeLocked { unlock_time },
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: current_timestamp()?,
            metadata: None,
            signature: None,
        })
    }

    pub fn data_storage(sender: &str, data: Vec<u8>, fee: u64) -> Result<Transaction> {
        let data_hash = sha256_digest(&data);
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::DataStorage { data_hash },
            sender: sender.to_string(),
            recipient: "0x0".to_string(),
            amount: 0,
            fee,
            timestamp: current_timestamp()?,
            metadata: Some(data),
            signature: None,
        })
    }

    pub fn smart_contract(
        sender: &str,
        code: &str,
        args: Vec<i64>,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        // Fail early on programs the evaluator would reject anyway
        contract::parse(code)?;
        let code_ref = sha256_digest(code.as_bytes());
        let recipient = format!("contract-{}", &HEXLOWER.encode(&code_ref)[..16]);
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::SmartContract { code_ref, args },
            sender: sender.to_string(),
            recipient,
            amount,
            fee,
            timestamp: current_timestamp()?,
            metadata: Some(code.as_bytes().to_vec()),
            signature: None,
        })
    }

    /// Opening balance folded into the genesis block. Timestamp is pinned to
    /// zero so every identically-configured node derives the same genesis.
    pub fn genesis_allocation(recipient: &str, amount: u64) -> Result<Transaction> {
        Self::finalize(Transaction {
            id: Vec::new(),
            kind: TxKind::Standard,
            sender: GENESIS_SENDER.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee: 0,
            timestamp: 0,
            metadata: None,
            signature: None,
        })
    }

    fn finalize(mut tx: Transaction) -> Result<Transaction> {
        tx.id = tx.fingerprint()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_pure_function_of_content() {
        let tx = TransactionBuilder::standard("alice", "bob", 40, 1).unwrap();
        assert_eq!(tx.fingerprint().unwrap(), tx.get_id());
        tx.verify_structure(false).unwrap();
    }

    #[test]
    fn test_fingerprint_ignores_signatures() {
        let mut tx =
            TransactionBuilder::multi_sig(vec!["a".into(), "b".into()], "carol", 10, 1, 2).unwrap();
        let before = tx.get_id().to_vec();

        tx.add_signature("a", vec![1, 2, 3]).unwrap();
        assert_eq!(tx.fingerprint().unwrap(), before);

        let mut plain = TransactionBuilder::standard("alice", "bob", 5, 1).unwrap();
        let id = plain.get_id().to_vec();
        plain.set_signature(vec![9, 9, 9]);
        assert_eq!(plain.fingerprint().unwrap(), id);
    }

    #[test]
    fn test_tampered_amount_fails_structure() {
        let tx = TransactionBuilder::standard("alice", "bob", 40, 1).unwrap();
        let mut tampered = tx.clone();
        tampered.amount = 400;
        assert!(tampered.verify_structure(false).is_err());
    }

    #[test]
    fn test_metadata_budget_boundary() {
        let at_limit = TransactionBuilder::standard_with_metadata(
            "alice",
            "bob",
            1,
            1,
            vec![0u8; MAX_METADATA_BYTES],
        )
        .unwrap();
        at_limit.verify_structure(false).unwrap();

        let over = TransactionBuilder::standard_with_metadata(
            "alice",
            "bob",
            1,
            1,
            vec![0u8; MAX_METADATA_BYTES + 1],
        )
        .unwrap();
        assert!(over.verify_structure(false).is_err());
    }

    #[test]
    fn test_multisig_signature_progression() {
        let mut tx =
            TransactionBuilder::multi_sig(vec!["a".into(), "b".into(), "c".into()], "d", 10, 1, 2)
                .unwrap();
        assert!(!tx.is_eligible_for_inclusion(0));

        tx.add_signature("a", vec![1]).unwrap();
        assert!(!tx.is_eligible_for_inclusion(0));

        // Same signer again is a no-op
        tx.add_signature("a", vec![1]).unwrap();
        assert!(!tx.is_eligible_for_inclusion(0));

        tx.add_signature("b", vec![2]).unwrap();
        assert!(tx.is_eligible_for_inclusion(0));

        // Fully signed: further signatures are rejected
        assert!(tx.add_signature("c", vec![3]).is_err());
        // Outsiders are always rejected
        assert!(tx.add_signature("mallory", vec![4]).is_err());
    }

    #[test]
    fn test_time_lock_eligibility_boundary() {
        let tx = TransactionBuilder::time_locked("alice", "bob", 10, 1, 5_000).unwrap();
        assert!(tx.is_eligible_for_inclusion(5_000));
        assert!(!tx.is_eligible_for_inclusion(4_999));
    }

    #[test]
    fn test_data_storage_hash_integrity() {
        let tx = TransactionBuilder::data_storage("alice", b"hello".to_vec(), 2).unwrap();
        tx.verify_structure(false).unwrap();

        let mut tampered = tx.clone();
        tampered.metadata = Some(b"hacked".to_vec());
        assert!(tampered.verify_structure(false).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let tx = TransactionBuilder::smart_contract("alice", "PUSH 3 PAY bob", vec![], 5, 1)
            .unwrap();
        let bytes = tx.serialize().unwrap();
        let decoded = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn test_enforced_signature_hook_round_trip() {
        use ring::signature::KeyPair;

        let pkcs8 = crate::utils::new_key_pair().unwrap();
        let rng = ring::rand::SystemRandom::new();
        let key_pair = ring::signature::EcdsaKeyPair::from_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            &pkcs8,
            &rng,
        )
        .unwrap();
        let sender = HEXLOWER.encode(key_pair.public_key().as_ref());

        let mut tx = TransactionBuilder::standard(&sender, "bob", 3, 1).unwrap();
        assert!(tx.verify_structure(true).is_err());

        let message = tx.canonicalize().unwrap();
        let signature = crate::utils::ecdsa_p256_sha256_sign_digest(&pkcs8, &message).unwrap();
        tx.set_signature(signature);
        tx.verify_structure(true).unwrap();
    }
}
