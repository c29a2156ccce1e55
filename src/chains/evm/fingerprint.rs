//! Canonical batch fingerprint: the EIP-712 typed-data digest the peers
//! sign and the session is named after.
//!
//! Domain: `{name: "Bridge", version: "3.1.0", chainId: <destination>}`.
//! Primary type `Proposals` holds the ordered array of
//! `Proposal{originDomainID uint8, depositNonce uint64,
//! resourceID bytes32, data bytes}`. Any change to any field of any
//! proposal, or to their order, changes the digest.

use crate::chains::TransferProposal;
use crate::crypto::keccak256;

const DOMAIN_NAME: &str = "Bridge";
const DOMAIN_VERSION: &str = "3.1.0";

const EIP712_DOMAIN_TYPE: &str = "EIP712Domain(string name,string version,uint256 chainId)";
const PROPOSAL_TYPE: &str =
    "Proposal(uint8 originDomainID,uint64 depositNonce,bytes32 resourceID,bytes data)";
const PROPOSALS_TYPE: &str =
    "Proposals(Proposal[] proposals)Proposal(uint8 originDomainID,uint64 depositNonce,bytes32 resourceID,bytes data)";

fn uint256_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn domain_separator(chain_id: u64) -> [u8; 32] {
    let mut buf = Vec::with_capacity(4 * 32);
    buf.extend_from_slice(&keccak256(EIP712_DOMAIN_TYPE.as_bytes()));
    buf.extend_from_slice(&keccak256(DOMAIN_NAME.as_bytes()));
    buf.extend_from_slice(&keccak256(DOMAIN_VERSION.as_bytes()));
    buf.extend_from_slice(&uint256_word(chain_id));
    keccak256(&buf)
}

fn hash_proposal(proposal: &TransferProposal) -> [u8; 32] {
    let mut buf = Vec::with_capacity(5 * 32);
    buf.extend_from_slice(&keccak256(PROPOSAL_TYPE.as_bytes()));
    buf.extend_from_slice(&uint256_word(proposal.source as u64));
    buf.extend_from_slice(&uint256_word(proposal.data.deposit_nonce));
    buf.extend_from_slice(&proposal.data.resource_id);
    buf.extend_from_slice(&keccak256(&proposal.data.data));
    keccak256(&buf)
}

/// Digest of an ordered, closed batch of proposals for the destination
/// with EVM chain id `chain_id`.
pub fn proposals_hash(proposals: &[TransferProposal], chain_id: u64) -> [u8; 32] {
    let mut array = Vec::with_capacity(proposals.len() * 32);
    for proposal in proposals {
        array.extend_from_slice(&hash_proposal(proposal));
    }
    let array_hash = keccak256(&array);

    let mut message = Vec::with_capacity(2 * 32);
    message.extend_from_slice(&keccak256(PROPOSALS_TYPE.as_bytes()));
    message.extend_from_slice(&array_hash);
    let struct_hash = keccak256(&message);

    let mut digest_input = Vec::with_capacity(2 + 2 * 32);
    digest_input.extend_from_slice(&[0x19, 0x01]);
    digest_input.extend_from_slice(&domain_separator(chain_id));
    digest_input.extend_from_slice(&struct_hash);
    keccak256(&digest_input)
}
