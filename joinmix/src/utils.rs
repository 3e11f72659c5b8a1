use std::str::FromStr;

use crate::errors::Error;

use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::util::misc::signed_msg_hash;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, OutPoint, PrivateKey, PublicKey, Script, Transaction};
use bitcoin_hashes::Hash;
use secp256k1::{ecdsa::Signature, Message, Secp256k1};

/// A counterparty signature as it travels on the wire: two push items for
/// legacy inputs, three for segwit (the third being the scriptCode, or the
/// witness program for bots predating the scriptCode convention).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigScript {
    Legacy {
        sig: Vec<u8>,
        pubkey: Vec<u8>,
    },
    Segwit {
        sig: Vec<u8>,
        pubkey: Vec<u8>,
        script_code: Vec<u8>,
    },
}

impl SigScript {
    pub fn sig(&self) -> &[u8] {
        match self {
            SigScript::Legacy { sig, .. } | SigScript::Segwit { sig, .. } => sig,
        }
    }

    pub fn pubkey(&self) -> &[u8] {
        match self {
            SigScript::Legacy { pubkey, .. } | SigScript::Segwit { pubkey, .. } => pubkey,
        }
    }

    pub fn script_code(&self) -> Option<&[u8]> {
        match self {
            SigScript::Legacy { .. } => None,
            SigScript::Segwit { script_code, .. } => Some(script_code),
        }
    }

    pub fn serialize(&self) -> Script {
        let builder = Builder::new().push_slice(self.sig()).push_slice(self.pubkey());
        match self.script_code() {
            None => builder.into_script(),
            Some(code) => builder.push_slice(code).into_script(),
        }
    }

    /// Parse a sig script; it must consist of exactly 2 or 3 non-empty data
    /// pushes, nothing else.
    pub fn deserialize(script: &Script) -> Result<Self, Error> {
        let mut items: Vec<Vec<u8>> = Vec::new();
        for instruction in script.instructions() {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) if !bytes.is_empty() => {
                    items.push(bytes.to_vec())
                }
                _ => return Err(Error::JunkSignature),
            }
        }
        match items.len() {
            2 => {
                let pubkey = items.pop().expect("len checked");
                let sig = items.pop().expect("len checked");
                Ok(SigScript::Legacy { sig, pubkey })
            }
            3 => {
                let script_code = items.pop().expect("len checked");
                let pubkey = items.pop().expect("len checked");
                let sig = items.pop().expect("len checked");
                Ok(SigScript::Segwit {
                    sig,
                    pubkey,
                    script_code,
                })
            }
            _ => Err(Error::JunkSignature),
        }
    }

    pub fn to_base64(&self) -> String {
        base64::encode(self.serialize().as_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = base64::decode(encoded)?;
        SigScript::deserialize(&Script::from(bytes))
    }
}

/// Check one transaction input signature. Legacy inputs hash against the
/// spent script; segwit inputs need the scriptCode and the spent amount.
/// Any parse or arithmetic failure verifies false.
pub fn verify_tx_input(
    tx: &Transaction,
    index: usize,
    spent_script: &Script,
    sig_with_hashtype: &[u8],
    pubkey: &[u8],
    segwit: Option<(&Script, u64)>,
) -> bool {
    let result = (|| -> Result<bool, Error> {
        let (_, der) = sig_with_hashtype
            .split_last()
            .ok_or(Error::JunkSignature)?;
        let mut cache = SighashCache::new(tx);
        let sighash = match segwit {
            None => cache
                .legacy_signature_hash(index, spent_script, EcdsaSighashType::All.to_u32())
                .map_err(|e| Error::Sighash(e.to_string()))?
                .into_inner(),
            Some((script_code, amount)) => cache
                .segwit_signature_hash(index, script_code, amount, EcdsaSighashType::All)
                .map_err(|e| Error::Sighash(e.to_string()))?
                .into_inner(),
        };
        let message = Message::from_slice(&sighash)?;
        let signature = Signature::from_der(der)?;
        let pubkey = secp256k1::PublicKey::from_slice(pubkey)?;
        let secp = Secp256k1::verification_only();
        Ok(secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    })();
    matches!(result, Ok(true))
}

pub fn pubkey_to_p2pkh_script(pubkey: &PublicKey) -> Script {
    Script::new_p2pkh(&pubkey.pubkey_hash())
}

pub fn pubkey_to_p2wpkh_script(pubkey: &PublicKey) -> Result<Script, Error> {
    let wpkh = pubkey
        .wpubkey_hash()
        .ok_or_else(|| Error::Wallet("uncompressed pubkey cannot be used for segwit".into()))?;
    Ok(Script::new_v0_p2wpkh(&wpkh))
}

/// Does `script` pay directly to `pubkey` via p2pkh, p2wpkh or p2sh-p2wpkh?
pub fn pubkey_matches_script(pubkey: &PublicKey, script: &Script) -> bool {
    if *script == pubkey_to_p2pkh_script(pubkey) {
        return true;
    }
    if let Ok(witness_program) = pubkey_to_p2wpkh_script(pubkey) {
        if *script == witness_program {
            return true;
        }
        if *script == Script::new_p2sh(&witness_program.script_hash()) {
            return true;
        }
    }
    false
}

pub fn is_native_segwit(script: &Script) -> bool {
    script.is_witness_program()
}

/// Sentinel scriptSig marking the taker's own inputs in an unsigned
/// transaction, so empty-script scanning only sees counterparty inputs.
pub fn placeholder_script() -> Script {
    Script::from(vec![0xde, 0xad, 0xbe, 0xef])
}

/// Outpoints are structured values internally; this is the only place they
/// become `"txid:vout"` strings for the wire.
pub fn outpoint_to_wire(outpoint: &OutPoint) -> String {
    outpoint.to_string()
}

pub fn outpoint_from_wire(wire: &str) -> Result<OutPoint, Error> {
    Ok(OutPoint::from_str(wire)?)
}

/// Sign an arbitrary message with the standard signed-message framing;
/// DER signature, base64 encoded.
pub fn ecdsa_sign_message(message: &str, key: &PrivateKey) -> Result<String, Error> {
    let hash = signed_msg_hash(message);
    let msg = Message::from_slice(&hash.into_inner())?;
    let secp = Secp256k1::new();
    let signature = secp.sign_ecdsa(&msg, &key.inner);
    Ok(base64::encode(signature.serialize_der()))
}

pub fn ecdsa_verify_message(message: &str, sig_b64: &str, pubkey: &PublicKey) -> bool {
    let result = (|| -> Result<bool, Error> {
        let hash = signed_msg_hash(message);
        let msg = Message::from_slice(&hash.into_inner())?;
        let signature = Signature::from_der(&base64::decode(sig_b64)?)?;
        let secp = Secp256k1::verification_only();
        Ok(secp.verify_ecdsa(&msg, &signature, &pubkey.inner).is_ok())
    })();
    matches!(result, Ok(true))
}
