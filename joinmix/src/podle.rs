use std::collections::HashSet;
use std::ops::Range;
use std::str::FromStr;

use crate::errors::Error;
use crate::types::AuthCommitment;

use num_bigint::BigInt;

use bitcoin::{OutPoint, PrivateKey};
use bitcoin_hashes::{sha256, Hash};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

use log::debug;

/// Type byte prefixed to the commitment hash on the wire, so future
/// commitment schemes can coexist with PoDLE.
pub const COMMIT_TYPE_BYTE: char = 'P';

fn n() -> BigInt {
    "115792089237316195423570985008687907852837564279074904382605163141518161494337"
        .parse()
        .expect("curve order literal")
}

/// Decodes big-endian bytes to a BigInt.
fn decode(bytes: &[u8]) -> BigInt {
    let mut int = BigInt::from(0);
    for byte in bytes {
        int *= 256;
        int += *byte;
    }
    int
}

/// Encodes a non-negative BigInt below 2^256 as 32 big-endian bytes.
fn encode_be_32(val: &BigInt) -> [u8; 32] {
    let (_, bytes) = val.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Modulo with a non-negative result.
fn modulo(a: &BigInt, b: &BigInt) -> BigInt {
    ((a % b) + b) % b
}

fn scalar_from_be(bytes: [u8; 32]) -> Result<Scalar, Error> {
    Scalar::from_be_bytes(bytes).map_err(|_| Error::Secp(secp256k1::Error::InvalidSecretKey))
}

fn get_p2(priv_key: SecretKey, nums_key: PublicKey) -> Result<PublicKey, Error> {
    let ctx = Secp256k1::new();
    let tweak = scalar_from_be(priv_key.secret_bytes())?;
    Ok(nums_key.mul_tweak(&ctx, &tweak)?)
}

fn g_serialized(compressed: bool) -> Vec<u8> {
    let mut priv_one = [0x00u8; 32];
    priv_one[31] = 0x01;
    let secret_key = SecretKey::from_slice(&priv_one).expect("one is a valid secret key");
    let secp = Secp256k1::new();
    let pub_key = PublicKey::from_secret_key(&secp, &secret_key);
    if compressed {
        pub_key.serialize().to_vec()
    } else {
        pub_key.serialize_uncompressed().to_vec()
    }
}

/// Derive the NUMS generator `J(index)`: hash the serialized standard
/// generator plus the index and an incrementing counter until the digest is
/// the x coordinate of a curve point.
pub fn nums_generator(index: u8) -> Result<PublicKey, Error> {
    for &compressed in &[true, false] {
        let mut seed = g_serialized(compressed);
        seed.push(index);
        for counter in 0..255u8 {
            let mut seed_c = seed.clone();
            seed_c.push(counter);
            let hashed_seed = sha256::Hash::hash(&seed_c);
            let mut claimed_point = vec![0x02];
            claimed_point.extend_from_slice(&hashed_seed.into_inner());

            if let Ok(pubkey) = PublicKey::from_slice(&claimed_point) {
                return Ok(pubkey);
            }
        }
    }
    Err(Error::NumsDerivation(index))
}

/// Generate a single PoDLE for `utxo`'s key at NUMS index `index`.
///
/// The commitment `H(P2)` is deterministic in `(priv, index)`; the proof
/// nonce is fresh randomness each call.
pub fn generate_single(
    priv_key: &PrivateKey,
    utxo: OutPoint,
    index: u8,
) -> Result<AuthCommitment, Error> {
    let ctx = Secp256k1::new();
    let pub_key = priv_key.public_key(&ctx).inner;

    let k = Scalar::random();
    let kg = SecretKey::from_slice(&k.to_be_bytes())?.public_key(&ctx);

    let j = nums_generator(index)?;
    let kj = j.mul_tweak(&ctx, &k)?;

    let p2 = get_p2(priv_key.inner, j)?;
    let commit = sha256::Hash::hash(&p2.serialize());

    let e = sha256::Hash::hash(
        &[
            kg.serialize(),
            kj.serialize(),
            pub_key.serialize(),
            p2.serialize(),
        ]
        .concat(),
    );

    let priv_int = decode(&priv_key.to_bytes());
    let k_int = decode(&k.to_be_bytes());
    let e_int = decode(&e.into_inner());

    let sig_int = modulo(&(k_int + priv_int * e_int), &n());

    Ok(AuthCommitment {
        p: pub_key,
        p2,
        commit,
        sig: encode_be_32(&sig_int).to_vec(),
        e,
        utxo,
    })
}

/// Walk `(priv, utxo)` pairs and NUMS indices `0..tries` until a commitment
/// not present in `used` is found; fall back to the pre-filtered `external`
/// candidates. Returns `None` when every candidate is exhausted.
///
/// Nothing is marked used here; the caller records the commitment once it is
/// certain it will be sent.
pub fn generate_podle(
    priv_utxo_pairs: &[(PrivateKey, OutPoint)],
    tries: u8,
    used: &HashSet<sha256::Hash>,
    external: &[AuthCommitment],
) -> Result<Option<AuthCommitment>, Error> {
    for (priv_key, utxo) in priv_utxo_pairs {
        for index in 0..tries {
            let auth = generate_single(priv_key, *utxo, index)?;
            if !used.contains(&auth.commit) {
                debug!("podle sourced from {} at index {}", utxo, index);
                return Ok(Some(auth));
            }
        }
    }
    for auth in external {
        if !used.contains(&auth.commit) {
            debug!("podle sourced from external commitment {}", auth.commit);
            return Ok(Some(auth.clone()));
        }
    }
    Ok(None)
}

/// Verify a PoDLE opening against the previously seen commitment hash. The
/// proof passes if the sigma equation holds for any NUMS index in
/// `index_range`. Any arithmetic or deserialization failure verifies false
/// (returned as an error).
pub fn verify_podle(
    auth: &AuthCommitment,
    expected_commit: &sha256::Hash,
    index_range: Range<u8>,
) -> Result<(), Error> {
    if sha256::Hash::hash(&auth.p2.serialize()) != *expected_commit {
        return Err(Error::PodleCommitmentMismatch);
    }

    let sig: [u8; 32] = auth
        .sig
        .as_slice()
        .try_into()
        .map_err(|_| Error::PodleVerifyFailed)?;
    let sig_key = SecretKey::from_slice(&sig).map_err(|_| Error::PodleVerifyFailed)?;

    let ctx = Secp256k1::new();
    let s_g = sig_key.public_key(&ctx);
    let sig_scalar = scalar_from_be(sig)?;

    let e_int = decode(&auth.e.into_inner());
    let e_neg = modulo(&-e_int, &n());
    let e_neg = scalar_from_be(encode_be_32(&e_neg))?;

    let e_p_neg = auth.p.mul_tweak(&ctx, &e_neg)?;
    let e_p2_neg = auth.p2.mul_tweak(&ctx, &e_neg)?;

    for index in index_range {
        let j = nums_generator(index)?;
        let s_j = j.mul_tweak(&ctx, &sig_scalar)?;

        let k_g = s_g.combine(&e_p_neg)?;
        let k_j = s_j.combine(&e_p2_neg)?;

        let e_check = sha256::Hash::hash(
            &[
                k_g.serialize(),
                k_j.serialize(),
                auth.p.serialize(),
                auth.p2.serialize(),
            ]
            .concat(),
        );

        if e_check == auth.e {
            return Ok(());
        }
    }
    Err(Error::PodleVerifyFailed)
}

/// Wire form of the opening: `txid:vout|P|P2|sig|e`, hex fields.
pub fn serialize_revelation(auth: &AuthCommitment) -> String {
    [
        auth.utxo.to_string(),
        auth.p.to_string(),
        auth.p2.to_string(),
        hex::encode(&auth.sig),
        auth.e.to_string(),
    ]
    .join("|")
}

pub fn deserialize_revelation(serialized: &str) -> Result<AuthCommitment, Error> {
    let fields: Vec<&str> = serialized.split('|').collect();
    if fields.len() != 5 {
        return Err(Error::MalformedRevelation(format!(
            "expected 5 fields, got {}",
            fields.len()
        )));
    }
    let utxo = OutPoint::from_str(fields[0])?;
    let p = PublicKey::from_str(fields[1])?;
    let p2 = PublicKey::from_str(fields[2])?;
    let sig = hex::decode(fields[3])?;
    let e = sha256::Hash::from_str(fields[4])
        .map_err(|e| Error::MalformedRevelation(e.to_string()))?;
    Ok(AuthCommitment {
        p,
        p2,
        commit: sha256::Hash::hash(&p2.serialize()),
        sig,
        e,
        utxo,
    })
}

/// Commitments travel with a leading type byte.
pub fn commitment_to_wire(commit: &sha256::Hash) -> String {
    format!("{}{}", COMMIT_TYPE_BYTE, commit)
}

pub fn commitment_from_wire(wire: &str) -> Result<sha256::Hash, Error> {
    let body = wire
        .strip_prefix(COMMIT_TYPE_BYTE)
        .ok_or_else(|| Error::MalformedRevelation("unknown commitment type".into()))?;
    sha256::Hash::from_str(body).map_err(|e| Error::MalformedRevelation(e.to_string()))
}
