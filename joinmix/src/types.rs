use std::collections::BTreeMap;

use bitcoin::{Address, OutPoint, Script};
use bitcoin_hashes::sha256;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// Offer variant, encoding fee style (relative/absolute) and the signing
/// style (legacy/segwit) the maker expects for its inputs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    #[serde(rename = "reloffer")]
    RelOffer,
    #[serde(rename = "absoffer")]
    AbsOffer,
    #[serde(rename = "swreloffer")]
    SwRelOffer,
    #[serde(rename = "swabsoffer")]
    SwAbsOffer,
}

impl OrderType {
    pub fn is_segwit(&self) -> bool {
        matches!(self, OrderType::SwRelOffer | OrderType::SwAbsOffer)
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, OrderType::RelOffer | OrderType::SwRelOffer)
    }

    /// The two ordertypes a taker will accept given its segwit policy.
    pub fn allowed_types(segwit: bool) -> [OrderType; 2] {
        if segwit {
            [OrderType::SwRelOffer, OrderType::SwAbsOffer]
        } else {
            [OrderType::RelOffer, OrderType::AbsOffer]
        }
    }
}

/// Coinjoin fee asked by a maker: absolute satoshis or a fraction of the
/// coinjoin amount.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum CjFee {
    Absolute(u64),
    Relative(f64),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Offer {
    pub oid: u32,
    pub ordertype: OrderType,
    /// Min size of cj, in sats
    pub minsize: u64,
    /// Max size of cj, in sats
    pub maxsize: u64,
    /// Amount the maker contributes to the mining fee, in sats
    pub txfee: u64,
    pub cjfee: CjFee,
    pub counterparty: String,
}

/// Coinjoin amount requested by one schedule entry. Zero sats means sweep;
/// a fraction is resolved against the mixdepth balance captured when the
/// schedule enters that mixdepth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleAmount {
    Sats(u64),
    Fraction(f64),
}

impl ScheduleAmount {
    pub fn is_sweep(&self) -> bool {
        matches!(self, ScheduleAmount::Sats(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Derive a fresh address from the next mixdepth (mod wallet depth).
    Internal,
    Address(Address),
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub mixdepth: u32,
    pub amount: ScheduleAmount,
    pub counterparties: usize,
    pub destination: Destination,
    /// Minutes to wait after confirmation before the next entry.
    pub wait_minutes: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBroadcast {
    #[serde(rename = "self")]
    OwnNode,
    #[serde(rename = "random-peer")]
    RandomPeer,
    #[serde(rename = "not-self")]
    NotSelf,
}

/// Policy knobs, threaded explicitly through the role constructors.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Policy {
    /// Max PoDLE index tried per utxo before it is considered spent for
    /// commitment purposes.
    pub taker_utxo_retries: u8,
    /// Min confirmations of a commitment utxo.
    pub taker_utxo_age: u32,
    /// Min commitment utxo value as percent of the coinjoin amount.
    pub taker_utxo_amtpercent: u32,
    pub minimum_makers: usize,
    pub segwit: bool,
    pub tx_broadcast: TxBroadcast,
    pub mincjamount: u64,
    /// Counterparty change below this is rejected outright.
    pub dust_threshold: u64,
    /// Our own change below this is dropped into the mining fee.
    pub bitcoin_dust_threshold: u64,
    /// Per-counterparty mining fee assumption used before estimation.
    pub txfee_default: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            taker_utxo_retries: 3,
            taker_utxo_age: 5,
            taker_utxo_amtpercent: 20,
            minimum_makers: 4,
            segwit: true,
            tx_broadcast: TxBroadcast::OwnNode,
            mincjamount: 100_000,
            dust_threshold: 2_730,
            bitcoin_dust_threshold: 546,
            txfee_default: 5_000,
        }
    }
}

/// Script style the wallet signs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl TxType {
    pub fn is_segwit(&self) -> bool {
        !matches!(self, TxType::P2pkh)
    }
}

/// A coin the wallet owns.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletUtxo {
    pub address: Address,
    pub value: u64,
}

/// Result of an on-chain utxo set query.
#[derive(Debug, Clone, PartialEq)]
pub struct UtxoRecord {
    pub value: u64,
    pub script: Script,
    pub address: Option<Address>,
    pub confirms: u32,
}

/// PoDLE commitment and its opening. `sig`/`e` are the Fiat-Shamir proof of
/// `log_G P = log_J P2`; `commit` is `H(P2)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthCommitment {
    #[serde(rename = "P")]
    pub p: PublicKey,
    #[serde(rename = "P2")]
    pub p2: PublicKey,
    pub commit: sha256::Hash,
    pub sig: Vec<u8>,
    pub e: sha256::Hash,
    pub utxo: OutPoint,
}

/// One maker's phase-1 response as delivered to the taker by the relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IoAuthEntry {
    #[serde(rename = "ulist")]
    pub utxos: Vec<OutPoint>,
    /// Hex pubkey of the maker's first chosen input, proving control of it.
    pub auth_pub: String,
    #[serde(rename = "coinjoinA")]
    pub coinjoin_address: String,
    #[serde(rename = "changeA")]
    pub change_address: String,
    /// Signature by the auth key, verified against the maker's encryption
    /// pubkey.
    #[serde(rename = "btc_sig")]
    pub bitcoin_sig: String,
    pub maker_pk: String,
}

/// The authoritative record of what a maker has agreed to for one nick.
/// Every later verification is against this, never against taker input.
#[derive(Debug, Clone)]
pub struct OfferInfo {
    pub offer: Offer,
    pub utxos: BTreeMap<OutPoint, WalletUtxo>,
    pub cj_addr: Address,
    pub change_addr: Address,
    pub amount: u64,
}
