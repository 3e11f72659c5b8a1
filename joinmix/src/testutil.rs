//! In-memory adapters for exercising the role state machines, able to really
//! sign p2pkh, p2wpkh and p2sh-p2wpkh inputs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::chain::ChainAdapter;
use crate::errors::Error;
use crate::maker::{MakerPolicy, OrderUpdates};
use crate::types::{Offer, OfferInfo, TxType, UtxoRecord, WalletUtxo};
use crate::utils;
use crate::wallet::WalletAdapter;

use bitcoin::blockdata::script::Builder;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    Address, EcdsaSighashType, Network, OutPoint, PackedLockTime, PrivateKey, PublicKey, Script,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use bitcoin_hashes::{sha256d, Hash};
use secp256k1::{Message, Secp256k1};

pub const NETWORK: Network = Network::Regtest;

/// Deterministic keypair; `byte` must be non-zero.
pub fn keypair(byte: u8) -> (PrivateKey, PublicKey) {
    assert_ne!(byte, 0);
    let mut bytes = [0u8; 32];
    bytes[0] = byte;
    bytes[31] = byte;
    let priv_key = PrivateKey::from_slice(&bytes, NETWORK).expect("nonzero key");
    let secp = Secp256k1::new();
    (priv_key, priv_key.public_key(&secp))
}

/// Deterministic outpoint derived from `byte`.
pub fn outpoint(byte: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_hash(sha256d::Hash::hash(&[byte])),
        vout,
    }
}

pub fn address_for(txtype: TxType, pubkey: &PublicKey) -> Address {
    match txtype {
        TxType::P2pkh => Address::p2pkh(pubkey, NETWORK),
        TxType::P2shP2wpkh => Address::p2shwpkh(pubkey, NETWORK).expect("compressed key"),
        TxType::P2wpkh => Address::p2wpkh(pubkey, NETWORK).expect("compressed key"),
    }
}

/// A minimal 1-in/1-out transaction spending an imaginary output, for
/// sighash-level tests.
pub fn spendable_tx(script: &Script, value: u64) -> (Transaction, OutPoint) {
    let prev = outpoint(0xAA, 0);
    let tx = Transaction {
        version: 1,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: value.saturating_sub(1000),
            script_pubkey: script.clone(),
        }],
    };
    (tx, prev)
}

/// Produce `(sig_with_hashtype, pubkey_bytes)` for one input. Segwit digests
/// use the p2pkh scriptCode of the key, per BIP143 single-key spends.
pub fn sign_input(
    tx: &Transaction,
    index: usize,
    key: &PrivateKey,
    spent_script: &Script,
    value: u64,
    segwit: bool,
) -> (Vec<u8>, Vec<u8>) {
    let secp = Secp256k1::new();
    let pubkey = key.public_key(&secp);
    let mut cache = SighashCache::new(tx);
    let sighash = if segwit {
        let script_code = utils::pubkey_to_p2pkh_script(&pubkey);
        cache
            .segwit_signature_hash(index, &script_code, value, EcdsaSighashType::All)
            .expect("valid index")
            .into_inner()
    } else {
        cache
            .legacy_signature_hash(index, spent_script, EcdsaSighashType::All.to_u32())
            .expect("valid index")
            .into_inner()
    };
    let msg = Message::from_slice(&sighash).expect("32 bytes");
    let mut sig = secp.sign_ecdsa(&msg, &key.inner).serialize_der().to_vec();
    sig.push(EcdsaSighashType::All.to_u32() as u8);
    (sig, pubkey.to_bytes())
}

/// Wallet keys draw from a process-wide counter so addresses never collide
/// across wallet instances within a test.
static KEY_COUNTER: AtomicU16 = AtomicU16::new(1);

pub struct TestWallet {
    pub txtype: TxType,
    pub max_mixdepth: u32,
    pub utxos: BTreeMap<u32, BTreeMap<OutPoint, WalletUtxo>>,
    keys_by_addr: BTreeMap<String, PrivateKey>,
    keys_by_script: BTreeMap<Vec<u8>, PrivateKey>,
}

impl TestWallet {
    pub fn new(txtype: TxType, max_mixdepth: u32) -> Self {
        TestWallet {
            txtype,
            max_mixdepth,
            utxos: BTreeMap::new(),
            keys_by_addr: BTreeMap::new(),
            keys_by_script: BTreeMap::new(),
        }
    }

    pub fn fresh_address(&mut self) -> Address {
        let n = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 32];
        bytes[1] = (n >> 8) as u8;
        bytes[2] = (n & 0xff) as u8;
        bytes[31] = 0x7f;
        let priv_key = PrivateKey::from_slice(&bytes, NETWORK).expect("nonzero key");
        let secp = Secp256k1::new();
        let address = address_for(self.txtype, &priv_key.public_key(&secp));
        self.keys_by_addr.insert(address.to_string(), priv_key);
        self.keys_by_script
            .insert(address.script_pubkey().to_bytes(), priv_key);
        address
    }

    /// Register a coin both in this wallet and on the given chain.
    pub fn fund(
        &mut self,
        chain: &mut TestChain,
        mixdepth: u32,
        outpoint: OutPoint,
        value: u64,
        confirms: u32,
    ) {
        let address = self.fresh_address();
        self.utxos
            .entry(mixdepth)
            .or_default()
            .insert(outpoint, WalletUtxo {
                address: address.clone(),
                value,
            });
        chain.add_utxo(
            outpoint,
            UtxoRecord {
                value,
                script: address.script_pubkey(),
                address: Some(address),
                confirms,
            },
        );
    }
}

impl WalletAdapter for TestWallet {
    fn mixdepth(&self) -> u32 {
        self.max_mixdepth
    }

    fn get_txtype(&self) -> TxType {
        self.txtype
    }

    fn get_utxos_by_mixdepth(&self) -> BTreeMap<u32, BTreeMap<OutPoint, WalletUtxo>> {
        self.utxos.clone()
    }

    fn select_utxos(
        &self,
        mixdepth: u32,
        amount: u64,
    ) -> Result<BTreeMap<OutPoint, WalletUtxo>, Error> {
        let mut selected = BTreeMap::new();
        let mut total = 0;
        if let Some(utxos) = self.utxos.get(&mixdepth) {
            for (outpoint, utxo) in utxos {
                selected.insert(*outpoint, utxo.clone());
                total += utxo.value;
                if total >= amount {
                    return Ok(selected);
                }
            }
        }
        Err(Error::InsufficientFunds(format!(
            "{} sats at mixdepth {}, {} wanted",
            total, mixdepth, amount
        )))
    }

    fn get_internal_addr(&mut self, _mixdepth: u32) -> Result<Address, Error> {
        Ok(self.fresh_address())
    }

    fn get_key_from_addr(&self, addr: &Address) -> Result<PrivateKey, Error> {
        self.keys_by_addr
            .get(&addr.to_string())
            .copied()
            .ok_or_else(|| Error::Wallet(format!("unknown address {}", addr)))
    }

    fn sign_tx(
        &self,
        tx: &mut Transaction,
        our_inputs: &BTreeMap<usize, (Script, u64)>,
    ) -> Result<(), Error> {
        let unsigned = tx.clone();
        for (&index, (script, amount)) in our_inputs {
            let key = self
                .keys_by_script
                .get(&script.to_bytes())
                .ok_or_else(|| Error::Wallet("unknown script".to_string()))?;
            let (sig, pubkey_bytes) = sign_input(
                &unsigned,
                index,
                key,
                script,
                *amount,
                self.txtype.is_segwit(),
            );
            match self.txtype {
                TxType::P2pkh => {
                    tx.input[index].script_sig = Builder::new()
                        .push_slice(&sig)
                        .push_slice(&pubkey_bytes)
                        .into_script();
                }
                TxType::P2wpkh => {
                    tx.input[index].witness = Witness::from_vec(vec![sig, pubkey_bytes.clone()]);
                    tx.input[index].script_sig = Script::new();
                }
                TxType::P2shP2wpkh => {
                    let pubkey = PublicKey::from_slice(&pubkey_bytes)?;
                    let redeem = utils::pubkey_to_p2wpkh_script(&pubkey)?;
                    tx.input[index].witness = Witness::from_vec(vec![sig, pubkey_bytes.clone()]);
                    tx.input[index].script_sig =
                        Builder::new().push_slice(redeem.as_bytes()).into_script();
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct TestChain {
    pub synced: bool,
    pub utxos: BTreeMap<OutPoint, UtxoRecord>,
    pub fee_per_kb: Option<u64>,
    pub push_ok: bool,
    pub pushed: Vec<Transaction>,
    pub notifies: Vec<(Txid, Script)>,
    pub removed_notifies: Vec<Txid>,
    pub imported: Vec<Address>,
    /// Set at push time: was a notify for the pushed txid already registered?
    pub notify_registered_before_push: bool,
}

impl TestChain {
    pub fn new() -> Self {
        TestChain {
            push_ok: true,
            fee_per_kb: Some(1000),
            ..Default::default()
        }
    }

    pub fn add_utxo(&mut self, outpoint: OutPoint, record: UtxoRecord) {
        self.utxos.insert(outpoint, record);
    }
}

impl ChainAdapter for TestChain {
    fn wallet_synced(&self) -> bool {
        self.synced
    }

    fn query_utxo_set(
        &self,
        outpoints: &[OutPoint],
        _include_confs: bool,
    ) -> Vec<Option<UtxoRecord>> {
        outpoints
            .iter()
            .map(|outpoint| self.utxos.get(outpoint).cloned())
            .collect()
    }

    fn estimate_fee_per_kb(&self, _conf_target: u32) -> Option<u64> {
        self.fee_per_kb
    }

    fn pushtx(&mut self, tx: &Transaction) -> bool {
        if !self.push_ok {
            return false;
        }
        let txid = tx.txid();
        self.notify_registered_before_push = self.notifies.iter().any(|(t, _)| *t == txid);
        self.pushed.push(tx.clone());
        true
    }

    fn add_tx_notify(&mut self, txid: Txid, watch_script: Script) {
        self.notifies.push((txid, watch_script));
    }

    fn remove_tx_notify(&mut self, txid: Txid) {
        self.removed_notifies.push(txid);
        self.notifies.retain(|(t, _)| *t != txid);
    }

    fn import_addresses(&mut self, addrs: &[Address]) {
        self.imported.extend_from_slice(addrs);
    }
}

/// A maker policy that funds orders greedily from mixdepth 0 and never
/// replaces its offers.
pub struct SimpleMakerPolicy {
    pub offers: Vec<Offer>,
}

impl MakerPolicy<TestWallet> for SimpleMakerPolicy {
    fn create_my_orders(&mut self, _wallet: &TestWallet) -> Vec<Offer> {
        self.offers.clone()
    }

    fn oid_to_order(
        &mut self,
        wallet: &mut TestWallet,
        _offer: &Offer,
        amount: u64,
    ) -> Result<Option<(BTreeMap<OutPoint, WalletUtxo>, Address, Address)>, Error> {
        let utxos = match wallet.select_utxos(0, amount) {
            Ok(utxos) => utxos,
            Err(_) => return Ok(None),
        };
        let cj_addr = wallet.get_internal_addr(0)?;
        let change_addr = wallet.get_internal_addr(0)?;
        Ok(Some((utxos, cj_addr, change_addr)))
    }

    fn on_tx_unconfirmed(&mut self, _order: &OfferInfo, _txid: &Txid) -> OrderUpdates {
        OrderUpdates::default()
    }

    fn on_tx_confirmed(
        &mut self,
        _order: &OfferInfo,
        _txid: &Txid,
        _confirmations: u32,
    ) -> OrderUpdates {
        OrderUpdates::default()
    }
}
