use std::collections::{BTreeMap, HashSet};

use crate::chain::ChainAdapter;
use crate::errors::Error;
use crate::fees::{calc_cj_fee, expected_change_value};
use crate::podle::{commitment_from_wire, deserialize_revelation, verify_podle};
use crate::types::{Offer, OfferInfo, Policy, WalletUtxo};
use crate::utils::{self, SigScript};
use crate::wallet::WalletAdapter;

use bitcoin::consensus::encode::deserialize;
use bitcoin::{Address, OutPoint, PublicKey, Transaction, Txid};
use log::{debug, info};
use secp256k1::Secp256k1;

/// Offer changes a policy wants applied after a transaction event.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdates {
    pub to_cancel: Vec<u32>,
    pub to_announce: Vec<Offer>,
}

/// The strategy hooks a concrete maker supplies: what to offer, how to fund
/// an accepted order, and how to react to its transaction confirming.
pub trait MakerPolicy<W: WalletAdapter> {
    /// Offers to announce once the wallet is synced. An empty list is fatal.
    fn create_my_orders(&mut self, wallet: &W) -> Vec<Offer>;

    /// Fund an accepted order: the inputs to contribute plus the coinjoin
    /// and change addresses. `Ok(None)` means funds could not be found.
    #[allow(clippy::type_complexity)]
    fn oid_to_order(
        &mut self,
        wallet: &mut W,
        offer: &Offer,
        amount: u64,
    ) -> Result<Option<(BTreeMap<OutPoint, WalletUtxo>, Address, Address)>, Error>;

    fn on_tx_unconfirmed(&mut self, order: &OfferInfo, txid: &Txid) -> OrderUpdates;

    fn on_tx_confirmed(&mut self, order: &OfferInfo, txid: &Txid, confirmations: u32)
        -> OrderUpdates;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakerState {
    /// Waiting for the chain adapter to report the wallet synced.
    Syncing,
    /// Offers are out; orders can be authorized and signed.
    Ready,
}

/// Maker response to a successful authorization: everything the taker needs
/// to include this maker in the transaction.
#[derive(Debug, Clone)]
pub struct IoAuthResponse {
    pub utxos: Vec<OutPoint>,
    pub auth_pub: PublicKey,
    pub cj_addr: Address,
    pub change_addr: Address,
    /// Signature over the taker's encryption pubkey by the first input's key.
    pub btc_sig: String,
}

pub struct Maker<W, C, P> {
    pub wallet: W,
    pub chain: C,
    policy: P,
    cfg: Policy,
    state: MakerState,
    offerlist: Vec<Offer>,
    active_orders: BTreeMap<String, OfferInfo>,
    aborted: bool,
}

impl<W, C, P> Maker<W, C, P>
where
    W: WalletAdapter,
    C: ChainAdapter,
    P: MakerPolicy<W>,
{
    pub fn new(wallet: W, chain: C, policy: P, cfg: Policy) -> Self {
        Maker {
            wallet,
            chain,
            policy,
            cfg,
            state: MakerState::Syncing,
            offerlist: Vec::new(),
            active_orders: BTreeMap::new(),
            aborted: false,
        }
    }

    pub fn state(&self) -> MakerState {
        self.state
    }

    pub fn offerlist(&self) -> &[Offer] {
        &self.offerlist
    }

    pub fn active_orders(&self) -> &BTreeMap<String, OfferInfo> {
        &self.active_orders
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Invoked once by the driver when the chain adapter resolves wallet
    /// sync. Builds the offer list; an empty list is a fatal error the
    /// caller turns into shutdown.
    pub fn on_wallet_synced(&mut self) -> Result<&[Offer], Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        if self.state != MakerState::Syncing {
            return Err(Error::WrongPhase);
        }
        if !self.chain.wallet_synced() {
            return Err(Error::WalletNotSynced);
        }
        self.offerlist = self.policy.create_my_orders(&self.wallet);
        if self.offerlist.is_empty() {
            return Err(Error::NoOffersCreated);
        }
        self.state = MakerState::Ready;
        info!("wallet synced, announcing {} offers", self.offerlist.len());
        Ok(&self.offerlist)
    }

    /// Authorization request from a taker: verify the PoDLE against our own
    /// offer, check the committed utxo on-chain, then fund the order and
    /// prove control of our first input by signing the taker's encryption
    /// pubkey with its key.
    ///
    /// Any failure is a hard reject; no partial state is retained. A second
    /// authorization for the same nick overwrites the first.
    pub fn on_auth_received(
        &mut self,
        nick: &str,
        oid: u32,
        wire_commitment: &str,
        cr: &str,
        amount: u64,
        kphex: &str,
    ) -> Result<IoAuthResponse, Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        if self.state != MakerState::Ready {
            return Err(Error::WrongPhase);
        }
        // the offer is resolved against our own list; taker-supplied offer
        // data is never trusted
        let offer = self
            .offerlist
            .iter()
            .find(|o| o.oid == oid)
            .cloned()
            .ok_or(Error::UnknownOid(oid))?;
        if amount < offer.minsize || amount > offer.maxsize {
            return Err(Error::AmountOutOfBounds {
                amount,
                minsize: offer.minsize,
                maxsize: offer.maxsize,
            });
        }

        let commitment = commitment_from_wire(wire_commitment)?;
        let revelation = deserialize_revelation(cr)?;
        verify_podle(&revelation, &commitment, 0..self.cfg.taker_utxo_retries)?;

        // the committed utxo must exist, be old enough, large enough, and
        // belong to the proven pubkey
        let record = self
            .chain
            .query_utxo_set(&[revelation.utxo], true)
            .into_iter()
            .next()
            .flatten()
            .ok_or(Error::AuthUtxoInvalid)?;
        if record.confirms < self.cfg.taker_utxo_age {
            return Err(Error::AuthUtxoTooNew(record.confirms));
        }
        let required = (amount as f64 * self.cfg.taker_utxo_amtpercent as f64 / 100.0) as u64;
        if record.value < required {
            return Err(Error::AuthUtxoTooSmall(record.value));
        }
        let podle_pub = PublicKey::new(revelation.p);
        if !self.wallet.pubkey_has_script(&podle_pub, &record.script) {
            return Err(Error::AuthPubkeyMismatch(revelation.p.to_string()));
        }

        let (utxos, cj_addr, change_addr) = self
            .policy
            .oid_to_order(&mut self.wallet, &offer, amount)?
            .ok_or(Error::NoOrderFunds)?;
        let auth_utxo = utxos.values().next().ok_or(Error::NoOrderFunds)?;
        let auth_key = self.wallet.get_key_from_addr(&auth_utxo.address)?;
        let secp = Secp256k1::new();
        let auth_pub = auth_key.public_key(&secp);
        let btc_sig = utils::ecdsa_sign_message(kphex, &auth_key)?;

        let response = IoAuthResponse {
            utxos: utxos.keys().cloned().collect(),
            auth_pub,
            cj_addr: cj_addr.clone(),
            change_addr: change_addr.clone(),
            btc_sig,
        };
        info!(
            "authorized {} for {} sats on oid {}, contributing {} inputs",
            nick,
            amount,
            oid,
            utxos.len()
        );
        self.active_orders.insert(
            nick.to_string(),
            OfferInfo {
                offer,
                utxos,
                cj_addr,
                change_addr,
                amount,
            },
        );
        Ok(response)
    }

    /// Unsigned transaction from the taker. Signatures are produced if and
    /// only if `verify_unsigned_tx` passes against the envelope recorded at
    /// authorization time.
    pub fn on_tx_received(&mut self, nick: &str, txhex: &str) -> Result<Vec<String>, Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        let offerinfo = self
            .active_orders
            .get(nick)
            .cloned()
            .ok_or_else(|| Error::UnknownCounterparty(nick.to_string()))?;
        let mut tx: Transaction = deserialize(&hex::decode(txhex)?)?;
        self.verify_unsigned_tx(&tx, &offerinfo)?;
        debug!("goodtx");

        let mut our_inputs = BTreeMap::new();
        for (index, input) in tx.input.iter().enumerate() {
            if let Some(utxo) = offerinfo.utxos.get(&input.previous_output) {
                let script = self.wallet.addr_to_script(&utxo.address);
                our_inputs.insert(index, (script, utxo.value));
            }
        }
        self.wallet.sign_tx(&mut tx, &our_inputs)?;

        let mut sigs = Vec::new();
        for index in our_inputs.keys() {
            let input = &tx.input[*index];
            let sigmsg = if !input.witness.is_empty() {
                // the witness program travels third so counterparties
                // predating the scriptCode convention keep working
                let items = input.witness.to_vec();
                if items.len() != 2 {
                    return Err(Error::Wallet(format!(
                        "expected [sig, pub] witness, got {} items",
                        items.len()
                    )));
                }
                let pubkey = PublicKey::from_slice(&items[1])?;
                let witness_program = utils::pubkey_to_p2wpkh_script(&pubkey)?;
                SigScript::Segwit {
                    sig: items[0].clone(),
                    pubkey: items[1].clone(),
                    script_code: witness_program.to_bytes(),
                }
            } else {
                SigScript::deserialize(&input.script_sig)?
            };
            sigs.push(sigmsg.to_base64());
        }
        info!("signed {} inputs for {}", sigs.len(), nick);
        Ok(sigs)
    }

    /// Before signing, the maker must see every one of its inputs in the
    /// transaction and receive back exactly what it put in, minus its
    /// mining fee contribution, plus its coinjoin fee. All compared values
    /// come from the envelope recorded at authorization, so no combination
    /// of taker messages can move them.
    pub fn verify_unsigned_tx(&self, tx: &Transaction, offerinfo: &OfferInfo) -> Result<(), Error> {
        let tx_outpoints: HashSet<OutPoint> =
            tx.input.iter().map(|i| i.previous_output).collect();
        if !offerinfo.utxos.keys().all(|o| tx_outpoints.contains(o)) {
            return Err(Error::UtxosNotContained);
        }

        let offer = &offerinfo.offer;
        let cj_script = offerinfo.cj_addr.script_pubkey();
        let change_script = offerinfo.change_addr.script_pubkey();
        let my_total_in: u64 = offerinfo.utxos.values().map(|u| u.value).sum();
        let real_cjfee = calc_cj_fee(offer.ordertype, offer.cjfee, offerinfo.amount);
        let expected_change =
            expected_change_value(my_total_in, offerinfo.amount, offer.txfee, real_cjfee);
        debug!(
            "potentially earned = {}",
            real_cjfee as i64 - offer.txfee as i64
        );

        let mut times_seen_cj_addr = 0;
        let mut times_seen_change_addr = 0;
        for out in &tx.output {
            if out.script_pubkey == cj_script {
                times_seen_cj_addr += 1;
                if out.value != offerinfo.amount {
                    return Err(Error::WrongCjAmount(offerinfo.amount));
                }
            }
            if out.script_pubkey == change_script {
                times_seen_change_addr += 1;
                if out.value as i64 != expected_change {
                    return Err(Error::WrongChange(expected_change));
                }
            }
        }
        if times_seen_cj_addr != 1 || times_seen_change_addr != 1 {
            return Err(Error::AddrCountMismatch {
                cj: times_seen_cj_addr,
                change: times_seen_change_addr,
            });
        }
        Ok(())
    }

    pub fn on_tx_unconfirmed(&mut self, nick: &str, txid: &Txid) -> Result<(), Error> {
        let order = self
            .active_orders
            .get(nick)
            .cloned()
            .ok_or_else(|| Error::UnknownCounterparty(nick.to_string()))?;
        let updates = self.policy.on_tx_unconfirmed(&order, txid);
        self.modify_orders(updates);
        Ok(())
    }

    /// First confirmation finalizes the order: the envelope is dropped and
    /// the policy may replace its offers.
    pub fn on_tx_confirmed(
        &mut self,
        nick: &str,
        txid: &Txid,
        confirmations: u32,
    ) -> Result<(), Error> {
        let order = self
            .active_orders
            .remove(nick)
            .ok_or_else(|| Error::UnknownCounterparty(nick.to_string()))?;
        let updates = self.policy.on_tx_confirmed(&order, txid, confirmations);
        self.modify_orders(updates);
        Ok(())
    }

    /// Replace or cancel announced offers. Cancelling an oid that does not
    /// exist is logged and tolerated.
    pub fn modify_orders(&mut self, updates: OrderUpdates) {
        info!(
            "modifying orders, to_cancel={:?}, {} to announce",
            updates.to_cancel,
            updates.to_announce.len()
        );
        for oid in updates.to_cancel {
            match self.offerlist.iter().position(|o| o.oid == oid) {
                Some(pos) => {
                    self.offerlist.remove(pos);
                }
                None => info!("didnt cancel order which doesnt exist, oid={}", oid),
            }
        }
        for announcement in updates.to_announce {
            if let Some(pos) = self
                .offerlist
                .iter()
                .position(|o| o.oid == announcement.oid)
            {
                self.offerlist.remove(pos);
            }
            self.offerlist.push(announcement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::podle::{commitment_to_wire, generate_single, serialize_revelation};
    use crate::testutil::{keypair, outpoint, TestChain, TestWallet};
    use crate::types::{CjFee, OrderType, TxType, UtxoRecord};
    use crate::utils::{ecdsa_verify_message, verify_tx_input};
    use bitcoin::{PackedLockTime, Script, Sequence, TxIn, TxOut, Witness};

    struct TestPolicy {
        offers: Vec<Offer>,
        confirmed: Vec<Txid>,
    }

    impl TestPolicy {
        fn with_offer(offer: Offer) -> Self {
            TestPolicy {
                offers: vec![offer],
                confirmed: Vec::new(),
            }
        }
    }

    impl MakerPolicy<TestWallet> for TestPolicy {
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
            txid: &Txid,
            _confirmations: u32,
        ) -> OrderUpdates {
            self.confirmed.push(*txid);
            OrderUpdates::default()
        }
    }

    fn sw_offer() -> Offer {
        Offer {
            oid: 7,
            ordertype: OrderType::SwAbsOffer,
            minsize: 100_000,
            maxsize: 50_000_000,
            txfee: 1_000,
            cjfee: CjFee::Absolute(3_000),
            counterparty: "maker1".to_string(),
        }
    }

    /// A ready maker with `values` funded at mixdepth 0 plus a taker-side
    /// commitment utxo registered on chain.
    fn ready_maker(
        txtype: TxType,
        values: &[u64],
    ) -> (
        Maker<TestWallet, TestChain, TestPolicy>,
        bitcoin::PrivateKey,
        OutPoint,
    ) {
        let mut wallet = TestWallet::new(txtype, 4);
        let mut chain = TestChain::new();
        chain.synced = true;
        for (i, value) in values.iter().enumerate() {
            wallet.fund(&mut chain, 0, outpoint(40 + i as u8, 0), *value, 10);
        }

        // taker's commitment utxo: 6 confirms, comfortably over 20% of amount
        let (taker_key, taker_pub) = keypair(90);
        let commit_utxo = outpoint(90, 0);
        let commit_script = crate::utils::pubkey_to_p2pkh_script(&taker_pub);
        chain.add_utxo(
            commit_utxo,
            UtxoRecord {
                value: 2_000_000,
                script: commit_script,
                address: None,
                confirms: 6,
            },
        );

        let mut maker = Maker::new(
            wallet,
            chain,
            TestPolicy::with_offer(sw_offer()),
            Policy::default(),
        );
        maker.on_wallet_synced().unwrap();
        (maker, taker_key, commit_utxo)
    }

    fn auth_args(taker_key: &bitcoin::PrivateKey, commit_utxo: OutPoint) -> (String, String) {
        let auth = generate_single(taker_key, commit_utxo, 0).unwrap();
        (commitment_to_wire(&auth.commit), serialize_revelation(&auth))
    }

    #[test]
    fn sync_gates_offer_creation() {
        let wallet = TestWallet::new(TxType::P2wpkh, 4);
        let chain = TestChain::new();
        let mut maker = Maker::new(
            wallet,
            chain,
            TestPolicy::with_offer(sw_offer()),
            Policy::default(),
        );
        assert!(matches!(
            maker.on_wallet_synced(),
            Err(Error::WalletNotSynced)
        ));
        maker.chain.synced = true;
        assert_eq!(maker.on_wallet_synced().unwrap().len(), 1);
        assert_eq!(maker.state(), MakerState::Ready);
        // second resolution is a wrong-phase call
        assert!(matches!(maker.on_wallet_synced(), Err(Error::WrongPhase)));
    }

    #[test]
    fn empty_offerlist_is_fatal() {
        let wallet = TestWallet::new(TxType::P2wpkh, 4);
        let mut chain = TestChain::new();
        chain.synced = true;
        let mut maker = Maker::new(
            wallet,
            chain,
            TestPolicy {
                offers: vec![],
                confirmed: vec![],
            },
            Policy::default(),
        );
        let err = maker.on_wallet_synced().unwrap_err();
        assert!(matches!(err, Error::NoOffersCreated));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn auth_happy_path() {
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);

        let response = maker
            .on_auth_received("taker", 7, &commitment, &revelation, 1_000_000, "kp-enc-pub")
            .unwrap();
        assert!(!response.utxos.is_empty());
        assert!(ecdsa_verify_message(
            "kp-enc-pub",
            &response.btc_sig,
            &response.auth_pub
        ));
        // the auth key is the first chosen input's key
        let order = &maker.active_orders()["taker"];
        let first = order.utxos.values().next().unwrap();
        assert_eq!(
            maker
                .wallet
                .get_key_from_addr(&first.address)
                .unwrap()
                .public_key(&Secp256k1::new()),
            response.auth_pub
        );
        assert_eq!(order.amount, 1_000_000);
    }

    #[test]
    fn auth_rejects_unknown_oid_and_out_of_bounds_amount() {
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);

        assert!(matches!(
            maker.on_auth_received("t", 99, &commitment, &revelation, 1_000_000, "kp"),
            Err(Error::UnknownOid(99))
        ));
        assert!(matches!(
            maker.on_auth_received("t", 7, &commitment, &revelation, 1_000, "kp"),
            Err(Error::AmountOutOfBounds { .. })
        ));
        assert!(maker.active_orders().is_empty());
    }

    #[test]
    fn auth_rejects_bad_podle() {
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        let auth = generate_single(&taker_key, commit_utxo, 0).unwrap();
        let mut tampered = auth.clone();
        tampered.sig[31] ^= 1;
        let result = maker.on_auth_received(
            "t",
            7,
            &commitment_to_wire(&auth.commit),
            &serialize_revelation(&tampered),
            1_000_000,
            "kp",
        );
        assert!(matches!(result, Err(Error::PodleVerifyFailed)));
        assert!(maker.active_orders().is_empty());
    }

    #[test]
    fn auth_rejects_unworthy_commitment_utxos() {
        // too new
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        maker.chain.utxos.get_mut(&commit_utxo).unwrap().confirms = 2;
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        assert!(matches!(
            maker.on_auth_received("t", 7, &commitment, &revelation, 1_000_000, "kp"),
            Err(Error::AuthUtxoTooNew(2))
        ));

        // too small: 2M sats < 20% of 11M
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[30_000_000]);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        assert!(matches!(
            maker.on_auth_received("t", 7, &commitment, &revelation, 11_000_000, "kp"),
            Err(Error::AuthUtxoTooSmall(_))
        ));

        // spent / unknown
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        maker.chain.utxos.remove(&commit_utxo);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        assert!(matches!(
            maker.on_auth_received("t", 7, &commitment, &revelation, 1_000_000, "kp"),
            Err(Error::AuthUtxoInvalid)
        ));
    }

    #[test]
    fn auth_rejects_pubkey_not_owning_utxo() {
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        // re-point the commitment utxo at someone else's script
        let (_, stranger) = keypair(91);
        maker.chain.utxos.get_mut(&commit_utxo).unwrap().script =
            crate::utils::pubkey_to_p2pkh_script(&stranger);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        assert!(matches!(
            maker.on_auth_received("t", 7, &commitment, &revelation, 1_000_000, "kp"),
            Err(Error::AuthPubkeyMismatch(_))
        ));
    }

    #[test]
    fn second_auth_overwrites_first() {
        let (mut maker, taker_key, commit_utxo) = ready_maker(TxType::P2wpkh, &[6_000_000]);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        maker
            .on_auth_received("taker", 7, &commitment, &revelation, 1_000_000, "kp")
            .unwrap();
        maker
            .on_auth_received("taker", 7, &commitment, &revelation, 2_000_000, "kp")
            .unwrap();
        assert_eq!(maker.active_orders().len(), 1);
        assert_eq!(maker.active_orders()["taker"].amount, 2_000_000);
    }

    /// Build the transaction a taker would: the maker's inputs plus a
    /// foreign input, its cj and change outputs plus foreign outputs.
    fn tx_for_order(order: &OfferInfo) -> Transaction {
        let my_total_in: u64 = order.utxos.values().map(|u| u.value).sum();
        let real_cjfee =
            calc_cj_fee(order.offer.ordertype, order.offer.cjfee, order.amount);
        let change =
            expected_change_value(my_total_in, order.amount, order.offer.txfee, real_cjfee);

        let mut input: Vec<TxIn> = order
            .utxos
            .keys()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect();
        input.push(TxIn {
            previous_output: outpoint(200, 1),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        });

        let (_, foreign) = keypair(201);
        let output = vec![
            TxOut {
                value: order.amount,
                script_pubkey: order.cj_addr.script_pubkey(),
            },
            TxOut {
                value: change as u64,
                script_pubkey: order.change_addr.script_pubkey(),
            },
            TxOut {
                value: order.amount,
                script_pubkey: crate::utils::pubkey_to_p2pkh_script(&foreign),
            },
        ];
        Transaction {
            version: 1,
            lock_time: PackedLockTime::ZERO,
            input,
            output,
        }
    }

    fn authorized_maker(
        txtype: TxType,
    ) -> (Maker<TestWallet, TestChain, TestPolicy>, OfferInfo) {
        let (mut maker, taker_key, commit_utxo) = ready_maker(txtype, &[600_000, 600_000]);
        let (commitment, revelation) = auth_args(&taker_key, commit_utxo);
        maker
            .on_auth_received("taker", 7, &commitment, &revelation, 1_000_000, "kp")
            .unwrap();
        let order = maker.active_orders()["taker"].clone();
        (maker, order)
    }

    #[test]
    fn signs_verified_tx_segwit() {
        let (mut maker, order) = authorized_maker(TxType::P2wpkh);
        let tx = tx_for_order(&order);
        let txhex = hex::encode(bitcoin::consensus::encode::serialize(&tx));

        let sigs = maker.on_tx_received("taker", &txhex).unwrap();
        assert_eq!(sigs.len(), order.utxos.len());

        // each sig is a 3-item script whose third element is the witness
        // program, and it verifies against the spent input
        for encoded in sigs {
            let sigmsg = SigScript::from_base64(&encoded).unwrap();
            let script_code = match &sigmsg {
                SigScript::Segwit { pubkey, script_code, .. } => {
                    let pubkey = PublicKey::from_slice(pubkey).unwrap();
                    assert_eq!(
                        Script::from(script_code.clone()),
                        utils::pubkey_to_p2wpkh_script(&pubkey).unwrap()
                    );
                    utils::pubkey_to_p2pkh_script(&pubkey)
                }
                SigScript::Legacy { .. } => panic!("expected segwit sigmsg"),
            };
            // locate the input this sig belongs to
            let matched = tx.input.iter().enumerate().any(|(index, input)| {
                order.utxos.get(&input.previous_output).map_or(false, |utxo| {
                    verify_tx_input(
                        &tx,
                        index,
                        &utxo.address.script_pubkey(),
                        sigmsg.sig(),
                        sigmsg.pubkey(),
                        Some((&script_code, utxo.value)),
                    )
                })
            });
            assert!(matched);
        }
    }

    #[test]
    fn signs_verified_tx_legacy() {
        let (mut maker, order) = authorized_maker(TxType::P2pkh);
        let tx = tx_for_order(&order);
        let txhex = hex::encode(bitcoin::consensus::encode::serialize(&tx));

        let sigs = maker.on_tx_received("taker", &txhex).unwrap();
        for encoded in sigs {
            let sigmsg = SigScript::from_base64(&encoded).unwrap();
            assert!(matches!(sigmsg, SigScript::Legacy { .. }));
            let matched = tx.input.iter().enumerate().any(|(index, input)| {
                order.utxos.get(&input.previous_output).map_or(false, |utxo| {
                    verify_tx_input(
                        &tx,
                        index,
                        &utxo.address.script_pubkey(),
                        sigmsg.sig(),
                        sigmsg.pubkey(),
                        None,
                    )
                })
            });
            assert!(matched);
        }
    }

    #[test]
    fn rejects_wrong_cj_amount() {
        let (mut maker, order) = authorized_maker(TxType::P2wpkh);
        let mut tx = tx_for_order(&order);
        let cj_script = order.cj_addr.script_pubkey();
        for out in tx.output.iter_mut() {
            if out.script_pubkey == cj_script {
                out.value -= 1;
            }
        }
        let txhex = hex::encode(bitcoin::consensus::encode::serialize(&tx));
        assert!(matches!(
            maker.on_tx_received("taker", &txhex),
            Err(Error::WrongCjAmount(1_000_000))
        ));
        // envelope untouched, a correct retry still works
        assert!(maker.active_orders().contains_key("taker"));
    }

    #[test]
    fn rejects_wrong_change_and_missing_inputs() {
        let (mut maker, order) = authorized_maker(TxType::P2wpkh);

        let mut tx = tx_for_order(&order);
        let change_script = order.change_addr.script_pubkey();
        for out in tx.output.iter_mut() {
            if out.script_pubkey == change_script {
                out.value += 10;
            }
        }
        let txhex = hex::encode(bitcoin::consensus::encode::serialize(&tx));
        assert!(matches!(
            maker.on_tx_received("taker", &txhex),
            Err(Error::WrongChange(_))
        ));

        let mut tx = tx_for_order(&order);
        tx.input.remove(0);
        let txhex = hex::encode(bitcoin::consensus::encode::serialize(&tx));
        assert!(matches!(
            maker.on_tx_received("taker", &txhex),
            Err(Error::UtxosNotContained)
        ));
    }

    #[test]
    fn rejects_duplicated_cj_output() {
        let (maker, order) = authorized_maker(TxType::P2wpkh);
        let mut tx = tx_for_order(&order);
        let duplicate = TxOut {
            value: order.amount,
            script_pubkey: order.cj_addr.script_pubkey(),
        };
        tx.output.push(duplicate);
        assert!(matches!(
            maker.verify_unsigned_tx(&tx, &order),
            Err(Error::AddrCountMismatch { cj: 2, change: 1 })
        ));
    }

    #[test]
    fn rejects_malformed_txhex() {
        let (mut maker, _) = authorized_maker(TxType::P2wpkh);
        let err = maker.on_tx_received("taker", "00ff00").unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedInput);
        assert!(matches!(
            maker.on_tx_received("stranger", "00"),
            Err(Error::UnknownCounterparty(_))
        ));
    }

    #[test]
    fn confirm_finalizes_order_and_modify_orders_tolerates_unknown_oid() {
        let (mut maker, _) = authorized_maker(TxType::P2wpkh);
        let txid = outpoint(99, 0).txid;
        maker.on_tx_confirmed("taker", &txid, 1).unwrap();
        assert!(maker.active_orders().is_empty());
        assert_eq!(maker.policy.confirmed, vec![txid]);

        // cancelling a non-existent oid only logs
        maker.modify_orders(OrderUpdates {
            to_cancel: vec![12345],
            to_announce: vec![],
        });
        assert_eq!(maker.offerlist().len(), 1);

        // re-announcing an existing oid replaces it
        let mut replacement = sw_offer();
        replacement.txfee = 500;
        maker.modify_orders(OrderUpdates {
            to_cancel: vec![],
            to_announce: vec![replacement],
        });
        assert_eq!(maker.offerlist().len(), 1);
        assert_eq!(maker.offerlist()[0].txfee, 500);
    }
}
