use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use crate::chain::ChainAdapter;
use crate::commitments::PodleStore;
use crate::errors::Error;
use crate::fees::{calc_cj_fee, estimate_tx_fee, taker_txfee_share};
use crate::orderbook::{choose_orders, choose_sweep_orders, weighted_order_choose, OrderChooser};
use crate::podle::{commitment_to_wire, generate_podle, serialize_revelation};
use crate::types::{
    AuthCommitment, Destination, IoAuthEntry, Offer, OrderType, Policy, ScheduleEntry,
    TxBroadcast, UtxoRecord, WalletUtxo,
};
use crate::utils::{self, SigScript};
use crate::wallet::WalletAdapter;

use bitcoin::consensus::encode::serialize;
use bitcoin::{
    Address, OutPoint, PackedLockTime, PrivateKey, PublicKey, Script, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

/// Fee rate assumed when the chain adapter cannot provide an estimate.
const FALLBACK_FEE_PER_KB: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakerState {
    Idle,
    AwaitingUtxos,
    AwaitingSigs,
    AwaitingConfirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    Info,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject,
    /// Offers not accepted, but the caller intends to try again; the
    /// completion callback is not triggered.
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TakerFinish {
    /// Every schedule entry has been processed.
    ScheduleComplete,
    /// The transaction was seen in the mempool.
    TxUnconfirmed,
    TxConfirmed {
        has_more: bool,
        wait_minutes: f64,
        txid: Txid,
    },
    TxFailed,
}

pub type FilterOrdersFn = Box<dyn FnMut(&BTreeMap<String, Offer>, u64, u64) -> FilterDecision>;
pub type InfoFn = Box<dyn FnMut(InfoKind, &str)>;
pub type FinishedFn = Box<dyn FnMut(TakerFinish)>;

/// External callers set three callbacks: offer-list approval, progress
/// messages, and completion notification.
pub struct TakerCallbacks {
    pub filter_orders: Option<FilterOrdersFn>,
    pub info: Option<InfoFn>,
    pub on_finished: FinishedFn,
}

#[derive(Debug)]
pub enum InitResult {
    Ready {
        cj_amount: u64,
        commitment: String,
        revelation: String,
        orderbook: BTreeMap<String, Offer>,
    },
    ScheduleFinished,
}

/// The built unsigned transaction, ready for the relay to dispatch to the
/// accepted makers.
pub struct UnsignedTx {
    pub makers: Vec<String>,
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushResult {
    Broadcast { txid: Txid },
    /// The relay should ask this peer to broadcast.
    Delegated { nick: String, txhex: String },
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SigOutcome {
    /// Not from a maker we are waiting on.
    Ignored,
    Pending { awaiting: usize },
    Complete(PushResult),
}

pub struct Taker<W, C> {
    pub wallet: W,
    pub chain: C,
    cfg: Policy,
    schedule: Vec<ScheduleEntry>,
    order_chooser: OrderChooser,
    callbacks: TakerCallbacks,
    max_cj_fee: (u64, f64),
    podle_store: PodleStore,
    debug_file_path: PathBuf,

    /// Makers that misbehaved; excluded for the rest of the schedule.
    ignored_makers: HashSet<String>,
    honest_makers: HashSet<String>,
    honest_only: bool,

    state: TakerState,
    aborted: bool,
    schedule_index: isize,
    waiting_for_conf: bool,

    // per-transaction state, reset at each schedule advance
    mixdepth: u32,
    cjamount: u64,
    n_counterparties: usize,
    my_cj_addr: Option<Address>,
    my_change_addr: Option<Address>,
    mixdepth_balance: u64,
    total_cj_fee: u64,
    total_txfee: u64,
    cjfee_total: u64,
    maker_txfee_contributions: u64,
    input_utxos: BTreeMap<OutPoint, WalletUtxo>,
    sweep_orderbook: Vec<Offer>,
    orderbook: BTreeMap<String, Offer>,
    maker_utxo_data: BTreeMap<String, Vec<(OutPoint, UtxoRecord)>>,
    maker_utxos: BTreeMap<String, Vec<OutPoint>>,
    outputs: Vec<(Address, u64)>,
    latest_tx: Option<Transaction>,
    txid: Option<Txid>,
    nonrespondants: BTreeSet<String>,
}

struct AcceptedIoAuth {
    utxos: Vec<OutPoint>,
    auth_pub: PublicKey,
    cj_addr: Address,
    change_addr: Address,
}

impl<W, C> Taker<W, C>
where
    W: WalletAdapter,
    C: ChainAdapter,
{
    pub fn new(
        wallet: W,
        chain: C,
        cfg: Policy,
        schedule: Vec<ScheduleEntry>,
        podle_store: PodleStore,
        callbacks: TakerCallbacks,
    ) -> Self {
        Taker {
            wallet,
            chain,
            cfg,
            schedule,
            order_chooser: weighted_order_choose,
            callbacks,
            max_cj_fee: (1, f64::INFINITY),
            podle_store,
            debug_file_path: PathBuf::from("commitments_debug.txt"),
            ignored_makers: HashSet::new(),
            honest_makers: HashSet::new(),
            honest_only: false,
            state: TakerState::Idle,
            aborted: false,
            schedule_index: -1,
            waiting_for_conf: false,
            mixdepth: 0,
            cjamount: 0,
            n_counterparties: 0,
            my_cj_addr: None,
            my_change_addr: None,
            mixdepth_balance: 0,
            total_cj_fee: 0,
            total_txfee: 0,
            cjfee_total: 0,
            maker_txfee_contributions: 0,
            input_utxos: BTreeMap::new(),
            sweep_orderbook: Vec::new(),
            orderbook: BTreeMap::new(),
            maker_utxo_data: BTreeMap::new(),
            maker_utxos: BTreeMap::new(),
            outputs: Vec::new(),
            latest_tx: None,
            txid: None,
            nonrespondants: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> TakerState {
        self.state
    }

    pub fn cj_amount(&self) -> u64 {
        self.cjamount
    }

    pub fn txid(&self) -> Option<Txid> {
        self.txid
    }

    pub fn waiting_for_conf(&self) -> bool {
        self.waiting_for_conf
    }

    pub fn latest_tx(&self) -> Option<&Transaction> {
        self.latest_tx.as_ref()
    }

    pub fn ignored_makers(&self) -> &HashSet<String> {
        &self.ignored_makers
    }

    pub fn set_order_chooser(&mut self, chooser: OrderChooser) {
        self.order_chooser = chooser;
    }

    pub fn set_max_cj_fee(&mut self, abs: u64, rel: f64) {
        self.max_cj_fee = (abs, rel);
    }

    /// Makers that refused to complete the protocol honestly stay here for
    /// the whole schedule.
    pub fn add_ignored_makers(&mut self, makers: &[String]) {
        self.ignored_makers.extend(makers.iter().cloned());
    }

    /// Makers that returned a valid signature may be marked honest, and the
    /// taker can then restrict offer sourcing to them.
    pub fn add_honest_makers(&mut self, makers: &[String]) {
        self.honest_makers.extend(makers.iter().cloned());
    }

    pub fn set_honest_only(&mut self, enable: bool) {
        if enable && self.honest_makers.is_empty() {
            debug!("attempt to set honest-only without any honest makers; ignored");
            return;
        }
        self.honest_only = enable;
    }

    pub fn abort(&mut self) {
        self.aborted = true;
        if let Some(txid) = self.txid {
            self.chain.remove_tx_notify(txid);
        }
    }

    fn info(&mut self, kind: InfoKind, msg: &str) {
        match &mut self.callbacks.info {
            Some(callback) => callback(kind, msg),
            None => match kind {
                InfoKind::Info => info!("INFO: {}", msg),
                InfoKind::Abort => warn!("ABORT: {}", msg),
            },
        }
    }

    fn finished(&mut self, event: TakerFinish) {
        (self.callbacks.on_finished)(event);
    }

    fn fee_per_kb(&self) -> u64 {
        self.chain
            .estimate_fee_per_kb(3)
            .unwrap_or(FALLBACK_FEE_PER_KB)
    }

    /// Advance the schedule, select offers, prepare inputs and a PoDLE
    /// commitment. On failure the schedule index is restored so the same
    /// entry can be retried with a fresh orderbook.
    pub fn initialize(&mut self, orderbook: &[Offer]) -> Result<InitResult, Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        self.info(InfoKind::Info, "Received offers from the relay");
        self.schedule_index += 1;
        if self.schedule_index as usize >= self.schedule.len() {
            self.info(InfoKind::Info, "Finished all scheduled transactions");
            self.finished(TakerFinish::ScheduleComplete);
            return Ok(InitResult::ScheduleFinished);
        }
        match self.init_inner(orderbook) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.schedule_index -= 1;
                self.state = TakerState::Idle;
                Err(e)
            }
        }
    }

    fn init_inner(&mut self, orderbook: &[Offer]) -> Result<InitResult, Error> {
        let entry = self.schedule[self.schedule_index as usize].clone();
        self.mixdepth = entry.mixdepth;
        self.n_counterparties = entry.counterparties;
        let sweep = entry.amount.is_sweep();

        self.cjamount = match entry.amount {
            crate::types::ScheduleAmount::Sats(sats) => sats,
            crate::types::ScheduleAmount::Fraction(frac) => {
                // the balance baseline is fixed when the schedule enters a
                // new mixdepth
                let prev_mixdepth = (self.schedule_index > 0)
                    .then(|| self.schedule[self.schedule_index as usize - 1].mixdepth);
                if prev_mixdepth != Some(entry.mixdepth) {
                    self.mixdepth_balance = self
                        .wallet
                        .get_balance_by_mixdepth()
                        .get(&entry.mixdepth)
                        .copied()
                        .unwrap_or(0);
                }
                let amount = (frac * self.mixdepth_balance as f64) as u64;
                if amount < self.cfg.mincjamount {
                    info!(
                        "Coinjoin amount too low, bringing up to: {}",
                        self.cfg.mincjamount
                    );
                    self.cfg.mincjamount
                } else {
                    amount
                }
            }
        };

        let my_cj_addr = match &entry.destination {
            Destination::Address(addr) => addr.clone(),
            Destination::Internal => {
                let next_mixdepth = (entry.mixdepth + 1) % (self.wallet.mixdepth() + 1);
                info!("Choosing a destination from mixdepth: {}", next_mixdepth);
                let addr = self.wallet.get_internal_addr(next_mixdepth)?;
                info!("Chose destination address: {}", addr);
                self.chain.import_addresses(&[addr.clone()]);
                addr
            }
        };
        self.my_cj_addr = Some(my_cj_addr);
        self.my_change_addr = None;
        self.outputs.clear();
        self.cjfee_total = 0;
        self.maker_txfee_contributions = 0;
        self.total_cj_fee = 0;
        self.latest_tx = None;
        self.txid = None;
        self.maker_utxo_data.clear();
        self.maker_utxos.clear();

        self.filter_orderbook(orderbook, sweep)?;
        self.info(InfoKind::Info, "Preparing bitcoin data..");
        self.prepare_my_bitcoin_data(sweep)?;
        let (commitment, revelation) = self.make_commitment()?;

        self.nonrespondants = self.orderbook.keys().cloned().collect();
        self.state = TakerState::AwaitingUtxos;
        Ok(InitResult::Ready {
            cj_amount: self.cjamount,
            commitment,
            revelation,
            orderbook: self.orderbook.clone(),
        })
    }

    fn filter_orderbook(&mut self, orderbook: &[Offer], sweep: bool) -> Result<(), Error> {
        let book: Vec<Offer> = if self.honest_only {
            orderbook
                .iter()
                .filter(|o| self.honest_makers.contains(&o.counterparty))
                .cloned()
                .collect()
        } else {
            orderbook.to_vec()
        };
        if sweep {
            // offer choosing deferred until input totals are known
            self.sweep_orderbook = book;
            return Ok(());
        }
        let allowed = OrderType::allowed_types(self.cfg.segwit);
        let (chosen, total_cj_fee) = choose_orders(
            &book,
            self.cjamount,
            self.n_counterparties,
            self.order_chooser,
            &self.ignored_makers,
            &allowed,
            self.max_cj_fee,
        )?;
        self.orderbook = chosen;
        self.total_cj_fee = total_cj_fee;
        self.run_filter_callback(total_cj_fee)
    }

    fn run_filter_callback(&mut self, total_cj_fee: u64) -> Result<(), Error> {
        let decision = match &mut self.callbacks.filter_orders {
            Some(callback) => callback(&self.orderbook, total_cj_fee, self.cjamount),
            None => FilterDecision::Accept,
        };
        match decision {
            FilterDecision::Accept => Ok(()),
            FilterDecision::Retry => Err(Error::RetryOffers),
            FilterDecision::Reject => {
                Err(Error::OrdersRejected("rejected by filter callback".into()))
            }
        }
    }

    fn prepare_my_bitcoin_data(&mut self, sweep: bool) -> Result<(), Error> {
        if !sweep {
            let change_addr = match self.wallet.get_internal_addr(self.mixdepth) {
                Ok(addr) => addr,
                Err(e) => {
                    self.info(InfoKind::Abort, "Failed to get a change address");
                    return Err(e);
                }
            };
            self.chain.import_addresses(&[change_addr.clone()]);
            self.my_change_addr = Some(change_addr);
            // over-request to anticipate the post-aggregation fee
            // re-estimate; a doubled default indicates maker misbehavior
            // anyway
            self.total_txfee = 2 * self.cfg.txfee_default * self.n_counterparties as u64;
            let total_amount = self.cjamount + self.total_cj_fee + self.total_txfee;
            info!("total estimated amount spent = {}", total_amount);
            self.input_utxos = match self.wallet.select_utxos(self.mixdepth, total_amount) {
                Ok(utxos) => utxos,
                Err(e) => {
                    self.info(
                        InfoKind::Abort,
                        &format!("Unable to select sufficient coins: {}", e),
                    );
                    return Err(e);
                }
            };
        } else {
            self.input_utxos = self
                .wallet
                .get_utxos_by_mixdepth()
                .remove(&self.mixdepth)
                .unwrap_or_default();
            let est_ins = self.input_utxos.len() + 3 * self.n_counterparties;
            let est_outs = 2 * self.n_counterparties + 1;
            let estimated = estimate_tx_fee(
                est_ins,
                est_outs,
                self.wallet.get_txtype(),
                self.fee_per_kb(),
            );
            debug!("estimated ins: {}, outs: {}, fee: {}", est_ins, est_outs, estimated);
            self.total_txfee =
                estimated.max(self.n_counterparties as u64 * self.cfg.txfee_default);
            let total_value: u64 = self.input_utxos.values().map(|u| u.value).sum();
            let allowed = OrderType::allowed_types(self.cfg.segwit);
            let sweep_book = std::mem::take(&mut self.sweep_orderbook);
            let (chosen, cjamount, total_cj_fee) = match choose_sweep_orders(
                &sweep_book,
                total_value,
                self.total_txfee,
                self.n_counterparties,
                self.order_chooser,
                &self.ignored_makers,
                &allowed,
                self.max_cj_fee,
            ) {
                Ok(result) => result,
                Err(e) => {
                    self.info(
                        InfoKind::Abort,
                        "Could not find orders to complete transaction",
                    );
                    return Err(e);
                }
            };
            self.orderbook = chosen;
            self.cjamount = cjamount;
            self.total_cj_fee = total_cj_fee;
            self.run_filter_callback(total_cj_fee)?;
        }
        Ok(())
    }

    /// `(pairs, too_new, too_small)` for commitment sourcing: utxos passing
    /// the age and amount policy paired with their keys, plus the failures
    /// for operator reporting.
    #[allow(clippy::type_complexity)]
    fn priv_utxo_pairs_from(
        &self,
        utxos: &BTreeMap<OutPoint, WalletUtxo>,
        age: u32,
        amt: u64,
    ) -> (Vec<(PrivateKey, OutPoint)>, Vec<OutPoint>, Vec<OutPoint>) {
        let outpoints: Vec<OutPoint> = utxos.keys().cloned().collect();
        let results = self.chain.query_utxo_set(&outpoints, true);
        let mut pairs = Vec::new();
        let mut too_new = Vec::new();
        let mut too_small = Vec::new();
        for (outpoint, record) in outpoints.iter().zip(results) {
            let record = match record {
                Some(record) => record,
                None => continue, // spent
            };
            let valid_age = record.confirms >= age;
            let valid_amt = record.value >= amt;
            if !valid_age {
                too_new.push(*outpoint);
            }
            if !valid_amt {
                too_small.push(*outpoint);
            }
            if valid_age && valid_amt {
                if let Ok(priv_key) = self.wallet.get_key_from_addr(&utxos[outpoint].address) {
                    pairs.push((priv_key, *outpoint));
                }
            }
        }
        (pairs, too_new, too_small)
    }

    /// Source a PoDLE: first over the inputs about to be spent, then over
    /// the whole wallet plus the external commitment file. The commitment is
    /// recorded used immediately, since a successful return means it will be
    /// sent.
    fn make_commitment(&mut self) -> Result<(String, String), Error> {
        let tries = self.cfg.taker_utxo_retries;
        let age = self.cfg.taker_utxo_age;
        let amt = (self.cjamount as f64 * self.cfg.taker_utxo_amtpercent as f64 / 100.0) as u64;
        let used = self.podle_store.used_commitments()?;

        let (pairs, _, _) = self.priv_utxo_pairs_from(&self.input_utxos, age, amt);
        let mut podle = generate_podle(&pairs, tries, &used, &[])?;
        let mut too_new = Vec::new();
        let mut too_small = Vec::new();
        let mut candidates = pairs.len();
        if podle.is_none() {
            // much cleaner to use the utxos about to be consumed; only now
            // widen to the whole wallet and the external file
            let mut all_utxos = BTreeMap::new();
            for (_, md_utxos) in self.wallet.get_utxos_by_mixdepth() {
                all_utxos.extend(md_utxos);
            }
            let (pairs, tn, ts) = self.priv_utxo_pairs_from(&all_utxos, age, amt);
            too_new = tn;
            too_small = ts;
            candidates = pairs.len();

            let externals = self.podle_store.external_candidates()?;
            let ext_outpoints: Vec<OutPoint> = externals.iter().map(|a| a.utxo).collect();
            let ext_records = self.chain.query_utxo_set(&ext_outpoints, true);
            let ext_valid: Vec<AuthCommitment> = externals
                .into_iter()
                .zip(ext_records)
                .filter_map(|(auth, record)| {
                    let record = record?;
                    (record.confirms >= age && record.value >= amt).then_some(auth)
                })
                .collect();
            podle = generate_podle(&pairs, tries, &used, &ext_valid)?;
        }

        match podle {
            Some(auth) => {
                self.podle_store.record_used(&auth.commit)?;
                self.info(InfoKind::Info, "Commitment sourced OK");
                Ok((commitment_to_wire(&auth.commit), serialize_revelation(&auth)))
            }
            None => {
                let reason = format!(
                    "Failed to source a commitment: {} eligible utxos tried at {} indices each; \
                     {} utxos had fewer than {} confirmations, {} were below {} sats \
                     ({}% of the coinjoin amount {}).",
                    candidates,
                    tries,
                    too_new.len(),
                    age,
                    too_small.len(),
                    amt,
                    self.cfg.taker_utxo_amtpercent,
                    self.cjamount,
                );
                // utxos that are merely too new will qualify once
                // confirmations accrue
                let retryable = !too_new.is_empty();
                self.write_commitments_debug(&reason, &too_new, &too_small);
                if retryable {
                    self.info(InfoKind::Info, &reason);
                } else {
                    self.info(InfoKind::Abort, &reason);
                }
                Err(Error::CommitmentFailure { reason, retryable })
            }
        }
    }

    fn write_commitments_debug(&self, reason: &str, too_new: &[OutPoint], too_small: &[OutPoint]) {
        let mut contents = String::from(
            "THIS IS A TEMPORARY FILE FOR DEBUGGING; IT CAN BE SAFELY DELETED ANY TIME.\n***\n",
        );
        contents.push_str(reason);
        contents.push('\n');
        for outpoint in too_new {
            contents.push_str(&format!("too new: {}\n", utils::outpoint_to_wire(outpoint)));
        }
        for outpoint in too_small {
            contents.push_str(&format!("too small: {}\n", utils::outpoint_to_wire(outpoint)));
        }
        if let Err(e) = fs::write(&self.debug_file_path, contents) {
            warn!("could not write commitments debug file: {}", e);
        }
    }

    /// Phase-1 completion: authenticate each responding maker, validate its
    /// outputs, and build the unsigned transaction.
    pub fn receive_utxos(
        &mut self,
        ioauth_data: &BTreeMap<String, IoAuthEntry>,
    ) -> Result<UnsignedTx, Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        if self.state != TakerState::AwaitingUtxos {
            return Err(Error::WrongPhase);
        }

        let mut accepted: BTreeMap<String, AcceptedIoAuth> = BTreeMap::new();
        for (nick, entry) in ioauth_data {
            if !self.orderbook.contains_key(nick) {
                debug!("ioauth from {} who is not in our chosen orderbook", nick);
                continue;
            }
            // a cryptographic failure may be a transient encryption issue,
            // so the maker is dropped but not blamed
            let auth_pub = match PublicKey::from_str(&entry.auth_pub) {
                Ok(pubkey) => pubkey,
                Err(e) => {
                    debug!("unparseable auth pubkey from {}: {}", nick, e);
                    continue;
                }
            };
            if !utils::ecdsa_verify_message(&entry.maker_pk, &entry.bitcoin_sig, &auth_pub) {
                debug!(
                    "Counterparty encryption verification failed, aborting: {}",
                    nick
                );
                continue;
            }
            // a malformed address is interpreted as malicious
            let cj_addr = Address::from_str(&entry.coinjoin_address);
            let change_addr = Address::from_str(&entry.change_address);
            let (cj_addr, change_addr) = match (cj_addr, change_addr) {
                (Ok(cj), Ok(change)) => (cj, change),
                _ => {
                    warn!(
                        "Counterparty provided invalid address: ({}, {})",
                        entry.coinjoin_address, entry.change_address
                    );
                    self.ignored_makers.insert(nick.clone());
                    continue;
                }
            };
            accepted.insert(
                nick.clone(),
                AcceptedIoAuth {
                    utxos: entry.utxos.clone(),
                    auth_pub,
                    cj_addr,
                    change_addr,
                },
            );
        }

        for (nick, auth) in accepted {
            let utxo_data = self.chain.query_utxo_set(&auth.utxos, false);
            if utxo_data.iter().any(|r| r.is_none()) {
                warn!(
                    "ERROR outputs unconfirmed or already spent. Disregarding counterparty {}",
                    nick
                );
                continue;
            }
            let records: Vec<UtxoRecord> = utxo_data.into_iter().flatten().collect();

            // the claimed auth key must control at least one input
            if !records
                .iter()
                .any(|r| self.wallet.pubkey_has_script(&auth.auth_pub, &r.script))
            {
                warn!(
                    "ERROR maker's ({}) authorising pubkey is not included in the transaction!",
                    nick
                );
                continue;
            }

            let offer = &self.orderbook[&nick];
            let total_input: u64 = records.iter().map(|r| r.value).sum();
            let real_cjfee = calc_cj_fee(offer.ordertype, offer.cjfee, self.cjamount);
            let change_amount = total_input as i64 - self.cjamount as i64 - offer.txfee as i64
                + real_cjfee as i64;

            // makers sending inputs below the coinjoin amount produce dust
            // or negative change; drop them without blame
            if change_amount < self.cfg.dust_threshold as i64 {
                warn!(
                    "ERROR counterparty requires sub-dust change. nick={} totalin={} cjamount={} change={}",
                    nick, total_input, self.cjamount, change_amount
                );
                continue;
            }

            info!(
                "fee breakdown for {} totalin={} cjamount={} txfee={} realcjfee={}",
                nick, total_input, self.cjamount, offer.txfee, real_cjfee
            );
            let offer_txfee = offer.txfee;
            self.outputs.push((auth.change_addr, change_amount as u64));
            self.outputs.push((auth.cj_addr, self.cjamount));
            self.cjfee_total += real_cjfee;
            self.maker_txfee_contributions += offer_txfee;
            self.maker_utxos.insert(nick.clone(), auth.utxos.clone());
            self.maker_utxo_data
                .insert(nick.clone(), auth.utxos.into_iter().zip(records).collect());
            self.nonrespondants.remove(&nick);
        }

        if self.maker_utxo_data.len() < self.cfg.minimum_makers {
            self.info(InfoKind::Info, "Not enough counterparties, aborting.");
            return Err(Error::NotEnoughMakers);
        }
        self.info(InfoKind::Info, "Got all parts, enough to build a tx");

        // nonrespondants now tracks the return of signatures in phase 2
        self.nonrespondants = self.maker_utxo_data.keys().cloned().collect();

        let my_total_in: u64 = self.input_utxos.values().map(|u| u.value).sum();
        if self.my_change_addr.is_some() {
            let total_ins =
                self.input_utxos.len() + self.maker_utxos.values().map(Vec::len).sum::<usize>();
            let estimated = estimate_tx_fee(
                total_ins,
                self.outputs.len() + 2,
                self.wallet.get_txtype(),
                self.fee_per_kb(),
            );
            info!(
                "Based on initial guess: {}, we estimated a miner fee of: {}",
                self.total_txfee, estimated
            );
            self.total_txfee = estimated;
        }
        let my_txfee = taker_txfee_share(self.total_txfee, self.maker_txfee_contributions);
        let mut my_change_value =
            my_total_in as i64 - self.cjamount as i64 - self.cjfee_total as i64 - my_txfee as i64;
        // we could not predict the makers' input counts; a very large maker
        // input set can push the re-estimated fee past our margin
        if self.my_change_addr.is_some() && my_change_value <= 0 {
            return Err(Error::FeeExceedsInputs(self.total_txfee));
        }
        if self.my_change_addr.is_some()
            && my_change_value <= self.cfg.bitcoin_dust_threshold as i64
        {
            info!(
                "Dynamically calculated change lower than dust: {}; dropping.",
                my_change_value
            );
            self.my_change_addr = None;
            my_change_value = 0;
        }
        info!(
            "fee breakdown for me totalin={} my_txfee={} makers_txfee={} cjfee_total={} => changevalue={}",
            my_total_in, my_txfee, self.maker_txfee_contributions, self.cjfee_total, my_change_value
        );
        match &self.my_change_addr {
            None => {
                // integer rounding strands the odd satoshi in the mining fee
                if my_change_value != 0 && my_change_value.abs() != 1 {
                    warn!("CHANGE NOT BEING USED. CHANGEVALUE = {}", my_change_value);
                }
            }
            Some(change_addr) => {
                self.outputs
                    .push((change_addr.clone(), my_change_value as u64));
            }
        }
        let cj_addr = self.my_cj_addr.clone().ok_or(Error::WrongPhase)?;
        self.outputs.push((cj_addr, self.cjamount));

        let mut all_outpoints: Vec<OutPoint> = self.input_utxos.keys().cloned().collect();
        for utxos in self.maker_utxos.values() {
            all_outpoints.extend(utxos.iter().cloned());
        }
        let mut rng = thread_rng();
        all_outpoints.shuffle(&mut rng);
        self.outputs.shuffle(&mut rng);

        let tx = Transaction {
            version: 1,
            lock_time: PackedLockTime::ZERO,
            input: all_outpoints
                .iter()
                .map(|outpoint| TxIn {
                    previous_output: *outpoint,
                    script_sig: Script::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: self
                .outputs
                .iter()
                .map(|(addr, value)| TxOut {
                    value: *value,
                    script_pubkey: addr.script_pubkey(),
                })
                .collect(),
        };
        // our copy carries placeholders on our own inputs so empty-script
        // scanning only ever matches counterparty inputs; the wire copy
        // stays clean
        let mut marked = tx.clone();
        for input in marked.input.iter_mut() {
            if self.input_utxos.contains_key(&input.previous_output) {
                input.script_sig = utils::placeholder_script();
            }
        }
        self.latest_tx = Some(marked);
        self.state = TakerState::AwaitingSigs;
        self.info(InfoKind::Info, "Built tx, sending to counterparties.");
        Ok(UnsignedTx {
            makers: self.maker_utxo_data.keys().cloned().collect(),
            tx,
        })
    }

    /// A signature from a maker. Each is tried against every still-unsigned
    /// input; mixed segwit/legacy transactions are fine since every input is
    /// interpreted separately.
    pub fn on_sig(&mut self, nick: &str, sigb64: &str) -> Result<SigOutcome, Error> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        if self.state != TakerState::AwaitingSigs {
            return Err(Error::WrongPhase);
        }
        if !self.nonrespondants.contains(nick) {
            debug!(
                "signature from nick={} not in nonrespondants {:?}",
                nick, self.nonrespondants
            );
            return Ok(SigOutcome::Ignored);
        }
        let sigmsg = SigScript::from_base64(sigb64)?;
        let mut tx = self.latest_tx.clone().ok_or(Error::WrongPhase)?;

        let candidates: Vec<(usize, OutPoint)> = tx
            .input
            .iter()
            .enumerate()
            .filter(|(_, input)| input.script_sig.is_empty() && input.witness.is_empty())
            .map(|(index, input)| (index, input.previous_output))
            .collect();
        let outpoints: Vec<OutPoint> = candidates.iter().map(|(_, op)| *op).collect();
        let utxo_data = self.chain.query_utxo_set(&outpoints, false);

        let mut inserted: Option<OutPoint> = None;
        for ((index, outpoint), record) in candidates.into_iter().zip(utxo_data) {
            let record = match record {
                Some(record) => record,
                None => continue,
            };
            let good = match &sigmsg {
                SigScript::Legacy { sig, pubkey } => {
                    if utils::verify_tx_input(&tx, index, &record.script, sig, pubkey, None) {
                        tx.input[index].script_sig = sigmsg.serialize();
                        true
                    } else {
                        false
                    }
                }
                SigScript::Segwit {
                    sig,
                    pubkey,
                    script_code,
                } => {
                    let code = Script::from(script_code.clone());
                    let mut good = utils::verify_tx_input(
                        &tx,
                        index,
                        &record.script,
                        sig,
                        pubkey,
                        Some((&code, record.value)),
                    );
                    if !good {
                        // counterparties predating the scriptCode convention
                        // send the witness program third; reconstruct the
                        // scriptCode from the key, assuming p2sh-p2wpkh
                        if let Ok(parsed) = PublicKey::from_slice(pubkey) {
                            let reconstructed = utils::pubkey_to_p2pkh_script(&parsed);
                            good = utils::verify_tx_input(
                                &tx,
                                index,
                                &record.script,
                                sig,
                                pubkey,
                                Some((&reconstructed, record.value)),
                            );
                        }
                    }
                    if good {
                        tx.input[index].witness =
                            Witness::from_vec(vec![sig.clone(), pubkey.clone()]);
                        tx.input[index].script_sig = if utils::is_native_segwit(&record.script) {
                            Script::new()
                        } else {
                            let parsed = PublicKey::from_slice(pubkey)?;
                            let witness_program = utils::pubkey_to_p2wpkh_script(&parsed)?;
                            bitcoin::blockdata::script::Builder::new()
                                .push_slice(witness_program.as_bytes())
                                .into_script()
                        };
                    }
                    good
                }
            };
            if good {
                debug!("found good sig at index={}", index);
                inserted = Some(outpoint);
                break;
            }
        }

        match inserted {
            None => {
                debug!("signature did not match anything in the tx");
                self.latest_tx = Some(tx);
                Ok(SigOutcome::Pending {
                    awaiting: self.nonrespondants.len(),
                })
            }
            Some(outpoint) => {
                if let Some(utxos) = self.maker_utxos.get_mut(nick) {
                    utxos.retain(|op| *op != outpoint);
                    if utxos.is_empty() {
                        debug!("nick = {} sent all sigs, removing from nonrespondant list", nick);
                        self.nonrespondants.remove(nick);
                    }
                }
                let all_signed = tx
                    .input
                    .iter()
                    .all(|input| !input.script_sig.is_empty() || !input.witness.is_empty());
                self.latest_tx = Some(tx);
                if !all_signed || !self.nonrespondants.is_empty() {
                    return Ok(SigOutcome::Pending {
                        awaiting: self.nonrespondants.len(),
                    });
                }
                info!("all makers have sent their signatures");
                self.info(InfoKind::Info, "Transaction is valid, signing..");
                let push = self.self_sign_and_push()?;
                Ok(SigOutcome::Complete(push))
            }
        }
    }

    fn self_sign(&mut self, tx: &mut Transaction) -> Result<(), Error> {
        let mut our_inputs = BTreeMap::new();
        for (index, input) in tx.input.iter().enumerate() {
            if let Some(utxo) = self.input_utxos.get(&input.previous_output) {
                our_inputs.insert(
                    index,
                    (self.wallet.addr_to_script(&utxo.address), utxo.value),
                );
            }
        }
        // clear the placeholders before the wallet writes real scripts
        for index in our_inputs.keys() {
            tx.input[*index].script_sig = Script::new();
        }
        self.wallet.sign_tx(tx, &our_inputs)
    }

    fn self_sign_and_push(&mut self) -> Result<PushResult, Error> {
        let mut tx = self.latest_tx.clone().ok_or(Error::WrongPhase)?;
        self.self_sign(&mut tx)?;
        self.push(tx)
    }

    /// Register the confirmation watch *before* broadcasting, in case the
    /// node notifies faster than we return; a dangling watch after a failed
    /// push is harmless.
    fn push(&mut self, tx: Transaction) -> Result<PushResult, Error> {
        let txid = tx.txid();
        self.txid = Some(txid);
        info!("txid = {}", txid);
        let notify_script = self
            .my_cj_addr
            .as_ref()
            .ok_or(Error::WrongPhase)?
            .script_pubkey();
        self.chain.add_tx_notify(txid, notify_script);
        let txhex = hex::encode(serialize(&tx));
        self.latest_tx = Some(tx.clone());
        self.state = TakerState::AwaitingConfirm;

        let result = match self.cfg.tx_broadcast {
            TxBroadcast::OwnNode => {
                if self.chain.pushtx(&tx) {
                    PushResult::Broadcast { txid }
                } else {
                    PushResult::Failed
                }
            }
            TxBroadcast::RandomPeer | TxBroadcast::NotSelf => {
                // peers are drawn from the sorted nickname list so the
                // index is well defined
                let nicks: Vec<String> = self.maker_utxo_data.keys().cloned().collect();
                let n = nicks.len();
                let choices = if self.cfg.tx_broadcast == TxBroadcast::RandomPeer {
                    n + 1
                } else {
                    n
                };
                let i = if choices == 0 {
                    n
                } else {
                    thread_rng().gen_range(0..choices)
                };
                if i == n {
                    if self.chain.pushtx(&tx) {
                        PushResult::Broadcast { txid }
                    } else {
                        PushResult::Failed
                    }
                } else {
                    PushResult::Delegated {
                        nick: nicks[i].clone(),
                        txhex,
                    }
                }
            }
        };
        if result == PushResult::Failed {
            self.finished(TakerFinish::TxFailed);
        }
        Ok(result)
    }

    pub fn on_tx_unconfirmed(&mut self, _txid: &Txid) -> Result<(), Error> {
        info!("Transaction seen on network, waiting for confirmation");
        // lets the client mark the transaction done, e.g. persist state
        self.finished(TakerFinish::TxUnconfirmed);
        self.waiting_for_conf = true;
        Ok(())
    }

    pub fn on_tx_confirmed(&mut self, txid: &Txid, confirmations: u32) -> Result<(), Error> {
        self.waiting_for_conf = false;
        if self.aborted {
            // the whole schedule is being torn down
            return Ok(());
        }
        debug!("confirmed callback in taker, confs: {}", confirmations);
        let has_more = (self.schedule_index as usize + 1) < self.schedule.len();
        let wait_minutes = self.schedule[self.schedule_index as usize].wait_minutes;
        self.chain.remove_tx_notify(*txid);
        self.state = TakerState::Idle;
        self.finished(TakerFinish::TxConfirmed {
            has_more,
            wait_minutes,
            txid: *txid,
        });
        Ok(())
    }
}
