use crate::types::UtxoRecord;

use bitcoin::{Address, OutPoint, Script, Transaction, Txid};

/// The blockchain contract the coordination core consumes.
///
/// Transaction watching is modeled as registered interest: the adapter holds
/// `(txid, watch_script)` pairs and drives the role's
/// `on_tx_unconfirmed`/`on_tx_confirmed` entry points when it sees the
/// transaction; the role unregisters on abort, so the adapter never holds a
/// reference into role state.
pub trait ChainAdapter {
    fn wallet_synced(&self) -> bool;

    /// Look up each outpoint in the current utxo set; `None` entries are
    /// spent or unknown. Confirmation counts are only populated when
    /// `include_confs` is set.
    fn query_utxo_set(&self, outpoints: &[OutPoint], include_confs: bool) -> Vec<Option<UtxoRecord>>;

    /// Current fee rate in sat/kvB for the given confirmation target.
    fn estimate_fee_per_kb(&self, conf_target: u32) -> Option<u64>;

    fn pushtx(&mut self, tx: &Transaction) -> bool;

    fn add_tx_notify(&mut self, txid: Txid, watch_script: Script);

    fn remove_tx_notify(&mut self, txid: Txid);

    /// Optional capability; nodes that track wallets by imported address
    /// override this.
    fn import_addresses(&mut self, _addrs: &[Address]) {}
}
