use std::collections::BTreeMap;

use crate::errors::Error;
use crate::types::{TxType, WalletUtxo};
use crate::utils;

use bitcoin::{Address, OutPoint, PrivateKey, PublicKey, Script, Transaction};

/// The wallet contract the coordination core consumes. The wallet owns key
/// derivation and final signing; the core only ever sees addresses, scripts
/// and outpoints.
pub trait WalletAdapter {
    /// Highest mixdepth index this wallet segregates coins into.
    fn mixdepth(&self) -> u32;

    fn get_txtype(&self) -> TxType;

    fn get_utxos_by_mixdepth(&self) -> BTreeMap<u32, BTreeMap<OutPoint, WalletUtxo>>;

    fn get_balance_by_mixdepth(&self) -> BTreeMap<u32, u64> {
        self.get_utxos_by_mixdepth()
            .into_iter()
            .map(|(md, utxos)| (md, utxos.values().map(|u| u.value).sum()))
            .collect()
    }

    /// Pick coins at `mixdepth` totalling at least `amount` sats.
    fn select_utxos(
        &self,
        mixdepth: u32,
        amount: u64,
    ) -> Result<BTreeMap<OutPoint, WalletUtxo>, Error>;

    /// A fresh internal (change-branch) address at `mixdepth`.
    fn get_internal_addr(&mut self, mixdepth: u32) -> Result<Address, Error>;

    fn get_key_from_addr(&self, addr: &Address) -> Result<PrivateKey, Error>;

    fn addr_to_script(&self, addr: &Address) -> Script {
        addr.script_pubkey()
    }

    /// Whether `script` pays to `pubkey` in any script style this wallet
    /// understands.
    fn pubkey_has_script(&self, pubkey: &PublicKey, script: &Script) -> bool {
        utils::pubkey_matches_script(pubkey, script)
    }

    /// Sign the given inputs in place. Keys are located from the spent
    /// script; `amount` is required for segwit digests.
    fn sign_tx(
        &self,
        tx: &mut Transaction,
        our_inputs: &BTreeMap<usize, (Script, u64)>,
    ) -> Result<(), Error>;
}
