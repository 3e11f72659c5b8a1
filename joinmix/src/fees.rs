use crate::types::{CjFee, OrderType, TxType};

/// The fee a maker actually earns on a coinjoin of `cj_amount` sats.
/// Relative fees round toward zero.
pub fn calc_cj_fee(ordertype: OrderType, cjfee: CjFee, cj_amount: u64) -> u64 {
    debug_assert_eq!(ordertype.is_relative(), matches!(cjfee, CjFee::Relative(_)));
    match cjfee {
        CjFee::Absolute(sats) => sats,
        CjFee::Relative(frac) => (frac * cj_amount as f64).floor() as u64,
    }
}

/// The fee as a fraction of the coinjoin amount, for relative fee caps.
pub fn cj_fee_fraction(fee: u64, cj_amount: u64) -> f64 {
    fee as f64 / cj_amount.max(1) as f64
}

/// What a maker must receive back as change. Taker-controlled messages
/// cannot move this value: every term is from the maker's own records.
pub fn expected_change_value(total_in: u64, cj_amount: u64, txfee: u64, real_cjfee: u64) -> i64 {
    total_in as i64 - cj_amount as i64 - txfee as i64 + real_cjfee as i64
}

/// The taker's share of the mining fee after maker contributions.
pub fn taker_txfee_share(total_txfee: u64, maker_contributions: u64) -> u64 {
    total_txfee.saturating_sub(maker_contributions)
}

/// Mining fee estimate from input/output counts and the wallet's script
/// type, given a sat/kvB fee rate.
pub fn estimate_tx_fee(ins: usize, outs: usize, txtype: TxType, fee_per_kb: u64) -> u64 {
    let input_vbytes = match txtype {
        TxType::P2pkh => 148,
        TxType::P2shP2wpkh => 91,
        TxType::P2wpkh => 68,
    };
    let vbytes = (10 + ins * input_vbytes + outs * 34) as u64;
    (fee_per_kb * vbytes + 999) / 1000
}
