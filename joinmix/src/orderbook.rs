use std::collections::{BTreeMap, HashSet};

use crate::errors::Error;
use crate::fees::{calc_cj_fee, cj_fee_fraction, taker_txfee_share};
use crate::types::{CjFee, Offer, OrderType};

use log::debug;
use rand::{thread_rng, Rng};

/// An offer with its fee evaluated at a concrete coinjoin amount.
#[derive(Debug, Clone)]
pub struct OfferQuote {
    pub offer: Offer,
    pub cj_fee: u64,
}

/// Strategy plug point: pick `n` quotes from the fee-sorted candidate list.
pub type OrderChooser = fn(&[OfferQuote], usize) -> Vec<OfferQuote>;

/// Deterministic chooser: the `n` cheapest.
pub fn cheapest_order_choose(quotes: &[OfferQuote], n: usize) -> Vec<OfferQuote> {
    quotes.iter().take(n).cloned().collect()
}

/// Default chooser: random selection exponentially weighted toward cheap
/// offers, so fee competition stays meaningful without always picking the
/// same makers.
pub fn weighted_order_choose(quotes: &[OfferQuote], n: usize) -> Vec<OfferQuote> {
    let mut remaining: Vec<OfferQuote> = quotes.to_vec();
    let mut chosen = Vec::with_capacity(n);
    let mut rng = thread_rng();
    while chosen.len() < n && !remaining.is_empty() {
        let scale = (remaining.len() as f64 / 5.0).max(1.0);
        let weights: Vec<f64> = (0..remaining.len())
            .map(|i| (-(i as f64) / scale).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        let mut draw = rng.gen::<f64>() * total;
        let mut pick = remaining.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if draw < *w {
                pick = i;
                break;
            }
            draw -= w;
        }
        chosen.push(remaining.remove(pick));
    }
    chosen
}

/// Filter the orderbook down to fee-sorted, per-counterparty-deduped quotes.
///
/// `fee_amount` is the amount fees are evaluated at; `size_bracket`, when
/// set, additionally requires `minsize <= amount <= maxsize` (sweeps defer
/// that check until the amount is solved). An offer is rejected on fees only
/// when it exceeds both the absolute and the relative cap.
fn eligible_quotes(
    orderbook: &[Offer],
    fee_amount: u64,
    size_bracket: Option<u64>,
    ignored: &HashSet<String>,
    allowed_types: &[OrderType],
    max_cj_fee: (u64, f64),
) -> Vec<OfferQuote> {
    let mut quotes: Vec<OfferQuote> = orderbook
        .iter()
        .filter(|o| !ignored.contains(&o.counterparty))
        .filter(|o| allowed_types.contains(&o.ordertype))
        .filter(|o| size_bracket.map_or(true, |amt| o.minsize <= amt && amt <= o.maxsize))
        .map(|o| OfferQuote {
            cj_fee: calc_cj_fee(o.ordertype, o.cjfee, fee_amount),
            offer: o.clone(),
        })
        .filter(|q| {
            let over_abs = q.cj_fee > max_cj_fee.0;
            let over_rel = cj_fee_fraction(q.cj_fee, fee_amount) > max_cj_fee.1;
            if over_abs && over_rel {
                debug!(
                    "dropping {} oid {}: fee {} over both caps",
                    q.offer.counterparty, q.offer.oid, q.cj_fee
                );
                false
            } else {
                true
            }
        })
        .collect();

    quotes.sort_by(|a, b| {
        a.cj_fee
            .cmp(&b.cj_fee)
            .then_with(|| a.offer.counterparty.cmp(&b.offer.counterparty))
    });
    let mut seen = HashSet::new();
    quotes.retain(|q| seen.insert(q.offer.counterparty.clone()));
    quotes
}

/// Select `n` compatible offers for a fixed coinjoin amount. Returns the
/// chosen offers keyed by counterparty and the total coinjoin fee.
pub fn choose_orders(
    orderbook: &[Offer],
    cj_amount: u64,
    n: usize,
    chooser: OrderChooser,
    ignored: &HashSet<String>,
    allowed_types: &[OrderType],
    max_cj_fee: (u64, f64),
) -> Result<(BTreeMap<String, Offer>, u64), Error> {
    let quotes = eligible_quotes(
        orderbook,
        cj_amount,
        Some(cj_amount),
        ignored,
        allowed_types,
        max_cj_fee,
    );
    if quotes.len() < n {
        return Err(Error::InsufficientLiquidity(format!(
            "{} eligible offers, {} counterparties wanted",
            quotes.len(),
            n
        )));
    }
    let chosen = chooser(&quotes, n);
    if chosen.len() < n {
        return Err(Error::InsufficientLiquidity(format!(
            "chooser returned {} of {} offers",
            chosen.len(),
            n
        )));
    }
    let total_cj_fee = chosen.iter().map(|q| q.cj_fee).sum();
    let orderbook = chosen
        .into_iter()
        .map(|q| (q.offer.counterparty.clone(), q.offer))
        .collect();
    Ok((orderbook, total_cj_fee))
}

/// Sweep variant: the amount is unknown until the offers are fixed, so solve
/// for the largest `cj_amount` leaving zero taker change:
/// `cj = (total_in - taker_txfee_share - sum(absfees)) / (1 + sum(relfees))`.
pub fn choose_sweep_orders(
    orderbook: &[Offer],
    total_input_value: u64,
    total_txfee: u64,
    n: usize,
    chooser: OrderChooser,
    ignored: &HashSet<String>,
    allowed_types: &[OrderType],
    max_cj_fee: (u64, f64),
) -> Result<(BTreeMap<String, Offer>, u64, u64), Error> {
    let quotes = eligible_quotes(
        orderbook,
        total_input_value,
        None,
        ignored,
        allowed_types,
        max_cj_fee,
    );
    if quotes.len() < n {
        return Err(Error::InsufficientLiquidity(format!(
            "{} eligible offers, {} counterparties wanted",
            quotes.len(),
            n
        )));
    }
    let chosen = chooser(&quotes, n);
    if chosen.len() < n {
        return Err(Error::InsufficientLiquidity(format!(
            "chooser returned {} of {} offers",
            chosen.len(),
            n
        )));
    }

    let mut sum_abs: u64 = 0;
    let mut sum_rel: f64 = 0.0;
    let mut maker_txfees: u64 = 0;
    for q in &chosen {
        maker_txfees += q.offer.txfee;
        match q.offer.cjfee {
            CjFee::Absolute(sats) => sum_abs += sats,
            CjFee::Relative(frac) => sum_rel += frac,
        }
    }

    let my_txfee = taker_txfee_share(total_txfee, maker_txfees);
    let budget = total_input_value
        .checked_sub(my_txfee + sum_abs)
        .ok_or_else(|| {
            Error::InsufficientFunds(format!(
                "inputs of {} cannot cover fees",
                total_input_value
            ))
        })?;
    let cj_amount = (budget as f64 / (1.0 + sum_rel)).floor() as u64;

    for q in &chosen {
        if cj_amount < q.offer.minsize || cj_amount > q.offer.maxsize {
            return Err(Error::InsufficientLiquidity(format!(
                "swept amount {} outside bounds of {} oid {}",
                cj_amount, q.offer.counterparty, q.offer.oid
            )));
        }
    }

    let total_cj_fee = chosen
        .iter()
        .map(|q| calc_cj_fee(q.offer.ordertype, q.offer.cjfee, cj_amount))
        .sum();
    debug!(
        "sweep solved: cjamount={} total_cj_fee={} over {} makers",
        cj_amount,
        total_cj_fee,
        chosen.len()
    );
    let orderbook = chosen
        .into_iter()
        .map(|q| (q.offer.counterparty.clone(), q.offer))
        .collect();
    Ok((orderbook, cj_amount, total_cj_fee))
}
