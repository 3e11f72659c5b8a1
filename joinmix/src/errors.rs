use thiserror::Error;

/// Coarse failure categories used by the relay layer to decide whether a
/// failed entry point should be retried, the counterparty dropped, or the
/// whole schedule aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Parse failure on counterparty data; reject locally, do not blame.
    MalformedInput,
    /// Cryptographic authentication failed; drop the counterparty.
    AuthFailed,
    /// Counterparty data was well formed but violates policy; treat as
    /// malicious where the caller chooses to.
    PolicyViolation,
    /// Not enough offers, coins or respondents; retryable at schedule level.
    InsufficientLiquidity,
    /// No unused PoDLE commitment anywhere; retryable after confirmations.
    CommitmentExhausted,
    /// Unrecoverable; abort the process or schedule.
    Fatal,
    /// The user requested cancellation.
    Aborted,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("User aborted")]
    Aborted,

    #[error("malformed txhex: {0}")]
    MalformedTx(#[from] bitcoin::consensus::encode::Error),

    #[error("malformed commitment revelation: {0}")]
    MalformedRevelation(String),

    #[error("junk signature")]
    JunkSignature,

    #[error("verify_podle failed")]
    PodleVerifyFailed,

    #[error("podle commitment does not match revelation")]
    PodleCommitmentMismatch,

    #[error("could not derive a NUMS generator for index {0}")]
    NumsDerivation(u8),

    #[error("failed to source a commitment: {reason}")]
    CommitmentFailure { reason: String, retryable: bool },

    #[error("authorizing utxo is not valid")]
    AuthUtxoInvalid,

    #[error("commitment utxo not old enough: {0}")]
    AuthUtxoTooNew(u32),

    #[error("commitment utxo too small: {0}")]
    AuthUtxoTooSmall(u64),

    #[error("invalid podle pubkey {0}")]
    AuthPubkeyMismatch(String),

    #[error("counterparty signature verification failed")]
    CounterpartyAuthFailed,

    #[error("unknown oid {0}")]
    UnknownOid(u32),

    #[error("amount {amount} outside offer bounds [{minsize}, {maxsize}]")]
    AmountOutOfBounds {
        amount: u64,
        minsize: u64,
        maxsize: u64,
    },

    #[error("my utxos are not contained")]
    UtxosNotContained,

    #[error("Wrong cj_amount. I expect {0}")]
    WrongCjAmount(u64),

    #[error("wrong change, i expect {0}")]
    WrongChange(i64),

    #[error("cj or change addr not in tx outputs once, #cjaddr={cj}, #chaddr={change}")]
    AddrCountMismatch { cj: usize, change: usize },

    #[error("could not find funds to fill order")]
    NoOrderFunds,

    #[error("Not enough counterparties responded to fill, giving up")]
    NotEnoughMakers,

    #[error("insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("could not select sufficient coins: {0}")]
    InsufficientFunds(String),

    #[error("offers rejected: {0}")]
    OrdersRejected(String),

    #[error("offers not accepted, retrying")]
    RetryOffers,

    #[error("calculated transaction fee of {0} is too large for our inputs")]
    FeeExceedsInputs(u64),

    #[error("Failed to create offers, giving up")]
    NoOffersCreated,

    #[error("wallet is not synced")]
    WalletNotSynced,

    #[error("no active order for counterparty {0}")]
    UnknownCounterparty(String),

    #[error("message arrived in wrong protocol phase")]
    WrongPhase,

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] bitcoin::util::address::Error),

    #[error("invalid outpoint: {0}")]
    InvalidOutpoint(#[from] bitcoin::blockdata::transaction::ParseOutPointError),

    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),

    #[error("key error: {0}")]
    Key(#[from] bitcoin::util::key::Error),

    #[error("sighash error: {0}")]
    Sighash(String),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("wallet error: {0}")]
    Wallet(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            Aborted => ErrorClass::Aborted,
            MalformedTx(_) | MalformedRevelation(_) | JunkSignature | Serde(_) | Hex(_)
            | Base64(_) | InvalidOutpoint(_) => ErrorClass::MalformedInput,
            PodleVerifyFailed
            | PodleCommitmentMismatch
            | AuthPubkeyMismatch(_)
            | CounterpartyAuthFailed
            | Secp(_)
            | Key(_)
            | Sighash(_) => ErrorClass::AuthFailed,
            AuthUtxoInvalid
            | AuthUtxoTooNew(_)
            | AuthUtxoTooSmall(_)
            | UnknownOid(_)
            | AmountOutOfBounds { .. }
            | UtxosNotContained
            | WrongCjAmount(_)
            | WrongChange(_)
            | AddrCountMismatch { .. }
            | InvalidAddress(_)
            | WrongPhase
            | UnknownCounterparty(_) => ErrorClass::PolicyViolation,
            NoOrderFunds
            | NotEnoughMakers
            | InsufficientLiquidity(_)
            | InsufficientFunds(_)
            | OrdersRejected(_)
            | RetryOffers => ErrorClass::InsufficientLiquidity,
            CommitmentFailure { .. } | NumsDerivation(_) => ErrorClass::CommitmentExhausted,
            FeeExceedsInputs(_) | NoOffersCreated | WalletNotSynced | Io(_) | Wallet(_) => {
                ErrorClass::Fatal
            }
        }
    }
}
