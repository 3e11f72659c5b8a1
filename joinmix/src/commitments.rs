use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::Error;
use crate::types::AuthCommitment;

use bitcoin::OutPoint;
use bitcoin_hashes::{sha256, Hash};
use log::warn;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// On-disk shape of the commitment store: every commitment we have ever
/// revealed, plus externally imported commitments keyed by their hash.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct StoreFile {
    used: Vec<String>,
    external: BTreeMap<String, ExternalEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExternalEntry {
    #[serde(rename = "P")]
    pub p: String,
    #[serde(rename = "P2")]
    pub p2: String,
    pub sig: String,
    pub e: String,
    pub utxo: String,
    pub used: bool,
}

impl ExternalEntry {
    fn to_auth(&self) -> Result<AuthCommitment, Error> {
        let p2 = PublicKey::from_str(&self.p2)?;
        Ok(AuthCommitment {
            p: PublicKey::from_str(&self.p)?,
            commit: sha256::Hash::hash(&p2.serialize()),
            p2,
            sig: hex::decode(&self.sig)?,
            e: sha256::Hash::from_str(&self.e)
                .map_err(|e| Error::MalformedRevelation(e.to_string()))?,
            utxo: OutPoint::from_str(&self.utxo)?,
        })
    }

    fn from_auth(auth: &AuthCommitment) -> Self {
        ExternalEntry {
            p: auth.p.to_string(),
            p2: auth.p2.to_string(),
            sig: hex::encode(&auth.sig),
            e: auth.e.to_string(),
            utxo: auth.utxo.to_string(),
            used: false,
        }
    }
}

/// File-backed store of used and external PoDLE commitments. Writes go to a
/// temporary file in the same directory and replace the target atomically.
pub struct PodleStore {
    path: PathBuf,
}

impl PodleStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PodleStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile, Error> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &StoreFile) -> Result<(), Error> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), file)?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Every commitment that must not be revealed again: the used list plus
    /// external entries already flagged used.
    pub fn used_commitments(&self) -> Result<HashSet<sha256::Hash>, Error> {
        let file = self.load()?;
        let mut used = HashSet::new();
        for commit in file
            .used
            .iter()
            .chain(file.external.iter().filter(|(_, e)| e.used).map(|(c, _)| c))
        {
            match sha256::Hash::from_str(commit) {
                Ok(hash) => {
                    used.insert(hash);
                }
                Err(e) => warn!("skipping unparseable commitment {}: {}", commit, e),
            }
        }
        Ok(used)
    }

    /// Imported commitments still available for use.
    pub fn external_candidates(&self) -> Result<Vec<AuthCommitment>, Error> {
        let file = self.load()?;
        let mut candidates = Vec::new();
        for (commit, entry) in file.external.iter().filter(|(_, e)| !e.used) {
            match entry.to_auth() {
                Ok(auth) => candidates.push(auth),
                Err(e) => warn!("skipping unparseable external commitment {}: {}", commit, e),
            }
        }
        Ok(candidates)
    }

    /// Record that a commitment has been revealed. Idempotent.
    pub fn record_used(&self, commit: &sha256::Hash) -> Result<(), Error> {
        let mut file = self.load()?;
        let commit_str = commit.to_string();
        if let Some(entry) = file.external.get_mut(&commit_str) {
            entry.used = true;
        }
        if !file.used.contains(&commit_str) {
            file.used.push(commit_str);
        }
        self.save(&file)
    }

    /// Import an externally generated commitment for later fallback use.
    pub fn add_external(&self, auth: &AuthCommitment) -> Result<(), Error> {
        let mut file = self.load()?;
        file.external
            .insert(auth.commit.to_string(), ExternalEntry::from_auth(auth));
        self.save(&file)
    }

    /// Raw contents, for operator tooling.
    pub fn entries(&self) -> Result<(Vec<String>, BTreeMap<String, ExternalEntry>), Error> {
        let file = self.load()?;
        Ok((file.used, file.external))
    }
}
