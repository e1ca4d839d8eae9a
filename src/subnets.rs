use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::subnet_store::{SubnetStore, SubnetStoreError};

#[derive(Error, Debug)]
pub enum SubnetError {
    #[error("invalid CIDR '{cidr}': {source}")]
    InvalidCidr {
        cidr: String,
        source: ipnetwork::IpNetworkError,
    },
    #[error("Subnet store operation failed: {0}")]
    StoreError(#[from] SubnetStoreError),
}

/// Which of the two subnet lists a CIDR belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Allow,
    Deny,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Allow => "allow",
            ListKind::Deny => "deny",
        }
    }
}

/// Outcome of matching an address against the subnet lists. `Deny` always
/// wins over `Allow`; `Continue` hands the decision to the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deny,
    Allow,
    Continue,
}

/// A read-only collection of CIDR blocks. Membership is exact on address
/// family: a v4 address never matches a v6 block and vice versa.
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    blocks: Vec<ipnetwork::IpNetwork>,
}

impl CidrSet {
    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Result<CidrSet, SubnetError> {
        let mut blocks = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let cidr = cidr.as_ref();
            let block = cidr
                .parse::<ipnetwork::IpNetwork>()
                .map_err(|source| SubnetError::InvalidCidr {
                    cidr: cidr.to_owned(),
                    source,
                })?;
            blocks.push(block);
        }
        Ok(CidrSet { blocks })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.blocks.iter().any(|block| block.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    allow: CidrSet,
    deny: CidrSet,
}

/// Holds the current allow/deny snapshot and answers membership checks
/// against it. `reload` builds a complete replacement snapshot from the
/// subnet store and swaps it in; readers always observe either the old or
/// the new pair, never a mixture.
pub struct SubnetHolder {
    store: Arc<dyn SubnetStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    log: slog::Logger,
}

impl SubnetHolder {
    pub fn new(store: Arc<dyn SubnetStore>, log: slog::Logger) -> SubnetHolder {
        SubnetHolder {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            log,
        }
    }

    pub fn check(&self, ip: IpAddr) -> Decision {
        let snapshot = self.current();

        if snapshot.deny.contains(ip) {
            return Decision::Deny;
        }
        if snapshot.allow.contains(ip) {
            return Decision::Allow;
        }
        Decision::Continue
    }

    pub async fn reload(&self) -> Result<(), SubnetError> {
        let allow_cidrs = self.store.list(ListKind::Allow).await?;
        let deny_cidrs = self.store.list(ListKind::Deny).await?;

        // Build both sets before touching the published snapshot so a parse
        // failure leaves the previous snapshot in place.
        let next = Snapshot {
            allow: CidrSet::from_cidrs(&allow_cidrs)?,
            deny: CidrSet::from_cidrs(&deny_cidrs)?,
        };

        slog::debug!(self.log, "Reloaded subnet lists";
            "allow" => next.allow.len(), "deny" => next.deny.len());

        let next = Arc::new(next);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    fn current(&self) -> Arc<Snapshot> {
        // The snapshot is immutable once published, so recovering a poisoned
        // lock cannot observe partial state.
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
