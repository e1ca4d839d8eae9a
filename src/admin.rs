use std::sync::Arc;

use thiserror::Error;

use crate::subnet_store::{SubnetStore, SubnetStoreError};
use crate::subnets::ListKind;
use crate::updates::{UpdateError, UpdatePublisher};

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("cidr is empty")]
    EmptyCidr,
    #[error("invalid CIDR '{cidr}': {source}")]
    InvalidCidr {
        cidr: String,
        source: ipnetwork::IpNetworkError,
    },
    #[error("Subnet store operation failed: {0}")]
    StoreError(#[from] SubnetStoreError),
    #[error("Subnet update publish failed after store write: {0}")]
    PublishError(#[from] UpdateError),
}

/// Applies allow/deny list mutations and broadcasts an invalidation so every
/// replica rebuilds its snapshot. CIDRs are validated before the store is
/// touched. A publish failure after a successful write still surfaces as an
/// error: the write stuck, propagation is uncertain until the next publish.
pub struct SubnetAdmin {
    store: Arc<dyn SubnetStore>,
    publisher: Arc<dyn UpdatePublisher>,
    log: slog::Logger,
}

impl SubnetAdmin {
    pub fn new(
        store: Arc<dyn SubnetStore>,
        publisher: Arc<dyn UpdatePublisher>,
        log: slog::Logger,
    ) -> SubnetAdmin {
        SubnetAdmin {
            store,
            publisher,
            log,
        }
    }

    pub async fn add(&self, kind: ListKind, cidr: &str) -> Result<(), AdminError> {
        validate_cidr(cidr)?;
        self.store.add(kind, cidr).await?;
        slog::info!(self.log, "Added subnet"; "list" => kind.as_str(), "cidr" => cidr);
        self.publisher.publish().await?;
        Ok(())
    }

    pub async fn remove(&self, kind: ListKind, cidr: &str) -> Result<(), AdminError> {
        validate_cidr(cidr)?;
        self.store.remove(kind, cidr).await?;
        slog::info!(self.log, "Removed subnet"; "list" => kind.as_str(), "cidr" => cidr);
        self.publisher.publish().await?;
        Ok(())
    }
}

fn validate_cidr(cidr: &str) -> Result<(), AdminError> {
    if cidr.is_empty() {
        return Err(AdminError::EmptyCidr);
    }
    cidr.parse::<ipnetwork::IpNetwork>()
        .map_err(|source| AdminError::InvalidCidr {
            cidr: cidr.to_owned(),
            source,
        })?;
    Ok(())
}
