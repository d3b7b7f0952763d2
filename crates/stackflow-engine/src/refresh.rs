//! Drift detection
//!
//! Reads every recorded object back from the provider and folds the answers
//! into the state: drifted attributes are overwritten, vanished objects are
//! forgotten.

use crate::provider::{Operation, Provider, ProviderError};
use crate::resource::{Attributes, InstanceAddress};
use crate::state::StateFile;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::time::Duration;

/// Attributes of one instance that no longer match the record
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub address: InstanceAddress,
    pub attributes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub checked: usize,
    pub drifted: Vec<Drift>,
    pub vanished: Vec<InstanceAddress>,
    pub errors: Vec<(InstanceAddress, ProviderError)>,
}

impl RefreshReport {
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.vanished.is_empty()
    }
}

fn drifted_attributes(recorded: &Attributes, current: &Attributes) -> Vec<String> {
    let keys: BTreeSet<&String> = recorded.keys().chain(current.keys()).collect();
    keys.into_iter()
        .filter(|k| recorded.get(*k) != current.get(*k))
        .cloned()
        .collect()
}

/// Refresh `state` in place. Deposed records and records without an id are
/// left alone.
#[tracing::instrument(skip_all, fields(records = state.len()))]
pub async fn refresh(
    provider: &dyn Provider,
    state: &mut StateFile,
    parallelism: usize,
    default_timeout: Option<Duration>,
) -> RefreshReport {
    let targets: Vec<(InstanceAddress, String)> = state
        .records()
        .filter(|r| r.deposed.is_none())
        .filter_map(|r| r.id().map(|id| (r.address(), id.to_string())))
        .collect();

    let reads = stream::iter(targets)
        .map(|(address, id)| async move {
            let resource_type = address.resource_type().to_string();
            let limit = provider
                .operation_timeout(&resource_type, Operation::Read)
                .or(default_timeout);
            let read = provider.read(&resource_type, &id);
            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, read).await.unwrap_or_else(|_| {
                    Err(ProviderError::timeout(format!("read of {} timed out", address)))
                }),
                None => read.await,
            };
            (address, result)
        })
        .buffered(parallelism.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut report = RefreshReport {
        checked: reads.len(),
        ..Default::default()
    };
    for (address, result) in reads {
        match result {
            Ok(Some(mut current)) => {
                let Some(record) = state.get_mut(&address) else {
                    continue;
                };
                if let Some(id) = record.attributes.get("id") {
                    current.entry("id".to_string()).or_insert_with(|| id.clone());
                }
                let changed = drifted_attributes(&record.attributes, &current);
                if !changed.is_empty() {
                    tracing::info!(address = %address, attributes = ?changed, "Drift detected");
                    record.attributes = current;
                    report.drifted.push(Drift {
                        address,
                        attributes: changed,
                    });
                }
            }
            Ok(None) => {
                tracing::info!(address = %address, "Object no longer exists");
                state.remove(&address, None);
                report.vanished.push(address);
            }
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Refresh read failed");
                report.errors.push((address, e));
            }
        }
    }
    report
}
