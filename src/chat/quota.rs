//! Quota gate: admission control against an account's allowance

use super::store::LedgerStore;
use crate::error::{RelayError, Result};
use crate::metrics::METRICS;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a turn was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    NoActiveAllowance,
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(DenialReason),
}

/// Gate in front of every turn.
///
/// [`QuotaGate::admit`] is a read-only check used when a message is
/// submitted. The unit itself is taken by [`QuotaGate::reserve`] when the
/// reply starts streaming and handed back by [`QuotaGate::refund`] if the
/// turn fails, so concurrent turns of one account can never overdraw it.
#[derive(Clone)]
pub struct QuotaGate {
    ledgers: Arc<dyn LedgerStore>,
}

impl QuotaGate {
    pub fn new(ledgers: Arc<dyn LedgerStore>) -> Self {
        Self { ledgers }
    }

    pub async fn admit(&self, account_id: &str) -> Result<Admission> {
        let admission = match self.ledgers.find_active(account_id).await? {
            Some(ledger) if ledger.admits() => Admission::Allowed,
            _ => Admission::Denied(DenialReason::NoActiveAllowance),
        };

        METRICS.record_admission(admission == Admission::Allowed);
        if admission != Admission::Allowed {
            warn!("No active allowance for account {}", account_id);
        }
        Ok(admission)
    }

    /// Take one unit for a turn about to stream
    pub async fn reserve(&self, account_id: &str) -> Result<i64> {
        match self.ledgers.decrement(account_id).await {
            Ok(remaining) => {
                METRICS.record_admission(true);
                debug!("Account {} has {} turns remaining", account_id, remaining);
                Ok(remaining)
            }
            Err(RelayError::QuotaDenied) | Err(RelayError::NotFound(_)) => {
                METRICS.record_admission(false);
                warn!("No allowance left to reserve for account {}", account_id);
                Err(RelayError::QuotaDenied)
            }
            Err(e) => Err(e),
        }
    }

    /// Hand back a unit taken by [`QuotaGate::reserve`]
    pub async fn refund(&self, account_id: &str) -> Result<i64> {
        let remaining = self.ledgers.refund(account_id).await?;
        debug!("Refunded account {}, {} turns remaining", account_id, remaining);
        Ok(remaining)
    }
}
