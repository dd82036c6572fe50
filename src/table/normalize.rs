use log::trace;

use crate::types::errors::{AspaStoreError, UpdateError};
use crate::types::update::{UpdateKind, UpdateOp};

//------------ Batch normalization -------------------------------------------

/// Brings an update batch into the form the updaters consume.
///
/// The batch is stable-sorted by customer ASN, with the original batch
/// position as the tie-breaker, so operations for one customer keep their
/// arrival order. Within each run of equal customer ASNs, an announcement
/// that is immediately followed by a withdrawal cancels out; both are
/// annotated as no-ops and skipped by the updaters. Two announcements or
/// two withdrawals that meet without such an annihilation in between make
/// the whole batch malformed.
///
/// On failure the reported index is the offending operation's original
/// batch position and the batch is left in its sorted state; the caller
/// drops it.
pub(crate) fn normalize(ops: &mut [UpdateOp]) -> Result<(), UpdateError> {
    for op in ops.iter() {
        if op.kind == UpdateKind::Withdraw && op.providers.is_some() {
            return Err(UpdateError::new(
                AspaStoreError::InvalidArgument,
                op.index,
            ));
        }
    }

    ops.sort_by(|a, b| {
        a.customer.cmp(&b.customer).then(a.index.cmp(&b.index))
    });

    let mut prev: Option<usize> = None;
    for cur in 0..ops.len() {
        let prev_idx = match prev {
            Some(p) if ops[p].customer == ops[cur].customer => p,
            _ => {
                prev = Some(cur);
                continue;
            }
        };
        match (ops[prev_idx].kind, ops[cur].kind) {
            (UpdateKind::Announce, UpdateKind::Announce) => {
                return Err(UpdateError::new(
                    AspaStoreError::DuplicateRecord,
                    ops[cur].index,
                ));
            }
            (UpdateKind::Withdraw, UpdateKind::Withdraw) => {
                return Err(UpdateError::new(
                    AspaStoreError::RecordNotFound,
                    ops[cur].index,
                ));
            }
            (UpdateKind::Announce, UpdateKind::Withdraw) => {
                trace!(
                    "ops {} and {} for {} cancel out",
                    ops[prev_idx].index,
                    ops[cur].index,
                    ops[cur].customer
                );
                ops[prev_idx].no_op = true;
                ops[cur].no_op = true;
                prev = None;
            }
            (UpdateKind::Withdraw, UpdateKind::Announce) => {
                // The withdrawal targets an existing record, the
                // announcement introduces a fresh one. Both stand.
                prev = Some(cur);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::aspa::ProviderAsns;
    use crate::types::update::UpdateBatch;

    fn providers(asns: &[u32]) -> ProviderAsns {
        asns.iter().copied().collect()
    }

    #[test]
    fn sorts_by_customer_with_stable_ties() {
        let mut batch = UpdateBatch::new();
        batch.announce(300.into(), providers(&[1]));
        batch.withdraw(100.into());
        batch.announce(100.into(), providers(&[2]));
        batch.announce(200.into(), providers(&[3]));

        normalize(batch.ops_mut()).expect("well-formed batch");

        let order: Vec<(u32, usize)> = batch
            .iter()
            .map(|op| (op.customer().into_u32(), op.index()))
            .collect();
        assert_eq!(order, vec![(100, 1), (100, 2), (200, 3), (300, 0)]);
    }

    #[test]
    fn duplicate_announcements_fail_at_the_second() {
        let mut batch = UpdateBatch::new();
        batch.announce(100.into(), providers(&[200]));
        batch.announce(100.into(), providers(&[300]));

        let err = normalize(batch.ops_mut()).expect_err("duplicate");
        assert_eq!(err.error, AspaStoreError::DuplicateRecord);
        assert_eq!(err.failed_index, Some(1));
    }

    #[test]
    fn double_withdrawal_fails_at_the_second() {
        let mut batch = UpdateBatch::new();
        batch.withdraw(100.into());
        batch.withdraw(100.into());

        let err = normalize(batch.ops_mut()).expect_err("double withdraw");
        assert_eq!(err.error, AspaStoreError::RecordNotFound);
        assert_eq!(err.failed_index, Some(1));
    }

    #[test]
    fn announce_withdraw_pairs_annihilate() {
        let mut batch = UpdateBatch::new();
        batch.announce(100.into(), providers(&[200]));
        batch.withdraw(100.into());

        normalize(batch.ops_mut()).expect("well-formed batch");
        assert!(batch.iter().all(|op| op.is_no_op()));
    }

    #[test]
    fn withdraw_then_announce_both_stand() {
        let mut batch = UpdateBatch::new();
        batch.withdraw(100.into());
        batch.announce(100.into(), providers(&[200]));

        normalize(batch.ops_mut()).expect("well-formed batch");
        assert!(batch.iter().all(|op| !op.is_no_op()));
    }

    #[test]
    fn annihilation_across_longer_runs() {
        // announce, withdraw, announce: the first pair cancels, the last
        // announcement stands.
        let mut batch = UpdateBatch::new();
        batch.announce(100.into(), providers(&[1]));
        batch.withdraw(100.into());
        batch.announce(100.into(), providers(&[2]));

        normalize(batch.ops_mut()).expect("well-formed batch");
        let no_ops: Vec<bool> =
            batch.iter().map(|op| op.is_no_op()).collect();
        assert_eq!(no_ops, vec![true, true, false]);

        // announce, withdraw, withdraw: the pair cancels and the leftover
        // withdrawal stands; whether its target exists is decided against
        // the live store at apply time.
        let mut batch = UpdateBatch::new();
        batch.announce(100.into(), providers(&[1]));
        batch.withdraw(100.into());
        batch.withdraw(100.into());

        normalize(batch.ops_mut()).expect("well-formed batch");
        let no_ops: Vec<bool> =
            batch.iter().map(|op| op.is_no_op()).collect();
        assert_eq!(no_ops, vec![true, true, false]);
    }

    #[test]
    fn withdrawal_with_providers_is_malformed() {
        let mut batch = UpdateBatch::new();
        batch.announce(100.into(), providers(&[200]));
        batch.push(UpdateKind::Withdraw, 200.into(), providers(&[300]));

        let err = normalize(batch.ops_mut()).expect_err("malformed");
        assert_eq!(err.error, AspaStoreError::InvalidArgument);
        assert_eq!(err.failed_index, Some(1));
    }
}
