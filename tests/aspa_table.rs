use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use aspa_store::{
    Asn, AspaRecord, AspaStoreError, AspaTable, ChangeKind, Config,
    HopResult, InPlaceConfig, ProviderAsns, SocketId, SwapInConfig,
    UpdateBatch, UpdateObserver,
};
use rand::Rng;

mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

//------------ Test helpers --------------------------------------------------

#[derive(Default)]
struct RecordLog {
    events: Mutex<Vec<(SocketId, AspaRecord, ChangeKind)>>,
}

impl RecordLog {
    fn drain(&self) -> Vec<(u32, Vec<u32>, ChangeKind)> {
        self.events
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, record, change)| {
                (
                    record.customer.into_u32(),
                    record
                        .providers
                        .iter()
                        .map(Asn::into_u32)
                        .collect(),
                    change,
                )
            })
            .collect()
    }
}

impl UpdateObserver for RecordLog {
    fn record_changed(
        &self,
        socket: SocketId,
        record: &AspaRecord,
        change: ChangeKind,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((socket, record.clone(), change));
    }
}

fn providers(asns: &[u32]) -> ProviderAsns {
    asns.iter().copied().collect()
}

fn observed_table<C: Config>(
    config: C,
) -> (AspaTable<C>, Arc<RecordLog>) {
    let log = Arc::new(RecordLog::default());
    let table = AspaTable::new_with_observer(
        config,
        Box::new(log.clone()),
    );
    (table, log)
}

fn contents(
    table: &AspaTable<impl Config>,
    socket: SocketId,
) -> Vec<(u32, Vec<u32>)> {
    let guard = &aspa_store::epoch::pin();
    table
        .socket_records(socket, guard)
        .unwrap_or_default()
        .iter()
        .map(|record| {
            (
                record.customer.into_u32(),
                record.providers.iter().map(Asn::into_u32).collect(),
            )
        })
        .collect()
}

//------------ Scenarios -----------------------------------------------------

#[test]
fn happy_announcement() -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let (table, log) = observed_table(SwapInConfig::default());
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200, 300]));
    table.update(socket, batch)?;

    assert_eq!(contents(&table, socket), vec![(100, vec![200, 300])]);
    assert_eq!(
        log.drain(),
        vec![(100, vec![200, 300], ChangeKind::Added)]
    );
    assert_eq!(table.num_records(), 1);

    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        table.check_hop(100.into(), 200.into(), guard),
        HopResult::ProviderPlus
    );
    assert_eq!(
        table.check_hop(100.into(), 400.into(), guard),
        HopResult::NotProviderPlus
    );
    assert_eq!(
        table.check_hop(999.into(), 200.into(), guard),
        HopResult::NoAttestation
    );
    Ok(())
}

#[test]
fn duplicate_announcement_in_batch() {
    common::init();
    let table: AspaTable = AspaTable::new();
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    batch.announce(100.into(), providers(&[300]));

    let err = table.update(socket, batch).expect_err("duplicate");
    assert_eq!(err.error, AspaStoreError::DuplicateRecord);
    assert_eq!(err.failed_index, Some(1));
    assert_eq!(table.num_records(), 0);

    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        table.check_hop(100.into(), 200.into(), guard),
        HopResult::NoAttestation
    );
}

#[test]
fn complementary_ops_cancel_silently() {
    common::init();
    let (table, log) = observed_table(SwapInConfig {
        notify_no_ops: false,
    });
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    batch.withdraw(100.into());
    table.update(socket, batch).expect("cancels out");

    assert_eq!(contents(&table, socket), vec![]);
    assert_eq!(log.drain(), vec![]);
}

#[test]
fn complementary_ops_can_notify_in_pairs() {
    common::init();
    let (table, log) = observed_table(SwapInConfig {
        notify_no_ops: true,
    });
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    batch.withdraw(100.into());
    table.update(socket, batch).expect("cancels out");

    assert_eq!(contents(&table, socket), vec![]);
    assert_eq!(
        log.drain(),
        vec![
            (100, vec![200], ChangeKind::Added),
            (100, vec![200], ChangeKind::Removed),
        ]
    );
}

#[test]
fn withdrawal_of_unknown_record() {
    common::init();
    let table: AspaTable = AspaTable::new();
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    table.update(socket, batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.withdraw(200.into());
    let err = table.update(socket, batch).expect_err("unknown");
    assert_eq!(err.error, AspaStoreError::RecordNotFound);
    assert_eq!(err.failed_index, Some(0));
    assert_eq!(contents(&table, socket), vec![(100, vec![200])]);
}

#[test]
fn failed_in_place_batch_is_rolled_back() {
    common::init();
    let table: AspaTable<InPlaceConfig> = AspaTable::new();
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    table.update(socket, batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.announce(150.into(), providers(&[250]));
    batch.announce(100.into(), providers(&[300]));
    let err = table.update(socket, batch).expect_err("duplicate");
    assert_eq!(err.error, AspaStoreError::DuplicateRecord);
    assert_eq!(err.failed_index, Some(1));

    assert_eq!(contents(&table, socket), vec![(100, vec![200])]);
    assert_eq!(table.num_records(), 1);

    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        table.check_hop(150.into(), 250.into(), guard),
        HopResult::NoAttestation
    );
}

#[test]
fn src_replace_transfers_a_session() {
    common::init();
    let (dst, dst_log) = observed_table(SwapInConfig::default());
    let (src, src_log) = observed_table(SwapInConfig::default());
    let socket = SocketId::from(7);

    let mut batch = UpdateBatch::new();
    batch.announce(10.into(), providers(&[20]));
    dst.update(socket, batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.announce(30.into(), providers(&[40]));
    src.update(socket, batch).expect("applies");
    dst_log.drain();
    src_log.drain();

    AspaTable::src_replace(&dst, &src, socket, true, true)
        .expect("transfers");

    assert_eq!(contents(&dst, socket), vec![(30, vec![40])]);
    assert_eq!(contents(&src, socket), vec![]);
    assert_eq!(dst.num_records(), 1);
    assert_eq!(src.num_records(), 0);

    assert_eq!(
        dst_log.drain(),
        vec![
            (10, vec![20], ChangeKind::Removed),
            (30, vec![40], ChangeKind::Added),
        ]
    );
    assert_eq!(
        src_log.drain(),
        vec![(30, vec![40], ChangeKind::Removed)]
    );

    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        dst.check_hop(30.into(), 40.into(), guard),
        HopResult::ProviderPlus
    );
    assert_eq!(
        dst.check_hop(10.into(), 20.into(), guard),
        HopResult::NoAttestation
    );
    assert_eq!(
        src.check_hop(30.into(), 40.into(), guard),
        HopResult::NoAttestation
    );
}

#[test]
fn removing_a_socket_only_drops_its_records() {
    common::init();
    let (table, log) = observed_table(SwapInConfig::default());
    let one = SocketId::from(1);
    let two = SocketId::from(2);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    table.update(one, batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.announce(300.into(), providers(&[400]));
    table.update(two, batch).expect("applies");
    log.drain();

    assert!(table.remove_socket(one, true).expect("unbinds"));
    assert!(!table.remove_socket(one, true).expect("already gone"));

    assert_eq!(
        log.drain(),
        vec![(100, vec![200], ChangeKind::Removed)]
    );
    assert_eq!(table.num_records(), 1);

    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        table.check_hop(100.into(), 200.into(), guard),
        HopResult::NoAttestation
    );
    assert_eq!(
        table.check_hop(300.into(), 400.into(), guard),
        HopResult::ProviderPlus
    );
}

#[test]
fn attestations_from_any_session_constrain_a_hop() {
    common::init();
    let table: AspaTable = AspaTable::new();

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[200]));
    table.update(SocketId::from(1), batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[300]));
    table.update(SocketId::from(2), batch).expect("applies");

    // Any session's provider set whitelists the hop.
    let guard = &aspa_store::epoch::pin();
    assert_eq!(
        table.check_hop(100.into(), 200.into(), guard),
        HopResult::ProviderPlus
    );
    assert_eq!(
        table.check_hop(100.into(), 300.into(), guard),
        HopResult::ProviderPlus
    );
    assert_eq!(
        table.check_hop(100.into(), 400.into(), guard),
        HopResult::NotProviderPlus
    );
}

#[test]
fn notifications_follow_normalized_order() {
    common::init();
    let (table, log) = observed_table(SwapInConfig::default());
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(300.into(), providers(&[3]));
    batch.announce(100.into(), providers(&[1]));
    batch.announce(200.into(), providers(&[2]));
    table.update(socket, batch).expect("applies");

    let customers: Vec<u32> =
        log.drain().iter().map(|(customer, _, _)| *customer).collect();
    assert_eq!(customers, vec![100, 200, 300]);
}

#[test]
fn records_round_trip_through_json(
) -> Result<(), Box<dyn std::error::Error>> {
    common::init();
    let record = AspaRecord::new(100.into(), providers(&[200, 300]));
    let json = serde_json::to_string(&record)?;
    let back: AspaRecord = serde_json::from_str(&json)?;
    assert_eq!(record, back);
    Ok(())
}

#[test]
fn counters_track_batches_and_records() {
    common::init();
    let table: AspaTable = AspaTable::new();
    let socket = SocketId::from(1);

    let mut batch = UpdateBatch::new();
    batch.announce(100.into(), providers(&[1]));
    batch.announce(200.into(), providers(&[2]));
    table.update(socket, batch).expect("applies");

    let mut batch = UpdateBatch::new();
    batch.withdraw(100.into());
    table.update(socket, batch).expect("applies");

    assert_eq!(table.counters().get_batches_count(), 2);
    assert_eq!(table.counters().get_announcements_count(), 2);
    assert_eq!(table.counters().get_withdrawals_count(), 1);
    assert_eq!(table.counters().get_records_count(), 1);
}

//------------ Mode equivalence ----------------------------------------------

// An update op as plain data, so the same batch can be built twice and
// replayed against a model.
type PlainOp = (bool, u32, Vec<u32>);

fn random_ops<R: Rng>(
    rng: &mut R,
    model: &BTreeMap<u32, Vec<u32>>,
) -> Vec<PlainOp> {
    let mut ops: Vec<PlainOp> = Vec::new();
    for _ in 0..rng.random_range(1..8) {
        let customer = rng.random_range(1..30) * 10;
        if rng.random_bool(0.5) {
            let count = rng.random_range(1..4);
            let record_providers: Vec<u32> =
                (0..count).map(|_| rng.random_range(1..1000)).collect();
            ops.push((true, customer, record_providers));
        } else {
            ops.push((false, customer, Vec::new()));
        }
    }
    // Bias towards batches that apply: withdraw a known customer half of
    // the time.
    if let Some(known) = model.keys().next().copied() {
        if rng.random_bool(0.5) {
            ops.push((false, known, Vec::new()));
        }
    }
    ops
}

fn build_batch(ops: &[PlainOp]) -> UpdateBatch {
    let mut batch = UpdateBatch::new();
    for (announce, customer, record_providers) in ops {
        if *announce {
            batch.announce(
                (*customer).into(),
                providers(record_providers),
            );
        } else {
            batch.withdraw((*customer).into());
        }
    }
    batch
}

/// Replays a batch against the model map. Returns whether the batch is
/// acceptable; on acceptance the model has been updated, otherwise it is
/// unchanged.
fn replay(
    model: &mut BTreeMap<u32, Vec<u32>>,
    ops: &[PlainOp],
) -> bool {
    let mut next = model.clone();
    // Per customer, ops act in arrival order: an announcement directly
    // followed by a withdrawal cancels out, everything else must match
    // the store.
    let mut per_customer: BTreeMap<u32, Vec<&PlainOp>> = BTreeMap::new();
    for op in ops {
        per_customer.entry(op.1).or_default().push(op);
    }
    for (customer, ops) in per_customer {
        // First the store-independent annihilation of announce/withdraw
        // pairs, rejecting same-kind ops that meet.
        let mut survivors: Vec<&PlainOp> = Vec::new();
        for op in ops {
            match (survivors.last(), op.0) {
                (Some((true, _, _)), true)
                | (Some((false, _, _)), false) => return false,
                (Some((true, _, _)), false) => {
                    survivors.pop();
                }
                _ => survivors.push(op),
            }
        }
        // Then the survivors act on the store.
        for (announce, _, record_providers) in survivors {
            if *announce {
                if next
                    .insert(customer, record_providers.clone())
                    .is_some()
                {
                    return false;
                }
            } else if next.remove(&customer).is_none() {
                return false;
            }
        }
    }
    *model = next;
    true
}

#[test]
fn both_modes_agree_on_random_batches() {
    common::init();
    let swap: AspaTable<SwapInConfig> = AspaTable::new();
    let in_place: AspaTable<InPlaceConfig> = AspaTable::new();
    let socket = SocketId::from(1);
    let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut rng = rand::rng();

    for round in 0..200 {
        let ops = random_ops(&mut rng, &model);
        let accepted = replay(&mut model, &ops);

        let res_a = swap.update(socket, build_batch(&ops));
        let res_b = in_place.update(socket, build_batch(&ops));
        assert_eq!(
            res_a.is_ok(),
            res_b.is_ok(),
            "modes disagree in round {}: {:?}",
            round,
            ops
        );
        if let (Err(a), Err(b)) = (&res_a, &res_b) {
            assert_eq!(a.error, b.error);
            assert_eq!(a.failed_index, b.failed_index);
        }
        assert_eq!(
            res_a.is_ok(),
            accepted,
            "model disagrees in round {}: {:?}",
            round,
            ops
        );

        let state_a = contents(&swap, socket);
        let state_b = contents(&in_place, socket);
        assert_eq!(state_a, state_b, "modes diverged");

        let expected: Vec<(u32, Vec<u32>)> = model
            .iter()
            .map(|(customer, record_providers)| {
                (*customer, record_providers.clone())
            })
            .collect();
        assert_eq!(state_a, expected, "state diverged from the model");

        // Sorted-store invariant.
        assert!(state_a.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }
}
