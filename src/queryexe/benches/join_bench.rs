use common::ids::TransactionId;
use common::query::{CursorType, RelOp};
use common::testutil::{gen_random_records, get_int_table_schema};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memstore::{MemDriver, StorageManager};
use queryexe::{Action, EngineConfig, Executor, QueryDefinition, QuerySource};
use txn_manager::TransactionRegistry;

fn setup(rows: usize) -> (Executor, TransactionId) {
    let sm = StorageManager::new_test_sm();
    sm.create_table("testA").unwrap();
    for r in gen_random_records(rows, 2, 100) {
        sm.insert("testA", r).unwrap();
    }
    let registry = TransactionRegistry::new_shared();
    let tid = registry
        .register(Box::new(MemDriver::new(sm, MemDriver::full_description())))
        .unwrap();
    (Executor::new(registry, EngineConfig::default()), tid)
}

fn drain(exec: &mut Executor, def: QueryDefinition) -> usize {
    let h = exec.open_cursor2(def, CursorType::Select).unwrap();
    let mut n = 0;
    loop {
        match exec.get_action(h).unwrap() {
            Action::Fase1 => exec.report_where_result(h, true).unwrap(),
            Action::Fase2 => {
                black_box(exec.get_record(h, 0).unwrap());
                n += 1;
            }
            Action::Terminate => break,
        }
    }
    exec.close_query(h).unwrap();
    n
}

fn bench_scan(c: &mut Criterion) {
    let (mut exec, tid) = setup(10_000);
    c.bench_function("scan_10k", |b| {
        b.iter(|| {
            let mut def = QueryDefinition::new();
            def.add_source(QuerySource::transaction("testA", get_int_table_schema(2), tid));
            drain(&mut exec, def)
        })
    });
}

fn bench_join_two_partitions(c: &mut Criterion) {
    let (mut exec, tid) = setup(1_000);
    let right = gen_random_records(200, 2, 100);
    c.bench_function("join_driver_array", |b| {
        b.iter(|| {
            let mut def = QueryDefinition::new();
            def.add_source(QuerySource::transaction("testA", get_int_table_schema(2), tid));
            def.add_source(QuerySource::records("testB", get_int_table_schema(2), right.clone()));
            def.add_join(0, "c0", RelOp::Equal, 1, "c0").unwrap();
            drain(&mut exec, def)
        })
    });
}

criterion_group! {
    name = joinbench;
    config = Criterion::default().sample_size(10);
    targets =
    bench_scan,
    bench_join_two_partitions,
}
criterion_main!(joinbench);
