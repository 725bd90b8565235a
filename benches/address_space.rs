//! Benchmarks for data pool access and request dispatch
//!
//! Run with: cargo bench --bench address_space

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_datapool::rtu::process_rtu_frame;
use voltage_datapool::{DataPool, ProtocolDispatcher, Region, SubscriptionRegistry};

fn dispatcher() -> ProtocolDispatcher {
    ProtocolDispatcher::new(Arc::new(DataPool::default()), Arc::new(SubscriptionRegistry::new()))
}

/// Raw byte copies of increasing size
fn bench_bytes(c: &mut Criterion) {
    let pool = DataPool::default();
    let space = pool.region(Region::HoldingRegister);
    let mut group = c.benchmark_group("address_space_bytes");

    for size in [2usize, 64, 254].iter() {
        let data = vec![0x5Au8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("set_get", size), size, |b, &size| {
            b.iter(|| {
                space.set_bytes(black_box(&data), 1024).unwrap();
                space.get_bytes(1024, size).unwrap()
            });
        });
    }

    group.finish();
}

/// Single bit updates within packed memory
fn bench_bits(c: &mut Criterion) {
    let pool = DataPool::default();
    let space = pool.region(Region::HoldingRegister);

    c.bench_function("address_space_set_bit", |b| {
        let mut index = 0usize;
        b.iter(|| {
            index = (index + 7) % space.bit_capacity();
            space.set_bit(black_box(index), index % 3 == 0).unwrap();
        });
    });
}

/// Full request handling for read and write cores
fn bench_dispatch(c: &mut Criterion) {
    let d = dispatcher();
    d.subscriptions().subscribe(5, |_change| {}).unwrap();
    let mut group = c.benchmark_group("dispatch");

    let cases: [(&str, Vec<u8>); 4] = [
        ("read_coils_2040", vec![0x01, 0x01, 0x00, 0x00, 0x07, 0xF8]),
        ("read_registers_127", vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x7F]),
        ("write_register", vec![0x01, 0x06, 0x00, 0x05, 0x12, 0x34]),
        ("illegal_function", vec![0x01, 0x2B, 0x0E, 0x01]),
    ];
    for (name, core) in cases.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), core, |b, core| {
            b.iter(|| d.dispatch(black_box(core)).unwrap());
        });
    }

    let frame = voltage_datapool::rtu::pack_rtu(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
    group.bench_function("rtu_read_registers_10", |b| {
        b.iter(|| process_rtu_frame(black_box(&frame), &d, Some(1)))
    });

    group.finish();
}

criterion_group!(benches, bench_bytes, bench_bits, bench_dispatch);
criterion_main!(benches);
