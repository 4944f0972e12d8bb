//! 코덱/프래그먼트 벤치마크
//!
//! 실행: `cargo bench --bench codec`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dftp::fragment::Reassembly;
use dftp::{checksum, decode, fragment, reassemble, Packet, PacketType, DATA_SIZE};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet");
    let packet = Packet::with_checksum(42, PacketType::PutData, sample(DATA_SIZE));
    let bytes = packet.to_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(&packet).to_bytes()));
    group.bench_function("decode", |b| b.iter(|| decode(black_box(&bytes))));
    group.bench_function("checksum", |b| b.iter(|| checksum(black_box(&packet.payload))));
    group.finish();
}

fn bench_fragment(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment");
    let data = sample(1024 * 1024);
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("split_1mb", |b| {
        b.iter(|| fragment(black_box(&data), PacketType::GetData, 1))
    });

    let fragments = fragment(&data, PacketType::GetData, 1);
    group.bench_function("reassemble_1mb", |b| b.iter(|| reassemble(black_box(&fragments))));
    group.bench_function("reassembly_1mb", |b| {
        b.iter(|| {
            let mut reassembly = Reassembly::new(1, fragments.len() as u32);
            for f in fragments.iter().rev() {
                let _ = reassembly.insert(f);
            }
            reassembly.finish()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_packet, bench_fragment);
criterion_main!(benches);
