use std::sync::Arc;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use network_engine::protocol::websocket::{encode_message as encode_ws, WebSocketCodec};
use network_engine::protocol::wire::{encode_message, FrameCodec};
use network_engine::protocol::{MessageParsingOutput, WireProtocol};
use network_engine::{MessageReader, MessageWriter, NetworkMessage, Registry, Result, Serializable};

struct Blob(Vec<u8>);

impl Serializable for Blob {
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_bytes(&self.0)
    }

    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Blob(reader.read_bytes()?))
    }
}

impl NetworkMessage for Blob {
    const MESSAGE_ID: u16 = 1;
}

#[allow(clippy::unwrap_used)]
fn bench_length_prefixed(c: &mut Criterion) {
    let registry = Registry::builder().message::<Blob>().build().unwrap();
    let mut group = c.benchmark_group("length_prefixed");

    for size in [64usize, 512, 4096, 65536, 1024 * 1024] {
        let blob = Blob(vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(size + 16);
                encode_message(&blob, &mut buf).unwrap();
                buf
            })
        });

        let mut encoded = BytesMut::new();
        encode_message(&blob, &mut encoded).unwrap();
        let encoded = encoded.freeze();
        group.bench_function(format!("parse_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::from(&encoded[..]),
                |mut src| {
                    let mut codec = FrameCodec::new(Arc::clone(&registry), 2 * 1024 * 1024);
                    let mut output = MessageParsingOutput::default();
                    codec.try_parse(&mut src, &mut output).unwrap();
                    output
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_websocket(c: &mut Criterion) {
    let registry = Registry::builder().message::<Blob>().build().unwrap();
    let mut group = c.benchmark_group("websocket");

    for size in [64usize, 4096, 65536] {
        let blob = Blob(vec![0u8; size]);
        let mut encoded = BytesMut::new();
        encode_ws(&blob, Some([0x12, 0x34, 0x56, 0x78]), &mut encoded).unwrap();
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("parse_masked_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::from(&encoded[..]),
                |mut src| {
                    let mut codec = WebSocketCodec::server(Arc::clone(&registry), 2 * 1024 * 1024);
                    let mut output = MessageParsingOutput::default();
                    codec.try_parse(&mut src, &mut output).unwrap();
                    output
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_length_prefixed, bench_websocket);
criterion_main!(benches);
