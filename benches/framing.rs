use agentlink::transport::framer::MessageDecoder;
use agentlink::transport::platform::LineEnding;
use agentlink::transport::protocol::{encode_line, Response, RequestId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

/// A realistic stdout stream: responses interleaved with log notifications
fn sample_stream(messages: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..messages {
        if i % 3 == 0 {
            stream.extend_from_slice(
                format!(
                    "{{\"jsonrpc\":\"2.0\",\"method\":\"log\",\"params\":{{\"level\":\"info\",\"message\":\"step {}\"}}}}\n",
                    i
                )
                .as_bytes(),
            );
        } else {
            let response = Response::success(
                RequestId::Number(i as i64),
                json!({"cells": [[1, 2, 3], [4, 5, 6]], "sheet": "Sheet1", "row": i}),
            );
            stream.extend(encode_line(&response, LineEnding::Lf).unwrap());
        }
    }
    stream
}

fn bench_decode_chunked(c: &mut Criterion) {
    let stream = sample_stream(1_000);
    let mut group = c.benchmark_group("decode_chunked");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [64usize, 1024, 8192] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut decoder = MessageDecoder::new();
                    let mut decoded = 0;
                    for chunk in stream.chunks(chunk_size) {
                        decoded += decoder.feed(black_box(chunk)).len();
                    }
                    assert_eq!(decoded, 1_000);
                })
            },
        );
    }
    group.finish();
}

fn bench_encode_request(c: &mut Criterion) {
    use agentlink::transport::protocol::Request;

    c.bench_function("encode_request", |b| {
        b.iter(|| {
            let request = Request::new(
                RequestId::Number(42),
                "excel.write_range",
                Some(json!({"range": "A1:C3", "values": [[1, 2, 3], [4, 5, 6], [7, 8, 9]]})),
            );
            encode_line(black_box(&request), LineEnding::CrLf).unwrap()
        })
    });
}

criterion_group!(benches, bench_decode_chunked, bench_encode_request);
criterion_main!(benches);
