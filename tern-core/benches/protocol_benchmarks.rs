use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tern_core::protocol::{finish_message, read_header, start_request, REQUEST_ID_OFFSET};
use tern_core::version::ENCODING_1_1;
use tern_core::{
    Context, Endpoint, Identity, InputStream, OperationMode, OutputStream, ProxyData,
    RequestHeader,
};

fn request_header(context_entries: usize) -> RequestHeader {
    let mut context = Context::new();
    for i in 0..context_entries {
        context.insert(format!("key{}", i), format!("value{}", i));
    }
    RequestHeader {
        identity: Identity::new("hello", "demo"),
        facet: String::new(),
        operation: "sayHello".to_string(),
        mode: OperationMode::Idempotent,
        context,
    }
}

fn bench_request_marshaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_marshaling");

    for size in [0usize, 64, 1024, 16 * 1024].iter() {
        let params = vec![7u8; *size];
        let header = request_header(2);
        group.bench_with_input(BenchmarkId::new("write", size), &params, |b, params| {
            b.iter(|| {
                let mut out = OutputStream::with_capacity(64 + params.len());
                start_request(&mut out);
                out.rewrite_int(REQUEST_ID_OFFSET, 1);
                header.write(&mut out);
                out.write_encapsulation_payload(ENCODING_1_1, params);
                finish_message(&mut out);
                black_box(out.freeze())
            })
        });
    }

    group.finish();
}

fn bench_request_unmarshaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_unmarshaling");

    for entries in [0usize, 4, 32].iter() {
        let mut out = OutputStream::new();
        start_request(&mut out);
        request_header(*entries).write(&mut out);
        out.write_encapsulation_payload(ENCODING_1_1, b"payload");
        finish_message(&mut out);
        let frame = out.freeze();

        group.bench_with_input(BenchmarkId::new("read", entries), &frame, |b, frame| {
            b.iter(|| {
                let mut input = InputStream::new(frame.clone());
                let header = read_header(&mut input).unwrap();
                let _request_id = input.read_int().unwrap();
                let request = RequestHeader::read(&mut input).unwrap();
                black_box((header, request))
            })
        });
    }

    group.finish();
}

fn bench_proxy_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("proxy_data");

    let proxy = ProxyData {
        identity: Identity::named("hello"),
        endpoints: vec![
            Endpoint::tcp("10.0.0.1", 10000),
            Endpoint::tcp("10.0.0.2", 10000),
            Endpoint::mem("local", 1),
        ],
        ..Default::default()
    };
    let mut out = OutputStream::new();
    ProxyData::write(&mut out, Some(&proxy));
    let encoded = out.freeze();

    group.bench_function("write", |b| {
        b.iter(|| {
            let mut out = OutputStream::new();
            ProxyData::write(&mut out, Some(black_box(&proxy)));
            black_box(out.freeze())
        })
    });
    group.bench_function("read", |b| {
        b.iter(|| {
            let data = ProxyData::read(&mut InputStream::new(encoded.clone())).unwrap();
            black_box(data)
        })
    });
    group.bench_function("parse_endpoint", |b| {
        b.iter(|| black_box(Endpoint::parse("tcp -h localhost -p 10000 -t 5000").unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_marshaling,
    bench_request_unmarshaling,
    bench_proxy_data
);
criterion_main!(benches);
