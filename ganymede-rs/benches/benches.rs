use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use ganymede::item::Item;
use ganymede::member::Member;
use ganymede::request::Request;
use ganymede::response::Response;
use ganymede::ring::{default_hash_fn, Ring};
use ganymede::storage;
use ganymede::storage::Storage;

fn request_benchmarks(c: &mut Criterion) {
    c.bench_function("parse get request", |b| {
        let wire = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$8\r\nsessions\r\n$5\r\nalice\r\n");
        b.iter(|| {
            let _ = Request::parse(black_box(&wire)).unwrap();
        })
    });

    c.bench_function("parse partial request", |b| {
        let wire = BytesMut::from("*3\r\n$9\r\nCACHE.G");
        b.iter(|| {
            let _ = Request::parse(black_box(&wire)).unwrap();
        })
    });
}

fn response_benchmarks(c: &mut Criterion) {
    let item = Item::new("alice", Bytes::from_static(b"some session payload"), Duration::ZERO);

    c.bench_function("write ok reply", |b| {
        b.iter(|| {
            let mut response = Response::new();
            response.ok().unwrap();
            black_box(response.complete().unwrap());
        })
    });

    c.bench_function("write item reply", |b| {
        b.iter(|| {
            let mut response = Response::new();
            response.item_with_hit(black_box(&item), true).unwrap();
            black_box(response.complete().unwrap());
        })
    });
}

fn ring_benchmarks(c: &mut Criterion) {
    let members: Vec<Member> = (0..10)
        .map(|n| Member::new(format!("node-{}", n), format!("127.0.0.1:{}", 2410 + n)))
        .collect();
    let ring = Ring::new(members, 64, default_hash_fn()).unwrap();

    c.bench_function("ring owner lookup", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = format!("key-{}", n % 10_000);
            black_box(ring.get_owner(&key).unwrap());
        })
    });
}

fn storage_benchmarks(c: &mut Criterion) {
    c.bench_function("lru put", |b| {
        let lru = storage::lru(10_000);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = format!("key-{}", n % 20_000);
            let _ = lru.put(
                &key,
                Item::new(&key, Bytes::from_static(b"value"), Duration::ZERO),
                false,
            );
        })
    });

    c.bench_function("lfu put", |b| {
        let lfu = storage::lfu(10_000);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = format!("key-{}", n % 20_000);
            let _ = lfu.put(
                &key,
                Item::new(&key, Bytes::from_static(b"value"), Duration::ZERO),
                false,
            );
        })
    });
}

criterion_group!(
    benches,
    request_benchmarks,
    response_benchmarks,
    ring_benchmarks,
    storage_benchmarks
);
criterion_main!(benches);
