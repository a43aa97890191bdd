use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use crossbeam_utils::Backoff;
use quadring::rings::mpmc::MpmcUnicast;
use quadring::rings::spsc;

/// The capacity of the benched rings
pub const SCALE_RING_SIZE: usize = 256;
/// The number of messages
pub const SCALE_MSG_COUNT: usize = 1_000_000;
/// The number of producers in the contended benchmark
pub const SCALE_PRODUCERS: usize = 2;
/// The number of consumers in the contended benchmark
pub const SCALE_CONSUMERS: usize = 2;

fn ring_spsc() {
    let (mut producer, mut consumer) = spsc::channel::<usize, SCALE_RING_SIZE>();

    let consumer = std::thread::spawn(move || {
        let mut next = 0;
        while next < SCALE_MSG_COUNT {
            match consumer.pop() {
                Some(value) => {
                    assert_eq!(value, next);
                    next += 1;
                }
                None => {
                    let backoff = Backoff::new();
                    backoff.snooze();
                }
            }
        }
    });

    for i in 0..SCALE_MSG_COUNT {
        while producer.push(i).is_err() {
            let backoff = Backoff::new();
            backoff.spin();
        }
    }

    consumer.join().unwrap();
}

fn ring_mpmc() {
    let ring = Arc::new(MpmcUnicast::<usize, SCALE_RING_SIZE>::new());
    let taken = Arc::new(AtomicUsize::new(0));

    let consumers = (0..SCALE_CONSUMERS)
        .map(|_| {
            let ring = ring.clone();
            let taken = taken.clone();
            std::thread::spawn(move || loop {
                match ring.pop() {
                    Some(_) => {
                        taken.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        if taken.load(Ordering::SeqCst) >= SCALE_MSG_COUNT {
                            break;
                        }
                        let backoff = Backoff::new();
                        backoff.snooze();
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    let producers = (0..SCALE_PRODUCERS)
        .map(|p| {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..(SCALE_MSG_COUNT / SCALE_PRODUCERS) {
                    while ring.push(p * (SCALE_MSG_COUNT / SCALE_PRODUCERS) + i).is_err() {
                        let backoff = Backoff::new();
                        backoff.spin();
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for producer in producers {
        producer.join().unwrap();
    }
    for consumer in consumers {
        consumer.join().unwrap();
    }
}

pub fn bench_rings(c: &mut Criterion) {
    let mut group = c.benchmark_group("rings");
    group.throughput(Throughput::Elements(SCALE_MSG_COUNT as u64));
    group.bench_function("ring_spsc", |b| b.iter(ring_spsc));
    group.bench_function("ring_mpmc", |b| b.iter(ring_mpmc));
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(10);
    targets = bench_rings
);
criterion_main!(benches);
