use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use smfg_inventory::{Product, Reservation, ReservationRequest};

fn backlog(n: usize) -> Vec<Reservation> {
    let start = Utc::now();
    (0..n)
        .map(|i| {
            let req = ReservationRequest::new(format!("r{i}"), "bench", (i % 7 + 1) as i64);
            Reservation::open("BENCH", &req, start + Duration::milliseconds(i as i64))
        })
        .collect()
}

/// One fulfillment pass over an open backlog with enough stock for roughly half of it.
fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_sweep");

    for size in [10usize, 100, 1_000, 10_000] {
        let reservations = backlog(size);
        let demand: i64 = reservations.iter().map(|r| r.requested_quantity).sum();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut product = Product::new("BENCH", "000000000000", "bench");
                product.available = demand / 2;
                let mut reservations = reservations.clone();

                for r in reservations.iter_mut() {
                    if product.available == 0 {
                        break;
                    }
                    black_box(product.allocate(r).unwrap());
                }
                black_box(product)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sweep);
criterion_main!(benches);
