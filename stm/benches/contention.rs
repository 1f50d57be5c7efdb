// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use std::convert::Infallible;
use stm_engine::Stm;
use threadpool::ThreadPool;
use tokio::runtime::Runtime;

/// Single threaded increment, no contention
fn bnc_increment(c: &mut Criterion) {
    c.bench_function("bench_increment", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);

        b.iter(|| {
            stm.atomically(|tx| {
                let value = tx.load(&var)?;
                tx.store(&var, value + 1)
            })
        })
    });
}

/// Eight threads incrementing the same variable
fn bnc_contended_increment(c: &mut Criterion) {
    c.bench_function("bench_contended_increment", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);
        let pool = ThreadPool::new(8);

        b.iter(|| {
            for _ in 0..8 {
                let (stm, var) = (stm.clone(), var.clone());
                pool.execute(move || {
                    for _ in 0..100 {
                        let _ = stm.atomically(|tx| {
                            let value = tx.load(&var)?;
                            tx.store(&var, value + 1)
                        });
                    }
                });
            }
            pool.join();
        })
    });
}

fn bnc_async_increment(c: &mut Criterion) {
    c.bench_function("bench_async_increment", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);

        b.to_async(Runtime::new().expect("Failed to create runtime")).iter(|| {
            stm.atomically_async::<_, Infallible, _>(|tx| {
                let value = tx.load(&var)?;
                tx.store(&var, value + 1)?;
                Ok(())
            })
        })
    });
}

criterion_group!(benches, bnc_increment, bnc_contended_increment, bnc_async_increment);
criterion_main!(benches);
