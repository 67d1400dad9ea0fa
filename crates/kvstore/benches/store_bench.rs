use blockdev::RamBlockDevice;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use kvstore::{CreateFlags, KvStore};

const N_KEYS: usize = 500;
const VALUE_SIZE: usize = 256;

fn device() -> RamBlockDevice {
    RamBlockDevice::new(1024 * 1024, 16, 16, 4096)
}

fn populated() -> KvStore<RamBlockDevice> {
    let mut store = KvStore::new(device()).unwrap();
    let value = vec![b'x'; VALUE_SIZE];
    for i in 0..N_KEYS {
        store
            .set(&format!("key{i}"), &value, CreateFlags::empty())
            .unwrap();
    }
    store
}

fn set_benchmark(c: &mut Criterion) {
    c.bench_function("kvstore_set_500x256", |b| {
        b.iter_batched(
            || (KvStore::new(device()).unwrap(), vec![b'x'; VALUE_SIZE]),
            |(mut store, value)| {
                for i in 0..N_KEYS {
                    store
                        .set(&format!("key{i}"), &value, CreateFlags::empty())
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn get_hit_benchmark(c: &mut Criterion) {
    c.bench_function("kvstore_get_hit", |b| {
        b.iter_batched(
            populated,
            |mut store| store.get("key250").unwrap(),
            BatchSize::SmallInput,
        );
    });
}

fn reopen_benchmark(c: &mut Criterion) {
    c.bench_function("kvstore_reopen_500_keys", |b| {
        b.iter_batched(
            || {
                let mut dev = device();
                {
                    let mut store = KvStore::new(&mut dev).unwrap();
                    let value = vec![b'x'; VALUE_SIZE];
                    for i in 0..N_KEYS {
                        store
                            .set(&format!("key{i}"), &value, CreateFlags::empty())
                            .unwrap();
                    }
                    store.deinit().unwrap();
                }
                dev
            },
            |mut dev| {
                // measures master arbitration plus a full log replay
                KvStore::new(&mut dev).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, set_benchmark, get_hit_benchmark, reopen_benchmark);
criterion_main!(benches);
