#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_memmap::testing::{FakePageTable, FakePhys, PTE_RW};
#[cfg(not(target_arch = "wasm32"))]
use aero_memmap::{Access, AlignCtl, MemMapConfig, MemMapper, PAGE_SIZE};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
const VBASE: u64 = 0x1000_0000;
#[cfg(not(target_arch = "wasm32"))]
const PAGES: usize = 64;

#[cfg(not(target_arch = "wasm32"))]
fn new_mapper() -> MemMapper<FakePageTable, FakePhys> {
    let mut pt = FakePageTable::new();
    pt.map_range(VBASE, 0, PAGES, PTE_RW);
    MemMapper::with_config(pt, FakePhys::new(PAGES * PAGE_SIZE), MemMapConfig::default())
        .expect("default config is valid")
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_map_hit(c: &mut Criterion) {
    let mut mm = new_mapper();
    // Warm the TLB (and the dirty bits) for every page.
    for page in 0..PAGES as u64 {
        mm.store_u8(VBASE + page * PAGE_SIZE as u64, 0).unwrap();
    }

    let mut group = c.benchmark_group("memmap");
    group.throughput(Throughput::Elements(1));

    group.bench_function("map_read_u64_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let vaddr = VBASE + (i % PAGES as u64) * PAGE_SIZE as u64 + 0x40;
            i = i.wrapping_add(1);
            let token = mm
                .map(black_box(vaddr), 8, Access::DATA_R, AlignCtl::natural(8))
                .unwrap();
            black_box(mm.mapped(token).unwrap()[0]);
            mm.commit_and_unmap(token).unwrap();
        })
    });

    group.bench_function("store_u32_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let vaddr = VBASE + (i % PAGES as u64) * PAGE_SIZE as u64 + 0x80;
            i = i.wrapping_add(1);
            mm.store_u32(black_box(vaddr), i as u32).unwrap();
        })
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_bounce(c: &mut Criterion) {
    let mut mm = new_mapper();
    for page in 0..PAGES as u64 {
        mm.store_u8(VBASE + page * PAGE_SIZE as u64, 0).unwrap();
    }

    let mut group = c.benchmark_group("memmap");
    group.throughput(Throughput::Elements(1));

    group.bench_function("map_write_u64_cross_page", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let page = i % (PAGES as u64 - 1);
            i = i.wrapping_add(1);
            let vaddr = VBASE + (page + 1) * PAGE_SIZE as u64 - 4;
            let token = mm
                .map(black_box(vaddr), 8, Access::DATA_W, AlignCtl::NONE)
                .unwrap();
            mm.mapped_mut(token).unwrap().fill(i as u8);
            mm.commit_and_unmap(token).unwrap();
            if i % 1024 == 0 {
                // The fake logs every handler write.
                mm.phys_mut().clear_logs();
            }
        })
    });

    group.bench_function("invalidate_all", |b| {
        b.iter(|| mm.invalidate_all());
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_map_hit, bench_bounce
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
