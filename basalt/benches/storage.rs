use std::sync::Arc;

use basalt::buffer_pool::BufferPoolManager;
use basalt::disk::DiskManager;
use basalt::index::{ColType, IxIndex};
use basalt::record::RecordFile;
use basalt::Rid;
use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::tempdir;

fn heap_insert_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("heap");
    let bpm = Arc::new(BufferPoolManager::new(DiskManager::new()));
    RecordFile::create(&bpm, &path, 64).unwrap();
    let file = RecordFile::open(bpm, &path).unwrap();
    let row = [7u8; 64];

    c.bench_function("heap_insert", |b| {
        b.iter(|| file.insert(&row).unwrap());
    });

    let rid = file.insert(&row).unwrap();
    c.bench_function("heap_get", |b| {
        b.iter(|| file.get(rid).unwrap());
    });
}

fn index_insert_search(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ix");
    let bpm = Arc::new(BufferPoolManager::new(DiskManager::new()));
    IxIndex::create(&bpm, &path, &[(ColType::Int, 4)]).unwrap();
    let index = IxIndex::open(bpm, &path).unwrap();

    let mut next = 0i32;
    c.bench_function("index_insert", |b| {
        b.iter(|| {
            index
                .insert_entry(&next.to_le_bytes(), Rid::new(1, next))
                .unwrap();
            next += 1;
        });
    });

    c.bench_function("index_search", |b| {
        b.iter(|| index.get_value(&(next / 2).to_le_bytes()).unwrap());
    });
}

criterion_group!(benches, heap_insert_get, index_insert_search);
criterion_main!(benches);
