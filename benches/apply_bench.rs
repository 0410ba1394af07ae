//! Patch-application throughput. The applier runs on every mutation inside
//! the session hub's single-consumer loop, so its cost bounds per-session
//! edit throughput.

use collabd::diagram::{apply_patch, snapshot, Cell, CellMap};
use collabd::protocol::{CellOpKind, CellOperation, Patch};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn populated_map(cells: usize) -> CellMap {
    let mut map = CellMap::new();
    for i in 0..cells {
        let id = format!("cell-{i}");
        let cell = Cell::from_op_data(&id, &json!({ "x": i, "y": i * 2, "label": "node" })).unwrap();
        map.insert(id, cell);
    }
    map
}

fn update_patch(cells: usize, offset: usize) -> Patch {
    Patch::new(
        (0..cells)
            .map(|i| CellOperation {
                id: format!("cell-{i}"),
                operation: CellOpKind::Update,
                data: Some(json!({ "x": i + offset, "y": i, "label": "node" })),
            })
            .collect(),
    )
}

fn bench_apply(c: &mut Criterion) {
    c.bench_function("apply_100_adds_to_empty", |b| {
        let patch = Patch::new(
            (0..100)
                .map(|i| CellOperation {
                    id: format!("cell-{i}"),
                    operation: CellOpKind::Add,
                    data: Some(json!({ "x": i, "y": i * 2, "label": "node" })),
                })
                .collect(),
        );
        b.iter(|| {
            let mut map = CellMap::new();
            black_box(apply_patch(&mut map, black_box(&patch)).unwrap());
        });
    });

    c.bench_function("apply_10_updates_in_1000_cell_map", |b| {
        let map = populated_map(1000);
        let patch = update_patch(10, 7);
        b.iter(|| {
            let mut map = map.clone();
            black_box(apply_patch(&mut map, black_box(&patch)).unwrap());
        });
    });

    c.bench_function("noop_replay_in_1000_cell_map", |b| {
        let mut map = populated_map(1000);
        let patch = update_patch(10, 7);
        apply_patch(&mut map, &patch).unwrap();
        b.iter(|| {
            let mut map = map.clone();
            black_box(apply_patch(&mut map, black_box(&patch)).unwrap());
        });
    });

    c.bench_function("snapshot_1000_cells_to_json", |b| {
        let map = populated_map(1000);
        b.iter(|| black_box(serde_json::to_string(&snapshot(black_box(&map))).unwrap()));
    });
}

criterion_group!(benches, bench_apply);
criterion_main!(benches);
