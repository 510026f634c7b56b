//! Benchmark for the hot parsing paths
//!
//! Both the export table and the lvs report are re-read before every
//! mutating operation, so parse throughput bounds reconciliation latency
//! on nodes with many volumes.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use node_disk_provisioner::backends::lvm::parse_lv_report;
use node_disk_provisioner::backends::nfs::parse_export_table;

fn bench_export_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let lines: Vec<String> = (0..500)
        .map(|i| format!("/srv/nfs/pvc-{i:04} 10.0.0.0/16"))
        .collect();

    group.bench_function("export_table_500", |b| {
        b.iter(|| {
            let entries = parse_export_table(black_box(&lines)).unwrap();
            black_box(entries.len())
        });
    });

    group.finish();
}

fn bench_lv_report(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let rows: Vec<String> = (0..500)
        .map(|i| format!(r#"{{"lv_name":"pvc-{i:04}","vg_name":"vg0","lv_size":"10.00g"}}"#))
        .collect();
    let report = format!(r#"{{"report":[{{"lv":[{}]}}]}}"#, rows.join(","));

    group.bench_function("lv_report_500", |b| {
        b.iter(|| {
            let records = parse_lv_report(black_box(&report)).unwrap();
            black_box(records.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_export_table, bench_lv_report);
criterion_main!(benches);
