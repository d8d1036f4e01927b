//! Performance benchmarks for capability routing and discovery
//!
//! Run with: cargo bench
//! Or for specific benchmarks: cargo bench -- <filter>

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lcd_host::plugin::loader::StaticModuleLoader;
use lcd_host::plugin::manifest::PluginManifest;
use lcd_host::plugin::routing::{CapabilityKey, RoutingTable, RoutingTableBuilder};
use lcd_host::plugin::runtime::{Panel, PluginRuntime};
use lcd_host::plugin::search_paths::SearchPath;
use std::sync::Arc;
use std::time::Duration;

/// A table with `plugins` device and panel plugins, a few routes each.
fn build_table(plugins: usize) -> RoutingTable {
    let mut builder = RoutingTableBuilder::new();
    for i in 0..plugins {
        let id = format!("com.bench.plugin{i}");
        builder.register_hardware(0x0400 + i as u16, 0x5300, &id);
        builder.register_protocol(&format!("proto-{i}"), &id);
        builder.register_panel_type(&format!("type-{i}"), &format!("type-{i}"), &id);
        builder.register_panel_prefix(&format!("source{i}:"), &format!("source-{i}"), &id);
    }
    builder.build()
}

/// Benchmark routing lookups on tables of growing size
fn bench_route_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_lookup");
    group.measurement_time(Duration::from_secs(5));

    for plugins in [10usize, 100, 1000] {
        let table = build_table(plugins);
        let middle = plugins / 2;

        let hardware = CapabilityKey::hardware(0x0400 + middle as u16, 0x5300);
        group.bench_with_input(BenchmarkId::new("hardware", plugins), &hardware, |b, key| {
            b.iter(|| black_box(table.find(black_box(key))));
        });

        let protocol = CapabilityKey::protocol(format!("PROTO-{middle}"));
        group.bench_with_input(BenchmarkId::new("protocol", plugins), &protocol, |b, key| {
            b.iter(|| black_box(table.find(black_box(key))));
        });

        let exact = format!("type-{middle}");
        group.bench_with_input(BenchmarkId::new("panel_exact", plugins), &exact, |b, input| {
            b.iter(|| black_box(table.resolve_panel_input(black_box(input))));
        });

        let prefixed = format!("source{middle}:media/clip-{middle}.mp4");
        group.bench_with_input(BenchmarkId::new("panel_prefix", plugins), &prefixed, |b, input| {
            b.iter(|| black_box(table.resolve_panel_input(black_box(input))));
        });

        group.bench_with_input(BenchmarkId::new("panel_miss", plugins), &"unknown:thing", |b, input| {
            b.iter(|| black_box(table.resolve_panel_input(black_box(input))));
        });
    }

    group.finish();
}

/// Benchmark building a routing table
fn bench_table_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_build");

    for plugins in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(plugins as u64));
        group.bench_with_input(BenchmarkId::from_parameter(plugins), &plugins, |b, &n| {
            b.iter(|| black_box(build_table(n)));
        });
    }

    group.finish();
}

const DEVICE_MANIFEST: &str = r#"{
    "Id": "com.acme.displays",
    "Type": "device",
    "Name": "Acme Displays",
    "Version": "1.4.2",
    "Author": "Acme",
    "MinimumSdkVersion": "1.0.0",
    "AssemblyName": "libacme_displays.so",
    "Devices": [
        { "VendorId": "0x0416", "ProductId": "0x5302", "DisplayName": "Acme 3.5\"", "ProtocolId": "acme", "Width": 320, "Height": 480 },
        { "VendorId": "0x0416", "ProductId": "0x5303", "DisplayName": "Acme 5\"", "ProtocolId": "acme", "Width": 800, "Height": 480 },
        { "VendorId": "0x1a86", "ProductId": "0xfe0c", "DisplayName": "Acme Mini", "ProtocolId": "acme-mini", "Width": 160, "Height": 128 }
    ],
    "Protocols": [
        { "ProtocolId": "acme", "DisplayName": "Acme UDP", "DefaultPort": 5002, "Width": 320, "Height": 480, "SupportsBrightness": true }
    ]
}"#;

/// Benchmark manifest parsing
fn bench_manifest_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_parse");
    group.throughput(Throughput::Bytes(DEVICE_MANIFEST.len() as u64));
    group.bench_function("device", |b| {
        b.iter(|| black_box(PluginManifest::parse(black_box(DEVICE_MANIFEST.as_bytes()))));
    });
    group.finish();
}

/// Benchmark a full discovery pass over on-disk manifests
fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");
    group.sample_size(20);

    for plugins in [10usize, 100] {
        let root = tempfile::TempDir::new().unwrap();
        let loader = StaticModuleLoader::new();
        for i in 0..plugins {
            let dir = root.path().join(format!("panel{i}"));
            std::fs::create_dir_all(&dir).unwrap();
            let module = format!("libpanel{i}.so");
            let manifest = serde_json::json!({
                "id": format!("com.bench.panel{i}"),
                "type": "panel",
                "version": "1.0.0",
                "minimumSdkVersion": "1.0.0",
                "assemblyName": module,
                "panelTypes": [
                    { "typeId": format!("type-{i}"), "displayName": "Bench" },
                    { "typeId": format!("media-{i}"), "displayName": "Media", "prefixPattern": format!("media{i}:") }
                ]
            });
            std::fs::write(dir.join("plugin.json"), serde_json::to_vec(&manifest).unwrap()).unwrap();
            loader.register_library(&module);
        }

        let runtime: PluginRuntime<Panel> = PluginRuntime::<Panel>::builder()
            .search_paths(vec![SearchPath::builtin(root.path())])
            .loader(Arc::new(loader))
            .build();

        group.throughput(Throughput::Elements(plugins as u64));
        group.bench_with_input(BenchmarkId::from_parameter(plugins), &runtime, |b, runtime| {
            b.iter(|| black_box(runtime.discover()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_route_lookup,
    bench_table_build,
    bench_manifest_parse,
    bench_discovery,
);

criterion_main!(benches);
