use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use surok::config::{
    AgentSettings, AppDeclaration, Config, ConfigSource, Environ, Normalizer, StoreKind,
};
use surok::logging;
use surok::store::memory::MemoryStore;
use surok::store::{Artifact, Store};

fn normalizer() -> Normalizer {
    Normalizer::new(
        Environ::from_pairs(Vec::<(String, String)>::new()),
        logging::side_effects(None),
    )
}

/// Benchmark normalization of the main configuration
fn bench_config_normalization(c: &mut Criterion) {
    let source = ConfigSource::Value(json!({
        "version": "0.7",
        "domain": "marathon.mesos",
        "marathon": {"enabled": true, "host": "marathon.mesos:8080"},
        "memcached": {"enabled": false, "hosts": ["localhost:11211"]},
        "defaults": {"group": "xxx.yyy"},
        "wait_time": 20,
        "loglevel": "info",
    }));

    c.bench_function("config_normalization", |b| {
        b.iter(|| {
            let config = Config::with_sources(normalizer(), std::slice::from_ref(&source));
            black_box(config.hash());
        });
    });
}

/// Benchmark normalization of an application declaration
fn bench_declaration_normalization(c: &mut Criterion) {
    let config = Config::new(normalizer());
    let declaration = json!({
        "conf_name": "bench",
        "services": [
            {"name": "zzz0", "tcp": ["tname_aa", "tname_bb"], "udp": ["uname"]},
            {"name": "zzz1", "ports": ["web"]},
            {"name": "zzy*", "group": "other", "tcp": ["tname_a*"]}
        ],
        "files": {"/tmp/bench.conf": "{{ my.conf_name }}"},
        "environments": {"BENCH": "{{ my.timestamp }}"},
        "reload_cmd": "true",
    });

    c.bench_function("declaration_normalization", |b| {
        b.iter(|| {
            let app = AppDeclaration::from_value(
                black_box(&declaration),
                None,
                config.normalizer(),
                config.settings(),
            );
            black_box(app.is_ok());
        });
    });
}

/// Benchmark the change-detection gate on an unchanged artifact
fn bench_change_gate(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut store = Store::with_backends(vec![Box::new(MemoryStore::new())]);
    let settings = AgentSettings::default();
    let artifact = Artifact::File {
        dest: "/tmp/bench.conf".to_string(),
        value: "upstream 10.0.0.1:31001;\n".repeat(64),
    };
    runtime.block_on(store.check(&settings, &[]));

    c.bench_function("check_update_unchanged", |b| {
        b.iter(|| {
            let changed = runtime.block_on(store.check_update(StoreKind::Memory, &artifact));
            black_box(changed);
        });
    });

    c.bench_function("artifact_hashing", |b| {
        b.iter(|| {
            black_box(artifact.identity());
            black_box(artifact.content_hash());
        });
    });
}

criterion_group!(
    benches,
    bench_config_normalization,
    bench_declaration_normalization,
    bench_change_gate
);
criterion_main!(benches);
