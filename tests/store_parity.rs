//! Every store backend must make the same change decisions
//!
//! The memcached backend talks to a small in-test server that implements the
//! text protocol subset the client uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use surok::config::{AgentSettings, StoreKind};
use surok::store::files::FilesStore;
use surok::store::memcached::{MemcachedStore, INDEX_KEY};
use surok::store::memory::MemoryStore;
use surok::store::{Artifact, ContentStore, Store};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Cache = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn serve_connection(stream: TcpStream, cache: Cache) {
    let mut conn = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match conn.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let reply = match parts.first().map(String::as_str) {
            Some("version") => b"VERSION 1.6.21\r\n".to_vec(),
            Some("get") => {
                let value = cache.lock().unwrap().get(&parts[1]).cloned();
                match value {
                    Some(data) => {
                        let mut reply = format!("VALUE {} 0 {}\r\n", parts[1], data.len()).into_bytes();
                        reply.extend_from_slice(&data);
                        reply.extend_from_slice(b"\r\nEND\r\n");
                        reply
                    }
                    None => b"END\r\n".to_vec(),
                }
            }
            Some("set") => {
                let len: usize = parts[4].parse().unwrap();
                let mut data = vec![0u8; len + 2];
                conn.read_exact(&mut data).await.unwrap();
                data.truncate(len);
                cache.lock().unwrap().insert(parts[1].clone(), data);
                b"STORED\r\n".to_vec()
            }
            Some("delete") => {
                let removed = cache.lock().unwrap().remove(&parts[1]);
                match removed {
                    Some(_) => b"DELETED\r\n".to_vec(),
                    None => b"NOT_FOUND\r\n".to_vec(),
                }
            }
            _ => b"ERROR\r\n".to_vec(),
        };
        if conn.get_mut().write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn spawn_memcached() -> (String, Cache) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cache: Cache = Arc::default();
    let shared = cache.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, shared.clone()));
        }
    });
    (addr, cache)
}

fn file(dest: &str, value: &str) -> Artifact {
    Artifact::File {
        dest: dest.to_string(),
        value: value.to_string(),
    }
}

fn env(name: &str, value: &str) -> Artifact {
    Artifact::Env {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Drive the same three cycles through a store and record every decision
async fn decisions(mut store: Store, kind: StoreKind, settings: &AgentSettings) -> Vec<String> {
    let mut log = Vec::new();

    store.check(settings, &[]).await;
    for artifact in [file("/tmp/a", "1"), file("/tmp/b", "1"), env("E", "1")] {
        log.push(format!("c1 {}", store.check_update(kind, &artifact).await));
    }
    log.push(format!("c1 swept {}", store.clear().await.len()));

    store.check(settings, &[]).await;
    for artifact in [file("/tmp/a", "1"), file("/tmp/b", "2")] {
        log.push(format!("c2 {}", store.check_update(kind, &artifact).await));
    }
    let swept = store.clear().await;
    log.push(format!("c2 swept {:?}", swept.iter().map(|r| r.env.clone()).collect::<Vec<_>>()));

    store.check(settings, &[]).await;
    log.push(format!("c3 {}", store.check_update(kind, &file("/tmp/a", "1")).await));
    let mut swept: Vec<_> = store
        .clear()
        .await
        .into_iter()
        .filter_map(|r| r.dest)
        .collect();
    swept.sort();
    log.push(format!("c3 swept {:?}", swept));

    for record in [file("/tmp/a", ""), file("/tmp/b", "")] {
        let kept = store.get(kind, &record.identity()).await.is_some();
        log.push(format!("kept {}", kept));
    }
    log
}

#[tokio::test]
async fn test_backends_make_identical_decisions() {
    let expected = decisions(
        Store::with_backends(vec![Box::new(MemoryStore::new())]),
        StoreKind::Memory,
        &AgentSettings::default(),
    )
    .await;
    assert_eq!(
        expected,
        vec![
            "c1 true",
            "c1 true",
            "c1 true",
            "c1 swept 0",
            "c2 false",
            "c2 true",
            "c2 swept [Some(\"E\")]",
            "c3 false",
            "c3 swept [\"/tmp/b\"]",
            "kept true",
            "kept false",
        ]
    );

    let dir = TempDir::new().unwrap();
    let mut settings = AgentSettings::default();
    settings.files.enabled = true;
    settings.files.path = dir.path().to_path_buf();
    let files = decisions(
        Store::with_backends(vec![Box::new(FilesStore::new())]),
        StoreKind::Files,
        &settings,
    )
    .await;
    assert_eq!(files, expected);

    let (addr, _cache) = spawn_memcached().await;
    let mut settings = AgentSettings::default();
    settings.memcached.enabled = true;
    settings.memcached.host = Some(addr);
    let memcached = decisions(
        Store::with_backends(vec![Box::new(MemcachedStore::new())]),
        StoreKind::Memcached,
        &settings,
    )
    .await;
    assert_eq!(memcached, expected);
}

#[tokio::test]
async fn test_memcached_keeps_key_index() {
    let (addr, cache) = spawn_memcached().await;
    let mut settings = AgentSettings::default();
    settings.memcached.enabled = true;
    settings.memcached.hosts = Some(vec!["127.0.0.1:1".to_string(), addr]);

    let mut store = MemcachedStore::new();
    assert!(store.check(&settings, &[]).await);

    let artifact = file("/tmp/indexed", "x");
    let mut facade = Store::with_backends(vec![Box::new(store)]);
    facade.check(&settings, &[]).await;
    assert!(facade.check_update(StoreKind::Memcached, &artifact).await);

    let index: Vec<String> =
        serde_json::from_slice(&cache.lock().unwrap()[INDEX_KEY]).unwrap();
    assert_eq!(index, vec![artifact.identity()]);

    facade.check(&settings, &[]).await;
    assert_eq!(facade.clear().await.len(), 1);
    let index: Vec<String> =
        serde_json::from_slice(&cache.lock().unwrap()[INDEX_KEY]).unwrap();
    assert!(index.is_empty());
    assert!(!cache.lock().unwrap().contains_key(&artifact.identity()));
}

#[tokio::test]
async fn test_discovered_cache_hosts_enable_memcached() {
    let (addr, _cache) = spawn_memcached().await;
    let mut settings = AgentSettings::default();
    settings.memcached.enabled = true;

    let mut store = MemcachedStore::new();
    assert!(!store.check(&settings, &[]).await);
    assert!(store.check(&settings, &[addr]).await);
    assert_eq!(store.kind(), StoreKind::Memcached);
}

#[tokio::test]
async fn test_agents_sharing_memcached_settle() {
    let (addr, cache) = spawn_memcached().await;
    let mut settings = AgentSettings::default();
    settings.memcached.enabled = true;
    settings.memcached.host = Some(addr);

    let mut a = Store::with_backends(vec![Box::new(MemcachedStore::new())]);
    let mut b = Store::with_backends(vec![Box::new(MemcachedStore::new())]);
    let shared = file("/tmp/shared", "same");
    let only_b = env("ONLY_B", "b");

    let mut log = Vec::new();
    for cycle in 0..3 {
        a.check(&settings, &[]).await;
        b.check(&settings, &[]).await;
        let a_changed = a.check_update(StoreKind::Memcached, &shared).await;
        let b_changed = b.check_update(StoreKind::Memcached, &shared).await;
        b.check_update(StoreKind::Memcached, &only_b).await;
        let a_swept = a.clear().await.len();
        let b_swept = b.clear().await.len();
        log.push(format!("{} {} {} {} {}", cycle, a_changed, b_changed, a_swept, b_swept));
    }
    assert_eq!(
        log,
        vec!["0 true false 0 0", "1 false false 0 0", "2 false false 0 0"]
    );
    assert!(cache.lock().unwrap().contains_key(&shared.identity()));
    assert!(cache.lock().unwrap().contains_key(&only_b.identity()));

    // an identity is swept by the agent that stops producing it
    a.check(&settings, &[]).await;
    b.check(&settings, &[]).await;
    a.check_update(StoreKind::Memcached, &shared).await;
    b.check_update(StoreKind::Memcached, &shared).await;
    assert!(a.clear().await.is_empty());
    let swept = b.clear().await;
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].env.as_deref(), Some("ONLY_B"));
}
