//! Lookups racing snapshot swaps see one whole snapshot, never a mix

mod common;

use common::{eventually, ScriptedTransport};
use ipatlas::{DataValue, Error, LoaderOptions, MmdbBuilder, Registry};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NETWORKS: u8 = 64;

/// Networks 10.n.0.0/16, each tagged with the generation that built it
fn generation_db(generation: &str) -> Vec<u8> {
    let mut builder = MmdbBuilder::new();
    for n in 0..NETWORKS {
        builder
            .add_entry(
                &format!("10.{}.0.0/16", n),
                DataValue::map([
                    ("generation", DataValue::string(generation)),
                    ("tag", DataValue::string(format!("{}-net-{}", generation, n))),
                ]),
            )
            .unwrap();
    }
    builder.build().unwrap()
}

fn check_entry(data: &DataValue, net: u8) -> String {
    let generation = data.get("generation").unwrap().as_str().unwrap().to_string();
    let tag = data.get("tag").unwrap().as_str().unwrap();
    assert_eq!(tag, format!("{}-net-{}", generation, net), "mixed snapshot");
    generation
}

#[test]
fn test_lookups_during_refresh_are_consistent() {
    let transport = ScriptedTransport::new();
    transport.push_body(generation_db("gen0"), "\"0\"");

    let registry = Arc::new(Registry::new());
    registry
        .start(
            "geo",
            "https://geo.example.com/gen.mmdb",
            LoaderOptions::new()
                .without_cache()
                .with_transport(Arc::clone(&transport) as Arc<dyn ipatlas::Transport>),
        )
        .unwrap();
    registry
        .wait_for_loaders(["geo"], Duration::from_secs(10))
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            let lookups = Arc::clone(&lookups);
            thread::spawn(move || {
                let mut rng = rand::rng();
                while !done.load(Ordering::Relaxed) {
                    // Two lookups against one captured snapshot agree on generation
                    let db = registry.database("geo").unwrap();
                    let a: u8 = rng.random_range(0..NETWORKS);
                    let b: u8 = rng.random_range(0..NETWORKS);
                    let mut ip = |net: u8| {
                        IpAddr::V4(Ipv4Addr::new(10, net, rng.random(), rng.random()))
                    };
                    let (ip_a, ip_b) = (ip(a), ip(b));
                    let first = db.lookup(ip_a).unwrap().unwrap();
                    let second = db.lookup(ip_b).unwrap().unwrap();
                    assert_eq!(check_entry(&first.data, a), check_entry(&second.data, b));

                    // Lookups through the registry are internally consistent too
                    let entry = registry.lookup("geo", ip_a).unwrap();
                    check_entry(&entry.data, a);
                    lookups.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for round in 1..=20 {
        let generation = format!("gen{}", round);
        transport.push_body(generation_db(&generation), &format!("\"{}\"", round));
        registry.refresh("geo").unwrap();
        eventually("swap", || {
            registry
                .lookup("geo", "10.0.0.1")
                .map(|entry| entry.data.get("generation").unwrap().as_str() == Some(generation.as_str()))
                .unwrap_or(false)
        });
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(lookups.load(Ordering::Relaxed) > 0);

    // Outside every network
    assert!(matches!(
        registry.lookup("geo", "10.200.0.1"),
        Err(Error::NotFound)
    ));
}
