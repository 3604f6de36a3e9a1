//! Concurrent access to one namespace from several threads.

use std::sync::Arc;
use std::thread;

use tangofs_db::{DeviceSpec, TangoDatabase};

use crate::harness::{device_path, TestTango, RUNNING};

#[test]
fn test_concurrent_lookups_share_nodes() {
    let tango = TestTango::new();
    let ns = Arc::new(tango.namespace());
    let path = format!("{}/properties/Host", device_path(RUNNING));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ns = ns.clone();
            let path = path.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| ns.resolve_str(&path).unwrap())
                    .last()
                    .unwrap()
            })
        })
        .collect();

    let nodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for node in &nodes[1..] {
        assert!(Arc::ptr_eq(&nodes[0], node));
    }
    assert_eq!(
        nodes[0].as_property().unwrap().text().unwrap(),
        "localhost\n"
    );
}

#[test]
fn test_concurrent_readers_and_writer() {
    let tango = TestTango::new();
    let fs = Arc::new(tango.tangofs());
    let family = "/devices/sys/tg_test";

    let writer = {
        let db = tango.db().clone();
        let fs = fs.clone();
        thread::spawn(move || {
            for i in 3..23 {
                let name = format!("sys/tg_test/{}", i);
                db.add_device(&DeviceSpec::new(&name, "TangoTest", "TangoTest/test"))
                    .unwrap();
                if let Ok(node) = fs.namespace().resolve_str("/devices/sys/tg_test") {
                    node.invalidate();
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let fs = fs.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let listing = fs.readdir(family).unwrap();
                    assert!(listing.len() >= 2);
                    let mut sorted = listing.clone();
                    sorted.sort_by_key(|e| e.name.to_lowercase());
                    assert_eq!(listing, sorted);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    fs.namespace().resolve_str(family).unwrap().invalidate();
    assert_eq!(fs.readdir(family).unwrap().len(), 22);
}

#[test]
fn test_concurrent_property_buffers_are_independent() {
    let tango = TestTango::new();
    let fs = Arc::new(tango.tangofs());
    let props = format!("{}/properties", device_path(RUNNING));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let fs = fs.clone();
            let path = format!("{}/Prop{}", props, i);
            thread::spawn(move || {
                fs.create(&path).unwrap();
                for chunk in 0..4 {
                    let line = format!("{}-{}\n", i, chunk);
                    let offset = fs.getattr(&path).unwrap().size as usize;
                    fs.write(&path, offset, line.as_bytes()).unwrap();
                }
                fs.release(&path).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..6 {
        let value = tango
            .db()
            .get_property(RUNNING, &format!("Prop{}", i))
            .unwrap();
        assert_eq!(value.len(), 4);
        assert_eq!(value[0], format!("{}-0", i));
    }
    assert!(fs.overlay().is_empty());
}
