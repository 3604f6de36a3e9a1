//! Property-based tests over generated namespaces.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tangofs_db::{DeviceSpec, MemoryDatabase};
use tangofs_fuse::{Namespace, TangoFs, TangoFsConfig};

fn arb_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Za-z][A-Za-z0-9_]{0,7}", 1..12)
}

fn populated(members: &[String], properties: &[String]) -> Arc<MemoryDatabase> {
    let db = Arc::new(MemoryDatabase::new());
    for member in members {
        db.insert_device(&DeviceSpec::new(
            format!("dom/fam/{}", member),
            "Cls",
            "Srv/inst",
        ));
    }
    if let Some(first) = members.first() {
        let dev = format!("dom/fam/{}", first);
        for prop in properties {
            db.insert_property(&dev, prop, &["v"]);
        }
    }
    db
}

proptest! {
    #[test]
    fn prop_listing_sorted_and_unique(members in arb_names(), properties in arb_names()) {
        let db = populated(&members, &properties);
        let ns = Namespace::with_options(db, None, Duration::ZERO, '%');
        let listing = ns.resolve_str("/devices/dom/fam").unwrap().list_children().unwrap();

        let mut expected = listing.clone();
        expected.sort_by_key(|n| n.to_lowercase());
        prop_assert_eq!(&listing, &expected);

        let unique: BTreeSet<&String> = listing.iter().collect();
        prop_assert_eq!(unique.len(), listing.len());

        let props = ns
            .resolve(&["devices", "dom", "fam", listing[0].as_str(), "properties"])
            .unwrap()
            .list_children()
            .unwrap();
        let mut sorted = props.clone();
        sorted.sort_by_key(|n| n.to_lowercase());
        prop_assert_eq!(props, sorted);
    }

    #[test]
    fn prop_every_listed_child_resolves(members in arb_names()) {
        let db = populated(&members, &[]);
        let ns = Namespace::with_options(db, None, Duration::ZERO, '%');
        let family = ns.resolve_str("/devices/dom/fam").unwrap();
        for name in family.list_children().unwrap() {
            let child = family.child(&name).unwrap();
            prop_assert_eq!(child.name(), name.as_str());
            // families match member names case-insensitively
            let upper = family.child(&name.to_uppercase()).unwrap();
            prop_assert!(Arc::ptr_eq(&child, &upper));
        }
    }

    #[test]
    fn prop_buffered_writes_match_model(
        chunks in prop::collection::vec((0usize..64, "[a-z]{1,8}"), 1..10)
    ) {
        let db = populated(&["m".to_string()], &["P".to_string()]);
        let fs = TangoFs::new(db, TangoFsConfig::default()).unwrap();
        let path = "/devices/dom/fam/m/properties/New";
        fs.create(path).unwrap();

        let mut model: Vec<u8> = Vec::new();
        for (offset, text) in &chunks {
            fs.write(path, *offset, text.as_bytes()).unwrap();
            let end = offset + text.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[*offset..end].copy_from_slice(text.as_bytes());
        }
        prop_assert_eq!(fs.read(path, 0, 4096).unwrap(), model.clone());
        prop_assert_eq!(fs.getattr(path).unwrap().size as usize, model.len());
        fs.unlink(path).unwrap();
        prop_assert!(fs.overlay().is_empty());
    }
}
