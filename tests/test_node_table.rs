mod common;
use common::*;
use tigo_bridge::prelude::*;

use tempfile::TempDir;

#[test]
fn survives_a_restart() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;
    let path = dir.path().join("nodeTable.json");

    let table = NodeTable::empty(&path);
    table.upsert(1, Factory::address(1));
    table.upsert(2, Factory::address(2));
    table.persist()?;

    let reloaded = NodeTable::load(&path);
    assert_eq!(reloaded.snapshot(), table.snapshot());
    assert_eq!(reloaded.len(), 2);

    Ok(())
}

#[test]
fn stored_as_address_strings() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;
    let path = dir.path().join("nodeTable.json");

    let table = NodeTable::empty(&path);
    table.upsert(12, Factory::address(0xff));
    table.persist()?;

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(json["12"], "04:c0:5b:30:00:01:02:ff");

    Ok(())
}

#[test]
fn loads_byte_array_entries() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;
    let path = dir.path().join("nodeTable.json");
    std::fs::write(
        &path,
        r#"{"12": [4, 192, 91, 48, 0, 1, 2, 3], "13": "0011223344556677"}"#,
    )?;

    let table = NodeTable::load(&path);
    assert_eq!(table.lookup(12), Some(Factory::address(3)));
    assert_eq!(
        table.lookup(13),
        Some(LongAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]))
    );

    Ok(())
}

#[test]
fn unusable_store_gives_empty_table() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;

    let missing = NodeTable::load(dir.path().join("missing.json"));
    assert!(missing.is_empty());

    let empty = dir.path().join("empty.json");
    std::fs::write(&empty, "  \n")?;
    assert!(NodeTable::load(&empty).is_empty());

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{\"12\": ")?;
    let table = NodeTable::load(&corrupt);
    assert!(table.is_empty());

    // the next save replaces the corrupt file
    table.upsert(1, Factory::address(1));
    table.flush()?;
    assert_eq!(NodeTable::load(&corrupt).lookup(1), Some(Factory::address(1)));

    Ok(())
}
