use super::helpers::{small_device, small_store};
use crate::{CreateFlags, KvStore, StoreError, RESERVED_DATA_SIZE};
use anyhow::Result;

#[test]
fn reserved_payload_round_trips() -> Result<()> {
    let mut store = small_store();
    store.reserved_data_set(b"root-key-material")?;
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    let n = store.reserved_data_get(&mut buf)?;
    assert_eq!(&buf[..n], b"root-key-material");
    Ok(())
}

#[test]
fn reserved_payload_is_write_once() -> Result<()> {
    let mut store = small_store();
    store.reserved_data_set(b"first")?;
    assert_eq!(
        store.reserved_data_set(b"second"),
        Err(StoreError::WriteProtected)
    );
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    let n = store.reserved_data_get(&mut buf)?;
    assert_eq!(&buf[..n], b"first");
    Ok(())
}

#[test]
fn write_once_holds_across_restart() -> Result<()> {
    let mut dev = small_device();
    {
        let mut store = KvStore::new(&mut dev)?;
        store.reserved_data_set(b"persistent")?;
        store.deinit()?;
    }
    let mut store = KvStore::new(&mut dev)?;
    assert_eq!(
        store.reserved_data_set(b"again"),
        Err(StoreError::WriteProtected)
    );
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    let n = store.reserved_data_get(&mut buf)?;
    assert_eq!(&buf[..n], b"persistent");
    Ok(())
}

#[test]
fn get_before_set_is_not_found() {
    let mut store = small_store();
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    assert_eq!(
        store.reserved_data_get(&mut buf),
        Err(StoreError::NotFound)
    );
}

#[test]
fn size_limits_are_enforced() {
    let mut store = small_store();
    assert_eq!(store.reserved_data_set(b""), Err(StoreError::InvalidSize));
    assert_eq!(
        store.reserved_data_set(&vec![0u8; RESERVED_DATA_SIZE + 1]),
        Err(StoreError::InvalidSize)
    );
}

#[test]
fn payload_survives_garbage_collection() -> Result<()> {
    let mut store = small_store();
    store.reserved_data_set(b"durable")?;
    // churn enough appends to force at least one area swap
    for round in 0..30 {
        for k in 0..10 {
            store.set(&format!("key{k}"), &vec![round as u8; 200], CreateFlags::empty())?;
        }
    }
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    let n = store.reserved_data_get(&mut buf)?;
    assert_eq!(&buf[..n], b"durable");
    Ok(())
}

#[test]
fn corrupt_copy_is_served_from_the_other_area() -> Result<()> {
    let mut dev = small_device();
    {
        let mut store = KvStore::new(&mut dev)?;
        store.reserved_data_set(b"redundant")?;
        store.deinit()?;
    }
    // area 0 is active; wreck its payload slot
    dev.write_raw(0, &[0x00; 16]);

    let mut store = KvStore::new(&mut dev)?;
    let mut buf = [0u8; RESERVED_DATA_SIZE];
    let n = store.reserved_data_get(&mut buf)?;
    assert_eq!(&buf[..n], b"redundant");
    Ok(())
}

#[test]
fn short_buffer_gets_a_truncated_copy() -> Result<()> {
    let mut store = small_store();
    store.reserved_data_set(b"0123456789")?;
    let mut buf = [0u8; 4];
    assert_eq!(store.reserved_data_get(&mut buf)?, 4);
    assert_eq!(&buf, b"0123");
    Ok(())
}
