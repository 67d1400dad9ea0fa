use std::cell::Cell;
use std::rc::Rc;

use blockdev::{BdError, BlockDevice, RamBlockDevice, Result as BdResult};

use crate::KvStore;

/// 64 KiB device with 16-byte program units and 4 KiB erase units: two
/// 32 KiB areas of eight erase units each. The append log starts at offset
/// 128 within each area (80 bytes of reserved region, 48 of master record).
pub fn small_device() -> RamBlockDevice {
    RamBlockDevice::new(64 * 1024, 16, 16, 4096)
}

pub fn small_store() -> KvStore<RamBlockDevice> {
    KvStore::new(small_device()).unwrap()
}

/// RAM device whose `program` calls start failing once a fuse burns down.
pub struct FlakyDevice {
    inner: RamBlockDevice,
    fuse: Rc<Cell<Option<u64>>>,
}

impl FlakyDevice {
    /// The fuse counts how many further `program` calls succeed; `None`
    /// disables failure injection.
    pub fn new(inner: RamBlockDevice) -> (Self, Rc<Cell<Option<u64>>>) {
        let fuse = Rc::new(Cell::new(None));
        (
            Self {
                inner,
                fuse: fuse.clone(),
            },
            fuse,
        )
    }
}

impl BlockDevice for FlakyDevice {
    fn init(&mut self) -> BdResult<()> {
        self.inner.init()
    }
    fn deinit(&mut self) -> BdResult<()> {
        self.inner.deinit()
    }
    fn read(&mut self, buf: &mut [u8], addr: u64) -> BdResult<()> {
        self.inner.read(buf, addr)
    }
    fn program(&mut self, buf: &[u8], addr: u64) -> BdResult<()> {
        if let Some(n) = self.fuse.get() {
            if n == 0 {
                return Err(BdError::DeviceError);
            }
            self.fuse.set(Some(n - 1));
        }
        self.inner.program(buf, addr)
    }
    fn erase(&mut self, addr: u64, len: u64) -> BdResult<()> {
        self.inner.erase(addr, len)
    }
    fn read_size(&self) -> u64 {
        self.inner.read_size()
    }
    fn program_size(&self) -> u64 {
        self.inner.program_size()
    }
    fn erase_size(&self, addr: u64) -> u64 {
        self.inner.erase_size(addr)
    }
    fn erase_value(&self) -> Option<u8> {
        self.inner.erase_value()
    }
    fn size(&self) -> u64 {
        self.inner.size()
    }
    fn device_type(&self) -> &'static str {
        "flaky"
    }
}

/// Device whose erase unit size grows partway through the address space,
/// making two equal areas impossible to tile.
pub struct LopsidedDevice {
    data: Vec<u8>,
}

impl LopsidedDevice {
    pub fn new() -> Self {
        Self {
            data: vec![0xff; 24576],
        }
    }
}

impl BlockDevice for LopsidedDevice {
    fn init(&mut self) -> BdResult<()> {
        Ok(())
    }
    fn deinit(&mut self) -> BdResult<()> {
        Ok(())
    }
    fn read(&mut self, buf: &mut [u8], addr: u64) -> BdResult<()> {
        let start = addr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
    fn program(&mut self, buf: &[u8], addr: u64) -> BdResult<()> {
        let start = addr as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
    fn erase(&mut self, addr: u64, len: u64) -> BdResult<()> {
        let start = addr as usize;
        self.data[start..start + len as usize].fill(0xff);
        Ok(())
    }
    fn read_size(&self) -> u64 {
        1
    }
    fn program_size(&self) -> u64 {
        16
    }
    fn erase_size(&self, addr: u64) -> u64 {
        if addr < 8192 {
            4096
        } else {
            16384
        }
    }
    fn erase_value(&self) -> Option<u8> {
        Some(0xff)
    }
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
    fn device_type(&self) -> &'static str {
        "lopsided"
    }
}
