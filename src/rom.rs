use anyhow::{ensure, Context, Result};
use std::path::Path;

// Byte index into the image file. All table addresses in this tool are file
// offsets, not SNES bus addresses; keeping a single address space avoids the
// classic PC-vs-SNES mixup.
pub type PcAddr = usize;

#[derive(Clone)]
pub struct Rom {
    pub data: Vec<u8>,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Self {
        Rom { data }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Unable to load image at path {}", path.display()))?;
        Ok(Rom::new(data))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.data)
            .with_context(|| format!("Unable to save image at path {}", path.display()))?;
        Ok(())
    }

    pub fn resize(&mut self, new_size: usize) {
        if self.data.len() < new_size {
            self.data.resize(new_size, 0x00);
        }
    }

    pub fn read_u8(&self, addr: PcAddr) -> Result<u8> {
        ensure!(addr < self.data.len(), "read_u8 address out of bounds");
        Ok(self.data[addr])
    }

    pub fn read_u16(&self, addr: PcAddr) -> Result<u16> {
        ensure!(addr + 2 <= self.data.len(), "read_u16 address out of bounds");
        let b0 = self.data[addr] as u16;
        let b1 = self.data[addr + 1] as u16;
        Ok(b0 | b1 << 8)
    }

    pub fn read_n(&self, addr: PcAddr, n: usize) -> Result<&[u8]> {
        ensure!(addr + n <= self.data.len(), "read_n address out of bounds");
        Ok(&self.data[addr..(addr + n)])
    }

    pub fn write_u8(&mut self, addr: PcAddr, x: u8) -> Result<()> {
        ensure!(addr < self.data.len(), "write_u8 address out of bounds");
        self.data[addr] = x;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: PcAddr, x: u16) -> Result<()> {
        ensure!(addr + 2 <= self.data.len(), "write_u16 address out of bounds");
        self.data[addr] = (x & 0xFF) as u8;
        self.data[addr + 1] = (x >> 8) as u8;
        Ok(())
    }

    pub fn write_n(&mut self, addr: PcAddr, data: &[u8]) -> Result<()> {
        ensure!(
            addr + data.len() <= self.data.len(),
            "write_n address out of bounds"
        );
        self.data[addr..(addr + data.len())].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, addr: PcAddr, n: usize, value: u8) -> Result<()> {
        ensure!(addr + n <= self.data.len(), "fill address out of bounds");
        self.data[addr..(addr + n)].fill(value);
        Ok(())
    }
}
