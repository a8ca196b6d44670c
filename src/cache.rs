use std::num::NonZeroUsize;

use lru::LruCache;

use crate::flash::{FlashDevice, FlashError};

/// Write-through cache of fixed-size blocks over a [`FlashDevice`].
///
/// The journal and the data writer hammer the same few hundred bytes of
/// flash; keeping a small fully-associative set of blocks in RAM turns those
/// repeated reads into memcpys. Every write goes straight to the device
/// before the cached copy is updated, so a completed `write` call is durable.
pub(crate) struct BlockCache<F> {
    device: F,
    blocks: LruCache<u32, Box<[u8]>>,
    block_size: u32,
}

impl<F: FlashDevice> BlockCache<F> {
    pub fn new(device: F, block_size: u32, nblocks: usize) -> Self {
        Self {
            device,
            blocks: LruCache::new(NonZeroUsize::new(nblocks).expect("non-zero cache size")),
            block_size,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut F {
        &mut self.device
    }

    pub fn into_device(self) -> F {
        self.device
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let mut pos = 0;
        while pos < buf.len() {
            let at = addr + pos as u32;
            let base = at - at % self.block_size;
            let off = (at - base) as usize;
            let n = (buf.len() - pos).min(self.block_size as usize - off);
            let block = self.block(base)?;
            buf[pos..pos + n].copy_from_slice(&block[off..off + n]);
            pos += n;
        }
        Ok(())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.device.write(addr, data)?;
        let mut pos = 0;
        while pos < data.len() {
            let at = addr + pos as u32;
            let base = at - at % self.block_size;
            let off = (at - base) as usize;
            let n = (data.len() - pos).min(self.block_size as usize - off);
            // A block loaded here already holds the bytes just written, and
            // AND-ing them in again is a no-op; a previously cached block is
            // patched with the device's NOR program semantics.
            let block = self.block(base)?;
            for (dst, src) in block[off..off + n].iter_mut().zip(&data[pos..pos + n]) {
                *dst &= *src;
            }
            pos += n;
        }
        Ok(())
    }

    /// Drop cached blocks overlapping the page at `page_addr`. The flash
    /// itself is untouched; the caller issues the device erase.
    pub fn erase(&mut self, page_addr: u32) {
        let page_end = page_addr + self.device.page_size();
        let stale: Vec<u32> = self
            .blocks
            .iter()
            .map(|(base, _)| *base)
            .filter(|&base| base < page_end && base + self.block_size > page_addr)
            .collect();
        for base in stale {
            self.blocks.pop(&base);
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn block(&mut self, base: u32) -> Result<&mut Box<[u8]>, FlashError> {
        if !self.blocks.contains(&base) {
            let mut buf = vec![0xFF; self.block_size as usize].into_boxed_slice();
            self.device.read(base, &mut buf)?;
            self.blocks.put(base, buf);
        }
        Ok(self.blocks.get_mut(&base).expect("block just loaded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn cache() -> BlockCache<MemFlash> {
        BlockCache::new(MemFlash::new(16 * 1024, 4096), 1024, 4)
    }

    #[test]
    fn writes_reach_the_device_immediately() {
        let mut c = cache();
        c.write(100, b"hello").unwrap();
        assert_eq!(&c.device().data()[100..105], b"hello");
    }

    #[test]
    fn reads_are_served_from_the_cached_block() {
        let mut c = cache();
        c.write(10, &[0x42]).unwrap();
        // Mutate flash behind the cache's back; the stale copy must win.
        c.device_mut().write(10, &[0x00]).unwrap();
        let mut b = [0u8; 1];
        c.read(10, &mut b).unwrap();
        assert_eq!(b[0], 0x42);
    }

    #[test]
    fn writes_split_across_block_boundaries() {
        let mut c = cache();
        let data = vec![0x21u8; 1500];
        c.write(1000, &data).unwrap();
        let mut back = vec![0u8; 1500];
        c.read(1000, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(&c.device().data()[1000..2500], &data[..]);
    }

    #[test]
    fn erase_invalidates_overlapping_blocks_only() {
        let mut c = cache();
        c.write(100, &[0x11]).unwrap(); // page 0
        c.write(5000, &[0x22]).unwrap(); // page 1
        c.erase(0);
        c.device_mut().erase(0).unwrap();
        let mut b = [0u8; 1];
        c.read(100, &mut b).unwrap();
        assert_eq!(b[0], 0xFF, "invalidated block rereads erased flash");
        c.read(5000, &mut b).unwrap();
        assert_eq!(b[0], 0x22, "unrelated page keeps its cached block");
    }

    #[test]
    fn clear_drops_everything() {
        let mut c = cache();
        c.write(0, &[0x00]).unwrap();
        c.clear();
        c.device_mut().erase(0).unwrap();
        let mut b = [0u8; 1];
        c.read(0, &mut b).unwrap();
        assert_eq!(b[0], 0xFF);
    }
}
