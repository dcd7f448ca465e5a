//! Memory access strategy.
//!
//! The debug module offers several ways to reach memory and not every one
//! supports every width. Accesses are tried with the configured methods in
//! order, and accesses of an awkward size or alignment are widened to
//! naturally aligned blocks and patched with read-modify-write.

use crate::error::VerifyMismatch;
use crate::interface::{AccessWidth, HartDebugOps, MemoryAccessMethod};
use crate::{Error, Hart};

/// Widths tried after the preferred one, widest first.
const FALLBACK_WIDTHS: [AccessWidth; 4] = [
    AccessWidth::U64,
    AccessWidth::U32,
    AccessWidth::U16,
    AccessWidth::U8,
];

/// The widest naturally aligned width of at most `size` bytes at `address`.
fn preferred_width(address: u64, size: usize) -> Option<AccessWidth> {
    let mut bytes = size;
    while bytes > 1 && address % bytes as u64 != 0 {
        bytes /= 2;
    }
    AccessWidth::from_bytes(bytes)
}

/// The aligned blocks of `width` covering `[address, address + size)`.
///
/// Returns the start of the first block, the number of blocks and the offset
/// of `address` into the first block.
fn covering_blocks(address: u64, size: usize, width: AccessWidth) -> (u64, usize, usize) {
    let bytes = width.bytes();
    let head = (address % bytes as u64) as usize;
    let count = (head + size).div_ceil(bytes);
    (address - head as u64, count, head)
}

/// The exclusive end of `[address, address + length)`, if it fits the address space.
fn range_end(address: u64, length: usize) -> Result<u64, Error> {
    address
        .checked_add(length as u64)
        .ok_or(Error::InvalidAccessSize(length))
}

/// The widths to try for an access of `size` bytes, preferred first.
fn access_widths(address: u64, size: usize) -> Result<Vec<AccessWidth>, Error> {
    let preferred = AccessWidth::from_bytes(size)
        .and_then(|_| preferred_width(address, size))
        .ok_or(Error::InvalidAccessSize(size))?;

    Ok(std::iter::once(preferred)
        .chain(FALLBACK_WIDTHS.into_iter().filter(|w| *w != preferred))
        .collect())
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// Runs `access` with each configured method until one succeeds.
    fn with_access_methods<T>(
        &mut self,
        mut access: impl FnMut(&mut D, MemoryAccessMethod) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let methods = self.context.config.memory.access_methods.clone();
        let mut last_error = None;

        for method in methods {
            match access(&mut *self.interface, method) {
                Ok(value) => return Ok(value),
                Err(Error::Unsupported(what)) => {
                    tracing::trace!("{:?} does not support {}", method, what);
                }
                Err(error) => {
                    tracing::debug!("memory access with {:?} failed: {}", method, error);
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Unsupported("memory access")))
    }

    /// Reads `count` items of `width` from the physical address `address`,
    /// which has to be aligned to `width`.
    pub fn read_physical(
        &mut self,
        address: u64,
        width: AccessWidth,
        count: usize,
    ) -> Result<Vec<u8>, Error> {
        let hart = self.state.id;
        let data = self.with_access_methods(|interface, method| {
            interface.read_memory(hart, method, address, width, count)
        })?;

        tracing::trace!(
            "hart {}: read {} x {:?} at {:#010x}",
            hart,
            count,
            width,
            address
        );
        Ok(data)
    }

    /// Writes `data`, a whole number of `width` items, to the physical
    /// address `address`, which has to be aligned to `width`.
    pub fn write_physical(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), Error> {
        let hart = self.state.id;
        self.with_access_methods(|interface, method| {
            interface.write_memory(hart, method, address, width, data)
        })?;

        tracing::trace!(
            "hart {}: wrote {} bytes as {:?} at {:#010x}",
            hart,
            data.len(),
            width,
            address
        );
        Ok(())
    }

    /// Reads `size` bytes with accesses of `width`, widening to aligned blocks.
    pub(crate) fn read_by_given_size(
        &mut self,
        address: u64,
        size: usize,
        width: AccessWidth,
    ) -> Result<Vec<u8>, Error> {
        let (start, count, head) = covering_blocks(address, size, width);
        let blocks = self.read_physical(start, width, count)?;

        Ok(blocks[head..head + size].to_vec())
    }

    /// Writes `data` with accesses of `width`, patching partially covered blocks.
    pub(crate) fn write_by_given_size(
        &mut self,
        address: u64,
        data: &[u8],
        width: AccessWidth,
    ) -> Result<(), Error> {
        let (start, count, head) = covering_blocks(address, data.len(), width);

        if head == 0 && data.len() % width.bytes() == 0 {
            return self.write_physical(address, width, data);
        }

        let mut blocks = self.read_physical(start, width, count)?;
        blocks[head..head + data.len()].copy_from_slice(data);
        self.write_physical(start, width, &blocks)
    }

    /// Reads 1, 2, 4 or 8 bytes at any address.
    ///
    /// The widest naturally aligned width is tried first, then every other
    /// width from 8 bytes down.
    pub fn read_by_any_size(&mut self, address: u64, size: usize) -> Result<Vec<u8>, Error> {
        for width in access_widths(address, size)? {
            match self.read_by_given_size(address, size, width) {
                Ok(data) => return Ok(data),
                Err(error) => {
                    tracing::trace!("{:?} read at {:#010x} failed: {}", width, address, error)
                }
            }
        }

        Err(Error::Unaligned { address, size })
    }

    /// Writes 1, 2, 4 or 8 bytes at any address.
    ///
    /// Writes into the configured flash window are handed to the flash
    /// programmer instead.
    pub fn write_by_any_size(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let widths = access_widths(address, data.len())?;

        if self.write_flash_window(address, data)? {
            return Ok(());
        }

        let mut written = false;
        for width in widths {
            match self.write_by_given_size(address, data, width) {
                Ok(()) => {
                    written = true;
                    break;
                }
                Err(error) => {
                    tracing::trace!("{:?} write at {:#010x} failed: {}", width, address, error)
                }
            }
        }

        if !written {
            return Err(Error::Unaligned {
                address,
                size: data.len(),
            });
        }

        self.verify_write(address, data)
    }

    /// Returns `true` if the write went to flash.
    fn write_flash_window(&mut self, address: u64, data: &[u8]) -> Result<bool, Error> {
        let Some(offset) = self
            .context
            .config
            .memory
            .flash
            .and_then(|window| window.offset_of(address))
        else {
            return Ok(false);
        };

        tracing::debug!(
            "hart {}: {} bytes at {:#010x} go to flash offset {:#x}",
            self.state.id,
            data.len(),
            address,
            offset
        );
        self.interface.write_flash(self.state.id, offset, data)?;

        Ok(true)
    }

    fn verify_write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        if !self.context.config.memory.verify_writes {
            return Ok(());
        }

        let actual = self.read_block(address, data.len())?;
        if actual != data {
            return Err(Error::VerifyMismatch {
                hart: self.state.id,
                source: VerifyMismatch::Memory {
                    address,
                    expected: data.to_vec(),
                    actual,
                },
            });
        }

        Ok(())
    }

    /// Reads an arbitrary range of physical memory.
    pub fn read_block(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        let end = range_end(address, length)?;
        let mut data = Vec::with_capacity(length);
        let mut current = address;

        while current < end && current % 4 != 0 {
            data.extend(self.read_by_any_size(current, 1)?);
            current += 1;
        }

        let words = ((end - current) / 4) as usize;
        if words > 0 {
            match self.read_physical(current, AccessWidth::U32, words) {
                Ok(block) => data.extend(block),
                Err(error) => {
                    tracing::debug!("block read failed ({}), reading word by word", error);
                    for word in 0..words as u64 {
                        data.extend(self.read_by_any_size(current + word * 4, 4)?);
                    }
                }
            }
            current += words as u64 * 4;
        }

        while current < end {
            data.extend(self.read_by_any_size(current, 1)?);
            current += 1;
        }

        Ok(data)
    }

    /// Writes an arbitrary range of physical memory.
    pub fn write_block(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let end = range_end(address, data.len())?;

        if self.write_flash_window(address, data)? {
            return Ok(());
        }

        let mut current = address;
        let mut remaining = data;

        while current < end && current % 4 != 0 {
            self.write_by_any_size(current, &remaining[..1])?;
            remaining = &remaining[1..];
            current += 1;
        }

        let words = remaining.len() / 4;
        if words > 0 {
            let (block, rest) = remaining.split_at(words * 4);
            if let Err(error) = self.write_physical(current, AccessWidth::U32, block) {
                tracing::debug!("block write failed ({}), writing word by word", error);
                for (index, word) in block.chunks_exact(4).enumerate() {
                    self.write_by_any_size(current + index as u64 * 4, word)?;
                }
            }
            remaining = rest;
            current += block.len() as u64;
        }

        for (index, byte) in remaining.iter().enumerate() {
            self.write_by_any_size(current + index as u64, std::slice::from_ref(byte))?;
        }

        self.verify_write(address, data)
    }

    /// Reads memory as the hart sees it, translating the address when paging is active.
    pub fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        let physical = self.resolve_address(address)?;
        self.read_block(physical, length)
    }

    /// Writes memory as the hart sees it, translating the address when paging is active.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let physical = self.resolve_address(address)?;
        self.write_block(physical, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x1000, 4 => Some(AccessWidth::U32); "aligned word")]
    #[test_case(0x1002, 4 => Some(AccessWidth::U16); "half aligned word")]
    #[test_case(0x1001, 8 => Some(AccessWidth::U8); "odd address")]
    #[test_case(0x1004, 8 => Some(AccessWidth::U32); "word aligned double")]
    fn preferred(address: u64, size: usize) -> Option<AccessWidth> {
        preferred_width(address, size)
    }

    #[test_case(0x1000, 4, AccessWidth::U32 => (0x1000, 1, 0); "exact")]
    #[test_case(0x1002, 2, AccessWidth::U32 => (0x1000, 1, 2); "inside one block")]
    #[test_case(0x1003, 2, AccessWidth::U32 => (0x1000, 2, 3); "straddles two blocks")]
    #[test_case(0x1001, 4, AccessWidth::U16 => (0x1000, 3, 1); "narrow width")]
    fn blocks(address: u64, size: usize, width: AccessWidth) -> (u64, usize, usize) {
        covering_blocks(address, size, width)
    }

    #[test_case(0x1000, 16 => matches Ok(0x1010); "plain")]
    #[test_case(u64::MAX - 3, 3 => matches Ok(u64::MAX); "up to the last byte")]
    #[test_case(u64::MAX - 3, 4 => matches Err(Error::InvalidAccessSize(4)); "past the end")]
    #[test_case(u64::MAX - 0x10, 0x100 => matches Err(Error::InvalidAccessSize(0x100)); "wraps around")]
    fn ends(address: u64, length: usize) -> Result<u64, Error> {
        range_end(address, length)
    }
}
