//! Virtual to physical address translation by walking the hart's page tables.

use scroll::{Pread, LE};

use crate::error::TranslationError;
use crate::interface::{AccessWidth, HartDebugOps};
use crate::registers::{Dcsr, Mstatus, DCSR, MSTATUS, PRIV_MACHINE, SATP};
use crate::{Error, Hart, HartId};

const PAGE_SHIFT: u32 = 12;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;

/// The geometry of one paging mode.
#[derive(Debug, PartialEq, Eq)]
pub struct PagingMode {
    /// Name as used in the privileged specification.
    pub name: &'static str,
    /// Number of significant virtual address bits.
    pub va_bits: u32,
    /// Page table depth.
    pub levels: usize,
    /// log2 of the page table entry size.
    pub pte_shift: u32,
    pub vpn_shift: &'static [u32],
    pub vpn_mask: &'static [u64],
    pub pte_ppn_shift: &'static [u32],
    pub pte_ppn_mask: &'static [u64],
    pub pa_ppn_shift: &'static [u32],
    pub pa_ppn_mask: &'static [u64],
}

/// Two level paging with 32 bit virtual addresses.
pub static SV32: PagingMode = PagingMode {
    name: "Sv32",
    va_bits: 32,
    levels: 2,
    pte_shift: 2,
    vpn_shift: &[12, 22],
    vpn_mask: &[0x3ff, 0x3ff],
    pte_ppn_shift: &[10, 20],
    pte_ppn_mask: &[0x3ff, 0xfff],
    pa_ppn_shift: &[12, 22],
    pa_ppn_mask: &[0x3ff, 0xfff],
};

/// Three level paging with 39 bit virtual addresses.
pub static SV39: PagingMode = PagingMode {
    name: "Sv39",
    va_bits: 39,
    levels: 3,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x3ff_ffff],
    pa_ppn_shift: &[12, 21, 30],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x3ff_ffff],
};

/// Four level paging with 48 bit virtual addresses.
pub static SV48: PagingMode = PagingMode {
    name: "Sv48",
    va_bits: 48,
    levels: 4,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30, 39],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28, 37],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ffff],
    pa_ppn_shift: &[12, 21, 30, 39],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ffff],
};

/// Five level paging with 57 bit virtual addresses.
pub static SV57: PagingMode = PagingMode {
    name: "Sv57",
    va_bits: 57,
    levels: 5,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30, 39, 48],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28, 37, 46],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0xff],
    pa_ppn_shift: &[12, 21, 30, 39, 48],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0xff],
};

/// Decodes `satp` into the paging mode and the physical address of the root table.
///
/// Returns `Ok(None)` for bare mode.
pub fn decode_satp(
    satp: u64,
    xlen: u32,
) -> Result<Option<(&'static PagingMode, u64)>, TranslationError> {
    let (mode, ppn) = if xlen == 32 {
        ((satp >> 31) & 1, satp & 0x3f_ffff)
    } else {
        ((satp >> 60) & 0xf, satp & 0xfff_ffff_ffff)
    };

    let paging = match (xlen, mode) {
        (_, 0) => return Ok(None),
        (32, 1) => &SV32,
        (64, 8) => &SV39,
        (64, 9) => &SV48,
        (64, 10) => &SV57,
        _ => return Err(TranslationError::UnsupportedMode(mode)),
    };

    Ok(Some((paging, ppn << PAGE_SHIFT)))
}

/// Walks the page tables rooted at `root` for `address`.
///
/// `read_pte` reads the entry at a physical address.
pub fn walk(
    mode: &PagingMode,
    root: u64,
    xlen: u32,
    address: u64,
    mut read_pte: impl FnMut(u64) -> Result<u64, Error>,
    hart: HartId,
) -> Result<u64, Error> {
    let fail = |source| Error::Translation { hart, source };

    // Bits above the address space have to be copies of the top bit.
    let upper_bits = xlen - (mode.va_bits - 1);
    let mask = if upper_bits >= 64 {
        u64::MAX
    } else {
        (1 << upper_bits) - 1
    };
    let upper = (address >> (mode.va_bits - 1)) & mask;
    if upper != 0 && upper != mask {
        return Err(fail(TranslationError::NotSignExtended {
            address,
            va_bits: mode.va_bits,
        }));
    }

    let mut table = root;
    let mut leaf = None;

    for level in (0..mode.levels).rev() {
        let vpn = (address >> mode.vpn_shift[level]) & mode.vpn_mask[level];
        let pte_address = table + (vpn << mode.pte_shift);
        let pte = read_pte(pte_address)?;

        tracing::trace!(
            "{}: level {} pte at {:#x} = {:#x}",
            mode.name,
            level,
            pte_address,
            pte
        );

        if pte & PTE_V == 0 || (pte & PTE_R == 0 && pte & PTE_W != 0) {
            return Err(fail(TranslationError::InvalidEntry {
                level,
                pte_address,
                pte,
            }));
        }

        if pte & (PTE_R | PTE_X) != 0 {
            leaf = Some((level, pte));
            break;
        }

        table = (pte >> 10) << PAGE_SHIFT;
    }

    let Some((leaf_level, pte)) = leaf else {
        return Err(fail(TranslationError::NoLeaf(address)));
    };

    let mut physical = address & ((1 << mode.va_bits) - 1);
    for level in leaf_level..mode.levels {
        let ppn = (pte >> mode.pte_ppn_shift[level]) & mode.pte_ppn_mask[level];
        physical &= !(mode.pa_ppn_mask[level] << mode.pa_ppn_shift[level]);
        physical |= ppn << mode.pa_ppn_shift[level];
    }

    Ok(physical)
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    /// The privilege level memory accesses are made with, honouring `mstatus.mprv`.
    fn effective_privilege(&mut self) -> Result<u64, Error> {
        let mstatus = Mstatus(self.read_register(MSTATUS)?);
        if mstatus.mprv() {
            return Ok(mstatus.mpp() as u64);
        }

        Ok(Dcsr(self.read_register(DCSR)?).prv() as u64)
    }

    /// The paging mode and root table in use, if addresses are translated at all.
    fn active_paging(&mut self) -> Result<Option<(&'static PagingMode, u64)>, Error> {
        if !self.context.config.translation.enabled {
            return Ok(None);
        }

        if self.effective_privilege()? == PRIV_MACHINE {
            return Ok(None);
        }

        let xlen = self.xlen()?;
        let satp = self.read_register(SATP)?;

        decode_satp(satp, xlen).map_err(|source| Error::Translation {
            hart: self.state.id,
            source,
        })
    }

    /// Translates a virtual address to the physical address it maps to.
    ///
    /// Fails with [`TranslationError::Inactive`] if the hart does not translate
    /// addresses at the moment.
    #[tracing::instrument(skip(self), fields(hart = self.state.id))]
    pub fn virt_to_phys(&mut self, address: u64) -> Result<u64, Error> {
        match self.active_paging()? {
            Some((mode, root)) => self.translate(mode, root, address),
            None => Err(Error::Translation {
                hart: self.state.id,
                source: TranslationError::Inactive,
            }),
        }
    }

    /// The physical address for `address`, which is used as is without paging.
    pub(crate) fn resolve_address(&mut self, address: u64) -> Result<u64, Error> {
        match self.active_paging()? {
            Some((mode, root)) => self.translate(mode, root, address),
            None => Ok(address),
        }
    }

    fn translate(&mut self, mode: &PagingMode, root: u64, address: u64) -> Result<u64, Error> {
        let xlen = self.xlen()?;
        let hart = self.state.id;
        let words = 1 << (mode.pte_shift - 2);

        let physical = walk(
            mode,
            root,
            xlen,
            address,
            |pte_address| {
                let bytes = self.read_physical(pte_address, AccessWidth::U32, words)?;
                let pte = if words == 1 {
                    bytes.pread_with::<u32>(0, LE).map(u64::from)
                } else {
                    bytes.pread_with::<u64>(0, LE)
                };
                pte.map_err(|error| Error::Other(error.into()))
            },
            hart,
        )?;

        tracing::debug!(
            "hart {}: {} translated {:#x} to {:#x}",
            hart,
            mode.name,
            address,
            physical
        );
        Ok(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table_reader(entries: HashMap<u64, u64>) -> impl FnMut(u64) -> Result<u64, Error> {
        move |address| Ok(entries.get(&address).copied().unwrap_or(0))
    }

    fn leaf(physical: u64) -> u64 {
        (physical >> 12) << 10 | PTE_V | PTE_R | PTE_W | PTE_X
    }

    fn pointer(table: u64) -> u64 {
        (table >> 12) << 10 | PTE_V
    }

    #[test]
    fn satp_modes() {
        assert_eq!(decode_satp(0, 32), Ok(None));
        assert_eq!(
            decode_satp(0x8000_0005, 32),
            Ok(Some((&SV32, 0x5000)))
        );
        assert_eq!(decode_satp(8 << 60 | 0x80, 64), Ok(Some((&SV39, 0x80000))));
        assert_eq!(decode_satp(9 << 60, 64), Ok(Some((&SV48, 0))));
        assert_eq!(decode_satp(10 << 60 | 1, 64), Ok(Some((&SV57, 0x1000))));
        assert_eq!(
            decode_satp(11 << 60, 64),
            Err(TranslationError::UnsupportedMode(11))
        );
    }

    #[test]
    fn sv32_megapage() {
        // Virtual 0x4000_0000..0x4040_0000 maps to physical 0x8000_0000.
        let root = 0x1000;
        let vpn1 = 0x4000_0000u64 >> 22;
        let reader = table_reader(HashMap::from([(root + vpn1 * 4, leaf(0x8000_0000))]));

        let physical = walk(&SV32, root, 32, 0x4012_3456, reader, 0).unwrap();

        assert_eq!(physical, 0x8012_3456);
    }

    #[test]
    fn sv32_page_offsets_survive() {
        let root = 0x1000;
        let second = 0x2000;
        let virt = 0x0040_3000u64;
        let entries = HashMap::from([
            (root + (virt >> 22) * 4, pointer(second)),
            (second + ((virt >> 12) & 0x3ff) * 4, leaf(0x8765_4000)),
        ]);

        for offset in [0, 1, 0x7ff, 0xfff] {
            let physical = walk(&SV32, root, 32, virt + offset, table_reader(entries.clone()), 0)
                .unwrap();
            assert_eq!(physical, 0x8765_4000 + offset);
        }
    }

    #[test]
    fn sv39_rejects_non_canonical_addresses() {
        let result = walk(&SV39, 0, 64, 0x0000_0040_0000_0000, table_reader(HashMap::new()), 3);

        assert!(matches!(
            result,
            Err(Error::Translation {
                hart: 3,
                source: TranslationError::NotSignExtended { va_bits: 39, .. }
            })
        ));
    }

    #[test]
    fn sv39_gigapage_with_high_addresses() {
        let root = 0x10_0000;
        let virt = 0xffff_ffff_c000_1234u64;
        let vpn2 = (virt >> 30) & 0x1ff;
        let reader = table_reader(HashMap::from([(root + vpn2 * 8, leaf(0x8000_0000))]));

        let physical = walk(&SV39, root, 64, virt, reader, 0).unwrap();

        assert_eq!(physical, 0x8000_1234);
    }

    #[test]
    fn sv57_top_level_leaf() {
        let root = 0x20_0000;
        let virt = 0x0001_0000_0000_1234u64;
        let vpn4 = (virt >> 48) & 0x1ff;
        let reader = table_reader(HashMap::from([(
            root + vpn4 * 8,
            leaf(0x0002_0000_0000_0000),
        )]));

        let physical = walk(&SV57, root, 64, virt, reader, 0).unwrap();

        assert_eq!(physical, 0x0002_0000_0000_1234);
    }

    #[test]
    fn invalid_entry_fails() {
        let reader = table_reader(HashMap::from([(0x1000, PTE_V | PTE_W)]));

        let result = walk(&SV32, 0x1000, 32, 0x0000_0123, reader, 0);

        assert!(matches!(
            result,
            Err(Error::Translation {
                source: TranslationError::InvalidEntry { level: 1, .. },
                ..
            })
        ));
    }
}
