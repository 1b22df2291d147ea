#![cfg(feature = "test-utils")]

use aero_memmap::testing::{FakePageTable, FakePhys, PhysWrite, Region, PTE_RW};
use aero_memmap::{Access, AlignCtl, MapError, MemMapConfig, MemMapper, PhysStatus, PAGE_SIZE};

const FIRST_PAGE: u64 = 0x7000_0000;
const FIRST_PHYS: u64 = 0x5000;
const SECOND_PHYS: u64 = 0x2000;

/// Two consecutive linear pages mapped to out-of-order physical pages.
fn new_mapper() -> MemMapper<FakePageTable, FakePhys> {
    let mut pt = FakePageTable::new();
    pt.map(FIRST_PAGE, FIRST_PHYS, PTE_RW);
    pt.map(FIRST_PAGE + PAGE_SIZE as u64, SECOND_PHYS, PTE_RW);
    MemMapper::with_config(pt, FakePhys::new(16 * PAGE_SIZE), MemMapConfig::default()).unwrap()
}

#[test]
fn every_split_of_common_widths() {
    for width in [2usize, 4, 8] {
        for head in 1..width {
            let mut mm = new_mapper();
            let vaddr = FIRST_PAGE + (PAGE_SIZE - head) as u64;
            let value: Vec<u8> = (1..=width as u8).collect();

            let token = mm.map(vaddr, width, Access::DATA_W, AlignCtl::NONE).unwrap();
            mm.mapped_mut(token).unwrap().copy_from_slice(&value);
            mm.commit_and_unmap(token).unwrap();

            let first_paddr = FIRST_PHYS + (PAGE_SIZE - head) as u64;
            assert_eq!(
                mm.phys().writes(),
                &[
                    PhysWrite {
                        paddr: first_paddr,
                        data: value[..head].to_vec(),
                    },
                    PhysWrite {
                        paddr: SECOND_PHYS,
                        data: value[head..].to_vec(),
                    },
                ],
                "width {width}, {head} byte(s) on the first page"
            );

            mm.phys_mut().clear_logs();
            let token = mm.map(vaddr, width, Access::DATA_R, AlignCtl::NONE).unwrap();
            assert_eq!(mm.mapped(token).unwrap(), &value[..]);
            mm.commit_and_unmap(token).unwrap();
            assert_eq!(
                mm.phys().reads(),
                &[(first_paddr, head), (SECOND_PHYS, width - head)]
            );
            assert_eq!(mm.active_mappings(), 0);
        }
    }
}

#[test]
fn read_modify_write_across_ram_and_mmio() {
    let mut mm = new_mapper();
    mm.phys_mut()
        .set_region(SECOND_PHYS..SECOND_PHYS + PAGE_SIZE as u64, Region::Mmio);
    mm.phys_mut().poke(FIRST_PHYS + PAGE_SIZE as u64 - 2, &[0x11, 0x22]);
    mm.phys_mut().poke(SECOND_PHYS, &[0x33, 0x44]);

    let vaddr = FIRST_PAGE + PAGE_SIZE as u64 - 2;
    let token = mm
        .map(vaddr, 4, Access::DATA_RW, AlignCtl::natural(4))
        .unwrap();
    let bytes = mm.mapped_mut(token).unwrap();
    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    assert_eq!(value, 0x4433_2211);
    bytes.copy_from_slice(&(value + 1).to_le_bytes());
    mm.commit_and_unmap(token).unwrap();

    assert_eq!(mm.fetch_u32(vaddr).unwrap(), 0x4433_2212);
}

#[test]
fn second_half_failure_is_deferred_without_rewriting_the_first() {
    let mut mm = new_mapper();
    let err = aero_memmap::PhysError::DeviceContextRequired { addr: SECOND_PHYS };
    mm.phys_mut().push_write_status(PhysStatus::Ok);
    mm.phys_mut().push_write_status(PhysStatus::Failed(err));

    let vaddr = FIRST_PAGE + PAGE_SIZE as u64 - 4;
    let token = mm.map(vaddr, 8, Access::DATA_W, AlignCtl::NONE).unwrap();
    mm.mapped_mut(token)
        .unwrap()
        .copy_from_slice(&0x0807_0605_0403_0201u64.to_le_bytes());
    assert_eq!(
        mm.commit_and_unmap_deferrable(token).unwrap(),
        aero_memmap::CommitOutcome::Deferred
    );
    assert_eq!(mm.phys().writes().len(), 1);

    mm.process_pending_commits().unwrap();
    let writes = mm.phys().writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].paddr, SECOND_PHYS);
    assert_eq!(writes[1].data, [5, 6, 7, 8]);
    assert_eq!(mm.phys().peek(SECOND_PHYS, 4), &[5, 6, 7, 8]);
}

#[test]
fn locked_update_across_the_boundary_is_left_to_split_lock_emulation() {
    let mut mm = new_mapper();
    for head in 1..4u64 {
        let vaddr = FIRST_PAGE + PAGE_SIZE as u64 - head;
        assert_eq!(
            mm.atomic_update_u32(vaddr, |v| v + 1),
            Err(MapError::EmulateSplitLock {
                addr: vaddr,
                size: 4,
            })
        );
    }
    assert_eq!(mm.active_mappings(), 0);
    assert!(mm.phys().reads().is_empty());
    assert!(mm.phys().writes().is_empty());
}
