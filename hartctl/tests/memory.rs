mod common;

use hartctl::config::FlashWindow;
use hartctl::mock::MockDebugModule;
use hartctl::registers::{MSTATUS, SATP};
use hartctl::{AccessWidth, EngineConfig, Error, MemoryAccessMethod, TranslationError};
use pretty_assertions::assert_eq;
use test_log::test;

use common::{session, session_with};

#[test]
fn writes_into_the_flash_window_go_to_the_flash_programmer() -> Result<(), Error> {
    let mut config = EngineConfig::default();
    config.memory.flash = Some(FlashWindow {
        end: 0x2000_0000,
        alias_base: Some(0x0800_0000),
    });
    let mut session = session_with(MockDebugModule::new(1, 32), config);
    let mut hart = session.hart(0)?;

    hart.write_memory(0x0800_0010, &[1, 2, 3, 4])?;
    hart.write_memory(0x100, &[5, 6])?;
    hart.write_memory(0x2000_0000, &[7, 8, 9, 10])?;

    let mock = session.interface();
    assert_eq!(
        mock.flash_writes,
        vec![(0x10, vec![1, 2, 3, 4]), (0x100, vec![5, 6])]
    );
    assert_eq!(mock.memory.read(0x0800_0010, 4), vec![0; 4]);
    assert_eq!(mock.memory.read_u32(0x2000_0000), 0x0a09_0807);

    Ok(())
}

#[test]
fn access_methods_are_tried_in_order() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.methods = vec![MemoryAccessMethod::SystemBus];
    mock.memory.write_u32(0x1000, 0x1234_5678);
    let mut session = session(mock);

    let data = session.hart(0)?.read_memory(0x1000, 4)?;

    assert_eq!(data, vec![0x78, 0x56, 0x34, 0x12]);
    assert_eq!(
        session.interface().accesses,
        vec![(MemoryAccessMethod::SystemBus, 0x1000, AccessWidth::U32)]
    );

    Ok(())
}

#[test]
fn no_configured_method_works() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.methods = vec![MemoryAccessMethod::SystemBus];
    let mut config = EngineConfig::default();
    config.memory.access_methods = vec![
        MemoryAccessMethod::ProgramBuffer,
        MemoryAccessMethod::AbstractCommand,
    ];
    let mut session = session_with(mock, config);

    let result = session.hart(0)?.read_physical(0x1000, AccessWidth::U32, 1);

    assert!(matches!(result, Err(Error::Unsupported(_))));

    Ok(())
}

#[test]
fn byte_write_with_word_accesses_only() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.widths = vec![AccessWidth::U32];
    mock.memory.write_u32(0x1000, 0x4433_2211);
    let mut session = session(mock);

    session.hart(0)?.write_by_any_size(0x1001, &[0xaa])?;

    assert_eq!(session.interface().memory.read_u32(0x1000), 0x4433_aa11);
    assert!(session
        .interface()
        .accesses
        .iter()
        .all(|(_, address, width)| *address == 0x1000 && *width == AccessWidth::U32));

    Ok(())
}

#[test]
fn unaligned_reads_are_widened() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.widths = vec![AccessWidth::U16];
    mock.memory.write(0x1000, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let mut session = session(mock);

    let data = session.hart(0)?.read_by_any_size(0x1003, 4)?;

    assert_eq!(data, vec![3, 4, 5, 6]);

    Ok(())
}

#[test]
fn accesses_nothing_can_serve() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.widths = Vec::new();
    let mut session = session(mock);
    let mut hart = session.hart(0)?;

    assert!(matches!(
        hart.read_by_any_size(0x1000, 4),
        Err(Error::Unaligned {
            address: 0x1000,
            size: 4
        })
    ));
    assert!(matches!(
        hart.read_by_any_size(0x1000, 3),
        Err(Error::InvalidAccessSize(3))
    ));
    assert!(matches!(
        hart.write_by_any_size(0x1000, &[0; 16]),
        Err(Error::InvalidAccessSize(16))
    ));

    Ok(())
}

#[test]
fn block_access_with_ragged_edges() -> Result<(), Error> {
    let mut session = session(MockDebugModule::new(1, 32));
    let data: Vec<u8> = (0..23).collect();

    let mut hart = session.hart(0)?;
    hart.write_block(0x1001, &data)?;
    let read_back = hart.read_block(0x1001, data.len())?;

    assert_eq!(read_back, data);
    assert_eq!(session.interface().memory.read_u8(0x1000), 0);
    assert_eq!(session.interface().memory.read_u8(0x1018), 0);

    Ok(())
}

#[test]
fn block_access_past_the_top_of_the_address_space() -> Result<(), Error> {
    let mut session = session(MockDebugModule::new(1, 64));
    session.interface_mut().accesses.clear();
    let mut hart = session.hart(0)?;

    assert!(matches!(
        hart.read_block(u64::MAX - 1, 4),
        Err(Error::InvalidAccessSize(4))
    ));
    assert!(matches!(
        hart.write_block(u64::MAX - 7, &[0; 16]),
        Err(Error::InvalidAccessSize(16))
    ));
    assert!(session.interface().accesses.is_empty());

    Ok(())
}

#[test]
fn verified_writes() -> Result<(), Error> {
    let mut config = EngineConfig::default();
    config.memory.verify_writes = true;
    let mut session = session_with(MockDebugModule::new(1, 32), config);

    session.hart(0)?.write_block(0x1000, &[1, 2, 3, 4, 5])?;

    assert_eq!(
        session.interface().memory.read(0x1000, 5),
        vec![1, 2, 3, 4, 5]
    );

    Ok(())
}

/// Sv32 tables mapping the virtual page 0x4000_1000 to 0x8000_3000,
/// active for supervisor mode accesses through `mstatus.mprv`.
fn paged_hart() -> MockDebugModule {
    let mut mock = MockDebugModule::new(1, 32);

    mock.harts[0].set_register(SATP, 0x8000_0000 | 0x10);
    mock.harts[0].set_register(MSTATUS, 1 << 17 | 1 << 11);

    // Root table at 0x10000, entry 0x100 points at the table at 0x11000.
    mock.memory.write_u32(0x1_0000 + 0x100 * 4, 0x4401);
    // Entry 1 of the second level is a leaf for 0x8000_3000, RWX.
    mock.memory.write_u32(0x1_1000 + 4, 0x2000_0c0f);

    mock.memory.write_u32(0x8000_3004, 0xcafe_f00d);
    mock
}

#[test]
fn virtual_accesses_walk_the_page_tables() -> Result<(), Error> {
    let mut session = session(paged_hart());
    let mut hart = session.hart(0)?;

    assert_eq!(hart.virt_to_phys(0x4000_1abc)?, 0x8000_3abc);
    assert_eq!(
        hart.read_memory(0x4000_1004, 4)?,
        vec![0x0d, 0xf0, 0xfe, 0xca]
    );

    hart.write_memory(0x4000_1010, &[0x55])?;
    assert_eq!(session.interface().memory.read_u8(0x8000_3010), 0x55);

    Ok(())
}

#[test]
fn unmapped_virtual_address_fails() -> Result<(), Error> {
    let mut session = session(paged_hart());
    let mut hart = session.hart(0)?;

    let result = hart.read_memory(0x4000_2000, 4);

    assert!(matches!(
        result,
        Err(Error::Translation {
            hart: 0,
            source: TranslationError::InvalidEntry { level: 0, .. }
        })
    ));

    Ok(())
}

#[test]
fn translation_can_be_switched_off() -> Result<(), Error> {
    let mut config = EngineConfig::default();
    config.translation.enabled = false;
    let mut session = session_with(paged_hart(), config);
    let mut hart = session.hart(0)?;

    assert!(matches!(
        hart.virt_to_phys(0x4000_1abc),
        Err(Error::Translation {
            source: TranslationError::Inactive,
            ..
        })
    ));
    // The address is used as is.
    assert_eq!(hart.read_memory(0x1_0400, 4)?, vec![0x01, 0x44, 0, 0]);

    Ok(())
}

#[test]
fn machine_mode_does_not_translate() -> Result<(), Error> {
    let mut mock = paged_hart();
    mock.harts[0].set_register(MSTATUS, 0);
    let mut session = session(mock);

    assert!(matches!(
        session.hart(0)?.virt_to_phys(0x4000_1abc),
        Err(Error::Translation {
            source: TranslationError::Inactive,
            ..
        })
    ));

    Ok(())
}
