mod common;

use hartctl::mock::{MockDebugModule, MockTrigger, SPIN};
use hartctl::registers::{Dcsr, RegisterId, A0, A1, DCSR};
use hartctl::{
    BreakpointKind, DataCondition, DebugReason, EngineConfig, Error, HartStatus, ResumeAt,
    WatchKind,
};
use pretty_assertions::assert_eq;
use test_case::test_case;
use test_log::test;

use common::{session, session_with, SW_A1_A0, SW_A2_A0};

const A2: RegisterId = RegisterId::gpr(12);

/// Bit 19 (`select`) and the hit bit of an `mcontrol` trigger.
const MCONTROL_SELECT: u64 = 1 << 19;
const MCONTROL_HIT: u64 = 1 << 20;
const MCONTROL_CHAIN: u64 = 1 << 11;

/// `sw a1, 8(a0)`
const SW_A1_8_A0: u32 = 0x00b5_2423;
/// `sw a1, 4(a0)`
const SW_A1_4_A0: u32 = 0x00b5_2223;

fn match_type(tdata1: u64) -> u64 {
    tdata1 >> 7 & 0xf
}

fn patterned_memory() -> MockDebugModule {
    let mut mock = MockDebugModule::new(1, 32);
    let pattern: Vec<u8> = (0..16).map(|i| 0x10 + i).collect();
    mock.memory.write(0x1000, &pattern);
    mock
}

#[test_case(0x1000, 4, &[0x73, 0x00, 0x10, 0x00]; "aligned ebreak")]
#[test_case(0x1002, 2, &[0x02, 0x90]; "compressed ebreak")]
#[test_case(0x1006, 4, &[0x73, 0x00, 0x10, 0x00]; "halfword aligned ebreak")]
fn software_breakpoint_round_trip(address: u64, length: usize, trap: &[u8]) {
    let mut session = session(patterned_memory());
    let original = session.interface().memory.read(address, length);

    let mut hart = session.hart(0).expect("Failed to get hart 0.");
    let id = hart
        .add_breakpoint(address, length, BreakpointKind::Software)
        .expect("Failed to add the breakpoint.");

    assert_eq!(hart.breakpoints()[0].original_instruction, original);
    assert_eq!(session.interface().memory.read(address, length), trap);
    assert!(Dcsr(session.interface().harts[0].register(DCSR)).ebreakm());

    // Neighbouring bytes are untouched.
    let next = address + length as u64;
    assert_eq!(
        session.interface().memory.read_u8(next),
        0x10 + (next - 0x1000) as u8
    );

    session
        .hart(0)
        .expect("Failed to get hart 0.")
        .remove_breakpoint(id)
        .expect("Failed to remove the breakpoint.");

    assert_eq!(session.interface().memory.read(address, length), original);
}

#[test]
fn misaligned_software_breakpoint_is_rejected() -> Result<(), Error> {
    let mut session = session(patterned_memory());
    let mut hart = session.hart(0)?;

    assert!(matches!(
        hart.add_breakpoint(0x1001, 2, BreakpointKind::Software),
        Err(Error::InvalidBreakpoint {
            address: 0x1001,
            length: 2
        })
    ));
    assert!(hart.breakpoints().is_empty());

    Ok(())
}

#[test]
fn hardware_breakpoints_until_the_slots_run_out() -> Result<(), Error> {
    let mut session = session(MockDebugModule::new(1, 32));
    let mut hart = session.hart(0)?;

    let mut ids = Vec::new();
    for address in [0x100, 0x200, 0x300, 0x400] {
        ids.push(hart.add_breakpoint(address, 4, BreakpointKind::Hardware)?);
    }

    let result = hart.add_breakpoint(0x500, 4, BreakpointKind::Hardware);
    assert!(matches!(
        result,
        Err(Error::ResourceExhausted {
            hart: 0,
            address: 0x500
        })
    ));
    assert_eq!(hart.breakpoints().len(), 4);

    let slots: Vec<u64> = session.interface().harts[0]
        .triggers
        .iter()
        .map(|trigger| trigger.tdata2)
        .collect();
    assert_eq!(slots, vec![0x100, 0x200, 0x300, 0x400]);

    let mut hart = session.hart(0)?;
    hart.remove_breakpoint(ids[1])?;
    hart.add_breakpoint(0x500, 4, BreakpointKind::Hardware)?;

    assert_eq!(session.interface().harts[0].triggers[1].tdata2, 0x500);

    Ok(())
}

#[test]
fn hardware_breakpoints_are_downgraded_past_the_threshold() -> Result<(), Error> {
    let mut config = EngineConfig::default();
    config.breakpoints.hardware_downgrade_threshold = Some(2);
    let mut session = session_with(patterned_memory(), config);
    let mut hart = session.hart(0)?;

    hart.add_breakpoint(0x1000, 4, BreakpointKind::Hardware)?;
    hart.add_breakpoint(0x1004, 4, BreakpointKind::Hardware)?;
    hart.add_breakpoint(0x1008, 4, BreakpointKind::Hardware)?;

    let kinds: Vec<_> = hart.breakpoints().iter().map(|bp| bp.kind).collect();
    assert_eq!(
        kinds,
        vec![
            BreakpointKind::Hardware,
            BreakpointKind::Hardware,
            BreakpointKind::Software
        ]
    );
    assert_eq!(session.interface().memory.read_u32(0x1008), 0x0010_0073);

    Ok(())
}

#[test]
fn forced_software_breakpoints_leave_triggers_alone() -> Result<(), Error> {
    let mut config = EngineConfig::default();
    config.breakpoints.force_software = true;
    let mut session = session_with(patterned_memory(), config);

    session
        .hart(0)?
        .add_breakpoint(0x1000, 4, BreakpointKind::Hardware)?;

    assert!(session.interface().harts[0]
        .triggers
        .iter()
        .all(|trigger| trigger.tdata2 == 0));
    assert_eq!(session.interface().memory.read_u32(0x1000), 0x0010_0073);

    Ok(())
}

#[test]
fn slot_dropping_a_feature_is_skipped() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    // Slot 0 cannot match stores.
    mock.harts[0].triggers[0].writable &= !0b010;
    let mut session = session(mock);

    session
        .hart(0)?
        .add_watchpoint(0x2000, 4, WatchKind::Write, None)?;

    let triggers = &session.interface().harts[0].triggers;
    assert_eq!(triggers[0].tdata1 & 0b111, 0);
    assert_eq!(triggers[1].tdata2, 0x2001);
    assert_eq!(triggers[1].tdata1 & 0b111, 0b010);

    Ok(())
}

#[test]
fn triggers_owned_by_someone_else_are_skipped() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    // Armed by machine mode software: execute, m, no dmode.
    let foreign = 2 << 28 | 1 << 6 | 1 << 2;
    mock.harts[0].triggers[0].tdata1 = foreign;
    mock.harts[0].triggers[0].tdata2 = 0x4000;
    let mut session = session(mock);

    session
        .hart(0)?
        .add_breakpoint(0x100, 4, BreakpointKind::Hardware)?;

    let triggers = &session.interface().harts[0].triggers;
    assert_eq!(triggers[0].tdata1, foreign);
    assert_eq!(triggers[0].tdata2, 0x4000);
    assert_eq!(triggers[1].tdata2, 0x100);

    Ok(())
}

#[test]
fn stale_debug_triggers_are_cleared() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    // Left over by a debugger that went away: store, dmode.
    mock.harts[0].triggers[0].tdata1 = 2 << 28 | 1 << 27 | 1 << 12 | 1 << 1;
    mock.harts[0].triggers[0].tdata2 = 0x4000;
    let mut session = session(mock);

    session
        .hart(0)?
        .add_breakpoint(0x100, 4, BreakpointKind::Hardware)?;

    let triggers = &session.interface().harts[0].triggers;
    assert_eq!(triggers[0].tdata2, 0x100);
    assert_eq!(triggers[0].tdata1 & 0b111, 0b100);

    Ok(())
}

#[test]
fn watchpoint_halts_before_the_store_and_is_stepped_over() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.memory.write_program(0x1000, &[SW_A1_A0, SPIN]);
    mock.harts[0].set_register(A0, 0x2000);
    mock.harts[0].set_register(A1, 0xdead);
    let mut session = session(mock);

    let id = session
        .hart(0)?
        .add_watchpoint(0x2000, 4, WatchKind::Write, None)?;

    session.resume(0, ResumeAt::Address(0x1000), false)?;
    session.poll()?;

    {
        let mut hart = session.hart(0)?;
        assert_eq!(hart.status(), HartStatus::Halted);
        assert_eq!(hart.debug_reason(), DebugReason::Watchpoint);
        assert_eq!(hart.last_trigger_hit(), Some(id));
        assert_eq!(hart.read_pc()?, 0x1000);
    }
    assert_eq!(session.interface().harts[0].triggers[0].tdata1 & MCONTROL_HIT, 0);
    assert_eq!(session.interface().memory.read_u32(0x2000), 0);

    session.resume(0, ResumeAt::Current, false)?;

    let hart = session.hart(0)?;
    assert_eq!(hart.status(), HartStatus::Running);
    assert!(hart.watchpoints()[0].is_set);

    let mock = session.interface();
    assert_eq!(mock.memory.read_u32(0x2000), 0xdead);
    assert_eq!(mock.harts[0].steps, 1);
    assert_eq!(mock.harts[0].triggers[0].tdata2, 0x2001);
    assert_ne!(mock.harts[0].triggers[0].tdata1 & 0b010, 0);

    Ok(())
}

#[test]
fn aligned_watchpoint_covers_the_whole_range() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.memory.write_program(0x1000, &[SW_A1_A0, SPIN]);
    mock.harts[0].set_register(A0, 0x2004);
    mock.harts[0].set_register(A1, 0xdead);
    let mut session = session(mock);

    let id = session
        .hart(0)?
        .add_watchpoint(0x2000, 8, WatchKind::Write, None)?;

    {
        let triggers = &session.interface().harts[0].triggers;
        assert_eq!(match_type(triggers[0].tdata1), 1);
        assert_eq!(triggers[0].tdata2, 0x2003);
        assert_eq!(triggers[1].tdata1 & 0b111, 0);
    }

    session.resume(0, ResumeAt::Address(0x1000), false)?;
    session.poll()?;

    let mut hart = session.hart(0)?;
    assert_eq!(hart.debug_reason(), DebugReason::Watchpoint);
    assert_eq!(hart.last_trigger_hit(), Some(id));
    assert_eq!(hart.read_pc()?, 0x1000);

    Ok(())
}

#[test]
fn unaligned_watchpoint_takes_a_bounded_pair() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.memory
        .write_program(0x1000, &[SW_A1_A0, SW_A1_8_A0, SW_A1_4_A0, SPIN]);
    mock.harts[0].set_register(A0, 0x2000);
    mock.harts[0].set_register(A1, 0x1111);
    let mut session = session(mock);

    let id = session
        .hart(0)?
        .add_watchpoint(0x2002, 6, WatchKind::Write, None)?;

    {
        let triggers = &session.interface().harts[0].triggers;
        assert_eq!(match_type(triggers[0].tdata1), 2);
        assert_eq!(triggers[0].tdata2, 0x2002);
        assert_ne!(triggers[0].tdata1 & MCONTROL_CHAIN, 0);
        assert_eq!(match_type(triggers[1].tdata1), 3);
        assert_eq!(triggers[1].tdata2, 0x2008);
        assert_eq!(triggers[1].tdata1 & MCONTROL_CHAIN, 0);
    }

    // Stores to 0x2000 and 0x2008 miss, the one to 0x2004 hits.
    session.resume(0, ResumeAt::Address(0x1000), false)?;
    session.poll()?;

    let mut hart = session.hart(0)?;
    assert_eq!(hart.debug_reason(), DebugReason::Watchpoint);
    assert_eq!(hart.last_trigger_hit(), Some(id));
    assert_eq!(hart.read_pc()?, 0x1008);
    assert_eq!(session.interface().memory.read_u32(0x2000), 0x1111);
    assert_eq!(session.interface().memory.read_u32(0x2008), 0x1111);
    assert_eq!(session.interface().memory.read_u32(0x2004), 0);

    Ok(())
}

#[test]
fn range_falls_back_to_the_start_address() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    for trigger in &mut mock.harts[0].triggers {
        trigger.match_types = 0b0001;
    }
    let mut session = session(mock);

    session
        .hart(0)?
        .add_watchpoint(0x2000, 8, WatchKind::Write, None)?;

    let triggers = &session.interface().harts[0].triggers;
    assert_eq!(match_type(triggers[0].tdata1), 0);
    assert_eq!(triggers[0].tdata2, 0x2000);
    assert_ne!(triggers[0].tdata1 & 0b010, 0);
    for trigger in &triggers[1..] {
        assert_eq!(trigger.tdata1 & 0b111, 0);
    }

    Ok(())
}

#[test]
fn data_watchpoint_fires_on_the_matching_value_only() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.memory
        .write_program(0x1000, &[SW_A1_A0, SW_A2_A0, SPIN]);
    mock.harts[0].set_register(A0, 0x2000);
    mock.harts[0].set_register(A1, 0x1234);
    mock.harts[0].set_register(A2, 0xbeef);
    let mut session = session(mock);

    let id = session.hart(0)?.add_watchpoint(
        0x2000,
        4,
        WatchKind::Write,
        Some(DataCondition {
            value: 0xbeef,
            mask: 0xffff_ffff,
        }),
    )?;

    {
        let triggers = &session.interface().harts[0].triggers;
        assert_eq!(triggers[0].tdata2, 0x2000);
        assert_eq!(triggers[1].tdata2, 0xbeef);
        assert_ne!(triggers[1].tdata1 & MCONTROL_SELECT, 0);
    }

    session.resume(0, ResumeAt::Address(0x1000), false)?;
    session.poll()?;

    let mut hart = session.hart(0)?;
    assert_eq!(hart.debug_reason(), DebugReason::Watchpoint);
    assert_eq!(hart.last_trigger_hit(), Some(id));
    assert_eq!(hart.read_pc()?, 0x1004);
    assert_eq!(session.interface().memory.read_u32(0x2000), 0x1234);

    Ok(())
}

#[test]
fn partially_masked_values_are_unsupported() -> Result<(), Error> {
    let mut session = session(MockDebugModule::new(1, 32));
    let mut hart = session.hart(0)?;

    let result = hart.add_watchpoint(
        0x2000,
        4,
        WatchKind::Write,
        Some(DataCondition {
            value: 0xbeef,
            mask: 0xffff,
        }),
    );

    assert!(matches!(result, Err(Error::Unsupported(_))));
    assert!(hart.watchpoints().is_empty());

    Ok(())
}

#[test]
fn legacy_triggers_cannot_match_values() -> Result<(), Error> {
    let mut mock = MockDebugModule::new(1, 32);
    mock.harts[0].triggers = (0..4).map(|_| MockTrigger::new(1, 32)).collect();
    let mut session = session(mock);
    let mut hart = session.hart(0)?;

    let condition = DataCondition {
        value: 0xbeef,
        mask: 0xffff_ffff,
    };
    let result = hart.add_watchpoint(0x2000, 4, WatchKind::Write, Some(condition));
    assert!(matches!(result, Err(Error::Unsupported(_))));

    // Plain address watchpoints still work on legacy triggers.
    hart.add_watchpoint(0x2000, 4, WatchKind::Read, None)?;
    assert_eq!(session.interface().harts[0].triggers[0].tdata2, 0x2000);

    Ok(())
}

#[test]
fn unknown_ids_are_reported() -> Result<(), Error> {
    let mut session = session(MockDebugModule::new(1, 32));
    let mut hart = session.hart(0)?;

    assert!(matches!(
        hart.remove_breakpoint(7),
        Err(Error::BreakpointNotFound {
            hart: 0,
            unique_id: 7
        })
    ));
    assert!(matches!(
        hart.remove_watchpoint(7),
        Err(Error::WatchpointNotFound {
            hart: 0,
            unique_id: 7
        })
    ));

    Ok(())
}
