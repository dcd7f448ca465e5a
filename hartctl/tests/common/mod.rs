#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use hartctl::mock::MockDebugModule;
use hartctl::{EngineConfig, HartEvent, HartId, Session};

/// `sw a1, 0(a0)`
pub const SW_A1_A0: u32 = 0x00b5_2023;
/// `sw a2, 0(a0)`
pub const SW_A2_A0: u32 = 0x00c5_2023;
/// `addi a0, a0, 1`
pub const ADDI_A0_1: u32 = 0x0015_0513;

pub fn session(mock: MockDebugModule) -> Session<MockDebugModule> {
    session_with(mock, EngineConfig::default())
}

pub fn session_with(mock: MockDebugModule, config: EngineConfig) -> Session<MockDebugModule> {
    Session::new(mock, config).expect("Failed to create a session on the mock debug module.")
}

pub fn smp_config(harts: &[HartId]) -> EngineConfig {
    let yaml = format!("smp: {{ harts: {harts:?} }}");
    EngineConfig::from_yaml(&yaml).expect("Failed to parse the SMP configuration.")
}

/// Records every event the session emits.
pub fn record_events(session: &mut Session<MockDebugModule>) -> Rc<RefCell<Vec<(HartId, HartEvent)>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    session.on_event(move |hart, event| sink.borrow_mut().push((hart, event)));
    events
}
