//! Hardware trigger allocation.
//!
//! A hart has a small number of trigger slots, selected through `tselect` and
//! configured through `tdata1`/`tdata2`. Three mutually incompatible `tdata1`
//! layouts exist: the legacy breakpoint control (type 1), `mcontrol` (type 2)
//! and `mcontrol6` (type 6). Slots are configured one at a time and read back,
//! since every field is WARL and an implementation may silently drop features
//! it does not support.

use bitfield::bitfield;

use crate::interface::HartDebugOps;
use crate::registers::{Misa, TDATA1, TDATA2, TINFO, TSELECT};
use crate::{Error, Hart};

/// The architectural limit is much higher, no implementation comes close.
const MAX_TRIGGERS: usize = 32;

/// Action value for "enter debug mode".
const ACTION_DEBUG_MODE: u64 = 1;

/// The `tdata1` layouts the engine knows how to program.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerType {
    /// Legacy breakpoint control, type 1.
    Legacy,
    /// Address/data match trigger, type 2.
    Mcontrol,
    /// Address/data match trigger with virtualization support, type 6.
    Mcontrol6,
}

impl TriggerType {
    /// Preferred layouts first.
    const PREFERENCE: [TriggerType; 3] = [
        TriggerType::Mcontrol6,
        TriggerType::Mcontrol,
        TriggerType::Legacy,
    ];

    fn code(self) -> u64 {
        match self {
            TriggerType::Legacy => 1,
            TriggerType::Mcontrol => 2,
            TriggerType::Mcontrol6 => 6,
        }
    }

    fn supports_chaining(self) -> bool {
        !matches!(self, TriggerType::Legacy)
    }

    /// Legacy triggers only compare for equality.
    fn supports(self, slot: SlotMatch) -> bool {
        match self {
            TriggerType::Legacy => slot.match_type == MatchType::Equal && !slot.data,
            _ => true,
        }
    }
}

/// Position of the xlen dependent fields of `tdata1`.
#[derive(Debug, Copy, Clone)]
struct Tdata1Layout {
    xlen: u32,
}

impl Tdata1Layout {
    fn type_of(self, tdata1: u64) -> u64 {
        (tdata1 >> (self.xlen - 4)) & 0xf
    }

    fn with_type(self, tdata1: u64, code: u64) -> u64 {
        (tdata1 & !(0xf << (self.xlen - 4))) | code << (self.xlen - 4)
    }

    fn dmode_bit(self) -> u64 {
        1 << (self.xlen - 5)
    }

    /// `mcontrol.maskmax` is read only, it is ignored when verifying a write.
    fn maskmax_bits(self) -> u64 {
        0x3f << (self.xlen - 11)
    }
}

bitfield! {
    /// Legacy breakpoint control, the low bits of a type 1 `tdata1`.
    #[derive(Copy, Clone)]
    pub struct BpControl(u64);
    impl Debug;

    pub bpaction, set_bpaction: 18, 11;
    pub bpmatch, set_bpmatch: 10, 7;
    pub m, set_m: 6;
    pub h, set_h: 5;
    pub s, set_s: 4;
    pub u, set_u: 3;
    pub r, set_r: 2;
    pub w, set_w: 1;
    pub x, set_x: 0;
}

bitfield! {
    /// The low bits of a type 2 `tdata1`.
    #[derive(Copy, Clone)]
    pub struct Mcontrol(u64);
    impl Debug;

    pub hit, set_hit: 20;
    pub select, set_select: 19;
    pub timing, set_timing: 18;
    pub action, set_action: 15, 12;
    pub chain, set_chain: 11;
    pub match_type, set_match_type: 10, 7;
    pub m, set_m: 6;
    pub s, set_s: 4;
    pub u, set_u: 3;
    pub execute, set_execute: 2;
    pub store, set_store: 1;
    pub load, set_load: 0;
}

bitfield! {
    /// The low bits of a type 6 `tdata1`.
    #[derive(Copy, Clone)]
    pub struct Mcontrol6(u64);
    impl Debug;

    pub vs, set_vs: 24;
    pub vu, set_vu: 23;
    pub hit, set_hit: 22;
    pub select, set_select: 21;
    pub size, set_size: 18, 16;
    pub action, set_action: 15, 12;
    pub chain, set_chain: 11;
    pub match_type, set_match_type: 10, 7;
    pub m, set_m: 6;
    pub s, set_s: 4;
    pub u, set_u: 3;
    pub execute, set_execute: 2;
    pub store, set_store: 1;
    pub load, set_load: 0;
}

/// What a breakpoint or watchpoint needs from a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriggerRequest {
    pub unique_id: u32,
    pub address: u64,
    /// Bytes covered, starting at `address`.
    pub length: u64,
    pub execute: bool,
    pub read: bool,
    pub write: bool,
    /// Only fire when the accessed data equals this value.
    pub data_value: Option<u64>,
}

impl TriggerRequest {
    /// Load/store requests covering more than one byte.
    fn is_range(&self) -> bool {
        !self.execute && self.length > 1
    }

    /// `tdata2` of a NAPOT match covering the request, if its length is a
    /// power of two and the address is aligned to it.
    fn napot_tdata2(&self) -> Option<u64> {
        if self.length < 2 || !self.length.is_power_of_two() || self.address % self.length != 0 {
            return None;
        }

        Some(self.address | ((self.length - 1) >> 1))
    }
}

/// The `match` field of `mcontrol` and `mcontrol6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchType {
    Equal = 0,
    /// Naturally aligned power of two range, encoded in the low bits of `tdata2`.
    Napot = 1,
    GreaterOrEqual = 2,
    Less = 3,
}

/// How one slot of a request compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotMatch {
    match_type: MatchType,
    /// Compare the accessed data instead of the address.
    data: bool,
    tdata2: u64,
}

impl SlotMatch {
    fn address(match_type: MatchType, tdata2: u64) -> Self {
        Self {
            match_type,
            data: false,
            tdata2,
        }
    }

    fn data(value: u64) -> Self {
        Self {
            match_type: MatchType::Equal,
            data: true,
            tdata2: value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TriggerSlot {
    /// Supported types as a `tinfo` style bit mask.
    supported: u64,
    owner: Option<u32>,
}

/// The trigger slots of a hart and who owns them.
#[derive(Debug, Default)]
pub struct TriggerUnits {
    enumerated: bool,
    cleaned_up: bool,
    manually_configured: bool,
    slots: Vec<TriggerSlot>,
}

impl TriggerUnits {
    /// A raw write to the trigger registers happened, the slot list has to be
    /// learned again before the next allocation. Armed slots are no longer
    /// considered stale from then on.
    pub(crate) fn mark_manually_configured(&mut self) {
        self.manually_configured = true;
        self.enumerated = false;
        self.cleaned_up = true;
    }

    /// Forget everything, e.g. after the hart was reset.
    pub(crate) fn reset(&mut self) {
        *self = TriggerUnits::default();
    }

    fn owned_slots(&self, unique_id: u32) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.owner == Some(unique_id))
            .map(|(index, _)| index)
            .collect()
    }
}

/// Triggers taken out of service around a single step.
#[derive(Debug)]
pub(crate) enum DisabledTriggers {
    /// Raw `tdata1` values of manually configured slots.
    Manual(Vec<(usize, u64)>),
    /// Watchpoints whose triggers were released.
    Watchpoints(Vec<u32>),
}

fn in_use(layout: Tdata1Layout, tdata1: u64) -> bool {
    match layout.type_of(tdata1) {
        0 | 15 => false,
        // The execute/store/load (x/w/r) enables share bits 2:0 in all three layouts.
        1 | 2 | 6 => tdata1 & 0b111 != 0,
        _ => true,
    }
}

fn encode(
    kind: TriggerType,
    layout: Tdata1Layout,
    misa: Misa,
    request: &TriggerRequest,
    slot: SlotMatch,
    chain: bool,
) -> u64 {
    let supervisor = misa.has_extension('S');
    let user = misa.has_extension('U');

    let low = match kind {
        TriggerType::Legacy => {
            let mut control = BpControl(0);
            control.set_x(request.execute);
            control.set_w(request.write);
            control.set_r(request.read);
            control.set_m(true);
            control.set_h(misa.has_extension('H'));
            control.set_s(supervisor);
            control.set_u(user);
            control.set_bpmatch(0);
            control.set_bpaction(ACTION_DEBUG_MODE);
            control.0
        }
        TriggerType::Mcontrol => {
            let mut control = Mcontrol(0);
            control.set_action(ACTION_DEBUG_MODE);
            control.set_match_type(slot.match_type as u64);
            control.set_chain(chain);
            control.set_select(slot.data);
            control.set_m(true);
            control.set_s(supervisor);
            control.set_u(user);
            control.set_execute(request.execute);
            control.set_store(request.write);
            control.set_load(request.read);
            control.0
        }
        TriggerType::Mcontrol6 => {
            let mut control = Mcontrol6(0);
            control.set_action(ACTION_DEBUG_MODE);
            control.set_match_type(slot.match_type as u64);
            control.set_chain(chain);
            control.set_select(slot.data);
            control.set_m(true);
            control.set_s(supervisor);
            control.set_u(user);
            control.set_execute(request.execute);
            control.set_store(request.write);
            control.set_load(request.read);
            control.0
        }
    };

    let tdata1 = layout.with_type(low, kind.code());
    match kind {
        TriggerType::Legacy => tdata1,
        _ => tdata1 | layout.dmode_bit(),
    }
}

fn hit_bit(kind: u64) -> Option<u64> {
    match kind {
        2 => Some(1 << 20),
        6 => Some(1 << 22),
        _ => None,
    }
}

impl<'s, D: HartDebugOps> Hart<'s, D> {
    fn layout(&mut self) -> Result<Tdata1Layout, Error> {
        Ok(Tdata1Layout { xlen: self.xlen()? })
    }

    /// The number of trigger slots, learning them first if necessary.
    pub fn trigger_count(&mut self) -> Result<usize, Error> {
        self.enumerate_triggers()
    }

    /// Learns the trigger slots of the hart.
    ///
    /// Triggers still armed in debug mode by an earlier, killed session are
    /// cleared the first time this runs. Ownership of slots survives a
    /// re-enumeration.
    pub(crate) fn enumerate_triggers(&mut self) -> Result<usize, Error> {
        if self.state.triggers.enumerated {
            return Ok(self.state.triggers.slots.len());
        }

        let layout = self.layout()?;

        let saved_tselect = match self.read_register(TSELECT) {
            Ok(value) => value,
            Err(error) => {
                tracing::info!(
                    "hart {}: tselect is not readable, assuming no triggers ({})",
                    self.state.id,
                    error
                );
                self.state.triggers.slots.clear();
                self.state.triggers.enumerated = true;
                return Ok(0);
            }
        };

        let clean_up = !self.state.triggers.cleaned_up;
        let mut slots = Vec::new();

        for index in 0..MAX_TRIGGERS {
            self.write_register_internal(TSELECT, index as u64)?;
            if self.read_register(TSELECT)? != index as u64 {
                break;
            }

            let tdata1 = self.read_register(TDATA1)?;

            let supported = match self.read_register(TINFO) {
                // A tinfo of 1 lists only type 0: no trigger at this index.
                Ok(tinfo) if tinfo & 0xffff <= 1 => break,
                Ok(tinfo) => tinfo & 0xffff,
                Err(_) => match layout.type_of(tdata1) {
                    0 => break,
                    kind => 1 << kind,
                },
            };

            if clean_up && tdata1 & layout.dmode_bit() != 0 && in_use(layout, tdata1) {
                tracing::debug!(
                    "hart {}: clearing stale trigger {} ({:#x})",
                    self.state.id,
                    index,
                    tdata1
                );
                self.write_register_internal(TDATA1, 0)?;
            }

            let owner = self
                .state
                .triggers
                .slots
                .get(index)
                .and_then(|slot| slot.owner);
            slots.push(TriggerSlot { supported, owner });
        }

        self.write_register_internal(TSELECT, saved_tselect)?;

        tracing::info!("hart {}: found {} triggers", self.state.id, slots.len());

        let triggers = &mut self.state.triggers;
        triggers.slots = slots;
        triggers.enumerated = true;
        triggers.cleaned_up = true;

        Ok(triggers.slots.len())
    }

    /// Claims trigger slots for `request`.
    ///
    /// `tselect` is restored afterwards, whatever the outcome.
    pub(crate) fn add_trigger(&mut self, request: &TriggerRequest) -> Result<(), Error> {
        self.enumerate_triggers()?;

        let saved_tselect = self.read_register(TSELECT)?;
        let result = if request.data_value.is_some() {
            self.add_data_trigger(request)
        } else if request.is_range() {
            self.add_range_trigger(request)
        } else {
            self.add_single_trigger(
                request,
                SlotMatch::address(MatchType::Equal, request.address),
            )
        };
        self.write_register_internal(TSELECT, saved_tselect)?;

        result
    }

    fn add_single_trigger(&mut self, request: &TriggerRequest, slot: SlotMatch) -> Result<(), Error> {
        for index in 0..self.state.triggers.slots.len() {
            if self.state.triggers.slots[index].owner.is_some() {
                continue;
            }

            for kind in TriggerType::PREFERENCE {
                if !kind.supports(slot) {
                    continue;
                }

                if self.try_configure(index, kind, request, slot, false)? {
                    self.state.triggers.slots[index].owner = Some(request.unique_id);

                    tracing::debug!(
                        "hart {}: trigger {} ({:?}, {:?}) now owned by {}",
                        self.state.id,
                        index,
                        kind,
                        slot.match_type,
                        request.unique_id
                    );
                    return Ok(());
                }
            }
        }

        Err(Error::ResourceExhausted {
            hart: self.state.id,
            address: request.address,
        })
    }

    /// Programs two adjacent free slots, the first one chained to the second.
    ///
    /// Returns `false` if no pair of slots accepts the configuration.
    fn add_trigger_pair(
        &mut self,
        request: &TriggerRequest,
        first: SlotMatch,
        second: SlotMatch,
    ) -> Result<bool, Error> {
        let count = self.state.triggers.slots.len();

        for index in 0..count.saturating_sub(1) {
            let next = index + 1;
            if self.state.triggers.slots[index].owner.is_some()
                || self.state.triggers.slots[next].owner.is_some()
            {
                continue;
            }

            for kind in TriggerType::PREFERENCE {
                if !kind.supports_chaining() {
                    continue;
                }

                if !self.try_configure(index, kind, request, first, true)? {
                    continue;
                }

                if self.try_configure(next, kind, request, second, false)? {
                    self.state.triggers.slots[index].owner = Some(request.unique_id);
                    self.state.triggers.slots[next].owner = Some(request.unique_id);

                    tracing::debug!(
                        "hart {}: triggers {} and {} ({:?}) chained for {}",
                        self.state.id,
                        index,
                        next,
                        kind,
                        request.unique_id
                    );
                    return Ok(true);
                }

                self.write_register_internal(TSELECT, index as u64)?;
                self.write_register_internal(TDATA1, 0)?;
            }
        }

        Ok(false)
    }

    /// Data value matches need an address slot chained to a data slot.
    fn add_data_trigger(&mut self, request: &TriggerRequest) -> Result<(), Error> {
        let Some(value) = request.data_value else {
            return self.add_single_trigger(
                request,
                SlotMatch::address(MatchType::Equal, request.address),
            );
        };

        let address = SlotMatch::address(MatchType::Equal, request.address);
        if self.add_trigger_pair(request, address, SlotMatch::data(value))? {
            return Ok(());
        }

        let chainable = 1 << TriggerType::Mcontrol.code() | 1 << TriggerType::Mcontrol6.code();
        if self
            .state
            .triggers
            .slots
            .iter()
            .any(|slot| slot.supported & chainable != 0)
        {
            Err(Error::ResourceExhausted {
                hart: self.state.id,
                address: request.address,
            })
        } else {
            Err(Error::Unsupported("data value watchpoints on these triggers"))
        }
    }

    /// Covers every byte of a load/store request if the triggers allow it.
    ///
    /// Tries a single NAPOT match, then a GE/LT pair in both orders. As a
    /// last resort only the first byte is matched.
    fn add_range_trigger(&mut self, request: &TriggerRequest) -> Result<(), Error> {
        let start = request.address;

        if let Some(tdata2) = request.napot_tdata2() {
            match self.add_single_trigger(request, SlotMatch::address(MatchType::Napot, tdata2)) {
                Err(Error::ResourceExhausted { .. }) => {}
                other => return other,
            }
        }

        if let Some(end) = start.checked_add(request.length) {
            let lower = SlotMatch::address(MatchType::GreaterOrEqual, start);
            let upper = SlotMatch::address(MatchType::Less, end);

            if self.add_trigger_pair(request, lower, upper)?
                || self.add_trigger_pair(request, upper, lower)?
            {
                return Ok(());
            }
        }

        self.add_single_trigger(request, SlotMatch::address(MatchType::Equal, start))?;

        tracing::warn!(
            "hart {}: no trigger can match {:#010x}..{:#010x}, only accesses to {:#010x} are caught",
            self.state.id,
            start,
            start.saturating_add(request.length),
            start
        );
        Ok(())
    }

    /// Programs slot `index` as `kind` and verifies the hart accepted it.
    ///
    /// Leaves the slot selected. A rejected configuration is cleared again.
    fn try_configure(
        &mut self,
        index: usize,
        kind: TriggerType,
        request: &TriggerRequest,
        slot: SlotMatch,
        chain: bool,
    ) -> Result<bool, Error> {
        if self.state.triggers.slots[index].supported & (1 << kind.code()) == 0 {
            return Ok(false);
        }

        let layout = self.layout()?;
        let misa = self.misa()?;

        self.write_register_internal(TSELECT, index as u64)?;
        let current = self.read_register(TDATA1)?;
        if in_use(layout, current) {
            tracing::debug!(
                "hart {}: trigger {} is in use ({:#x})",
                self.state.id,
                index,
                current
            );
            return Ok(false);
        }

        let tdata1 = encode(kind, layout, misa, request, slot, chain);
        self.write_register_internal(TDATA1, tdata1)?;
        let readback = self.read_register(TDATA1)?;

        let ignored = match kind {
            TriggerType::Mcontrol => layout.maskmax_bits(),
            _ => 0,
        };

        if readback & !ignored != tdata1 {
            tracing::debug!(
                "hart {}: trigger {} does not support {:#x} as {:?} (reads back {:#x})",
                self.state.id,
                index,
                tdata1,
                kind,
                readback
            );
            self.write_register_internal(TDATA1, 0)?;
            return Ok(false);
        }

        self.write_register_internal(TDATA2, slot.tdata2)?;
        Ok(true)
    }

    /// Releases every slot owned by `unique_id`.
    pub(crate) fn remove_trigger(&mut self, unique_id: u32) -> Result<(), Error> {
        let owned = self.state.triggers.owned_slots(unique_id);
        if owned.is_empty() {
            return Err(Error::TriggerNotFound {
                hart: self.state.id,
                unique_id,
            });
        }

        let saved_tselect = self.read_register(TSELECT)?;
        for index in owned {
            self.write_register_internal(TSELECT, index as u64)?;
            self.write_register_internal(TDATA1, 0)?;
            self.state.triggers.slots[index].owner = None;
        }
        self.write_register_internal(TSELECT, saved_tselect)?;

        Ok(())
    }

    /// Finds the owned slot with its hit bit set, clears the bit and returns the owner.
    pub(crate) fn take_trigger_hit(&mut self) -> Result<Option<u32>, Error> {
        if self.state.triggers.slots.iter().all(|slot| slot.owner.is_none()) {
            return Ok(None);
        }

        let layout = self.layout()?;
        let saved_tselect = self.read_register(TSELECT)?;
        let mut hit_owner = None;

        for index in 0..self.state.triggers.slots.len() {
            let Some(owner) = self.state.triggers.slots[index].owner else {
                continue;
            };

            self.write_register_internal(TSELECT, index as u64)?;
            let tdata1 = self.read_register(TDATA1)?;

            let Some(hit) = hit_bit(layout.type_of(tdata1)) else {
                continue;
            };

            if tdata1 & hit != 0 {
                self.write_register_internal(TDATA1, tdata1 & !hit)?;
                hit_owner.get_or_insert(owner);
            }
        }

        self.write_register_internal(TSELECT, saved_tselect)?;

        if let Some(owner) = hit_owner {
            tracing::debug!("hart {}: trigger of {} hit", self.state.id, owner);
        }

        Ok(hit_owner)
    }

    /// Takes triggers out of service so a step cannot fire them.
    pub(crate) fn disable_triggers(&mut self) -> Result<DisabledTriggers, Error> {
        if self.state.triggers.manually_configured {
            let count = self.enumerate_triggers()?;
            let layout = self.layout()?;
            let saved_tselect = self.read_register(TSELECT)?;

            let mut saved = Vec::new();
            for index in 0..count {
                self.write_register_internal(TSELECT, index as u64)?;
                let tdata1 = self.read_register(TDATA1)?;
                if tdata1 & layout.dmode_bit() != 0 {
                    saved.push((index, tdata1));
                    self.write_register_internal(TDATA1, 0)?;
                }
            }

            self.write_register_internal(TSELECT, saved_tselect)?;
            return Ok(DisabledTriggers::Manual(saved));
        }

        let armed: Vec<u32> = self
            .state
            .watchpoints
            .iter()
            .filter(|watchpoint| watchpoint.is_set)
            .map(|watchpoint| watchpoint.unique_id)
            .collect();

        let mut released = Vec::new();
        for unique_id in armed {
            self.unset_watchpoint(unique_id)?;
            released.push(unique_id);
        }

        Ok(DisabledTriggers::Watchpoints(released))
    }

    /// Puts triggers taken out by [`disable_triggers`](Self::disable_triggers) back.
    pub(crate) fn enable_triggers(&mut self, disabled: DisabledTriggers) -> Result<(), Error> {
        match disabled {
            DisabledTriggers::Manual(saved) => {
                let saved_tselect = self.read_register(TSELECT)?;
                for (index, tdata1) in saved {
                    self.write_register_internal(TSELECT, index as u64)?;
                    self.write_register_internal(TDATA1, tdata1)?;
                }
                self.write_register_internal(TSELECT, saved_tselect)?;
            }
            DisabledTriggers::Watchpoints(released) => {
                for unique_id in released {
                    self.set_watchpoint(unique_id)?;
                }
            }
        }

        Ok(())
    }
}
