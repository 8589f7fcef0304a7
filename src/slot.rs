//! Fixed table of peripheral slots and their lifecycle operations.
//!
//! Mutations happen in BLE callback context and must stay short, so the
//! table sits behind a blocking mutex; worker-context snapshots copy what
//! they need out and tolerate one cycle of staleness. Key release events
//! synthesized while a slot is torn down go through the same bounded
//! position queue as live notifications, so downstream consumers see a
//! single ordered stream per slot.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::config::{PERIPHERAL_COUNT, POSITION_QUEUE_SIZE, POSITION_STATE_LEN};
use crate::error::Error;
use crate::event::{BondTable, PositionStateChanged};

/// Bounded queue carrying decoded position events to the publisher task.
pub type PositionQueue =
    Channel<CriticalSectionRawMutex, PositionStateChanged, POSITION_QUEUE_SIZE>;

/// Peripheral link lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// Free for the next matching advertiser.
    Open,
    /// Reserved; link establishment in flight.
    Connecting,
    /// Link established and confirmed.
    Connected,
}

/// The split-service characteristics the central tracks per slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SplitChar {
    PositionState,
    RunBehavior,
    SensorState,
    SelectedLayout,
    HidIndicators,
    UpdateLayers,
    BatteryLevel,
}

/// Discovered characteristic value handles. 0 = not yet discovered.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SplitHandles {
    pub position_state: u16,
    pub run_behavior: u16,
    pub sensor_state: u16,
    pub selected_layout: u16,
    pub hid_indicators: u16,
    pub update_layers: u16,
    pub battery_level: u16,
}

impl SplitHandles {
    pub fn get(&self, chr: SplitChar) -> u16 {
        match chr {
            SplitChar::PositionState => self.position_state,
            SplitChar::RunBehavior => self.run_behavior,
            SplitChar::SensorState => self.sensor_state,
            SplitChar::SelectedLayout => self.selected_layout,
            SplitChar::HidIndicators => self.hid_indicators,
            SplitChar::UpdateLayers => self.update_layers,
            SplitChar::BatteryLevel => self.battery_level,
        }
    }

    fn set(&mut self, chr: SplitChar, handle: u16) {
        match chr {
            SplitChar::PositionState => self.position_state = handle,
            SplitChar::RunBehavior => self.run_behavior = handle,
            SplitChar::SensorState => self.sensor_state = handle,
            SplitChar::SelectedLayout => self.selected_layout = handle,
            SplitChar::HidIndicators => self.hid_indicators = handle,
            SplitChar::UpdateLayers => self.update_layers = handle,
            SplitChar::BatteryLevel => self.battery_level = handle,
        }
    }

    /// True once every handle this build needs has been discovered.
    pub fn complete(&self) -> bool {
        let mut done = self.position_state != 0
            && self.run_behavior != 0
            && self.selected_layout != 0
            && self.update_layers != 0;
        #[cfg(feature = "sensors")]
        {
            done = done && self.sensor_state != 0;
        }
        #[cfg(feature = "battery")]
        {
            done = done && self.battery_level != 0;
        }
        #[cfg(feature = "indicators")]
        {
            done = done && self.hid_indicators != 0;
        }
        done
    }
}

struct PeripheralSlot<L> {
    state: SlotState,
    link: Option<L>,
    handles: SplitHandles,
    /// Last position bitmap received from the peripheral.
    position_state: [u8; POSITION_STATE_LEN],
    /// Scratch: bits that changed in the latest report.
    changed_positions: [u8; POSITION_STATE_LEN],
}

impl<L> PeripheralSlot<L> {
    fn new() -> Self {
        Self {
            state: SlotState::Open,
            link: None,
            handles: SplitHandles::default(),
            position_state: [0; POSITION_STATE_LEN],
            changed_positions: [0; POSITION_STATE_LEN],
        }
    }
}

/// The slot table plus the position queue it feeds.
pub struct SlotRegistry<'q, L> {
    slots: Mutex<CriticalSectionRawMutex, RefCell<[PeripheralSlot<L>; PERIPHERAL_COUNT]>>,
    positions: &'q PositionQueue,
}

impl<'q, L: Clone + PartialEq> SlotRegistry<'q, L> {
    pub fn new(positions: &'q PositionQueue) -> Self {
        Self {
            slots: Mutex::new(RefCell::new(core::array::from_fn(|_| PeripheralSlot::new()))),
            positions,
        }
    }

    /// Resolve the advertiser to its bonded slot and mark it Connecting.
    /// A slot that is somehow not Open is released first so it starts from
    /// a clean record.
    pub fn reserve<A>(
        &self,
        bonds: &impl BondTable<A>,
        addr: &A,
        timestamp: u64,
    ) -> Result<usize, Error> {
        let index = bonds.resolve(addr).ok_or(Error::NoCapacity)?;
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.get_mut(index).ok_or(Error::InvalidState)?;
            if slot.state != SlotState::Open {
                warn!("Re-reserving slot {} that was not open", index);
                Self::release_slot(self.positions, index, slot, timestamp);
            }
            slot.state = SlotState::Connecting;
            Ok(index)
        })
    }

    /// Attach the pending link produced by `connect`. A link held by
    /// another slot is refused so no link ever maps to two slots.
    pub fn attach_link(&self, index: usize, link: L) {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(holder) = Self::index_of(&slots, &link) {
                if holder != index {
                    warn!(
                        "Link already attached to slot {}, refusing attach to slot {}",
                        holder, index
                    );
                    return;
                }
            }
            if let Some(slot) = slots.get_mut(index) {
                slot.link = Some(link);
            }
        });
    }

    /// Promote the slot owning `link` to Connected.
    pub fn confirm(&self, link: &L) -> Result<usize, Error> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let index = Self::index_of(&slots, link).ok_or(Error::UnknownLink)?;
            slots[index].state = SlotState::Connected;
            Ok(index)
        })
    }

    /// Slot index owning `link`, if any.
    pub fn lookup(&self, link: &L) -> Option<usize> {
        self.slots.lock(|slots| Self::index_of(&slots.borrow(), link))
    }

    /// Tear a slot down. Fails on an Open slot so double releases are caught.
    pub fn release(&self, index: usize, timestamp: u64) -> Result<(), Error> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots.get_mut(index).ok_or(Error::InvalidState)?;
            if slot.state == SlotState::Open {
                return Err(Error::InvalidState);
            }
            Self::release_slot(self.positions, index, slot, timestamp);
            Ok(())
        })
    }

    /// Tear down the slot owning `link`.
    pub fn release_link(&self, link: &L, timestamp: u64) -> Result<usize, Error> {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let index = Self::index_of(&slots, link).ok_or(Error::UnknownLink)?;
            Self::release_slot(self.positions, index, &mut slots[index], timestamp);
            Ok(index)
        })
    }

    /// Diff an incoming position bitmap against the slot shadow and queue
    /// one event per changed bit, in ascending position order.
    pub fn handle_position_report(
        &self,
        index: usize,
        data: &[u8; POSITION_STATE_LEN],
        timestamp: u64,
    ) {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            for i in 0..POSITION_STATE_LEN {
                slot.changed_positions[i] = data[i] ^ slot.position_state[i];
                slot.position_state[i] = data[i];
            }
            for byte in 0..POSITION_STATE_LEN {
                let mut changed = slot.changed_positions[byte];
                while changed != 0 {
                    let bit = changed.trailing_zeros() as usize;
                    changed &= changed - 1;
                    let pressed = slot.position_state[byte] & (1 << bit) != 0;
                    push_position(
                        self.positions,
                        PositionStateChanged {
                            source: index as u8,
                            position: (byte * 8 + bit) as u8,
                            pressed,
                            timestamp,
                        },
                    );
                }
            }
        });
    }

    /// Record a discovered value handle. Returns true once the handle set
    /// is complete for this build.
    pub fn record_handle(&self, index: usize, chr: SplitChar, handle: u16) -> bool {
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let Some(slot) = slots.get_mut(index) else {
                return false;
            };
            slot.handles.set(chr, handle);
            slot.handles.complete()
        })
    }

    /// Forget a handle (the server revoked the subscription).
    pub fn clear_handle(&self, index: usize, chr: SplitChar) {
        self.slots.lock(|slots| {
            if let Some(slot) = slots.borrow_mut().get_mut(index) {
                slot.handles.set(chr, 0);
            }
        });
    }

    /// Map a notification to its slot and characteristic.
    pub fn classify_notification(&self, link: &L, handle: u16) -> Option<(usize, SplitChar)> {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            let index = Self::index_of(&slots, link)?;
            let handles = &slots[index].handles;
            let chr = if handle == handles.position_state {
                SplitChar::PositionState
            } else if handle == handles.sensor_state {
                SplitChar::SensorState
            } else if handle == handles.battery_level {
                SplitChar::BatteryLevel
            } else {
                return None;
            };
            Some((index, chr))
        })
    }

    /// True until the position-state handle has been discovered.
    pub fn needs_discovery(&self, index: usize) -> bool {
        self.slots.lock(|slots| {
            slots
                .borrow()
                .get(index)
                .map_or(false, |slot| slot.handles.position_state == 0)
        })
    }

    /// True while some slot still has no link attached.
    pub fn has_unlinked(&self) -> bool {
        self.slots
            .lock(|slots| slots.borrow().iter().any(|slot| slot.link.is_none()))
    }

    /// Connected slots with a discovered handle for `chr`. Slots that are
    /// not ready are skipped; they catch up on the next update.
    pub fn write_targets(&self, chr: SplitChar) -> Vec<(u8, L, u16), PERIPHERAL_COUNT> {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            let mut targets = Vec::new();
            for (index, slot) in slots.iter().enumerate() {
                if slot.state != SlotState::Connected {
                    continue;
                }
                let handle = slot.handles.get(chr);
                if handle == 0 {
                    continue;
                }
                if let Some(link) = &slot.link {
                    let _ = targets.push((index as u8, link.clone(), handle));
                }
            }
            targets
        })
    }

    /// Write target for one slot, with the reason when it is not ready.
    pub fn write_target(&self, index: usize, chr: SplitChar) -> Result<(L, u16), Error> {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            let slot = slots.get(index).ok_or(Error::InvalidState)?;
            let link = match (&slot.state, &slot.link) {
                (SlotState::Connected, Some(link)) => link.clone(),
                _ => return Err(Error::NotConnected),
            };
            let handle = slot.handles.get(chr);
            if handle == 0 {
                return Err(Error::NotYetReady);
            }
            Ok((link, handle))
        })
    }

    /// Links of all connected slots.
    pub fn links(&self) -> Vec<L, PERIPHERAL_COUNT> {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            let mut links = Vec::new();
            for slot in slots.iter() {
                if slot.state == SlotState::Connected {
                    if let Some(link) = &slot.link {
                        let _ = links.push(link.clone());
                    }
                }
            }
            links
        })
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots
            .lock(|slots| slots.borrow().get(index).map(|slot| slot.state))
    }

    pub fn handles(&self, index: usize) -> Option<SplitHandles> {
        self.slots
            .lock(|slots| slots.borrow().get(index).map(|slot| slot.handles))
    }

    fn index_of(slots: &[PeripheralSlot<L>; PERIPHERAL_COUNT], link: &L) -> Option<usize> {
        slots
            .iter()
            .position(|slot| slot.link.as_ref() == Some(link))
    }

    /// Tear-down shared by every release path. Keys still latched in the
    /// shadow go up before the record is wiped, so no key sticks across a
    /// disconnect.
    fn release_slot(
        positions: &PositionQueue,
        index: usize,
        slot: &mut PeripheralSlot<L>,
        timestamp: u64,
    ) {
        slot.state = SlotState::Open;
        slot.link = None;
        for byte in 0..POSITION_STATE_LEN {
            let mut latched = slot.position_state[byte];
            while latched != 0 {
                let bit = latched.trailing_zeros() as usize;
                latched &= latched - 1;
                push_position(
                    positions,
                    PositionStateChanged {
                        source: index as u8,
                        position: (byte * 8 + bit) as u8,
                        pressed: false,
                        timestamp,
                    },
                );
            }
        }
        slot.position_state = [0; POSITION_STATE_LEN];
        slot.changed_positions = [0; POSITION_STATE_LEN];
        slot.handles = SplitHandles::default();
    }
}

fn push_position(queue: &PositionQueue, ev: PositionStateChanged) {
    // Newest dropped on overflow; the shadow still tracks the true state.
    if queue.try_send(ev).is_err() {
        warn!("Position queue full, dropping event for position {}", ev.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneSlotBonds(usize);

    impl BondTable<u8> for OneSlotBonds {
        fn resolve(&self, _addr: &u8) -> Option<usize> {
            Some(self.0)
        }
    }

    struct NoBonds;

    impl BondTable<u8> for NoBonds {
        fn resolve(&self, _addr: &u8) -> Option<usize> {
            None
        }
    }

    fn connected_registry(queue: &PositionQueue) -> SlotRegistry<'_, u32> {
        let registry = SlotRegistry::new(queue);
        registry.reserve(&OneSlotBonds(0), &0u8, 0).unwrap();
        registry.attach_link(0, 7);
        registry.confirm(&7).unwrap();
        registry
    }

    fn bitmap(positions: &[usize]) -> [u8; POSITION_STATE_LEN] {
        let mut data = [0u8; POSITION_STATE_LEN];
        for p in positions {
            data[p / 8] |= 1 << (p % 8);
        }
        data
    }

    fn drain(queue: &PositionQueue) -> std::vec::Vec<PositionStateChanged> {
        let mut out = std::vec::Vec::new();
        while let Ok(ev) = queue.try_receive() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn reserve_without_bond_fails() {
        let queue = PositionQueue::new();
        let registry: SlotRegistry<u32> = SlotRegistry::new(&queue);
        assert_eq!(registry.reserve(&NoBonds, &0u8, 0), Err(Error::NoCapacity));
        assert_eq!(registry.state(0), Some(SlotState::Open));
    }

    #[test]
    fn lifecycle_reaches_connected_and_back() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        assert_eq!(registry.state(0), Some(SlotState::Connected));
        assert_eq!(registry.lookup(&7), Some(0));

        registry.release(0, 1).unwrap();
        assert_eq!(registry.state(0), Some(SlotState::Open));
        assert_eq!(registry.lookup(&7), None);
    }

    #[test]
    fn double_release_is_rejected() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        registry.release(0, 1).unwrap();
        assert_eq!(registry.release(0, 2), Err(Error::InvalidState));
    }

    #[test]
    fn link_is_held_by_at_most_one_slot() {
        let queue = PositionQueue::new();
        let registry: SlotRegistry<u32> = SlotRegistry::new(&queue);
        registry.reserve(&OneSlotBonds(0), &0u8, 0).unwrap();
        registry.reserve(&OneSlotBonds(1), &0u8, 0).unwrap();
        registry.attach_link(0, 7);
        registry.attach_link(1, 7);

        assert_eq!(registry.lookup(&7), Some(0));
        // Releasing the link leaves nothing behind in the other slot.
        assert_eq!(registry.release_link(&7, 1), Ok(0));
        assert_eq!(registry.lookup(&7), None);
    }

    #[test]
    fn confirm_unknown_link_is_rejected() {
        let queue = PositionQueue::new();
        let registry: SlotRegistry<u32> = SlotRegistry::new(&queue);
        assert_eq!(registry.confirm(&99), Err(Error::UnknownLink));
    }

    #[test]
    fn xor_diff_reports_press_then_release_once() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);

        registry.handle_position_report(0, &bitmap(&[0]), 10);
        registry.handle_position_report(0, &bitmap(&[0]), 11); // no change
        registry.handle_position_report(0, &bitmap(&[]), 12);

        let events = drain(&queue);
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].position, events[0].pressed), (0, true));
        assert_eq!((events[1].position, events[1].pressed), (0, false));
        assert_eq!(events[1].timestamp, 12);
    }

    #[test]
    fn release_synthesizes_release_for_each_latched_key() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);

        registry.handle_position_report(0, &bitmap(&[3, 10, 100]), 20);
        drain(&queue); // discard the presses

        registry.release(0, 21).unwrap();
        let events = drain(&queue);
        assert_eq!(events.len(), 3);
        let positions: std::vec::Vec<u8> = events.iter().map(|e| e.position).collect();
        assert_eq!(positions, [3, 10, 100]);
        assert!(events.iter().all(|e| !e.pressed && e.source == 0));
    }

    #[test]
    fn reserve_on_stale_slot_releases_it_first() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        registry.handle_position_report(0, &bitmap(&[5]), 30);
        drain(&queue);
        registry.record_handle(0, SplitChar::PositionState, 0x12);

        registry.reserve(&OneSlotBonds(0), &0u8, 31).unwrap();

        let events = drain(&queue);
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].position, events[0].pressed), (5, false));
        assert_eq!(registry.state(0), Some(SlotState::Connecting));
        assert_eq!(registry.handles(0).unwrap(), SplitHandles::default());
    }

    #[test]
    fn handles_are_zeroed_by_release() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        registry.record_handle(0, SplitChar::PositionState, 0x12);
        registry.record_handle(0, SplitChar::RunBehavior, 0x14);
        assert!(registry.handles(0).unwrap() != SplitHandles::default());

        registry.release(0, 1).unwrap();
        assert_eq!(registry.handles(0).unwrap(), SplitHandles::default());
    }

    #[test]
    fn handle_completeness_tracks_enabled_features() {
        let mut handles = SplitHandles::default();
        handles.position_state = 1;
        handles.run_behavior = 2;
        handles.selected_layout = 3;
        assert!(!handles.complete());
        handles.update_layers = 4;
        handles.sensor_state = 5;
        handles.battery_level = 6;
        handles.hid_indicators = 7;
        assert!(handles.complete());
    }

    #[test]
    fn notification_classification_uses_recorded_handles() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        registry.record_handle(0, SplitChar::PositionState, 0x12);
        registry.record_handle(0, SplitChar::BatteryLevel, 0x1e);

        assert_eq!(
            registry.classify_notification(&7, 0x12),
            Some((0, SplitChar::PositionState))
        );
        assert_eq!(
            registry.classify_notification(&7, 0x1e),
            Some((0, SplitChar::BatteryLevel))
        );
        assert_eq!(registry.classify_notification(&7, 0x55), None);
        assert_eq!(registry.classify_notification(&8, 0x12), None);
    }

    #[test]
    fn write_target_distinguishes_unready_from_disconnected() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);
        assert_eq!(
            registry.write_target(0, SplitChar::RunBehavior),
            Err(Error::NotYetReady)
        );
        registry.record_handle(0, SplitChar::RunBehavior, 0x14);
        assert_eq!(
            registry.write_target(0, SplitChar::RunBehavior),
            Ok((7, 0x14))
        );
        assert_eq!(
            registry.write_target(1, SplitChar::RunBehavior),
            Err(Error::NotConnected)
        );
    }

    #[test]
    fn position_queue_overflow_drops_newest() {
        let queue = PositionQueue::new();
        let registry = connected_registry(&queue);

        // 16 changed bits against a queue of POSITION_QUEUE_SIZE
        let mut all = [0u8; POSITION_STATE_LEN];
        all[0] = 0xFF;
        all[1] = 0xFF;
        registry.handle_position_report(0, &all, 40);

        let events = drain(&queue);
        assert_eq!(events.len(), POSITION_QUEUE_SIZE);
        // FIFO order preserved for the survivors
        assert_eq!(events[0].position, 0);
        assert_eq!(events[POSITION_QUEUE_SIZE - 1].position, POSITION_QUEUE_SIZE as u8 - 1);
    }
}
