//! Central event loop: scan/connect alternation, link lifecycle and
//! notification routing.
//!
//! Scanning and connecting never overlap. A matching advertisement
//! reserves a slot, stops the scan and starts the connection; once the
//! link is confirmed (or fails) scanning resumes while any free slot
//! remains. Inbound notifications are decoded here, in callback context,
//! and handed to the bounded queues; nothing in this module awaits a
//! full queue.

use embassy_time::Instant;

use crate::adv;
use crate::bridge::EventQueues;
use crate::config::POSITION_STATE_LEN;
use crate::discovery;
use crate::dispatch::{BehaviorInvocation, DispatchState};
use crate::error::{Error, TransportError};
use crate::event::{ActivityState, BehaviorBinding, BehaviorEvent, BondTable};
use crate::slot::{SlotRegistry, SplitChar};
#[cfg(feature = "battery")]
use crate::slot::SlotState;
use crate::transport::{
    AdvKind, AttPayload, ConnParams, LinkRole, SecurityLevel, Transport, TransportEvent,
};
use crate::uuid;

#[cfg(feature = "battery")]
use crate::bridge::{accept_battery_report, push_battery, BatteryLevels};

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// The central state machine. Owns the scanning flag; everything else is
/// shared state also reachable from the worker tasks.
pub struct Central<'d, T: Transport, B> {
    transport: &'d T,
    registry: &'d SlotRegistry<'d, T::Link>,
    queues: &'d EventQueues,
    dispatch: &'d DispatchState,
    bonds: &'d B,
    scanning: bool,
}

impl<'d, T: Transport, B: BondTable<T::Addr>> Central<'d, T, B> {
    pub fn new(
        transport: &'d T,
        registry: &'d SlotRegistry<'d, T::Link>,
        queues: &'d EventQueues,
        dispatch: &'d DispatchState,
        bonds: &'d B,
    ) -> Self {
        Self {
            transport,
            registry,
            queues,
            dispatch,
            bonds,
            scanning: false,
        }
    }

    /// Drive the link manager forever. Call [`Self::start_scanning`] first.
    pub async fn run(mut self) -> ! {
        loop {
            let event = self.transport.next_event().await;
            self.handle_event(event).await;
        }
    }

    /// Begin scanning, unless already scanning or every slot has a link.
    pub async fn start_scanning(&mut self) {
        if self.scanning {
            return;
        }
        if !self.registry.has_unlinked() {
            debug!("All slots linked, not scanning");
            return;
        }
        self.scanning = true;
        if self.transport.scan_start().await.is_err() {
            error!("Failed to start scanning");
            self.scanning = false;
        } else {
            info!("Scanning for peripherals");
        }
    }

    /// Feed one transport event through the state machine.
    pub async fn handle_event(&mut self, event: TransportEvent<T::Addr, T::Link>) {
        match event {
            TransportEvent::Advertisement { addr, kind } => {
                self.on_advertisement(addr, kind).await
            }
            TransportEvent::Connected { link, role } => self.on_connected(link, role).await,
            TransportEvent::ConnectFailed { link, role, error } => {
                self.on_connect_failed(link, role, error).await
            }
            TransportEvent::Disconnected { link, reason } => {
                self.on_disconnected(link, reason).await
            }
            TransportEvent::Notification { link, handle, data } => {
                self.on_notification(link, handle, data)
            }
            TransportEvent::SecurityChanged { link, level } => {
                self.on_security_changed(link, level)
            }
        }
    }

    async fn on_advertisement(&mut self, addr: T::Addr, kind: AdvKind) {
        let hit = match &kind {
            AdvKind::ConnectableUndirected { data } => {
                adv::lists_service_uuid(data, &uuid::SPLIT_SERVICE)
            }
            // A directed advertiser already knows us; the bond table
            // decides whether it gets a slot.
            AdvKind::Directed => true,
        };
        if hit {
            self.connect_peripheral(addr).await;
        }
    }

    async fn connect_peripheral(&mut self, addr: T::Addr) {
        let index = match self.registry.reserve(self.bonds, &addr, now_ms()) {
            Ok(index) => index,
            Err(_) => {
                debug!("No slot for advertiser, ignoring");
                return;
            }
        };

        if self.transport.scan_stop().await.is_err() {
            error!("Failed to stop scanning before connect");
            let _ = self.registry.release(index, now_ms());
            return;
        }
        self.scanning = false;

        info!("Slot {}: connecting", index);
        match self.transport.connect(&addr, &ConnParams::active()) {
            Ok(link) => self.registry.attach_link(index, link),
            Err(_) => {
                error!("Slot {}: connection create failed", index);
                let _ = self.registry.release(index, now_ms());
                self.start_scanning().await;
            }
        }
    }

    async fn on_connected(&mut self, link: T::Link, role: LinkRole) {
        if role != LinkRole::Central {
            return;
        }
        let index = match self.registry.confirm(&link) {
            Ok(index) => index,
            Err(_) => {
                warn!("Connected link does not belong to any slot");
                return;
            }
        };
        info!("Slot {}: connected", index);

        if self.registry.needs_discovery(index) {
            if let Err(_e) = discovery::run_discovery(
                self.transport,
                self.registry,
                self.dispatch,
                self.queues,
                index,
                &link,
            )
            .await
            {
                error!("Slot {}: discovery failed", index);
            }
        }
        self.start_scanning().await;
    }

    async fn on_connect_failed(&mut self, link: T::Link, role: LinkRole, _error: TransportError) {
        if role != LinkRole::Central {
            return;
        }
        if let Ok(index) = self.registry.release_link(&link, now_ms()) {
            warn!("Slot {}: connection failed", index);
        }
        self.start_scanning().await;
    }

    async fn on_disconnected(&mut self, link: T::Link, reason: u8) {
        #[cfg(feature = "battery")]
        if let Some(index) = self.registry.lookup(&link) {
            // The half is gone; report it as drained so consumers reset.
            push_battery(&self.queues.battery, index, 0);
        }
        match self.registry.release_link(&link, now_ms()) {
            Ok(index) => info!("Slot {}: disconnected (reason {})", index, reason),
            Err(_) => return,
        }
        self.start_scanning().await;
    }

    fn on_security_changed(&mut self, link: T::Link, level: SecurityLevel) {
        if level < SecurityLevel::Encrypted {
            return;
        }
        if let Some(index) = self.registry.lookup(&link) {
            let layout_known = self
                .registry
                .handles(index)
                .map_or(false, |h| h.selected_layout != 0);
            if layout_known {
                debug!("Slot {}: link encrypted, resending layout", index);
                self.dispatch.request_layout_broadcast();
            }
        }
    }

    fn on_notification(&mut self, link: T::Link, handle: u16, data: Option<AttPayload>) {
        let Some((index, kind)) = self.registry.classify_notification(&link, handle) else {
            warn!("Notification for unknown handle {}", handle);
            return;
        };
        let Some(data) = data else {
            info!(
                "Slot {}: peripheral revoked subscription on handle {}",
                index, handle
            );
            self.registry.clear_handle(index, kind);
            return;
        };
        match kind {
            SplitChar::PositionState => {
                if data.len() < POSITION_STATE_LEN {
                    warn!(
                        "Slot {}: truncated position report ({} bytes)",
                        index,
                        data.len()
                    );
                    return;
                }
                let mut bitmap = [0u8; POSITION_STATE_LEN];
                bitmap.copy_from_slice(&data[..POSITION_STATE_LEN]);
                self.registry.handle_position_report(index, &bitmap, now_ms());
            }
            #[cfg(feature = "sensors")]
            SplitChar::SensorState => {
                crate::bridge::accept_sensor_report(&self.queues.sensor, index, &data, now_ms())
            }
            #[cfg(feature = "battery")]
            SplitChar::BatteryLevel => accept_battery_report(&self.queues.battery, index, &data),
            _ => {}
        }
    }
}

/// Outward-facing operations, callable from any task.
pub struct SplitApi<'d, L> {
    registry: &'d SlotRegistry<'d, L>,
    dispatch: &'d DispatchState,
    #[cfg(feature = "battery")]
    battery: &'d BatteryLevels,
}

impl<'d, L: Clone + PartialEq> SplitApi<'d, L> {
    pub fn new(
        registry: &'d SlotRegistry<'d, L>,
        dispatch: &'d DispatchState,
        #[cfg(feature = "battery")] battery: &'d BatteryLevels,
    ) -> Self {
        Self {
            registry,
            dispatch,
            #[cfg(feature = "battery")]
            battery,
        }
    }

    /// Queue a behavior invocation for `slot`.
    pub fn invoke_behavior(
        &self,
        slot: u8,
        binding: &BehaviorBinding,
        event: BehaviorEvent,
        pressed: bool,
    ) -> Result<(), Error> {
        self.dispatch
            .enqueue_behavior(BehaviorInvocation::new(slot, binding, event, pressed))
    }

    /// Push the HID indicator state (caps lock and friends) to all halves.
    #[cfg(feature = "indicators")]
    pub fn update_hid_indicators(&self, indicators: u8) {
        self.dispatch.set_hid_indicators(indicators);
    }

    /// Push the active layer bitmap to all halves.
    pub fn update_layers(&self, layers: u32) {
        self.dispatch.set_layers(layers);
    }

    /// Record a new physical layout selection and broadcast it.
    pub fn set_selected_layout(&self, layout: u8) {
        self.dispatch.set_selected_layout(layout);
    }

    /// Last reported state of charge for a connected peripheral.
    #[cfg(feature = "battery")]
    pub fn get_battery_level(&self, slot: u8) -> Result<u8, Error> {
        match self.registry.state(slot as usize) {
            None => Err(Error::InvalidState),
            Some(SlotState::Connected) => Ok(self.battery.get(slot as usize)),
            Some(_) => Err(Error::NotConnected),
        }
    }

    /// Adjust connection parameters to the reported activity state.
    pub fn update_activity(&self, state: ActivityState) {
        match state {
            ActivityState::Active => self.dispatch.set_conn_params(ConnParams::active()),
            ActivityState::Idle => self.dispatch.set_conn_params(ConnParams::idle()),
            // Nothing to relax further; links drop in deep sleep anyway.
            ActivityState::Sleep => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    use crate::mock::{split_adv_data, FakeLink, FakeTransport, SimpleBonds};
    use crate::transport::{Characteristic, ServiceHandles};

    const ADDR_A: [u8; 6] = [1, 1, 1, 1, 1, 1];
    const ADDR_B: [u8; 6] = [2, 2, 2, 2, 2, 2];

    fn chrc(uuid: crate::uuid::Uuid128, decl: u16) -> Characteristic {
        Characteristic {
            uuid,
            decl_handle: decl,
            value_handle: decl + 1,
        }
    }

    fn script_gatt(transport: &FakeTransport) {
        transport.set_gatt(
            ServiceHandles {
                attr_handle: 0x10,
                end_handle: 0x30,
            },
            &[
                chrc(uuid::POSITION_STATE, 0x11),
                chrc(uuid::RUN_BEHAVIOR, 0x13),
                chrc(uuid::SENSOR_STATE, 0x15),
                chrc(uuid::SELECTED_LAYOUT, 0x17),
                chrc(uuid::HID_INDICATORS, 0x19),
                chrc(uuid::UPDATE_LAYERS, 0x1b),
                chrc(uuid::BATTERY_LEVEL, 0x1d),
            ],
        );
        transport.set_read_value(0x1e, &[50]);
    }

    fn adv_event(addr: [u8; 6]) -> TransportEvent<[u8; 6], FakeLink> {
        TransportEvent::Advertisement {
            addr,
            kind: AdvKind::ConnectableUndirected {
                data: split_adv_data(),
            },
        }
    }

    struct Fixture {
        transport: FakeTransport,
        queues: EventQueues,
        dispatch: DispatchState,
        bonds: SimpleBonds,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = FakeTransport::new();
            script_gatt(&transport);
            Self {
                transport,
                queues: EventQueues::new(),
                dispatch: DispatchState::new(),
                bonds: SimpleBonds::new(),
            }
        }
    }

    #[test]
    fn start_scanning_is_idempotent() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.start_scanning());
        assert_eq!(f.transport.scan_starts.get(), 1);
    }

    #[test]
    fn advertisement_stops_scan_and_connects() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));

        assert_eq!(f.transport.scan_stops.get(), 1);
        assert_eq!(registry.state(0), Some(SlotState::Connecting));
    }

    #[test]
    fn non_split_advertisement_is_ignored() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        let data = crate::transport::AdvData::from_slice(&[0x02, 0x01, 0x06]).unwrap();
        block_on(central.handle_event(TransportEvent::Advertisement {
            addr: ADDR_A,
            kind: AdvKind::ConnectableUndirected { data },
        }));

        assert_eq!(f.transport.scan_stops.get(), 0);
        assert_eq!(registry.state(0), Some(SlotState::Open));
    }

    #[test]
    fn directed_advertisement_connects_without_payload() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(TransportEvent::Advertisement {
            addr: ADDR_A,
            kind: AdvKind::Directed,
        }));
        assert_eq!(registry.state(0), Some(SlotState::Connecting));
    }

    #[test]
    fn failed_connect_releases_and_rescans() {
        let f = Fixture::new();
        f.transport.fail_connect.set(true);
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));

        assert_eq!(registry.state(0), Some(SlotState::Open));
        assert_eq!(f.transport.scan_starts.get(), 2);
    }

    #[test]
    fn connect_failed_event_releases_and_rescans() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::ConnectFailed {
            link: FakeLink(0),
            role: LinkRole::Central,
            error: TransportError::ConnectFailed,
        }));

        assert_eq!(registry.state(0), Some(SlotState::Open));
        assert_eq!(f.transport.scan_starts.get(), 2);
    }

    #[test]
    fn connected_event_runs_discovery_and_rescans() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        }));

        assert_eq!(registry.state(0), Some(SlotState::Connected));
        assert_ne!(registry.handles(0).unwrap().position_state, 0);
        // Second slot is still free; scanning resumed.
        assert_eq!(f.transport.scan_starts.get(), 2);
    }

    #[test]
    fn peripheral_role_connections_are_ignored() {
        let f = Fixture::new();
        let registry: SlotRegistry<FakeLink> = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(9),
            role: LinkRole::Peripheral,
        }));
        assert_eq!(registry.lookup(&FakeLink(9)), None);
    }

    #[test]
    fn security_change_reschedules_layout() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        }));
        // Drain the broadcast request discovery itself scheduled.
        let sink = crate::mock::CollectingSink::new();
        block_on(crate::dispatch::flush(&f.transport, &registry, &f.dispatch, &sink));
        assert!(!f.dispatch.layout_broadcast_pending());

        block_on(central.handle_event(TransportEvent::SecurityChanged {
            link: FakeLink(0),
            level: SecurityLevel::Encrypted,
        }));
        assert!(f.dispatch.layout_broadcast_pending());
    }

    #[test]
    fn unsubscribe_notification_clears_the_handle() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        }));
        let position_handle = registry.handles(0).unwrap().position_state;

        block_on(central.handle_event(TransportEvent::Notification {
            link: FakeLink(0),
            handle: position_handle,
            data: None,
        }));
        assert_eq!(registry.handles(0).unwrap().position_state, 0);
    }

    #[test]
    fn truncated_position_notification_is_dropped() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        }));
        let position_handle = registry.handles(0).unwrap().position_state;

        block_on(central.handle_event(TransportEvent::Notification {
            link: FakeLink(0),
            handle: position_handle,
            data: Some(AttPayload::from_slice(&[0xFF; 4]).unwrap()),
        }));
        assert!(f.queues.position.try_receive().is_err());
        // Handle stays subscribed.
        assert_eq!(registry.handles(0).unwrap().position_state, position_handle);
    }

    #[test]
    fn queued_transport_events_drive_the_state_machine() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        f.transport.push_event(adv_event(ADDR_A));
        f.transport.push_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        });

        // Same shape as `run`: pull the next event, feed it through.
        block_on(central.start_scanning());
        while !f.transport.events.borrow().is_empty() {
            let event = block_on(f.transport.next_event());
            block_on(central.handle_event(event));
        }

        assert_eq!(registry.state(0), Some(SlotState::Connected));
        assert!(registry.handles(0).unwrap().complete());
    }

    #[test]
    fn second_half_fills_remaining_slot_then_scanning_stops() {
        let f = Fixture::new();
        let registry = SlotRegistry::new(&f.queues.position);
        let mut central = Central::new(&f.transport, &registry, &f.queues, &f.dispatch, &f.bonds);

        block_on(central.start_scanning());
        block_on(central.handle_event(adv_event(ADDR_A)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(0),
            role: LinkRole::Central,
        }));
        block_on(central.handle_event(adv_event(ADDR_B)));
        block_on(central.handle_event(TransportEvent::Connected {
            link: FakeLink(1),
            role: LinkRole::Central,
        }));

        assert_eq!(registry.state(0), Some(SlotState::Connected));
        assert_eq!(registry.state(1), Some(SlotState::Connected));
        // Two scans total: initial plus the one between the halves.
        assert_eq!(f.transport.scan_starts.get(), 2);
    }
}
