//! Outbound command dispatch toward connected peripherals.
//!
//! Two shapes of traffic. Behavior invocations are queued per event; when
//! the queue is full the oldest entry is evicted and the send retried
//! exactly once. Layout, indicator and layer updates are latest-value:
//! an atomic cell holds the current value and a signal wakes the
//! dispatcher, so redundant updates collapse into one write.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use embassy_futures::select::{select, select4, Either, Either4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;
use heapless::String;

use crate::config::{BEHAVIOR_DEV_MAX, BEHAVIOR_QUEUE_SIZE, RUN_BEHAVIOR_PAYLOAD_LEN};
use crate::error::Error;
use crate::event::{BehaviorBinding, BehaviorEvent, Event, EventSink, SplitPeripheralLayerChanged};
use crate::slot::{SlotRegistry, SplitChar};
use crate::transport::{ConnParams, SecurityLevel, Transport};

/// A behavior run request bound for one peripheral.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BehaviorInvocation {
    /// Destination slot.
    pub slot: u8,
    pub param1: u32,
    pub param2: u32,
    pub position: u32,
    /// Source id of the originating event.
    pub source: u8,
    pub pressed: bool,
    pub behavior_dev: String<BEHAVIOR_DEV_MAX>,
}

impl BehaviorInvocation {
    pub fn new(slot: u8, binding: &BehaviorBinding, event: BehaviorEvent, pressed: bool) -> Self {
        let mut behavior_dev = String::new();
        for c in binding.behavior_dev.chars() {
            if behavior_dev.push(c).is_err() {
                warn!("Truncating behavior label to {} bytes", BEHAVIOR_DEV_MAX);
                break;
            }
        }
        Self {
            slot,
            param1: binding.param1,
            param2: binding.param2,
            position: event.position,
            source: event.source,
            pressed,
            behavior_dev,
        }
    }

    /// Wire encoding: param1 | param2 | position | source | pressed,
    /// then the behavior label zero-padded to its capacity. Little-endian
    /// throughout. Returns 0 when `buf` is too small.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        if buf.len() < RUN_BEHAVIOR_PAYLOAD_LEN {
            return 0;
        }
        buf[0..4].copy_from_slice(&self.param1.to_le_bytes());
        buf[4..8].copy_from_slice(&self.param2.to_le_bytes());
        buf[8..12].copy_from_slice(&self.position.to_le_bytes());
        buf[12] = self.source;
        buf[13] = self.pressed as u8;
        let label = self.behavior_dev.as_bytes();
        buf[14..14 + label.len()].copy_from_slice(label);
        buf[14 + label.len()..RUN_BEHAVIOR_PAYLOAD_LEN].fill(0);
        RUN_BEHAVIOR_PAYLOAD_LEN
    }
}

type BehaviorQueue = Channel<CriticalSectionRawMutex, BehaviorInvocation, BEHAVIOR_QUEUE_SIZE>;

/// Shared dispatcher state: the behavior queue plus latest-value cells
/// and their wakeup signals.
pub struct DispatchState {
    behaviors: BehaviorQueue,
    layout: AtomicU8,
    layout_pending: Signal<CriticalSectionRawMutex, ()>,
    indicators: AtomicU8,
    indicators_pending: Signal<CriticalSectionRawMutex, ()>,
    layers: AtomicU32,
    layers_pending: Signal<CriticalSectionRawMutex, ()>,
    conn_params_pending: Signal<CriticalSectionRawMutex, ConnParams>,
}

impl DispatchState {
    pub const fn new() -> Self {
        Self {
            behaviors: Channel::new(),
            layout: AtomicU8::new(0),
            layout_pending: Signal::new(),
            indicators: AtomicU8::new(0),
            indicators_pending: Signal::new(),
            layers: AtomicU32::new(0),
            layers_pending: Signal::new(),
            conn_params_pending: Signal::new(),
        }
    }

    /// Queue a behavior invocation. When the queue is full the oldest
    /// entry is evicted and the send retried once.
    pub fn enqueue_behavior(&self, invocation: BehaviorInvocation) -> Result<(), Error> {
        match self.behaviors.try_send(invocation) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(invocation)) => {
                warn!("Behavior queue full, evicting oldest invocation");
                let _ = self.behaviors.try_receive();
                self.behaviors
                    .try_send(invocation)
                    .map_err(|_| Error::QueueFull)
            }
        }
    }

    /// Record the active layout and wake the dispatcher.
    pub fn set_selected_layout(&self, layout: u8) {
        self.layout.store(layout, Ordering::Relaxed);
        self.layout_pending.signal(());
    }

    /// Re-send the cached layout (fresh handles, or security came up).
    pub fn request_layout_broadcast(&self) {
        self.layout_pending.signal(());
    }

    /// True while a layout broadcast is waiting for the dispatcher.
    pub fn layout_broadcast_pending(&self) -> bool {
        self.layout_pending.signaled()
    }

    #[cfg(feature = "indicators")]
    pub fn set_hid_indicators(&self, indicators: u8) {
        self.indicators.store(indicators, Ordering::Relaxed);
        self.indicators_pending.signal(());
    }

    pub fn set_layers(&self, layers: u32) {
        self.layers.store(layers, Ordering::Relaxed);
        self.layers_pending.signal(());
    }

    /// Ask for new connection parameters on every established link.
    pub fn set_conn_params(&self, params: ConnParams) {
        self.conn_params_pending.signal(params);
    }
}

/// Dispatcher task body: drains the behavior queue and answers the
/// latest-value wakeups.
pub async fn run_dispatcher<T: Transport, S: EventSink>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    state: &DispatchState,
    sink: &S,
) -> ! {
    loop {
        match select(
            select4(
                state.behaviors.receive(),
                state.layout_pending.wait(),
                state.layers_pending.wait(),
                state.indicators_pending.wait(),
            ),
            state.conn_params_pending.wait(),
        )
        .await
        {
            Either::First(Either4::First(invocation)) => {
                send_behavior(transport, registry, invocation).await
            }
            Either::First(Either4::Second(())) => broadcast_layout(transport, registry, state).await,
            Either::First(Either4::Third(())) => {
                broadcast_layers(transport, registry, state, sink).await
            }
            Either::First(Either4::Fourth(())) => {
                broadcast_indicators(transport, registry, state).await
            }
            Either::Second(params) => apply_conn_params(transport, registry, &params).await,
        }
    }
}

/// Process everything currently pending without waiting. Deterministic
/// entry point for tests and single-threaded embedders.
pub async fn flush<T: Transport, S: EventSink>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    state: &DispatchState,
    sink: &S,
) {
    while let Ok(invocation) = state.behaviors.try_receive() {
        send_behavior(transport, registry, invocation).await;
    }
    if state.layout_pending.try_take().is_some() {
        broadcast_layout(transport, registry, state).await;
    }
    if state.layers_pending.try_take().is_some() {
        broadcast_layers(transport, registry, state, sink).await;
    }
    if state.indicators_pending.try_take().is_some() {
        broadcast_indicators(transport, registry, state).await;
    }
    if let Some(params) = state.conn_params_pending.try_take() {
        apply_conn_params(transport, registry, &params).await;
    }
}

async fn send_behavior<T: Transport>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    invocation: BehaviorInvocation,
) {
    let (link, handle) = match registry.write_target(invocation.slot as usize, SplitChar::RunBehavior)
    {
        Ok(target) => target,
        Err(Error::NotConnected) => {
            warn!(
                "Slot {}: not connected, dropping behavior invocation",
                invocation.slot
            );
            return;
        }
        Err(Error::NotYetReady) => {
            warn!("Slot {}: behavior handle not discovered yet", invocation.slot);
            return;
        }
        Err(_) => return,
    };
    let mut buf = [0u8; RUN_BEHAVIOR_PAYLOAD_LEN];
    let len = invocation.encode(&mut buf);
    if transport
        .write_without_response(&link, handle, &buf[..len])
        .await
        .is_err()
    {
        error!("Slot {}: behavior write failed", invocation.slot);
    }
}

async fn broadcast_layout<T: Transport>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    state: &DispatchState,
) {
    let layout = state.layout.load(Ordering::Relaxed);
    for (index, link, handle) in registry.write_targets(SplitChar::SelectedLayout) {
        if transport.security_level(&link) < SecurityLevel::Encrypted {
            // Re-fired from the security-changed handler once encryption is up.
            debug!("Slot {}: deferring layout write until link is encrypted", index);
            continue;
        }
        if transport
            .write_without_response(&link, handle, &[layout])
            .await
            .is_err()
        {
            error!("Slot {}: layout write failed", index);
        }
    }
}

async fn broadcast_layers<T: Transport, S: EventSink>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    state: &DispatchState,
    sink: &S,
) {
    let layers = state.layers.load(Ordering::Relaxed);
    let mut delivered = false;
    for (index, link, handle) in registry.write_targets(SplitChar::UpdateLayers) {
        match transport
            .write_without_response(&link, handle, &layers.to_le_bytes())
            .await
        {
            Ok(()) => delivered = true,
            Err(_) => error!("Slot {}: layer state write failed", index),
        }
    }
    if delivered {
        sink.publish(Event::SplitPeripheralLayerChanged(
            SplitPeripheralLayerChanged { layers },
        ));
    }
}

async fn broadcast_indicators<T: Transport>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    state: &DispatchState,
) {
    let indicators = state.indicators.load(Ordering::Relaxed);
    for (index, link, handle) in registry.write_targets(SplitChar::HidIndicators) {
        if transport
            .write_without_response(&link, handle, &[indicators])
            .await
            .is_err()
        {
            error!("Slot {}: indicator write failed", index);
        }
    }
}

async fn apply_conn_params<T: Transport>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    params: &ConnParams,
) {
    for link in registry.links() {
        if transport.update_conn_params(&link, params).await.is_err() {
            warn!("Connection parameter update failed");
        }
    }
}
