//! GATT discovery for a freshly connected peripheral.
//!
//! One pass: find the split service, enumerate its characteristics and
//! record the value handles, then subscribe to the notify characteristics
//! and kick off the deferred layout broadcast. Enumeration stops as soon
//! as every handle this build needs has been seen.

use crate::bridge::EventQueues;
use crate::dispatch::DispatchState;
use crate::error::Error;
use crate::slot::{SlotRegistry, SplitChar};
use crate::transport::{DiscoverStep, HandleRange, SubscribeOutcome, Transport};
use crate::uuid::{self, Uuid128};

fn classify(u: &Uuid128) -> Option<SplitChar> {
    if *u == uuid::POSITION_STATE {
        return Some(SplitChar::PositionState);
    }
    if *u == uuid::RUN_BEHAVIOR {
        return Some(SplitChar::RunBehavior);
    }
    if *u == uuid::SELECTED_LAYOUT {
        return Some(SplitChar::SelectedLayout);
    }
    if *u == uuid::UPDATE_LAYERS {
        return Some(SplitChar::UpdateLayers);
    }
    #[cfg(feature = "sensors")]
    if *u == uuid::SENSOR_STATE {
        return Some(SplitChar::SensorState);
    }
    #[cfg(feature = "indicators")]
    if *u == uuid::HID_INDICATORS {
        return Some(SplitChar::HidIndicators);
    }
    #[cfg(feature = "battery")]
    if *u == uuid::BATTERY_LEVEL {
        return Some(SplitChar::BatteryLevel);
    }
    None
}

/// Discover the split service on `link` and wire the slot up.
pub async fn run_discovery<T: Transport>(
    transport: &T,
    registry: &SlotRegistry<'_, T::Link>,
    dispatch: &DispatchState,
    queues: &EventQueues,
    index: usize,
    link: &T::Link,
) -> Result<(), Error> {
    let Some(service) = transport
        .discover_primary(link, &uuid::SPLIT_SERVICE, HandleRange::full())
        .await?
    else {
        info!("Slot {}: split service not present", index);
        return Ok(());
    };
    debug!(
        "Slot {}: split service at handles {}..{}",
        index, service.attr_handle, service.end_handle
    );

    let mut layout_found = false;
    transport
        .discover_characteristics(link, service.characteristics(), &mut |chrc| {
            let Some(kind) = classify(&chrc.uuid) else {
                return DiscoverStep::Continue;
            };
            let complete = registry.record_handle(index, kind, chrc.value_handle);
            if kind == SplitChar::SelectedLayout {
                layout_found = true;
            }
            if complete {
                DiscoverStep::Stop
            } else if matches!(kind, SplitChar::RunBehavior | SplitChar::SensorState) {
                // No descriptors of interest behind these; skip past the value.
                DiscoverStep::ContinueFrom(chrc.value_handle + 1)
            } else {
                DiscoverStep::Continue
            }
        })
        .await?;

    let handles = registry.handles(index).ok_or(Error::InvalidState)?;

    if handles.position_state != 0 {
        subscribe(transport, link, index, handles.position_state).await;
    }
    #[cfg(feature = "sensors")]
    if handles.sensor_state != 0 {
        subscribe(transport, link, index, handles.sensor_state).await;
    }
    #[cfg(feature = "battery")]
    if handles.battery_level != 0 {
        subscribe(transport, link, index, handles.battery_level).await;
        // Prime the level cache; notifications only arrive on change.
        match transport.read(link, handles.battery_level).await {
            Ok(data) => crate::bridge::accept_battery_report(&queues.battery, index, &data),
            Err(_) => warn!("Slot {}: initial battery read failed", index),
        }
    }
    #[cfg(not(feature = "battery"))]
    let _ = queues;

    if handles.selected_layout != 0 && layout_found {
        // The peripheral needs the active layout as soon as the link is up;
        // delivery re-fires when security comes up later.
        dispatch.request_layout_broadcast();
    }
    Ok(())
}

async fn subscribe<T: Transport>(transport: &T, link: &T::Link, index: usize, handle: u16) {
    match transport.subscribe(link, handle).await {
        Ok(SubscribeOutcome::Subscribed) => debug!("Slot {}: subscribed handle {}", index, handle),
        Ok(SubscribeOutcome::AlreadySubscribed) => {
            debug!("Slot {}: handle {} was already subscribed", index, handle)
        }
        Err(_) => error!("Slot {}: subscribe failed for handle {}", index, handle),
    }
}
