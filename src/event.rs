//! Domain events published by the link manager, and the traits the
//! embedding firmware implements to receive them.

#[cfg(feature = "sensors")]
use heapless::Vec;

#[cfg(feature = "sensors")]
use crate::config::SENSOR_EVENT_MAX_CHANNELS;

/// A key position changed on a peripheral half.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PositionStateChanged {
    /// Slot index of the reporting peripheral.
    pub source: u8,
    /// Key position, 0..=127.
    pub position: u8,
    pub pressed: bool,
    /// Milliseconds since boot at decode time.
    pub timestamp: u64,
}

/// One sensor channel sample (integer and fractional part).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelSample {
    pub val1: i32,
    pub val2: i32,
}

/// A sensor on a peripheral half produced new samples.
#[cfg(feature = "sensors")]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SensorEvent {
    pub sensor_index: u8,
    pub channels: Vec<ChannelSample, SENSOR_EVENT_MAX_CHANNELS>,
    /// Milliseconds since boot at decode time.
    pub timestamp: u64,
}

/// State of charge reported by a peripheral half. Level 0 is synthesized
/// when the half disconnects.
#[cfg(feature = "battery")]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PeripheralBatteryStateChanged {
    /// Slot index of the reporting peripheral.
    pub source: u8,
    /// Percentage, 0..=100.
    pub state_of_charge: u8,
}

/// The active layer bitmap was delivered to at least one peripheral.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SplitPeripheralLayerChanged {
    pub layers: u32,
}

/// Everything the link manager publishes onto the system event bus.
#[derive(Clone, PartialEq, Debug)]
pub enum Event {
    PositionStateChanged(PositionStateChanged),
    #[cfg(feature = "sensors")]
    SensorEvent(SensorEvent),
    #[cfg(feature = "battery")]
    PeripheralBatteryStateChanged(PeripheralBatteryStateChanged),
    SplitPeripheralLayerChanged(SplitPeripheralLayerChanged),
}

/// Publish side of the system event bus.
pub trait EventSink {
    fn publish(&self, event: Event);
}

/// Persisted bonded-address table. Maps a peer address to its fixed slot,
/// claiming a free slot for a new peer when one is available.
pub trait BondTable<A> {
    fn resolve(&self, addr: &A) -> Option<usize>;
}

/// A behavior binding to run on a peripheral: its registered device label
/// plus the two bound parameters.
#[derive(Clone, Copy, Debug)]
pub struct BehaviorBinding<'a> {
    pub behavior_dev: &'a str,
    pub param1: u32,
    pub param2: u32,
}

/// The key or sensor event a behavior invocation refers back to.
#[derive(Clone, Copy, Debug)]
pub struct BehaviorEvent {
    pub position: u32,
    /// Source id of the originating event.
    pub source: u8,
}

/// Coarse activity state reported by the power subsystem.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActivityState {
    Active,
    Idle,
    Sleep,
}
