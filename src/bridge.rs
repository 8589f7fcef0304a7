//! Callback-to-worker bridge for peripheral notifications.
//!
//! The central event loop decodes notification payloads and pushes
//! fixed-size records onto bounded queues (newest dropped on overflow,
//! with a warning). Publisher tasks drain the queues in FIFO order onto
//! the system event bus, so decoding never waits on event consumers.

#[cfg(feature = "battery")]
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(any(feature = "sensors", feature = "battery"))]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(any(feature = "sensors", feature = "battery"))]
use embassy_sync::channel::Channel;

use crate::event::{Event, EventSink};
use crate::slot::PositionQueue;

#[cfg(feature = "battery")]
use crate::config::{BATTERY_QUEUE_SIZE, PERIPHERAL_COUNT};
#[cfg(feature = "sensors")]
use crate::config::{SENSOR_EVENT_MAX_CHANNELS, SENSOR_QUEUE_SIZE};
#[cfg(any(feature = "sensors", feature = "battery"))]
use crate::error::Error;
#[cfg(feature = "battery")]
use crate::event::PeripheralBatteryStateChanged;
#[cfg(feature = "sensors")]
use crate::event::{ChannelSample, SensorEvent};

#[cfg(feature = "sensors")]
pub type SensorQueue = Channel<CriticalSectionRawMutex, SensorEvent, SENSOR_QUEUE_SIZE>;

#[cfg(feature = "battery")]
pub type BatteryQueue =
    Channel<CriticalSectionRawMutex, PeripheralBatteryStateChanged, BATTERY_QUEUE_SIZE>;

/// All bounded queues between callback and worker context.
pub struct EventQueues {
    pub position: PositionQueue,
    #[cfg(feature = "sensors")]
    pub sensor: SensorQueue,
    #[cfg(feature = "battery")]
    pub battery: BatteryQueue,
}

impl EventQueues {
    pub const fn new() -> Self {
        Self {
            position: PositionQueue::new(),
            #[cfg(feature = "sensors")]
            sensor: SensorQueue::new(),
            #[cfg(feature = "battery")]
            battery: BatteryQueue::new(),
        }
    }
}

/// Decode a sensor notification and queue it.
#[cfg(feature = "sensors")]
pub fn accept_sensor_report(queue: &SensorQueue, index: usize, data: &[u8], timestamp: u64) {
    let ev = match parse_sensor(data, timestamp) {
        Ok(ev) => ev,
        Err(_) => {
            warn!("Slot {}: malformed sensor report ({} bytes)", index, data.len());
            return;
        }
    };
    if queue.try_send(ev).is_err() {
        warn!("Sensor queue full, dropping sample from slot {}", index);
    }
}

#[cfg(feature = "sensors")]
fn parse_sensor(data: &[u8], timestamp: u64) -> Result<SensorEvent, Error> {
    if data.len() < 2 {
        return Err(Error::Malformed);
    }
    let sensor_index = data[0];
    let count = (data[1] as usize).min(SENSOR_EVENT_MAX_CHANNELS);
    let mut channels = heapless::Vec::new();
    for chunk in data[2..].chunks_exact(8).take(count) {
        let val1 = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let val2 = i32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        let _ = channels.push(ChannelSample { val1, val2 });
    }
    Ok(SensorEvent {
        sensor_index,
        channels,
        timestamp,
    })
}

/// Decode a battery level notification or read result and queue it.
#[cfg(feature = "battery")]
pub fn accept_battery_report(queue: &BatteryQueue, index: usize, data: &[u8]) {
    let Some(&level) = data.first() else {
        warn!("Slot {}: empty battery level report", index);
        return;
    };
    push_battery(queue, index, level);
}

/// Queue a battery level for `index` directly (disconnects report level 0).
#[cfg(feature = "battery")]
pub fn push_battery(queue: &BatteryQueue, index: usize, level: u8) {
    let ev = PeripheralBatteryStateChanged {
        source: index as u8,
        state_of_charge: level,
    };
    if queue.try_send(ev).is_err() {
        warn!("Battery queue full, dropping level for slot {}", index);
    }
}

/// Last known state of charge per slot, readable from any context.
#[cfg(feature = "battery")]
pub struct BatteryLevels([AtomicU8; PERIPHERAL_COUNT]);

#[cfg(feature = "battery")]
impl BatteryLevels {
    const ZERO: AtomicU8 = AtomicU8::new(0);

    pub const fn new() -> Self {
        Self([Self::ZERO; PERIPHERAL_COUNT])
    }

    fn store(&self, index: usize, level: u8) {
        if let Some(cell) = self.0.get(index) {
            cell.store(level, Ordering::Relaxed);
        }
    }

    pub fn get(&self, index: usize) -> u8 {
        self.0
            .get(index)
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }
}

// Worker-side publishers. The `drain_*` variants empty whatever is queued
// and return; tests and single-threaded embedders pump with those.

pub fn drain_positions<S: EventSink>(queue: &PositionQueue, sink: &S) {
    while let Ok(ev) = queue.try_receive() {
        sink.publish(Event::PositionStateChanged(ev));
    }
}

/// Position publisher task body.
pub async fn run_position_publisher<S: EventSink>(queue: &PositionQueue, sink: &S) -> ! {
    loop {
        let ev = queue.receive().await;
        sink.publish(Event::PositionStateChanged(ev));
    }
}

#[cfg(feature = "sensors")]
pub fn drain_sensors<S: EventSink>(queue: &SensorQueue, sink: &S) {
    while let Ok(ev) = queue.try_receive() {
        sink.publish(Event::SensorEvent(ev));
    }
}

/// Sensor publisher task body.
#[cfg(feature = "sensors")]
pub async fn run_sensor_publisher<S: EventSink>(queue: &SensorQueue, sink: &S) -> ! {
    loop {
        let ev = queue.receive().await;
        sink.publish(Event::SensorEvent(ev));
    }
}

#[cfg(feature = "battery")]
pub fn drain_battery<S: EventSink>(queue: &BatteryQueue, levels: &BatteryLevels, sink: &S) {
    while let Ok(ev) = queue.try_receive() {
        levels.store(ev.source as usize, ev.state_of_charge);
        sink.publish(Event::PeripheralBatteryStateChanged(ev));
    }
}

/// Battery publisher task body; also maintains the level cache.
#[cfg(feature = "battery")]
pub async fn run_battery_publisher<S: EventSink>(
    queue: &BatteryQueue,
    levels: &BatteryLevels,
    sink: &S,
) -> ! {
    loop {
        let ev = queue.receive().await;
        levels.store(ev.source as usize, ev.state_of_charge);
        sink.publish(Event::PeripheralBatteryStateChanged(ev));
    }
}
