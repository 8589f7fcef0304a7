//! Compile-time configuration for the split central.
//!
//! Queue depths, connection parameters and payload bounds live here so
//! they can be tuned in one place.

// Slots

/// Number of peripheral halves this central manages.
pub const PERIPHERAL_COUNT: usize = 2;

/// Size of the key position bitmap exchanged with each peripheral (bytes).
pub const POSITION_STATE_LEN: usize = 16;

// Queue depths
//
// All queues sit between the BLE callback context and a worker task;
// the callback side never blocks on them.

/// Decoded key position events waiting for the publisher task.
pub const POSITION_QUEUE_SIZE: usize = 10;

/// Sensor samples waiting for the publisher task.
pub const SENSOR_QUEUE_SIZE: usize = 4;

/// Battery level reports waiting for the publisher task.
pub const BATTERY_QUEUE_SIZE: usize = 4;

/// Outbound behavior invocations waiting for the dispatcher.
pub const BEHAVIOR_QUEUE_SIZE: usize = 5;

// Connection parameters

/// Connection interval while typing (1.25 ms units). 6 = 7.5 ms.
pub const CONN_INTERVAL: u16 = 6;

/// Peripheral latency while typing (connection events the peripheral may skip).
pub const CONN_LATENCY: u16 = 30;

/// Supervision timeout (10 ms units). 400 = 4 s.
pub const CONN_TIMEOUT: u16 = 400;

/// Relaxed connection interval for idle links (1.25 ms units).
pub const IDLE_CONN_INTERVAL: u16 = 16;

/// Peripheral latency for idle links.
pub const IDLE_CONN_LATENCY: u16 = 120;

/// Supervision timeout for idle links (10 ms units).
pub const IDLE_CONN_TIMEOUT: u16 = 400;

// Payload bounds

/// Largest notification / read payload carried through transport events.
pub const NOTIFY_DATA_MAX: usize = 20;

/// Maximum channels carried in one sensor report.
pub const SENSOR_EVENT_MAX_CHANNELS: usize = 2;

/// Behavior device label capacity (longer labels are truncated).
pub const BEHAVIOR_DEV_MAX: usize = 16;

/// Wire size of an encoded behavior invocation.
pub const RUN_BEHAVIOR_PAYLOAD_LEN: usize = 14 + BEHAVIOR_DEV_MAX;
