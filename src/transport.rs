//! Radio abstraction consumed by the central state machine.
//!
//! Implementations wrap a concrete BLE stack. All methods take `&self`
//! and use interior mutability, like the softdevice-style stacks they
//! wrap; asynchronous link events arrive through [`Transport::next_event`].
//! The `mock` feature provides a scripted in-memory implementation for
//! host tests.

use heapless::Vec;

use crate::config::{
    CONN_INTERVAL, CONN_LATENCY, CONN_TIMEOUT, IDLE_CONN_INTERVAL, IDLE_CONN_LATENCY,
    IDLE_CONN_TIMEOUT, NOTIFY_DATA_MAX,
};
use crate::error::TransportError;
use crate::uuid::Uuid128;

/// Notification / read payload carried through transport events.
pub type AttPayload = Vec<u8, NOTIFY_DATA_MAX>;

/// Raw advertisement payload (legacy advertising PDU).
pub type AdvData = Vec<u8, 31>;

/// Connection parameter set, in BLE units (interval 1.25 ms, timeout 10 ms).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl ConnParams {
    /// Low-latency parameters used while typing.
    pub const fn active() -> Self {
        Self {
            interval_min: CONN_INTERVAL,
            interval_max: CONN_INTERVAL,
            latency: CONN_LATENCY,
            timeout: CONN_TIMEOUT,
        }
    }

    /// Relaxed parameters for idle links.
    pub const fn idle() -> Self {
        Self {
            interval_min: IDLE_CONN_INTERVAL,
            interval_max: IDLE_CONN_INTERVAL,
            latency: IDLE_CONN_LATENCY,
            timeout: IDLE_CONN_TIMEOUT,
        }
    }
}

/// Link security level as reported by the stack.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    /// No encryption.
    Open,
    /// Link is encrypted.
    Encrypted,
    /// Link is encrypted with an authenticated key.
    Authenticated,
}

/// Role of a link relative to the local device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkRole {
    Central,
    Peripheral,
}

/// Inclusive attribute handle range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

impl HandleRange {
    /// The whole attribute table.
    pub const fn full() -> Self {
        Self {
            start: 0x0001,
            end: 0xffff,
        }
    }
}

/// Location of a primary service on the remote server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ServiceHandles {
    pub attr_handle: u16,
    pub end_handle: u16,
}

impl ServiceHandles {
    /// Range holding the service's characteristic declarations.
    pub fn characteristics(&self) -> HandleRange {
        HandleRange {
            start: self.attr_handle + 1,
            end: self.end_handle,
        }
    }
}

/// One characteristic declaration reported during enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Characteristic {
    pub uuid: Uuid128,
    pub decl_handle: u16,
    pub value_handle: u16,
}

/// Visitor verdict for characteristic enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiscoverStep {
    /// Keep walking the current range.
    Continue,
    /// Keep walking, skipping ahead to the given handle.
    ContinueFrom(u16),
    /// Enumeration is complete.
    Stop,
}

/// Result of a subscribe request. An already-active subscription is
/// not an error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
}

/// Asynchronous link events delivered by the stack.
#[derive(Clone, Debug)]
pub enum TransportEvent<A, L> {
    /// Advertisement received while scanning.
    Advertisement { addr: A, kind: AdvKind },
    /// Link establishment finished.
    Connected { link: L, role: LinkRole },
    /// Link establishment failed after `connect` had returned a pending link.
    ConnectFailed {
        link: L,
        role: LinkRole,
        error: TransportError,
    },
    /// An established link dropped.
    Disconnected { link: L, reason: u8 },
    /// GATT notification. `None` data means the server revoked the
    /// subscription for this handle.
    Notification {
        link: L,
        handle: u16,
        data: Option<AttPayload>,
    },
    /// Link security level changed. Only emitted on successful changes.
    SecurityChanged { link: L, level: SecurityLevel },
}

/// Advertisement flavor, as far as the central cares.
#[derive(Clone, Debug)]
pub enum AdvKind {
    /// Connectable undirected advertisement with its raw payload.
    ConnectableUndirected { data: AdvData },
    /// Directed advertisement aimed at us; no payload to inspect.
    Directed,
}

/// Operations the central requires from a BLE stack.
///
/// `connect` returns the pending link object immediately; establishment
/// completes asynchronously with a `Connected` or `ConnectFailed` event.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Peer address type of the underlying stack.
    type Addr: Clone + PartialEq;
    /// Link (connection) object of the underlying stack.
    type Link: Clone + PartialEq;

    /// Next asynchronous link event. Resolves when the stack has one.
    async fn next_event(&self) -> TransportEvent<Self::Addr, Self::Link>;

    async fn scan_start(&self) -> Result<(), TransportError>;

    async fn scan_stop(&self) -> Result<(), TransportError>;

    /// Begin connection establishment toward `addr`.
    fn connect(
        &self,
        addr: &Self::Addr,
        params: &ConnParams,
    ) -> Result<Self::Link, TransportError>;

    /// Locate the first primary service matching `uuid` within `range`.
    async fn discover_primary(
        &self,
        link: &Self::Link,
        uuid: &Uuid128,
        range: HandleRange,
    ) -> Result<Option<ServiceHandles>, TransportError>;

    /// Enumerate characteristic declarations in `range`, in handle order,
    /// feeding each to `visit` until it says stop or the range is exhausted.
    async fn discover_characteristics(
        &self,
        link: &Self::Link,
        range: HandleRange,
        visit: &mut dyn FnMut(&Characteristic) -> DiscoverStep,
    ) -> Result<(), TransportError>;

    /// Enable notifications on a characteristic value handle.
    async fn subscribe(
        &self,
        link: &Self::Link,
        value_handle: u16,
    ) -> Result<SubscribeOutcome, TransportError>;

    async fn read(&self, link: &Self::Link, handle: u16) -> Result<AttPayload, TransportError>;

    async fn write_without_response(
        &self,
        link: &Self::Link,
        handle: u16,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn update_conn_params(
        &self,
        link: &Self::Link,
        params: &ConnParams,
    ) -> Result<(), TransportError>;

    /// Current security level of the link.
    fn security_level(&self, link: &Self::Link) -> SecurityLevel;
}
