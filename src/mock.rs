//! In-memory transport double for host tests.
//!
//! `FakeTransport` plays a scriptable BLE stack: tests stage a GATT
//! table and a queue of link events, then assert on the recorded scan,
//! subscribe and write traffic. Enabled with the `mock` feature.

use core::cell::{Cell, RefCell};

use heapless::{Deque, Vec};

use crate::config::PERIPHERAL_COUNT;
use crate::error::TransportError;
use crate::event::{BondTable, Event, EventSink};
use crate::transport::{
    AdvData, AttPayload, Characteristic, ConnParams, DiscoverStep, HandleRange, SecurityLevel,
    ServiceHandles, SubscribeOutcome, Transport, TransportEvent,
};
use crate::uuid::{self, Uuid128};

pub type FakeAddr = [u8; 6];

/// Stand-in link handle, numbered in connect order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FakeLink(pub u8);

/// One recorded write-without-response.
#[derive(Clone, Debug)]
pub struct WriteRecord {
    pub link: FakeLink,
    pub handle: u16,
    pub data: Vec<u8, 32>,
}

pub struct FakeTransport {
    pub events: RefCell<Deque<TransportEvent<FakeAddr, FakeLink>, 8>>,
    pub scan_starts: Cell<usize>,
    pub scan_stops: Cell<usize>,
    pub scanning: Cell<bool>,
    pub fail_connect: Cell<bool>,
    pub fail_scan_stop: Cell<bool>,
    pub security: Cell<SecurityLevel>,
    pub service: RefCell<Option<ServiceHandles>>,
    pub characteristics: RefCell<Vec<Characteristic, 16>>,
    /// Characteristic declarations handed to the discovery visitor.
    pub visits: Cell<usize>,
    pub subscriptions: RefCell<Vec<(FakeLink, u16), 16>>,
    pub writes: RefCell<Vec<WriteRecord, 16>>,
    pub conn_param_updates: RefCell<Vec<(FakeLink, ConnParams), 8>>,
    read_values: RefCell<Vec<(u16, AttPayload), 4>>,
    next_id: Cell<u8>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Deque::new()),
            scan_starts: Cell::new(0),
            scan_stops: Cell::new(0),
            scanning: Cell::new(false),
            fail_connect: Cell::new(false),
            fail_scan_stop: Cell::new(false),
            security: Cell::new(SecurityLevel::Encrypted),
            service: RefCell::new(None),
            characteristics: RefCell::new(Vec::new()),
            visits: Cell::new(0),
            subscriptions: RefCell::new(Vec::new()),
            writes: RefCell::new(Vec::new()),
            conn_param_updates: RefCell::new(Vec::new()),
            read_values: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Stage the split service and its characteristic declarations.
    pub fn set_gatt(&self, service: ServiceHandles, characteristics: &[Characteristic]) {
        *self.service.borrow_mut() = Some(service);
        let mut chrcs = self.characteristics.borrow_mut();
        chrcs.clear();
        for chrc in characteristics {
            chrcs.push(*chrc).unwrap();
        }
    }

    /// Stage the response to a read of `handle`.
    pub fn set_read_value(&self, handle: u16, value: &[u8]) {
        self.read_values
            .borrow_mut()
            .push((handle, AttPayload::from_slice(value).unwrap()))
            .unwrap();
    }

    /// Queue a link event for `next_event` to deliver.
    pub fn push_event(&self, event: TransportEvent<FakeAddr, FakeLink>) {
        self.events.borrow_mut().push_back(event).ok().unwrap();
    }
}

impl Transport for FakeTransport {
    type Addr = FakeAddr;
    type Link = FakeLink;

    async fn next_event(&self) -> TransportEvent<FakeAddr, FakeLink> {
        if let Some(event) = self.events.borrow_mut().pop_front() {
            return event;
        }
        core::future::pending().await
    }

    async fn scan_start(&self) -> Result<(), TransportError> {
        self.scan_starts.set(self.scan_starts.get() + 1);
        self.scanning.set(true);
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), TransportError> {
        if self.fail_scan_stop.get() {
            return Err(TransportError::ScanFailed);
        }
        self.scan_stops.set(self.scan_stops.get() + 1);
        self.scanning.set(false);
        Ok(())
    }

    fn connect(&self, _addr: &FakeAddr, _params: &ConnParams) -> Result<FakeLink, TransportError> {
        if self.fail_connect.get() {
            return Err(TransportError::ConnectFailed);
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Ok(FakeLink(id))
    }

    async fn discover_primary(
        &self,
        _link: &FakeLink,
        _uuid: &Uuid128,
        _range: HandleRange,
    ) -> Result<Option<ServiceHandles>, TransportError> {
        Ok(*self.service.borrow())
    }

    async fn discover_characteristics(
        &self,
        _link: &FakeLink,
        range: HandleRange,
        visit: &mut dyn FnMut(&Characteristic) -> DiscoverStep,
    ) -> Result<(), TransportError> {
        let mut from = range.start;
        for chrc in self.characteristics.borrow().iter() {
            if chrc.decl_handle < from || chrc.decl_handle > range.end {
                continue;
            }
            self.visits.set(self.visits.get() + 1);
            match visit(chrc) {
                DiscoverStep::Continue => {}
                DiscoverStep::ContinueFrom(handle) => from = handle,
                DiscoverStep::Stop => break,
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        link: &FakeLink,
        value_handle: u16,
    ) -> Result<SubscribeOutcome, TransportError> {
        let mut subs = self.subscriptions.borrow_mut();
        if subs.iter().any(|s| s == &(*link, value_handle)) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        subs.push((*link, value_handle)).unwrap();
        Ok(SubscribeOutcome::Subscribed)
    }

    async fn read(&self, _link: &FakeLink, handle: u16) -> Result<AttPayload, TransportError> {
        self.read_values
            .borrow()
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, v)| v.clone())
            .ok_or(TransportError::ReadFailed)
    }

    async fn write_without_response(
        &self,
        link: &FakeLink,
        handle: u16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.writes
            .borrow_mut()
            .push(WriteRecord {
                link: *link,
                handle,
                data: Vec::from_slice(payload).unwrap(),
            })
            .ok()
            .unwrap();
        Ok(())
    }

    async fn update_conn_params(
        &self,
        link: &FakeLink,
        params: &ConnParams,
    ) -> Result<(), TransportError> {
        self.conn_param_updates
            .borrow_mut()
            .push((*link, *params))
            .unwrap();
        Ok(())
    }

    fn security_level(&self, _link: &FakeLink) -> SecurityLevel {
        self.security.get()
    }
}

/// Event sink that remembers everything published to it.
pub struct CollectingSink {
    events: RefCell<Vec<Event, 64>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Vec::new()),
        }
    }

    /// Drain and return everything collected so far.
    pub fn take(&self) -> Vec<Event, 64> {
        core::mem::take(&mut *self.events.borrow_mut())
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: Event) {
        self.events.borrow_mut().push(event).ok().unwrap();
    }
}

/// Bond table that admits the first `PERIPHERAL_COUNT` distinct addresses.
pub struct SimpleBonds {
    entries: RefCell<[Option<FakeAddr>; PERIPHERAL_COUNT]>,
}

impl SimpleBonds {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new([None; PERIPHERAL_COUNT]),
        }
    }
}

impl BondTable<FakeAddr> for SimpleBonds {
    fn resolve(&self, addr: &FakeAddr) -> Option<usize> {
        let mut entries = self.entries.borrow_mut();
        if let Some(index) = entries.iter().position(|e| e.as_ref() == Some(addr)) {
            return Some(index);
        }
        let free = entries.iter().position(|e| e.is_none())?;
        entries[free] = Some(*addr);
        Some(free)
    }
}

/// Advertising payload listing the split service, as a peripheral sends it.
pub fn split_adv_data() -> AdvData {
    let mut data = AdvData::new();
    data.extend_from_slice(&[0x02, 0x01, 0x06]).unwrap();
    data.extend_from_slice(&[17, 0x07]).unwrap();
    data.extend_from_slice(&uuid::SPLIT_SERVICE.0).unwrap();
    data
}
