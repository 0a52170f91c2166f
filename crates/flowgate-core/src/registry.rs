//! Filter Registry
//!
//! A fixed-capacity table of connected filter agents behind a single
//! reader/writer lock. Callers only ever hold [`FilterHandle`]s and
//! [`FilterUnit`] numbers; slot contents never leave the lock.
//!
//! Lock order: the registry lock may be taken while a socket is locked,
//! never the other way round. Operations that must visit flows return
//! pinned [`FlowLink`]s so the caller can release the registry first.

use crate::channel::{ChannelError, ControlChannel};
use crate::error::RegistryError;
use crate::flow::FlowLink;
use crate::signer::Signer;
use flowgate_proto::{EventMessage, FlowId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

/// Registry slot number, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterUnit(pub u32);

impl fmt::Display for FilterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit({})", self.0)
    }
}

/// Proof of a successful connect; stale once the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle {
    unit: FilterUnit,
    epoch: u64,
}

impl FilterHandle {
    pub fn unit(&self) -> FilterUnit {
        self.unit
    }
}

/// Read-only view of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub unit: FilterUnit,
    /// Policy control unit, 0 until set
    pub policy_unit: u32,
    pub flow_controlled: bool,
    pub preserve_connections: bool,
    pub detaching: bool,
    pub attached_flows: usize,
    pub signed: bool,
}

struct Slot {
    epoch: u64,
    channel: Arc<dyn ControlChannel>,
    policy_unit: u32,
    flow_controlled: AtomicBool,
    preserve_connections: bool,
    detaching: bool,
    signer: Option<Arc<Signer>>,
    flows: Vec<Weak<FlowLink>>,
}

impl Slot {
    fn info(&self, unit: FilterUnit) -> SlotInfo {
        SlotInfo {
            unit,
            policy_unit: self.policy_unit,
            flow_controlled: self.flow_controlled.load(Ordering::Relaxed),
            preserve_connections: self.preserve_connections,
            detaching: self.detaching,
            attached_flows: self.flows.iter().filter(|w| w.strong_count() > 0).count(),
            signed: self.signer.is_some(),
        }
    }

    fn live_flows(&self) -> Vec<Arc<FlowLink>> {
        self.flows.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Table of connected filter agents.
pub struct FilterRegistry {
    slots: RwLock<Vec<Option<Slot>>>,
    next_epoch: AtomicU64,
}

impl FilterRegistry {
    /// Create a registry with units `1..=capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new((0..capacity).map(|_| None).collect()),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Option<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Option<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(slots: &[Option<Slot>], unit: u32) -> Result<usize, RegistryError> {
        if unit == 0 || unit as usize > slots.len() {
            return Err(RegistryError::InvalidSlot(unit));
        }
        Ok(unit as usize - 1)
    }

    fn slot_mut<'a>(
        slots: &'a mut [Option<Slot>],
        handle: FilterHandle,
    ) -> Result<&'a mut Slot, RegistryError> {
        let idx = Self::index(slots, handle.unit.0)?;
        match slots[idx].as_mut() {
            Some(slot) if slot.epoch == handle.epoch => Ok(slot),
            _ => Err(RegistryError::NotConnected(handle.unit.0)),
        }
    }

    fn slot_for<'a>(slots: &'a [Option<Slot>], handle: FilterHandle) -> Result<&'a Slot, RegistryError> {
        let idx = Self::index(slots, handle.unit.0)?;
        match slots[idx].as_ref() {
            Some(slot) if slot.epoch == handle.epoch => Ok(slot),
            _ => Err(RegistryError::NotConnected(handle.unit.0)),
        }
    }

    fn slot<'a>(slots: &'a [Option<Slot>], unit: FilterUnit) -> Option<&'a Slot> {
        let idx = Self::index(slots, unit.0).ok()?;
        slots[idx].as_ref()
    }

    /// Claim a slot for a newly connected agent.
    pub fn connect(
        &self,
        unit: u32,
        channel: Arc<dyn ControlChannel>,
    ) -> Result<FilterHandle, RegistryError> {
        let mut slots = self.write();
        let idx = Self::index(&slots, unit)?;
        if slots[idx].is_some() {
            return Err(RegistryError::SlotInUse(unit));
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        slots[idx] = Some(Slot {
            epoch,
            channel,
            policy_unit: 0,
            flow_controlled: AtomicBool::new(false),
            preserve_connections: false,
            detaching: false,
            signer: None,
            flows: Vec::new(),
        });
        info!("Filter {} connected", FilterUnit(unit));
        Ok(FilterHandle {
            unit: FilterUnit(unit),
            epoch,
        })
    }

    /// Stop new attachments to a slot and pin every attached flow.
    pub fn begin_disconnect(&self, handle: FilterHandle) -> Result<Vec<Arc<FlowLink>>, RegistryError> {
        let mut slots = self.write();
        let slot = Self::slot_mut(&mut slots, handle)?;
        slot.detaching = true;
        Ok(slot.live_flows())
    }

    /// Free the slot.
    pub fn finish_disconnect(&self, handle: FilterHandle) -> Result<(), RegistryError> {
        let mut slots = self.write();
        Self::slot_mut(&mut slots, handle)?;
        let idx = handle.unit.0 as usize - 1;
        slots[idx] = None;
        info!("Filter {} disconnected", handle.unit);
        Ok(())
    }

    /// Check that a handle still names its slot.
    pub fn validate(&self, handle: FilterHandle) -> Result<(), RegistryError> {
        Self::slot_for(&self.read(), handle).map(|_| ())
    }

    /// Set the policy control unit. Allowed once per connection.
    pub fn set_policy_unit(&self, handle: FilterHandle, policy_unit: u32) -> Result<(), RegistryError> {
        if policy_unit == 0 {
            return Err(RegistryError::InvalidUnit);
        }
        let mut slots = self.write();
        let slot = Self::slot_mut(&mut slots, handle)?;
        if slot.policy_unit != 0 {
            return Err(RegistryError::UnitAlreadySet(slot.policy_unit));
        }
        slot.policy_unit = policy_unit;
        debug!("Filter {} policy unit {}", handle.unit, policy_unit);
        Ok(())
    }

    pub fn policy_unit(&self, unit: FilterUnit) -> Option<u32> {
        Self::slot(&self.read(), unit).map(|s| s.policy_unit)
    }

    /// Install (or replace) the slot's signer.
    pub fn set_signer(&self, handle: FilterHandle, key: &[u8]) -> Result<(), RegistryError> {
        let signer = Arc::new(Signer::new(key)?);
        let mut slots = self.write();
        Self::slot_mut(&mut slots, handle)?.signer = Some(signer);
        debug!("Filter {} crypto key set", handle.unit);
        Ok(())
    }

    pub fn signer(&self, unit: FilterUnit) -> Option<Arc<Signer>> {
        Self::slot(&self.read(), unit).and_then(|s| s.signer.clone())
    }

    pub fn set_preserve_connections(&self, handle: FilterHandle, on: bool) -> Result<(), RegistryError> {
        let mut slots = self.write();
        Self::slot_mut(&mut slots, handle)?.preserve_connections = on;
        Ok(())
    }

    pub fn preserve_connections(&self, handle: FilterHandle) -> Result<bool, RegistryError> {
        Ok(Self::slot_for(&self.read(), handle)?.preserve_connections)
    }

    /// Existing connections survive policy changes only if every active
    /// filter asks for it.
    pub fn preserves_all(&self) -> bool {
        let slots = self.read();
        let mut active = slots.iter().flatten().filter(|s| !s.detaching).peekable();
        active.peek().is_some() && active.all(|s| s.preserve_connections)
    }

    /// Connected slots that are not being torn down.
    pub fn active_count(&self) -> usize {
        self.read().iter().flatten().filter(|s| !s.detaching).count()
    }

    /// Slots whose policy unit matches `required` bitwise, as
    /// `(unit, order_key)` sorted by order key.
    pub fn matching(&self, required: u32) -> Vec<(FilterUnit, u32)> {
        let slots = self.read();
        let mut found: Vec<(FilterUnit, u32)> = slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let slot = slot.as_ref()?;
                if slot.detaching || slot.policy_unit & required == 0 {
                    return None;
                }
                Some((FilterUnit(idx as u32 + 1), slot.policy_unit))
            })
            .collect();
        found.sort_by_key(|&(unit, key)| (key, unit));
        found
    }

    /// Record that a flow has an entry on `unit`.
    pub fn link(&self, unit: FilterUnit, flow: Weak<FlowLink>) {
        let mut slots = self.write();
        let Ok(idx) = Self::index(&slots, unit.0) else {
            return;
        };
        if let Some(slot) = slots[idx].as_mut() {
            slot.flows.retain(|w| w.strong_count() > 0);
            slot.flows.push(flow);
        }
    }

    /// Forget a flow's entry on `unit`.
    pub fn unlink(&self, unit: FilterUnit, flow_id: FlowId) {
        let mut slots = self.write();
        let Ok(idx) = Self::index(&slots, unit.0) else {
            return;
        };
        if let Some(slot) = slots[idx].as_mut() {
            slot.flows
                .retain(|w| w.upgrade().is_some_and(|link| link.flow_id() != flow_id));
        }
    }

    /// Pin every flow attached to `unit`.
    pub fn flows(&self, unit: FilterUnit) -> Vec<Arc<FlowLink>> {
        Self::slot(&self.read(), unit)
            .map(Slot::live_flows)
            .unwrap_or_default()
    }

    /// Deliver an event to the agent on `unit`.
    ///
    /// Back pressure marks the slot flow controlled until the agent drains.
    pub fn send(&self, unit: FilterUnit, msg: &EventMessage) -> Result<(), ChannelError> {
        let channel = match Self::slot(&self.read(), unit) {
            Some(slot) => slot.channel.clone(),
            None => return Err(ChannelError::Closed),
        };
        let result = channel.send(msg);
        if let Err(ChannelError::BackPressure) = result {
            if let Some(slot) = Self::slot(&self.read(), unit) {
                if !slot.flow_controlled.swap(true, Ordering::Relaxed) {
                    warn!("Filter {} flow controlled", unit);
                }
            }
        }
        result
    }

    pub fn is_flow_controlled(&self, unit: FilterUnit) -> bool {
        Self::slot(&self.read(), unit).is_some_and(|s| s.flow_controlled.load(Ordering::Relaxed))
    }

    /// Lift flow control and pin the flows that may now make progress.
    pub fn channel_drained(&self, handle: FilterHandle) -> Result<Vec<Arc<FlowLink>>, RegistryError> {
        let mut slots = self.write();
        let slot = Self::slot_mut(&mut slots, handle)?;
        if slot.flow_controlled.swap(false, Ordering::Relaxed) {
            debug!("Filter {} flow control lifted", handle.unit);
        }
        Ok(slot.live_flows())
    }

    pub fn lookup(&self, unit: FilterUnit) -> Option<SlotInfo> {
        Self::slot(&self.read(), unit).map(|s| s.info(unit))
    }

    /// Visit every connected slot.
    pub fn for_each(&self, mut f: impl FnMut(&SlotInfo)) {
        let slots = self.read();
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                f(&slot.info(FilterUnit(idx as u32 + 1)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameChannel;
    use flowgate_proto::{Direction, Event};

    fn channel(capacity: usize) -> (Arc<dyn ControlChannel>, crossbeam_channel::Receiver<Vec<u8>>) {
        let (tx, rx) = FrameChannel::bounded(capacity);
        (Arc::new(tx), rx)
    }

    #[test]
    fn test_connect_bounds_and_reuse() {
        let registry = FilterRegistry::new(4);
        let (ch, _rx) = channel(4);

        assert!(matches!(registry.connect(0, ch.clone()), Err(RegistryError::InvalidSlot(0))));
        assert!(matches!(registry.connect(5, ch.clone()), Err(RegistryError::InvalidSlot(5))));

        let handle = registry.connect(2, ch.clone()).unwrap();
        assert!(matches!(registry.connect(2, ch.clone()), Err(RegistryError::SlotInUse(2))));
        assert_eq!(registry.active_count(), 1);

        registry.begin_disconnect(handle).unwrap();
        registry.finish_disconnect(handle).unwrap();
        assert_eq!(registry.active_count(), 0);

        let again = registry.connect(2, ch).unwrap();
        assert!(matches!(registry.validate(handle), Err(RegistryError::NotConnected(2))));
        assert!(registry.validate(again).is_ok());
    }

    #[test]
    fn test_policy_unit_set_once() {
        let registry = FilterRegistry::new(2);
        let (ch, _rx) = channel(1);
        let handle = registry.connect(1, ch).unwrap();

        assert!(matches!(registry.set_policy_unit(handle, 0), Err(RegistryError::InvalidUnit)));
        registry.set_policy_unit(handle, 4).unwrap();
        assert!(matches!(
            registry.set_policy_unit(handle, 8),
            Err(RegistryError::UnitAlreadySet(4))
        ));
        assert_eq!(registry.policy_unit(handle.unit()), Some(4));
    }

    #[test]
    fn test_matching_is_bitwise_and_ordered() {
        let registry = FilterRegistry::new(4);
        let (ch, _rx) = channel(1);
        let a = registry.connect(1, ch.clone()).unwrap();
        let b = registry.connect(2, ch.clone()).unwrap();
        let c = registry.connect(3, ch).unwrap();
        registry.set_policy_unit(a, 4).unwrap();
        registry.set_policy_unit(b, 1).unwrap();
        registry.set_policy_unit(c, 8).unwrap();

        let found = registry.matching(1 | 4);
        assert_eq!(found, vec![(FilterUnit(2), 1), (FilterUnit(1), 4)]);
        assert!(registry.matching(16).is_empty());
    }

    #[test]
    fn test_preserve_requires_all() {
        let registry = FilterRegistry::new(2);
        let (ch, _rx) = channel(1);
        assert!(!registry.preserves_all());

        let a = registry.connect(1, ch.clone()).unwrap();
        let b = registry.connect(2, ch).unwrap();
        registry.set_preserve_connections(a, true).unwrap();
        assert!(!registry.preserves_all());
        registry.set_preserve_connections(b, true).unwrap();
        assert!(registry.preserves_all());
        assert!(registry.preserve_connections(b).unwrap());
    }

    #[test]
    fn test_send_backpressure_sets_flag() {
        let registry = FilterRegistry::new(1);
        let (ch, rx) = channel(1);
        let handle = registry.connect(1, ch).unwrap();
        let msg = EventMessage::new(FlowId(1), Event::Disconnect { direction: Direction::Outbound });

        registry.send(handle.unit(), &msg).unwrap();
        assert_eq!(registry.send(handle.unit(), &msg), Err(ChannelError::BackPressure));
        assert!(registry.is_flow_controlled(handle.unit()));

        rx.recv().unwrap();
        registry.channel_drained(handle).unwrap();
        assert!(!registry.is_flow_controlled(handle.unit()));
        assert_eq!(registry.send(FilterUnit(9), &msg), Err(ChannelError::Closed));
    }

    #[test]
    fn test_link_tracks_live_flows() {
        let registry = FilterRegistry::new(1);
        let (ch, _rx) = channel(1);
        let handle = registry.connect(1, ch).unwrap();

        let link = Arc::new(FlowLink::new(FlowId(77), Weak::new()));
        registry.link(handle.unit(), Arc::downgrade(&link));
        assert_eq!(registry.lookup(handle.unit()).unwrap().attached_flows, 1);
        assert_eq!(registry.flows(handle.unit()).len(), 1);

        registry.unlink(handle.unit(), FlowId(77));
        assert_eq!(registry.lookup(handle.unit()).unwrap().attached_flows, 0);

        registry.link(handle.unit(), Arc::downgrade(&link));
        drop(link);
        assert_eq!(registry.lookup(handle.unit()).unwrap().attached_flows, 0);
        assert!(registry.begin_disconnect(handle).unwrap().is_empty());
    }
}
