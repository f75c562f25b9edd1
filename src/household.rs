//! Household-wide view over every tracked device, and the aggregation pass that
//! turns one device's transition into per-device and first/last events.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::{DeviceConfig, DeviceId};
use crate::events::{Event, EventName};
use crate::presence::Transition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub present: bool,
    pub is_guest: bool,
    pub is_kid: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    pub fn new(device: &DeviceConfig, present: bool, last_seen_at: Option<DateTime<Utc>>) -> Self {
        DeviceStatus {
            name: device.name.clone(),
            present,
            is_guest: device.is_guest,
            is_kid: device.is_kid,
            last_seen_at,
        }
    }

    pub fn is_household_member(&self) -> bool {
        !self.is_guest
    }
}

/// Number of present devices per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceCounts {
    pub all: usize,
    pub household_member: usize,
    pub guest: usize,
    pub kid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HouseholdSnapshot {
    devices: BTreeMap<DeviceId, DeviceStatus>,
}

impl HouseholdSnapshot {
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceStatus> {
        self.devices.get(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &DeviceStatus)> {
        self.devices.iter()
    }

    pub(crate) fn insert(&mut self, id: DeviceId, status: DeviceStatus) {
        self.devices.insert(id, status);
    }

    pub(crate) fn remove(&mut self, id: &DeviceId) -> Option<DeviceStatus> {
        self.devices.remove(id)
    }

    pub fn counts(&self) -> PresenceCounts {
        self.counts_where(|_| true)
    }

    pub fn counts_excluding(&self, excluded: &DeviceId) -> PresenceCounts {
        self.counts_where(|id| id != excluded)
    }

    fn counts_where(&self, include: impl Fn(&DeviceId) -> bool) -> PresenceCounts {
        self.devices
            .iter()
            .filter(|(id, status)| status.present && include(id))
            .fold(PresenceCounts::default(), |mut counts, (_, status)| {
                counts.all += 1;
                if status.is_household_member() {
                    counts.household_member += 1;
                }
                if status.is_guest {
                    counts.guest += 1;
                }
                if status.is_kid {
                    counts.kid += 1;
                }
                counts
            })
    }

    pub fn household_member_is_home(&self) -> bool {
        self.counts().household_member > 0
    }

    pub fn kids_at_home(&self) -> bool {
        self.counts().kid > 0
    }

    pub fn having_guests(&self) -> bool {
        self.counts().guest > 0
    }

    pub fn someone_at_home(&self) -> bool {
        self.counts().all > 0
    }

    pub fn user_at_home(&self, id: &DeviceId) -> bool {
        self.devices.get(id).is_some_and(|status| status.present)
    }
}

/// Events for one committed transition of `id`, in dispatch order.
///
/// `snapshot` must already reflect the transition. Arrivals are counted against
/// every other device, departures against the whole household.
pub fn aggregate(
    id: &DeviceId,
    transition: Transition,
    snapshot: &HouseholdSnapshot,
) -> Vec<Event> {
    let Some(device) = snapshot.get(id) else {
        return Vec::new();
    };
    let who = device.name.as_str();
    let event = |name| Event::new(name, id.clone(), who);
    let mut events = Vec::with_capacity(8);

    match transition {
        Transition::Arrived => {
            events.push(event(EventName::UserEntered));
            events.push(event(EventName::SomeoneEntered));
            if device.is_household_member() {
                events.push(event(EventName::HouseholdMemberArrived));
            }
            if device.is_kid {
                events.push(event(EventName::KidArrived));
            }
            if device.is_guest {
                events.push(event(EventName::GuestArrived));
            }

            let others = snapshot.counts_excluding(id);
            if others.all == 0 {
                events.push(event(EventName::FirstPersonEntered));
            }
            if device.is_household_member() && others.household_member == 0 {
                events.push(event(EventName::FirstHouseholdMemberArrived));
            }
            if device.is_kid && others.kid == 0 {
                events.push(event(EventName::FirstKidArrived));
            }
            if device.is_guest && others.guest == 0 {
                events.push(event(EventName::FirstGuestArrived));
            }
        }
        Transition::Left => {
            events.push(event(EventName::UserLeft));
            events.push(event(EventName::SomeoneLeft));
            if device.is_household_member() {
                events.push(event(EventName::HouseholdMemberLeft));
            }
            if device.is_kid {
                events.push(event(EventName::KidLeft));
            }
            if device.is_guest {
                events.push(event(EventName::GuestLeft));
            }

            let remaining = snapshot.counts();
            if remaining.all == 0 {
                events.push(event(EventName::LastPersonLeft));
            }
            if device.is_household_member() && remaining.household_member == 0 {
                events.push(event(EventName::LastHouseholdMemberLeft));
            }
            if device.is_kid && remaining.kid == 0 {
                events.push(event(EventName::LastKidLeft));
            }
            if device.is_guest && remaining.guest == 0 {
                events.push(event(EventName::LastGuestLeft));
            }
        }
    }
    events
}

/// Read-only handle on the latest household snapshot. Cheap to clone and safe
/// to query while scanning is in progress.
#[derive(Debug, Clone)]
pub struct PresenceView {
    rx: watch::Receiver<Arc<HouseholdSnapshot>>,
}

impl PresenceView {
    pub(crate) fn new(rx: watch::Receiver<Arc<HouseholdSnapshot>>) -> Self {
        PresenceView { rx }
    }

    pub fn snapshot(&self) -> Arc<HouseholdSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    pub fn household_member_is_home(&self) -> bool {
        self.rx.borrow().household_member_is_home()
    }

    pub fn kids_at_home(&self) -> bool {
        self.rx.borrow().kids_at_home()
    }

    pub fn having_guests(&self) -> bool {
        self.rx.borrow().having_guests()
    }

    pub fn someone_at_home(&self) -> bool {
        self.rx.borrow().someone_at_home()
    }

    pub fn user_at_home(&self, id: &DeviceId) -> bool {
        self.rx.borrow().user_at_home(id)
    }
}
