use std::fmt;

use serde::Serialize;

use crate::config::DeviceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventName {
    FirstGuestArrived,
    FirstHouseholdMemberArrived,
    FirstKidArrived,
    FirstPersonEntered,
    GuestArrived,
    GuestLeft,
    HouseholdMemberArrived,
    HouseholdMemberLeft,
    KidArrived,
    KidLeft,
    LastGuestLeft,
    LastHouseholdMemberLeft,
    LastKidLeft,
    LastPersonLeft,
    SomeoneEntered,
    SomeoneLeft,
    /// Scoped to the device that arrived.
    UserEntered,
    /// Scoped to the device that left.
    UserLeft,
}

impl EventName {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventName::FirstGuestArrived => "first_guest_arrived",
            EventName::FirstHouseholdMemberArrived => "first_household_member_arrived",
            EventName::FirstKidArrived => "first_kid_arrived",
            EventName::FirstPersonEntered => "first_person_entered",
            EventName::GuestArrived => "guest_arrived",
            EventName::GuestLeft => "guest_left",
            EventName::HouseholdMemberArrived => "household_member_arrived",
            EventName::HouseholdMemberLeft => "household_member_left",
            EventName::KidArrived => "kid_arrived",
            EventName::KidLeft => "kid_left",
            EventName::LastGuestLeft => "last_guest_left",
            EventName::LastHouseholdMemberLeft => "last_household_member_left",
            EventName::LastKidLeft => "last_kid_left",
            EventName::LastPersonLeft => "last_person_left",
            EventName::SomeoneEntered => "someone_entered",
            EventName::SomeoneLeft => "someone_left",
            EventName::UserEntered => "user_entered",
            EventName::UserLeft => "user_left",
        }
    }

    /// Household-wide first/last events, as opposed to per-device ones.
    pub const fn is_aggregate(self) -> bool {
        matches!(
            self,
            EventName::FirstGuestArrived
                | EventName::FirstHouseholdMemberArrived
                | EventName::FirstKidArrived
                | EventName::FirstPersonEntered
                | EventName::LastGuestLeft
                | EventName::LastHouseholdMemberLeft
                | EventName::LastKidLeft
                | EventName::LastPersonLeft
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Tokens {
    pub who: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub name: EventName,
    /// The device whose transition produced this event.
    pub device: DeviceId,
    pub tokens: Tokens,
}

impl Event {
    pub fn new(name: EventName, device: DeviceId, who: &str) -> Self {
        Event {
            name,
            device,
            tokens: Tokens {
                who: who.to_string(),
            },
        }
    }
}
