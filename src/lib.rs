//! Tracks which household devices are on the local network and announces
//! arrivals and departures of people, kids and guests.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod household;
mod hub;
pub mod manager;
pub mod monitor;
pub mod mqtt;
pub mod ports;
pub mod presence;
pub mod probe;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, DeviceConfig, DeviceEntry, DeviceId};
pub use dispatcher::{EventConsumer, EventDispatcher};
pub use events::{Event, EventName};
pub use household::{HouseholdSnapshot, PresenceView};
pub use manager::{Components, Manager};
