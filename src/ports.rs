//! Port selection for probes.
//!
//! Devices configured with `port = "auto"` are probed on one of two ports picked
//! at random on every scan, so equipment that filters a single port cannot hide
//! the device.

use rand::Rng as _;

pub const DEFAULT_AUTO_PORTS: [u16; 2] = [32000, 62078];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSetting {
    Auto,
    Fixed(u16),
}

pub trait PortSelector: Send + Sync {
    fn select(&self, setting: PortSetting) -> u16;
}

/// Alternates randomly between two ports for [`PortSetting::Auto`].
#[derive(Debug, Clone)]
pub struct RandomAlternation {
    ports: [u16; 2],
}

impl RandomAlternation {
    pub fn new(ports: [u16; 2]) -> Self {
        RandomAlternation { ports }
    }
}

impl Default for RandomAlternation {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_PORTS)
    }
}

impl PortSelector for RandomAlternation {
    fn select(&self, setting: PortSetting) -> u16 {
        match setting {
            PortSetting::Fixed(port) => port,
            PortSetting::Auto => {
                let [first, second] = self.ports;
                if rand::rng().random_bool(0.5) {
                    first
                } else {
                    second
                }
            }
        }
    }
}
