/*!
 * Capability facets and their typed state blocks.
 *
 * A device declares a subset of [`Capability`] tags at discovery time. Each
 * tag owns one typed block of cached state, which only a successful refresh
 * can fill in.
 */
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A facet of device functionality
///
/// The set is closed: filtering and accessor gating match on these variants
/// instead of inspecting device types at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Power on/off, possibly per channel
    Toggle,
    /// Colour and brightness of a light
    Light,
    /// Hardware and firmware description
    SystemInfo,
    /// Instant power consumption readings
    Electricity,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 4] = [
        Capability::Toggle,
        Capability::Light,
        Capability::SystemInfo,
        Capability::Electricity,
    ];

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Toggle => "toggle",
            Capability::Light => "light",
            Capability::SystemInfo => "system_info",
            Capability::Electricity => "electricity",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable set of capabilities a device declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set contains `capability`
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Iterate in a stable order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Number of capabilities
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no capability is declared
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = Capability;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, Capability>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

/// An RGB colour triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    /// Red channel
    pub red: u8,
    /// Green channel
    pub green: u8,
    /// Blue channel
    pub blue: u8,
}

impl Rgb {
    /// Create a colour from its channels
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Unpack a `0xRRGGBB` integer; the top byte is ignored
    pub const fn from_int(value: u32) -> Self {
        Self {
            red: ((value >> 16) & 0xff) as u8,
            green: ((value >> 8) & 0xff) as u8,
            blue: (value & 0xff) as u8,
        }
    }

    /// Pack into a `0xRRGGBB` integer
    pub const fn to_int(self) -> u32 {
        ((self.red as u32) << 16) | ((self.green as u32) << 8) | self.blue as u32
    }

    /// Format as `#rrggbb`
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)
    }
}

impl From<(u8, u8, u8)> for Rgb {
    fn from((red, green, blue): (u8, u8, u8)) -> Self {
        Self::new(red, green, blue)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One channel of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleChannel {
    /// Channel index
    pub channel: u8,
    /// Whether the channel is on
    pub on: bool,
}

/// On/off state per channel
///
/// Channel 0 is the master channel, the only one on single-outlet devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleState {
    channels: Vec<ToggleChannel>,
}

impl ToggleState {
    /// Create a state with no channel reported
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a single-channel device
    pub fn single(on: bool) -> Self {
        Self::new().with_channel(0, on)
    }

    /// Set one channel, keeping channels sorted by index
    pub fn with_channel(mut self, channel: u8, on: bool) -> Self {
        match self.channels.binary_search_by_key(&channel, |c| c.channel) {
            Ok(pos) => self.channels[pos].on = on,
            Err(pos) => self.channels.insert(pos, ToggleChannel { channel, on }),
        }
        self
    }

    /// State of `channel`, if it was reported
    pub fn is_on(&self, channel: u8) -> Option<bool> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| c.on)
    }

    /// Reported channels
    pub fn channels(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.channels.iter().map(|c| (c.channel, c.on))
    }
}

/// Light colour and brightness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightState {
    /// Current colour
    pub rgb: Rgb,
    /// Brightness, 0 to 100
    pub luminance: u8,
}

/// Hardware and firmware description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Hardware model, e.g. "mss310"
    pub hardware_type: String,
    /// Hardware revision
    pub hardware_version: String,
    /// Installed firmware version
    pub firmware_version: String,
    /// MAC address of the device
    pub mac_address: String,
    /// LAN address, when the device reports one
    #[serde(default)]
    pub lan_ip: Option<String>,
}

/// Instant electricity reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectricityReading {
    /// Power in watts
    pub power_w: f64,
    /// Voltage in volts
    pub voltage_v: f64,
    /// Current in amperes
    pub current_a: f64,
}

/// One capability's worth of state, as carried in a state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "capability", content = "state", rename_all = "snake_case")]
pub enum CapabilityState {
    /// Toggle block
    Toggle(ToggleState),
    /// Light block
    Light(LightState),
    /// System information block
    SystemInfo(SystemInfo),
    /// Electricity block
    Electricity(ElectricityReading),
}

impl CapabilityState {
    /// The capability this block belongs to
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityState::Toggle(_) => Capability::Toggle,
            CapabilityState::Light(_) => Capability::Light,
            CapabilityState::SystemInfo(_) => Capability::SystemInfo,
            CapabilityState::Electricity(_) => Capability::Electricity,
        }
    }
}

/// Cached state of one device: one optional block per capability
///
/// `None` means "never fetched". Blocks are only ever written for
/// capabilities in the owning device's [`CapabilitySet`].
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CapabilityCache {
    pub(crate) toggle: Option<ToggleState>,
    pub(crate) light: Option<LightState>,
    pub(crate) system: Option<SystemInfo>,
    pub(crate) electricity: Option<ElectricityReading>,
}

impl CapabilityCache {
    /// Build a complete cache from snapshot blocks
    ///
    /// Blocks for undeclared capabilities are dropped. Returns the first
    /// declared capability left unpopulated as the error.
    pub(crate) fn from_states<I>(declared: &CapabilitySet, states: I) -> Result<Self, Capability>
    where
        I: IntoIterator<Item = CapabilityState>,
    {
        let mut cache = Self::default();
        for state in states {
            let capability = state.capability();
            if declared.contains(capability) {
                cache.store(state);
            } else {
                tracing::trace!(%capability, "Dropping state for undeclared capability");
            }
        }

        match declared.iter().find(|c| !cache.is_populated(*c)) {
            Some(missing) => Err(missing),
            None => Ok(cache),
        }
    }

    fn store(&mut self, state: CapabilityState) {
        match state {
            CapabilityState::Toggle(s) => self.toggle = Some(s),
            CapabilityState::Light(s) => self.light = Some(s),
            CapabilityState::SystemInfo(s) => self.system = Some(s),
            CapabilityState::Electricity(s) => self.electricity = Some(s),
        }
    }

    /// Whether every accessor of `capability` would return a value
    pub(crate) fn is_populated(&self, capability: Capability) -> bool {
        match capability {
            // the master channel is what `is_on()` reads
            Capability::Toggle => self.toggle.as_ref().and_then(|t| t.is_on(0)).is_some(),
            Capability::Light => self.light.is_some(),
            Capability::SystemInfo => self.system.is_some(),
            Capability::Electricity => self.electricity.is_some(),
        }
    }
}
