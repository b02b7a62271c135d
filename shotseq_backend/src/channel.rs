//! Channel identifiers, per-device channel sets and typed front-panel values.
//!
//! ## Channel identifiers
//!
//! Every output a device exposes is named by a [`ChannelId`]. The set of
//! identifiers is closed: analog outputs (`ao(number)`), digital lines
//! (`port(number)/line(number)`) and the three register fields of a DDS
//! synthesizer (`dds(number)/freq`, `dds(number)/amp`, `dds(number)/phase`).
//! The string form is the one a hardware driver expects, and round-trips
//! through [`std::fmt::Display`] and [`std::str::FromStr`].
//!
//! ## Channel sets
//!
//! A [`ChannelSet`] is the device-wide description of which channels exist,
//! their allowed range and their output resolution. It also records whether
//! the device link is fast enough for incremental ("smart") programming of
//! single instruction rows. Values written in manual mode are coerced
//! (clamped and quantized) by [`ChannelSet::coerce`] before they go out.
//!
//! ## Channel values
//!
//! [`ChannelValues`] replaces loosely-typed front-panel dictionaries: it can only
//! be built against a channel set, so every key is known to the device.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TableError;

const CHAN_NAME_PATTERN: &str = r"^(?:ao(\d+)|port(\d+)/line(\d+)|dds(\d+)/(freq|amp|phase))$";

/// Register field of a DDS channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DdsField {
    Freq,
    Amp,
    Phase,
}
impl fmt::Display for DdsField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DdsField::Freq => "freq",
                DdsField::Amp => "amp",
                DdsField::Phase => "phase",
            }
        )
    }
}

/// Closed set of output channel identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelId {
    Analog(u32),
    Digital { port: u32, line: u32 },
    Dds { idx: u32, field: DdsField },
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelId::Analog(idx) => write!(f, "ao{idx}"),
            ChannelId::Digital { port, line } => write!(f, "port{port}/line{line}"),
            ChannelId::Dds { idx, field } => write!(f, "dds{idx}/{field}"),
        }
    }
}

impl FromStr for ChannelId {
    type Err = TableError;

    /// Parses the hardware naming convention.
    ///
    /// ```
    /// use shotseq_backend::channel::*;
    ///
    /// assert_eq!("ao3".parse::<ChannelId>().unwrap(), ChannelId::Analog(3));
    /// assert_eq!(
    ///     "port0/line7".parse::<ChannelId>().unwrap(),
    ///     ChannelId::Digital { port: 0, line: 7 }
    /// );
    /// assert!("ao".parse::<ChannelId>().is_err());
    /// ```
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let bad_name = || TableError::BadChannelName(name.to_string());
        let re = Regex::new(CHAN_NAME_PATTERN).map_err(|_| bad_name())?;
        let caps = re.captures(name).ok_or_else(bad_name)?;
        let num = |i: usize| -> Result<u32, TableError> {
            caps.get(i)
                .ok_or_else(bad_name)?
                .as_str()
                .parse::<u32>()
                .map_err(|_| bad_name())
        };

        if caps.get(1).is_some() {
            Ok(ChannelId::Analog(num(1)?))
        } else if caps.get(2).is_some() {
            Ok(ChannelId::Digital {
                port: num(2)?,
                line: num(3)?,
            })
        } else {
            let field = match caps.get(5).map(|m| m.as_str()) {
                Some("freq") => DdsField::Freq,
                Some("amp") => DdsField::Amp,
                Some("phase") => DdsField::Phase,
                _ => return Err(bad_name()),
            };
            Ok(ChannelId::Dds { idx: num(4)?, field })
        }
    }
}

impl TryFrom<String> for ChannelId {
    type Error = TableError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(value: ChannelId) -> Self {
        value.to_string()
    }
}

/// Range and resolution of a single output channel.
///
/// `resolution == 0.0` disables quantization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}
impl ChannelSpec {
    pub fn new(id: ChannelId, min: f64, max: f64, resolution: f64) -> Result<Self, TableError> {
        if !(min.is_finite() && max.is_finite() && min <= max && resolution >= 0.0) {
            return Err(TableError::BadChannelSpec {
                chan: id.to_string(),
                min,
                max,
                resolution,
            });
        }
        Ok(Self {
            id,
            min,
            max,
            resolution,
        })
    }

    /// Clamps `value` into `[min, max]` and rounds it to the nearest multiple of `resolution`.
    ///
    /// ```
    /// use shotseq_backend::channel::*;
    ///
    /// let spec = ChannelSpec::new(ChannelId::Analog(0), -10.0, 10.0, 0.5).unwrap();
    /// assert_eq!(spec.coerce(1.3), 1.5);
    /// assert_eq!(spec.coerce(12.0), 10.0);
    /// ```
    pub fn coerce(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        if self.resolution > 0.0 {
            ((clamped / self.resolution).round() * self.resolution).clamp(self.min, self.max)
        } else {
            clamped
        }
    }
}

/// Device-wide channel description. Also see the [module docs](self).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSet {
    device: String,
    chans: IndexMap<ChannelId, ChannelSpec>,
    smart_programming: bool,
}

impl ChannelSet {
    /// Creates an empty channel set.
    ///
    /// `smart_programming` states whether the device link supports cheap single-row
    /// writes. Devices without it always receive full table rewrites.
    pub fn new(device: &str, smart_programming: bool) -> Self {
        Self {
            device: device.to_string(),
            chans: IndexMap::new(),
            smart_programming,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }
    pub fn smart_programming(&self) -> bool {
        self.smart_programming
    }
    pub fn len(&self) -> usize {
        self.chans.len()
    }
    pub fn is_empty(&self) -> bool {
        self.chans.is_empty()
    }
    pub fn ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.chans.keys()
    }
    pub fn contains(&self, id: &ChannelId) -> bool {
        self.chans.contains_key(id)
    }

    /// Registers a new channel by its hardware name.
    ///
    /// # Errors
    /// - [`TableError::BadChannelName`] if `name` does not follow the naming convention.
    /// - [`TableError::DuplicateChannel`] if the channel is already registered.
    /// - [`TableError::BadChannelSpec`] for an empty range or negative resolution.
    pub fn add_channel(
        &mut self,
        name: &str,
        min: f64,
        max: f64,
        resolution: f64,
    ) -> Result<ChannelId, TableError> {
        let id: ChannelId = name.parse()?;
        if self.chans.contains_key(&id) {
            return Err(TableError::DuplicateChannel(name.to_string()));
        }
        let spec = ChannelSpec::new(id, min, max, resolution)?;
        self.chans.insert(id, spec);
        Ok(id)
    }

    /// Shortcut to borrow the spec of a registered channel
    pub fn spec(&self, id: &ChannelId) -> Result<&ChannelSpec, TableError> {
        self.chans.get(id).ok_or_else(|| TableError::UnknownChannel {
            device: self.device.clone(),
            chan: id.to_string(),
        })
    }

    /// Returns the values actually applied by the hardware: each value clamped and quantized.
    pub fn coerce(&self, values: &ChannelValues) -> Result<ChannelValues, TableError> {
        let mut coerced = IndexMap::with_capacity(values.len());
        for (id, val) in values.iter() {
            coerced.insert(*id, self.spec(id)?.coerce(*val));
        }
        Ok(ChannelValues { vals: coerced })
    }
}

/// Typed map of channel values, validated against a [`ChannelSet`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelValues {
    vals: IndexMap<ChannelId, f64>,
}

impl ChannelValues {
    /// Builds channel values, rejecting channels the device does not have.
    pub fn new(set: &ChannelSet, vals: IndexMap<ChannelId, f64>) -> Result<Self, TableError> {
        for id in vals.keys() {
            set.spec(id)?;
        }
        Ok(Self { vals })
    }

    /// Same as [`ChannelValues::new`] but with hardware channel names as keys.
    ///
    /// ```
    /// use shotseq_backend::channel::*;
    ///
    /// let mut set = ChannelSet::new("Dev1", true);
    /// set.add_channel("ao0", -10.0, 10.0, 0.0).unwrap();
    /// let vals = ChannelValues::from_names(&set, [("ao0", 1.0)]).unwrap();
    /// assert_eq!(vals.get(&ChannelId::Analog(0)), Some(1.0));
    /// assert!(ChannelValues::from_names(&set, [("ao1", 1.0)]).is_err());
    /// ```
    pub fn from_names<'a, I>(set: &ChannelSet, vals: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut map = IndexMap::new();
        for (name, val) in vals {
            map.insert(name.parse::<ChannelId>()?, val);
        }
        Self::new(set, map)
    }

    pub fn get(&self, id: &ChannelId) -> Option<f64> {
        self.vals.get(id).copied()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelId, &f64)> {
        self.vals.iter()
    }
    pub fn len(&self) -> usize {
        self.vals.len()
    }
    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    /// Overwrites (or adds) every value present in `other`
    pub fn merge(&mut self, other: &ChannelValues) {
        for (id, val) in other.iter() {
            self.vals.insert(*id, *val);
        }
    }
}
