//! Queryable channel identifiers.
//!
//! Every plottable value has a stable snake_case name used by the CLI and by
//! serialized queries: `motion0`..`motion7`, `temperature_bed`,
//! `humidity_door`, `co2`, `light_kitchen` and so on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::store::StreamId;

/// Number of motion channels on a node.
pub const MOTION_CHANNELS: u8 = 8;

/// Rooms with a temperature and humidity sensor, in bitstream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    /// Below the bed.
    Bed,
    /// In the bathroom.
    Bathroom,
    /// Above the door.
    Door,
}

impl Room {
    /// All rooms in bitstream order.
    pub const ALL: [Room; 3] = [Room::Bed, Room::Bathroom, Room::Door];

    /// Position of this room's fields inside the slow bitstream.
    pub const fn index(self) -> usize {
        self as usize
    }

    const fn name(self) -> &'static str {
        match self {
            Room::Bed => "bed",
            Room::Bathroom => "bathroom",
            Room::Door => "door",
        }
    }
}

/// Light sensors, in the order their means are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightSensor {
    /// Next to the bed.
    Bed,
    /// In the kitchen.
    Kitchen,
    /// Above the door.
    Door,
}

impl LightSensor {
    /// All light sensors in storage order.
    pub const ALL: [LightSensor; 3] = [LightSensor::Bed, LightSensor::Kitchen, LightSensor::Door];

    /// Position of this sensor's mean inside a slow record.
    pub const fn index(self) -> usize {
        self as usize
    }

    const fn name(self) -> &'static str {
        match self {
            LightSensor::Bed => "bed",
            LightSensor::Kitchen => "kitchen",
            LightSensor::Door => "door",
        }
    }
}

/// A single decodable series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    /// Motion sensor `0..8`.
    Motion(u8),
    /// Temperature in °C.
    Temperature(Room),
    /// Relative humidity in %.
    Humidity(Room),
    /// CO2 concentration in ppm.
    Co2,
    /// Mean light level over one slow cycle.
    Light(LightSensor),
}

impl Channel {
    /// Every channel, motion first.
    pub fn all() -> Vec<Channel> {
        let mut channels: Vec<Channel> = (0..MOTION_CHANNELS).map(Channel::Motion).collect();
        channels.extend(Room::ALL.map(Channel::Temperature));
        channels.extend(Room::ALL.map(Channel::Humidity));
        channels.push(Channel::Co2);
        channels.extend(LightSensor::ALL.map(Channel::Light));
        channels
    }

    /// The stream this channel is stored in.
    pub const fn stream(self) -> StreamId {
        match self {
            Channel::Motion(_) => StreamId::Pir,
            _ => StreamId::Atmospheric,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Motion(n) => write!(f, "motion{n}"),
            Channel::Temperature(room) => write!(f, "temperature_{}", room.name()),
            Channel::Humidity(room) => write!(f, "humidity_{}", room.name()),
            Channel::Co2 => f.write_str("co2"),
            Channel::Light(sensor) => write!(f, "light_{}", sensor.name()),
        }
    }
}

impl FromStr for Channel {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || QueryError::UnknownChannel {
            name: s.to_string(),
        };

        if s == "co2" {
            return Ok(Channel::Co2);
        }
        if let Some(n) = s.strip_prefix("motion") {
            let n: u8 = n.parse().map_err(|_| unknown())?;
            return if n < MOTION_CHANNELS {
                Ok(Channel::Motion(n))
            } else {
                Err(unknown())
            };
        }

        let room = |name: &str| Room::ALL.into_iter().find(|r| r.name() == name);
        if let Some(name) = s.strip_prefix("temperature_") {
            return room(name).map(Channel::Temperature).ok_or_else(unknown);
        }
        if let Some(name) = s.strip_prefix("humidity_") {
            return room(name).map(Channel::Humidity).ok_or_else(unknown);
        }
        if let Some(name) = s.strip_prefix("light_") {
            return LightSensor::ALL
                .into_iter()
                .find(|l| l.name() == name)
                .map(Channel::Light)
                .ok_or_else(unknown);
        }

        Err(unknown())
    }
}

impl TryFrom<String> for Channel {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}
