use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which directions a group-address binding participates in.
/// `write`: the bridge sends writes here. `read`: the bridge may issue
/// read requests. `transmit`: the device pushes values here, so the
/// bridge maps incoming telegrams on this address to state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub transmit: bool,
}

impl Flags {
    pub const fn write() -> Self {
        return Flags { read: false, write: true, transmit: false };
    }

    pub const fn read_write() -> Self {
        return Flags { read: true, write: true, transmit: false };
    }

    pub const fn transmit() -> Self {
        return Flags { read: false, write: false, transmit: true };
    }

    pub const fn read_transmit() -> Self {
        return Flags { read: true, write: false, transmit: true };
    }
}

/// One entry of the authoritative device-function table.
#[derive(Debug)]
pub struct FunctionSpec {
    pub name: &'static str,
    /// JSON property the decoded value is published under.
    pub state_key: &'static str,
    pub default_dpt: &'static str,
    pub default_flags: Flags,
    pub aliases: &'static [&'static str],
}

/// Canonical device functions. Status variants are what devices push
/// (`transmit`), the bare names are what the bridge writes to.
static CATALOGUE: &[FunctionSpec] = &[
    FunctionSpec { name: "switch", state_key: "on", default_dpt: "1.001", default_flags: Flags::write(), aliases: &["on_off", "switching"] },
    FunctionSpec { name: "switch_status", state_key: "on", default_dpt: "1.001", default_flags: Flags::read_transmit(), aliases: &["state", "switch_state"] },
    FunctionSpec { name: "brightness", state_key: "level", default_dpt: "5.001", default_flags: Flags::write(), aliases: &["dim", "dimming", "level"] },
    FunctionSpec { name: "brightness_status", state_key: "level", default_dpt: "5.001", default_flags: Flags::read_transmit(), aliases: &["dim_status", "level_status"] },
    FunctionSpec { name: "position", state_key: "position", default_dpt: "5.001", default_flags: Flags::write(), aliases: &["height"] },
    FunctionSpec { name: "position_status", state_key: "position", default_dpt: "5.001", default_flags: Flags::read_transmit(), aliases: &["height_status"] },
    FunctionSpec { name: "slat", state_key: "slat", default_dpt: "5.001", default_flags: Flags::write(), aliases: &["tilt", "angle"] },
    FunctionSpec { name: "slat_status", state_key: "slat", default_dpt: "5.001", default_flags: Flags::read_transmit(), aliases: &["tilt_status", "angle_status"] },
    FunctionSpec { name: "move", state_key: "move", default_dpt: "1.008", default_flags: Flags::write(), aliases: &["up_down"] },
    /* stop is DPT 1.007, even though the wire bits match 1.001 true */
    FunctionSpec { name: "stop", state_key: "stop", default_dpt: "1.007", default_flags: Flags::write(), aliases: &["step_stop"] },
    FunctionSpec { name: "scene", state_key: "scene", default_dpt: "17.001", default_flags: Flags::write(), aliases: &[] },
    FunctionSpec { name: "color", state_key: "color", default_dpt: "232.600", default_flags: Flags::write(), aliases: &["rgb"] },
    FunctionSpec { name: "temperature", state_key: "temperature", default_dpt: "9.001", default_flags: Flags::read_transmit(), aliases: &["temp"] },
    FunctionSpec { name: "humidity", state_key: "humidity", default_dpt: "9.007", default_flags: Flags::read_transmit(), aliases: &[] },
    FunctionSpec { name: "lux", state_key: "lux", default_dpt: "9.004", default_flags: Flags::read_transmit(), aliases: &["illuminance", "light_level"] },
    FunctionSpec { name: "presence", state_key: "presence", default_dpt: "1.018", default_flags: Flags::transmit(), aliases: &["occupancy"] },
    FunctionSpec { name: "motion", state_key: "motion", default_dpt: "1.002", default_flags: Flags::transmit(), aliases: &["movement"] },
];

lazy_static! {
    static ref BY_NAME: HashMap<&'static str, &'static FunctionSpec> = {
        let mut map = HashMap::new();
        for spec in CATALOGUE {
            map.insert(spec.name, spec);
        }
        map
    };
    static ref BY_ALIAS: HashMap<&'static str, &'static FunctionSpec> = {
        let mut map = HashMap::new();
        for spec in CATALOGUE {
            for alias in spec.aliases {
                map.insert(*alias, spec);
            }
        }
        map
    };
    /// Per-channel variants for infrastructure devices such as switch
    /// actuators, e.g. ch_b_switch or channel_c_brightness_status.
    static ref CHANNEL_PREFIXES: Vec<String> = {
        let mut prefixes = Vec::new();
        for c in 'a'..='l' {
            prefixes.push(format!("ch_{}_", c));
        }
        for c in 'a'..='h' {
            prefixes.push(format!("channel_{}_", c));
        }
        prefixes
    };
}

/// How a function name resolved against the catalogue.
#[derive(Debug)]
pub struct Resolution {
    /// Key the decoded value is published under; keeps the channel prefix,
    /// so ch_b_switch_status resolves to ch_b_on.
    pub state_key: String,
    pub spec: Option<&'static FunctionSpec>,
    pub channel_prefix: Option<String>,
}

fn lookup(name: &str) -> Option<&'static FunctionSpec> {
    if let Some(spec) = BY_NAME.get(name) {
        return Some(*spec);
    }
    return BY_ALIAS.get(name).copied();
}

/// Resolve a configured function name: canonical lookup, then alias
/// lookup, then channel-prefix strip and lookup on the remainder. Names
/// the catalogue does not know pass through as their own state key.
pub fn resolve(name: &str) -> Resolution {
    if let Some(spec) = lookup(name) {
        return Resolution {
            state_key: spec.state_key.to_string(),
            spec: Some(spec),
            channel_prefix: None,
        };
    }

    for prefix in CHANNEL_PREFIXES.iter() {
        if let Some(rest) = name.strip_prefix(prefix.as_str()) {
            if let Some(spec) = lookup(rest) {
                return Resolution {
                    state_key: format!("{}{}", prefix, spec.state_key),
                    spec: Some(spec),
                    channel_prefix: Some(prefix.clone()),
                };
            }
        }
    }

    return Resolution {
        state_key: name.to_string(),
        spec: None,
        channel_prefix: None,
    };
}

/// Default DPT for a function name, if the catalogue knows it.
pub fn default_dpt(name: &str) -> Option<&'static str> {
    return resolve(name).spec.map(|spec| spec.default_dpt);
}

/// Default communication flags for a function name.
pub fn default_flags(name: &str) -> Option<Flags> {
    return resolve(name).spec.map(|spec| spec.default_flags);
}
