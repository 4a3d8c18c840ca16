use crate::config::DeviceConfig;
use crate::functions::Flags;
use crate::registry::DeviceSeed;
use log::warn;
use serde_json;
use std::collections::HashMap;

/// A device function bound to a group address. The address stays in its
/// configured string form; it is parsed when a telegram is actually
/// built, so a typo surfaces as a protocol error on the command path
/// instead of silently unbinding the function.
#[derive(Debug, Clone)]
pub struct AddressBinding {
    pub function: String,
    pub ga: String,
    pub dpt: String,
    pub flags: Flags,
}

#[derive(Debug, Clone)]
pub struct DeviceBindings {
    pub id: String,
    pub device_type: String,
    pub functions: HashMap<String, AddressBinding>,
}

/// Routing entry for an incoming telegram, built only from bindings the
/// device transmits on.
#[derive(Debug, Clone)]
pub struct GaRoute {
    pub device_id: String,
    pub function: String,
    pub dpt: String,
    pub device_type: String,
}

/// The two derived indices, always rebuilt together so they never
/// disagree: group address to state route, and device to bindings.
#[derive(Default)]
pub struct BindingIndexes {
    pub devices: HashMap<String, DeviceBindings>,
    pub routes: HashMap<String, GaRoute>,
}

impl BindingIndexes {
    pub fn build(configs: &[DeviceConfig]) -> Self {
        let mut indexes = BindingIndexes::default();

        for device_config in configs {
            let mut functions = HashMap::new();

            for (name, function_config) in &device_config.functions {
                let binding = AddressBinding {
                    function: name.clone(),
                    ga: function_config.ga.clone(),
                    dpt: function_config.resolved_dpt(name),
                    flags: function_config.resolved_flags(name),
                };

                if binding.flags.transmit {
                    match binding.ga.parse::<crate::addressing::GroupAddress>() {
                        Ok(ga) => {
                            indexes.routes.insert(
                                ga.to_string(),
                                GaRoute {
                                    device_id: device_config.id.clone(),
                                    function: name.clone(),
                                    dpt: binding.dpt.clone(),
                                    device_type: device_config.device_type.clone(),
                                },
                            );
                        }
                        Err(e) => {
                            warn!("Device {} function {} has unroutable group address {:?}: {}",
                                device_config.id, name, binding.ga, e);
                        }
                    }
                }

                functions.insert(name.clone(), binding);
            }

            indexes.devices.insert(
                device_config.id.clone(),
                DeviceBindings {
                    id: device_config.id.clone(),
                    device_type: device_config.device_type.clone(),
                    functions,
                },
            );
        }

        return indexes;
    }
}

fn title_case(id: &str) -> String {
    return id
        .split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ");
}

fn refined_type(device: &DeviceBindings) -> String {
    if device.device_type != "sensor" {
        return device.device_type.clone();
    }
    if device.functions.contains_key("presence") {
        return "presence_sensor".to_string();
    }
    if device.functions.contains_key("humidity") {
        return "humidity_sensor".to_string();
    }
    if device.functions.contains_key("lux") {
        return "light_sensor".to_string();
    }
    return "temperature_sensor".to_string();
}

fn domain_for(device_type: &str) -> String {
    if device_type.starts_with("light_") || device_type == "scene" {
        return "lighting".to_string();
    }
    if device_type == "blind" {
        return "blinds".to_string();
    }
    return "sensor".to_string();
}

fn capabilities_for(device: &DeviceBindings) -> Vec<String> {
    match device.device_type.as_str() {
        "light_dimmer" => return vec!["on_off".to_string(), "dim".to_string()],
        t if t.starts_with("light_") => return vec!["on_off".to_string()],
        "scene" => return vec!["scene".to_string()],
        "blind" => {
            let mut caps = vec!["position".to_string()];
            if device.functions.contains_key("slat") || device.functions.contains_key("slat_status") {
                caps.push("tilt".to_string());
            }
            return caps;
        }
        _ => {
            /* sensors advertise a capability per bound function */
            let mut names: Vec<&String> = device.functions.keys().collect();
            names.sort();
            return names
                .iter()
                .map(|name| match name.as_str() {
                    "presence" => "presence_detect".to_string(),
                    "motion" => "motion_detect".to_string(),
                    other => format!("{}_read", other),
                })
                .collect();
        }
    }
}

/// Derive the registry seed for a device purely from its bindings.
pub fn build_seed(device: &DeviceBindings) -> DeviceSeed {
    let mut address = serde_json::Map::new();

    let mut names: Vec<&String> = device.functions.keys().collect();
    names.sort();

    let mut primary: Option<String> = None;
    for name in &names {
        let binding = &device.functions[*name];
        address.insert((*name).clone(), serde_json::Value::from(binding.ga.clone()));
        if primary.is_none() && binding.flags.write {
            primary = Some(binding.ga.clone());
        }
    }
    let primary = primary.or_else(|| names.first().map(|name| device.functions[*name].ga.clone()));
    if let Some(ga) = primary {
        address.insert("group_address".to_string(), serde_json::Value::from(ga));
    }

    return DeviceSeed {
        id: device.id.clone(),
        name: title_case(&device.id),
        device_type: refined_type(device),
        domain: domain_for(&device.device_type),
        capabilities: capabilities_for(device),
        address,
    };
}
