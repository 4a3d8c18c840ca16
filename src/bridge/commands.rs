use super::bindings::DeviceBindings;
use super::BridgeInner;
use crate::addressing::GroupAddress;
use crate::dpt::{dpt1, dpt5};
use crate::messages::{
    self, AckMessage, CommandMessage, ERR_DEVICE_UNREACHABLE, ERR_INVALID_COMMAND,
    ERR_INVALID_PARAMETERS, ERR_NOT_CONFIGURED, ERR_PROTOCOL_ERROR, ERR_TIMEOUT,
};
use crate::mqtt;
use log::{debug, warn};
use std::time::Duration;
use uuid::Uuid;

/// What a validated command looks like past the dispatcher. Raw
/// parameter maps never travel further than `parse_command`.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    On,
    Off,
    Dim { level: f64 },
    SetPosition { position: f64 },
    Stop,
}

/// A command that cannot proceed, with the ack error code to publish.
#[derive(Debug)]
pub struct CommandRejection {
    pub code: &'static str,
    pub message: String,
}

fn missing_parameter(key: &str) -> CommandRejection {
    return CommandRejection {
        code: ERR_INVALID_PARAMETERS,
        message: format!("missing '{}' parameter", key),
    };
}

fn number_parameter(msg: &CommandMessage, key: &str) -> Result<f64, CommandRejection> {
    let value = msg
        .parameters
        .as_ref()
        .and_then(|params| params.get(key))
        .ok_or_else(|| missing_parameter(key))?;

    let number = value.as_f64().ok_or_else(|| CommandRejection {
        code: ERR_INVALID_PARAMETERS,
        message: format!("'{}' must be a number between 0 and 100", key),
    })?;

    if !(0.0..=100.0).contains(&number) {
        return Err(CommandRejection {
            code: ERR_INVALID_PARAMETERS,
            message: format!("'{}' must be a number between 0 and 100", key),
        });
    }

    return Ok(number);
}

/// Validate the dynamic command envelope into the sum type.
pub fn parse_command(msg: &CommandMessage) -> Result<BridgeCommand, CommandRejection> {
    return match msg.command.as_str() {
        "on" => Ok(BridgeCommand::On),
        "off" => Ok(BridgeCommand::Off),
        "dim" => Ok(BridgeCommand::Dim { level: number_parameter(msg, "level")? }),
        "set_position" => Ok(BridgeCommand::SetPosition { position: number_parameter(msg, "position")? }),
        "stop" => Ok(BridgeCommand::Stop),
        other => Err(CommandRejection {
            code: ERR_INVALID_COMMAND,
            message: format!("unknown command {:?}", other),
        }),
    };
}

/// The telegram a command resolves to: target function, group address
/// in configured form, and encoded payload.
#[derive(Debug)]
pub struct SendPlan {
    pub function: String,
    pub ga: String,
    pub payload: Vec<u8>,
}

/// Pick the target binding and encode the payload. Dim falls back to
/// the switch address, stop to the move address.
pub fn plan_command(device: &DeviceBindings, command: &BridgeCommand) -> Result<SendPlan, CommandRejection> {
    let (candidates, payload): (&[&str], Vec<u8>) = match command {
        BridgeCommand::On => (&["switch"], dpt1::encode(true)),
        BridgeCommand::Off => (&["switch"], dpt1::encode(false)),
        BridgeCommand::Dim { level } => (&["brightness", "switch"], dpt5::encode_percent(*level)),
        BridgeCommand::SetPosition { position } => (&["position"], dpt5::encode_percent(*position)),
        /* DPT 1.007 step-stop, same wire bits as 1.001 true */
        BridgeCommand::Stop => (&["stop", "move"], dpt1::encode(true)),
    };

    for name in candidates {
        if let Some(binding) = device.functions.get(*name) {
            return Ok(SendPlan {
                function: binding.function.clone(),
                ga: binding.ga.clone(),
                payload,
            });
        }
    }

    return Err(CommandRejection {
        code: ERR_NOT_CONFIGURED,
        message: format!("device {} has no '{}' binding", device.id, candidates[0]),
    });
}

impl BridgeInner {
    /// Entry point for everything arriving on the command topic.
    pub(crate) async fn handle_command(&self, payload: String) {
        let msg: CommandMessage = match serde_json::from_str(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                /* nothing to ack without an address to publish to */
                warn!("Dropping undecodable command: {}", e);
                return;
            }
        };

        let command_id = match &msg.id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        debug!("Command {} for {}: {}", command_id, msg.device_id, msg.command);

        let device = { self.indexes.read().unwrap().devices.get(&msg.device_id).cloned() };
        let Some(device) = device else {
            let ack = AckMessage::failed(
                &command_id,
                &msg.device_id,
                "",
                ERR_NOT_CONFIGURED,
                format!("device {} is not configured", msg.device_id),
            );
            self.publish_ack(ack, &msg.device_id).await;
            return;
        };

        let command = match parse_command(&msg) {
            Ok(command) => command,
            Err(rejection) => {
                let ack = AckMessage::failed(&command_id, &msg.device_id, "", rejection.code, rejection.message);
                self.publish_ack(ack, &msg.device_id).await;
                return;
            }
        };

        let plan = match plan_command(&device, &command) {
            Ok(plan) => plan,
            Err(rejection) => {
                let ack = AckMessage::failed(&command_id, &msg.device_id, "", rejection.code, rejection.message);
                self.publish_ack(ack, &msg.device_id).await;
                return;
            }
        };

        let ga: GroupAddress = match plan.ga.parse() {
            Ok(ga) => ga,
            Err(e) => {
                let ack = AckMessage::failed(
                    &command_id,
                    &msg.device_id,
                    &plan.ga,
                    ERR_PROTOCOL_ERROR,
                    format!("invalid group address {:?}: {}", plan.ga, e),
                );
                self.publish_ack(ack, &plan.ga).await;
                return;
            }
        };

        let ga_str = ga.to_string();

        /* accepted goes out before the bus write, a failure acks again */
        self.publish_ack(AckMessage::accepted(&command_id, &msg.device_id, &ga_str), &ga_str).await;

        let mut shutdown = self.shutdown.clone();
        let send = tokio::time::timeout(Duration::from_secs(5), self.knxd.send(ga, &plan.payload));
        tokio::select! {
            _ = shutdown.changed() => {
                let ack = AckMessage::failed(
                    &command_id,
                    &msg.device_id,
                    &ga_str,
                    ERR_DEVICE_UNREACHABLE,
                    "bridge shutting down".to_string(),
                );
                self.publish_ack(ack, &ga_str).await;
            }
            result = send => match result {
                Ok(Ok(())) => {
                    debug!("Command {} written to {}", command_id, ga_str);
                }
                Ok(Err(e)) => {
                    let ack = AckMessage::failed(&command_id, &msg.device_id, &ga_str, ERR_DEVICE_UNREACHABLE, e.to_string());
                    self.publish_ack(ack, &ga_str).await;
                }
                Err(_) => {
                    let ack = AckMessage::failed(
                        &command_id,
                        &msg.device_id,
                        &ga_str,
                        ERR_TIMEOUT,
                        "send deadline exceeded".to_string(),
                    );
                    self.publish_ack(ack, &ga_str).await;
                }
            }
        }
    }

    /// Acks address by group address when one resolved, by device id
    /// before that point.
    pub(crate) async fn publish_ack(&self, ack: AckMessage, addressing: &str) {
        let topic = messages::ack_topic(&self.topic_prefix, addressing);
        match serde_json::to_string(&ack) {
            Ok(payload) => mqtt::publish(&self.mqtt, topic, payload, self.qos, false).await,
            Err(e) => warn!("Ack serialization failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::messages::AckStatus;

    fn device(yaml: &str, id: &str) -> DeviceBindings {
        let config = crate::config::Config::parse(yaml).unwrap();
        let indexes = super::super::bindings::BindingIndexes::build(&config.devices);
        return indexes.devices[id].clone();
    }

    fn command(json: &str) -> CommandMessage {
        return serde_json::from_str(json).unwrap();
    }

    #[test]
    fn test_parse_command_shapes() {
        assert_eq!(parse_command(&command(r#"{"device_id":"d","command":"on"}"#)).unwrap(), BridgeCommand::On);
        assert_eq!(parse_command(&command(r#"{"device_id":"d","command":"off"}"#)).unwrap(), BridgeCommand::Off);
        assert_eq!(
            parse_command(&command(r#"{"device_id":"d","command":"dim","parameters":{"level":75}}"#)).unwrap(),
            BridgeCommand::Dim { level: 75.0 }
        );
        assert_eq!(
            parse_command(&command(r#"{"device_id":"d","command":"set_position","parameters":{"position":40}}"#)).unwrap(),
            BridgeCommand::SetPosition { position: 40.0 }
        );
        assert_eq!(parse_command(&command(r#"{"device_id":"d","command":"stop"}"#)).unwrap(), BridgeCommand::Stop);
    }

    #[test]
    fn test_parse_command_rejections() {
        let rejection = parse_command(&command(r#"{"device_id":"d","command":"dim"}"#)).unwrap_err();
        assert_eq!(rejection.code, ERR_INVALID_PARAMETERS);
        assert!(rejection.message.contains("missing 'level' parameter"));

        let rejection = parse_command(&command(r#"{"device_id":"d","command":"dim","parameters":{"level":"high"}}"#)).unwrap_err();
        assert_eq!(rejection.code, ERR_INVALID_PARAMETERS);

        let rejection = parse_command(&command(r#"{"device_id":"d","command":"dim","parameters":{"level":150}}"#)).unwrap_err();
        assert_eq!(rejection.code, ERR_INVALID_PARAMETERS);

        let rejection = parse_command(&command(r#"{"device_id":"d","command":"explode"}"#)).unwrap_err();
        assert_eq!(rejection.code, ERR_INVALID_COMMAND);
    }

    #[test]
    fn test_plan_command_targets() {
        let device = device(SAMPLE_DEVICES, "light-living-main");

        let plan = plan_command(&device, &BridgeCommand::On).unwrap();
        assert_eq!(plan.ga, "1/2/3");
        assert_eq!(plan.payload, vec![0x01]);

        let plan = plan_command(&device, &BridgeCommand::Dim { level: 75.0 }).unwrap();
        assert_eq!(plan.ga, "1/2/5");
        assert_eq!(plan.payload, vec![0xBF]);

        let rejection = plan_command(&device, &BridgeCommand::SetPosition { position: 10.0 }).unwrap_err();
        assert_eq!(rejection.code, ERR_NOT_CONFIGURED);
    }

    #[test]
    fn test_plan_command_fallbacks() {
        let yaml = r#"
devices:
  - id: switch-only
    type: light_switch
    functions:
      switch:
        ga: 4/0/1
  - id: blind-hall
    type: blind
    functions:
      position:
        ga: 4/1/1
      move:
        ga: 4/1/2
"#;
        /* dim without a brightness binding falls back to the switch */
        let plan = plan_command(&device(yaml, "switch-only"), &BridgeCommand::Dim { level: 50.0 }).unwrap();
        assert_eq!(plan.ga, "4/0/1");
        assert_eq!(plan.payload, vec![0x80]);

        /* stop without a stop binding falls back to move */
        let plan = plan_command(&device(yaml, "blind-hall"), &BridgeCommand::Stop).unwrap();
        assert_eq!(plan.ga, "4/1/2");
        assert_eq!(plan.payload, vec![0x01]);
    }

    #[tokio::test]
    async fn test_on_command_end_to_end() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner
            .handle_command(r#"{"id":"cmd-001","device_id":"light-living-main","command":"on"}"#.to_string())
            .await;

        /* one accepted ack on the target address, nothing else */
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/ack/knx/1%2F2%2F3");
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);
        assert_eq!(ack.command_id, "cmd-001");
        assert_eq!(ack.address, "1/2/3");
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        /* and exactly one write telegram on the wire */
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), t.frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, frame_for_group_write("1/2/3", &[0x01]));

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_dim_command_and_missing_level() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner
            .handle_command(
                r#"{"id":"cmd-002","device_id":"light-living-main","command":"dim","parameters":{"level":75}}"#.to_string(),
            )
            .await;

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/ack/knx/1%2F2%2F5");
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), t.frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, frame_for_group_write("1/2/5", &[0xBF]));

        /* no level: rejected before anything reaches the bus */
        inner
            .handle_command(r#"{"id":"cmd-003","device_id":"light-living-main","command":"dim"}"#.to_string())
            .await;

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
        let error = ack.error.unwrap();
        assert_eq!(error.code, "INVALID_PARAMETERS");
        assert!(error.message.contains("missing 'level' parameter"));
        assert!(t.frames_rx.try_recv().is_err());

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_device_and_command() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner
            .handle_command(r#"{"id":"cmd-004","device_id":"ghost","command":"on"}"#.to_string())
            .await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/ack/knx/ghost");
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.error.unwrap().code, "NOT_CONFIGURED");

        inner
            .handle_command(r#"{"id":"cmd-005","device_id":"light-living-main","command":"warp"}"#.to_string())
            .await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.error.unwrap().code, "INVALID_COMMAND");

        /* broken JSON: dropped without an ack */
        inner.handle_command("not json".to_string()).await;
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_ga_in_binding() {
        let yaml = r#"
devices:
  - id: broken-light
    type: light_switch
    functions:
      switch:
        ga: 99/9/9
"#;
        let mut t = build_test_bridge(yaml).await;
        let inner = t.bridge.inner();

        inner
            .handle_command(r#"{"id":"cmd-006","device_id":"broken-light","command":"on"}"#.to_string())
            .await;

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let ack: AckMessage = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
        assert_eq!(ack.error.unwrap().code, "PROTOCOL_ERROR");
        assert!(t.frames_rx.try_recv().is_err());

        t.bridge.stop().await;
    }
}
