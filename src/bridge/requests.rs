use super::BridgeInner;
use crate::addressing::GroupAddress;
use crate::messages::{
    self, RequestMessage, ResponseMessage, ERR_BRIDGE_ERROR, ERR_INVALID_COMMAND,
    ERR_INVALID_PARAMETERS, ERR_NOT_CONFIGURED, ERR_TIMEOUT,
};
use crate::mqtt;
use log::{debug, warn};
use serde_json::json;
use std::time::Duration;

/// Pause between consecutive read requests so read_all does not flood
/// the bus.
const INTER_READ_THROTTLE: Duration = Duration::from_millis(50);
const READ_ALL_DEADLINE: Duration = Duration::from_secs(30);

impl BridgeInner {
    /// Entry point for everything arriving on the request topic.
    pub(crate) async fn handle_request(&self, payload: String) {
        let msg: RequestMessage = match serde_json::from_str(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping undecodable request: {}", e);
                return;
            }
        };

        let Some(request_id) = msg.request_id.clone() else {
            warn!("Dropping request without request_id");
            return;
        };
        debug!("Request {} action {}", request_id, msg.action);

        let response = match msg.action.as_str() {
            "read_state" => self.read_state(&msg, &request_id).await,
            "read_all" => self.read_all(&request_id).await,
            other => ResponseMessage::failed(&request_id, ERR_INVALID_COMMAND, format!("unknown action {:?}", other)),
        };

        let topic = messages::response_topic(&self.topic_prefix, &request_id);
        match serde_json::to_string(&response) {
            Ok(payload) => mqtt::publish(&self.mqtt, topic, payload, self.qos, false).await,
            Err(e) => warn!("Response serialization failed: {}", e),
        }
    }

    /// Fire a read request at every readable binding of one device. The
    /// answers arrive asynchronously as ordinary telegrams, so the
    /// response only confirms the requests went out.
    async fn read_state(&self, msg: &RequestMessage, request_id: &str) -> ResponseMessage {
        let Some(device_id) = &msg.device_id else {
            return ResponseMessage::failed(request_id, ERR_INVALID_PARAMETERS, "read_state requires device_id".to_string());
        };

        let device = { self.indexes.read().unwrap().devices.get(device_id).cloned() };
        let Some(device) = device else {
            return ResponseMessage::failed(request_id, ERR_NOT_CONFIGURED, format!("device {} is not configured", device_id));
        };

        for binding in device.functions.values() {
            if !binding.flags.read {
                continue;
            }
            let ga: GroupAddress = match binding.ga.parse() {
                Ok(ga) => ga,
                Err(e) => {
                    warn!("Skipping unreadable group address {:?}: {}", binding.ga, e);
                    continue;
                }
            };
            if let Err(e) = self.knxd.send_read(ga).await {
                warn!("Read request to {} failed: {}", ga, e);
            }
        }

        return ResponseMessage::success(
            request_id,
            json!({"message": "read requests sent, state updates will follow"}),
        );
    }

    /// Walk every readable binding of every device, 50 ms apart, under a
    /// 30 second deadline.
    async fn read_all(&self, request_id: &str) -> ResponseMessage {
        let targets: Vec<GroupAddress> = {
            let indexes = self.indexes.read().unwrap();
            let mut targets = Vec::new();
            let mut device_ids: Vec<&String> = indexes.devices.keys().collect();
            device_ids.sort();
            for device_id in device_ids {
                let mut names: Vec<&String> = indexes.devices[device_id].functions.keys().collect();
                names.sort();
                for name in names {
                    let binding = &indexes.devices[device_id].functions[name];
                    if !binding.flags.read {
                        continue;
                    }
                    match binding.ga.parse() {
                        Ok(ga) => targets.push(ga),
                        Err(e) => warn!("Skipping unreadable group address {:?}: {}", binding.ga, e),
                    }
                }
            }
            targets
        };

        let mut shutdown = self.shutdown.clone();
        let work = async {
            let mut reads_sent: u64 = 0;
            for (i, ga) in targets.iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = shutdown.changed() => return Err(()),
                        _ = tokio::time::sleep(INTER_READ_THROTTLE) => {}
                    }
                }
                match self.knxd.send_read(*ga).await {
                    Ok(()) => reads_sent += 1,
                    Err(e) => warn!("read_all request to {} failed: {}", ga, e),
                }
            }
            return Ok(reads_sent);
        };

        return match tokio::time::timeout(READ_ALL_DEADLINE, work).await {
            Ok(Ok(reads_sent)) => ResponseMessage::success(
                request_id,
                json!({"reads_sent": reads_sent, "message": format!("sent {} read requests", reads_sent)}),
            ),
            Ok(Err(())) => ResponseMessage::failed(request_id, ERR_BRIDGE_ERROR, "bridge shutting down".to_string()),
            Err(_) => ResponseMessage::failed(request_id, ERR_TIMEOUT, "read_all deadline exceeded".to_string()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::knxd::proto::{encode_frame, encode_group_apdu, Apci, EIB_GROUP_PACKET};
    use std::time::{Duration, Instant};

    fn read_frame_for(ga: &str) -> Vec<u8> {
        let apdu = encode_group_apdu(ga.parse().unwrap(), Apci::Read, &[]).unwrap();
        return encode_frame(EIB_GROUP_PACKET, &apdu).unwrap();
    }

    #[tokio::test]
    async fn test_read_state_sends_reads_and_responds() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner
            .handle_request(r#"{"request_id":"req-1","action":"read_state","device_id":"light-living-main"}"#.to_string())
            .await;

        /* the only read-flagged binding of the light is brightness */
        let frame = tokio::time::timeout(Duration::from_secs(1), t.frames_rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, read_frame_for("1/2/5"));
        assert!(t.frames_rx.try_recv().is_err());

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/response/knx/req-1");
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["success"], true);
        assert!(body["data"]["message"].as_str().unwrap().contains("read requests sent"));

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_read_all_throttles_between_reads() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner.handle_request(r#"{"request_id":"req-2","action":"read_all"}"#.to_string()).await;

        let first = tokio::time::timeout(Duration::from_secs(1), t.frames_rx.recv()).await.unwrap().unwrap();
        let first_at = Instant::now();
        let second = tokio::time::timeout(Duration::from_secs(1), t.frames_rx.recv()).await.unwrap().unwrap();
        let gap = first_at.elapsed();

        /* device ids sort light-living-main before sensor-hall */
        assert_eq!(first, read_frame_for("1/2/5"));
        assert_eq!(second, read_frame_for("3/1/2"));
        assert!(gap >= Duration::from_millis(40), "reads only {:?} apart", gap);

        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        assert_eq!(publish.topic, "graylogic/response/knx/req-2");
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["reads_sent"], 2);

        t.bridge.stop().await;
    }

    #[tokio::test]
    async fn test_request_error_paths() {
        let mut t = build_test_bridge(SAMPLE_DEVICES).await;
        let inner = t.bridge.inner();

        inner.handle_request(r#"{"request_id":"req-3","action":"discover"}"#.to_string()).await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_COMMAND");

        inner.handle_request(r#"{"request_id":"req-4","action":"read_state"}"#.to_string()).await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["error"]["code"], "INVALID_PARAMETERS");

        inner
            .handle_request(r#"{"request_id":"req-5","action":"read_state","device_id":"ghost"}"#.to_string())
            .await;
        let publish = next_publish(&mut t.mqtt_rx).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["error"]["code"], "NOT_CONFIGURED");

        /* no request_id: nothing to respond to */
        inner.handle_request(r#"{"action":"read_all"}"#.to_string()).await;
        assert!(try_next_publish(&mut t.mqtt_rx).is_none());

        t.bridge.stop().await;
    }
}
