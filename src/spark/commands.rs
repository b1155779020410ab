//! Typed operations against a connected pod.
//!
//! Reads go through `GET v/<verb>`, writes through `POST f/<verb>?<value>`;
//! every call rides the session's request queue and blocks until the pod
//! acknowledges. Verb responses are short ASCII strings, sometimes wrapped
//! in double quotes by the firmware.
//!
//! A verb that comes back unparseable is logged and left at its zero value —
//! one flaky sensor reading should not fail a whole status poll. A transport
//! failure (session gone, timeout) fails the call.

use coap_lite::RequestType;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PodError, Result};
use crate::spark::coap;
use crate::spark::session::Session;

/// Which half of the mattress an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedSide {
    Left,
    Right,
}

/// Snapshot of everything the pod reports through the `v/` verbs.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PodStatus {
    pub heat_level_left: i32,
    pub heat_level_right: i32,
    pub target_heat_level_left: i32,
    pub target_heat_level_right: i32,
    pub heat_time_left: i32,
    pub heat_time_right: i32,
    pub priming: bool,
    pub water_level: bool,
    pub updating: bool,
    pub sensor_label: String,
    pub ssid: String,
    pub hub_info: String,
    pub mac_address: String,
    pub ip_address: String,
    pub signal_strength: String,
    pub settings: String,
}

/// Alarm parameters as the firmware encodes them on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct AlarmParams {
    #[serde(rename = "pl")]
    intensity: i64,
    #[serde(rename = "du")]
    duration: i64,
    #[serde(rename = "tt")]
    time: u64,
    #[serde(rename = "pi")]
    pattern: String,
}

/// Poll the full verb table and collate the result.
pub async fn get_status(session: &Session) -> Result<PodStatus> {
    Ok(PodStatus {
        heat_level_left: parse_int(&get_verb(session, "heatLevelL").await?, "heatLevelL"),
        heat_level_right: parse_int(&get_verb(session, "heatLevelR").await?, "heatLevelR"),
        target_heat_level_left: parse_int(&get_verb(session, "tgHeatLevelL").await?, "tgHeatLevelL"),
        target_heat_level_right: parse_int(&get_verb(session, "tgHeatLevelR").await?, "tgHeatLevelR"),
        heat_time_left: parse_int(&get_verb(session, "heatTimeL").await?, "heatTimeL"),
        heat_time_right: parse_int(&get_verb(session, "heatTimeR").await?, "heatTimeR"),
        priming: parse_bool(&get_verb(session, "priming").await?),
        water_level: parse_bool(&get_verb(session, "waterLevel").await?),
        updating: parse_bool(&get_verb(session, "updating").await?),
        sensor_label: parse_string(&get_verb(session, "sensorLabel").await?),
        ssid: parse_string(&get_verb(session, "ssid").await?),
        hub_info: parse_string(&get_verb(session, "hubInfo").await?),
        mac_address: parse_string(&get_verb(session, "macAddr").await?),
        ip_address: parse_string(&get_verb(session, "ipaddr").await?),
        signal_strength: parse_string(&get_verb(session, "sigstr").await?),
        settings: parse_string(&get_verb(session, "settings").await?),
    })
}

/// Set the heat duration in seconds for one side.
pub async fn set_time(session: &Session, seconds: i32, side: BedSide) -> Result<()> {
    let path = match side {
        BedSide::Left => "leftHeat",
        BedSide::Right => "rightHeat",
    };
    set_value(session, path, &seconds.to_string()).await
}

/// Set the target heat level for one side.
pub async fn set_level(session: &Session, level: i32, side: BedSide) -> Result<()> {
    let path = match side {
        BedSide::Left => "leftLevel",
        BedSide::Right => "rightLevel",
    };
    set_value(session, path, &level.to_string()).await
}

/// Generic setter: `POST f/<path>?<value>`.
pub async fn set_value(session: &Session, path: &str, value: &str) -> Result<()> {
    session
        .submit(coap::request(RequestType::Post, &["f", path], Some(value)))
        .await?;
    Ok(())
}

/// Start priming the water loop.
pub async fn prime(session: &Session) -> Result<()> {
    set_value(session, "prime", "true").await
}

/// Push an opaque settings string down to the pod.
pub async fn set_settings(session: &Session, value: &str) -> Result<()> {
    set_value(session, "setsettings", value).await
}

/// Schedule an alarm from hex-encoded CBOR parameters.
pub async fn set_alarm(session: &Session, side: BedSide, input: &str) -> Result<()> {
    let normalized = normalize_alarm(input)?;
    let path = match side {
        BedSide::Left => "alarmL",
        BedSide::Right => "alarmR",
    };
    set_value(session, path, &normalized).await
}

/// Clear all scheduled alarms.
pub async fn clear_alarms(session: &Session) -> Result<()> {
    session
        .submit(coap::request(RequestType::Post, &["f", "clearAlarms"], None))
        .await?;
    Ok(())
}

/// Re-encode caller-supplied alarm parameters for the wire.
///
/// Newer apps send pattern `"rise"`, which older pod firmware rejects; it is
/// rewritten to `"single"` before re-encoding.
pub fn normalize_alarm(input: &str) -> Result<String> {
    let data = hex::decode(input)?;
    let mut params: AlarmParams =
        ciborium::from_reader(&data[..]).map_err(|e| PodError::CborDecode(e.to_string()))?;

    if params.pattern == "rise" {
        params.pattern = "single".to_string();
    }

    let mut encoded = Vec::new();
    ciborium::into_writer(&params, &mut encoded)
        .map_err(|e| PodError::CborEncode(e.to_string()))?;
    Ok(hex::encode(encoded))
}

async fn get_verb(session: &Session, verb: &str) -> Result<Vec<u8>> {
    session
        .submit(coap::request(RequestType::Get, &["v", verb], None))
        .await
}

fn parse_int(raw: &[u8], verb: &str) -> i32 {
    let text = String::from_utf8_lossy(raw);
    match text.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(verb, response = %text, "could not parse integer verb response");
            0
        }
    }
}

fn parse_bool(raw: &[u8]) -> bool {
    raw == b"true"
}

/// Strip one leading and one trailing double quote, if present.
fn parse_string(raw: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(raw).into_owned();
    if s.starts_with('"') {
        s.remove(0);
    }
    if s.ends_with('"') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::spark::testutil::{read_message, TestPod};
    use std::sync::Arc;

    #[test]
    fn test_parse_string_strips_quotes() {
        assert_eq!(parse_string(b"\"TestPod\""), "TestPod");
        assert_eq!(parse_string(b"TestPod"), "TestPod");
        assert_eq!(parse_string(b"\"unterminated"), "unterminated");
        assert_eq!(parse_string(b""), "");
    }

    #[test]
    fn test_parse_int_degrades_to_zero() {
        assert_eq!(parse_int(b"42", "heatLevelL"), 42);
        assert_eq!(parse_int(b"-7", "heatLevelL"), -7);
        assert_eq!(parse_int(b"soup", "heatLevelR"), 0);
        assert_eq!(parse_int(b"", "heatLevelR"), 0);
    }

    #[test]
    fn test_parse_bool_is_strict() {
        assert!(parse_bool(b"true"));
        assert!(!parse_bool(b"false"));
        assert!(!parse_bool(b"TRUE"));
        assert!(!parse_bool(b""));
    }

    fn alarm_hex(pattern: &str) -> String {
        let params = AlarmParams {
            intensity: 50,
            duration: 60,
            time: 1_700_000_000,
            pattern: pattern.to_string(),
        };
        let mut encoded = Vec::new();
        ciborium::into_writer(&params, &mut encoded).unwrap();
        hex::encode(encoded)
    }

    #[test]
    fn test_normalize_alarm_rewrites_rise() {
        let normalized = normalize_alarm(&alarm_hex("rise")).unwrap();
        let decoded: AlarmParams =
            ciborium::from_reader(hex::decode(normalized).unwrap().as_slice()).unwrap();
        assert_eq!(decoded.pattern, "single");
        assert_eq!(decoded.intensity, 50);
        assert_eq!(decoded.duration, 60);
        assert_eq!(decoded.time, 1_700_000_000);
    }

    #[test]
    fn test_normalize_alarm_leaves_other_patterns() {
        let normalized = normalize_alarm(&alarm_hex("double")).unwrap();
        let decoded: AlarmParams =
            ciborium::from_reader(hex::decode(normalized).unwrap().as_slice()).unwrap();
        assert_eq!(decoded.pattern, "double");
    }

    #[test]
    fn test_normalize_alarm_rejects_bad_input() {
        assert!(normalize_alarm("zz").is_err());
        assert!(normalize_alarm("00").is_err());
    }

    /// Answer each incoming `GET v/<verb>` from a canned table.
    async fn answer_verbs(pod: &mut TestPod, count: usize) {
        for _ in 0..count {
            let request = read_message(pod).await;
            let path = coap::path_of(&request);
            let verb = path.rsplit('/').next().unwrap();
            let body: &[u8] = match verb {
                "heatLevelL" => b"42",
                "heatLevelR" => b"not-a-number",
                "tgHeatLevelL" => b"50",
                "tgHeatLevelR" => b"45",
                "heatTimeL" => b"3",
                "heatTimeR" => b"0",
                "priming" => b"true",
                "waterLevel" => b"false",
                "updating" => b"false",
                "sensorLabel" => b"\"TestPod\"",
                "ssid" => b"\"lab-wifi\"",
                "hubInfo" => b"hub-1",
                "macAddr" => b"aa:bb:cc:dd:ee:ff",
                "ipaddr" => b"10.0.0.2",
                "sigstr" => b"-61",
                "settings" => b"\"{}\"",
                other => panic!("unexpected verb {other}"),
            };
            pod.send(&coap::content_ack(&request, body.to_vec())).await;
        }
    }

    #[tokio::test]
    async fn test_get_status_collates_and_degrades() {
        let mut pod = TestPod::connect(Config::default()).await;
        let session = pod.session().await;

        let status = tokio::spawn({
            let session = Arc::clone(&session);
            async move { get_status(&session).await }
        });
        answer_verbs(&mut pod, 16).await;
        let status = status.await.unwrap().unwrap();

        assert_eq!(status.heat_level_left, 42);
        // Unparseable reply degrades to zero instead of failing the poll.
        assert_eq!(status.heat_level_right, 0);
        assert_eq!(status.target_heat_level_left, 50);
        assert_eq!(status.target_heat_level_right, 45);
        assert_eq!(status.heat_time_left, 3);
        assert!(status.priming);
        assert!(!status.water_level);
        assert!(!status.updating);
        assert_eq!(status.sensor_label, "TestPod");
        assert_eq!(status.ssid, "lab-wifi");
        assert_eq!(status.settings, "{}");
    }

    #[tokio::test]
    async fn test_set_level_posts_to_side_path() {
        let mut pod = TestPod::connect(Config::default()).await;
        let session = pod.session().await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { set_level(&session, 80, BedSide::Right).await }
        });
        let request = read_message(&mut pod).await;
        assert_eq!(coap::path_of(&request), "/f/rightLevel");
        let query = request
            .get_option(coap_lite::CoapOption::UriQuery)
            .unwrap()
            .front()
            .unwrap()
            .clone();
        assert_eq!(query, b"80");
        pod.send(&coap::content_ack(&request, Vec::new())).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clear_alarms_has_no_query() {
        let mut pod = TestPod::connect(Config::default()).await;
        let session = pod.session().await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { clear_alarms(&session).await }
        });
        let request = read_message(&mut pod).await;
        assert_eq!(coap::path_of(&request), "/f/clearAlarms");
        assert!(request
            .get_option(coap_lite::CoapOption::UriQuery)
            .is_none());
        pod.send(&coap::content_ack(&request, Vec::new())).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_set_alarm_sends_normalized_hex() {
        let mut pod = TestPod::connect(Config::default()).await;
        let session = pod.session().await;

        let input = alarm_hex("rise");
        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { set_alarm(&session, BedSide::Right, &input).await }
        });
        let request = read_message(&mut pod).await;
        assert_eq!(coap::path_of(&request), "/f/alarmR");
        let query = request
            .get_option(coap_lite::CoapOption::UriQuery)
            .unwrap()
            .front()
            .unwrap()
            .clone();
        let decoded: AlarmParams =
            ciborium::from_reader(hex::decode(query).unwrap().as_slice()).unwrap();
        assert_eq!(decoded.pattern, "single");
        pod.send(&coap::content_ack(&request, Vec::new())).await;
        call.await.unwrap().unwrap();
    }
}
