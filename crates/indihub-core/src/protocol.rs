//! Relay and INDI protocol types
//!
//! The cloud relay multiplexes many logical guest connections over one
//! tunnel; [`Request`] and [`Response`] are the two frame directions. The
//! INDI side is untyped XML; [`IndiElement`] is the small typed view over
//! the handful of element shapes the agent actually inspects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::xml;

/// A frame received from the cloud relay.
///
/// The very first frame on a fresh tunnel carries `conn == 0` and the
/// public endpoint string in `data`; real guest traffic uses `conn > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub conn: u32,
    pub data: Vec<u8>,
    pub closed: bool,
}

/// A frame sent to the cloud relay. Every outbound frame carries the
/// current session identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub conn: u32,
    pub data: Vec<u8>,
    pub session_id: u64,
    pub session_token: String,
}

/// Returned by the relay when a host registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub session_id: u64,
    pub session_id_public: String,
    pub token: String,
    pub agent_version: String,
}

/// Terminal summary of a solo session, delivered when the upload stream
/// is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoloSummary {
    pub images_num: u64,
}

/// Host description sent to the relay at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub token: String,
    pub profile: IndiProfile,
    pub drivers: Vec<IndiDriver>,
    pub solo_mode: bool,
    pub is_phd2: bool,
    pub is_robotic: bool,
    pub is_broadcast: bool,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
}

/// INDI-profile record as served by the INDI-server manager,
/// e.g. `{"id": 1, "name": "Simulators", "port": 7624, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndiProfile {
    pub id: u32,
    pub name: String,
    pub port: u32,
    #[serde(rename = "autostart")]
    pub auto_start: u32,
    #[serde(rename = "autoconnect")]
    pub auto_connect: u32,
}

/// INDI-driver record as served by the INDI-server manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndiDriver {
    pub binary: String,
    #[serde(default)]
    pub skeleton: Option<Value>,
    pub family: String,
    pub label: String,
    pub version: String,
    pub role: String,
    pub custom: bool,
    pub name: String,
}

/// Typed view over the INDI elements the agent inspects. Everything the
/// agent only forwards stays [`IndiElement::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndiElement {
    /// Property definition; carries the device and property names.
    DefNumberVector { device: String, name: String },
    /// Binary payload (image) frame.
    SetBlobVector { device: String },
    Message,
    DelProperty,
    GetProperties,
    Other,
}

impl IndiElement {
    /// Classify one complete XML element.
    pub fn classify(element: &[u8]) -> Self {
        let Some(tag) = xml::tag_name(element) else {
            return Self::Other;
        };
        match tag {
            b"message" => Self::Message,
            b"delProperty" => Self::DelProperty,
            b"getProperties" => Self::GetProperties,
            b"defNumberVector" => {
                let (device, name) = element_attrs(element, "defNumberVector");
                Self::DefNumberVector { device, name }
            }
            b"setBLOBVector" => {
                let (device, _) = element_attrs(element, "setBLOBVector");
                Self::SetBlobVector { device }
            }
            _ => Self::Other,
        }
    }
}

/// Pull `attr_device` and `attr_name` out of an element through the JSON
/// mapping; missing or unparsable attributes come back empty.
fn element_attrs(element: &[u8], tag: &str) -> (String, String) {
    let Ok(doc) = xml::element_to_json(element) else {
        return (String::new(), String::new());
    };
    let Ok(value) = serde_json::from_slice::<Value>(&doc) else {
        return (String::new(), String::new());
    };
    let content = &value[tag];
    let device = content["attr_device"].as_str().unwrap_or_default();
    let name = content["attr_name"].as_str().unwrap_or_default();
    (device.to_string(), name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_def_number_vector() {
        let element = b"<defNumberVector device='CAM1' name='CCD_EXPOSURE'>\
                        <defNumber name='v'>1.0</defNumber></defNumberVector>";
        assert_eq!(
            IndiElement::classify(element),
            IndiElement::DefNumberVector {
                device: "CAM1".to_string(),
                name: "CCD_EXPOSURE".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_self_closing() {
        assert_eq!(
            IndiElement::classify(b"<message device='m' message='hi'/>"),
            IndiElement::Message
        );
        assert_eq!(
            IndiElement::classify(b"<delProperty device='cam'/>"),
            IndiElement::DelProperty
        );
        assert_eq!(
            IndiElement::classify(b"<getProperties version='1.7'/>"),
            IndiElement::GetProperties
        );
    }

    #[test]
    fn test_classify_blob() {
        let element = b"<setBLOBVector device='CAM1' name='CCD1'>\
                        <oneBLOB name='CCD1' size='4'>AAAA</oneBLOB></setBLOBVector>";
        assert_eq!(
            IndiElement::classify(element),
            IndiElement::SetBlobVector {
                device: "CAM1".to_string()
            }
        );
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(
            IndiElement::classify(b"<defSwitchVector device='x'></defSwitchVector>"),
            IndiElement::Other
        );
        assert_eq!(IndiElement::classify(b"not xml"), IndiElement::Other);
    }

    #[test]
    fn test_profile_deserialization() {
        let json = r#"{"id": 1, "name": "Simulators", "port": 7624,
                       "autostart": 0, "autoconnect": 0}"#;
        let profile: IndiProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.name, "Simulators");
        assert_eq!(profile.port, 7624);
    }

    #[test]
    fn test_driver_deserialization() {
        let json = r#"[{"binary": "indi_asi_ccd", "skeleton": null, "family": "CCDs",
                        "label": "ZWO CCD", "version": "1.5", "role": "",
                        "custom": false, "name": "ZWO CCD"}]"#;
        let drivers: Vec<IndiDriver> = serde_json::from_str(json).unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].family, "CCDs");
        assert!(drivers[0].skeleton.is_none() || drivers[0].skeleton == Some(Value::Null));
    }
}
