use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::control::ControlsState;
use crate::error::StateError;
use crate::model::InstanceDocument;

const VERSION: &str = "v1";
const CHECK_LEN: usize = 16;
const KEY_CONTEXT: &str = "formtree 2024 state blob check";

/// Encodes state blobs as `v1.<base64 json>.<keyed blake3 prefix>`.
///
/// The check is keyed by a server-side secret, so clients cannot forge or
/// rewrite state. Servers that hand out blobs to each other must share the
/// secret.
#[derive(Clone)]
pub struct StateCodec {
    key: [u8; 32],
}

impl StateCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, StateError> {
        let json = serde_json::to_vec(value)?;
        Ok(format!(
            "{VERSION}.{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            self.check(&json)
        ))
    }

    pub fn decode<T: DeserializeOwned>(&self, blob: &str) -> Result<T, StateError> {
        let mut parts = blob.splitn(3, '.');
        let (Some(version), Some(payload), Some(check)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(StateError::Decode("expected three dot-separated parts".into()));
        };
        if version != VERSION {
            return Err(StateError::Decode(format!("unsupported version `{version}`")));
        }
        let json = URL_SAFE_NO_PAD.decode(payload)?;
        if self.check(&json) != check {
            return Err(StateError::Checksum);
        }
        Ok(serde_json::from_slice(&json)?)
    }

    fn check(&self, json: &[u8]) -> String {
        let hash = blake3::keyed_hash(&self.key, json).to_hex();
        hash.as_str()[..CHECK_LEN].to_string()
    }
}

impl fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateCodec(..)")
    }
}

/// Per-exchange state: owned instance data plus UI state the data cannot
/// reproduce. Shared instances are referenced, never embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicState {
    pub sequence: u64,
    pub instances: BTreeMap<String, InstanceDocument>,
    #[serde(default)]
    pub controls: ControlsState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{ControlDef, FormDefinition};

    fn codec() -> StateCodec {
        StateCodec::new("test secret")
    }

    fn state() -> DynamicState {
        let mut doc = InstanceDocument::new("data");
        let root = doc.root();
        doc.append(root, "name", "Ada").unwrap();
        let mut controls = ControlsState::default();
        controls.repeat_indexes.insert("rows".into(), 2);
        DynamicState {
            sequence: 3,
            instances: BTreeMap::from([("main".to_string(), doc)]),
            controls,
        }
    }

    #[test]
    fn dynamic_state_survives_encoding() {
        let blob = codec().encode(&state()).unwrap();
        assert!(blob.starts_with("v1."));
        let back: DynamicState = codec().decode(&blob).unwrap();
        let original = state();
        assert_eq!(back.sequence, original.sequence);
        assert_eq!(back.controls, original.controls);
        assert_eq!(
            back.instances["main"].content_hash(),
            original.instances["main"].content_hash()
        );
    }

    #[test]
    fn static_state_is_the_form_definition() {
        let form = FormDefinition::new("f", ControlDef::group("root"))
            .with_instance("main", InstanceDocument::new("data"));
        let codec = codec();
        let back: FormDefinition = codec.decode(&codec.encode(&form).unwrap()).unwrap();
        assert_eq!(back, form);
    }

    #[test]
    fn tampering_is_detected() {
        let codec = codec();
        let blob = codec.encode(&state()).unwrap();
        let (head, check) = blob.rsplit_once('.').unwrap();
        let flipped = if check.starts_with('0') { "1" } else { "0" };
        let tampered = format!("{head}.{flipped}{}", &check[1..]);
        assert!(matches!(
            codec.decode::<DynamicState>(&tampered),
            Err(StateError::Checksum)
        ));
        assert!(matches!(
            codec.decode::<DynamicState>("v2.e30.0000"),
            Err(StateError::Decode(_))
        ));
        assert!(matches!(
            codec.decode::<DynamicState>("garbage"),
            Err(StateError::Decode(_))
        ));
    }

    #[test]
    fn forged_payloads_need_the_secret() {
        let mut forged = state();
        forged.sequence = 99;
        let json = serde_json::to_vec(&forged).unwrap();
        let unkeyed = blake3::hash(&json).to_hex();
        let blob = format!(
            "v1.{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            &unkeyed.as_str()[..CHECK_LEN]
        );
        assert!(matches!(
            codec().decode::<DynamicState>(&blob),
            Err(StateError::Checksum)
        ));

        let other = StateCodec::new("another secret").encode(&forged).unwrap();
        assert!(matches!(
            codec().decode::<DynamicState>(&other),
            Err(StateError::Checksum)
        ));
    }
}
