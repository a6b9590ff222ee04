//! Protocol messages for prepper-mesh.
//!
//! Every message is a single UTF-8 JSON document. Field names are `camelCase`
//! on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{MessageError, PeerId};

/// Maximum size of a single message on a stream (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Serialize a message to UTF-8 JSON bytes.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    let bytes = serde_json::to_vec(message).map_err(MessageError::Serialization)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge {
            size: bytes.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Deserialize a message from UTF-8 JSON bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(bytes).map_err(MessageError::Deserialization)
}

/// Missing and `null` both decode as the type's default. Older peers send
/// database rows as they are, nulls included.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Sent on the `sync-request` topic to ask a peer for its inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// The requesting node
    pub peer_id: PeerId,
    /// Requester's last sync round (epoch millis, 0 = never)
    pub timestamp: u64,
}

/// A food item, matched across nodes by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodItemRecord {
    /// Natural key
    pub name: String,
    /// Units on hand
    pub quantity: f64,
    /// Unit label (cans, kg, ...)
    #[serde(default, deserialize_with = "null_as_default")]
    pub unit: String,
    /// Calories per unit
    #[serde(default, deserialize_with = "null_as_default")]
    pub calories_per_unit: f64,
    /// Expiry date as provided by the source store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Last modification (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// A household member, matched across nodes by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    /// Natural key
    pub name: String,
    /// Daily calorie consumption
    #[serde(default, deserialize_with = "null_as_default")]
    pub daily_consumption: f64,
    /// Dietary restrictions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dietary_restrictions: Option<String>,
    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Last modification (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Full inventory pushed on the `inventory-data` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPayload {
    /// All local food items
    pub food_items: Vec<FoodItemRecord>,
    /// All local people
    pub people: Vec<PersonRecord>,
    /// When the snapshot was taken (epoch millis)
    pub timestamp: u64,
}

/// Inbound inventory, decoded leniently.
///
/// Records are kept as raw JSON values so one malformed record fails on its
/// own during merge rather than rejecting the whole payload. Only the
/// collection structure is validated here.
#[derive(Debug, Clone, PartialEq)]
pub struct InventorySnapshot {
    /// Raw food item records
    pub food_items: Vec<Value>,
    /// Raw people records (absent on the wire = empty)
    pub people: Vec<Value>,
    /// Sender's snapshot time, if provided
    pub timestamp: Option<u64>,
}

impl InventorySnapshot {
    /// Decode and structurally validate an inbound payload.
    ///
    /// `foodItems` is required; `people` may be absent or null.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        let value: Value = decode(bytes)?;
        Self::from_value(value)
    }

    /// Structurally validate an already-parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut object) = value else {
            return Err(MessageError::InvalidPayload(
                "inventory payload must be a JSON object".into(),
            ));
        };

        let food_items = match object.remove("foodItems") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(MessageError::InvalidPayload(
                    "foodItems must be an array".into(),
                ))
            }
            None => {
                return Err(MessageError::InvalidPayload(
                    "missing foodItems collection".into(),
                ))
            }
        };

        let people = match object.remove("people") {
            Some(Value::Array(people)) => people,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(MessageError::InvalidPayload(
                    "people must be an array".into(),
                ))
            }
        };

        let timestamp = object.get("timestamp").and_then(Value::as_u64);

        Ok(Self {
            food_items,
            people,
            timestamp,
        })
    }

    /// Total number of records carried.
    pub fn len(&self) -> usize {
        self.food_items.len() + self.people.len()
    }

    /// True if the snapshot carries no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<&InventoryPayload> for InventorySnapshot {
    type Error = MessageError;

    fn try_from(payload: &InventoryPayload) -> Result<Self, Self::Error> {
        let value = serde_json::to_value(payload).map_err(MessageError::Serialization)?;
        Self::from_value(value)
    }
}
