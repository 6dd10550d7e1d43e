pub mod asset;
pub mod order;
pub mod trade;
pub mod trading_pair;

pub use asset::*;
pub use order::*;
pub use trade::*;
pub use trading_pair::*;

/// Serialize i64 identifiers as decimal strings across the trust boundary.
///
/// Clients speaking IEEE-754 JSON numbers lose precision above 2^53, so ids
/// travel as strings on the wire while staying i64 internally.
pub mod id_str {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(id: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IdRepr {
            Num(i64),
            Str(String),
        }

        match IdRepr::deserialize(deserializer)? {
            IdRepr::Num(n) => Ok(n),
            IdRepr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::id_str")]
        id: i64,
    }

    #[test]
    fn test_id_serialized_as_string() {
        let w = Wrapper {
            id: 9007199254740993, // 2^53 + 1, unrepresentable as f64
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("\"9007199254740993\""));
    }

    #[test]
    fn test_id_accepts_string_or_number() {
        let w: Wrapper = serde_json::from_str(r#"{"id":"17"}"#).unwrap();
        assert_eq!(w.id, 17);

        let w: Wrapper = serde_json::from_str(r#"{"id":17}"#).unwrap();
        assert_eq!(w.id, 17);
    }
}
