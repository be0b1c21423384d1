use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const INT_WIDTH: usize = 16;
const INT_OFFSET: i64 = 10_000_000_000_000_000 - 1;
const TIMESTAMP_WIDTH: usize = 13;

/// Encoding applied to a property when it appears inside a generated key value.
///
/// Encodings keep lexical order equal to value order so generated range keys
/// sort correctly in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Transcode {
    #[default]
    String,
    Int,
    Timestamp,
    Boolean,
}

impl Transcode {
    /// Attribute type used when the raw property is a table or index key.
    pub fn attribute_type(&self) -> &'static str {
        match self {
            Transcode::Int | Transcode::Timestamp => "N",
            Transcode::String | Transcode::Boolean => "S",
        }
    }

    pub fn encode(&self, value: &Value) -> Result<String> {
        match self {
            Transcode::String => super::scalar_to_string(value)
                .ok_or_else(|| anyhow!("Cannot encode {value} as string")),
            Transcode::Int => {
                let number = value
                    .as_i64()
                    .ok_or_else(|| anyhow!("Cannot encode {value} as int"))?;
                if number.unsigned_abs() > INT_OFFSET as u64 {
                    bail!("Int {number} exceeds the encodable range");
                }
                if number < 0 {
                    Ok(format!("n{:0INT_WIDTH$}", INT_OFFSET + number + 1))
                } else {
                    Ok(format!("p{number:0INT_WIDTH$}"))
                }
            }
            Transcode::Timestamp => {
                let millis = value
                    .as_u64()
                    .ok_or_else(|| anyhow!("Cannot encode {value} as timestamp"))?;
                Ok(format!("{millis:0TIMESTAMP_WIDTH$}"))
            }
            Transcode::Boolean => match value {
                Value::Bool(true) => Ok("t".to_string()),
                Value::Bool(false) => Ok("f".to_string()),
                other => Err(anyhow!("Cannot encode {other} as boolean")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn int_encoding_preserves_order_across_sign() {
        let encoded = [-500, -1, 0, 1, 42]
            .iter()
            .map(|n| Transcode::Int.encode(&json!(n)).expect("encoded"))
            .collect::<Vec<_>>();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert_eq!(encoded[3], "p0000000000000001");
    }

    #[test]
    fn timestamp_and_boolean_encode_fixed_shapes() {
        assert_eq!(
            Transcode::Timestamp.encode(&json!(1_700_000_000_000u64)).expect("ts"),
            "1700000000000"
        );
        assert_eq!(Transcode::Timestamp.encode(&json!(5)).expect("ts"), "0000000000005");
        assert_eq!(Transcode::Boolean.encode(&json!(false)).expect("bool"), "f");
        assert!(Transcode::Boolean.encode(&json!("false")).is_err());
        assert!(Transcode::Timestamp.encode(&json!(-3)).is_err());
    }
}
