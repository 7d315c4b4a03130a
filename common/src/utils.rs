use ethers::types::U256;

/// Parse an unsigned integer written either in decimal or as 0x-prefixed hex
pub fn parse_u256(input: &str) -> Result<U256, String> {
    let trimmed = input.trim().replace('_', "");
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex integer `{}`: {}", input, e))
    } else {
        U256::from_dec_str(&trimmed).map_err(|e| format!("invalid decimal integer `{}`: {}", input, e))
    }
}

/// Serde adapter writing a U256 as a decimal string.
///
/// Reading accepts decimal strings, hex strings and plain JSON numbers, so plan
/// files can say `"1000000"` rather than `"0xf4240"`.
pub mod u256_dec {
    use super::parse_u256;
    use ethers::types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => parse_u256(&text).map_err(de::Error::custom),
            Repr::Number(n) => Ok(U256::from(n)),
        }
    }
}

/// Serde adapter for solc slot numbers, which are emitted as decimal strings
pub mod slot_number {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| de::Error::custom(format!("invalid storage slot `{}`: {}", text, e))),
            Repr::Number(n) => Ok(n),
        }
    }
}
