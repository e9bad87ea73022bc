/// (De)serializes a token id as a decimal string. Deserialization also accepts JSON numbers and `0x`-prefixed hex
/// strings, since front-ends and token contracts disagree on the representation.
pub mod token_id {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            String(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(U256::from(n)),
            Repr::String(s) => parse(&s).map_err(de::Error::custom),
        }
    }

    pub fn parse(s: &str) -> Result<U256, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty token id".to_owned());
        }
        s.parse::<U256>()
            .map_err(|e| format!("invalid token id {s:?}: {e}"))
    }
}
