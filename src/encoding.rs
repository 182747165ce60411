/// Serde adapter that stores byte fields as lowercase hex strings.
///
/// Works for `Vec<u8>` and fixed arrays (`[u8; N]`), so persisted JSON stays
/// readable and stable across platforms.
pub mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&hex::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        let len = raw.len();
        T::try_from(raw).map_err(|_| D::Error::custom(format!("unexpected byte length {}", len)))
    }
}
