//! Hex encodings for byte containers that `hex::serde` does not cover.

pub mod map {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &BTreeMap<u32, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (*k, hex::encode(v)))
            .collect::<BTreeMap<u32, String>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<u32, Vec<u8>>, D::Error> {
        BTreeMap::<u32, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| hex::decode(v).map(|v| (k, v)).map_err(D::Error::custom))
            .collect()
    }
}

pub mod seq {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        items.iter()
            .map(hex::encode)
            .collect::<Vec<String>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|v| hex::decode(v).map_err(D::Error::custom))
            .collect()
    }
}
