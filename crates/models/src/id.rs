/// Id is the compact identity of an xaction or transaction attempt:
/// eight big-endian bytes rendered as sixteen hex digits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id([u8; 8]);

impl Id {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
    pub fn new(b: [u8; 8]) -> Self {
        Self(b)
    }
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let vec_bytes = hex::decode(hex)?;
        let exact: [u8; 8] = vec_bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;

        Ok(Id(exact))
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::from_hex(s)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", u64::from_be_bytes(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_hex(str_val.as_ref()).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

/// IdGenerator issues process-unique Ids: the upper 48 bits are a
/// millisecond timestamp, the lower 16 a wrapping sequence. Two
/// generators in one process must be seeded with distinct shards.
pub struct IdGenerator {
    shard: u16,
    seq: u16,
}

impl IdGenerator {
    pub fn new(shard: u16) -> Self {
        Self { shard, seq: 0 }
    }

    pub fn next(&mut self) -> Id {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let (seq, shard) = (self.seq, self.shard);
        self.seq = self.seq.wrapping_add(1);

        // 48-bit timestamp | 8-bit shard | 8-bit sequence.
        let packed = (millis << 16) | ((shard as u64 & 0xff) << 8) | (seq as u64 & 0xff);
        Id(packed.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_hex() {
        let id = Id::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn generator_is_monotonic_within_a_millisecond() {
        let mut gen = IdGenerator::new(1);
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
        assert!(!a.is_zero());
    }
}
