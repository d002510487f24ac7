//! Fixed-size byte buffers with hex display and serde support.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

macro_rules! impl_buf {
    ($name:ident, $len:expr) => {
        /// A fixed-size byte buffer, serialized as a lowercase hex string.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub const fn zero() -> Self {
                Self([0; $len])
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn into_bytes(self) -> [u8; $len] {
                self.0
            }

            /// Parses from a hex string of exactly `2 * LEN` characters.
            pub fn from_hex(s: &str) -> Option<Self> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes).ok()?;
                Some(Self(bytes))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s)
                    .ok_or_else(|| de::Error::custom(concat!("invalid ", stringify!($name), " hex")))
            }
        }
    };
}

impl_buf!(Buf32, 32);
impl_buf!(Buf64, 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let buf = Buf32::new([0xab; 32]);
        let parsed = Buf32::from_hex(&buf.to_hex()).unwrap();
        assert_eq!(buf, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Buf32::from_hex("zz").is_none());
        assert!(Buf32::from_hex(&"00".repeat(31)).is_none());
    }

    #[test]
    fn serde_as_hex_string() {
        let buf = Buf32::new([1; 32]);
        let json = serde_json::to_string(&buf).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: Buf32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, buf);
    }
}
