use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::SeqAccessDeserializer, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::Void;

/// A Visitor implementation that is able to parse either a bare string or a sequence.
/// Adapted from https://serde.rs/string-or-struct.html
pub fn string_or_sequence<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct StringOrSequence<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrSequence<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or sequence")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            match FromStr::from_str(value) {
                Ok(value) => Ok(value),
                Err(void) => void::unreachable(void),
            }
        }

        fn visit_seq<S>(self, seq: S) -> Result<Self::Value, S::Error>
        where
            S: SeqAccess<'de>,
        {
            Deserialize::deserialize(SeqAccessDeserializer::new(seq))
        }
    }

    deserializer.deserialize_any(StringOrSequence(PhantomData))
}
