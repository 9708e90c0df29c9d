//! Record serialization for the shared collections.
//!
//! Every collection stores fixed-size records, so a serializer declares one
//! size up front and then encodes and decodes records of exactly that many
//! bytes. [`PodSerializer`] covers the common case of plain-old-data types
//! by reinterpreting the value's bytes directly; anything with pointers,
//! padding you care about, or a variable wire form needs a hand-written
//! [`Serializer`] impl.

use std::marker::PhantomData;

use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Fixed-size record codec used by every shared collection.
pub trait Serializer<T> {
    /// Size in bytes of every serialized record. Must never change for a
    /// given serializer; it is persisted in the region header and checked
    /// on every reopen.
    fn byte_size(&self) -> usize;

    /// Encodes `value` into `out`. `out` is always exactly
    /// [`byte_size`](Serializer::byte_size) bytes.
    fn serialize_into(&self, value: &T, out: &mut [u8]);

    /// Decodes a record from `bytes`, always exactly
    /// [`byte_size`](Serializer::byte_size) bytes.
    fn deserialize(&self, bytes: &[u8]) -> T;
}

/// Serializer for plain-old-data types: the record is the value's own
/// bytes, in native endianness.
///
/// Works for any type deriving zerocopy's `FromBytes` + `IntoBytes`, which
/// covers the primitive integers and floats as well as `#[repr(C)]` structs
/// built from them. Note that files written this way are only portable
/// between machines of the same endianness; the header itself is always
/// little-endian.
pub struct PodSerializer<T> {
    _marker: PhantomData<T>,
}

impl<T> PodSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PodSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PodSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for PodSerializer<T> {}

impl<T> std::fmt::Debug for PodSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodSerializer").finish()
    }
}

impl<T: FromBytes + IntoBytes + Immutable> Serializer<T> for PodSerializer<T> {
    fn byte_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn serialize_into(&self, value: &T, out: &mut [u8]) {
        out.copy_from_slice(value.as_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> T {
        match T::read_from_bytes(bytes) {
            Ok(value) => value,
            Err(_) => panic!(
                "record buffer must be exactly {} bytes",
                std::mem::size_of::<T>()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_round_trips_primitives() {
        let serializer = PodSerializer::<u64>::new();
        assert_eq!(serializer.byte_size(), 8);
        let mut buf = [0u8; 8];
        serializer.serialize_into(&0x1122_3344_5566_7788, &mut buf);
        assert_eq!(serializer.deserialize(&buf), 0x1122_3344_5566_7788);
    }

    #[test]
    fn pod_round_trips_repr_c_structs() {
        #[derive(FromBytes, IntoBytes, Immutable, Debug, PartialEq, Clone, Copy)]
        #[repr(C)]
        struct Tick {
            id: u32,
            qty: u32,
            price: f64,
        }

        let serializer = PodSerializer::<Tick>::new();
        assert_eq!(serializer.byte_size(), 16);
        let tick = Tick {
            id: 7,
            qty: 250,
            price: 101.25,
        };
        let mut buf = [0u8; 16];
        serializer.serialize_into(&tick, &mut buf);
        assert_eq!(serializer.deserialize(&buf), tick);
    }

    #[test]
    fn hand_written_serializer_controls_its_layout() {
        #[derive(Debug, PartialEq, Clone, Copy)]
        struct Sample {
            id: u32,
            value: f64,
        }

        struct SampleSerializer;

        impl Serializer<Sample> for SampleSerializer {
            fn byte_size(&self) -> usize {
                12
            }

            fn serialize_into(&self, value: &Sample, out: &mut [u8]) {
                out[..4].copy_from_slice(&value.id.to_le_bytes());
                out[4..12].copy_from_slice(&value.value.to_le_bytes());
            }

            fn deserialize(&self, bytes: &[u8]) -> Sample {
                Sample {
                    id: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                    value: f64::from_le_bytes(bytes[4..12].try_into().unwrap()),
                }
            }
        }

        let serializer = SampleSerializer;
        let sample = Sample { id: 9, value: -4.5 };
        let mut buf = [0u8; 12];
        serializer.serialize_into(&sample, &mut buf);
        assert_eq!(serializer.deserialize(&buf), sample);
    }
}
