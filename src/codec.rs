//! Message codecs and the codec registry.
//!
//! A codec turns application messages into frame payloads and back. The
//! registry maps a message type (plus a protocol, on the encoding side) to a
//! factory producing fresh codec instances, so each connection gets its own
//! encoder and decoder and stateful codecs never share state across peers.

use crate::error::{NetError, NetResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Transport protocol a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream transport with length-prefixed frames.
    Tcp,
    /// Datagram transport with one message per datagram.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Serializes messages of one application type into frame payloads.
///
/// A connection owns exactly one encoder, created by the registered factory
/// when the connection opens, so implementations may keep state between
/// messages (dictionaries, sequence counters).
pub trait Encoder<T>: Send {
    /// Append the payload bytes for one message to `buf`.
    fn encode(&mut self, message: &T, buf: &mut Vec<u8>) -> NetResult<()>;
}

/// Decodes frame payloads back into one application type.
///
/// `payload` is always exactly one frame: the framing layer strips length
/// prefixes on streams, and a datagram is a frame by itself.
pub trait Decoder<T>: Send {
    /// Decode one message from the payload of a single frame.
    fn decode(&mut self, payload: &[u8]) -> NetResult<T>;
}

impl<T, E> Encoder<T> for Box<E>
where
    E: Encoder<T> + ?Sized,
{
    fn encode(&mut self, message: &T, buf: &mut Vec<u8>) -> NetResult<()> {
        (**self).encode(message, buf)
    }
}

impl<T, D> Decoder<T> for Box<D>
where
    D: Decoder<T> + ?Sized,
{
    fn decode(&mut self, payload: &[u8]) -> NetResult<T> {
        (**self).decode(payload)
    }
}

/// Postcard-backed codec for any serde-compatible message type.
///
/// Stateless, so one type covers both directions and both protocols.
pub struct PostcardCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> PostcardCodec<T> {
    /// Create a codec instance.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PostcardCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostcardCodec")
    }
}

impl<T: Serialize> Encoder<T> for PostcardCodec<T> {
    fn encode(&mut self, message: &T, buf: &mut Vec<u8>) -> NetResult<()> {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Codec(Box::new(e)))?;
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder<T> for PostcardCodec<T> {
    fn decode(&mut self, payload: &[u8]) -> NetResult<T> {
        postcard::from_bytes(payload).map_err(|e| NetError::Codec(Box::new(e)))
    }
}

type EncoderFactoryFn<T> = Arc<dyn Fn() -> Box<dyn Encoder<T>> + Send + Sync>;
type DecoderFactoryFn<T> = Arc<dyn Fn() -> Box<dyn Decoder<T>> + Send + Sync>;

/// Lookup from message type to codec factories.
///
/// Encoders are keyed by `(Protocol, message type)`, decoders by message type
/// alone. Registration replaces any previous factory for the same key and is
/// safe at any time, though endpoints resolve codecs when a connection opens,
/// so registrations should normally happen before binding or connecting.
///
/// A process-wide instance is available through [`CodecRegistry::global`].
/// Endpoints take the registry as an argument, so tests and embedded uses can
/// pass a private one instead.
pub struct CodecRegistry {
    encoders: RwLock<HashMap<(Protocol, TypeId), Box<dyn Any + Send + Sync>>>,
    decoders: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            encoders: RwLock::new(HashMap::new()),
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide shared registry.
    pub fn global() -> Arc<CodecRegistry> {
        static GLOBAL: OnceLock<Arc<CodecRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CodecRegistry::new())).clone()
    }

    /// Install an encoder factory for `T` over `protocol`.
    pub fn register_encoder<T, E, F>(&self, protocol: Protocol, factory: F)
    where
        T: 'static,
        E: Encoder<T> + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        let factory: EncoderFactoryFn<T> =
            Arc::new(move || Box::new(factory()) as Box<dyn Encoder<T>>);
        self.encoders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((protocol, TypeId::of::<T>()), Box::new(factory));
    }

    /// Install a decoder factory for `T`. Both protocols share it.
    pub fn register_decoder<T, D, F>(&self, factory: F)
    where
        T: 'static,
        D: Decoder<T> + 'static,
        F: Fn() -> D + Send + Sync + 'static,
    {
        let factory: DecoderFactoryFn<T> =
            Arc::new(move || Box::new(factory()) as Box<dyn Decoder<T>>);
        self.decoders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Box::new(factory));
    }

    /// Register the [`PostcardCodec`] for `T` as encoder on both protocols
    /// and as the decoder.
    pub fn register_postcard<T>(&self)
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.register_encoder(Protocol::Tcp, PostcardCodec::<T>::new);
        self.register_encoder(Protocol::Udp, PostcardCodec::<T>::new);
        self.register_decoder(PostcardCodec::<T>::new);
    }

    /// Build a fresh encoder for `T` over `protocol`.
    ///
    /// # Errors
    ///
    /// [`NetError::UnregisteredEncoder`] if no factory is registered.
    pub fn encoder<T: 'static>(&self, protocol: Protocol) -> NetResult<Box<dyn Encoder<T>>> {
        let encoders = self.encoders.read().unwrap_or_else(PoisonError::into_inner);
        let factory = encoders
            .get(&(protocol, TypeId::of::<T>()))
            .and_then(|f| f.downcast_ref::<EncoderFactoryFn<T>>())
            .ok_or(NetError::UnregisteredEncoder {
                protocol,
                type_name: std::any::type_name::<T>(),
            })?;
        Ok(factory())
    }

    /// Build a fresh decoder for `T`.
    ///
    /// # Errors
    ///
    /// [`NetError::UnregisteredDecoder`] if no factory is registered.
    pub fn decoder<T: 'static>(&self) -> NetResult<Box<dyn Decoder<T>>> {
        let decoders = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        let factory = decoders
            .get(&TypeId::of::<T>())
            .and_then(|f| f.downcast_ref::<DecoderFactoryFn<T>>())
            .ok_or(NetError::UnregisteredDecoder {
                type_name: std::any::type_name::<T>(),
            })?;
        Ok(factory())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoders = self.encoders.read().unwrap_or_else(PoisonError::into_inner);
        let decoders = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CodecRegistry")
            .field("encoders", &encoders.len())
            .field("decoders", &decoders.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        value: u32,
        label: String,
    }

    #[test]
    fn postcard_roundtrip() {
        let mut codec = PostcardCodec::<Probe>::new();
        let message = Probe {
            value: 42,
            label: "answer".into(),
        };
        let mut buf = Vec::new();
        codec.encode(&message, &mut buf).unwrap();
        assert!(!buf.is_empty());
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn lookup_miss_reports_the_type_name() {
        let registry = CodecRegistry::new();
        let err = registry.encoder::<Probe>(Protocol::Tcp).err().unwrap();
        match err {
            NetError::UnregisteredEncoder {
                protocol,
                type_name,
            } => {
                assert_eq!(protocol, Protocol::Tcp);
                assert!(type_name.contains("Probe"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            registry.decoder::<Probe>(),
            Err(NetError::UnregisteredDecoder { .. })
        ));
    }

    #[test]
    fn register_postcard_covers_both_protocols() {
        let registry = CodecRegistry::new();
        registry.register_postcard::<Probe>();
        assert!(registry.encoder::<Probe>(Protocol::Tcp).is_ok());
        assert!(registry.encoder::<Probe>(Protocol::Udp).is_ok());
        assert!(registry.decoder::<Probe>().is_ok());
    }

    #[test]
    fn encoders_are_keyed_per_protocol() {
        let registry = CodecRegistry::new();
        registry.register_encoder(Protocol::Tcp, PostcardCodec::<Probe>::new);
        assert!(registry.encoder::<Probe>(Protocol::Tcp).is_ok());
        assert!(matches!(
            registry.encoder::<Probe>(Protocol::Udp),
            Err(NetError::UnregisteredEncoder {
                protocol: Protocol::Udp,
                ..
            })
        ));
    }

    #[test]
    fn reregistration_replaces_the_factory() {
        struct FixedDecoder;
        impl Decoder<Probe> for FixedDecoder {
            fn decode(&mut self, _payload: &[u8]) -> NetResult<Probe> {
                Ok(Probe {
                    value: 7,
                    label: "fixed".into(),
                })
            }
        }

        let registry = CodecRegistry::new();
        registry.register_postcard::<Probe>();
        registry.register_decoder(|| FixedDecoder);
        let mut decoder = registry.decoder::<Probe>().unwrap();
        let decoded = decoder.decode(&[0xde, 0xad]).unwrap();
        assert_eq!(decoded.value, 7);
    }
}
