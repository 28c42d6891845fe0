// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! JSON envelopes inside composer frames.

use super::composer::Composer;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Frames JSON values with a [`Composer`].
///
/// `In` is the type read from the stream, `Out` the type written to it.
#[derive(Debug)]
pub struct JsonCodec<In, Out> {
    composer: Composer,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Clone for JsonCodec<In, Out> {
    fn clone(&self) -> Self {
        Self {
            composer: self.composer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for JsonCodec<In, Out> {
    fn default() -> Self {
        Self::new(Composer::new())
    }
}

impl<In, Out> JsonCodec<In, Out> {
    /// Wraps a composer.
    pub fn new(composer: Composer) -> Self {
        Self { composer, _marker: PhantomData }
    }

    /// Serializes one value into a complete frame.
    pub fn frame(&self, item: &Out) -> io::Result<Bytes>
    where
        Out: Serialize,
    {
        let payload = serde_json::to_vec(item)?;
        Ok(self.composer.compose(&payload)?)
    }
}

impl<In, Out> Decoder for JsonCodec<In, Out>
where
    In: DeserializeOwned,
{
    type Item = In;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, io::Error> {
        match self.composer.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out> Encoder<Out> for JsonCodec<In, Out>
where
    Out: Serialize,
{
    type Error = io::Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = serde_json::to_vec(&item)?;
        self.composer.encode(Bytes::from(payload), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Packet, RequestEnvelope, RpcMessage};

    #[test]
    fn batch_frame_decodes_as_packet() {
        let msg = RpcMessage::new("sys", "chat", "remote", "add");
        let batch = vec![RequestEnvelope { id: 1, msg: msg.clone() }, RequestEnvelope { id: 2, msg }];
        let writer = JsonCodec::<(), Vec<RequestEnvelope>>::default();
        let frame = writer.frame(&batch).unwrap();

        let mut reader = JsonCodec::<Packet<RequestEnvelope>, ()>::default();
        let mut src = BytesMut::from(&frame[..]);
        let packet = reader.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.into_vec().iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let frame = Composer::new().compose(b"{not json").unwrap();
        let mut reader = JsonCodec::<Packet<RequestEnvelope>, ()>::default();
        let mut src = BytesMut::from(&frame[..]);
        assert_eq!(reader.decode(&mut src).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
