// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Codecs applied between a partition stream and the bytes persisted for it.
//!
//! The number of bytes a caller writes to a partition stream and the number
//! of bytes that end up in the block differ whenever the codec transforms
//! the data. Writers therefore always report the persisted size.

use std::fmt::Debug;
use std::io::{self, Read, Write};

use bytes::Bytes;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::{Result, ShuffleError};

/// Encoder handed out by a [`BlockCodec`] for one partition stream.
pub trait BlockEncoder: Write + Send {
    /// Writes any buffered data and trailer to the underlying sink.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Transforms partition bytes on the way to the store and back.
pub trait BlockCodec: Debug + Send + Sync {
    /// Name used in configuration and logs
    fn name(&self) -> &'static str;

    /// Whether encoded output always has the same length as its input.
    fn preserves_length(&self) -> bool;

    /// Wraps `sink` in an encoder.
    fn encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
    ) -> Result<Box<dyn BlockEncoder + 'a>>;

    /// Decodes a complete fetched block.
    fn decode(&self, block: Bytes) -> Result<Bytes>;
}

/// Persists bytes as they are written.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

struct PassthroughEncoder<'a> {
    sink: Box<dyn Write + Send + 'a>,
}

impl Write for PassthroughEncoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl BlockEncoder for PassthroughEncoder<'_> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.sink.flush()
    }
}

impl BlockCodec for PassthroughCodec {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn preserves_length(&self) -> bool {
        true
    }

    fn encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
    ) -> Result<Box<dyn BlockEncoder + 'a>> {
        Ok(Box::new(PassthroughEncoder { sink }))
    }

    fn decode(&self, block: Bytes) -> Result<Bytes> {
        Ok(block)
    }
}

/// LZ4 frame compression, one frame per block.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4FrameCodec;

struct Lz4Encoder<'a> {
    inner: FrameEncoder<Box<dyn Write + Send + 'a>>,
}

impl Write for Lz4Encoder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BlockEncoder for Lz4Encoder<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = self.inner.finish().map_err(io::Error::other)?;
        sink.flush()
    }
}

impl BlockCodec for Lz4FrameCodec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn preserves_length(&self) -> bool {
        false
    }

    fn encoder<'a>(
        &self,
        sink: Box<dyn Write + Send + 'a>,
    ) -> Result<Box<dyn BlockEncoder + 'a>> {
        Ok(Box::new(Lz4Encoder {
            inner: FrameEncoder::new(sink),
        }))
    }

    fn decode(&self, block: Bytes) -> Result<Bytes> {
        let mut decoder = FrameDecoder::new(block.as_ref());
        let mut out = Vec::with_capacity(block.len() * 2);
        decoder.read_to_end(&mut out).map_err(|e| {
            ShuffleError::General(format!("failed to decode lz4 block: {e}"))
        })?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &dyn BlockCodec, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = codec.encoder(Box::new(&mut out)).unwrap();
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap();
        }
        out
    }

    #[test]
    fn passthrough_keeps_bytes() {
        let data = b"hello shuffle".to_vec();
        let encoded = encode(&PassthroughCodec, &data);
        assert_eq!(encoded, data);
        assert_eq!(
            PassthroughCodec.decode(Bytes::from(encoded)).unwrap(),
            Bytes::from(data)
        );
    }

    #[test]
    fn lz4_shrinks_repetitive_data() {
        let data = vec![7u8; 64 * 1024];
        let encoded = encode(&Lz4FrameCodec, &data);
        assert!(encoded.len() < data.len());

        let decoded = Lz4FrameCodec.decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded.as_ref(), data.as_slice());
    }

    #[test]
    fn lz4_rejects_garbage() {
        let err = Lz4FrameCodec
            .decode(Bytes::from_static(b"not an lz4 frame"))
            .unwrap_err();
        assert!(err.to_string().contains("lz4"));
    }
}
