use std::io::{self, Read};

use flate2::{Decompress, FlushDecompress, Status};

use super::{Decompressed, DecompressionError, Decompressor, is_complete};
use crate::configs::Compression;

/// Inflater for the `zlib-stream` transport.
///
/// One deflate window spans the whole connection, so the instance must not
/// outlive the socket it was created for unless [`Decompressor::reset`] is
/// called.
pub struct ZlibDecompressor {
    streamed: bool,
    inflate: Option<Decompress>,
    fragments: Vec<u8>,
    output: Vec<u8>,
    shrink_threshold: usize,
    /// Set once a complete message was handed out; its buffers are recycled
    /// on the next call.
    flushed: bool,
}

impl ZlibDecompressor {
    pub fn buffered(shrink_threshold: usize) -> Self {
        Self::new(false, shrink_threshold)
    }

    pub fn streamed(shrink_threshold: usize) -> Self {
        Self::new(true, shrink_threshold)
    }

    fn new(streamed: bool, shrink_threshold: usize) -> Self {
        Self {
            streamed,
            inflate: Some(Decompress::new(true)),
            fragments: Vec::new(),
            output: Vec::new(),
            shrink_threshold,
            flushed: false,
        }
    }

    fn release_flushed(&mut self) {
        if !self.flushed {
            return;
        }
        self.flushed = false;
        self.fragments.clear();
        self.output.clear();
        if self.fragments.capacity() > self.shrink_threshold {
            self.fragments.shrink_to(self.shrink_threshold);
        }
        if self.output.capacity() > self.shrink_threshold {
            self.output.shrink_to(self.shrink_threshold);
        }
    }
}

fn append_fragment(fragments: &mut Vec<u8>, frame: &[u8]) {
    let required = fragments.len() + frame.len();
    if required > fragments.capacity() {
        fragments.reserve_exact(required * 2 - fragments.len());
    }
    fragments.extend_from_slice(frame);
}

fn inflate_error(e: impl std::fmt::Display) -> DecompressionError {
    DecompressionError::Inflate(e.to_string())
}

fn inflate_into(
    inflate: &mut Decompress,
    mut input: &[u8],
    output: &mut Vec<u8>,
) -> Result<(), DecompressionError> {
    output.clear();
    output.reserve(input.len().max(512) * 2);

    loop {
        if output.len() == output.capacity() {
            output.reserve(output.capacity());
        }

        let before_in = inflate.total_in();
        let before_out = inflate.total_out();
        let status = inflate
            .decompress_vec(input, output, FlushDecompress::Sync)
            .map_err(inflate_error)?;
        let consumed = (inflate.total_in() - before_in) as usize;
        let produced = inflate.total_out() - before_out;
        input = &input[consumed..];

        let has_room = output.len() < output.capacity();
        if input.is_empty() && has_room {
            return Ok(());
        }
        if status == Status::StreamEnd {
            return Err(inflate_error("deflate stream ended inside a zlib-stream"));
        }
        if consumed == 0 && produced == 0 && has_room {
            return Err(inflate_error("inflate made no progress"));
        }
    }
}

impl Decompressor for ZlibDecompressor {
    fn kind(&self) -> Compression {
        if self.streamed {
            Compression::Streamed
        } else {
            Compression::Buffered
        }
    }

    fn decompress<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> Result<Option<Decompressed<'a>>, DecompressionError> {
        self.release_flushed();
        let Some(inflate) = self.inflate.as_mut() else {
            return Err(DecompressionError::ShutDown);
        };

        if !is_complete(frame) {
            append_fragment(&mut self.fragments, frame);
            return Ok(None);
        }

        self.flushed = true;
        let input = if self.fragments.is_empty() {
            frame
        } else {
            append_fragment(&mut self.fragments, frame);
            self.fragments.as_slice()
        };

        if self.streamed {
            return Ok(Some(Decompressed::Stream(InflateReader::new(inflate, input))));
        }

        inflate_into(inflate, input, &mut self.output)?;
        Ok(Some(Decompressed::Buffer(&self.output)))
    }

    fn reset(&mut self) {
        if let Some(inflate) = self.inflate.as_mut() {
            inflate.reset(true);
        }
        self.fragments.clear();
        self.output.clear();
        self.flushed = false;
    }

    fn shutdown(&mut self) {
        self.inflate = None;
        self.fragments = Vec::new();
        self.output = Vec::new();
        self.flushed = false;
    }
}

/// Lazily inflates one complete message while the caller parses it.
///
/// Dropping the reader early inflates (and discards) whatever input is left
/// so the shared window stays in step with the sender.
pub struct InflateReader<'a> {
    inflate: &'a mut Decompress,
    input: &'a [u8],
    pos: usize,
    fault: Option<DecompressionError>,
}

impl<'a> InflateReader<'a> {
    fn new(inflate: &'a mut Decompress, input: &'a [u8]) -> Self {
        Self {
            inflate,
            input,
            pos: 0,
            fault: None,
        }
    }

    /// The inflate error that interrupted reading, if any.
    pub fn take_fault(&mut self) -> Option<DecompressionError> {
        self.fault.take()
    }
}

impl Read for InflateReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.fault.is_some() {
            return Ok(0);
        }
        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let result =
                self.inflate
                    .decompress(&self.input[self.pos..], buf, FlushDecompress::Sync);
            if let Err(e) = result {
                let fault = inflate_error(&e);
                self.fault = Some(fault.clone());
                return Err(io::Error::new(io::ErrorKind::InvalidData, fault));
            }
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            self.pos += consumed;

            if produced > 0 {
                return Ok(produced);
            }
            if consumed == 0 {
                return Ok(0);
            }
        }
    }
}

impl Drop for InflateReader<'_> {
    fn drop(&mut self) {
        let mut scratch = [0u8; 1024];
        while let Ok(n) = self.read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use flate2::{Compress, Compression as Level, FlushCompress};

    use super::*;

    /// Compresses each message with a sync flush on one shared window, the
    /// way the gateway emits them.
    fn zlib_stream(messages: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut compress = Compress::new(Level::default(), true);
        messages
            .iter()
            .map(|message| {
                let mut out = Vec::new();
                let mut input = *message;
                loop {
                    out.reserve(1024);
                    let before = compress.total_in();
                    compress
                        .compress_vec(input, &mut out, FlushCompress::Sync)
                        .unwrap();
                    input = &input[(compress.total_in() - before) as usize..];
                    if input.is_empty() && out.len() < out.capacity() {
                        break;
                    }
                }
                out
            })
            .collect()
    }

    fn expect_buffer(result: Option<Decompressed<'_>>) -> Vec<u8> {
        match result {
            Some(Decompressed::Buffer(bytes)) => bytes.to_vec(),
            Some(Decompressed::Stream(_)) => panic!("expected a buffer"),
            None => panic!("expected a complete message"),
        }
    }

    #[test]
    fn fragmented_frames_yield_plaintext_only_on_the_last_fragment() {
        let plaintext = br#"{"op":10,"d":{"heartbeat_interval":41250,"_trace":["gateway-prd-main"]}}"#;
        let frame = zlib_stream(&[plaintext]).remove(0);
        assert!(is_complete(&frame));

        for first in 1..frame.len() - 1 {
            for second in (first + 1)..frame.len() {
                let mut z = ZlibDecompressor::buffered(1024);
                assert!(z.decompress(&frame[..first]).unwrap().is_none());
                assert!(z.decompress(&frame[first..second]).unwrap().is_none());
                let out = expect_buffer(z.decompress(&frame[second..]).unwrap());
                assert_eq!(out, plaintext, "split at {first}/{second}");
            }
        }
    }

    #[test]
    fn window_is_shared_across_messages() {
        let messages: [&[u8]; 3] = [
            br#"{"op":0,"t":"GUILD_CREATE","s":1,"d":{"id":"1"}}"#,
            br#"{"op":0,"t":"GUILD_CREATE","s":2,"d":{"id":"2"}}"#,
            br#"{"op":11}"#,
        ];
        let frames = zlib_stream(&messages);
        let mut z = ZlibDecompressor::buffered(1024);
        for (frame, message) in frames.iter().zip(messages) {
            assert_eq!(expect_buffer(z.decompress(frame).unwrap()), message);
        }
    }

    #[test]
    fn streamed_mode_reads_lazily() {
        let plaintext = br#"{"op":11,"d":null}"#;
        let frame = zlib_stream(&[plaintext, plaintext]);
        let mut z = ZlibDecompressor::streamed(1024);
        assert_eq!(z.kind(), Compression::Streamed);

        for f in &frame {
            let Some(Decompressed::Stream(mut reader)) = z.decompress(f).unwrap() else {
                panic!("expected a stream");
            };
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, plaintext);
        }
    }

    #[test]
    fn dropping_a_stream_early_keeps_the_window_in_step() {
        let first = br#"{"op":0,"t":"READY","s":1,"d":{"session_id":"abc"}}"#;
        let second = br#"{"op":0,"t":"RESUMED","s":2,"d":{}}"#;
        let frames = zlib_stream(&[first, second]);
        let mut z = ZlibDecompressor::streamed(1024);

        if let Some(Decompressed::Stream(mut reader)) = z.decompress(&frames[0]).unwrap() {
            let mut head = [0u8; 4];
            reader.read_exact(&mut head).unwrap();
        }
        let Some(Decompressed::Stream(mut reader)) = z.decompress(&frames[1]).unwrap() else {
            panic!("expected a stream");
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, second);
    }

    #[test]
    fn corrupt_data_is_a_decompression_error() {
        let mut z = ZlibDecompressor::buffered(1024);
        let garbage = [0x78, 0x9c, 0xFF, 0xFF, 0xFF, 0x13, 0x00, 0x00, 0xFF, 0xFF];
        assert!(matches!(
            z.decompress(&garbage),
            Err(DecompressionError::Inflate(_))
        ));
    }

    #[test]
    fn buffers_shrink_back_to_the_threshold() {
        let big: Vec<u8> = (0..20_000u32)
            .flat_map(|i| format!("{},", i.wrapping_mul(2_654_435_761)).into_bytes())
            .collect();
        let frame = zlib_stream(&[&big]).remove(0);
        let mut z = ZlibDecompressor::buffered(256);

        let mid = frame.len() / 2;
        assert!(z.decompress(&frame[..mid]).unwrap().is_none());
        assert_eq!(expect_buffer(z.decompress(&frame[mid..]).unwrap()), big);
        assert!(z.fragments.capacity() > 256);
        assert!(z.output.capacity() > 256);

        assert!(z.decompress(&[0x01]).unwrap().is_none());
        assert!(z.fragments.capacity() <= 256);
        assert!(z.output.capacity() <= 256);
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let mut z = ZlibDecompressor::buffered(1024);
        z.shutdown();
        z.shutdown();
        assert_eq!(
            z.decompress(&[0, 0, 0xFF, 0xFF]).err(),
            Some(DecompressionError::ShutDown)
        );
    }

    #[test]
    fn reset_starts_a_fresh_window() {
        let frames = zlib_stream(&[b"first", b"second"]);
        let mut z = ZlibDecompressor::buffered(1024);
        assert!(z.decompress(&frames[0][..2]).unwrap().is_none());
        z.reset();

        let fresh = zlib_stream(&[b"again"]);
        assert_eq!(expect_buffer(z.decompress(&fresh[0]).unwrap()), b"again");
    }
}
