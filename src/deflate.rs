//! Per-message DEFLATE pipeline ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! Compressed messages are raw DEFLATE streams with the trailing empty
//! stored block `00 00 FF FF` stripped by the sender and re-appended by the
//! receiver. With context takeover the flate stream persists across
//! messages, so its internal 32 KiB LZ77 window doubles as the shared
//! dictionary; without takeover the stream is reset before every message.
//!
//! Compressors and decompressors are pooled process-wide. A pipeline takes
//! its pair from the pools at construction and repays them when the owning
//! connection closes.

use std::io;

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Result, WebSocketError};

/// The empty stored block every sync flush ends with.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Compression level for outbound messages.
///
/// Only the three levels the pipeline pools are expressible; anything else
/// coerces silently to `Default` (see [`CompressionLevel::from_level`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// zlib level 6, the balanced default.
    #[default]
    Default,
    /// zlib level 1, cheapest CPU-wise.
    BestSpeed,
    /// zlib level 9, densest output.
    BestCompression,
}

impl CompressionLevel {
    /// Maps a numeric zlib-style level onto the supported set. Unknown
    /// values coerce to `Default`.
    pub fn from_level(level: i32) -> Self {
        match level {
            1 => CompressionLevel::BestSpeed,
            9 => CompressionLevel::BestCompression,
            _ => CompressionLevel::Default,
        }
    }

    fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::BestSpeed => flate2::Compression::fast(),
            CompressionLevel::BestCompression => flate2::Compression::best(),
        }
    }

    /// Index into the per-level compressor pools.
    fn pool_index(self) -> usize {
        match self {
            CompressionLevel::Default => 0,
            CompressionLevel::BestSpeed => 1,
            CompressionLevel::BestCompression => 2,
        }
    }
}

/// Compression settings offered (client) or applied (server) for a
/// connection.
///
/// Compression as a whole is switched on by putting `Some` of these in
/// [`Options::compression`](crate::Options); `None` disables the extension
/// entirely.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// Keep the DEFLATE dictionary alive between messages. Better ratios on
    /// correlated traffic, one live flate stream per connection in exchange.
    /// Negotiation may still switch takeover off if the peer asks for
    /// `no_context_takeover`.
    pub context_takeover: bool,

    /// Level for outbound compression.
    pub level: CompressionLevel,

    /// Outbound messages shorter than this bypass compression and go out
    /// with RSV1 clear. Defaults to 128 bytes with context takeover, 512
    /// without.
    pub threshold: Option<usize>,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            context_takeover: true,
            level: CompressionLevel::Default,
            threshold: None,
        }
    }
}

/// Fully negotiated pipeline parameters, ready to construct a
/// [`DeflatePipeline`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineSettings {
    pub level: CompressionLevel,
    pub context_takeover: bool,
    pub threshold: usize,
}

impl PipelineSettings {
    /// Resolves configured options against the negotiated takeover flag,
    /// filling in the threshold default.
    pub(crate) fn resolve(opts: &DeflateOptions, context_takeover: bool) -> Self {
        let threshold = opts
            .threshold
            .unwrap_or(if context_takeover { 128 } else { 512 });
        Self {
            level: opts.level,
            context_takeover,
            threshold,
        }
    }
}

/// Per-connection compression state.
///
/// Owns one pooled compressor and one pooled decompressor for the life of
/// the connection; [`Drop`] returns both to their pools.
pub(crate) struct DeflatePipeline {
    level: CompressionLevel,
    context_takeover: bool,
    threshold: usize,
    /// `None` only transiently while Drop repays the pool.
    deflater: Option<Compress>,
    inflater: Option<Decompress>,
}

impl DeflatePipeline {
    pub(crate) fn new(settings: PipelineSettings) -> Self {
        Self {
            level: settings.level,
            context_takeover: settings.context_takeover,
            threshold: settings.threshold,
            deflater: Some(pool::acquire_deflater(settings.level)),
            inflater: Some(pool::acquire_inflater()),
        }
    }

    /// Outbound size below which compression is skipped.
    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compresses one whole outbound message, returning the payload to put
    /// on the wire (trailing `00 00 FF FF` already stripped).
    pub(crate) fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        let deflater = self.deflater.as_mut().expect("pooled deflater");
        if !self.context_takeover {
            deflater.reset();
        }

        let mut out = Vec::with_capacity(input.len() / 4 + 64);

        let mut remaining = input;
        while !remaining.is_empty() {
            reserve_spare(&mut out);
            let before_in = deflater.total_in();
            let status = deflater
                .compress_vec(remaining, &mut out, FlushCompress::None)
                .map_err(|err| corrupt_stream(&err))?;
            let consumed = (deflater.total_in() - before_in) as usize;
            remaining = &remaining[consumed..];

            match status {
                Status::Ok => {}
                Status::BufError | Status::StreamEnd => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "corrupt deflate stream",
                    ))
                }
            }
        }

        // One sync flush ends the message on a 00 00 FF FF boundary; keep
        // draining without flushing until the compressor has nothing left.
        reserve_spare(&mut out);
        deflater
            .compress_vec(&[], &mut out, FlushCompress::Sync)
            .map_err(|err| corrupt_stream(&err))?;
        loop {
            reserve_spare(&mut out);
            let before_out = deflater.total_out();
            deflater
                .compress_vec(&[], &mut out, FlushCompress::None)
                .map_err(|err| corrupt_stream(&err))?;
            if deflater.total_out() == before_out {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }

        Ok(out)
    }

    /// Inflates one whole inbound message (already reassembled if it was
    /// fragmented), re-appending the stripped tail first.
    ///
    /// Output larger than `max_size` fails with
    /// [`WebSocketError::FrameTooLarge`]; a corrupt stream fails with an I/O
    /// error, which the engine maps to close 1011.
    pub(crate) fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let takeover = self.context_takeover;
        let inflater = self.inflater.as_mut().expect("pooled inflater");
        if !takeover {
            inflater.reset(false);
        }

        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        feed_inflater(inflater, input, &mut out, max_size)?;
        feed_inflater(inflater, &DEFLATE_TAIL, &mut out, max_size)?;

        // Drain whatever the sync point released.
        loop {
            reserve_spare(&mut out);
            let before_out = inflater.total_out();
            inflater
                .decompress_vec(&[], &mut out, FlushDecompress::Sync)
                .map_err(|err| WebSocketError::Io(corrupt_stream(&err)))?;
            if inflater.total_out() == before_out {
                break;
            }
            if out.len() > max_size {
                return Err(WebSocketError::FrameTooLarge);
            }
        }

        Ok(out)
    }
}

impl Drop for DeflatePipeline {
    fn drop(&mut self) {
        if let Some(deflater) = self.deflater.take() {
            pool::release_deflater(self.level, deflater);
        }
        if let Some(inflater) = self.inflater.take() {
            pool::release_inflater(inflater);
        }
    }
}

fn feed_inflater(
    inflater: &mut Decompress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    max_size: usize,
) -> Result<()> {
    while !input.is_empty() {
        reserve_spare(out);
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        inflater
            .decompress_vec(input, out, FlushDecompress::None)
            .map_err(|err| WebSocketError::Io(corrupt_stream(&err)))?;
        let consumed = (inflater.total_in() - before_in) as usize;
        input = &input[consumed..];

        if out.len() > max_size {
            return Err(WebSocketError::FrameTooLarge);
        }
        // No consumption and no output means the stream ended early with
        // trailing garbage; bail out rather than spin.
        if consumed == 0 && inflater.total_out() == before_out {
            return Err(WebSocketError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt deflate stream",
            )));
        }
    }
    Ok(())
}

/// Tops the output vec back up so the next flate call has room to write.
fn reserve_spare(out: &mut Vec<u8>) {
    if out.capacity() - out.len() < 64 {
        out.reserve(1024);
    }
}

fn corrupt_stream(err: &dyn std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt deflate stream: {err}"))
}

/// Process-wide pools for flate state.
///
/// Compressors are keyed by level (a reset does not change the level they
/// were built with); decompressors are interchangeable. Every pooled object
/// is reset on acquisition, so a stale dictionary can never leak between
/// connections.
mod pool {
    use std::sync::Mutex;

    use flate2::{Compress, Decompress};

    use super::CompressionLevel;

    /// Upper bound per pool; beyond this, returned objects are dropped.
    const POOL_CAPACITY: usize = 32;

    static DEFLATERS: [Mutex<Vec<Compress>>; 3] = [
        Mutex::new(Vec::new()),
        Mutex::new(Vec::new()),
        Mutex::new(Vec::new()),
    ];

    static INFLATERS: Mutex<Vec<Decompress>> = Mutex::new(Vec::new());

    pub(super) fn acquire_deflater(level: CompressionLevel) -> Compress {
        let recycled = DEFLATERS[level.pool_index()]
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop());

        match recycled {
            Some(mut deflater) => {
                deflater.reset();
                deflater
            }
            None => Compress::new(level.to_flate2(), false),
        }
    }

    pub(super) fn release_deflater(level: CompressionLevel, deflater: Compress) {
        if let Ok(mut pool) = DEFLATERS[level.pool_index()].lock() {
            if pool.len() < POOL_CAPACITY {
                pool.push(deflater);
            }
        }
    }

    pub(super) fn acquire_inflater() -> Decompress {
        let recycled = INFLATERS.lock().ok().and_then(|mut pool| pool.pop());

        match recycled {
            Some(mut inflater) => {
                inflater.reset(false);
                inflater
            }
            None => Decompress::new(false),
        }
    }

    pub(super) fn release_inflater(inflater: Decompress) {
        if let Ok(mut pool) = INFLATERS.lock() {
            if pool.len() < POOL_CAPACITY {
                pool.push(inflater);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(context_takeover: bool) -> DeflatePipeline {
        DeflatePipeline::new(PipelineSettings::resolve(
            &DeflateOptions {
                context_takeover,
                ..Default::default()
            },
            context_takeover,
        ))
    }

    const MAX: usize = 1024 * 1024;

    #[test]
    fn test_threshold_defaults() {
        assert_eq!(pipeline(true).threshold(), 128);
        assert_eq!(pipeline(false).threshold(), 512);

        let custom = PipelineSettings::resolve(
            &DeflateOptions {
                threshold: Some(64),
                ..Default::default()
            },
            true,
        );
        assert_eq!(DeflatePipeline::new(custom).threshold(), 64);
    }

    #[test]
    fn test_level_coercion() {
        assert_eq!(CompressionLevel::from_level(1), CompressionLevel::BestSpeed);
        assert_eq!(CompressionLevel::from_level(9), CompressionLevel::BestCompression);
        assert_eq!(CompressionLevel::from_level(-1), CompressionLevel::Default);
        assert_eq!(CompressionLevel::from_level(6), CompressionLevel::Default);
        assert_eq!(CompressionLevel::from_level(42), CompressionLevel::Default);
    }

    #[test]
    fn test_roundtrip_no_takeover() {
        let mut sender = pipeline(false);
        let mut receiver = pipeline(false);

        let message = b"aaaaaaaaaaaaaaaaaaaa";
        let compressed = sender.compress(message).unwrap();
        assert!(compressed.len() < message.len());
        assert!(!compressed.ends_with(&DEFLATE_TAIL));

        let inflated = receiver.decompress(&compressed, MAX).unwrap();
        assert_eq!(inflated, message);
    }

    #[test]
    fn test_independent_messages_without_takeover() {
        let mut sender = pipeline(false);
        let mut receiver = pipeline(false);

        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(8);

        let first = sender.compress(&message).unwrap();
        let second = sender.compress(&message).unwrap();
        // Without takeover each message starts from an empty dictionary, so
        // identical inputs produce identical outputs.
        assert_eq!(first, second);

        // And each frame decompresses independently.
        assert_eq!(receiver.decompress(&second, MAX).unwrap(), message);
        assert_eq!(receiver.decompress(&first, MAX).unwrap(), message);
    }

    #[test]
    fn test_takeover_concatenation() {
        let mut sender = pipeline(true);
        let mut receiver = pipeline(true);

        let messages: [&[u8]; 3] = [
            b"shared prefix shared prefix shared prefix",
            b"shared prefix shared prefix shared prefix",
            b"shared prefix and then something else entirely",
        ];

        let mut originals = Vec::new();
        let mut inflated = Vec::new();
        for message in messages {
            let compressed = sender.compress(message).unwrap();
            inflated.extend_from_slice(&receiver.decompress(&compressed, MAX).unwrap());
            originals.extend_from_slice(message);
        }
        assert_eq!(inflated, originals);
    }

    #[test]
    fn test_takeover_improves_ratio() {
        let mut sender = pipeline(true);

        let message = b"The quick brown fox jumps over the lazy dog. ".repeat(8);
        let first = sender.compress(&message).unwrap();
        let second = sender.compress(&message).unwrap();
        // The second copy is expressible almost entirely as back-references
        // into the retained window.
        assert!(second.len() < first.len());
    }

    #[test]
    fn test_corrupt_input_fails() {
        let mut receiver = pipeline(false);
        let garbage = [0xde, 0xad, 0xbe, 0xef, 0x99, 0x88, 0x77, 0x66];
        assert!(receiver.decompress(&garbage, MAX).is_err());
    }

    #[test]
    fn test_inflate_size_cap() {
        let mut sender = pipeline(false);
        let mut receiver = pipeline(false);

        let message = vec![b'x'; 64 * 1024];
        let compressed = sender.compress(&message).unwrap();
        assert!(matches!(
            receiver.decompress(&compressed, 1024),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_rfc_example_payload() {
        // RFC 7692 Section 7.2.3.1: "Hello" compressed with one DEFLATE
        // block and the tail stripped.
        let mut receiver = pipeline(false);
        let payload = [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00];
        assert_eq!(receiver.decompress(&payload, MAX).unwrap(), b"Hello");
    }

    #[test]
    fn test_two_blocks_in_one_message() {
        // RFC 7692 Section 7.2.3.5: two DEFLATE blocks in one message.
        let mut receiver = pipeline(false);
        let payload =
            [0xf2, 0x48, 0x05, 0x00, 0x00, 0x00, 0xff, 0xff, 0xca, 0xc9, 0xc9, 0x07, 0x00];
        assert_eq!(receiver.decompress(&payload, MAX).unwrap(), b"Hello");
    }

    #[test]
    fn test_pool_reuse_is_clean() {
        // Run a takeover-heavy conversation, drop the pipelines (returning
        // state to the pools), then check a fresh pipeline starts from an
        // empty dictionary.
        let mut sender = pipeline(true);
        for _ in 0..4 {
            sender.compress(b"pollute the dictionary with this text").unwrap();
        }
        drop(sender);

        let mut fresh_a = pipeline(false);
        let mut fresh_b = pipeline(false);
        let message = b"pollute the dictionary with this text";
        let compressed = fresh_a.compress(message).unwrap();
        assert_eq!(fresh_b.decompress(&compressed, MAX).unwrap(), message);
    }
}
