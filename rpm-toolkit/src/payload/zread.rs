//! Streaming decompression of the package payload.
//!
//! The compressor is named by the package header and must be known before
//! any payload byte is read. All decoders share a pull contract over a
//! buffered reader: fill the destination, return 0 only on a clean end of
//! stream, and report corruption distinctly from reader failures.

use std::io::{self, BufRead};

use flate2::{Decompress, FlushDecompress, Status};
use liblzma::stream::{Action, Status as LzmaStatus, Stream};
use thiserror::Error;


/// Decoder memory limit for the lzma and xz codecs, following rpm's
/// default limit.
const MEM_LIMIT: u64 = 100 << 20;

/// A pull-mode streaming decoder for the payload of a package.
pub struct Zreader {
    codec: Codec,
    /// End of the compressed stream has been reached.
    eos: bool,
}

enum Codec {
    Gzip(Decompress),
    Lzma(Stream),
    Xz(Stream),
}

impl Zreader {

    /// Initialize a decoder for the given compressor name, as recorded by
    /// the payloadcompressor header tag.
    pub fn new(zprog: &str) -> Result<Self, ZreadError> {
        let codec = match zprog {
            // 32 KiB window, gzip framing only.
            "gzip" => Codec::Gzip(Decompress::new_gzip(15)),
            "lzma" => Codec::Lzma(Stream::new_lzma_decoder(MEM_LIMIT).map_err(ZreadError::Init)?),
            "xz" => Codec::Xz(Stream::new_stream_decoder(MEM_LIMIT, liblzma::stream::CONCATENATED)
                .map_err(ZreadError::Init)?),
            _ => return Err(ZreadError::UnknownCompressor(zprog.to_string())),
        };
        Ok(Self { codec, eos: false })
    }

    /// Decode into the destination until it is full or the compressed
    /// stream cleanly ends. Returns the number of bytes decoded, 0 only on
    /// a clean end of stream.
    pub fn read<R: BufRead>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<usize, ZreadError> {
        debug_assert!(!buf.is_empty());
        match &mut self.codec {
            Codec::Gzip(state) => read_gzip(state, &mut self.eos, reader, buf),
            Codec::Lzma(stream) => read_lzma(stream, &mut self.eos, reader, buf),
            Codec::Xz(stream) => read_xz(stream, &mut self.eos, reader, buf),
        }
    }

}

fn read_gzip<R: BufRead>(state: &mut Decompress, eos: &mut bool, reader: &mut R,
                         buf: &mut [u8]) -> Result<usize, ZreadError> {

    let mut pos = 0;

    while pos < buf.len() {

        let input = reader.fill_buf()?;
        if input.is_empty() {
            // Expected vs unexpected end of the underlying input.
            if *eos {
                return Ok(pos);
            }
            return Err(ZreadError::Corrupt);
        }

        // Got some data, but the last call may have reported the end of a
        // member. Concatenated members continue transparently on a fresh
        // decoder; unlike gzread() there is no tolerance for trailing
        // garbage, leftover bytes must start a valid member.
        if *eos {
            *eos = false;
            *state = Decompress::new_gzip(15);
        }

        let before_in = state.total_in();
        let before_out = state.total_out();

        match state.decompress(input, &mut buf[pos..], FlushDecompress::None) {
            Ok(Status::StreamEnd) => *eos = true,
            Ok(Status::Ok) => {}
            // The output buffer cannot be grown, so no progress is fatal.
            Ok(Status::BufError) | Err(_) => return Err(ZreadError::Corrupt),
        }

        let consumed = (state.total_in() - before_in) as usize;
        reader.consume(consumed);
        pos += (state.total_out() - before_out) as usize;

    }

    Ok(pos)

}

fn read_lzma<R: BufRead>(stream: &mut Stream, eos: &mut bool, reader: &mut R,
                         buf: &mut [u8]) -> Result<usize, ZreadError> {

    let mut pos = 0;

    while pos < buf.len() {

        let input = reader.fill_buf()?;
        if input.is_empty() {
            if *eos {
                return Ok(pos);
            }
            return Err(ZreadError::Corrupt);
        }

        // LZMA1 streams have no magic, but they do have an uncompressed
        // size / end-of-stream marker, so the end is reported reliably.
        // They are not supposed to be concatenated, trailing bytes are
        // not supported.
        if *eos {
            return Err(ZreadError::Corrupt);
        }

        let before_in = stream.total_in();
        let before_out = stream.total_out();

        match stream.process(input, &mut buf[pos..], Action::Run) {
            Ok(LzmaStatus::StreamEnd) => *eos = true,
            Ok(LzmaStatus::Ok) => {}
            Ok(_) | Err(_) => return Err(ZreadError::Corrupt),
        }

        let consumed = (stream.total_in() - before_in) as usize;
        reader.consume(consumed);
        pos += (stream.total_out() - before_out) as usize;

    }

    Ok(pos)

}

fn read_xz<R: BufRead>(stream: &mut Stream, eos: &mut bool, reader: &mut R,
                       buf: &mut [u8]) -> Result<usize, ZreadError> {

    let mut pos = 0;

    while pos < buf.len() {

        let input = reader.fill_buf()?;
        if input.is_empty() {

            if *eos {
                return Ok(pos);
            }

            // XZ frames permit zero padding and may somehow be combined
            // with other kinds of frames, but with concatenation enabled
            // trailing garbage is explicitly prohibited. Thus underlying
            // EOF must be signalled with a finalizing step, which must
            // report the end of the stream.
            let before_out = stream.total_out();
            match stream.process(&[], &mut buf[pos..], Action::Finish) {
                Ok(LzmaStatus::StreamEnd) => *eos = true,
                _ => return Err(ZreadError::Corrupt),
            }

            // The finalizing step may still produce some data.
            pos += (stream.total_out() - before_out) as usize;
            return Ok(pos);

        }

        // Hardly possible, but what if this is called again after the end
        // of the stream and there is more data on the reader?
        if *eos {
            return Err(ZreadError::Corrupt);
        }

        let before_in = stream.total_in();
        let before_out = stream.total_out();

        match stream.process(input, &mut buf[pos..], Action::Run) {
            Ok(LzmaStatus::Ok) => {}
            Ok(_) | Err(_) => return Err(ZreadError::Corrupt),
        }

        let consumed = (stream.total_in() - before_in) as usize;
        reader.consume(consumed);
        pos += (stream.total_out() - before_out) as usize;

    }

    Ok(pos)

}


/// Errors that can happen while decoding the compressed payload.
#[derive(Debug, Error)]
pub enum ZreadError {
    /// The header names a compressor this reader does not implement.
    #[error("unknown payload compressor {0:?}")]
    UnknownCompressor(String),
    /// The decoder could not be initialized.
    #[error("cannot initialize decoder: {0}")]
    Init(#[source] liblzma::stream::Error),
    /// The compressed stream is corrupt: a decode failure, a premature end
    /// of the underlying input, or trailing bytes after the stream end.
    #[error("decompression failed")]
    Corrupt,
    /// IO error from the underlying reader.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}


#[cfg(test)]
mod tests {

    use std::io::{Cursor, Write};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use liblzma::stream::LzmaOptions;
    use liblzma::write::XzEncoder;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn lzma(data: &[u8]) -> Vec<u8> {
        let options = LzmaOptions::new_preset(6).unwrap();
        let stream = Stream::new_lzma_encoder(&options).unwrap();
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Decode everything in small steps, expecting a clean end of stream.
    fn drain(zprog: &str, compressed: &[u8]) -> Result<Vec<u8>, ZreadError> {
        let mut z = Zreader::new(zprog)?;
        let mut reader = Cursor::new(compressed);
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let len = z.read(&mut reader, &mut buf)?;
            if len == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..len]);
        }
    }

    #[test]
    fn unknown_compressor() {
        assert!(matches!(Zreader::new("zstd"), Err(ZreadError::UnknownCompressor(_))));
        assert!(matches!(Zreader::new(""), Err(ZreadError::UnknownCompressor(_))));
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(drain("gzip", &gzip(data)).unwrap(), data);
    }

    #[test]
    fn gzip_concatenated_members() {
        let mut compressed = gzip(b"first member, ");
        compressed.extend_from_slice(&gzip(b"second member"));
        assert_eq!(drain("gzip", &compressed).unwrap(), b"first member, second member");
    }

    #[test]
    fn gzip_trailing_garbage() {
        let mut compressed = gzip(b"data");
        compressed.extend_from_slice(b"garbage");
        assert!(matches!(drain("gzip", &compressed), Err(ZreadError::Corrupt)));
    }

    #[test]
    fn gzip_truncated() {
        let compressed = gzip(b"some data worth compressing");
        let cut = &compressed[..compressed.len() - 5];
        assert!(matches!(drain("gzip", cut), Err(ZreadError::Corrupt)));
    }

    #[test]
    fn xz_roundtrip() {
        let data: Vec<u8> = (0..10000u32).flat_map(|n| n.to_le_bytes()).collect();
        assert_eq!(drain("xz", &xz(&data)).unwrap(), data);
    }

    #[test]
    fn xz_concatenated_streams() {
        let mut compressed = xz(b"first, ");
        compressed.extend_from_slice(&xz(b"second"));
        assert_eq!(drain("xz", &compressed).unwrap(), b"first, second");
    }

    #[test]
    fn xz_trailing_garbage() {
        let mut compressed = xz(b"data");
        compressed.extend_from_slice(b"g");
        assert!(matches!(drain("xz", &compressed), Err(ZreadError::Corrupt)));
    }

    #[test]
    fn lzma_roundtrip() {
        let data = b"lzma alone stream with an end-of-stream marker";
        assert_eq!(drain("lzma", &lzma(data)).unwrap(), data);
    }

    #[test]
    fn lzma_trailing_garbage() {
        let mut compressed = lzma(b"data");
        compressed.extend_from_slice(b"garbage");
        assert!(matches!(drain("lzma", &compressed), Err(ZreadError::Corrupt)));
    }

    #[test]
    fn empty_input_is_not_a_stream() {
        assert!(matches!(drain("gzip", b""), Err(ZreadError::Corrupt)));
        assert!(matches!(drain("xz", b""), Err(ZreadError::Corrupt)));
    }

}
