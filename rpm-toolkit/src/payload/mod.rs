//! RPM payload codec.
//!
//! The payload is a compressed cpio archive in the "new ASCII" format. This
//! reader streams the archive entry by entry, reconciling every record
//! against the filelist decoded from the package header: each filename must
//! resolve to exactly one header file with a matching mode, hardlink sets
//! must be complete and consistent, and files listed in the header but
//! absent from the archive can be restored as unpackaged entries.
//!
//! Entries are visited strictly forward, there is no seeking back into the
//! compressed stream.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::header::{self, Header, HeaderError};
use crate::util::hex::parse_hex8;

pub mod zread;

use zread::{Zreader, ZreadError};


/// Magic of an ordinary cpio record.
const MAGIC: &[u8; 6] = b"070701";

/// Magic of the alternate record carrying only a filelist index, used by
/// producers of packages with the longfilesizes tag.
const MAGIC_INDEX: &[u8; 6] = b"07070X";

/// Longest filename of a binary package entry.
const FNAME_MAX: usize = 4096;

/// Longest filename of a source package entry, which is a bare basename.
const FNAME_MAX_SRC: usize = 256;

/// Symlink targets must be shorter than this.
const LINK_MAX: u64 = 4096;


/// One payload entry. Borrowed from the reader, the entry is valid until
/// the next call to [`PayloadReader::next()`].
#[derive(Debug, Default)]
pub struct CpioEntry {
    /// Index of the file in the header filelist.
    pub index: usize,
    pub ino: u32,
    pub mode: u16,
    pub nlink: u32,
    pub mtime: u32,
    /// File flags recorded in the package header.
    pub fflags: u32,
    /// Data size; for symlinks, the length of the target.
    pub size: u64,
    /// True when the entry comes from an archive record, false when it was
    /// restored from the header alone.
    pub packaged: bool,
    fname: Vec<u8>,
}

impl CpioEntry {

    /// The absolute filename of the entry, or a bare basename for source
    /// packages.
    #[inline]
    pub fn fname(&self) -> &[u8] {
        &self.fname
    }

    /// The filename for display purposes.
    #[inline]
    pub fn fname_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.fname)
    }

    #[inline]
    pub fn is_reg(&self) -> bool {
        header::mode_is_reg(self.mode)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        header::mode_is_dir(self.mode)
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        header::mode_is_lnk(self.mode)
    }

}

/// Explicit state of the iterator, which controls what the caller may do
/// with the current entry.
enum State {
    /// No current entry.
    Between,
    /// A regular file entry whose data can be read.
    Regular,
    /// A symlink entry whose target can be read.
    Symlink,
    /// A packaged entry with no readable data (directory, device, fifo).
    Other,
    /// An entry restored from the header, with no data in the archive.
    Ghost,
    /// The archive is finished.
    Exhausted,
}

/// Tracker for the hardlink set being iterated. A set is open when `cnt` is
/// non-zero, and complete when `cnt` reaches `nlink`.
#[derive(Default)]
struct HardlinkSet {
    ino: u32,
    mode: u16,
    nlink: u32,
    cnt: u32,
}

/// A streaming reader over the payload of one package.
///
/// The reader exclusively owns the underlying reader, the decompressor and
/// the decoded header; everything is released when it is dropped.
pub struct PayloadReader<R: BufRead> {
    /// Underlying reader, positioned at the compressed payload after the
    /// header has been decoded.
    reader: R,
    /// Payload decompressor, chosen by the payloadcompressor header tag.
    z: Zreader,
    header: Header,
    /// Current position in the decompressed payload.
    cur_pos: u64,
    /// End position of the current entry's data.
    end_pos: u64,
    state: State,
    hard: HardlinkSet,
    /// Emit files missing from the archive as unpackaged entries once the
    /// trailer is reached.
    all: bool,
    /// Scan position of the unpackaged emission.
    ghost_at: usize,
    draining: bool,
    ent: CpioEntry,
    /// Scratch buffer for the raw, still padded filename of a record.
    name_buf: Vec<u8>,
}

impl PayloadReader<BufReader<File>> {

    /// Open a package file and decode its header, leaving the reader ready
    /// to iterate the payload.
    ///
    /// With `all` set, files listed in the header but missing from the
    /// archive (ghost files) are emitted as unpackaged entries after the
    /// last archive entry.
    pub fn open<P: AsRef<Path>>(path: P, all: bool) -> ReadResult<Self> {
        Self::new(BufReader::new(File::open(path)?), all)
    }

}

impl<R: BufRead> PayloadReader<R> {

    /// Decode the package header from the given reader and initialize the
    /// payload decompressor.
    pub fn new(mut reader: R, all: bool) -> ReadResult<Self> {
        let header = Header::read(&mut reader)?;
        let z = Zreader::new(header.compressor())?;
        Ok(Self {
            reader,
            z,
            header,
            cur_pos: 0,
            end_pos: 0,
            state: State::Between,
            hard: HardlinkSet::default(),
            all,
            ghost_at: 0,
            draining: false,
            ent: CpioEntry::default(),
            name_buf: Vec::new(),
        })
    }

    /// Return the decoded package header.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Return the number of files recorded in the header filelist, an
    /// upper bound on the number of entries.
    #[inline]
    pub fn file_count(&self) -> usize {
        self.header.file_count()
    }

    /// Advance to the next entry, or `None` once the archive is finished.
    pub fn next(&mut self) -> ReadResult<Option<&CpioEntry>> {

        if matches!(self.state, State::Exhausted) {
            return Ok(None);
        }
        if self.draining {
            return self.next_unpackaged();
        }
        self.state = State::Between;

        // Advance past leftover data of the previous entry; records are
        // aligned to 4 bytes.
        let next_pos = self.end_pos + 3 & !3;
        if next_pos > self.cur_pos {
            self.skip_payload(next_pos - self.cur_pos)?;
            self.cur_pos = next_pos;
        }

        let mut magic = [0u8; 6];
        self.read_payload(&mut magic)?;
        self.cur_pos += 6;

        if &magic == MAGIC_INDEX {
            return self.next_by_index();
        }
        if &magic != MAGIC {
            return Err(ReadError::InvalidMagic);
        }

        // The fixed remainder of the record: 13 eight-digit hex fields for
        // ino, mode, uid, gid, nlink, mtime, filesize, dev and rdev major
        // and minor, filename length and checksum.
        let mut rec = [0u8; 104];
        self.read_payload(&mut rec)?;
        self.cur_pos += 104;

        let mut v = [0u32; 12];
        for (i, field) in rec.chunks_exact(8).take(12).enumerate() {
            v[i] = parse_hex8(field).ok_or(ReadError::InvalidHex)?;
        }
        // rpm always writes a zero checksum.
        if &rec[96..] != b"00000000" {
            return Err(ReadError::NonZeroChecksum);
        }

        // The filename length includes the trailing NUL.
        let fnamelen = v[11] as usize;
        let max = if self.header.is_source() { FNAME_MAX_SRC } else { FNAME_MAX };
        if fnamelen > max + 2 {
            return Err(ReadError::NameTooLong);
        }
        if fnamelen < 2 {
            return Err(ReadError::NameTooShort);
        }

        // The magic is 6 bytes out of a 4-byte-aligned record, so the
        // padded filename area falls 2 bytes short of its own alignment.
        let fnamesize = ((fnamelen + 1) & !3) + 2;
        self.name_buf.clear();
        self.name_buf.resize(fnamesize, 0);
        read_exact(&mut self.z, &mut self.reader, &mut self.name_buf)?;
        self.cur_pos += fnamesize as u64;

        let raw = &self.name_buf[..fnamelen];
        if raw[fnamelen - 1] != 0 || raw[..fnamelen - 1].contains(&0) {
            return Err(ReadError::InvalidName(String::from_utf8_lossy(raw).into_owned()));
        }
        let raw_name = &raw[..fnamelen - 1];

        if raw_name == b"TRAILER!!!" {
            // The trailer must not interrupt a hardlink set.
            if self.hard.cnt < self.hard.nlink {
                return Err(ReadError::MeagerHardlinkSet("TRAILER".to_string()));
            }
            // The compressed stream must end exactly at the trailer.
            let mut probe = [0u8; 1];
            if self.z.read(&mut self.reader, &mut probe)? != 0 {
                return Err(ReadError::TrailingData);
            }
            if self.all {
                self.draining = true;
                return self.next_unpackaged();
            }
            self.state = State::Exhausted;
            return Ok(None);
        }

        // Binary package names come with a "./" prefix that is stripped to
        // the absolute form, or already absolute. Source package names are
        // bare basenames.
        self.ent.fname.clear();
        if self.header.is_source() {
            if raw_name.starts_with(b"./") {
                return Err(ReadError::InvalidName(String::from_utf8_lossy(raw_name).into_owned()));
            }
            self.ent.fname.extend_from_slice(raw_name);
        } else if raw_name.starts_with(b"./") {
            self.ent.fname.extend_from_slice(&raw_name[1..]);
        } else if raw_name.first() == Some(&b'/') {
            self.ent.fname.extend_from_slice(raw_name);
        } else {
            return Err(ReadError::InvalidName(String::from_utf8_lossy(raw_name).into_owned()));
        }
        if self.ent.fname.is_empty() {
            return Err(ReadError::NameTooShort);
        }
        if self.ent.fname.len() > max {
            return Err(ReadError::NameTooLong);
        }

        // A valid mode must fit 16 bits.
        if v[1] > 0xFFFF {
            return Err(ReadError::InvalidMode(self.fname_string(), v[1]));
        }
        let mode = v[1] as u16;

        // Reconcile with the header filelist: the file must be listed,
        // once, with the same mode.
        let index = match self.header.find(&self.ent.fname) {
            Some(index) => index,
            None => return Err(ReadError::UnknownFile(self.fname_string())),
        };
        let fi = self.header.file(index);
        if fi.seen() {
            return Err(ReadError::DuplicateFile(self.fname_string()));
        }
        if fi.mode != mode {
            return Err(ReadError::ModeMismatch(self.fname_string()));
        }
        let fflags = fi.fflags;
        self.header.file_mut(index).mark_seen();

        self.ent.index = index;
        self.ent.ino = v[0];
        self.ent.mode = mode;
        self.ent.nlink = v[4];
        self.ent.mtime = v[5];
        self.ent.fflags = fflags;
        self.ent.packaged = true;

        // Length of the data present in the archive after the record.
        let data_len = v[6] as u64;
        self.ent.size = data_len;

        // With extended info, the header is authoritative for the stat
        // fields: such records carry no usable nlink, and their size field
        // cannot express large files. Symlink sizes stay as reported, they
        // are the length of the target stored in the archive.
        if let Some(fx) = self.header.file_extra(index) {
            self.ent.ino = fx.ino;
            self.ent.mtime = fx.mtime;
            self.ent.nlink = fx.nlink as u32;
            if !header::mode_is_lnk(mode) {
                self.ent.size = fx.size;
            }
        }

        // Finalize a complete hardlink set: the new entry must not belong
        // to it anymore.
        if self.hard.cnt != 0 && self.hard.cnt == self.hard.nlink {
            if self.ent.ino == self.hard.ino {
                return Err(ReadError::ObeseHardlinkSet(self.fname_string()));
            }
            self.hard = HardlinkSet::default();
        }

        if !header::mode_is_dir(mode) && self.ent.nlink > 1 {
            // Since rpm-4.12.0-alpha~173, only regular files can have
            // hardlinks.
            if header::mode_is_lnk(mode) {
                return Err(ReadError::HardlinkedSymlink(self.fname_string()));
            }
            if self.hard.cnt == 0 {
                // E.g. ext4 has a 16-bit i_links_count.
                if self.ent.nlink > 0xFFFF {
                    return Err(ReadError::InvalidNlink(self.fname_string()));
                }
                self.hard = HardlinkSet {
                    ino: self.ent.ino,
                    mode,
                    nlink: self.ent.nlink,
                    cnt: 1,
                };
            } else {
                if self.ent.ino != self.hard.ino {
                    return Err(ReadError::MeagerHardlinkSet(self.fname_string()));
                }
                if mode != self.hard.mode {
                    return Err(ReadError::FickleHardlinkMode(self.fname_string()));
                }
                if self.ent.nlink != self.hard.nlink {
                    return Err(ReadError::FickleNlink(self.fname_string()));
                }
                self.hard.cnt += 1;
            }
            // All but the last hardlink in a set come with no data.
            if self.hard.cnt < self.hard.nlink {
                if self.header.has_extra() {
                    self.ent.size = 0;
                } else if self.ent.size != 0 {
                    return Err(ReadError::NonEmptyHardlink(self.fname_string()));
                }
            }
        } else if self.hard.cnt != 0 {
            // Not a hardlink in the middle of an open set.
            return Err(ReadError::MeagerHardlinkSet(self.fname_string()));
        }

        if header::mode_is_lnk(mode) {
            if data_len == 0 {
                return Err(ReadError::ZeroSymlink(self.fname_string()));
            }
            if data_len >= LINK_MAX {
                return Err(ReadError::SymlinkTooLong(self.fname_string()));
            }
        }

        self.end_pos = self.cur_pos + data_len;
        self.state = if header::mode_is_reg(mode) {
            State::Regular
        } else if header::mode_is_lnk(mode) {
            State::Symlink
        } else {
            State::Other
        };

        Ok(Some(&self.ent))

    }

    /// Parse the alternate index record: 8 hex digits of a filelist index
    /// and 2 bytes of padding after the magic. The referenced file has no
    /// data in the archive, its metadata lives in the header.
    fn next_by_index(&mut self) -> ReadResult<Option<&CpioEntry>> {

        if !self.header.has_extra() {
            return Err(ReadError::InvalidMagic);
        }

        let mut rec = [0u8; 10];
        self.read_payload(&mut rec)?;
        self.cur_pos += 10;

        let index = parse_hex8(&rec[..8]).ok_or(ReadError::InvalidHex)? as usize;
        if index >= self.header.file_count() {
            return Err(ReadError::InvalidFileIndex(index as u32));
        }

        self.fill_unpackaged(index);
        if self.header.file(index).seen() {
            return Err(ReadError::DuplicateFile(self.fname_string()));
        }
        self.header.file_mut(index).mark_seen();

        self.end_pos = self.cur_pos;
        self.state = State::Ghost;
        Ok(Some(&self.ent))

    }

    /// Emit the next file that never appeared in the archive, in filelist
    /// order.
    fn next_unpackaged(&mut self) -> ReadResult<Option<&CpioEntry>> {
        while self.ghost_at < self.header.file_count() {
            let index = self.ghost_at;
            self.ghost_at += 1;
            if self.header.file(index).seen() {
                continue;
            }
            self.header.file_mut(index).mark_seen();
            self.fill_unpackaged(index);
            self.state = State::Ghost;
            return Ok(Some(&self.ent));
        }
        self.state = State::Exhausted;
        Ok(None)
    }

    /// Fill the current entry from the header filelist alone.
    fn fill_unpackaged(&mut self, index: usize) {

        let fi = self.header.file(index);
        self.ent.index = index;
        self.ent.mode = fi.mode;
        self.ent.fflags = fi.fflags;
        self.ent.packaged = false;
        self.ent.ino = 0;
        self.ent.mtime = 0;
        self.ent.nlink = 1;
        self.ent.size = 0;

        if let Some(fx) = self.header.file_extra(index) {
            self.ent.ino = fx.ino;
            self.ent.mtime = fx.mtime;
            self.ent.nlink = fx.nlink as u32;
            // A ghost symlink still reports the length of its target.
            if header::mode_is_lnk(self.ent.mode) {
                self.ent.size = fx.size;
            }
        }

        self.ent.fname.clear();
        self.header.copy_name(index, &mut self.ent.fname);

    }

    /// Read data of the current regular file entry, up to its end. Returns
    /// the number of bytes read, 0 at the end of the entry.
    pub fn read(&mut self, buf: &mut [u8]) -> ReadResult<usize> {
        if !matches!(self.state, State::Regular) {
            return Err(ReadError::NotRegular);
        }
        let left = self.end_pos - self.cur_pos;
        let len = (buf.len() as u64).min(left) as usize;
        if len == 0 {
            return Ok(0);
        }
        read_exact(&mut self.z, &mut self.reader, &mut buf[..len])?;
        self.cur_pos += len as u64;
        Ok(len)
    }

    /// Read the target of the current symlink entry into the given buffer,
    /// which must be larger than the target length. The target is
    /// NUL-terminated in the buffer and must not contain NUL itself.
    /// Returns the length of the target.
    pub fn readlink(&mut self, buf: &mut [u8]) -> ReadResult<usize> {
        if !matches!(self.state, State::Symlink) {
            return Err(ReadError::NotSymlink);
        }
        let len = self.ent.size as usize;
        if buf.len() <= len {
            return Err(ReadError::BufferTooSmall);
        }
        read_exact(&mut self.z, &mut self.reader, &mut buf[..len])?;
        self.cur_pos += len as u64;
        buf[len] = 0;
        if buf[..len].contains(&0) {
            return Err(ReadError::EmbeddedNul(self.fname_string()));
        }
        // The target can only be read once.
        self.state = State::Other;
        Ok(len)
    }

    #[inline]
    fn read_payload(&mut self, buf: &mut [u8]) -> ReadResult<()> {
        read_exact(&mut self.z, &mut self.reader, buf)
    }

    /// Skip decompressed payload bytes through a scratch sink.
    fn skip_payload(&mut self, mut len: u64) -> ReadResult<()> {
        let mut scratch = [0u8; 1024];
        while len > 0 {
            let chunk = len.min(scratch.len() as u64) as usize;
            read_exact(&mut self.z, &mut self.reader, &mut scratch[..chunk])?;
            len -= chunk as u64;
        }
        Ok(())
    }

    fn fname_string(&self) -> String {
        self.ent.fname_lossy().into_owned()
    }

}

/// Decompress exactly the requested number of bytes, treating a clean end
/// of the compressed stream as a truncated archive.
fn read_exact<R: BufRead>(z: &mut Zreader, reader: &mut R, buf: &mut [u8]) -> ReadResult<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let len = z.read(reader, &mut buf[pos..])?;
        if len == 0 {
            return Err(ReadError::UnexpectedEnd);
        }
        pos += len;
    }
    Ok(())
}


/// Result type alias for [`ReadError`] error type.
pub type ReadResult<T> = Result<T, ReadError>;

/// Errors that can happen while reading a package payload.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The package header could not be decoded.
    #[error("header error: {0}")]
    Header(#[from] HeaderError),
    /// The payload decompressor failed.
    #[error("decoder error: {0}")]
    Zread(#[from] ZreadError),
    /// The decompressed payload ended in the middle of a record or of file
    /// data.
    #[error("unexpected end of cpio archive")]
    UnexpectedEnd,
    /// A record does not start with the cpio magic.
    #[error("bad cpio header magic")]
    InvalidMagic,
    /// A record field holds a non-hexadecimal character.
    #[error("bad cpio hex number")]
    InvalidHex,
    /// rpm always writes zero cpio checksums.
    #[error("non-zero cpio checksum")]
    NonZeroChecksum,
    /// An index record references a file outside the header filelist.
    #[error("bad cpio file index {0}")]
    InvalidFileIndex(u32),
    /// The filename length field exceeds its bound.
    #[error("cpio filename too long")]
    NameTooLong,
    #[error("cpio filename too short")]
    NameTooShort,
    /// The filename is malformed: embedded NUL, or a missing "./" or "/"
    /// prefix in a binary package.
    #[error("{0}: invalid cpio filename")]
    InvalidName(String),
    /// The mode field does not fit 16 bits.
    #[error("{0}: bad mode 0{1:o}")]
    InvalidMode(String, u32),
    /// The filename does not resolve against the header filelist.
    #[error("{0}: file not in header")]
    UnknownFile(String),
    /// The same header file resolved from two archive records.
    #[error("{0}: duplicate cpio entry")]
    DuplicateFile(String),
    /// The record mode disagrees with the header filemodes tag.
    #[error("{0}: mode does not match header")]
    ModeMismatch(String),
    /// More entries with the same inode than the set's nlink.
    #[error("{0}: obese hardlink set")]
    ObeseHardlinkSet(String),
    /// A hardlink set was left incomplete.
    #[error("{0}: meager hardlink set")]
    MeagerHardlinkSet(String),
    /// Mode changed in the middle of a hardlink set.
    #[error("{0}: fickle hardlink mode")]
    FickleHardlinkMode(String),
    /// Nlink changed in the middle of a hardlink set.
    #[error("{0}: fickle nlink")]
    FickleNlink(String),
    /// An nlink count larger than any file system allows.
    #[error("{0}: bad nlink")]
    InvalidNlink(String),
    /// Symbolic links cannot be hardlinked.
    #[error("{0}: hardlinked symlink")]
    HardlinkedSymlink(String),
    /// All but the last member of a hardlink set must have no data.
    #[error("{0}: non-empty hardlink data")]
    NonEmptyHardlink(String),
    /// A symlink with a zero-length target.
    #[error("{0}: zero-length symlink target")]
    ZeroSymlink(String),
    /// A symlink target longer than any path allowed.
    #[error("{0}: symlink target too long")]
    SymlinkTooLong(String),
    /// A symlink target with an embedded NUL byte.
    #[error("{0}: embedded null byte in cpio symlink")]
    EmbeddedNul(String),
    /// Payload bytes remain after the cpio trailer.
    #[error("trailing data after cpio trailer")]
    TrailingData,
    /// Read called while the current entry is not a regular file.
    #[error("entry is not a regular file")]
    NotRegular,
    /// Readlink called while the current entry is not a symlink.
    #[error("entry is not a symlink")]
    NotSymlink,
    /// The caller's readlink buffer cannot hold the target and its
    /// terminator.
    #[error("symlink buffer too small")]
    BufferTooSmall,
    /// IO error while opening the package.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}


#[cfg(test)]
mod tests {

    use std::io::{Cursor, Write};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use liblzma::write::XzEncoder;

    use crate::header::tests::{binary_header, HeaderBuilder};

    use super::*;

    /// Append one "070701" record with explicit fields and checksum.
    fn record_fields(cpio: &mut Vec<u8>, name: &str, fields: [u32; 12],
                     checksum: &[u8; 8], data: &[u8]) {
        // Records start 4-byte aligned.
        while cpio.len() % 4 != 0 {
            cpio.push(0);
        }
        cpio.extend_from_slice(b"070701");
        for v in fields {
            cpio.extend_from_slice(format!("{v:08x}").as_bytes());
        }
        cpio.extend_from_slice(checksum);
        let fnamelen = name.len() + 1;
        cpio.extend_from_slice(name.as_bytes());
        cpio.push(0);
        let fnamesize = ((fnamelen + 1) & !3) + 2;
        cpio.resize(cpio.len() + fnamesize - fnamelen, 0);
        cpio.extend_from_slice(data);
    }

    /// Append an ordinary record; mtime is fixed at 1000.
    fn record(cpio: &mut Vec<u8>, name: &str, ino: u32, mode: u32, nlink: u32,
              size: u32, data: &[u8]) {
        assert_eq!(size as usize, data.len());
        let fnamelen = name.len() as u32 + 1;
        record_fields(cpio, name, [ino, mode, 0, 0, nlink, 1000, size, 0, 0, 0, 0, fnamelen],
            b"00000000", data);
    }

    fn trailer(cpio: &mut Vec<u8>) {
        record(cpio, "TRAILER!!!", 0, 0, 1, 0, b"");
    }

    /// Append an alternate "07070X" index record.
    fn index_record(cpio: &mut Vec<u8>, index: u32) {
        while cpio.len() % 4 != 0 {
            cpio.push(0);
        }
        cpio.extend_from_slice(b"07070X");
        cpio.extend_from_slice(format!("{index:08x}").as_bytes());
        cpio.extend_from_slice(&[0, 0]);
    }

    /// Assemble a whole package: headers followed by the gzip'ed archive.
    fn package(header: &HeaderBuilder, cpio: &[u8]) -> Vec<u8> {
        let mut data = header.build();
        let mut encoder = GzEncoder::new(&mut data, Compression::default());
        encoder.write_all(cpio).unwrap();
        encoder.finish().unwrap();
        data
    }

    fn open(data: Vec<u8>, all: bool) -> PayloadReader<Cursor<Vec<u8>>> {
        PayloadReader::new(Cursor::new(data), all).unwrap()
    }

    /// Read the whole data of the current regular entry in small chunks.
    fn read_all<R: BufRead>(reader: &mut PayloadReader<R>) -> Vec<u8> {
        let mut buf = [0u8; 16];
        let mut out = Vec::new();
        loop {
            let len = reader.read(&mut buf).unwrap();
            if len == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..len]);
        }
    }

    #[test]
    fn binary_gzip_walkthrough() {

        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 26, b"abcdefghijklmnopqrstuvwxyz");
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);

        let mut reader = open(package(&binary_header(), &cpio), false);
        assert_eq!(reader.file_count(), 3);

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/usr/bin");
        assert_eq!(ent.index, 0);
        assert!(ent.is_dir());
        assert!(ent.packaged);
        assert!(matches!(reader.read(&mut [0u8; 4]), Err(ReadError::NotRegular)));

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/usr/bin/true");
        assert_eq!(ent.index, 1);
        assert_eq!(ent.size, 26);
        assert_eq!(ent.nlink, 1);
        assert_eq!(ent.mtime, 1000);
        assert!(ent.is_reg());
        assert_eq!(read_all(&mut reader), b"abcdefghijklmnopqrstuvwxyz");

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/usr/link");
        assert!(ent.is_symlink());
        assert_eq!(ent.size, 7);
        let mut buf = [0u8; 64];
        let len = reader.readlink(&mut buf).unwrap();
        assert_eq!(len, 7);
        assert_eq!(&buf[..7], b"/a/b/cd");
        assert_eq!(buf[7], 0);

        assert!(reader.next().unwrap().is_none());
        assert!(reader.next().unwrap().is_none());

    }

    #[test]
    fn absolute_names_accepted() {
        let mut cpio = Vec::new();
        record(&mut cpio, "/usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "/usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        record(&mut cpio, "/usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert_eq!(reader.next().unwrap().unwrap().fname(), b"/usr/bin");
        assert_eq!(reader.next().unwrap().unwrap().fname(), b"/usr/bin/true");
    }

    #[test]
    fn entry_data_left_unread_is_skipped() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 26, b"abcdefghijklmnopqrstuvwxyz");
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap().unwrap();
        reader.next().unwrap().unwrap();
        // Data of /usr/bin/true is never read.
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/usr/link");
    }

    fn source_header() -> HeaderBuilder {
        let mut b = HeaderBuilder::new(true);
        b.int32_tag(1028, &[5, 3])
            .int16_tag(1030, &[0o100644, 0o100644])
            .int32_tag(1037, &[0, 0])
            .string_array_tag(1117, &["hello.spec", "hello.tar"]);
        b
    }

    #[test]
    fn source_package_bare_names() {

        let mut cpio = Vec::new();
        record(&mut cpio, "hello.spec", 1, 0o100644, 1, 5, b"spec\n");
        record(&mut cpio, "hello.tar", 2, 0o100644, 1, 3, b"tar");
        trailer(&mut cpio);

        let mut reader = open(package(&source_header(), &cpio), false);
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"hello.spec");
        assert_eq!(read_all(&mut reader), b"spec\n");
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"hello.tar");
        assert!(reader.next().unwrap().is_none());

    }

    #[test]
    fn source_package_rejects_prefix() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./hello.spec", 1, 0o100644, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&source_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidName(_))));
    }

    /// Four regular files /a /b /c /d, the first three hardlinked.
    fn hardlink_header() -> HeaderBuilder {
        let mut b = HeaderBuilder::new(false);
        b.int32_tag(1028, &[0, 0, 5, 0])
            .int16_tag(1030, &[0o100644, 0o100644, 0o100644, 0o100644])
            .int32_tag(1037, &[0, 0, 0, 0])
            .string_tag(1044, "x-1.0-1.src.rpm")
            .int32_tag(1116, &[0, 0, 0, 0])
            .string_array_tag(1117, &["a", "b", "c", "d"])
            .string_array_tag(1118, &["/"]);
        b
    }

    #[test]
    fn hardlink_set_walkthrough() {

        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./b", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./c", 42, 0o100644, 3, 5, b"hello");
        record(&mut cpio, "./d", 7, 0o100644, 1, 0, b"");
        trailer(&mut cpio);

        let mut reader = open(package(&hardlink_header(), &cpio), false);

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/a");
        assert_eq!((ent.ino, ent.nlink, ent.size), (42, 3, 0));
        assert_eq!(read_all(&mut reader), b"");

        let ent = reader.next().unwrap().unwrap();
        assert_eq!((ent.ino, ent.nlink, ent.size), (42, 3, 0));

        // Only the last member carries the data.
        let ent = reader.next().unwrap().unwrap();
        assert_eq!((ent.ino, ent.nlink, ent.size), (42, 3, 5));
        assert_eq!(read_all(&mut reader), b"hello");

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/d");
        assert!(reader.next().unwrap().is_none());

    }

    #[test]
    fn meager_hardlink_set() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./b", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./d", 7, 0o100644, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&hardlink_header(), &cpio), false);
        reader.next().unwrap();
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::MeagerHardlinkSet(f)) if f == "/d"));
    }

    #[test]
    fn meager_hardlink_set_at_trailer() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./b", 42, 0o100644, 3, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&hardlink_header(), &cpio), false);
        reader.next().unwrap();
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::MeagerHardlinkSet(f)) if f == "TRAILER"));
    }

    #[test]
    fn obese_hardlink_set() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./b", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./c", 42, 0o100644, 3, 5, b"hello");
        record(&mut cpio, "./d", 42, 0o100644, 3, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&hardlink_header(), &cpio), false);
        for _ in 0..3 {
            reader.next().unwrap();
        }
        assert!(matches!(reader.next(), Err(ReadError::ObeseHardlinkSet(_))));
    }

    #[test]
    fn fickle_nlink() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 0, b"");
        record(&mut cpio, "./b", 42, 0o100644, 2, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&hardlink_header(), &cpio), false);
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::FickleNlink(_))));
    }

    #[test]
    fn fickle_hardlink_mode() {
        let mut b = HeaderBuilder::new(false);
        b.int32_tag(1028, &[0, 5])
            .int16_tag(1030, &[0o100644, 0o100755])
            .int32_tag(1037, &[0, 0])
            .string_tag(1044, "x-1.0-1.src.rpm")
            .int32_tag(1116, &[0, 0])
            .string_array_tag(1117, &["a", "b"])
            .string_array_tag(1118, &["/"]);
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 2, 0, b"");
        record(&mut cpio, "./b", 42, 0o100755, 2, 5, b"hello");
        trailer(&mut cpio);
        let mut reader = open(package(&b, &cpio), false);
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::FickleHardlinkMode(_))));
    }

    #[test]
    fn non_empty_hardlink_data() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o100644, 3, 3, b"xyz");
        trailer(&mut cpio);
        let mut reader = open(package(&hardlink_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::NonEmptyHardlink(_))));
    }

    #[test]
    fn hardlinked_symlink_rejected() {
        let mut b = HeaderBuilder::new(false);
        b.int32_tag(1028, &[5, 5])
            .int16_tag(1030, &[0o120777, 0o120777])
            .int32_tag(1037, &[0, 0])
            .string_tag(1044, "x-1.0-1.src.rpm")
            .int32_tag(1116, &[0, 0])
            .string_array_tag(1117, &["a", "b"])
            .string_array_tag(1118, &["/"]);
        let mut cpio = Vec::new();
        record(&mut cpio, "./a", 42, 0o120777, 2, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&b, &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::HardlinkedSymlink(_))));
    }

    /// Extended header: regular /a (6 GiB), regular /b, symlink /c, with
    /// per-file inodes, mtimes and long sizes.
    fn extended_header() -> HeaderBuilder {
        let mut b = HeaderBuilder::new(false);
        b.int16_tag(1030, &[0o100644, 0o100644, 0o120777])
            .int32_tag(1034, &[100, 200, 300])
            .int32_tag(1037, &[0, 0, 0])
            .string_tag(1044, "x-1.0-1.src.rpm")
            .int32_tag(1096, &[11, 22, 33])
            .int32_tag(1116, &[0, 0, 0])
            .string_array_tag(1117, &["a", "b", "c"])
            .string_array_tag(1118, &["/"])
            .int64_tag(5008, &[6 << 30, 5, 9]);
        b
    }

    #[test]
    fn extended_records() {

        let mut cpio = Vec::new();
        // The large file has no data in the archive, only an index record.
        index_record(&mut cpio, 0);
        record(&mut cpio, "./b", 22, 0o100644, 0, 5, b"hello");
        record(&mut cpio, "./c", 33, 0o120777, 0, 9, b"/usr/bin1");
        trailer(&mut cpio);

        let mut reader = open(package(&extended_header(), &cpio), false);

        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/a");
        assert!(!ent.packaged);
        assert_eq!((ent.ino, ent.mtime, ent.nlink), (11, 100, 1));
        // The emitted size is zero, the stored size is authoritative.
        assert_eq!(ent.size, 0);
        assert_eq!(reader.header().file_extra(0).unwrap().size, 6 << 30);
        assert!(matches!(reader.read(&mut [0u8; 4]), Err(ReadError::NotRegular)));

        // Stat fields of packaged entries come from the header.
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/b");
        assert!(ent.packaged);
        assert_eq!((ent.ino, ent.mtime, ent.nlink), (22, 200, 1));
        assert_eq!(ent.size, 5);
        assert_eq!(read_all(&mut reader), b"hello");

        let ent = reader.next().unwrap().unwrap();
        assert!(ent.is_symlink());
        assert_eq!(ent.size, 9);
        let mut buf = [0u8; 16];
        assert_eq!(reader.readlink(&mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"/usr/bin1");

        assert!(reader.next().unwrap().is_none());

    }

    #[test]
    fn index_record_needs_extended_header() {
        let mut cpio = Vec::new();
        index_record(&mut cpio, 0);
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidMagic)));
    }

    #[test]
    fn index_record_out_of_range() {
        let mut cpio = Vec::new();
        index_record(&mut cpio, 3);
        trailer(&mut cpio);
        let mut reader = open(package(&extended_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidFileIndex(3))));
    }

    #[test]
    fn ghost_restoration() {

        // The symlink never shows up in the archive.
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        trailer(&mut cpio);

        // Without `all` the missing file is silently ignored.
        let mut reader = open(package(&binary_header(), &cpio.clone()), false);
        reader.next().unwrap();
        reader.next().unwrap();
        assert!(reader.next().unwrap().is_none());

        // With `all` it is restored from the header.
        let mut reader = open(package(&binary_header(), &cpio), true);
        reader.next().unwrap();
        reader.next().unwrap();
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/usr/link");
        assert_eq!(ent.index, 2);
        assert!(!ent.packaged);
        assert!(ent.is_symlink());
        assert_eq!((ent.ino, ent.nlink, ent.size), (0, 1, 0));
        assert!(reader.next().unwrap().is_none());

    }

    #[test]
    fn ghost_symlink_reports_target_length() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./b", 22, 0o100644, 0, 5, b"hello");
        trailer(&mut cpio);
        let mut reader = open(package(&extended_header(), &cpio), true);
        reader.next().unwrap();
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/a");
        assert!(!ent.packaged);
        let ent = reader.next().unwrap().unwrap();
        assert_eq!(ent.fname(), b"/c");
        assert!(ent.is_symlink());
        // Restored from the stored extended size.
        assert_eq!(ent.size, 9);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn bad_cpio_magic() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        cpio[0] = b'X';
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidMagic)));
    }

    #[test]
    fn bad_cpio_hex() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        cpio[6] = b'g';
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidHex)));
    }

    #[test]
    fn non_zero_checksum() {
        let mut cpio = Vec::new();
        record_fields(&mut cpio, "./usr/bin", [2, 0o40755, 0, 0, 2, 1000, 0, 0, 0, 0, 0, 10],
            b"00000001", b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::NonZeroChecksum)));
    }

    #[test]
    fn unknown_file() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./nope", 9, 0o100644, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::UnknownFile(f)) if f == "/nope"));
    }

    #[test]
    fn duplicate_file() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::DuplicateFile(_))));
    }

    #[test]
    fn mode_mismatch() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin/true", 3, 0o100644, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::ModeMismatch(_))));
    }

    #[test]
    fn bad_name_prefix() {
        let mut cpio = Vec::new();
        record(&mut cpio, "usr/bin", 2, 0o40755, 2, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::InvalidName(_))));
    }

    #[test]
    fn trailing_data_after_trailer() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        trailer(&mut cpio);
        cpio.extend_from_slice(b"XTRA");
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::TrailingData)));
    }

    #[test]
    fn truncated_archive() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        // No trailer: the compressed stream cleanly ends too early.
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap();
        assert!(matches!(reader.next(), Err(ReadError::UnexpectedEnd)));
    }

    #[test]
    fn zero_length_symlink() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 0, b"");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::ZeroSymlink(_))));
    }

    #[test]
    fn overlong_symlink() {
        let mut cpio = Vec::new();
        let target = vec![b'a'; 5000];
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 5000, &target);
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        assert!(matches!(reader.next(), Err(ReadError::SymlinkTooLong(_))));
    }

    #[test]
    fn symlink_embedded_nul() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b\0cd");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(reader.readlink(&mut buf), Err(ReadError::EmbeddedNul(_))));
    }

    #[test]
    fn readlink_usage() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);
        let mut reader = open(package(&binary_header(), &cpio), false);
        reader.next().unwrap();
        // Readlink on a regular file is a usage error.
        let mut buf = [0u8; 16];
        assert!(matches!(reader.readlink(&mut buf), Err(ReadError::NotSymlink)));
        reader.next().unwrap();
        // The buffer must have room for the terminator.
        assert!(matches!(reader.readlink(&mut [0u8; 7]), Err(ReadError::BufferTooSmall)));
        assert_eq!(reader.readlink(&mut buf).unwrap(), 7);
        // The target can only be read once.
        assert!(matches!(reader.readlink(&mut buf), Err(ReadError::NotSymlink)));
    }

    #[test]
    fn xz_payload() {
        let mut b = binary_header();
        b.string_tag(1125, "xz");
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);
        let mut data = b.build();
        let mut encoder = XzEncoder::new(&mut data, 6);
        encoder.write_all(&cpio).unwrap();
        encoder.finish().unwrap();
        let mut reader = PayloadReader::new(Cursor::new(data), false).unwrap();
        reader.next().unwrap();
        reader.next().unwrap();
        assert_eq!(read_all(&mut reader), b"ok");
        reader.next().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.readlink(&mut buf).unwrap(), 7);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn open_from_path() {
        let mut cpio = Vec::new();
        record(&mut cpio, "./usr/bin", 2, 0o40755, 2, 0, b"");
        record(&mut cpio, "./usr/bin/true", 3, 0o100755, 1, 2, b"ok");
        record(&mut cpio, "./usr/link", 4, 0o120777, 1, 7, b"/a/b/cd");
        trailer(&mut cpio);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello-1.0-1.x86_64.rpm");
        std::fs::write(&path, package(&binary_header(), &cpio)).unwrap();
        let mut reader = PayloadReader::open(&path, false).unwrap();
        let mut count = 0;
        while let Some(_ent) = reader.next().unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(PayloadReader::open(dir.path().join("absent.rpm"), false).is_err());
    }

}
