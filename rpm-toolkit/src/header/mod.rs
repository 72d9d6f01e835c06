//! RPM package header codec.
//!
//! A package file starts with a fixed 96-byte lead, followed by a signature
//! header and the main metadata header, both using the same tagged format:
//! a magic, a count of 16-byte index entries and the length of a packed data
//! store holding the tag values. The signature header is only validated and
//! skipped, while the main header is decoded in a single forward pass that
//! extracts exactly the tags needed to stream the cpio payload.
//!
//! Index entries are sorted by tag with increasing data offsets, so the
//! decoder merges the incoming entries against a static table of wanted tags
//! without buffering the whole index.

use std::cmp::Ordering;
use std::io::{self, Read};

use thiserror::Error;

use crate::util::io::RpmReadExt;


/// Magic of the package lead.
const LEAD_MAGIC: &[u8; 4] = b"\xED\xAB\xEE\xDB";

/// Magic of a header block, including the four reserved bytes.
const HEADER_MAGIC: &[u8; 8] = b"\x8E\xAD\xE8\x01\x00\x00\x00\x00";

/// File flag bit of %ghost files, which are listed in the header but have
/// no data in the cpio archive.
pub const FLAG_GHOST: u32 = 0x40;

// Wire types of the recognized tags.
const TYPE_INT16: u32 = 3;
const TYPE_INT32: u32 = 4;
const TYPE_INT64: u32 = 5;
const TYPE_STRING: u32 = 6;
const TYPE_STRING_ARRAY: u32 = 8;

// Indices into the static tag table below.
const OLDFILENAMES: usize = 0;
const FILESIZES: usize = 1;
const FILEMODES: usize = 2;
const FILEMTIMES: usize = 3;
const FILEFLAGS: usize = 4;
const FILEUSERNAME: usize = 5;
const FILEGROUPNAME: usize = 6;
const SOURCERPM: usize = 7;
const FILEDEVICES: usize = 8;
const FILEINODES: usize = 9;
const DIRINDEXES: usize = 10;
const BASENAMES: usize = 11;
const DIRNAMES: usize = 12;
const PAYLOADCOMPRESSOR: usize = 13;
const LONGFILESIZES: usize = 14;
const TAG_COUNT: usize = 15;

/// The tags of interest with their expected wire type, sorted by tag so that
/// a single pointer can advance over the table while the index entries
/// stream by.
const TAGS: [(u32, u32); TAG_COUNT] = [
    (1027, TYPE_STRING_ARRAY),  // oldfilenames
    (1028, TYPE_INT32),         // filesizes
    (1030, TYPE_INT16),         // filemodes
    (1034, TYPE_INT32),         // filemtimes
    (1037, TYPE_INT32),         // fileflags
    (1039, TYPE_STRING_ARRAY),  // fileusername
    (1040, TYPE_STRING_ARRAY),  // filegroupname
    (1044, TYPE_STRING),        // sourcerpm
    (1095, TYPE_INT32),         // filedevices
    (1096, TYPE_INT32),         // fileinodes
    (1116, TYPE_INT32),         // dirindexes
    (1117, TYPE_STRING_ARRAY),  // basenames
    (1118, TYPE_STRING_ARRAY),  // dirnames
    (1125, TYPE_STRING),        // payloadcompressor
    (5008, TYPE_INT64),         // longfilesizes
];

/// Assume each file takes at least 16 bytes in the data store. With the
/// 256 MiB limit on the store length, this means that only up to 16 Mi files
/// can be packaged. The check mostly avoids integer overflow on allocation.
const MAX_FILE_COUNT: u32 = 16 << 20;

const FILE_SEEN: u8 = 0x01;
const FILE_NONROOT_UID: u8 = 0x02;
const FILE_NONROOT_GID: u8 = 0x04;


/// The decoded package header: the filelist with per-file metadata needed to
/// validate the cpio archive, and the name of the payload compressor.
#[derive(Debug)]
pub struct Header {
    /// True for source packages (lead type 1, no sourcerpm tag). Their
    /// payload filenames are bare basenames.
    src_rpm: bool,
    /// True when the filelist came from the legacy oldfilenames tag, in
    /// which case basenames hold whole paths and dirnames are not split off.
    old_fnames: bool,
    /// Name of the payload compressor, "gzip" when the tag is absent.
    zprog: String,
    /// Per-file fixed records, sorted like the basenames tag.
    files: Vec<FileInfo>,
    /// Additional per-file records, only present with the longfilesizes tag.
    extra: Vec<FileExtra>,
    /// String table holding basenames, dirnames and old-style filenames.
    /// Offset zero is reserved for the empty string.
    strtab: Vec<u8>,
    /// Probe heuristic for [`Self::find()`], the index of the previously
    /// found file.
    prev_found: u32,
}

/// Basic per-file info, maps a filename to (mode, flags, ownership) plus a
/// duplicate detector.
#[derive(Debug)]
pub(crate) struct FileInfo {
    /// Basename offset into the string table.
    pub bn: u32,
    /// Dirname offset into the string table, zero when not split.
    pub dn: u32,
    pub blen: u16,
    pub dlen: u16,
    pub fflags: u32,
    pub mode: u16,
    /// Seen / non-root ownership bits.
    bits: u8,
}

/// Additional per-file info for packages with large files, whose cpio
/// records carry no usable stat fields.
#[derive(Debug)]
pub(crate) struct FileExtra {
    pub ino: u32,
    pub mtime: u32,
    /// Real file size, bounded to 48 bits. For symlinks this holds the
    /// length of the target.
    pub size: u64,
    pub nlink: u16,
}

impl FileInfo {

    #[inline]
    pub fn seen(&self) -> bool {
        self.bits & FILE_SEEN != 0
    }

    #[inline]
    pub fn mark_seen(&mut self) {
        self.bits |= FILE_SEEN;
    }

}

/// Mode bits classification, following the stat(2) file type nibble.
#[inline]
pub(crate) fn mode_is_reg(mode: u16) -> bool {
    mode & 0xF000 == 0x8000
}

#[inline]
pub(crate) fn mode_is_dir(mode: u16) -> bool {
    mode & 0xF000 == 0x4000
}

#[inline]
pub(crate) fn mode_is_lnk(mode: u16) -> bool {
    mode & 0xF000 == 0xA000
}


/// One collected tag of interest, filled by the merge scan. A present tag
/// has a non-zero count, and its value occupies `off..nextoff` in the data
/// store.
#[derive(Debug, Clone, Copy, Default)]
struct TagSpan {
    cnt: u32,
    off: u32,
    nextoff: u32,
}

impl TagSpan {

    #[inline]
    fn size(&self) -> usize {
        (self.nextoff - self.off) as usize
    }

}

impl Header {

    /// Decode the lead, the signature header and the main header from the
    /// given reader, leaving it positioned at the first byte of the
    /// compressed payload.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, HeaderError> {

        let src_rpm = read_lead(reader)?;

        // The signature header is bounded, skipped after validation, and
        // padded to an 8-byte boundary.
        let (il, dl) = read_block_prefix(reader)?;
        if il > 32 || dl > (64 << 10) {
            return Err(HeaderError::SignatureTooBig { il, dl });
        }
        let sig_size = 16 * il as u64 + (dl as u64 + 7 & !7);
        if sig_size != 0 {
            reader.skip_exact(sig_size)?;
        }

        let (il, dl) = read_block_prefix(reader)?;
        if il > (64 << 10) || dl > (256 << 20) {
            return Err(HeaderError::HeaderTooBig { il, dl });
        }

        // Merge the index entries against the static tag table. Tags are
        // strictly ascending; for the tags we collect, offsets must also be
        // strictly ascending (other tags have special cases that would
        // break the check). Each collected tag gets its end offset patched
        // from the next collected entry, or from the store length.
        let mut tab = [TagSpan::default(); TAG_COUNT];
        let mut ti = 0;
        let mut pending: Option<usize> = None;
        let mut last_tag = 0u32;
        let mut last_off = 0u32;

        for _ in 0..il {

            let tag = reader.read_u32()?;
            let ty = reader.read_u32()?;
            let off = reader.read_u32()?;
            let cnt = reader.read_u32()?;

            if tag <= last_tag {
                return Err(HeaderError::TagsOutOfOrder);
            }
            last_tag = tag;

            // Set the end offset of the previously collected entry.
            if let Some(p) = pending.take() {
                if tab[p].off >= off {
                    return Err(HeaderError::OffsetsOutOfOrder);
                }
                tab[p].nextoff = off;
                // Mark the last byte relevant for order checking.
                last_off = off - 1;
            }

            // Advance the static table pointer past smaller tags.
            while ti < TAG_COUNT && TAGS[ti].0 < tag {
                ti += 1;
            }
            if ti == TAG_COUNT || TAGS[ti].0 > tag {
                continue;
            }

            if last_off >= off {
                return Err(HeaderError::OffsetsOutOfOrder);
            }
            last_off = off;
            if cnt == 0 {
                return Err(HeaderError::ZeroTagCount(tag));
            }
            if ty != TAGS[ti].1 {
                return Err(HeaderError::InvalidTagType(tag));
            }

            tab[ti] = TagSpan { cnt, off, nextoff: 0 };
            pending = Some(ti);

        }

        if dl != 0 && last_off >= dl {
            return Err(HeaderError::OffsetsOutOfBounds);
        }
        if let Some(p) = pending.take() {
            tab[p].nextoff = dl;
        }

        // A source package has no sourcerpm tag, a binary package has one.
        if src_rpm == (tab[SOURCERPM].cnt != 0) {
            return Err(HeaderError::SourceRpmMismatch);
        }

        // Filemodes and fileflags are mandatory, and determine file count.
        if tab[FILEMODES].cnt != tab[FILEFLAGS].cnt {
            return Err(HeaderError::FileCountMismatch);
        }
        let file_count = tab[FILEMODES].cnt;

        let mut header = Self {
            src_rpm,
            old_fnames: tab[OLDFILENAMES].cnt != 0,
            zprog: String::new(),
            files: Vec::new(),
            extra: Vec::new(),
            strtab: Vec::new(),
            prev_found: u32::MAX,
        };

        // Current offset within the header's data store.
        let mut doff = 0u32;

        if file_count != 0 {
            header.load_files(reader, &tab, file_count, &mut doff)?;
        }

        // With no payloadcompressor tag the payload defaults to gzip.
        let span = &tab[PAYLOADCOMPRESSOR];
        if span.cnt != 0 {
            skip_to(reader, &mut doff, span.off)?;
            let size = span.size();
            if size > 14 {
                return Err(HeaderError::CompressorTooLong);
            }
            let mut buf = [0u8; 14];
            reader.read_exact(&mut buf[..size])?;
            doff += size as u32;
            if buf[size - 1] != 0 {
                return Err(HeaderError::UnterminatedString);
            }
            if buf[0] == 0 {
                return Err(HeaderError::EmptyCompressor);
            }
            let len = buf.iter().position(|&b| b == 0).unwrap();
            header.zprog = String::from_utf8_lossy(&buf[..len]).into_owned();
        } else {
            header.zprog = "gzip".to_string();
        }

        if file_count != 0 && header.has_extra() {
            let span = &tab[LONGFILESIZES];
            skip_to(reader, &mut doff, span.off)?;
            let mut scratch = Vec::new();
            take_array(reader, &mut doff, span, file_count as usize, 8, &mut scratch, "longfilesizes")?;
            for (i, raw) in scratch.chunks_exact(8).enumerate() {
                let size = u64::from_be_bytes(raw.try_into().unwrap());
                // 48 bits ought to be enough for anybody.
                if size > 0xFFFF_FFFF_FFFF {
                    return Err(HeaderError::InvalidTagData("longfilesizes"));
                }
                // For symlinks this stores the length of the target.
                header.extra[i].size = size;
            }
        }

        skip_to(reader, &mut doff, dl)?;

        Ok(header)

    }

    /// Load the per-file records by replaying the data store in tag order,
    /// which the merge scan proved equal to offset order.
    fn load_files<R: Read>(&mut self, reader: &mut R, tab: &[TagSpan; TAG_COUNT],
                           file_count: u32, doff: &mut u32) -> Result<(), HeaderError> {

        // With longfilesizes, mtimes and inodes are also loaded from the
        // header, because the cpio records of such packages carry no
        // usable stat fields.
        let long_sizes = tab[LONGFILESIZES].cnt != 0;
        if long_sizes {
            if tab[LONGFILESIZES].cnt != file_count || tab[FILESIZES].cnt != 0 {
                return Err(HeaderError::InvalidTagData("longfilesizes"));
            }
            if tab[FILEMTIMES].cnt != file_count {
                return Err(HeaderError::InvalidTagData("filemtimes"));
            }
        } else if tab[FILESIZES].cnt != file_count {
            return Err(HeaderError::InvalidTagData("filesizes"));
        }

        // Either oldfilenames, or basenames plus dirnames and dirindexes.
        let load_dirs;
        if tab[OLDFILENAMES].cnt != 0 {
            if tab[OLDFILENAMES].cnt != file_count || tab[BASENAMES].cnt != 0 {
                return Err(HeaderError::InvalidTagData("filenames"));
            }
            load_dirs = false;
        } else {
            if tab[BASENAMES].cnt != file_count {
                return Err(HeaderError::InvalidTagData("filenames"));
            }
            // Source packages keep bare basenames, without directories.
            load_dirs = !self.src_rpm;
            if load_dirs {
                if tab[DIRINDEXES].cnt != file_count {
                    return Err(HeaderError::InvalidTagData("dirindexes"));
                }
                // An oversized dirnames count could overflow the
                // allocation, and the package is corrupt anyway.
                if tab[DIRNAMES].cnt == 0 || tab[DIRNAMES].cnt > file_count {
                    return Err(HeaderError::InvalidTagData("dirnames"));
                }
            }
        }

        for idx in [FILEUSERNAME, FILEGROUPNAME] {
            if tab[idx].cnt != 0 && tab[idx].cnt != file_count {
                return Err(HeaderError::InvalidTagData("file ownership"));
            }
        }

        if file_count > MAX_FILE_COUNT {
            return Err(HeaderError::TooManyFiles(file_count));
        }
        let n = file_count as usize;

        // Reserve the string table in one go: all string tags land here,
        // with offset zero holding the reserved empty string.
        let mut str_size = 1;
        if tab[OLDFILENAMES].cnt != 0 {
            str_size += tab[OLDFILENAMES].size();
        }
        if tab[BASENAMES].cnt != 0 {
            str_size += tab[BASENAMES].size();
        }
        if load_dirs {
            str_size += tab[DIRNAMES].size();
        }
        self.strtab = Vec::with_capacity(str_size);
        self.strtab.push(0);

        // Temporary space for loading integer arrays.
        let mut scratch = Vec::new();

        let span = &tab[OLDFILENAMES];
        if span.cnt != 0 {
            skip_to(reader, doff, span.off)?;
            let (mut pos, end) = take_strings(reader, doff, span, &mut self.strtab)?;
            for _ in 0..n {
                let (off, len) = next_string(&self.strtab, &mut pos, end, "filenames")?;
                self.files.push(FileInfo {
                    bn: off,
                    dn: 0,
                    blen: len,
                    dlen: 0,
                    fflags: 0,
                    mode: 0,
                    bits: 0,
                });
            }
        }

        let span = &tab[FILEMODES];
        skip_to(reader, doff, span.off)?;
        take_array(reader, doff, span, n, 2, &mut scratch, "filemodes")?;
        if self.files.is_empty() {
            self.files.reserve_exact(n);
            for raw in scratch.chunks_exact(2) {
                self.files.push(FileInfo {
                    bn: 0,
                    dn: 0,
                    blen: 0,
                    dlen: 0,
                    fflags: 0,
                    mode: u16::from_be_bytes(raw.try_into().unwrap()),
                    bits: 0,
                });
            }
        } else {
            for (i, raw) in scratch.chunks_exact(2).enumerate() {
                self.files[i].mode = u16::from_be_bytes(raw.try_into().unwrap());
            }
        }

        if long_sizes {
            let span = &tab[FILEMTIMES];
            skip_to(reader, doff, span.off)?;
            take_array(reader, doff, span, n, 4, &mut scratch, "filemtimes")?;
            self.extra.reserve_exact(n);
            for raw in scratch.chunks_exact(4) {
                self.extra.push(FileExtra {
                    ino: 0,
                    mtime: u32::from_be_bytes(raw.try_into().unwrap()),
                    size: 0,
                    nlink: 1,
                });
            }
        }

        let span = &tab[FILEFLAGS];
        skip_to(reader, doff, span.off)?;
        take_array(reader, doff, span, n, 4, &mut scratch, "fileflags")?;
        for (i, raw) in scratch.chunks_exact(4).enumerate() {
            self.files[i].fflags = u32::from_be_bytes(raw.try_into().unwrap());
        }

        for (idx, bit) in [(FILEUSERNAME, FILE_NONROOT_UID), (FILEGROUPNAME, FILE_NONROOT_GID)] {
            let span = &tab[idx];
            if span.cnt == 0 {
                continue;
            }
            skip_to(reader, doff, span.off)?;
            // Only a root / non-root marker is retained, no consumer needs
            // the full user and group names.
            let size = span.size();
            scratch.clear();
            scratch.resize(size, 0);
            reader.read_exact(&mut scratch)?;
            *doff += size as u32;
            if scratch[size - 1] != 0 {
                return Err(HeaderError::UnterminatedString);
            }
            let mut pos = 0;
            for i in 0..n {
                let start = pos;
                pos += scratch[pos..].iter().position(|&b| b == 0)
                    .ok_or(HeaderError::InvalidTagData("file ownership"))? + 1;
                if &scratch[start..pos - 1] != b"root" {
                    self.files[i].bits |= bit;
                }
            }
        }

        if long_sizes {
            let span = &tab[FILEINODES];
            skip_to(reader, doff, span.off)?;
            take_array(reader, doff, span, n, 4, &mut scratch, "fileinodes")?;
            self.load_hardlinks(&scratch)?;
        }

        let span = &tab[DIRINDEXES];
        if load_dirs {
            skip_to(reader, doff, span.off)?;
            take_array(reader, doff, span, n, 4, &mut scratch, "dirindexes")?;
            for (i, raw) in scratch.chunks_exact(4).enumerate() {
                let dindex = u32::from_be_bytes(raw.try_into().unwrap());
                if dindex >= tab[DIRNAMES].cnt {
                    return Err(HeaderError::InvalidTagData("dirindexes"));
                }
                // Stash the raw index, rewritten to a string table offset
                // once dirnames are loaded.
                self.files[i].dn = dindex;
            }
        }

        let span = &tab[BASENAMES];
        if span.cnt != 0 {
            skip_to(reader, doff, span.off)?;
            let (mut pos, end) = take_strings(reader, doff, span, &mut self.strtab)?;
            for i in 0..n {
                let (off, len) = next_string(&self.strtab, &mut pos, end, "basenames")?;
                self.files[i].bn = off;
                self.files[i].blen = len;
            }
        }

        let span = &tab[DIRNAMES];
        if load_dirs {
            skip_to(reader, doff, span.off)?;
            let (mut pos, end) = take_strings(reader, doff, span, &mut self.strtab)?;
            let mut dirs = Vec::with_capacity(tab[DIRNAMES].cnt as usize);
            for _ in 0..tab[DIRNAMES].cnt {
                let (off, len) = next_string(&self.strtab, &mut pos, end, "dirnames")?;
                if self.strtab[off as usize] != b'/' {
                    return Err(HeaderError::InvalidTagData("dirnames"));
                }
                dirs.push((off, len));
            }
            // Replace the stashed indices with direct offsets.
            for fi in &mut self.files {
                let (off, len) = dirs[fi.dn as usize];
                fi.dn = off;
                fi.dlen = len;
            }
        }

        Ok(())

    }

    /// Detect hardlink sets from the fileinodes tag and update the per-file
    /// nlink counts. Only regular, non-ghost files take part: ghost files
    /// are not in the cpio archive and do not add to hardlink counts.
    fn load_hardlinks(&mut self, raw_inodes: &[u8]) -> Result<(), HeaderError> {

        // (ino, index) pairs of candidate files.
        let mut hi = Vec::with_capacity(self.files.len());

        // Modern rpm renumbers inodes, so when they come sorted without
        // duplicates the sort below can be skipped entirely.
        let mut sorted = true;
        let mut dup = false;
        let mut last_ino = 0u32;

        for (i, raw) in raw_inodes.chunks_exact(4).enumerate() {
            let ino = u32::from_be_bytes(raw.try_into().unwrap());
            self.extra[i].ino = ino;
            let fi = &self.files[i];
            if !mode_is_reg(fi.mode) || fi.fflags & FLAG_GHOST != 0 {
                continue;
            }
            if !hi.is_empty() {
                sorted &= last_ino <= ino;
                dup |= last_ino == ino;
            }
            last_ino = ino;
            hi.push((ino, i as u32));
        }

        if !sorted {
            // Regroup by inode; sorting the (ino, index) pairs keeps the
            // grouping stable. Assume there are now some equal inodes
            // rather than paying for another scan.
            hi.sort_unstable();
            dup = true;
        }

        if dup {
            let mut i = 0;
            while i + 1 < hi.len() {
                let ino = hi[i].0;
                if hi[i + 1].0 != ino {
                    i += 1;
                    continue;
                }
                let mut nlink = 2;
                while i + nlink < hi.len() && hi[i + nlink].0 == ino {
                    nlink += 1;
                }
                // E.g. ext4 has a 16-bit i_links_count.
                if nlink > 0xFFFF {
                    return Err(HeaderError::InvalidNlink);
                }
                for &(_, at) in &hi[i..i + nlink] {
                    self.extra[at as usize].nlink = nlink as u16;
                }
                i += nlink;
            }
        }

        Ok(())

    }

    /// Return the number of files recorded in the header filelist.
    #[inline]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Return true if this is a source package. Source packages have no
    /// sourcerpm tag and their payload filenames are bare basenames.
    #[inline]
    pub fn is_source(&self) -> bool {
        self.src_rpm
    }

    /// Return the name of the payload compressor, "gzip" if the package
    /// does not record one.
    #[inline]
    pub fn compressor(&self) -> &str {
        &self.zprog
    }

    /// Return whether the file at the given index is owned by the root
    /// user and the root group.
    pub fn file_root_owner(&self, index: usize) -> Option<(bool, bool)> {
        self.files.get(index).map(|fi| {
            (fi.bits & FILE_NONROOT_UID == 0, fi.bits & FILE_NONROOT_GID == 0)
        })
    }

    #[inline]
    pub(crate) fn has_extra(&self) -> bool {
        !self.extra.is_empty()
    }

    #[inline]
    pub(crate) fn file(&self, index: usize) -> &FileInfo {
        &self.files[index]
    }

    #[inline]
    pub(crate) fn file_mut(&mut self, index: usize) -> &mut FileInfo {
        &mut self.files[index]
    }

    #[inline]
    pub(crate) fn file_extra(&self, index: usize) -> Option<&FileExtra> {
        self.extra.get(index)
    }

    #[inline]
    fn str_at(&self, off: u32, len: u16) -> &[u8] {
        &self.strtab[off as usize..off as usize + len as usize]
    }

    /// Append the full name of the file at the given index: the dirname
    /// (when split) followed by the basename.
    pub(crate) fn copy_name(&self, index: usize, out: &mut Vec<u8>) {
        let fi = &self.files[index];
        out.extend_from_slice(self.str_at(fi.dn, fi.dlen));
        out.extend_from_slice(self.str_at(fi.bn, fi.blen));
    }

    /// Find a file in the header filelist by its absolute name (or bare
    /// basename for source packages), returning its index.
    ///
    /// The filelist is sorted by the format, and payload entries arrive in
    /// nearly the same order, so the binary search first probes the entry
    /// following the previously found one and expects an immediate hit.
    pub fn find(&mut self, fname: &[u8]) -> Option<usize> {

        if self.files.is_empty() {
            return None;
        }

        let count = self.files.len();
        let mut lo = 0usize;
        let mut hi = count;

        // Direct the first iteration at the element following the previous
        // hit rather than the middle element.
        self.prev_found = self.prev_found.wrapping_add(1);
        let mut at = self.prev_found as usize;
        if at >= count {
            at = (lo + hi) / 2;
        }

        // Without dirnames, run a much simplified version of the loop.
        if self.src_rpm || self.old_fnames {
            loop {
                let fi = &self.files[at];
                match fname.cmp(self.str_at(fi.bn, fi.blen)) {
                    Ordering::Equal => {
                        self.prev_found = at as u32;
                        return Some(at);
                    }
                    Ordering::Less => hi = at,
                    Ordering::Greater => lo = at + 1,
                }
                if lo >= hi {
                    return None;
                }
                at = (lo + hi) / 2;
            }
        }

        // Split the query at the last slash; dirnames keep their trailing
        // slash, so the dirname part includes it.
        let slash = fname.iter().rposition(|&b| b == b'/')?;
        let (dn, bn) = fname.split_at(slash + 1);

        // Previous file dirname against which dn was matched. Probes tend
        // to stay within one directory, so one memo cell saves most of the
        // dirname comparisons.
        let mut last_dn = u32::MAX;
        let mut dircmp = Ordering::Equal;

        loop {

            let fi = &self.files[at];
            let fi_dn = self.str_at(fi.dn, fi.dlen);
            let mut cmp;

            if dn.len() == fi.dlen as usize {
                if fi.dn != last_dn {
                    dircmp = dn.cmp(fi_dn);
                    last_dn = fi.dn;
                }
                cmp = dircmp;
                if cmp == Ordering::Equal {
                    // Equal dirnames is the only case where the basenames
                    // need to be compared.
                    cmp = bn.cmp(self.str_at(fi.bn, fi.blen));
                    if cmp == Ordering::Equal {
                        self.prev_found = at as u32;
                        return Some(at);
                    }
                }
            } else if dn.len() < fi.dlen as usize {
                // dn is shorter, so the outcome only depends on (dn, bn)
                // and the file's dirname, never on its basename. The memo
                // can therefore cache the full comparison.
                if fi.dn != last_dn {
                    dircmp = dn.cmp(&fi_dn[..dn.len()]);
                    if dircmp == Ordering::Equal {
                        dircmp = bn.cmp(&fi_dn[dn.len()..]);
                        // Equality cannot hold, even with dir and subdir
                        // pairs, because dirnames end with a slash.
                        if dircmp == Ordering::Equal {
                            return None;
                        }
                    }
                    last_dn = fi.dn;
                }
                cmp = dircmp;
            } else {
                if fi.dn != last_dn {
                    dircmp = fname[..fi.dlen as usize].cmp(fi_dn);
                    last_dn = fi.dn;
                }
                cmp = dircmp;
                if cmp == Ordering::Equal {
                    // dn is longer, compare the rest of it with the file's
                    // basename.
                    cmp = dn[fi.dlen as usize..].cmp(self.str_at(fi.bn, fi.blen));
                    if cmp == Ordering::Equal {
                        return None;
                    }
                }
            }

            match cmp {
                Ordering::Less => hi = at,
                _ => lo = at + 1,
            }
            if lo >= hi {
                return None;
            }
            at = (lo + hi) / 2;

        }

    }

}


/// Read and validate the 96-byte lead, returning whether the package is a
/// source package.
fn read_lead<R: Read>(reader: &mut R) -> Result<bool, HeaderError> {

    let mut lead = [0u8; 96];
    reader.read_exact(&mut lead)?;

    if &lead[0..4] != LEAD_MAGIC {
        return Err(HeaderError::InvalidLeadMagic);
    }

    // The file format version should be 3.0, but rpm once used to set the
    // major to 4 in conjunction with --nodirtokens. The minor is ignored.
    let major = lead[4];
    if !(3..=4).contains(&major) {
        return Err(HeaderError::UnsupportedLeadVersion(major));
    }

    let ty = u16::from_be_bytes([lead[6], lead[7]]);
    let src_rpm = match ty {
        0 => false,
        1 => true,
        _ => return Err(HeaderError::InvalidLeadType(ty)),
    };

    // Pre-historic signature layouts are not supported.
    let signature_type = u16::from_be_bytes([lead[78], lead[79]]);
    if signature_type != 5 {
        return Err(HeaderError::UnsupportedSignatureType(signature_type));
    }

    Ok(src_rpm)

}

/// Read the magic and the two lengths that prefix a header block.
fn read_block_prefix<R: Read>(reader: &mut R) -> Result<(u32, u32), HeaderError> {
    if !reader.check_exact(HEADER_MAGIC)? {
        return Err(HeaderError::InvalidHeaderMagic);
    }
    let il = reader.read_u32()?;
    let dl = reader.read_u32()?;
    Ok((il, dl))
}

/// Advance the data store cursor up to the given offset.
fn skip_to<R: Read>(reader: &mut R, doff: &mut u32, off: u32) -> Result<(), HeaderError> {
    debug_assert!(off >= *doff);
    let skip = off - *doff;
    if skip != 0 {
        reader.skip_exact(skip as u64)?;
        *doff += skip;
    }
    Ok(())
}

/// Load a whole integer array into the scratch buffer, checking that it
/// fits the tag's span in the data store.
fn take_array<R: Read>(reader: &mut R, doff: &mut u32, span: &TagSpan, count: usize,
                       elem_size: usize, scratch: &mut Vec<u8>,
                       what: &'static str) -> Result<(), HeaderError> {
    let bytes = count * elem_size;
    if span.size() < bytes {
        return Err(HeaderError::InvalidTagData(what));
    }
    scratch.clear();
    scratch.resize(bytes, 0);
    reader.read_exact(scratch)?;
    *doff += bytes as u32;
    Ok(())
}

/// Load a string array tag into the string table, returning the walking
/// range of the new segment. The segment must end with a terminator.
fn take_strings<R: Read>(reader: &mut R, doff: &mut u32, span: &TagSpan,
                         strtab: &mut Vec<u8>) -> Result<(usize, usize), HeaderError> {
    let size = span.size();
    let start = strtab.len();
    strtab.resize(start + size, 0);
    reader.read_exact(&mut strtab[start..])?;
    *doff += size as u32;
    if strtab[start + size - 1] != 0 {
        return Err(HeaderError::UnterminatedString);
    }
    Ok((start, start + size))
}

/// Walk the next null-terminated string of a loaded segment, returning its
/// string table offset and length.
fn next_string(strtab: &[u8], pos: &mut usize, end: usize,
               what: &'static str) -> Result<(u32, u16), HeaderError> {
    if *pos == end {
        return Err(HeaderError::InvalidTagData(what));
    }
    let len = strtab[*pos..end].iter().position(|&b| b == 0)
        .ok_or(HeaderError::UnterminatedString)?;
    if len > 0xFFFF {
        return Err(HeaderError::InvalidTagData(what));
    }
    let off = *pos as u32;
    *pos += len + 1;
    Ok((off, len as u16))
}


/// Errors that can happen while decoding a package header.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The file does not start with the package lead magic.
    #[error("bad lead magic")]
    InvalidLeadMagic,
    /// The lead carries a file format version other than 3 or 4.
    #[error("unsupported lead version {0}")]
    UnsupportedLeadVersion(u8),
    /// The lead type is neither binary nor source.
    #[error("bad lead type {0}")]
    InvalidLeadType(u16),
    /// Pre-historic signature layout, predating the header-style blocks.
    #[error("old lead signature type {0} not supported")]
    UnsupportedSignatureType(u16),
    /// A header block does not start with the header magic.
    #[error("bad header magic")]
    InvalidHeaderMagic,
    /// The signature header exceeds its size bounds.
    #[error("bad signature header size ({il} entries, {dl} bytes)")]
    SignatureTooBig { il: u32, dl: u32 },
    /// The main header exceeds its size bounds.
    #[error("bad header size ({il} entries, {dl} bytes)")]
    HeaderTooBig { il: u32, dl: u32 },
    /// Index entry tags are not strictly ascending.
    #[error("tags out of order")]
    TagsOutOfOrder,
    /// Data store offsets of collected tags are not strictly ascending.
    #[error("offsets out of order")]
    OffsetsOutOfOrder,
    /// A data store offset points past the end of the store.
    #[error("offsets out of bounds")]
    OffsetsOutOfBounds,
    /// A collected tag has a zero element count.
    #[error("zero count for tag {0}")]
    ZeroTagCount(u32),
    /// A collected tag has an unexpected wire type.
    #[error("bad type for tag {0}")]
    InvalidTagType(u32),
    /// The lead type and the presence of the sourcerpm tag disagree.
    #[error("lead type and sourcerpm tag do not match")]
    SourceRpmMismatch,
    /// The filemodes and fileflags counts disagree.
    #[error("file count mismatch")]
    FileCountMismatch,
    /// More files than the data store could possibly describe.
    #[error("bad file count {0}")]
    TooManyFiles(u32),
    /// A tag value is inconsistent with the rest of the header.
    #[error("bad {0}")]
    InvalidTagData(&'static str),
    /// A string tag is not null-terminated.
    #[error("malformed string tag")]
    UnterminatedString,
    /// The payloadcompressor string exceeds its fixed buffer.
    #[error("payloadcompressor too long")]
    CompressorTooLong,
    /// The payloadcompressor string is empty.
    #[error("empty payloadcompressor")]
    EmptyCompressor,
    /// A hardlink set is larger than any file system allows.
    #[error("bad nlink")]
    InvalidNlink,
    /// IO error while reading.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
