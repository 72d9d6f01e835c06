//! This module provides an extension trait for [`Read`] supporting the
//! big-endian integer formats used within RPM headers.

use std::io::{self, Read};

use byteorder::{ReadBytesExt, BE};


/// An extension to the [`Read`] trait specifically used to decode RPM
/// header structures, where every multi-byte integer is big-endian.
pub trait RpmReadExt: Read {

    /// Reads an unsigned 16 bit big-endian integer from the underlying reader.
    #[inline]
    fn read_u16(&mut self) -> io::Result<u16> {
        ReadBytesExt::read_u16::<BE>(self)
    }

    /// Reads an unsigned 32 bit big-endian integer from the underlying reader.
    #[inline]
    fn read_u32(&mut self) -> io::Result<u32> {
        ReadBytesExt::read_u32::<BE>(self)
    }

    /// Reads an unsigned 64 bit big-endian integer from the underlying reader.
    #[inline]
    fn read_u64(&mut self) -> io::Result<u64> {
        ReadBytesExt::read_u64::<BE>(self)
    }

    /// Check that the next `N` bytes are the exact same as the given array.
    #[inline]
    fn check_exact<const N: usize>(&mut self, bytes: &[u8; N]) -> io::Result<bool> {
        let mut buf = [0; N];
        self.read_exact(&mut buf[..])?;
        Ok(&buf == bytes)
    }

    /// Skip exactly the given number of bytes by reading them into a
    /// scratch sink, erroring out with [`io::ErrorKind::UnexpectedEof`] if
    /// the underlying reader is shorter.
    fn skip_exact(&mut self, mut len: u64) -> io::Result<()> {
        let mut scratch = [0u8; 1024];
        while len > 0 {
            let chunk = len.min(scratch.len() as u64) as usize;
            self.read_exact(&mut scratch[..chunk])?;
            len -= chunk as u64;
        }
        Ok(())
    }

}

impl<R: Read> RpmReadExt for R {}
