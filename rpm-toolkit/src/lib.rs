//! Toolkit for reading RPM package files.
//!
//! An RPM file is a fixed lead, a signature header, a metadata header and a
//! compressed cpio archive (the payload). This crate decodes the headers in a
//! single forward pass, extracting just the tags needed to stream the payload,
//! and then iterates over the archive entries while reconciling them against
//! the filelist recorded in the header.
//!
//! Signature blocks are accepted structurally but never verified.

pub mod util;

pub mod header;
pub mod payload;
