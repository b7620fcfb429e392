// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! XDR buffer management.
//!
//! This module provides [XdrBuf], the segmented buffer that RPC
//! call and reply bodies are marshalled into.  A buffer consists of
//! a head segment, a list of body pages, and a tail segment; the
//! security transforms operate on byte ranges that may span all
//! three.  All multi-byte integers on the RPC wire are big-endian.
//!
//! The buffer enforces a capacity bound (`buflen`), which includes
//! the slack reserved by the authentication flavor; exceeding it is
//! reported as an error rather than a panic, so the send path can
//! fail a single call instead of the process.
use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;

use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Size of a body page.
pub const PAGE_SIZE: usize = 4096;

/// Errors that can occur operating on an [XdrBuf].
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum XdrError {
    /// A byte range fell outside the live portion of the buffer.
    OutOfRange {
        /// Start of the requested range.
        offset: usize,
        /// Length of the requested range.
        len: usize,
        /// Live length of the buffer.
        buf_len: usize
    },
    /// An append would exceed the buffer's capacity bound.
    Overflow {
        /// Number of bytes requested.
        needed: usize,
        /// Capacity bound.
        buflen: usize
    }
}

/// A segmented RPC marshalling buffer.
///
/// The head segment holds the RPC header and small marshalled items;
/// bulk payload goes into pages; the tail holds trailing items such
/// as integrity checksums.  The live length of the buffer is the sum
/// of the three segment lengths.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XdrBuf {
    /// Head segment.
    head: Vec<u8>,
    /// Body pages.
    pages: Vec<Vec<u8>>,
    /// Tail segment.
    tail: Vec<u8>,
    /// Capacity bound, including reserved slack.
    buflen: usize
}

impl XdrBuf {
    /// Create an empty buffer with capacity bound `buflen`.
    #[inline]
    pub fn new(buflen: usize) -> Self {
        XdrBuf {
            head: Vec::new(),
            pages: Vec::new(),
            tail: Vec::new(),
            buflen: buflen
        }
    }

    /// Get the live length of the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.head.len() +
            self.pages.iter().map(|p| p.len()).sum::<usize>() +
            self.tail.len()
    }

    /// Check whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the capacity bound.
    #[inline]
    pub fn buflen(&self) -> usize {
        self.buflen
    }

    /// Get the head segment.
    #[inline]
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Get the body pages.
    #[inline]
    pub fn pages(&self) -> &[Vec<u8>] {
        &self.pages
    }

    /// Get the tail segment.
    #[inline]
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    #[inline]
    fn check_room(
        &self,
        nbytes: usize
    ) -> Result<(), XdrError> {
        let needed = self.len() + nbytes;

        if needed > self.buflen {
            Err(XdrError::Overflow {
                needed: needed,
                buflen: self.buflen
            })
        } else {
            Ok(())
        }
    }

    /// Append raw bytes to the head segment.
    pub fn append_head(
        &mut self,
        bytes: &[u8]
    ) -> Result<(), XdrError> {
        self.check_room(bytes.len())?;
        self.head.extend_from_slice(bytes);

        Ok(())
    }

    /// Append a big-endian `u32` to the head segment, returning the
    /// offset at which it was written.
    pub fn append_u32(
        &mut self,
        val: u32
    ) -> Result<usize, XdrError> {
        let offset = self.head.len();

        self.append_head(&val.to_be_bytes())?;

        Ok(offset)
    }

    /// Overwrite a big-endian `u32` previously appended to the head
    /// segment at `offset`.
    pub fn set_u32(
        &mut self,
        offset: usize,
        val: u32
    ) -> Result<(), XdrError> {
        if offset + 4 > self.head.len() {
            return Err(XdrError::OutOfRange {
                offset: offset,
                len: 4,
                buf_len: self.head.len()
            });
        }

        self.head[offset..offset + 4].copy_from_slice(&val.to_be_bytes());

        Ok(())
    }

    /// Append an XDR opaque (length, bytes, zero padding to a 4-byte
    /// boundary) to the end of the buffer.
    ///
    /// The opaque lands in the tail if any pages or tail bytes
    /// already exist, and in the head otherwise.
    pub fn append_opaque(
        &mut self,
        bytes: &[u8]
    ) -> Result<(), XdrError> {
        let pad = (4 - (bytes.len() & 3)) & 3;

        self.check_room(4 + bytes.len() + pad)?;

        let seg = if self.pages.is_empty() && self.tail.is_empty() {
            &mut self.head
        } else {
            &mut self.tail
        };

        seg.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        seg.extend_from_slice(bytes);
        seg.extend_from_slice(&[0; 4][..pad]);

        Ok(())
    }

    /// Append zero padding to the end of the buffer.
    pub fn append_pad(
        &mut self,
        pad: usize
    ) -> Result<(), XdrError> {
        self.check_room(pad)?;

        let seg = if self.pages.is_empty() && self.tail.is_empty() {
            &mut self.head
        } else {
            &mut self.tail
        };

        seg.resize(seg.len() + pad, 0);

        Ok(())
    }

    /// Append a body page.
    pub fn append_page(
        &mut self,
        page: Vec<u8>
    ) -> Result<(), XdrError> {
        self.check_room(page.len())?;
        self.pages.push(page);

        Ok(())
    }

    /// Replace the body pages, returning the old set.
    #[inline]
    pub fn swap_pages(
        &mut self,
        pages: Vec<Vec<u8>>
    ) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.pages, pages)
    }

    /// Move the tail into a page of its own at the end of the page
    /// list, leaving the tail empty.
    pub fn tail_to_page(&mut self) {
        if !self.tail.is_empty() {
            let tail = std::mem::take(&mut self.tail);

            self.pages.push(tail);
        }
    }

    /// Copy out the byte range `[offset, offset + len)`, linearized
    /// across segments.
    pub fn bytes_at(
        &self,
        offset: usize,
        len: usize
    ) -> Result<Vec<u8>, XdrError> {
        let total = self.len();

        if offset + len > total {
            return Err(XdrError::OutOfRange {
                offset: offset,
                len: len,
                buf_len: total
            });
        }

        let mut out = Vec::with_capacity(len);
        let mut skip = offset;
        let mut want = len;

        for seg in self.segments() {
            if want == 0 {
                break;
            }

            if skip >= seg.len() {
                skip -= seg.len();

                continue;
            }

            let avail = seg.len() - skip;
            let take = avail.min(want);

            out.extend_from_slice(&seg[skip..skip + take]);
            skip = 0;
            want -= take;
        }

        Ok(out)
    }

    /// Read a big-endian `u32` at `offset`.
    pub fn u32_at(
        &self,
        offset: usize
    ) -> Result<u32, XdrError> {
        let bytes = self.bytes_at(offset, 4)?;

        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an XDR opaque (length-prefixed bytes) at `offset`,
    /// returning the bytes and the total number of bytes consumed
    /// including the length word and padding.
    pub fn opaque_at(
        &self,
        offset: usize
    ) -> Result<(Vec<u8>, usize), XdrError> {
        let len = self.u32_at(offset)? as usize;
        let bytes = self.bytes_at(offset + 4, len)?;
        let pad = (4 - (len & 3)) & 3;

        Ok((bytes, 4 + len + pad))
    }

    /// Truncate the live length of the buffer to `newlen`.
    ///
    /// Bytes are removed from the tail first, then pages, then the
    /// head.
    pub fn truncate(
        &mut self,
        newlen: usize
    ) {
        let mut excess = self.len().saturating_sub(newlen);

        while excess > 0 && !self.tail.is_empty() {
            let cut = self.tail.len().min(excess);
            let keep = self.tail.len() - cut;

            self.tail.truncate(keep);
            excess -= cut;
        }

        while excess > 0 {
            match self.pages.last_mut() {
                Some(last) => {
                    let cut = last.len().min(excess);
                    let keep = last.len() - cut;

                    last.truncate(keep);
                    excess -= cut;

                    if last.is_empty() {
                        self.pages.pop();
                    }
                }
                None => break
            }
        }

        if excess > 0 {
            let keep = self.head.len() - excess;

            self.head.truncate(keep);
        }
    }

    /// Replace everything from `offset` onward with `bytes`.
    ///
    /// The replacement is linearized into the head segment; pages
    /// and tail are dropped.  This is how a security transform's
    /// output is spliced back into the buffer.
    pub fn replace_from(
        &mut self,
        offset: usize,
        bytes: &[u8]
    ) -> Result<(), XdrError> {
        if offset > self.head.len() {
            return Err(XdrError::OutOfRange {
                offset: offset,
                len: 0,
                buf_len: self.head.len()
            });
        }

        if offset + bytes.len() > self.buflen {
            return Err(XdrError::Overflow {
                needed: offset + bytes.len(),
                buflen: self.buflen
            });
        }

        self.head.truncate(offset);
        self.pages.clear();
        self.tail.clear();
        self.head.extend_from_slice(bytes);

        Ok(())
    }

    #[inline]
    fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        std::iter::once(self.head.as_slice())
            .chain(self.pages.iter().map(|p| p.as_slice()))
            .chain(std::iter::once(self.tail.as_slice()))
    }
}

impl ScopedError for XdrError {
    fn scope(&self) -> ErrorScope {
        match self {
            XdrError::OutOfRange { .. } => ErrorScope::Session,
            XdrError::Overflow { .. } => ErrorScope::Retryable
        }
    }
}

impl Display for XdrError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>
    ) -> Result<(), Error> {
        match self {
            XdrError::OutOfRange {
                offset,
                len,
                buf_len
            } => write!(
                f,
                "range {}..{} outside buffer of length {}",
                offset,
                offset + len,
                buf_len
            ),
            XdrError::Overflow { needed, buflen } => {
                write!(f, "need {} bytes, capacity is {}", needed, buflen)
            }
        }
    }
}

#[test]
fn test_append_and_read_u32() {
    let mut buf = XdrBuf::new(64);
    let offset = buf.append_u32(0xdeadbeef).unwrap();

    assert_eq!(offset, 0);
    assert_eq!(buf.u32_at(0).unwrap(), 0xdeadbeef);
    assert_eq!(buf.head(), &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_backfill_u32() {
    let mut buf = XdrBuf::new(64);
    let offset = buf.append_u32(0).unwrap();

    buf.append_u32(7).unwrap();
    buf.set_u32(offset, 0x01020304).unwrap();

    assert_eq!(buf.u32_at(offset).unwrap(), 0x01020304);
    assert_eq!(buf.u32_at(offset + 4).unwrap(), 7);
}

#[test]
fn test_opaque_pads_to_quad() {
    let mut buf = XdrBuf::new(64);

    buf.append_opaque(&[0xaa, 0xbb]).unwrap();

    assert_eq!(buf.head(), &[0, 0, 0, 2, 0xaa, 0xbb, 0, 0]);

    let (bytes, consumed) = buf.opaque_at(0).unwrap();

    assert_eq!(bytes, vec![0xaa, 0xbb]);
    assert_eq!(consumed, 8);
}

#[test]
fn test_bytes_at_spans_segments() {
    let mut buf = XdrBuf::new(64);

    buf.append_head(&[1, 2, 3]).unwrap();
    buf.append_page(vec![4, 5]).unwrap();
    buf.append_page(vec![6]).unwrap();
    buf.tail.extend_from_slice(&[7, 8]);

    assert_eq!(buf.len(), 8);
    assert_eq!(buf.bytes_at(2, 5).unwrap(), vec![3, 4, 5, 6, 7]);
}

#[test]
fn test_bytes_at_out_of_range() {
    let buf = XdrBuf::new(16);

    assert!(buf.bytes_at(0, 1).is_err());
}

#[test]
fn test_overflow_checked() {
    let mut buf = XdrBuf::new(4);

    buf.append_u32(1).unwrap();

    assert!(buf.append_u32(2).is_err());
}

#[test]
fn test_truncate_across_segments() {
    let mut buf = XdrBuf::new(64);

    buf.append_head(&[1, 2, 3]).unwrap();
    buf.append_page(vec![4, 5]).unwrap();
    buf.tail.extend_from_slice(&[6, 7]);
    buf.truncate(4);

    assert_eq!(buf.len(), 4);
    assert_eq!(buf.bytes_at(0, 4).unwrap(), vec![1, 2, 3, 4]);
    assert!(buf.tail().is_empty());
}

#[test]
fn test_replace_from_collapses() {
    let mut buf = XdrBuf::new(64);

    buf.append_head(&[1, 2, 3, 4]).unwrap();
    buf.append_page(vec![5, 6]).unwrap();
    buf.replace_from(2, &[9, 9, 9]).unwrap();

    assert_eq!(buf.len(), 5);
    assert_eq!(buf.bytes_at(0, 5).unwrap(), vec![1, 2, 9, 9, 9]);
    assert!(buf.pages().is_empty());
}

#[test]
fn test_tail_to_page() {
    let mut buf = XdrBuf::new(64);

    buf.append_head(&[1]).unwrap();
    buf.tail.extend_from_slice(&[2, 3]);
    buf.tail_to_page();

    assert!(buf.tail().is_empty());
    assert_eq!(buf.pages(), &[vec![2, 3]]);
    assert_eq!(buf.bytes_at(0, 3).unwrap(), vec![1, 2, 3]);
}
