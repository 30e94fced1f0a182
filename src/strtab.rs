//! A bounds-checked view over a string table: the pool of nul-terminated
//! names referenced by nlist entries and load commands.

use scroll::{Pread, ctx};

use crate::error;

/// A string table view borrowed from the mapped LINKEDIT bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Strtab<'a> {
    bytes: &'a [u8],
}

impl<'a> Strtab<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Strtab { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The nul-terminated string starting at `offset`, or `None` when the
    /// offset is outside the table.
    pub fn get(&self, offset: usize) -> Option<error::Result<&'a str>> {
        if offset >= self.bytes.len() {
            return None;
        }
        Some(
            self.bytes
                .pread_with::<&str>(offset, ctx::StrCtx::Delimiter(0))
                .map_err(Into::into),
        )
    }

    /// Like [`get`](Self::get), but an out-of-table offset is a malformed
    /// image rather than a missing name.
    pub fn get_at(&self, offset: usize) -> error::Result<&'a str> {
        Ok(self
            .bytes
            .pread_with::<&str>(offset, ctx::StrCtx::Delimiter(0))?)
    }
}
