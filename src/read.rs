use core::result;

use crate::error::Error;

/// The result type used for structural reads.
pub type Result<T> = result::Result<T, Error>;

pub(crate) trait ReadError<T> {
    fn read_error(self, error: &'static str) -> Result<T>;
}

impl<T> ReadError<T> for result::Result<T, ()> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.map_err(|()| Error::Generic(error))
    }
}

impl<T> ReadError<T> for Option<T> {
    fn read_error(self, error: &'static str) -> Result<T> {
        self.ok_or(Error::Generic(error))
    }
}

/// Round `value` up to the next multiple of `alignment`, which must be a power of two.
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns the bytes of `data` up to (not including) the first byte for which
/// `is_terminator` holds, or all of `data` if there is none.
pub(crate) fn until<'data>(data: &'data [u8], is_terminator: impl Fn(u8) -> bool) -> &'data [u8] {
    let len = data
        .iter()
        .position(|&b| is_terminator(b))
        .unwrap_or(data.len());
    &data[..len]
}
