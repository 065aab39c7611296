use super::{Error, ErrorDetails, Result};
use std::convert::TryInto;

/// Simple reader state for extracting data from a [`&[u8]`] slice.
///
/// Unlike the [`std::io::Read`] implementation for [`&[u8]`], this keeps track of the location
/// within the packet for more informative errors via [`Result`].
///
/// # Example
///
/// ```
/// use dvbsi_io::SliceReader;
/// let some_data = [0x42];
/// let mut reader = SliceReader::new(&some_data);
/// assert_eq!(reader.read_u8()?, 0x42);
/// # Ok::<(), dvbsi_io::Error>(())
/// ```
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
    location: usize,
}

impl<'a> SliceReader<'a> {
    /// Initializes a reader from any byte slice.
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, location: 0 }
    }

    /// Creates a fixed `length` sub-reader at the current position, then advances this reader to
    /// the sub-reader's end position.
    ///
    /// The sub-reader semantic makes reading nested data of known lengths easier with correct
    /// bounds checking of the nested data.
    pub fn new_sub_reader(&mut self, length: usize) -> Result<Self> {
        let location = self.location;
        Ok(Self {
            slice: self.read(length)?,
            location,
        })
    }

    /// Creates an [`Error`] using the contained location.
    pub fn make_error(&self, details: ErrorDetails) -> Error {
        Error {
            location: self.location,
            details,
        }
    }

    /// Number of bytes remaining in the slice reader.
    pub fn remaining_len(&self) -> usize {
        self.slice.len()
    }

    /// Advance reader without extracting any data from the slice.
    pub fn skip(&mut self, length: usize) -> Result<()> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            self.location += length;
            self.slice = &self.slice[length..];
            Ok(())
        }
    }

    /// Extract a fixed `length` sub-slice from this reader and advance.
    pub fn read(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            self.location += length;
            let (left, right) = self.slice.split_at(length);
            self.slice = right;
            Ok(left)
        }
    }

    /// Extract a sub-slice of all data remaining to be read.
    pub fn read_to_end(&mut self) -> Result<&'a [u8]> {
        self.read(self.slice.len())
    }

    /// Same as [`SliceReader::read`] but also converts the slice to an array reference of length
    /// `N`.
    pub fn read_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        let slice = self.read(N)?;
        // Length is guaranteed by read()
        match slice.try_into() {
            Ok(array) => Ok(array),
            Err(_) => Err(self.make_error(ErrorDetails::PacketOverrun(N))),
        }
    }

    /// Read one byte interpreted as [`u8`].
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array_ref::<1>()?[0])
    }

    /// Read two bytes interpreted as big-endian [`u16`].
    pub fn read_be_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(*self.read_array_ref::<2>()?))
    }

    /// Read three bytes interpreted as big-endian `u24`.
    pub fn read_be_u24(&mut self) -> Result<u32> {
        let bytes = *self.read_array_ref::<3>()?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Read four bytes interpreted as big-endian [`u32`].
    pub fn read_be_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(*self.read_array_ref::<4>()?))
    }

    /// Extract a fixed `length` sub-slice from this reader without advancing.
    pub fn peek(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            Err(self.make_error(ErrorDetails::PacketOverrun(length)))
        } else {
            Ok(&self.slice[0..length])
        }
    }

    /// Same as [`SliceReader::peek`] but also converts the slice to an array reference of length
    /// `N`.
    pub fn peek_array_ref<const N: usize>(&mut self) -> Result<&'a [u8; N]> {
        let slice = self.peek(N)?;
        match slice.try_into() {
            Ok(array) => Ok(array),
            Err(_) => Err(self.make_error(ErrorDetails::PacketOverrun(N))),
        }
    }
}

/// Convenience macro to read a modular bitfield from a [`SliceReader`]
///
/// Wraps [`SliceReader::read_array_ref`] to read the exact number of bytes required by the
/// bitfield type. Must be expanded in a function that returns [`Result`].
///
/// # Example
///
/// ```
/// use modular_bitfield_msb::prelude::*;
/// use dvbsi_io::{read_bitfield, SliceReader};
/// #[bitfield]
/// pub(crate) struct MyBitfield {
///     pub a_bit: B1,
///     #[skip]
///     padding: B7,
/// }
///
/// let some_data = [0x80];
/// let mut reader = SliceReader::new(&some_data);
/// let the_bitfield = read_bitfield!(reader, MyBitfield);
/// assert_eq!(the_bitfield.a_bit(), 1);
/// # Ok::<(), dvbsi_io::Error>(())
/// ```
#[macro_export]
macro_rules! read_bitfield {
    ($reader:expr, $type:ty) => {
        <$type>::from_bytes(*$reader.read_array_ref::<{ std::mem::size_of::<$type>() }>()?)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_reader_bounds() {
        let data = [1_u8, 2, 3, 4];
        let mut reader = SliceReader::new(&data);
        let mut sub = reader.new_sub_reader(2).unwrap();
        assert_eq!(sub.read_be_u16().unwrap(), 0x0102);
        assert!(sub.read_u8().is_err());
        assert_eq!(reader.read_be_u16().unwrap(), 0x0304);
    }

    #[test]
    fn overrun_reports_location() {
        let data = [1_u8, 2];
        let mut reader = SliceReader::new(&data);
        reader.skip(1).unwrap();
        let err = reader.read(4).unwrap_err();
        assert_eq!(err.location, 1);
        assert_eq!(err.details, ErrorDetails::PacketOverrun(4));
    }
}
