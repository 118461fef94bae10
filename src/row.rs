//! Typed column access over one DataRow.
//!
//! A [`RowReader`] is handed to a shaper closure once per row; the shaper
//! reads the columns in order and builds its own value. Columns are decoded
//! in place from the shared response snapshot, so shaping allocates only what
//! the shaper itself keeps.

use crate::error::{PgError, PgResult};
use crate::protocol::MessageReader;

/// Maps one row to a value. Shapers run once per DataRow and must consume
/// the row's columns in order.
pub type Shaper<T> = dyn Fn(&mut RowReader<'_, '_>) -> PgResult<T> + Send + Sync;

/// Cursor over the columns of one DataRow body.
///
/// Each column is framed as an i32 byte length followed by the value. Only
/// non-null columns are supported; a null column (length -1) is a protocol
/// error here.
pub struct RowReader<'r, 'a> {
    reader: &'r mut MessageReader<'a>,
}

impl<'r, 'a> RowReader<'r, 'a> {
    pub(crate) fn new(reader: &'r mut MessageReader<'a>) -> Self {
        Self { reader }
    }

    fn column_len(&mut self) -> PgResult<usize> {
        let len = self.reader.read_i32()?;
        if len < 0 {
            return Err(PgError::Protocol("unexpected null column".to_string()));
        }
        Ok(len as usize)
    }

    /// Read a binary-format int4 column.
    pub fn read_i32(&mut self) -> PgResult<i32> {
        let len = self.column_len()?;
        if len != 4 {
            return Err(PgError::Protocol(format!(
                "expected 4-byte int column, got {} bytes",
                len
            )));
        }
        self.reader.read_i32()
    }

    /// Read a text column as a borrowed string.
    pub fn read_str(&mut self) -> PgResult<&'a str> {
        let len = self.column_len()?;
        self.reader.read_str(len)
    }

    /// Read a column's raw bytes.
    pub fn read_bytes(&mut self) -> PgResult<&'a [u8]> {
        let len = self.column_len()?;
        self.reader.read_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_columns_in_order() {
        // int4 column (12), then text column ("hello")
        let mut body = Vec::new();
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(&12i32.to_be_bytes());
        body.extend_from_slice(&5i32.to_be_bytes());
        body.extend_from_slice(b"hello");

        let mut reader = MessageReader::new(&body);
        let mut row = RowReader::new(&mut reader);
        assert_eq!(row.read_i32().unwrap(), 12);
        assert_eq!(row.read_str().unwrap(), "hello");
    }

    #[test]
    fn null_column_is_a_protocol_error() {
        let body = (-1i32).to_be_bytes();
        let mut reader = MessageReader::new(&body);
        let mut row = RowReader::new(&mut reader);
        assert!(matches!(row.read_str(), Err(PgError::Protocol(_))));
    }

    #[test]
    fn wrong_width_int_is_a_protocol_error() {
        let mut body = Vec::new();
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&[0, 7]);

        let mut reader = MessageReader::new(&body);
        let mut row = RowReader::new(&mut reader);
        assert!(matches!(row.read_i32(), Err(PgError::Protocol(_))));
    }
}
