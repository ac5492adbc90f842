//! Text Matrix Reader and Vector Writer
//!
//! Reads the matrix literal the benchmark binary consumes and writes the
//! row sums back in the same notation:
//!
//! ```text
//! -- two rows of three
//! [[1i32, 2i32, 3i32],
//!  [4, 5, 6]]
//!
//! empty([4][0]i32)
//! ```
//!
//! Integers may carry an `i32` suffix, `--` starts a comment running to the
//! end of the line, and whitespace is free. Zero-size matrices are written
//! `empty([N][M]i32)` with at least one of `N`, `M` zero.
//!
//! Large inputs are usually binary. [`read_matrix`] recognizes them by a
//! leading `b` and expects, in order:
//!
//! | bytes | content                                  |
//! |-------|------------------------------------------|
//! | 1     | `b`                                      |
//! | 1     | format version, [`BINARY_VERSION`]       |
//! | 1     | number of dimensions, 2                  |
//! | 4     | element type tag `" i32"`                |
//! | 8 × 2 | rows, columns (little-endian `u64`)      |
//! | 4 × n | elements, row-major (little-endian `i32`) |

use crate::error::{Result, SegsumError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::io::{Cursor, Read, Write};

/// Version of the binary matrix format this reader understands.
pub const BINARY_VERSION: u8 = 1;

const BINARY_MARKER: u8 = b'b';
const I32_TAG: &[u8; 4] = b" i32";

/// Parse a matrix literal.
pub fn parse_matrix(text: &str) -> Result<Array2<i32>> {
    let mut parser = Parser::new(text);
    let matrix = parser.matrix()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected input after the matrix"));
    }
    Ok(matrix)
}

/// Read a matrix from `reader`, binary or text depending on its first
/// significant byte.
pub fn read_matrix<R: Read>(mut reader: R) -> Result<Array2<i32>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    if bytes.get(start) == Some(&BINARY_MARKER) {
        return decode_binary_matrix(&bytes[start..]);
    }
    let text = std::str::from_utf8(&bytes).map_err(|e| SegsumError::Parse {
        line: 1 + bytes[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count(),
        message: "input is neither a matrix literal nor binary".to_string(),
    })?;
    parse_matrix(text)
}

fn binary_error(cursor: &Cursor<&[u8]>, message: impl Into<String>) -> SegsumError {
    SegsumError::Binary {
        offset: cursor.position() as usize,
        message: message.into(),
    }
}

/// Decode a binary matrix, starting at its `b` marker.
pub fn decode_binary_matrix(bytes: &[u8]) -> Result<Array2<i32>> {
    let mut cursor = Cursor::new(bytes);

    let marker = cursor.read_u8().map_err(|_| binary_error(&cursor, "empty input"))?;
    if marker != BINARY_MARKER {
        return Err(binary_error(&cursor, format!("expected marker 'b', found {marker:#04x}")));
    }
    let version = cursor.read_u8().map_err(|_| binary_error(&cursor, "could not read version"))?;
    if version != BINARY_VERSION {
        return Err(binary_error(
            &cursor,
            format!("file uses version {version}, but only version {BINARY_VERSION} is understood"),
        ));
    }
    let dims = cursor.read_u8().map_err(|_| binary_error(&cursor, "could not read dimension count"))?;
    if dims != 2 {
        return Err(binary_error(&cursor, format!("expected 2 dimensions, got {dims}")));
    }
    let mut tag = [0u8; 4];
    cursor
        .read_exact(&mut tag)
        .map_err(|_| binary_error(&cursor, "could not read element type"))?;
    if &tag != I32_TAG {
        return Err(binary_error(
            &cursor,
            format!("expected element type 'i32', got '{}'", String::from_utf8_lossy(&tag).trim()),
        ));
    }

    let mut shape = [0usize; 2];
    for (i, dim) in shape.iter_mut().enumerate() {
        let size = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| binary_error(&cursor, format!("could not read size of dimension {i}")))?;
        *dim = usize::try_from(size).map_err(|_| binary_error(&cursor, format!("dimension {i} too large: {size}")))?;
    }
    let [rows, cols] = shape;
    let count = rows
        .checked_mul(cols)
        .ok_or_else(|| binary_error(&cursor, format!("{rows}x{cols} elements overflow")))?;

    let available = (bytes.len() - cursor.position() as usize) / std::mem::size_of::<i32>();
    if available < count {
        return Err(binary_error(
            &cursor,
            format!("expected {count} elements, but only {available} are present"),
        ));
    }
    let mut data = vec![0i32; count];
    cursor.read_i32_into::<LittleEndian>(&mut data)?;

    let rest = &bytes[cursor.position() as usize..];
    if rest.iter().any(|b| !b.is_ascii_whitespace()) {
        return Err(binary_error(&cursor, "unexpected bytes after the matrix"));
    }

    Array2::from_shape_vec((rows, cols), data).map_err(|e| SegsumError::Shape {
        expected: format!("{rows}x{cols}"),
        actual: e.to_string(),
    })
}

/// Write `matrix` in the binary format [`read_matrix`] accepts.
pub fn write_binary_matrix<W: Write>(mut writer: W, matrix: ArrayView2<i32>) -> Result<()> {
    writer.write_u8(BINARY_MARKER)?;
    writer.write_u8(BINARY_VERSION)?;
    writer.write_u8(2)?;
    writer.write_all(I32_TAG)?;
    writer.write_u64::<LittleEndian>(matrix.nrows() as u64)?;
    writer.write_u64::<LittleEndian>(matrix.ncols() as u64)?;
    for &value in matrix.iter() {
        writer.write_i32::<LittleEndian>(value)?;
    }
    Ok(())
}

/// Render a vector as `[a, b, c]` with `i32` suffixes.
pub fn format_vector(values: ArrayView1<i32>) -> String {
    if values.is_empty() {
        return "empty([0]i32)".to_string();
    }
    let items: Vec<String> = values.iter().map(|v| format!("{v}i32")).collect();
    format!("[{}]", items.join(", "))
}

/// Write [`format_vector`] followed by a newline.
pub fn write_vector<W: Write>(mut writer: W, values: ArrayView1<i32>) -> Result<()> {
    writeln!(writer, "{}", format_vector(values))?;
    Ok(())
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> SegsumError {
        SegsumError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.src.get(self.pos) {
            if c == b'\n' {
                self.line += 1;
                self.pos += 1;
            } else if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if self.src[self.pos..].starts_with(b"--") {
                while self.src.get(self.pos).is_some_and(|&c| c != b'\n') {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Next significant byte, without consuming it.
    fn peek(&mut self) -> Option<u8> {
        self.skip_trivia();
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected as char, c as char))),
            None => Err(self.error(format!("expected '{}', found end of input", expected as char))),
        }
    }

    fn keyword(&mut self, word: &str) -> Result<()> {
        self.skip_trivia();
        if self.src[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(())
        } else {
            Err(self.error(format!("expected '{word}'")))
        }
    }

    fn integer(&mut self) -> Result<i64> {
        self.skip_trivia();
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.src.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        let value = digits
            .parse::<i64>()
            .map_err(|_| self.error(format!("invalid integer '{digits}'")))?;
        if self.src[self.pos..].starts_with(b"i32") {
            self.pos += 3;
        }
        Ok(value)
    }

    fn element(&mut self) -> Result<i32> {
        let value = self.integer()?;
        i32::try_from(value).map_err(|_| self.error(format!("{value} does not fit in i32")))
    }

    fn dimension(&mut self) -> Result<usize> {
        self.expect(b'[')?;
        let value = self.integer()?;
        self.expect(b']')?;
        usize::try_from(value).map_err(|_| self.error(format!("negative dimension {value}")))
    }

    /// Comma-separated items up to the closing bracket; the opening one is
    /// already consumed.
    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn matrix(&mut self) -> Result<Array2<i32>> {
        match self.peek() {
            Some(b'[') => {
                self.pos += 1;
                let rows = self.list(|p| {
                    p.expect(b'[')?;
                    p.list(Self::element)
                })?;
                let cols = rows.first().map_or(0, Vec::len);
                if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != cols) {
                    return Err(SegsumError::Shape {
                        expected: format!("{cols} columns in every row"),
                        actual: format!("{} columns in row {i}", row.len()),
                    });
                }
                let n = rows.len();
                let flat: Vec<i32> = rows.into_iter().flatten().collect();
                Array2::from_shape_vec((n, cols), flat).map_err(|e| SegsumError::Shape {
                    expected: format!("{n}x{cols}"),
                    actual: e.to_string(),
                })
            }
            Some(b'e') => {
                self.keyword("empty")?;
                self.expect(b'(')?;
                let n = self.dimension()?;
                let m = self.dimension()?;
                self.keyword("i32")?;
                self.expect(b')')?;
                if n != 0 && m != 0 {
                    return Err(self.error(format!("empty array cannot have shape [{n}][{m}]")));
                }
                Ok(Array2::zeros((n, m)))
            }
            _ => Err(self.error("expected a matrix literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_matrix() {
        let m = parse_matrix("[[1, 2, 3], [4, 5, 6]]").unwrap();
        assert_eq!(m, array![[1, 2, 3], [4, 5, 6]]);
    }

    #[test]
    fn test_suffixes_comments_and_negatives() {
        let text = "-- input\n[[1i32, -2i32],\n -- second row\n [ -3 , 4i32 ]]\n";
        let m = parse_matrix(text).unwrap();
        assert_eq!(m, array![[1, -2], [-3, 4]]);
    }

    #[test]
    fn test_empty_shapes() {
        assert_eq!(parse_matrix("empty([4][0]i32)").unwrap().dim(), (4, 0));
        assert_eq!(parse_matrix("empty([0][7]i32)").unwrap().dim(), (0, 7));
        assert_eq!(parse_matrix("[]").unwrap().dim(), (0, 0));
        assert_eq!(parse_matrix("[[], []]").unwrap().dim(), (2, 0));
    }

    #[test]
    fn test_ragged_rows() {
        let err = parse_matrix("[[1, 2], [3]]").unwrap_err();
        assert!(matches!(err, SegsumError::Shape { .. }));
    }

    #[test]
    fn test_parse_errors_report_line() {
        match parse_matrix("[[1, 2],\n [3, x]]").unwrap_err() {
            SegsumError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(parse_matrix("[[1]] trailing").is_err());
        assert!(parse_matrix("[[3000000000]]").is_err());
        assert!(parse_matrix("empty([2][3]i32)").is_err());
    }

    #[test]
    fn test_format_vector() {
        assert_eq!(format_vector(array![6, -15].view()), "[6i32, -15i32]");
        assert_eq!(format_vector(ndarray::Array1::<i32>::zeros(0).view()), "empty([0]i32)");
    }

    #[test]
    fn test_read_and_write() {
        let m = read_matrix("[[5]]".as_bytes()).unwrap();
        let mut out = Vec::new();
        write_vector(&mut out, m.row(0)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[5i32]\n");
    }

    fn binary(matrix: ArrayView2<i32>) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_binary_matrix(&mut bytes, matrix).unwrap();
        bytes
    }

    #[test]
    fn test_binary_layout() {
        let bytes = binary(array![[1, -2]].view());
        assert_eq!(&bytes[..7], b"b\x01\x02 i32");
        assert_eq!(&bytes[7..15], &1u64.to_le_bytes());
        assert_eq!(&bytes[15..23], &2u64.to_le_bytes());
        assert_eq!(&bytes[23..], &[1, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_binary_round_trip() {
        let m = Array2::from_shape_fn((5, 7), |(r, c)| (r as i32 - 2) * 1_000_003 + c as i32);
        let bytes = binary(m.view());
        assert_eq!(read_matrix(bytes.as_slice()).unwrap(), m);

        let mut padded = b"\n  ".to_vec();
        padded.extend_from_slice(&bytes);
        padded.push(b'\n');
        assert_eq!(read_matrix(padded.as_slice()).unwrap(), m);

        let empty = Array2::<i32>::zeros((4, 0));
        assert_eq!(read_matrix(binary(empty.view()).as_slice()).unwrap().dim(), (4, 0));
    }

    #[test]
    fn test_binary_version_mismatch() {
        let mut bytes = binary(array![[1]].view());
        bytes[1] = 2;
        match read_matrix(bytes.as_slice()).unwrap_err() {
            SegsumError::Binary { message, .. } => assert!(message.contains("version 2")),
            other => panic!("expected binary error, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_header_errors() {
        let good = binary(array![[1, 2], [3, 4]].view());

        let mut wrong_type = good.clone();
        wrong_type[3..7].copy_from_slice(b" f32");
        assert!(matches!(read_matrix(wrong_type.as_slice()), Err(SegsumError::Binary { .. })));

        let mut wrong_rank = good.clone();
        wrong_rank[2] = 1;
        assert!(matches!(read_matrix(wrong_rank.as_slice()), Err(SegsumError::Binary { .. })));

        let truncated = &good[..good.len() - 1];
        match read_matrix(truncated).unwrap_err() {
            SegsumError::Binary { message, .. } => assert!(message.contains("only 3")),
            other => panic!("expected binary error, got {other:?}"),
        }

        assert!(read_matrix(&b"b"[..]).is_err());
    }
}
