//! ONNX container inspection without an inference runtime.
//!
//! An ONNX file is a protobuf `ModelProto`. Walking its wire format is enough
//! to tell a real model from a truncated download, an HTML error page or a
//! Git LFS pointer, and to pull individual initializers (the swapper's
//! embedding map) out of the graph.

use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;

// ModelProto fields.
const MODEL_IR_VERSION: u64 = 1;
const MODEL_PRODUCER_NAME: u64 = 2;
const MODEL_GRAPH: u64 = 7;
const MODEL_OPSET_IMPORT: u64 = 8;
// GraphProto fields.
const GRAPH_INITIALIZER: u64 = 5;
// TensorProto fields.
const TENSOR_DIMS: u64 = 1;
const TENSOR_DATA_TYPE: u64 = 2;
const TENSOR_FLOAT_DATA: u64 = 4;
const TENSOR_INT32_DATA: u64 = 5;
const TENSOR_NAME: u64 = 8;
const TENSOR_RAW_DATA: u64 = 9;
const TENSOR_TYPE_FLOAT: u64 = 1;
const TENSOR_TYPE_FLOAT16: u64 = 10;

const MAX_PRODUCER_LEN: u64 = 256;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("truncated at byte {offset}: {what}")]
    Truncated { offset: u64, what: &'static str },
    #[error("malformed protobuf at byte {offset}: {what}")]
    Malformed { offset: u64, what: String },
    #[error("required ModelProto field missing: {0}")]
    MissingField(&'static str),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Top-level facts about a structurally valid model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub ir_version: u64,
    pub graph_bytes: u64,
    pub opset_imports: usize,
    pub producer: Option<String>,
}

/// Walk every top-level `ModelProto` field of a `len`-byte stream.
///
/// Length-delimited payloads are skipped by seeking, so memory use does not
/// depend on model size. The walk must end exactly at `len`.
pub fn inspect<R: Read + Seek>(reader: &mut R, len: u64) -> Result<ModelSummary, OnnxError> {
    let mut pos = 0u64;
    let mut ir_version = None;
    let mut graph_bytes = None;
    let mut opset_imports = 0usize;
    let mut producer = None;

    while pos < len {
        let tag_at = pos;
        let tag = read_varint_stream(reader, &mut pos, len)?;
        let field = tag >> 3;
        if field == 0 {
            return Err(malformed(tag_at, "field number 0"));
        }

        match tag & 7 {
            0 => {
                let value = read_varint_stream(reader, &mut pos, len)?;
                if field == MODEL_IR_VERSION {
                    ir_version = Some(value);
                }
            }
            1 => skip(reader, &mut pos, len, 8)?,
            2 => {
                let n = read_varint_stream(reader, &mut pos, len)?;
                if n > len - pos {
                    return Err(OnnxError::Truncated {
                        offset: pos,
                        what: "length-delimited field runs past end of file",
                    });
                }
                match field {
                    MODEL_PRODUCER_NAME if n <= MAX_PRODUCER_LEN => {
                        let mut buf = vec![0u8; n as usize];
                        reader.read_exact(&mut buf)?;
                        pos += n;
                        producer = Some(String::from_utf8_lossy(&buf).into_owned());
                    }
                    _ => {
                        if field == MODEL_GRAPH {
                            graph_bytes = Some(n);
                        } else if field == MODEL_OPSET_IMPORT {
                            opset_imports += 1;
                        }
                        skip(reader, &mut pos, len, n)?;
                    }
                }
            }
            5 => skip(reader, &mut pos, len, 4)?,
            wire => return Err(malformed(tag_at, &format!("unsupported wire type {wire}"))),
        }
    }

    let ir_version = ir_version.ok_or(OnnxError::MissingField("ir_version"))?;
    let graph_bytes = graph_bytes.ok_or(OnnxError::MissingField("graph"))?;
    if ir_version == 0 {
        return Err(malformed(0, "ir_version is 0"));
    }

    Ok(ModelSummary {
        ir_version,
        graph_bytes,
        opset_imports,
        producer,
    })
}

/// Find the last floating-point initializer with dimensions `[rows, cols]` in
/// a fully loaded model and return its values widened to f32.
///
/// Half-precision exports store their initializers as FLOAT16, so both
/// element types are accepted.
pub fn find_float_initializer(model: &[u8], rows: u64, cols: u64) -> Result<Option<Vec<f32>>, OnnxError> {
    let mut graph = None;
    for field in Fields::new(model) {
        let field = field?;
        if let (MODEL_GRAPH, Payload::Bytes(bytes)) = (field.number, field.payload) {
            graph = Some(bytes);
        }
    }
    let graph = graph.ok_or(OnnxError::MissingField("graph"))?;

    let mut found = None;
    for field in Fields::new(graph) {
        let field = field?;
        if let (GRAPH_INITIALIZER, Payload::Bytes(tensor)) = (field.number, field.payload) {
            if let Some(values) = float_tensor_values(tensor, &[rows, cols])? {
                found = Some(values);
            }
        }
    }
    Ok(found)
}

/// Decode a `TensorProto` if it is FLOAT or FLOAT16 with exactly `want_dims`.
fn float_tensor_values(tensor: &[u8], want_dims: &[u64]) -> Result<Option<Vec<f32>>, OnnxError> {
    let mut dims = Vec::new();
    let mut data_type = 0;
    let mut raw: Option<&[u8]> = None;
    let mut floats = Vec::new();
    // FLOAT16 values live in int32_data, one half per element.
    let mut halves = Vec::new();
    let mut name = None;

    for field in Fields::new(tensor) {
        let field = field?;
        match (field.number, field.payload) {
            (TENSOR_DIMS, Payload::Varint(v)) => dims.push(v),
            (TENSOR_DIMS, Payload::Bytes(packed)) => {
                for v in Varints::new(packed) {
                    dims.push(v?);
                }
            }
            (TENSOR_DATA_TYPE, Payload::Varint(v)) => data_type = v,
            (TENSOR_FLOAT_DATA, Payload::Bytes(packed)) => {
                floats.extend(packed.chunks_exact(4).map(le_f32));
            }
            (TENSOR_FLOAT_DATA, Payload::Fixed32(bits)) => floats.push(f32::from_bits(bits)),
            (TENSOR_INT32_DATA, Payload::Varint(v)) => halves.push(v as u16),
            (TENSOR_INT32_DATA, Payload::Bytes(packed)) => {
                for v in Varints::new(packed) {
                    halves.push(v? as u16);
                }
            }
            (TENSOR_NAME, Payload::Bytes(n)) => name = Some(String::from_utf8_lossy(n).into_owned()),
            (TENSOR_RAW_DATA, Payload::Bytes(bytes)) => raw = Some(bytes),
            _ => {}
        }
    }

    if dims != want_dims {
        return Ok(None);
    }

    let expected: u64 = want_dims.iter().product();
    let values: Vec<f32> = match (data_type, raw) {
        (TENSOR_TYPE_FLOAT, Some(bytes)) => bytes.chunks_exact(4).map(le_f32).collect(),
        (TENSOR_TYPE_FLOAT, None) => floats,
        (TENSOR_TYPE_FLOAT16, Some(bytes)) => bytes
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        (TENSOR_TYPE_FLOAT16, None) => halves.into_iter().map(f16_to_f32).collect(),
        _ => return Ok(None),
    };
    if values.len() as u64 != expected {
        return Err(malformed(
            0,
            &format!(
                "initializer {} holds {} floats, dims say {expected}",
                name.as_deref().unwrap_or("<unnamed>"),
                values.len()
            ),
        ));
    }
    tracing::debug!(name = name.as_deref().unwrap_or("<unnamed>"), ?want_dims, "found float initializer");
    Ok(Some(values))
}

fn le_f32(chunk: &[u8]) -> f32 {
    f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
}

/// IEEE 754 binary16 to binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let frac = u32::from(bits & 0x3ff);
    let out = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize into the f32 exponent range.
            let mut e = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, _) => sign | 0x7f80_0000 | (frac << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}

fn malformed(offset: u64, what: &str) -> OnnxError {
    OnnxError::Malformed {
        offset,
        what: what.to_string(),
    }
}

fn skip<R: Seek>(reader: &mut R, pos: &mut u64, len: u64, n: u64) -> Result<(), OnnxError> {
    if n > len - *pos {
        return Err(OnnxError::Truncated {
            offset: *pos,
            what: "fixed-width field runs past end of file",
        });
    }
    reader.seek(SeekFrom::Current(n as i64))?;
    *pos += n;
    Ok(())
}

fn read_varint_stream<R: Read>(reader: &mut R, pos: &mut u64, len: u64) -> Result<u64, OnnxError> {
    let start = *pos;
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        if *pos >= len {
            return Err(OnnxError::Truncated {
                offset: start,
                what: "varint runs past end of file",
            });
        }
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        *pos += 1;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(malformed(start, "varint longer than 10 bytes"))
}

/// Decoded field payload.
#[derive(Debug, Clone, Copy)]
enum Payload<'a> {
    Varint(u64),
    Fixed64,
    Bytes(&'a [u8]),
    Fixed32(u32),
}

struct Field<'a> {
    number: u64,
    payload: Payload<'a>,
}

/// Iterator over the fields of an in-memory protobuf message.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, failed: false }
    }

    fn varint(&mut self) -> Result<u64, OnnxError> {
        let (value, used) = decode_varint(&self.buf[self.pos..], self.pos as u64)?;
        self.pos += used;
        Ok(value)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OnnxError> {
        if n > self.buf.len() - self.pos {
            return Err(OnnxError::Truncated {
                offset: self.pos as u64,
                what: "field runs past end of message",
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn next_field(&mut self) -> Result<Field<'a>, OnnxError> {
        let tag_at = self.pos as u64;
        let tag = self.varint()?;
        let number = tag >> 3;
        if number == 0 {
            return Err(malformed(tag_at, "field number 0"));
        }
        let payload = match tag & 7 {
            0 => Payload::Varint(self.varint()?),
            1 => {
                self.take(8)?;
                Payload::Fixed64
            }
            2 => {
                let n = self.varint()?;
                let n = usize::try_from(n).map_err(|_| malformed(tag_at, "length overflows usize"))?;
                Payload::Bytes(self.take(n)?)
            }
            5 => {
                let b = self.take(4)?;
                Payload::Fixed32(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            wire => return Err(malformed(tag_at, &format!("unsupported wire type {wire}"))),
        };
        Ok(Field { number, payload })
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, OnnxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let field = self.next_field();
        self.failed = field.is_err();
        Some(field)
    }
}

/// Iterator over a packed repeated varint payload.
struct Varints<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Varints<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl Iterator for Varints<'_> {
    type Item = Result<u64, OnnxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(match decode_varint(&self.buf[self.pos..], self.pos as u64) {
            Ok((v, used)) => {
                self.pos += used;
                Ok(v)
            }
            Err(e) => {
                self.pos = self.buf.len();
                Err(e)
            }
        })
    }
}

fn decode_varint(buf: &[u8], offset: u64) -> Result<(u64, usize), OnnxError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(10).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 10 {
        Err(OnnxError::Truncated {
            offset,
            what: "varint runs past end of message",
        })
    } else {
        Err(malformed(offset, "varint longer than 10 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::io::Cursor;

    fn inspect_bytes(bytes: &[u8]) -> Result<ModelSummary, OnnxError> {
        inspect(&mut Cursor::new(bytes), bytes.len() as u64)
    }

    #[test]
    fn test_inspect_minimal_model() {
        let bytes = testutil::model_bytes(&testutil::graph_bytes(&[]), 0);
        let summary = inspect_bytes(&bytes).unwrap();
        assert_eq!(summary.ir_version, 8);
        assert_eq!(summary.opset_imports, 1);
        assert_eq!(summary.producer.as_deref(), Some("faceswap-test"));
        assert!(summary.graph_bytes > 0);
    }

    #[test]
    fn test_inspect_padded_model_has_exact_size() {
        let bytes = testutil::model_bytes(&testutil::graph_bytes(&[]), 4096);
        assert_eq!(bytes.len(), 4096);
        assert!(inspect_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_inspect_truncated_model() {
        let bytes = testutil::model_bytes(&testutil::graph_bytes(&[]), 4096);
        let err = inspect_bytes(&bytes[..2000]).unwrap_err();
        assert!(matches!(err, OnnxError::Truncated { .. }), "{err}");
    }

    #[test]
    fn test_inspect_html_error_page() {
        let err = inspect_bytes(b"<!DOCTYPE html><html><body>404</body></html>").unwrap_err();
        assert!(matches!(err, OnnxError::Malformed { .. }), "{err}");
    }

    #[test]
    fn test_inspect_lfs_pointer() {
        let pointer = b"version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 554253681\n";
        assert!(inspect_bytes(pointer).is_err());
    }

    #[test]
    fn test_inspect_missing_graph() {
        let mut bytes = Vec::new();
        testutil::put_varint_field(&mut bytes, 1, 8);
        assert!(matches!(inspect_bytes(&bytes), Err(OnnxError::MissingField("graph"))));
    }

    #[test]
    fn test_inspect_empty_file() {
        assert!(matches!(inspect_bytes(&[]), Err(OnnxError::MissingField("ir_version"))));
    }

    #[test]
    fn test_find_initializer_raw_data() {
        let values: Vec<f32> = (0..6).map(|i| i as f32 * 0.5).collect();
        let graph = testutil::graph_bytes(&[testutil::tensor_bytes("emap", &[2, 3], &values, true)]);
        let model = testutil::model_bytes(&graph, 0);
        assert_eq!(find_float_initializer(&model, 2, 3).unwrap(), Some(values));
    }

    #[test]
    fn test_find_initializer_float_data_and_last_wins() {
        let first = vec![1.0f32; 4];
        let second = vec![2.0f32; 4];
        let graph = testutil::graph_bytes(&[
            testutil::tensor_bytes("a", &[2, 2], &first, true),
            testutil::tensor_bytes("bias", &[4], &first, true),
            testutil::tensor_bytes("b", &[2, 2], &second, false),
        ]);
        let model = testutil::model_bytes(&graph, 0);
        assert_eq!(find_float_initializer(&model, 2, 2).unwrap(), Some(second));
    }

    #[test]
    fn test_find_initializer_absent() {
        let model = testutil::model_bytes(&testutil::graph_bytes(&[]), 0);
        assert_eq!(find_float_initializer(&model, 512, 512).unwrap(), None);
    }

    #[test]
    fn test_find_initializer_float16_raw_data() {
        // 1.0, -2.0, 0.5, 0.0 as binary16
        let halves: [u16; 4] = [0x3c00, 0xc000, 0x3800, 0x0000];
        let raw: Vec<u8> = halves.iter().flat_map(|h| h.to_le_bytes()).collect();
        let mut tensor = Vec::new();
        testutil::put_varint_field(&mut tensor, 1, 2);
        testutil::put_varint_field(&mut tensor, 1, 2);
        testutil::put_varint_field(&mut tensor, 2, 10);
        testutil::put_bytes_field(&mut tensor, 9, &raw);
        let model = testutil::model_bytes(&testutil::graph_bytes(&[tensor]), 0);
        assert_eq!(find_float_initializer(&model, 2, 2).unwrap(), Some(vec![1.0, -2.0, 0.5, 0.0]));
    }

    #[test]
    fn test_f16_special_values() {
        assert_eq!(f16_to_f32(0x7bff), 65504.0);
        assert_eq!(f16_to_f32(0x0001), 2f32.powi(-24));
        assert!(f16_to_f32(0x7c00).is_infinite());
        assert!(f16_to_f32(0x7e00).is_nan());
    }

    #[test]
    fn test_decode_varint_multibyte() {
        assert_eq!(decode_varint(&[0xac, 0x02], 0).unwrap(), (300, 2));
        assert!(decode_varint(&[0xff], 0).is_err());
    }
}
