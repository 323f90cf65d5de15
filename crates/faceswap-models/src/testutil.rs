//! Builders for synthetic ONNX containers and fake collaborators used by tests.

use crate::artifact::ModelArtifact;
use crate::fetch::{ArtifactSource, FetchError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub fn put_varint_field(out: &mut Vec<u8>, field: u64, v: u64) {
    put_varint(out, field << 3);
    put_varint(out, v);
}

pub fn put_bytes_field(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    put_varint(out, (field << 3) | 2);
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// A `TensorProto` of FLOAT values, stored as `raw_data` or packed `float_data`.
pub fn tensor_bytes(name: &str, dims: &[u64], values: &[f32], raw: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for &d in dims {
        put_varint_field(&mut out, 1, d);
    }
    put_varint_field(&mut out, 2, 1);
    put_bytes_field(&mut out, 8, name.as_bytes());
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    put_bytes_field(&mut out, if raw { 9 } else { 4 }, &data);
    out
}

/// A `GraphProto` holding the given initializers.
pub fn graph_bytes(initializers: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    put_bytes_field(&mut out, 2, b"main");
    for init in initializers {
        put_bytes_field(&mut out, 5, init);
    }
    out
}

/// A `ModelProto` around `graph`, padded with a doc string to exactly
/// `size` bytes when `size` is larger than the bare encoding.
pub fn model_bytes(graph: &[u8], size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    put_varint_field(&mut out, 1, 8);
    put_bytes_field(&mut out, 2, b"faceswap-test");
    let mut opset = Vec::new();
    put_varint_field(&mut opset, 2, 17);
    put_bytes_field(&mut out, 8, &opset);
    put_bytes_field(&mut out, 7, graph);

    if size > out.len() + 2 {
        // Tag byte, then a length varint widened as needed so the total is exact.
        let room = size - out.len() - 1;
        let width = (1..=5)
            .find(|&w| room > w && ((room - w) as u64) < 1u64 << (7 * w as u32))
            .unwrap();
        let pad = room - width;
        put_varint(&mut out, (6 << 3) | 2);
        let mut v = pad as u64;
        for _ in 1..width {
            out.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
        out.extend(std::iter::repeat(0x20u8).take(pad));
    }
    out
}

pub fn write_model(path: &Path, size: usize) {
    std::fs::write(path, model_bytes(&graph_bytes(&[]), size)).unwrap();
}

/// Source that writes a valid model of `size` bytes after failing `failures` times.
pub struct FakeSource {
    pub size: usize,
    pub failures: usize,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn succeeding(size: usize) -> Self {
        Self::failing_first(size, 0)
    }

    pub fn failing_first(size: usize, failures: usize) -> Self {
        Self {
            size,
            failures,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(0, usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactSource for FakeSource {
    fn fetch(&self, artifact: &ModelArtifact, dest: &Path) -> Result<u64, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.fetched.lock().unwrap().push(artifact.id.to_string());
        if n < self.failures {
            return Err(FetchError::Unavailable(format!("fake failure {n}")));
        }
        write_model(dest, self.size);
        Ok(self.size as u64)
    }

    fn describe(&self) -> String {
        "fake".into()
    }
}
