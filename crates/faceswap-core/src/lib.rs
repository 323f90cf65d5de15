//! faceswap-core: Face detection, embedding and swapping engine.
//!
//! Uses SCRFD for face detection, ArcFace for identity embeddings and the
//! inswapper model for face replacement, all running via ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod locator;
pub mod recognizer;
pub mod swapper;
pub mod types;

pub use detector::FaceDetector;
pub use locator::{locate, order_faces};
pub use recognizer::FaceRecognizer;
pub use swapper::FaceSwapper;
pub use types::{BoundingBox, Embedding, FaceDescriptor};
