//! presence-core: face identity verification and attendance engine.
//!
//! Image quality gating, a detector fallback chain (SeetaFace cascade, then
//! SCRFD via ONNX Runtime), ArcFace embeddings, cosine matching against
//! aggregate templates, a geofence gate and attendance periods. Storage sits
//! behind the traits in [`repository`].

pub mod attendance;
pub mod cascade;
pub mod detector;
pub mod geofence;
pub mod imaging;
pub mod localizer;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod recognizer;
pub mod repository;
pub mod types;

pub use attendance::{AttendanceAction, AttendanceEvent, InvalidAction, LastAction, TimePeriod};
pub use geofence::{GeofencePolicy, GeofenceVerdict};
pub use localizer::{Detection, FaceLocalizer, LocalizerConfig};
pub use matcher::IdentityMatcher;
pub use pipeline::{Coordinates, Pipeline, PipelineError, Rejection, Verdict};
pub use quality::{QualityConfig, QualityGate, QualityReport};
pub use recognizer::EmbeddingProvider;
pub use repository::{AttendanceRecorder, EnrolledIdentity, Identity, StoreError, TemplateStore};
pub use types::{BoundingBox, Embedding, FaceRegion};
