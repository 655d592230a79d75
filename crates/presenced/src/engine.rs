use crate::config::Config;
use presence_core::attendance::{AttendanceAction, LastAction};
use presence_core::cascade::CascadeDetector;
use presence_core::detector::{DetectorError, FaceDetector, ScrfdDetector};
use presence_core::pipeline::{
    AttendanceOutcome, Coordinates, ExtractedEmbedding, QualityCheck, Registration, Verification,
};
use presence_core::recognizer::{EmbeddingProvider, FaceRecognizer, RecognizerError};
use presence_core::repository::{AttendanceRecorder, Identity, StoreError, TemplateStore};
use presence_core::{
    FaceLocalizer, GeofencePolicy, IdentityMatcher, Pipeline, PipelineError, QualityGate, Verdict,
};
use presence_store::Store;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, PipelineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        identity: String,
        image: Vec<u8>,
        reply: Reply<Verdict<Registration>>,
    },
    Verify {
        identity: String,
        image: Vec<u8>,
        reply: Reply<Verdict<Verification>>,
    },
    Recognize {
        image: Vec<u8>,
        action: AttendanceAction,
        identity: Option<String>,
        location: Option<Coordinates>,
        reply: Reply<Verdict<AttendanceOutcome>>,
    },
    CheckQuality {
        image: Vec<u8>,
        reply: Reply<QualityCheck>,
    },
    ExtractEmbedding {
        image: Vec<u8>,
        reply: Reply<Verdict<ExtractedEmbedding>>,
    },
    ListIdentities {
        reply: Reply<Vec<Identity>>,
    },
    LastAction {
        identity: String,
        reply: Reply<Option<LastAction>>,
    },
    RemoveIdentity {
        identity: String,
        reply: Reply<bool>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    /// Detector chain in the order it is tried.
    pub detectors: Vec<&'static str>,
}

impl EngineHandle {
    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(result?)
    }

    pub async fn register(&self, identity: String, image: Vec<u8>) -> Result<Verdict<Registration>, EngineError> {
        self.call(|reply| EngineRequest::Register { identity, image, reply }).await
    }

    pub async fn verify(&self, identity: String, image: Vec<u8>) -> Result<Verdict<Verification>, EngineError> {
        self.call(|reply| EngineRequest::Verify { identity, image, reply }).await
    }

    pub async fn recognize(
        &self,
        image: Vec<u8>,
        action: AttendanceAction,
        identity: Option<String>,
        location: Option<Coordinates>,
    ) -> Result<Verdict<AttendanceOutcome>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, action, identity, location, reply })
            .await
    }

    pub async fn check_quality(&self, image: Vec<u8>) -> Result<QualityCheck, EngineError> {
        self.call(|reply| EngineRequest::CheckQuality { image, reply }).await
    }

    pub async fn extract_embedding(&self, image: Vec<u8>) -> Result<Verdict<ExtractedEmbedding>, EngineError> {
        self.call(|reply| EngineRequest::ExtractEmbedding { image, reply }).await
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { reply }).await
    }

    pub async fn last_action(&self, identity: String) -> Result<Option<LastAction>, EngineError> {
        self.call(|reply| EngineRequest::LastAction { identity, reply }).await
    }

    pub async fn remove_identity(&self, identity: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::RemoveIdentity { identity, reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the detector chain, the recognizer and the store on that thread,
/// then enters a request loop. Fails fast at startup if any resource is
/// unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let config = config.clone();
    spawn_with(move || build_pipeline(&config))
}

fn build_pipeline(config: &Config) -> Result<Pipeline<FaceRecognizer, Store>, EngineError> {
    let cascade_path = config.cascade_model_path();
    let cascade = CascadeDetector::load(&cascade_path)?;
    tracing::info!(path = %cascade_path, "cascade detector loaded");

    let scrfd_path = config.scrfd_model_path();
    let scrfd = ScrfdDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let store = Store::open(&config.db_path)?;

    let detectors: Vec<Box<dyn FaceDetector>> = vec![Box::new(cascade), Box::new(scrfd)];
    Ok(Pipeline::new(
        QualityGate::new(config.quality.clone()),
        FaceLocalizer::new(detectors, config.detection.clone()),
        recognizer,
        store,
        IdentityMatcher::new(config.match_threshold),
        config.geofence.clone(),
    ))
}

/// Run `build` on a fresh engine thread and serve requests from it.
///
/// Detectors are not `Send`, so the pipeline is constructed on the thread
/// that owns it; startup failure is reported back before returning.
fn spawn_with<E, R, F>(build: F) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingProvider + 'static,
    R: TemplateStore + AttendanceRecorder + 'static,
    F: FnOnce() -> Result<Pipeline<E, R>, EngineError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            let mut pipeline = match build() {
                Ok(pipeline) => {
                    let names = pipeline.localizer().detector_names();
                    let _ = ready_tx.send(Ok(names));
                    pipeline
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut pipeline, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    let detectors = ready_rx.recv().map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx, detectors })
}

fn handle_request<E, R>(pipeline: &mut Pipeline<E, R>, req: EngineRequest)
where
    E: EmbeddingProvider,
    R: TemplateStore + AttendanceRecorder,
{
    match req {
        EngineRequest::Register { identity, image, reply } => {
            let _ = reply.send(logged("register", pipeline.register(&identity, &image)));
        }
        EngineRequest::Verify { identity, image, reply } => {
            let _ = reply.send(logged("verify", pipeline.verify(&identity, &image)));
        }
        EngineRequest::Recognize { image, action, identity, location, reply } => {
            let result = pipeline.recognize(&image, action, identity.as_deref(), location);
            let _ = reply.send(logged("recognize", result));
        }
        EngineRequest::CheckQuality { image, reply } => {
            let _ = reply.send(logged("check_quality", pipeline.check_quality(&image)));
        }
        EngineRequest::ExtractEmbedding { image, reply } => {
            let _ = reply.send(logged("extract_embedding", pipeline.extract_embedding(&image)));
        }
        EngineRequest::ListIdentities { reply } => {
            let _ = reply.send(logged("list_identities", pipeline.list_identities()));
        }
        EngineRequest::LastAction { identity, reply } => {
            let _ = reply.send(logged("last_action", pipeline.last_action(&identity)));
        }
        EngineRequest::RemoveIdentity { identity, reply } => {
            let _ = reply.send(logged("remove_identity", pipeline.remove_identity(&identity)));
        }
    }
}

fn logged<T>(op: &'static str, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
    if let Err(err) = &result {
        if err.is_client_error() {
            tracing::info!(op, error = %err, "request rejected");
        } else {
            tracing::error!(op, error = %err, "request failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use presence_core::types::{BoundingBox, Embedding, EMBEDDING_DIM};
    use presence_core::{LocalizerConfig, Rejection};
    use std::io::Cursor;

    struct CentreDetector;

    impl FaceDetector for CentreDetector {
        fn name(&self) -> &'static str {
            "centre"
        }

        fn detect(&mut self, image: &RgbImage, _threshold: f32) -> Result<Vec<BoundingBox>, DetectorError> {
            let (w, h) = (image.width() as f32, image.height() as f32);
            Ok(vec![BoundingBox { x: w / 4.0, y: h / 4.0, width: w / 2.0, height: h / 2.0, confidence: 0.88 }])
        }
    }

    struct MeanColour;

    impl EmbeddingProvider for MeanColour {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
            let mut raw = vec![0.0f32; EMBEDDING_DIM];
            for pixel in face.pixels() {
                for c in 0..3 {
                    raw[c] += pixel.0[c] as f32;
                }
            }
            Ok(Embedding::new(raw)?)
        }
    }

    fn photo(a: [u8; 3], b: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| if (x + y) % 2 == 0 { Rgb(a) } else { Rgb(b) });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn spawn_test_engine() -> EngineHandle {
        spawn_with(|| {
            Ok(Pipeline::new(
                QualityGate::default(),
                FaceLocalizer::new(vec![Box::new(CentreDetector)], LocalizerConfig::default()),
                MeanColour,
                Store::open_in_memory()?,
                IdentityMatcher::default(),
                GeofencePolicy::default(),
            ))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_engine_round_trip() {
        let engine = spawn_test_engine();
        assert_eq!(engine.detectors, vec!["centre"]);

        let alice = photo([250, 60, 60], [40, 10, 10]);
        let registered = engine.register("alice".into(), alice.clone()).await.unwrap();
        assert_eq!(registered.accepted().unwrap().embedding_count, 1);

        let outcome = engine
            .recognize(alice, AttendanceAction::CheckIn, None, None)
            .await
            .unwrap()
            .accepted()
            .unwrap();
        assert_eq!(outcome.identity.as_deref(), Some("alice"));

        let last = engine.last_action("alice".into()).await.unwrap().unwrap();
        assert_eq!(last.action, AttendanceAction::CheckIn);

        let identities = engine.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert!(engine.remove_identity("alice".into()).await.unwrap());
        assert!(engine.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_passes_rejections_and_errors_through() {
        let engine = spawn_test_engine();

        let flat = photo([128, 128, 128], [128, 128, 128]);
        let verdict = engine.register("alice".into(), flat).await.unwrap();
        assert!(matches!(verdict.rejection(), Some(Rejection::ImageQualityFailed { .. })));

        let err = engine.verify("alice".into(), b"junk".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Decode(_))));
    }

    #[test]
    fn test_startup_failure_is_reported() {
        let result = spawn_with::<MeanColour, Store, _>(|| {
            Err(EngineError::Detector(DetectorError::ModelNotFound("/models/det_500m.onnx".into())))
        });
        assert!(matches!(result, Err(EngineError::Detector(_))));
    }
}
