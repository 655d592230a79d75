use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use presence_core::attendance::{AttendanceAction, LastAction};
use presence_core::pipeline::{
    similarity_percent, AttendanceOutcome, Coordinates, ExtractedEmbedding, Registration, Verification,
};
use presence_core::{Identity, Rejection, Verdict};
use serde_json::{json, Value};
use zbus::{fdo, interface};

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Every method replies with a JSON document. Gate rejections are ordinary
/// replies carrying `"status": "error"` and a machine-readable `"error"` code;
/// D-Bus errors are reserved for bad arguments and server faults.
pub struct AttendanceService {
    engine: EngineHandle,
    config: Config,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Add a face template for `identity`, creating it on first use.
    async fn register(&self, identity: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(identity, bytes = image.len(), "register requested");
        let verdict = self.engine.register(identity.to_string(), image).await.map_err(to_fdo)?;
        Ok(render(verdict, registration_json))
    }

    /// 1:1 check of `image` against `identity`.
    async fn verify(&self, identity: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(identity, bytes = image.len(), "verify requested");
        let verdict = self.engine.verify(identity.to_string(), image).await.map_err(to_fdo)?;
        Ok(render(verdict, verification_json))
    }

    /// Identify the face and record attendance.
    ///
    /// `identity` empty means 1:N recognition. `location` is empty or
    /// `[latitude, longitude]`. Unknown `action` values count as check-in.
    async fn recognize(
        &self,
        image: Vec<u8>,
        action: &str,
        identity: &str,
        location: Vec<f64>,
    ) -> fdo::Result<String> {
        let action = coerce_action(action);
        let identity = Some(identity.trim()).filter(|s| !s.is_empty()).map(str::to_string);
        let location = parse_location(&location)?;
        tracing::info!(%action, identity = ?identity, located = location.is_some(), "recognize requested");

        let verdict = self
            .engine
            .recognize(image, action, identity, location)
            .await
            .map_err(to_fdo)?;
        Ok(render(verdict, |outcome| attendance_json(outcome, action)))
    }

    /// Quality gate and face localizer diagnostics. Never stores anything.
    async fn check_quality(&self, image: Vec<u8>) -> fdo::Result<String> {
        let check = self.engine.check_quality(image).await.map_err(to_fdo)?;
        serde_json::to_string(&check).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Run the gates and return the probe embedding without storing it.
    async fn extract_embedding(&self, image: Vec<u8>) -> fdo::Result<String> {
        let verdict = self.engine.extract_embedding(image).await.map_err(to_fdo)?;
        Ok(render(verdict, embedding_json))
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        Ok(identities_json(&identities).to_string())
    }

    async fn last_action(&self, identity: &str) -> fdo::Result<String> {
        let last = self.engine.last_action(identity.to_string()).await.map_err(to_fdo)?;
        Ok(last_action_json(identity, last).to_string())
    }

    /// Delete an identity with its templates and attendance history.
    async fn remove_identity(&self, identity: &str) -> fdo::Result<bool> {
        tracing::info!(identity, "remove_identity requested");
        self.engine.remove_identity(identity.to_string()).await.map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "detectors": self.engine.detectors,
            "match_threshold": self.config.match_threshold,
            "quality": self.config.quality,
            "detection": self.config.detection,
            "geofence": self.config.geofence,
        })
        .to_string())
    }
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Pipeline(e) if e.is_client_error() => fdo::Error::InvalidArgs(e.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

/// Lenient at the boundary: anything but `check_out` is a check-in.
fn coerce_action(raw: &str) -> AttendanceAction {
    raw.parse().unwrap_or_else(|err| {
        tracing::debug!(error = %err, "coercing action to check_in");
        AttendanceAction::CheckIn
    })
}

fn parse_location(values: &[f64]) -> fdo::Result<Option<Coordinates>> {
    match values {
        [] => Ok(None),
        [latitude, longitude]
            if (-90.0..=90.0).contains(latitude) && (-180.0..=180.0).contains(longitude) =>
        {
            Ok(Some(Coordinates { latitude: *latitude, longitude: *longitude }))
        }
        _ => Err(fdo::Error::InvalidArgs(format!(
            "location must be empty or [latitude, longitude], got {values:?}"
        ))),
    }
}

fn render<T>(verdict: Verdict<T>, accepted: impl FnOnce(T) -> Value) -> String {
    match verdict {
        Verdict::Accepted(value) => accepted(value),
        Verdict::Rejected(rejection) => rejection_json(&rejection),
    }
    .to_string()
}

fn rejection_json(rejection: &Rejection) -> Value {
    let message = rejection.message();
    match rejection {
        Rejection::ImageQualityFailed { quality } => json!({
            "status": "error",
            "error": "image_quality_failed",
            "message": message,
            "checks": quality.checks,
            "reasons": quality.reasons,
        }),
        Rejection::FaceDetectionFailed { detection } => json!({
            "status": "error",
            "error": "face_detection_failed",
            "message": message,
            "face_count": detection.face_count,
        }),
        Rejection::VerificationFailed { identity, score } => json!({
            "status": "error",
            "error": "verification_failed",
            "message": message,
            "username": identity,
            "score": score,
            "similarity_percent": score.map(similarity_percent).unwrap_or(0.0),
        }),
        Rejection::LocationNotAllowed { location } => json!({
            "status": "error",
            "error": "location_not_allowed",
            "message": message,
            "message_th": location.message_th,
            "distance": location.distance_m,
            "max_distance": location.max_distance_m,
        }),
        Rejection::IdentityNotFound { identity } => json!({
            "status": "error",
            "error": "identity_not_found",
            "message": message,
            "username": identity,
        }),
    }
}

fn registration_json(reg: Registration) -> Value {
    json!({
        "status": "registered",
        "username": reg.identity,
        "embedding_count": reg.embedding_count,
        "message": format!("face added ({} images in total)", reg.embedding_count),
        "quality_passed": true,
        "face_detected": true,
        "detection_confidence": reg.detection.confidence,
        "detection_message": reg.detection.message,
    })
}

fn verification_json(v: Verification) -> Value {
    json!({
        "verified": v.verified,
        "username": v.verified.then_some(v.identity),
        "score": v.score,
        "similarity_percent": v.score.map(similarity_percent),
        "quality_passed": true,
        "detection_confidence": v.detection.confidence,
        "detection_message": v.detection.message,
    })
}

fn attendance_json(outcome: AttendanceOutcome, action: AttendanceAction) -> Value {
    let distance = outcome.distance_m;
    let Some(event) = outcome.event else {
        return json!({
            "recognized": false,
            "username": null,
            "score": outcome.score,
            "message": "face not registered; please register first",
            "distance": distance,
            "quality_passed": true,
            "detection_confidence": outcome.detection.confidence,
            "detection_message": outcome.detection.message,
        });
    };

    let percent = similarity_percent(event.score);
    let verb = match action {
        AttendanceAction::CheckIn => "checked in",
        AttendanceAction::CheckOut => "checked out",
    };
    json!({
        "recognized": true,
        "username": event.identity,
        "score": event.score,
        "similarity_percent": percent,
        "action": event.action,
        "timestamp": event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        "time_period": event.period,
        "time_period_thai": event.period.label_th(),
        "distance": distance,
        "message": format!("{verb} ({}), similarity {percent}%", event.period.label_th()),
        "quality_passed": true,
        "detection_confidence": outcome.detection.confidence,
        "detection_message": outcome.detection.message,
    })
}

fn embedding_json(extracted: ExtractedEmbedding) -> Value {
    json!({
        "embedding": extracted.embedding.values(),
        "dim": extracted.embedding.values().len(),
        "quality": extracted.quality.checks,
        "detection": {
            "confidence": extracted.detection.confidence,
            "bbox": extracted.detection.bbox,
        },
    })
}

fn identities_json(identities: &[Identity]) -> Value {
    json!({
        "identities": identities,
        "count": identities.len(),
    })
}

fn last_action_json(identity: &str, last: Option<LastAction>) -> Value {
    json!({
        "username": identity,
        "action": last.map(|l| l.action),
        "timestamp": last.map(|l| l.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
    })
}
