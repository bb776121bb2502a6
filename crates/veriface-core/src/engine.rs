//! Verification decision engine.
//!
//! One call runs decode → detect → match → attribute analysis → enroll and
//! always ends in a [`VerificationResult`]; every failure is converted at
//! this boundary.

use crate::backend::{BackendError, BackendSet, BackendStatus, Detection, SelectionPolicy};
use crate::config::EngineConfig;
use crate::decode::{DecodeError, ImageDecoder, ImageInput};
use crate::liveness::LivenessAssessment;
use crate::matcher::{find_best_image_match, BestMatch};
use crate::store::{DescriptorRecord, DescriptorStore, Payload, PayloadKind, StoreError};
use crate::types::{crop_face, BackendTier, FailureKind, Image, VerificationResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Per-request switches.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub identity: Option<String>,
    pub save_on_success: bool,
    pub basic_only: bool,
    pub request_id: Option<String>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub image: ImageInput,
    pub options: VerifyOptions,
}

impl VerifyRequest {
    pub fn new(image: impl Into<ImageInput>) -> Self {
        Self {
            image: image.into(),
            options: VerifyOptions::default(),
        }
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.options.identity = Some(identity.into());
        self
    }

    pub fn save_on_success(mut self, save: bool) -> Self {
        self.options.save_on_success = save;
        self
    }

    pub fn basic_only(mut self, basic: bool) -> Self {
        self.options.basic_only = basic;
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.options.request_id = Some(request_id.into());
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }
}

/// Terminal failure inside a call, before it becomes a result.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub backend: Option<BackendTier>,
}

impl Failure {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backend: None,
        }
    }

    fn store(e: StoreError) -> Self {
        Self::new(FailureKind::StoreIo, format!("store error: {e}"))
    }

    fn into_result(self, request_id: Option<String>) -> VerificationResult {
        VerificationResult {
            backend: self.backend,
            ..VerificationResult::failure(self.kind, self.message, request_id)
        }
    }
}

impl From<DecodeError> for Failure {
    fn from(e: DecodeError) -> Self {
        Self::new(FailureKind::Decode, format!("invalid image: {e}"))
    }
}

pub(crate) fn check_deadline(deadline: Option<Instant>, stage: &str) -> Result<(), Failure> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(Failure::new(
            FailureKind::BackendTimeout,
            format!("deadline exceeded during {stage}"),
        )),
        _ => Ok(()),
    }
}

/// A face found by one tier, after demotion.
pub(crate) struct TierDetection {
    pub tier: BackendTier,
    pub backend: String,
    pub detection: Detection,
}

/// Drives backends, matcher and store for one request at a time.
pub struct VerificationEngine<S: DescriptorStore + ?Sized> {
    backends: BackendSet,
    store: Arc<S>,
    decoder: ImageDecoder,
    config: EngineConfig,
}

impl<S: DescriptorStore + ?Sized> VerificationEngine<S> {
    pub fn new(backends: BackendSet, store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            backends,
            store,
            decoder: ImageDecoder::new(config.max_image_bytes),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn backend_statuses(&self) -> Vec<BackendStatus> {
        self.backends.statuses()
    }

    pub(crate) fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    /// Verify one image. Never fails; failures are encoded in the result.
    pub fn verify(&mut self, request: VerifyRequest) -> VerificationResult {
        let VerifyRequest { image, options } = request;
        let request_id = options.request_id.clone();

        match self.decoder.decode_owned(image) {
            Ok(image) => self.verify_image(&image, &options),
            Err(e) => {
                tracing::warn!(request_id = ?request_id, error = %e, "image decode failed");
                Failure::from(e).into_result(request_id)
            }
        }
    }

    /// Verify an already decoded image.
    pub fn verify_image(&mut self, image: &Image, options: &VerifyOptions) -> VerificationResult {
        let started = Instant::now();
        let result = self
            .run_pipeline(image, options)
            .unwrap_or_else(|failure| failure.into_result(options.request_id.clone()));

        tracing::info!(
            request_id = ?options.request_id,
            identity = ?options.identity,
            success = result.success,
            matched = result.matched,
            confidence = result.confidence,
            backend = ?result.backend,
            error = ?result.error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "verification complete"
        );
        result
    }

    /// Detect a face and store it for `identity` without matching.
    pub fn enroll(
        &mut self,
        identity: &str,
        image: ImageInput,
        request_id: Option<String>,
    ) -> VerificationResult {
        self.enroll_until(identity, image, request_id, None)
    }

    /// [`enroll`](Self::enroll) that gives up, without writing, once `deadline` passes.
    pub fn enroll_until(
        &mut self,
        identity: &str,
        image: ImageInput,
        request_id: Option<String>,
        deadline: Option<Instant>,
    ) -> VerificationResult {
        let options = VerifyOptions {
            identity: Some(identity.to_string()),
            save_on_success: true,
            request_id: request_id.clone(),
            deadline,
            ..VerifyOptions::default()
        };
        let outcome = self
            .decoder
            .decode_owned(image)
            .map_err(Failure::from)
            .and_then(|image| {
                let mut unavailable = HashSet::new();
                let found = self.detect(&image, policy_for(&options), &mut unavailable, deadline)?;
                let record = self.enroll_detection(&image, &found, identity, deadline)?;
                let confidence = LivenessAssessment::assess(&image, &found.detection.region)
                    .apply(found.detection.region.confidence);
                Ok((found, record, confidence))
            });

        match outcome {
            Ok((found, record, confidence)) => {
                tracing::info!(
                    identity,
                    record_id = %record.record_id,
                    kind = ?record.kind,
                    confidence,
                    "face enrolled"
                );
                VerificationResult {
                    success: true,
                    confidence,
                    matched: false,
                    record_id: Some(record.record_id),
                    message: "Face enrolled".into(),
                    results: found.detection.attributes,
                    request_id,
                    backend: Some(found.tier),
                    error: None,
                }
            }
            Err(failure) => failure.into_result(request_id),
        }
    }

    fn run_pipeline(
        &mut self,
        image: &Image,
        options: &VerifyOptions,
    ) -> Result<VerificationResult, Failure> {
        let deadline = options.deadline;
        let mut unavailable = HashSet::new();

        let found = self.detect(image, policy_for(options), &mut unavailable, deadline)?;
        let tier = found.tier;

        let best = self.match_detection(image, &found.detection, options.identity.as_deref())?;
        if let Some(m) = &best {
            if m.confidence() >= self.config.strong_match_confidence {
                tracing::debug!(record_id = %m.id, confidence = m.confidence(), "strong match");
                return Ok(VerificationResult {
                    success: true,
                    confidence: m.confidence(),
                    matched: true,
                    record_id: Some(m.id),
                    message: "Strong match with enrolled face".into(),
                    results: found.detection.attributes.clone(),
                    request_id: options.request_id.clone(),
                    backend: Some(tier),
                    error: None,
                });
            }
        }

        let mut attributes = found.detection.attributes.clone();
        let mut detection_confidence = found.detection.region.confidence;
        if attributes.is_none() && !options.basic_only {
            if let Some(analysis) = self.analyze_attributes(image, &unavailable, deadline)? {
                detection_confidence = detection_confidence.max(analysis.region.confidence);
                attributes = analysis.attributes;
            }
        }

        let liveness = LivenessAssessment::assess(image, &found.detection.region);
        let fused = liveness.apply(detection_confidence);
        tracing::debug!(
            detection_confidence,
            fused,
            roi_variance = liveness.roi_variance,
            center_offset = liveness.center_offset,
            "detection confidence fused"
        );

        let mut result = VerificationResult {
            success: true,
            confidence: fused,
            matched: false,
            record_id: None,
            message: "Face detected".into(),
            results: attributes,
            request_id: options.request_id.clone(),
            backend: Some(tier),
            error: None,
        };

        if let Some(m) = best {
            result.confidence = m.confidence();
            result.matched = true;
            result.record_id = Some(m.id);
            result.message = "Matched enrolled face".into();
            return Ok(result);
        }

        if let (true, Some(identity)) = (options.save_on_success, options.identity.as_deref()) {
            let record = self.enroll_detection(image, &found, identity, deadline)?;
            tracing::info!(
                identity,
                record_id = %record.record_id,
                kind = ?record.kind,
                "face enrolled"
            );
            result.record_id = Some(record.record_id);
            result.message = "Face detected and enrolled".into();
        }

        Ok(result)
    }

    /// Walk the allowed tiers, demoting past unavailable or failing backends.
    pub(crate) fn detect(
        &mut self,
        image: &Image,
        policy: SelectionPolicy,
        unavailable: &mut HashSet<usize>,
        deadline: Option<Instant>,
    ) -> Result<TierDetection, Failure> {
        let mut last_error = None;

        for index in self.backends.plan(policy) {
            if unavailable.contains(&index) {
                continue;
            }
            let Some(backend) = self.backends.get_mut(index) else {
                continue;
            };
            let tier = backend.tier();
            let name = backend.name().to_string();

            let outcome = backend.run(image);
            check_deadline(deadline, "detection")?;

            match outcome {
                Ok(detection) => {
                    tracing::debug!(
                        backend = %name,
                        ?tier,
                        confidence = detection.region.confidence,
                        "face detected"
                    );
                    return Ok(TierDetection {
                        tier,
                        backend: name,
                        detection,
                    });
                }
                Err(BackendError::NoFaceDetected) => {
                    return Err(Failure {
                        backend: Some(tier),
                        ..Failure::new(FailureKind::NoFaceDetected, "No face detected")
                    });
                }
                Err(e) => {
                    tracing::warn!(backend = %name, ?tier, error = %e, "backend failed, demoting");
                    unavailable.insert(index);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Failure::new(
            FailureKind::ModelUnavailable,
            last_error.unwrap_or_else(|| "no face backend available".into()),
        ))
    }

    fn match_detection(
        &self,
        image: &Image,
        detection: &Detection,
        identity: Option<&str>,
    ) -> Result<Option<BestMatch<Uuid>>, Failure> {
        let records = match identity {
            Some(identity) => self.store.list(identity),
            None => self.store.list_all(),
        }
        .map_err(Failure::store)?;

        match &detection.descriptor {
            Some(query) => {
                let stored: Vec<(Uuid, crate::types::Descriptor)> = self
                    .load_records(&records, PayloadKind::Descriptor)
                    .filter_map(|(id, payload)| match payload {
                        Payload::Descriptor(d) => Some((id, d)),
                        Payload::Image(_) => None,
                    })
                    .collect();
                self.config
                    .match_metric
                    .find_best(query, stored.iter().map(|(id, d)| (id, d)))
                    .map_err(|e| Failure::new(FailureKind::DimensionMismatch, e.to_string()))
            }
            None => {
                let stored: Vec<(Uuid, Image)> = self
                    .load_records(&records, PayloadKind::Image)
                    .filter_map(|(id, payload)| match payload {
                        Payload::Image(img) => Some((id, img)),
                        Payload::Descriptor(_) => None,
                    })
                    .collect();
                if stored.is_empty() {
                    return Ok(None);
                }
                let face = crop_face(image, &detection.region, self.config.enroll_margin);
                Ok(find_best_image_match(
                    &face,
                    stored.iter().map(|(id, img)| (id, img)),
                    self.config.histogram_threshold,
                ))
            }
        }
    }

    /// Payloads of `kind`; records that vanished or fail to load are skipped.
    fn load_records<'a>(
        &'a self,
        records: &'a [DescriptorRecord],
        kind: PayloadKind,
    ) -> impl Iterator<Item = (Uuid, Payload)> + 'a {
        records
            .iter()
            .filter(move |r| r.kind == kind)
            .filter_map(move |record| match self.store.load(record) {
                Ok(payload) => Some((record.record_id, payload)),
                Err(e) => {
                    tracing::warn!(
                        record_id = %record.record_id,
                        error = %e,
                        "skipping unreadable record"
                    );
                    None
                }
            })
    }

    fn analyze_attributes(
        &mut self,
        image: &Image,
        unavailable: &HashSet<usize>,
        deadline: Option<Instant>,
    ) -> Result<Option<Detection>, Failure> {
        let Some(index) = self
            .backends
            .find_tier(BackendTier::Attribute)
            .filter(|i| !unavailable.contains(i))
        else {
            return Ok(None);
        };
        let Some(backend) = self.backends.get_mut(index) else {
            return Ok(None);
        };

        let outcome = backend.run(image);
        check_deadline(deadline, "attribute analysis")?;
        match outcome {
            Ok(detection) => Ok(Some(detection)),
            Err(e) => {
                tracing::debug!(error = %e, "attribute analysis skipped");
                Ok(None)
            }
        }
    }

    pub(crate) fn enroll_detection(
        &self,
        image: &Image,
        found: &TierDetection,
        identity: &str,
        deadline: Option<Instant>,
    ) -> Result<DescriptorRecord, Failure> {
        let (payload, source_model) = match &found.detection.descriptor {
            Some(descriptor) => (Payload::Descriptor(descriptor.clone()), descriptor.model.clone()),
            None => (
                Payload::Image(crop_face(
                    image,
                    &found.detection.region,
                    self.config.enroll_margin,
                )),
                found.backend.clone(),
            ),
        };
        check_deadline(deadline, "enrollment")?;
        self.store
            .enroll(identity, &payload, &source_model)
            .map_err(Failure::store)
    }
}

fn policy_for(options: &VerifyOptions) -> SelectionPolicy {
    SelectionPolicy {
        has_identity: options.identity.is_some(),
        basic_only: options.basic_only,
    }
}
