//! Security pipeline: the orchestrator over the four layers.
//!
//! Two entry points. `check_inbound` runs sanitizer, conditionally the
//! classifier, then the spotlighter, and hands back a generator-ready secure
//! prompt. `check_output` inspects a generated reply and hands back the safe
//! content to send, if any. Both always return a complete, inspectable
//! record with a fresh check identifier and timestamp, so any decision can
//! be reconstructed later without re-running the pipeline.
//!
//! The pipeline is stateless across invocations: configuration and pattern
//! catalogs are immutable after construction, so one instance behind an
//! `Arc` can serve any number of concurrent checks.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::classifier::{
    ClassifierConfig, ClassifierProvider, InjectionClassification, InjectionClassifier,
    quick_check,
};
use crate::email::InboundEmail;
use crate::output::{OutputValidation, OutputValidator, ReplyKind, ReplyLimits};
use crate::risk::RiskBand;
use crate::sanitizer::{SanitizationResult, Sanitizer, sanitize_sender, sanitize_subject};
use crate::spotlight::{SecurePrompt, SpotlightedEmail, Spotlighter};

/// Pipeline thresholds and policy knobs. Configuration, not code: tune these
/// without touching the components.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Sanitizer risk at or above which the inbound check blocks outright,
    /// before any classifier or spotlighter work is paid for.
    pub auto_block_threshold: f64,
    /// Below this sanitizer risk the classifier is skipped (the quick-check
    /// tripwire still runs).
    pub classifier_skip_below: f64,
    /// At or above this sanitizer risk classification is always forced.
    pub classifier_force_above: f64,
    /// Sanitizer share of the combined risk blend.
    pub sanitizer_weight: f64,
    /// Classifier share of the combined risk blend.
    pub classifier_weight: f64,
    /// Known-safe domains for outbound URL checking.
    pub allowed_domains: Vec<String>,
    /// Length bounds for generated replies.
    pub reply_limits: ReplyLimits,
    /// Classifier gate tuning.
    pub classifier: ClassifierConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auto_block_threshold: 0.75,
            classifier_skip_below: 0.10,
            classifier_force_above: 0.50,
            sanitizer_weight: 0.4,
            classifier_weight: 0.6,
            allowed_domains: Vec::new(),
            reply_limits: ReplyLimits::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl SecurityConfig {
    /// Set the outbound URL allow-list.
    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    /// Set the auto-block threshold.
    pub fn with_auto_block_threshold(mut self, threshold: f64) -> Self {
        self.auto_block_threshold = threshold;
        self
    }

    /// Set the classifier gate tuning.
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }
}

/// Full record of one inbound check. Append-only; never edited after
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityCheckResult {
    /// Whether the email may proceed to generation.
    pub passed: bool,
    /// Whether the email was blocked outright.
    pub blocked: bool,
    /// Whether a human should look before any auto-reply is sent.
    pub requires_review: bool,
    /// Combined risk score in [0, 1].
    pub risk_score: f64,
    /// Band derived from the combined score.
    pub risk_band: RiskBand,
    /// Layer-1 record.
    pub sanitization: SanitizationResult,
    /// Layer-2 record, when classification was warranted.
    pub classification: Option<InjectionClassification>,
    /// Layer-3 record, absent when blocked before spotlighting.
    pub spotlighted: Option<SpotlightedEmail>,
    /// Generator-ready prompt pair, absent when blocked.
    pub secure_prompt: Option<SecurePrompt>,
    /// Opaque check identifier for audit linkage.
    pub check_id: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Wall-clock duration of the check.
    pub processing_ms: u64,
}

/// Full record of one outbound check. Append-only; never edited after
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct OutputCheckResult {
    /// Whether the reply may be sent (possibly in redacted form).
    pub passed: bool,
    /// Whether a human should approve before sending.
    pub requires_review: bool,
    /// Layer-4 record.
    pub validation: OutputValidation,
    /// The content that is actually safe to send: the redaction when one was
    /// produced, the original otherwise, absent when a critical violation
    /// makes the reply unsendable.
    pub safe_content: Option<String>,
    /// Opaque check identifier for audit linkage.
    pub check_id: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// The orchestrator. Construct once at service startup and share.
pub struct SecurityPipeline {
    config: SecurityConfig,
    sanitizer: Sanitizer,
    classifier: InjectionClassifier,
    spotlighter: Spotlighter,
    output: OutputValidator,
}

impl SecurityPipeline {
    /// Build a pipeline over the given classification provider.
    pub fn new(config: SecurityConfig, provider: Arc<dyn ClassifierProvider>) -> Self {
        let classifier = InjectionClassifier::new(provider, config.classifier.clone());
        let output = OutputValidator::new(
            config.allowed_domains.clone(),
            config.reply_limits.clone(),
        );
        Self {
            config,
            sanitizer: Sanitizer::new(),
            classifier,
            spotlighter: Spotlighter::new(),
            output,
        }
    }

    /// Inbound entry point: sanitize, conditionally classify, spotlight.
    pub async fn check_inbound(&self, email: &InboundEmail) -> SecurityCheckResult {
        let started = Instant::now();
        let check_id = generate_check_id();
        let sanitization = self.sanitizer.sanitize(&email.body);

        // Content already certain to be blocked never pays for
        // classification or spotlighting.
        if sanitization.risk_score >= self.config.auto_block_threshold {
            tracing::warn!(
                check_id = %check_id,
                risk = sanitization.risk_score,
                patterns = sanitization.patterns.len(),
                "inbound email auto-blocked"
            );
            return SecurityCheckResult {
                passed: false,
                blocked: true,
                requires_review: true,
                risk_score: sanitization.risk_score,
                risk_band: RiskBand::from_score(sanitization.risk_score),
                sanitization,
                classification: None,
                spotlighted: None,
                secure_prompt: None,
                check_id,
                checked_at: Utc::now(),
                processing_ms: started.elapsed().as_millis() as u64,
            };
        }

        let should_classify = if sanitization.risk_score >= self.config.classifier_force_above {
            tracing::debug!(check_id = %check_id, "risk above force ceiling; classifying");
            true
        } else if sanitization.risk_score >= self.config.classifier_skip_below {
            true
        } else if quick_check(&sanitization.cleaned) {
            tracing::debug!(
                check_id = %check_id,
                "quick-check tripwire fired below the skip floor; classifying"
            );
            true
        } else {
            false
        };

        let classification = if should_classify {
            Some(
                self.classifier
                    .classify(&sanitization.cleaned, &sanitization)
                    .await,
            )
        } else {
            None
        };

        let combined = self.combined_risk(&sanitization, classification.as_ref());

        if classification.as_ref().is_some_and(|c| c.should_block) {
            tracing::warn!(check_id = %check_id, risk = combined, "classifier signaled block");
            return SecurityCheckResult {
                passed: false,
                blocked: true,
                requires_review: true,
                risk_score: combined,
                risk_band: RiskBand::from_score(combined),
                sanitization,
                classification,
                spotlighted: None,
                secure_prompt: None,
                check_id,
                checked_at: Utc::now(),
                processing_ms: started.elapsed().as_millis() as u64,
            };
        }

        // Spotlight the sanitized fields, never the raw ones.
        let cleaned_email = InboundEmail {
            subject: sanitize_subject(&email.subject),
            from_addr: sanitize_sender(&email.from_addr),
            from_name: email.from_name.clone(),
            body: sanitization.cleaned.clone(),
            headers: email.headers.clone(),
            attachment_names: email.attachment_names.clone(),
        };
        let spotlighted = self.spotlighter.mark_email(&cleaned_email);
        let secure_prompt = self.spotlighter.secure_prompt(&spotlighted);

        let risk_band = RiskBand::from_score(combined);
        let requires_review = classification
            .as_ref()
            .is_some_and(|c| c.requires_review)
            || risk_band >= RiskBand::High;

        tracing::info!(
            check_id = %check_id,
            risk = combined,
            band = ?risk_band,
            classified = classification.is_some(),
            "inbound email passed security check"
        );

        SecurityCheckResult {
            passed: true,
            blocked: false,
            requires_review,
            risk_score: combined,
            risk_band,
            sanitization,
            classification,
            spotlighted: Some(spotlighted),
            secure_prompt: Some(secure_prompt),
            check_id,
            checked_at: Utc::now(),
            processing_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Outbound entry point: validate a generated reply.
    pub fn check_output(
        &self,
        generated: &str,
        kind: Option<ReplyKind>,
    ) -> OutputCheckResult {
        let check_id = generate_check_id();
        let validation = self.output.validate_reply(generated, kind);

        let safe_content = if validation.is_valid {
            Some(
                validation
                    .redacted
                    .clone()
                    .unwrap_or_else(|| generated.to_string()),
            )
        } else {
            tracing::warn!(
                check_id = %check_id,
                violations = validation.violations.len(),
                "generated reply rejected"
            );
            None
        };

        OutputCheckResult {
            passed: validation.is_valid,
            requires_review: validation.requires_review,
            validation,
            safe_content,
            check_id,
            checked_at: Utc::now(),
        }
    }

    /// Weighted blend of the sanitizer and classifier scores. A confident
    /// benign verdict contributes zero classifier risk; it does not dilute
    /// sanitizer findings.
    fn combined_risk(
        &self,
        sanitization: &SanitizationResult,
        classification: Option<&InjectionClassification>,
    ) -> f64 {
        match classification {
            Some(c) => {
                let classifier_risk = if c.is_attack { c.confidence } else { 0.0 };
                (self.config.sanitizer_weight * sanitization.risk_score
                    + self.config.classifier_weight * classifier_risk)
                    .min(1.0)
            }
            None => sanitization.risk_score,
        }
    }
}

/// Time-based check identifier with a random hex suffix.
fn generate_check_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("chk-{}-{}", Utc::now().timestamp_millis(), suffix)
}
