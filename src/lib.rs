//! Content-security gate for AI-drafted email replies.
//!
//! Every untrusted inbound email and every generated outbound reply passes
//! through a four-layer defense before an auto-reply can exist:
//!
//! - **Sanitizer**: pattern-based scrubbing and risk scoring of raw text
//! - **Injection classifier**: conditional external second opinion on
//!   ambiguous content, failing open to human review
//! - **Spotlighter**: datamarking so the generator can tell untrusted data
//!   from instructions
//! - **Output validator**: leakage/exfiltration inspection of generated
//!   replies, with best-effort redaction
//!
//! [`SecurityPipeline`] sequences the layers and owns the thresholds. It is
//! a library-style gate: no ports, no files, no CLI. The mailbox, generator,
//! and draft-approval collaborators call it in-process and persist the
//! records it returns.

pub mod classifier;
pub mod email;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod risk;
pub mod sanitizer;
pub mod spotlight;

pub use classifier::{
    AttackTechnique, ClassifierConfig, ClassifierProvider, HttpClassifierConfig,
    HttpClassifierProvider, InjectionClassification, InjectionClassifier, quick_check,
};
pub use email::InboundEmail;
pub use error::ClassifierError;
pub use output::{
    OutputValidation, OutputValidator, ReplyKind, ReplyLimits, Violation, ViolationKind,
};
pub use pipeline::{OutputCheckResult, SecurityCheckResult, SecurityConfig, SecurityPipeline};
pub use risk::{RiskBand, Severity};
pub use sanitizer::{
    FlaggedPattern, PatternKind, SanitizationResult, Sanitizer, sanitize_sender,
    sanitize_subject,
};
pub use spotlight::{
    SecurePrompt, SpotlightedEmail, Spotlighter, is_properly_marked, remove_markers,
};
