//! Output validator: inspection of generated replies before sending.
//!
//! An independent entry point: the validator never needs an inbound check to
//! have happened. It runs its own rule catalog, disjoint from the
//! sanitizer's, because the threat on this side is different: a compromised
//! draft leaking instructions, credentials, or data, rather than hostile
//! input arriving.
//!
//! A reply is unsendable only on a critical violation; lower severities
//! degrade to a review flag. When violations exist, a best-effort redaction
//! pass produces a safe alternative.

use std::ops::Range;

use regex::Regex;
use serde::Serialize;

use crate::risk::{Severity, risk_score};
use crate::sanitizer::content_hash;
use crate::spotlight::ALL_MARKERS;

/// Category of an output violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// System-instruction phrasing leaked into the reply.
    SystemPromptLeak,
    /// An internal datamark token appeared verbatim. Proof of successful
    /// injection; these never occur in legitimate output.
    MarkerLeak,
    /// Credential-looking string.
    CredentialLeak,
    /// Internal model or vendor identifier.
    InternalIdentifierLeak,
    /// URL with exfiltration-shaped query parameters, a webhook-style host,
    /// or an explicit send/forward-to-address command.
    ExfiltrationAttempt,
    /// External URL not on the allow-list.
    ExternalUrlInclusion,
    /// PII-shaped string (national id, payment card).
    PiiDisclosure,
    /// Self-contradictory policy language.
    RefusalLanguage,
    /// Hallucination-hedging phrasing.
    HedgingLanguage,
    /// Reply outside the configured length bounds.
    LengthViolation,
}

/// A single violation found in generated text.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    /// Category of the rule that matched.
    pub kind: ViolationKind,
    /// Matched text, truncated for audit display.
    pub excerpt: String,
    /// Byte span in the generated text.
    pub span: Range<usize>,
    /// Severity of this violation.
    pub severity: Severity,
    /// Human-readable description.
    pub description: String,
}

/// Result of validating one generated reply. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct OutputValidation {
    /// False only when at least one critical violation exists.
    pub is_valid: bool,
    /// Every violation, ordered by position.
    pub violations: Vec<Violation>,
    /// Severity-weighted risk score in [0, 1].
    pub risk_score: f64,
    /// Best-effort redacted alternative, when any violation was redactable.
    pub redacted: Option<String>,
    /// Whether a human should approve before sending.
    pub requires_review: bool,
    /// SHA-256 of the final text (redacted when present), hex-encoded.
    pub content_hash: String,
}

/// Which sending path the reply is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Sent without a human in the loop.
    Automated,
    /// Queued for human review before sending.
    Reviewed,
}

/// Length bounds per sending path.
#[derive(Debug, Clone)]
pub struct ReplyLimits {
    /// Below this, the generation is degenerate.
    pub min_chars: usize,
    /// Ceiling for fully-automated replies.
    pub max_automated_chars: usize,
    /// Ceiling for human-reviewed replies.
    pub max_reviewed_chars: usize,
}

impl Default for ReplyLimits {
    fn default() -> Self {
        Self {
            min_chars: 10,
            max_automated_chars: 2_000,
            max_reviewed_chars: 10_000,
        }
    }
}

struct OutputRule {
    regex: Regex,
    kind: ViolationKind,
    severity: Severity,
    description: &'static str,
}

/// Validator for generated reply text.
pub struct OutputValidator {
    rules: Vec<OutputRule>,
    url_re: Regex,
    suspicious_query_re: Regex,
    card_candidate_re: Regex,
    allowed_domains: Vec<String>,
    limits: ReplyLimits,
}

/// Webhook/callback-style host fragments. A URL pointing at one of these is
/// exfiltration-shaped regardless of the allow-list.
const CALLBACK_HOST_FRAGMENTS: &[&str] = &[
    "webhook",
    "hooks.",
    "requestbin",
    "pipedream",
    "ngrok",
    "burpcollaborator",
    "interact.sh",
    "oastify",
    "canarytokens",
];

impl OutputValidator {
    /// Create a validator with the default catalog and the given allow-list.
    pub fn new(allowed_domains: Vec<String>, limits: ReplyLimits) -> Self {
        let rules = vec![
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(my|the|these) (system )?(instructions|prompt) (say|says|state|tell|told)\b",
                )
                .expect("invalid prompt-leak regex"),
                kind: ViolationKind::SystemPromptLeak,
                severity: Severity::Critical,
                description: "Reply paraphrases its system instructions",
            },
            OutputRule {
                regex: Regex::new(r"(?i)\byou draft replies to customer emails\b")
                    .expect("invalid prompt-leak regex"),
                kind: ViolationKind::SystemPromptLeak,
                severity: Severity::Critical,
                description: "Reply quotes its system instructions verbatim",
            },
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(api[_-]?key|secret|password|passwd|token|bearer)\b\s*[:=]\s*\S{6,}",
                )
                .expect("invalid credential regex"),
                kind: ViolationKind::CredentialLeak,
                severity: Severity::Critical,
                description: "Credential-looking assignment",
            },
            OutputRule {
                regex: Regex::new(r"\bAKIA[0-9A-Z]{16}\b").expect("invalid credential regex"),
                kind: ViolationKind::CredentialLeak,
                severity: Severity::Critical,
                description: "AWS access key shape",
            },
            OutputRule {
                regex: Regex::new(r"\bsk-[A-Za-z0-9]{20,}\b").expect("invalid credential regex"),
                kind: ViolationKind::CredentialLeak,
                severity: Severity::Critical,
                description: "Provider API key shape",
            },
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(gpt-\d[\w.-]*|claude[\w.-]*|gemini[\w.-]*|llama[\w.-]*|openai|anthropic|mistral)\b",
                )
                .expect("invalid identifier regex"),
                kind: ViolationKind::InternalIdentifierLeak,
                severity: Severity::Medium,
                description: "Internal model or vendor identifier",
            },
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(send|forward)\s+(this|it|them|a copy|the (details|conversation|thread))\s+to\s+[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+",
                )
                .expect("invalid send-command regex"),
                kind: ViolationKind::ExfiltrationAttempt,
                severity: Severity::Critical,
                description: "Embedded send/forward-to-address command",
            },
            OutputRule {
                regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("invalid ssn regex"),
                kind: ViolationKind::PiiDisclosure,
                severity: Severity::High,
                description: "National id number shape",
            },
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(i am not allowed to|i'm not allowed to|i can't|i cannot|i am unable to|i'm unable to)\b",
                )
                .expect("invalid refusal regex"),
                kind: ViolationKind::RefusalLanguage,
                severity: Severity::Low,
                description: "Self-contradictory policy language",
            },
            OutputRule {
                regex: Regex::new(
                    r"(?i)\b(as an ai( language)? model|i (do not|don't) have access to|i might be (wrong|mistaken))\b",
                )
                .expect("invalid hedging regex"),
                kind: ViolationKind::HedgingLanguage,
                severity: Severity::Low,
                description: "Hallucination-hedging phrasing",
            },
        ];

        Self {
            rules,
            url_re: Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("invalid url regex"),
            suspicious_query_re: Regex::new(
                r"(?i)(^|[?&])(data|payload|exfil|dump|secret|token|key|passwd|cred[a-z]*)=",
            )
            .expect("invalid query regex"),
            card_candidate_re: Regex::new(r"\b\d(?:[ -]?\d){12,18}\b")
                .expect("invalid card regex"),
            allowed_domains,
            limits,
        }
    }

    /// Validate a generated reply. Independent entry point; pure function.
    pub fn validate(&self, generated: &str) -> OutputValidation {
        self.validate_reply(generated, None)
    }

    /// Validate a generated reply, including the length check when the
    /// sending path is known.
    pub fn validate_reply(&self, generated: &str, kind: Option<ReplyKind>) -> OutputValidation {
        let mut violations = Vec::new();

        for rule in &self.rules {
            for mat in rule.regex.find_iter(generated) {
                violations.push(Violation {
                    kind: rule.kind,
                    excerpt: excerpt(generated, mat.start()..mat.end()),
                    span: mat.start()..mat.end(),
                    severity: rule.severity,
                    description: rule.description.to_string(),
                });
            }
        }

        self.scan_markers(generated, &mut violations);
        self.scan_urls(generated, &mut violations);
        self.scan_cards(generated, &mut violations);
        if let Some(kind) = kind {
            violations.extend(self.check_length(generated, kind));
        }

        violations.sort_by(|a, b| {
            a.span
                .start
                .cmp(&b.span.start)
                .then(b.severity.cmp(&a.severity))
        });

        let score = risk_score(violations.iter().map(|v| v.severity));
        let has_critical = violations
            .iter()
            .any(|v| v.severity == Severity::Critical);
        let redacted = redact(generated, &violations);
        let final_text = redacted.as_deref().unwrap_or(generated);

        OutputValidation {
            is_valid: !has_critical,
            risk_score: score,
            requires_review: !violations.is_empty(),
            content_hash: content_hash(final_text),
            redacted,
            violations,
        }
    }

    /// Enforce the length bounds for the given sending path.
    pub fn check_length(&self, generated: &str, kind: ReplyKind) -> Option<Violation> {
        let chars = generated.chars().count();
        let max = match kind {
            ReplyKind::Automated => self.limits.max_automated_chars,
            ReplyKind::Reviewed => self.limits.max_reviewed_chars,
        };

        if chars < self.limits.min_chars {
            return Some(Violation {
                kind: ViolationKind::LengthViolation,
                excerpt: generated.to_string(),
                span: 0..generated.len(),
                severity: Severity::Medium,
                description: format!(
                    "Reply has {} characters, below the minimum of {}",
                    chars, self.limits.min_chars
                ),
            });
        }
        if chars > max {
            return Some(Violation {
                kind: ViolationKind::LengthViolation,
                excerpt: excerpt(generated, 0..generated.len()),
                span: 0..generated.len(),
                severity: Severity::Medium,
                description: format!(
                    "Reply has {} characters, above the {:?} ceiling of {}",
                    chars, kind, max
                ),
            });
        }
        None
    }

    /// Any internal marker token in output is proof of successful injection.
    fn scan_markers(&self, generated: &str, violations: &mut Vec<Violation>) {
        for marker in ALL_MARKERS {
            for (start, matched) in generated.match_indices(marker) {
                violations.push(Violation {
                    kind: ViolationKind::MarkerLeak,
                    excerpt: matched.to_string(),
                    span: start..start + matched.len(),
                    severity: Severity::Critical,
                    description: "Internal datamark token leaked into reply".to_string(),
                });
            }
        }
    }

    fn scan_urls(&self, generated: &str, violations: &mut Vec<Violation>) {
        for mat in self.url_re.find_iter(generated) {
            let url = mat.as_str();
            let span = mat.start()..mat.end();
            let (location, query) = match url.split_once('?') {
                Some((loc, q)) => (loc, Some(q)),
                None => (url, None),
            };
            let host = location
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split(['/', ':'])
                .next()
                .unwrap_or("")
                .to_lowercase();

            // Exfiltration shape trumps the allow-list.
            if let Some(query) = query {
                if self.suspicious_query_re.is_match(query) {
                    violations.push(Violation {
                        kind: ViolationKind::ExfiltrationAttempt,
                        excerpt: excerpt(generated, span.clone()),
                        span,
                        severity: Severity::Critical,
                        description: "URL carries exfiltration-shaped query parameters"
                            .to_string(),
                    });
                    continue;
                }
            }
            if CALLBACK_HOST_FRAGMENTS.iter().any(|f| host.contains(f)) {
                violations.push(Violation {
                    kind: ViolationKind::ExfiltrationAttempt,
                    excerpt: excerpt(generated, span.clone()),
                    span,
                    severity: Severity::Critical,
                    description: "URL points at a webhook/callback-style host".to_string(),
                });
                continue;
            }
            if !self.is_allowed_host(&host) {
                violations.push(Violation {
                    kind: ViolationKind::ExternalUrlInclusion,
                    excerpt: excerpt(generated, span.clone()),
                    span,
                    severity: Severity::Medium,
                    description: "External URL not on the allow-list".to_string(),
                });
            }
        }
    }

    /// Card-number shapes are only flagged when the digits pass Luhn.
    fn scan_cards(&self, generated: &str, violations: &mut Vec<Violation>) {
        for mat in self.card_candidate_re.find_iter(generated) {
            let digits: String = mat.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
            if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
                violations.push(Violation {
                    kind: ViolationKind::PiiDisclosure,
                    excerpt: excerpt(generated, mat.start()..mat.end()),
                    span: mat.start()..mat.end(),
                    severity: Severity::High,
                    description: "Payment-card number shape (Luhn-valid)".to_string(),
                });
            }
        }
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_domains.iter().any(|domain| {
            let domain = domain.to_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }
}

/// Best-effort redaction: rewrite violating spans back-to-front so earlier
/// spans stay valid. Returns `None` when no violation is redactable.
fn redact(generated: &str, violations: &[Violation]) -> Option<String> {
    let mut targets: Vec<&Violation> = violations
        .iter()
        .filter(|v| replacement_for(v.kind).is_some())
        .collect();
    if targets.is_empty() {
        return None;
    }
    targets.sort_by(|a, b| b.span.start.cmp(&a.span.start));

    let mut out = generated.to_string();
    let mut next_start = usize::MAX;
    for violation in targets {
        if violation.span.end > next_start {
            continue;
        }
        let Some(replacement) = replacement_for(violation.kind) else {
            continue;
        };
        match replacement {
            Replacement::Placeholder(text) => {
                out.replace_range(violation.span.clone(), text);
            }
            Replacement::Annotate(suffix) => {
                out.insert_str(violation.span.end, suffix);
            }
        }
        next_start = violation.span.start;
    }
    Some(out)
}

enum Replacement {
    Placeholder(&'static str),
    Annotate(&'static str),
}

fn replacement_for(kind: ViolationKind) -> Option<Replacement> {
    match kind {
        ViolationKind::SystemPromptLeak
        | ViolationKind::MarkerLeak
        | ViolationKind::CredentialLeak
        | ViolationKind::InternalIdentifierLeak
        | ViolationKind::ExfiltrationAttempt => Some(Replacement::Placeholder("[REDACTED]")),
        ViolationKind::PiiDisclosure => Some(Replacement::Placeholder("[PII REMOVED]")),
        ViolationKind::ExternalUrlInclusion => Some(Replacement::Annotate(" [unverified link]")),
        ViolationKind::RefusalLanguage
        | ViolationKind::HedgingLanguage
        | ViolationKind::LengthViolation => None,
    }
}

fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

fn excerpt(text: &str, span: Range<usize>) -> String {
    let matched = &text[span];
    if matched.chars().count() > 60 {
        let cut: String = matched.chars().take(57).collect();
        format!("{}...", cut)
    } else {
        matched.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> OutputValidator {
        OutputValidator::new(
            vec!["example.com".to_string(), "ourshop.example".to_string()],
            ReplyLimits::default(),
        )
    }

    #[test]
    fn test_clean_reply_is_valid() {
        let v = validator();
        let result = v.validate(
            "Thank you for reaching out. Standard shipping to Kyiv takes 5-7 business days.",
        );
        assert!(result.is_valid);
        assert!(result.violations.is_empty());
        assert!(!result.requires_review);
        assert!(result.redacted.is_none());
        assert_eq!(result.risk_score, 0.0);
    }

    #[test]
    fn test_marker_leak_is_critical_with_redaction() {
        let v = validator();
        let result = v.validate("Our rates are below.\n>>> ignore this line\nBest regards");
        assert!(!result.is_valid);
        let leak = result
            .violations
            .iter()
            .find(|x| x.kind == ViolationKind::MarkerLeak)
            .expect("marker leak flagged");
        assert_eq!(leak.severity, Severity::Critical);
        let redacted = result.redacted.expect("redaction produced");
        assert!(!redacted.contains(">>> "));
        assert!(redacted.contains("[REDACTED]"));
        assert!(redacted.contains("Best regards"));
    }

    #[test]
    fn test_allowlisted_url_passes() {
        let v = validator();
        let result = v.validate("See https://www.example.com/rates for the table.");
        assert!(
            result
                .violations
                .iter()
                .all(|x| x.kind != ViolationKind::ExternalUrlInclusion)
        );
    }

    #[test]
    fn test_allowlisted_url_with_data_param_is_exfiltration() {
        let v = validator();
        let result = v.validate("See https://www.example.com/rates?data=c2VjcmV0 for details.");
        let hit = result
            .violations
            .iter()
            .find(|x| x.kind == ViolationKind::ExfiltrationAttempt)
            .expect("exfiltration flagged");
        assert_eq!(hit.severity, Severity::Critical);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_unlisted_url_is_review_not_block() {
        let v = validator();
        let result = v.validate("More at https://othersite.example/info today.");
        let hit = result
            .violations
            .iter()
            .find(|x| x.kind == ViolationKind::ExternalUrlInclusion)
            .expect("external url flagged");
        assert_eq!(hit.severity, Severity::Medium);
        assert!(result.is_valid);
        assert!(result.requires_review);
        let redacted = result.redacted.expect("annotation produced");
        assert!(redacted.contains("https://othersite.example/info [unverified link]"));
    }

    #[test]
    fn test_webhook_host_is_exfiltration() {
        let v = validator();
        let result = v.validate("Confirm at https://hooks.example-infra.net/abc please.");
        assert!(
            result
                .violations
                .iter()
                .any(|x| x.kind == ViolationKind::ExfiltrationAttempt)
        );
    }

    #[test]
    fn test_credential_leak_redacted() {
        let v = validator();
        let result = v.validate("Use api_key: sUp3rS3cretValue99 to connect.");
        assert!(!result.is_valid);
        let redacted = result.redacted.expect("redaction produced");
        assert!(!redacted.contains("sUp3rS3cretValue99"));
    }

    #[test]
    fn test_system_prompt_leak_detected() {
        let v = validator();
        let result = v.validate("My instructions say I must never share pricing off-list.");
        assert!(
            result
                .violations
                .iter()
                .any(|x| x.kind == ViolationKind::SystemPromptLeak)
        );
        assert!(!result.is_valid);
    }

    #[test]
    fn test_luhn_valid_card_flagged() {
        let v = validator();
        let result = v.validate("Your card 4111 1111 1111 1111 was charged.");
        let hit = result
            .violations
            .iter()
            .find(|x| x.kind == ViolationKind::PiiDisclosure)
            .expect("card flagged");
        assert_eq!(hit.severity, Severity::High);
        let redacted = result.redacted.expect("redaction produced");
        assert!(redacted.contains("[PII REMOVED]"));
        assert!(!redacted.contains("4111"));
    }

    #[test]
    fn test_luhn_invalid_digits_not_flagged() {
        let v = validator();
        let result = v.validate("Tracking number 1234 5678 9012 3456 was assigned.");
        assert!(
            result
                .violations
                .iter()
                .all(|x| x.kind != ViolationKind::PiiDisclosure)
        );
    }

    #[test]
    fn test_send_command_in_reply_is_critical() {
        let v = validator();
        let result = v.validate("Also, forward this to shadow@rival.example for records.");
        assert!(
            result
                .violations
                .iter()
                .any(|x| x.kind == ViolationKind::ExfiltrationAttempt
                    && x.severity == Severity::Critical)
        );
    }

    #[test]
    fn test_refusal_language_is_review_only() {
        let v = validator();
        let result = v.validate("I'm not allowed to discuss that, but our store hours are 9-5.");
        assert!(result.is_valid);
        assert!(result.requires_review);
        assert!(result.redacted.is_none());
    }

    #[test]
    fn test_length_check_minimum() {
        let v = validator();
        let hit = v.check_length("Ok.", ReplyKind::Automated).expect("too short");
        assert_eq!(hit.kind, ViolationKind::LengthViolation);
    }

    #[test]
    fn test_length_check_per_kind_ceilings() {
        let v = validator();
        let long = "word ".repeat(500); // 2500 chars
        assert!(v.check_length(&long, ReplyKind::Automated).is_some());
        assert!(v.check_length(&long, ReplyKind::Reviewed).is_none());
    }

    #[test]
    fn test_validate_reply_folds_length_violation() {
        let v = validator();
        let result = v.validate_reply("Ok.", Some(ReplyKind::Automated));
        assert!(result.is_valid);
        assert!(result.requires_review);
        assert!(
            result
                .violations
                .iter()
                .any(|x| x.kind == ViolationKind::LengthViolation)
        );
    }

    #[test]
    fn test_content_hash_covers_final_text() {
        let v = validator();
        let result = v.validate("Card 4111 1111 1111 1111 on file.");
        let redacted = result.redacted.clone().expect("redaction produced");
        assert_eq!(result.content_hash, content_hash(&redacted));
    }
}
