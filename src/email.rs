//! Inbound email as handed over by the mailbox collaborator.
//!
//! The mailbox/parsing side owns IMAP and MIME; only the parsed plain-text
//! fields cross this boundary.

use serde::Serialize;

/// A parsed inbound email awaiting the inbound security check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundEmail {
    /// Subject line as decoded by the parser.
    pub subject: String,
    /// Sender address (the envelope/From address).
    pub from_addr: String,
    /// Optional sender display name.
    pub from_name: Option<String>,
    /// Plain-text body.
    pub body: String,
    /// Selected header name/value pairs, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Attachment filenames (content never crosses this boundary).
    pub attachment_names: Vec<String>,
}

impl InboundEmail {
    /// Create an email from the minimal field set.
    pub fn new(
        subject: impl Into<String>,
        from_addr: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            from_addr: from_addr.into(),
            from_name: None,
            body: body.into(),
            headers: Vec::new(),
            attachment_names: Vec::new(),
        }
    }

    /// Set the sender display name.
    pub fn with_from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    /// Attach header pairs.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Attach attachment filenames.
    pub fn with_attachment_names(mut self, names: Vec<String>) -> Self {
        self.attachment_names = names;
        self
    }
}
