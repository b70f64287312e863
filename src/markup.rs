//! Call-control markup returned to the SMS/voice provider.
//!
//! Webhook responses are a minimal XML body describing the next action
//! (reply / say / dial / record / hangup). Only the subset this engine emits
//! is modeled; rendering is by hand since the vocabulary is tiny and fixed.

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Render the SMS webhook reply body containing a single message.
pub fn sms_reply(message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
        escape(message)
    )
}

/// Recording behavior for a `<Dial>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialRecord {
    Off,
    FromAnswer,
}

/// One voice call-control action.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceAction {
    Say(String),
    Dial {
        number: String,
        caller_id: Option<String>,
        /// Webhook invoked with the dial outcome.
        action_url: Option<String>,
        timeout_seconds: Option<u32>,
        record: DialRecord,
    },
    Record {
        action_url: String,
        max_length_seconds: u32,
        timeout_seconds: u32,
    },
    Hangup,
}

/// Ordered list of actions the provider executes for one call leg.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceResponse {
    actions: Vec<VoiceAction>,
}

impl VoiceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, message: &str) -> Self {
        self.actions.push(VoiceAction::Say(message.to_string()));
        self
    }

    pub fn dial(mut self, action: VoiceAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn record(mut self, action_url: &str, max_length_seconds: u32, timeout_seconds: u32) -> Self {
        self.actions.push(VoiceAction::Record {
            action_url: action_url.to_string(),
            max_length_seconds,
            timeout_seconds,
        });
        self
    }

    pub fn hangup(mut self) -> Self {
        self.actions.push(VoiceAction::Hangup);
        self
    }

    /// An apology followed by a hangup — the terminal safe response.
    pub fn apologize_and_hangup(message: &str) -> Self {
        Self::new().say(message).hangup()
    }

    pub fn to_xml(&self) -> String {
        let mut body = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>");
        for action in &self.actions {
            match action {
                VoiceAction::Say(text) => {
                    body.push_str(&format!("<Say>{}</Say>", escape(text)));
                }
                VoiceAction::Dial {
                    number,
                    caller_id,
                    action_url,
                    timeout_seconds,
                    record,
                } => {
                    body.push_str("<Dial");
                    if let Some(cid) = caller_id {
                        body.push_str(&format!(" callerId=\"{}\"", escape(cid)));
                    }
                    if let Some(url) = action_url {
                        body.push_str(&format!(" action=\"{}\" method=\"POST\"", escape(url)));
                    }
                    if let Some(t) = timeout_seconds {
                        body.push_str(&format!(" timeout=\"{t}\""));
                    }
                    if *record == DialRecord::FromAnswer {
                        body.push_str(" record=\"record-from-answer\"");
                    }
                    body.push_str(&format!("><Number>{}</Number></Dial>", escape(number)));
                }
                VoiceAction::Record {
                    action_url,
                    max_length_seconds,
                    timeout_seconds,
                } => {
                    body.push_str(&format!(
                        "<Record action=\"{}\" method=\"POST\" maxLength=\"{}\" playBeep=\"true\" timeout=\"{}\"/>",
                        escape(action_url),
                        max_length_seconds,
                        timeout_seconds
                    ));
                }
                VoiceAction::Hangup => body.push_str("<Hangup/>"),
            }
        }
        body.push_str("</Response>");
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_reply_escapes_content() {
        let xml = sms_reply("a < b & c > d");
        assert!(xml.contains("<Message>a &lt; b &amp; c &gt; d</Message>"));
        assert!(xml.starts_with("<?xml"));
    }

    #[test]
    fn say_then_hangup() {
        let xml = VoiceResponse::apologize_and_hangup("We could not verify this call session.").to_xml();
        assert!(xml.contains("<Say>We could not verify this call session.</Say><Hangup/>"));
    }

    #[test]
    fn dial_renders_all_attributes() {
        let xml = VoiceResponse::new()
            .say("Please hold.")
            .dial(VoiceAction::Dial {
                number: "+14155550100".into(),
                caller_id: Some("+14155550199".into()),
                action_url: Some("https://x.test/dial-complete?callLogId=abc".into()),
                timeout_seconds: Some(20),
                record: DialRecord::FromAnswer,
            })
            .to_xml();
        assert!(xml.contains("callerId=\"+14155550199\""));
        assert!(xml.contains("action=\"https://x.test/dial-complete?callLogId=abc\" method=\"POST\""));
        assert!(xml.contains("timeout=\"20\""));
        assert!(xml.contains("record=\"record-from-answer\""));
        assert!(xml.contains("<Number>+14155550100</Number>"));
    }

    #[test]
    fn record_renders_beep_and_limits() {
        let xml = VoiceResponse::new()
            .say("Leave a message after the tone.")
            .record("https://x.test/voicemail-complete?callLogId=abc", 180, 5)
            .hangup()
            .to_xml();
        assert!(xml.contains("maxLength=\"180\""));
        assert!(xml.contains("playBeep=\"true\""));
        assert!(xml.contains("timeout=\"5\""));
    }
}
