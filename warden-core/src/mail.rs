use std::io::Write as _;
use std::process::{Command, Stdio};

use tracing::warn;

/// Composes and submits an RFC-5322 message with a plain body and an
/// optional `text/html` alternative. Submission failures are logged and
/// swallowed: a broken mail agent must not halt the pipeline.
#[derive(Debug, Clone)]
pub struct MailComposer {
    pub sendmail_argv: Vec<String>,
}

impl MailComposer {
    pub fn new(sendmail_argv: Vec<String>) -> Self {
        MailComposer { sendmail_argv }
    }

    pub fn send(&self, from: &str, to: &[String], subject: &str, plain_body: &str, html_body: Option<&str>) {
        let message = compose(from, to, subject, plain_body, html_body);
        let Some((program, args)) = self.sendmail_argv.split_first() else {
            warn!("no sendmail argv configured, dropping message");
            return;
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .spawn();
        match child {
            Ok(mut child) => {
                if let Some(stdin) = child.stdin.as_mut() {
                    if let Err(source) = stdin.write_all(message.as_bytes()) {
                        warn!(%source, "failed to write to sendmail stdin");
                    }
                }
                match child.wait() {
                    Ok(status) if !status.success() => {
                        warn!(code = ?status.code(), "sendmail exited non-zero");
                    }
                    Err(source) => warn!(%source, "failed to wait on sendmail"),
                    _ => {}
                }
            }
            Err(source) => warn!(%source, argv = ?self.sendmail_argv, "failed to spawn sendmail"),
        }
    }
}

fn compose(from: &str, to: &[String], subject: &str, plain_body: &str, html_body: Option<&str>) -> String {
    let to_header = to.join(", ");
    match html_body {
        None => format!(
            "From: {from}\r\nTo: {to_header}\r\nSubject: {subject}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{plain_body}\r\n"
        ),
        Some(html) => {
            let boundary = "warden-boundary-1973";
            format!(
                "From: {from}\r\nTo: {to_header}\r\nSubject: {subject}\r\nMIME-Version: 1.0\r\nContent-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n\
--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{plain_body}\r\n\
--{boundary}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}\r\n\
--{boundary}--\r\n"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_only_message_has_expected_headers() {
        let msg = compose("warden", &["hostmaster".to_string()], "subj", "body", None);
        assert!(msg.starts_with("From: warden\r\n"));
        assert!(msg.contains("To: hostmaster\r\n"));
        assert!(msg.contains("Subject: subj\r\n"));
        assert!(msg.ends_with("body\r\n"));
    }

    #[test]
    fn html_alternative_includes_both_parts() {
        let msg = compose(
            "warden",
            &["hostmaster".to_string()],
            "subj",
            "plain text",
            Some("<b>rich</b>"),
        );
        assert!(msg.contains("multipart/alternative"));
        assert!(msg.contains("plain text"));
        assert!(msg.contains("<b>rich</b>"));
    }
}
