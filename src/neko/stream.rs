//! Streaming reply parser.
//!
//! The reply endpoint answers with a line-oriented body. Content lines are
//! `data: {json}`; a bare JSON line carries an out-of-band error. Content
//! objects come in two shapes:
//!
//! ```text
//! data: {"v":"Hello"}                          plain text
//! data: {"c":[{"v":"A"},{"v":"B","c":1}]}      one entry per branch
//! data: {"msg_id":"..."}                       id of the assistant message
//! {"code":"chat_choice_shown"}                 previous branch never picked
//! ```
//!
//! Only branch 0 (explicit or implied) is kept. A line that fails to decode
//! is skipped so one bad line never costs the whole answer.
//!
//! [`ReplyAssembler`] is the pure line state machine; [`read_reply`] drives it
//! over any `AsyncBufRead`; [`NekoClient::stream_reply`] wires in HTTP.

use std::io;

use futures::TryStreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, trace, warn};

use crate::neko::{NekoClient, NekoError};

/// Marker in front of every content line.
pub const STREAM_PREFIX: &str = "data: ";

/// Error code sent when the previous turn's branch was never selected.
pub const BRANCH_UNSELECTED_CODE: &str = "chat_choice_shown";

pub const BRANCH_UNSELECTED_REPLY: &str = "⚠️ 检测到对话分支未选择，请重试或新建会话。";
pub const STREAM_FAILED_REPLY: &str = "请求失败，请稍后再试。";

/// Branch index the service treats as the default answer.
pub const DEFAULT_BRANCH: u64 = 0;

// ── Decoded lines ─────────────────────────────────────────────────────────────

/// One entry of a multi-branch fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchChoice {
    pub index: u64,
    pub text: Option<String>,
}

/// Content of one decoded stream object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Error envelope: a string `code` and no content.
    Error { code: String },
    /// `c` list. Entries whose index is not an unsigned integer are dropped.
    Branch(Vec<BranchChoice>),
    /// Direct `v` text.
    Plain(String),
    /// Valid object with nothing we use (besides, possibly, `msg_id`).
    Unrecognized,
}

/// A decoded object plus its message id update.
///
/// `msg_id` is `None` when the object has no `msg_id` field and
/// `Some(None)` when the field is present but unusable (`null`, `""`, other
/// shapes), which clears the pending id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub msg_id: Option<Option<String>>,
    pub event: StreamEvent,
}

/// Decode the remainder of a `data: ` line. `None` when it is empty or not
/// a JSON object.
pub fn decode_data_line(payload: &str) -> Option<StreamFrame> {
    if payload.trim().is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    let obj = value.as_object()?;

    let msg_id = obj.get("msg_id").map(|id| match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    let code = match obj.get("code") {
        Some(Value::String(code)) => Some(code),
        _ => None,
    };

    // The unselected-branch code wins over any content on the same line,
    // then `c` as a list over `v`, then other codes.
    let event = if let Some(code) = code.filter(|c| c.as_str() == BRANCH_UNSELECTED_CODE) {
        StreamEvent::Error { code: code.clone() }
    } else if let Some(Value::Array(choices)) = obj.get("c") {
        StreamEvent::Branch(choices.iter().filter_map(decode_choice).collect())
    } else if let Some(Value::String(text)) = obj.get("v") {
        StreamEvent::Plain(text.clone())
    } else if let Some(code) = code {
        StreamEvent::Error { code: code.clone() }
    } else {
        StreamEvent::Unrecognized
    };

    Some(StreamFrame { msg_id, event })
}

/// Decode a line without the stream marker. Only error envelopes matter here.
pub fn decode_bare_line(line: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value.get("code") {
        Some(Value::String(code)) => Some(StreamEvent::Error { code: code.clone() }),
        _ => None,
    }
}

fn decode_choice(choice: &Value) -> Option<BranchChoice> {
    let index = match choice.get("c") {
        None => DEFAULT_BRANCH,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(i) => i,
            None if n.as_f64() == Some(0.0) => DEFAULT_BRANCH,
            None => return None,
        },
        Some(_) => return None,
    };
    let text = match choice.get("v") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    Some(BranchChoice { index, text })
}

// ── Assembler ─────────────────────────────────────────────────────────────────

/// What the caller should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// Stop reading; the reply is replaced by [`BRANCH_UNSELECTED_REPLY`].
    BranchUnselected,
}

/// Result of a fully read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Reply { text: String, message_id: Option<String> },
    BranchUnselected,
}

/// Accumulates reply text and the last message id, one line at a time.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    text: String,
    message_id: Option<String>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Process one line (without its terminator).
    pub fn feed_line(&mut self, line: &str) -> LineOutcome {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return LineOutcome::Continue;
        }

        let Some(payload) = line.strip_prefix(STREAM_PREFIX) else {
            return match decode_bare_line(line) {
                Some(StreamEvent::Error { code }) => self.on_error(&code),
                _ => {
                    trace!(line, "ignoring unprefixed line");
                    LineOutcome::Continue
                }
            };
        };

        let Some(frame) = decode_data_line(payload) else {
            debug!(payload, "skipping undecodable stream line");
            return LineOutcome::Continue;
        };

        if let Some(update) = frame.msg_id {
            self.message_id = update;
        }

        match frame.event {
            StreamEvent::Branch(choices) => {
                for choice in choices {
                    if choice.index == DEFAULT_BRANCH
                        && let Some(text) = choice.text
                    {
                        self.text.push_str(&text);
                    }
                }
                LineOutcome::Continue
            }
            StreamEvent::Plain(text) => {
                self.text.push_str(&text);
                LineOutcome::Continue
            }
            StreamEvent::Error { code } => self.on_error(&code),
            StreamEvent::Unrecognized => LineOutcome::Continue,
        }
    }

    fn on_error(&self, code: &str) -> LineOutcome {
        if code == BRANCH_UNSELECTED_CODE {
            LineOutcome::BranchUnselected
        } else {
            warn!(code, "ignoring stream error event");
            LineOutcome::Continue
        }
    }

    pub fn finish(self) -> StreamOutcome {
        StreamOutcome::Reply {
            text: self.text,
            message_id: self.message_id,
        }
    }
}

/// Drive a [`ReplyAssembler`] over `reader` until EOF or a terminal event.
///
/// Lines are decoded lossily; invalid UTF-8 only spoils the line it is on.
pub async fn read_reply<R>(mut reader: R) -> io::Result<StreamOutcome>
where
    R: AsyncBufRead + Unpin,
{
    let mut assembler = ReplyAssembler::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let line = String::from_utf8_lossy(raw);
        if assembler.feed_line(&line) == LineOutcome::BranchUnselected {
            return Ok(StreamOutcome::BranchUnselected);
        }
    }

    Ok(assembler.finish())
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

impl NekoClient {
    /// Send `text` to `conversation_id` and return the assembled reply.
    ///
    /// Never fails: transport errors become [`STREAM_FAILED_REPLY`] and an
    /// unselected-branch error becomes [`BRANCH_UNSELECTED_REPLY`]. When the
    /// stream announced a message id, branch 0 is confirmed before returning.
    pub async fn stream_reply(&self, conversation_id: &str, text: &str) -> String {
        let outcome = match self.read_stream(conversation_id, text).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%conversation_id, error = %e, "reply stream failed");
                return STREAM_FAILED_REPLY.to_string();
            }
        };

        match outcome {
            StreamOutcome::BranchUnselected => {
                warn!(%conversation_id, "service reports unselected branch");
                BRANCH_UNSELECTED_REPLY.to_string()
            }
            StreamOutcome::Reply { text, message_id } => {
                debug!(%conversation_id, reply_len = text.len(), ?message_id, "reply stream complete");
                if let Some(id) = message_id {
                    // The reply is already complete; a failure here only
                    // affects the next turn, which will report it.
                    if let Err(e) = self.confirm_default_branch(&id).await {
                        warn!(msg_id = %id, error = %e, "branch confirmation failed");
                    }
                }
                text
            }
        }
    }

    async fn read_stream(&self, conversation_id: &str, text: &str) -> Result<StreamOutcome, NekoError> {
        // Status is not checked: error envelopes arrive as bare body lines.
        let response = self.open_stream(conversation_id, text).await?;
        let body = response.bytes_stream().map_err(io::Error::other);
        let reader = StreamReader::new(Box::pin(body));

        read_reply(reader)
            .await
            .map_err(|e| NekoError::Request(format!("stream read failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(lines: &[&str]) -> StreamOutcome {
        let mut asm = ReplyAssembler::new();
        for line in lines {
            if asm.feed_line(line) == LineOutcome::BranchUnselected {
                return StreamOutcome::BranchUnselected;
            }
        }
        asm.finish()
    }

    fn reply(text: &str, message_id: Option<&str>) -> StreamOutcome {
        StreamOutcome::Reply {
            text: text.to_string(),
            message_id: message_id.map(str::to_string),
        }
    }

    #[test]
    fn plain_fragments_concatenate_in_order() {
        let out = assemble(&[r#"data: {"v":"Hi"}"#, r#"data: {"v":" there"}"#]);
        assert_eq!(out, reply("Hi there", None));
    }

    #[test]
    fn only_default_branch_is_kept() {
        let out = assemble(&[r#"data: {"c":[{"v":"A"},{"v":"B","c":1}]}"#]);
        assert_eq!(out, reply("A", None));
    }

    #[test]
    fn non_default_branch_never_leaks_regardless_of_position() {
        let out = assemble(&[
            r#"data: {"c":[{"v":"x","c":1},{"v":"a","c":0}]}"#,
            r#"data: {"c":[{"v":"y","c":2},{"v":"b"}]}"#,
            r#"data: {"v":"c"}"#,
        ]);
        assert_eq!(out, reply("abc", None));
    }

    #[test]
    fn choice_without_text_is_skipped() {
        let out = assemble(&[r#"data: {"c":[{"c":0},{"v":"ok"}]}"#]);
        assert_eq!(out, reply("ok", None));
    }

    #[test]
    fn branch_list_takes_precedence_over_plain_text() {
        let out = assemble(&[r#"data: {"c":[{"v":"branch"}],"v":"plain"}"#]);
        assert_eq!(out, reply("branch", None));
    }

    #[test]
    fn non_list_branch_field_falls_back_to_plain() {
        let out = assemble(&[r#"data: {"c":3,"v":"plain"}"#]);
        assert_eq!(out, reply("plain", None));
    }

    #[test]
    fn non_text_value_is_ignored() {
        let out = assemble(&[r#"data: {"v":5}"#, r#"data: {"v":"t"}"#]);
        assert_eq!(out, reply("t", None));
    }

    #[test]
    fn malformed_line_changes_nothing() {
        let out = assemble(&[
            r#"data: {"v":"a","msg_id":"m1"}"#,
            r#"data: {"v":"b","msg_id":"m2""#,
            "data: not json",
            "data: ",
            "data:    ",
            r#"data: ["v"]"#,
        ]);
        assert_eq!(out, reply("a", Some("m1")));
    }

    #[test]
    fn last_message_id_wins() {
        let out = assemble(&[
            r#"data: {"msg_id":"user-msg"}"#,
            r#"data: {"v":"x"}"#,
            r#"data: {"msg_id":"assist-msg","v":"y"}"#,
        ]);
        assert_eq!(out, reply("xy", Some("assist-msg")));
    }

    #[test]
    fn bare_sentinel_discards_accumulated_text() {
        let out = assemble(&[
            r#"data: {"v":"partial"}"#,
            r#"{"code":"chat_choice_shown"}"#,
            r#"data: {"v":"after"}"#,
        ]);
        assert_eq!(out, StreamOutcome::BranchUnselected);
    }

    #[test]
    fn prefixed_sentinel_also_terminates() {
        let out = assemble(&[r#"data: {"code":"chat_choice_shown"}"#]);
        assert_eq!(out, StreamOutcome::BranchUnselected);
    }

    #[test]
    fn prefixed_sentinel_beats_content_on_the_same_line() {
        let mut asm = ReplyAssembler::new();
        assert_eq!(
            asm.feed_line(r#"data: {"code":"chat_choice_shown","v":"x"}"#),
            LineOutcome::BranchUnselected
        );
        let out = assemble(&[
            r#"data: {"v":"partial"}"#,
            r#"data: {"code":"chat_choice_shown","c":[{"v":"y"}]}"#,
        ]);
        assert_eq!(out, StreamOutcome::BranchUnselected);
    }

    #[test]
    fn other_codes_do_not_hide_content() {
        let out = assemble(&[r#"data: {"code":"warn","v":"still here"}"#]);
        assert_eq!(out, reply("still here", None));
    }

    #[test]
    fn null_or_empty_message_id_clears_pending_id() {
        let mut asm = ReplyAssembler::new();
        asm.feed_line(r#"data: {"msg_id":"m1"}"#);
        assert_eq!(asm.message_id(), Some("m1"));
        asm.feed_line(r#"data: {"msg_id":null,"v":"x"}"#);
        assert_eq!(asm.message_id(), None);

        let out = assemble(&[r#"data: {"msg_id":"m1","v":"a"}"#, r#"data: {"msg_id":""}"#]);
        assert_eq!(out, reply("a", None));
    }

    #[test]
    fn absent_message_id_keeps_pending_id() {
        let out = assemble(&[r#"data: {"msg_id":"m1"}"#, r#"data: {"v":"x"}"#]);
        assert_eq!(out, reply("x", Some("m1")));
    }

    #[test]
    fn other_bare_lines_are_ignored() {
        let out = assemble(&[
            r#"{"code":"something_else"}"#,
            r#"{"v":"not prefixed"}"#,
            "event: ping",
            "data:{\"v\":\"no space\"}",
            "",
            "   ",
            r#"data: {"v":"kept"}"#,
        ]);
        assert_eq!(out, reply("kept", None));
    }

    #[test]
    fn crlf_terminators_are_tolerated() {
        let out = assemble(&["data: {\"v\":\"a\"}\r", "\r", "{\"code\":\"x\"}\r"]);
        assert_eq!(out, reply("a", None));
    }

    #[test]
    fn empty_stream_yields_empty_reply() {
        assert_eq!(assemble(&[]), reply("", None));
    }

    #[test]
    fn decode_data_line_shapes() {
        assert_eq!(
            decode_data_line(r#"{"v":"x"}"#),
            Some(StreamFrame { msg_id: None, event: StreamEvent::Plain("x".into()) })
        );
        assert_eq!(
            decode_data_line(r#"{"msg_id":7}"#),
            Some(StreamFrame { msg_id: Some(Some("7".into())), event: StreamEvent::Unrecognized })
        );
        assert_eq!(
            decode_data_line(r#"{"c":[{"v":"a","c":"1"},{"v":"b","c":1}]}"#),
            Some(StreamFrame {
                msg_id: None,
                event: StreamEvent::Branch(vec![BranchChoice { index: 1, text: Some("b".into()) }]),
            })
        );
        assert_eq!(
            decode_data_line(r#"{"code":"oops"}"#).map(|f| f.event),
            Some(StreamEvent::Error { code: "oops".into() })
        );
        assert_eq!(
            decode_data_line(r#"{"msg_id":null}"#),
            Some(StreamFrame { msg_id: Some(None), event: StreamEvent::Unrecognized })
        );
        assert!(decode_data_line("").is_none());
        assert!(decode_data_line("[1,2]").is_none());
    }

    #[test]
    fn float_zero_index_counts_as_default() {
        let out = assemble(&[r#"data: {"c":[{"v":"z","c":0.0}]}"#]);
        assert_eq!(out, reply("z", None));
    }

    #[tokio::test]
    async fn read_reply_over_bytes() {
        let body: &[u8] = b"data: {\"v\":\"Hi\"}\r\n\r\ndata: {\"v\":\" there\",\"msg_id\":\"m\"}\n";
        let out = read_reply(body).await.unwrap();
        assert_eq!(out, reply("Hi there", Some("m")));
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_lose_the_answer() {
        let body: &[u8] = b"data: {\"v\":\"good\"}\ngarbage\xff\ndata: {\"v\":\" answer\"}\n";
        let out = read_reply(body).await.unwrap();
        assert_eq!(out, reply("good answer", None));
    }

    #[tokio::test]
    async fn invalid_utf8_inside_text_is_replaced() {
        let body: &[u8] = b"data: {\"v\":\"a\xfe\"}\ndata: {\"v\":\"b\"}";
        let out = read_reply(body).await.unwrap();
        assert_eq!(out, reply("a\u{FFFD}b", None));
    }

    #[tokio::test]
    async fn read_reply_stops_at_sentinel() {
        let body: &[u8] = b"data: {\"v\":\"x\"}\n{\"code\":\"chat_choice_shown\"}\ngarbage\xff\n";
        let out = read_reply(body).await.unwrap();
        assert_eq!(out, StreamOutcome::BranchUnselected);
    }

    mod http {
        use super::super::*;
        use crate::config::{Credentials, NekoConfig};
        use serde_json::json;
        use wiremock::matchers::{body_json, body_string, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn client_for(server: &MockServer) -> NekoClient {
            let creds = Credentials { token: Some("tok".into()), cookie: Some("sid=1".into()) };
            NekoClient::new(&NekoConfig::with_base_url(server.uri()), creds).unwrap()
        }

        #[tokio::test]
        async fn stream_reply_assembles_and_confirms_branch() {
            let server = MockServer::start().await;
            let body = concat!(
                "data: {\"msg_id\":\"m1\"}\n",
                "data: {\"c\":[{\"v\":\"Hel\"},{\"v\":\"nope\",\"c\":1}]}\n",
                "data: {\"v\":\"lo\"}\n",
                "data: {\"msg_id\":\"m2\"}\n",
            );
            Mock::given(method("POST"))
                .and(path("/msg/conv-1/stream"))
                .and(header("x-token", "tok"))
                .and(header("cookie", "sid=1"))
                .and(header("content-type", "text/plain"))
                .and(body_string(r#"{"contents":["你好"]}"#))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/msg/select-choice"))
                .and(body_json(json!({"msg_id": "m2", "choice_idx": 0})))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let reply = client_for(&server).stream_reply("conv-1", "你好").await;
            assert_eq!(reply, "Hello");
        }

        #[tokio::test]
        async fn no_message_id_means_no_confirmation() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/msg/conv/stream"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("data: {\"v\":\"Hi\"}\ndata: {\"v\":\" there\"}\n"),
                )
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/msg/select-choice"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            assert_eq!(client_for(&server).stream_reply("conv", "hi").await, "Hi there");
        }

        #[tokio::test]
        async fn binary_garbage_line_keeps_reply() {
            let server = MockServer::start().await;
            let mut body = b"data: {\"v\":\"Hel\"}\n".to_vec();
            body.extend_from_slice(&[0xff, 0xfe, 0x00, 0x80, b'\n']);
            body.extend_from_slice(b"data: {\"v\":\"lo\",\"msg_id\":\"m\"}\n");
            body.extend_from_slice(b"data: {\"msg_id\":null}\n");
            Mock::given(method("POST"))
                .and(path("/msg/conv/stream"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/msg/select-choice"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            assert_eq!(client_for(&server).stream_reply("conv", "hi").await, "Hello");
        }

        #[tokio::test]
        async fn error_status_body_is_still_parsed() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/msg/conv/stream"))
                .respond_with(
                    ResponseTemplate::new(400).set_body_string(r#"{"code":"chat_choice_shown"}"#),
                )
                .mount(&server)
                .await;

            assert_eq!(
                client_for(&server).stream_reply("conv", "hi").await,
                BRANCH_UNSELECTED_REPLY
            );
        }

        #[tokio::test]
        async fn failed_confirmation_keeps_reply() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/msg/conv/stream"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string("data: {\"v\":\"ok\",\"msg_id\":\"m\"}\n"),
                )
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/msg/select-choice"))
                .respond_with(ResponseTemplate::new(500))
                .expect(1)
                .mount(&server)
                .await;

            assert_eq!(client_for(&server).stream_reply("conv", "hi").await, "ok");
        }

        #[tokio::test]
        async fn transport_failure_returns_fixed_message() {
            let client = NekoClient::new(
                &NekoConfig::with_base_url("http://127.0.0.1:1"),
                Credentials::default(),
            )
            .unwrap();
            assert_eq!(client.stream_reply("conv", "hi").await, STREAM_FAILED_REPLY);
        }
    }
}
