use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

pub const STUB_MODEL: &str = "gemini-stub";

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// Answers with a complete lecture for the requested section.
    Lecture,
    /// Answers 200 with text that is not a lecture object.
    Garbage,
    RateLimited,
    InvalidKey,
}

pub struct GeminiStub {
    pub base_url: String,
    keys_seen: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GeminiStub {
    pub fn spawn(behavior: StubBehavior) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start gemini stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1beta");
        let expected_path = format!("/v1beta/models/{STUB_MODEL}:generateContent");

        let keys_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&keys_seen);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.method() != &tiny_http::Method::Post || request.url() != expected_path {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let api_key = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("x-goog-api-key"))
                    .map(|h| h.value.as_str().to_owned())
                    .unwrap_or_default();
                seen.lock().unwrap().push(api_key);

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let (status, response_body) = match behavior {
                    StubBehavior::RateLimited => (
                        429,
                        error_body(429, "Resource has been exhausted", "RESOURCE_EXHAUSTED"),
                    ),
                    StubBehavior::InvalidKey => (
                        400,
                        serde_json::json!({
                            "error": {
                                "code": 400,
                                "message": "API key not valid. Please pass a valid API key.",
                                "status": "INVALID_ARGUMENT",
                                "details": [ { "reason": "API_KEY_INVALID" } ]
                            }
                        }),
                    ),
                    StubBehavior::Garbage => (200, candidate_body("I cannot help with that.")),
                    StubBehavior::Lecture => match lecture_response(&body) {
                        Ok(text) => (200, candidate_body(&text)),
                        Err(err) => (
                            400,
                            error_body(400, &format!("{err:#}"), "INVALID_ARGUMENT"),
                        ),
                    },
                };

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            keys_seen,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[allow(dead_code)]
    pub fn keys_seen(&self) -> Vec<String> {
        self.keys_seen.lock().unwrap().clone()
    }
}

impl Drop for GeminiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn candidate_body(text: &str) -> Value {
    serde_json::json!({
        "candidates": [
            {
                "content": { "role": "model", "parts": [ { "text": text } ] },
                "finishReason": "STOP"
            }
        ],
        "modelVersion": STUB_MODEL
    })
}

fn error_body(code: u16, message: &str, status: &str) -> Value {
    serde_json::json!({ "error": { "code": code, "message": message, "status": status } })
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}

fn lecture_response(body: &str) -> anyhow::Result<String> {
    let request: Value = serde_json::from_str(body).context("parse request json")?;
    let prompt = request
        .pointer("/contents/0/parts/0/text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing prompt text"))?;

    let raw = extract_between(prompt, "BEGIN_SECTION_CONTEXT_JSON", "END_SECTION_CONTEXT_JSON")
        .ok_or_else(|| anyhow::anyhow!("missing section context markers"))?;
    let context: Value = serde_json::from_str(raw).context("parse section context")?;
    let title = context
        .pointer("/section/title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing section title"))?;
    let minutes = context
        .pointer("/section/duration_minutes")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow::anyhow!("missing section duration"))?;

    let lecture = serde_json::json!({
        "spoken_script": {
            "script_parts": [
                { "part_type": "intro", "duration": minutes * 0.2, "script": format!("{title}を始めます。"), "speaker_notes": ["ゆっくり話す"] },
                { "part_type": "body", "duration": minutes * 0.6, "script": format!("**{title}**の本編です。"), "speaker_notes": ["図を示す"] },
                { "part_type": "summary", "duration": minutes * 0.2, "script": format!("{title}のまとめです。"), "speaker_notes": ["復習"] }
            ],
            "key_phrases": [title],
            "interaction_points": ["質問を受ける"],
            "transition_to_next": "次へ進みます。"
        },
        "structured_outline": { "kind": "text", "text": format!("講義の目的\n  {title}の理解") },
        "learning_objectives": [format!("{title}を説明できる")],
        "key_points": [format!("{title}の要点")],
        "exercises": [format!("{title}の演習")]
    });
    Ok(format!("```json\n{lecture}\n```"))
}
