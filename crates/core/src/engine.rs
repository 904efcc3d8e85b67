//! Hand-off of a patched workflow to the external execution host.
//!
//! The host exposes a queue-style HTTP API: a workflow is submitted to
//! `POST /prompt` and its progress is read back from `GET /history/{id}`,
//! which stays empty until the run has finished.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::logging::redact_url;
use crate::workflow::WorkflowTemplate;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_LIST_KEYS: [&str; 3] = ["videos", "gifs", "images"];

/// Outcome of one completed run on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub prompt_id: String,
    /// Files the host reported writing, relative to its output directory.
    pub outputs: Vec<PathBuf>,
}

pub trait ExecutionEngine: Send + Sync {
    /// Runs `workflow` to completion. Blocks the calling thread.
    fn execute(
        &self,
        workflow: &WorkflowTemplate,
        prompt_id: &str,
    ) -> Result<ExecutionReport, EngineError>;
}

#[derive(Debug, Clone)]
pub struct ComfyHttpEngine {
    base_url: Url,
    client_id: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl ComfyHttpEngine {
    pub fn new(base_url: &str, poll_interval: Duration, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| anyhow::anyhow!("invalid engine base URL '{base_url}': {err}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            client_id: uuid::Uuid::new_v4().to_string(),
            poll_interval,
            timeout,
        })
    }

    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        Self::new(&config.base_url, config.poll_interval(), config.timeout())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        self.base_url
            .join(path)
            .map_err(|err| EngineError::InvalidResponse(format!("bad endpoint '{path}': {err}")))
    }

    fn submit(
        &self,
        client: &reqwest::blocking::Client,
        workflow: &WorkflowTemplate,
        prompt_id: &str,
    ) -> Result<String, EngineError> {
        let url = self.endpoint("prompt")?;
        let prompt = workflow.to_value().map_err(|err| {
            EngineError::InvalidResponse(format!("workflow could not be serialized: {err}"))
        })?;
        let body = json!({
            "prompt": prompt,
            "client_id": self.client_id,
            "prompt_id": prompt_id,
        });

        let response = client
            .post(url.clone())
            .json(&body)
            .send()
            .map_err(|err| unreachable(&url, err))?;

        let status = response.status();
        let text = response.text().map_err(|err| unreachable(&url, err))?;
        if !status.is_success() {
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&text),
            });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|err| {
            EngineError::InvalidResponse(format!("submission response is not JSON: {err}"))
        })?;
        if let Some(errors) = parsed.get("node_errors").filter(|v| has_entries(v)) {
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                message: format!("node errors: {errors}"),
            });
        }

        Ok(parsed
            .get("prompt_id")
            .and_then(Value::as_str)
            .unwrap_or(prompt_id)
            .to_string())
    }

    fn wait_for_completion(
        &self,
        client: &reqwest::blocking::Client,
        prompt_id: &str,
    ) -> Result<ExecutionReport, EngineError> {
        let url = self.endpoint(&format!("history/{prompt_id}"))?;
        let started = Instant::now();
        let mut polls = 0u64;

        loop {
            polls += 1;
            let response = client
                .get(url.clone())
                .send()
                .map_err(|err| unreachable(&url, err))?;
            if !response.status().is_success() {
                return Err(EngineError::InvalidResponse(format!(
                    "history endpoint returned HTTP {}",
                    response.status().as_u16()
                )));
            }
            let history: Value = response.json().map_err(|err| {
                EngineError::InvalidResponse(format!("history response is not JSON: {err}"))
            })?;

            if let Some(report) = parse_history(&history, prompt_id)? {
                debug!(prompt_id, polls, elapsed_ms = started.elapsed().as_millis() as u64, "Workflow finished");
                return Ok(report);
            }

            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    warn!(prompt_id, ?elapsed, "Timed out waiting for workflow");
                    return Err(EngineError::TimedOut { elapsed });
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl ExecutionEngine for ComfyHttpEngine {
    fn execute(
        &self,
        workflow: &WorkflowTemplate,
        prompt_id: &str,
    ) -> Result<ExecutionReport, EngineError> {
        // Built per call: the blocking client must not be created on an
        // async runtime thread, and callers reach here via spawn_blocking.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| EngineError::Unreachable(format!("failed to build HTTP client: {err}")))?;

        info!(
            engine = %redact_url(self.base_url.as_str()),
            prompt_id,
            nodes = workflow.len(),
            "Submitting workflow"
        );
        let accepted_id = self.submit(&client, workflow, prompt_id)?;
        if accepted_id != prompt_id {
            debug!(requested = prompt_id, accepted = %accepted_id, "Engine assigned a different prompt id");
        }
        self.wait_for_completion(&client, &accepted_id)
    }
}

fn unreachable(url: &Url, err: reqwest::Error) -> EngineError {
    EngineError::Unreachable(format!("{}: {err}", redact_url(url.as_str())))
}

fn has_entries(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

/// Best human-readable message from a rejection body, which is usually
/// `{"error": {"message": ..., "details": ...}, "node_errors": {...}}`.
fn rejection_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };

    let error = parsed.get("error");
    let mut message = error
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(Value::as_str)
        .unwrap_or("workflow rejected")
        .to_string();
    if let Some(details) = error
        .and_then(|e| e.get("details"))
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
    {
        message.push_str(": ");
        message.push_str(details);
    }
    if let Some(node_errors) = parsed.get("node_errors").filter(|v| has_entries(v)) {
        message.push_str(&format!(" (node errors: {node_errors})"));
    }
    message
}

/// `Ok(None)` while the run is still queued or executing.
fn parse_history(history: &Value, prompt_id: &str) -> Result<Option<ExecutionReport>, EngineError> {
    let Some(entry) = history.get(prompt_id) else {
        return Ok(None);
    };
    if !entry.is_object() {
        return Err(EngineError::InvalidResponse(format!(
            "history entry for {prompt_id} is not an object"
        )));
    }

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool);

    if status_str == Some("error") {
        return Err(EngineError::Failed {
            message: execution_error_message(status),
        });
    }
    if status.is_some() && completed == Some(false) && status_str != Some("success") {
        return Ok(None);
    }

    Ok(Some(ExecutionReport {
        prompt_id: prompt_id.to_string(),
        outputs: reported_outputs(entry.get("outputs")),
    }))
}

fn execution_error_message(status: Option<&Value>) -> String {
    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array);

    let error = messages.into_iter().flatten().find_map(|message| {
        let pair = message.as_array()?;
        (pair.first()?.as_str()? == "execution_error").then(|| pair.get(1))?
    });

    let Some(error) = error else {
        return "execution failed without an error message".to_string();
    };
    let text = error
        .get("exception_message")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("execution failed");
    match (
        error.get("node_id").and_then(Value::as_str),
        error.get("node_type").and_then(Value::as_str),
    ) {
        (Some(id), Some(kind)) => format!("{text} (node {id}, {kind})"),
        _ => text.to_string(),
    }
}

fn reported_outputs(outputs: Option<&Value>) -> Vec<PathBuf> {
    let Some(Value::Object(nodes)) = outputs else {
        return Vec::new();
    };

    let mut files = Vec::new();
    for node_output in nodes.values() {
        for key in OUTPUT_LIST_KEYS {
            let Some(items) = node_output.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                // temp/ and input/ artifacts are previews, not results
                if item
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| kind != "output")
                {
                    continue;
                }
                let subfolder = item.get("subfolder").and_then(Value::as_str).unwrap_or("");
                files.push(PathBuf::from(subfolder).join(filename));
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    fn sample_workflow() -> WorkflowTemplate {
        WorkflowTemplate::parse(
            r#"{"16": {"class_type": "WanVideoSampler", "inputs": {"seed": 1, "steps": 6}}}"#,
        )
        .unwrap()
    }

    /// Serves canned responses in order, one per connection, and records the
    /// raw requests it saw.
    fn scripted_server(responses: Vec<(&'static str, String)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_server = Arc::clone(&seen);

        thread::spawn(move || {
            for (status_line, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let request = read_request(&mut stream);
                seen_by_server.lock().unwrap().push(request);
                let reply = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
                let _ = stream.flush();
            }
        });

        (format!("http://{addr}"), seen)
    }

    fn read_request(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn engine(base: &str, timeout: Option<Duration>) -> ComfyHttpEngine {
        ComfyHttpEngine::new(base, Duration::from_millis(10), timeout).unwrap()
    }

    #[test]
    fn completes_after_pending_polls_and_collects_outputs() {
        let finished = json!({
            "p-1": {
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {
                    "23": {"gifs": [
                        {"filename": "InfiniteTalk_00001.mp4", "subfolder": "", "type": "output"},
                        {"filename": "preview.png", "subfolder": "", "type": "temp"}
                    ]}
                }
            }
        });
        let (base, seen) = scripted_server(vec![
            ("200 OK", r#"{"prompt_id": "p-1", "number": 0, "node_errors": {}}"#.to_string()),
            ("200 OK", "{}".to_string()),
            ("200 OK", finished.to_string()),
        ]);

        let report = engine(&base, None).execute(&sample_workflow(), "p-1").unwrap();
        assert_eq!(report.prompt_id, "p-1");
        assert_eq!(report.outputs, vec![PathBuf::from("InfiniteTalk_00001.mp4")]);

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with("POST /prompt"));
        assert!(seen[1].starts_with("GET /history/p-1"));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn submission_carries_workflow_and_ids() {
        let finished = json!({"p-2": {"status": {"status_str": "success", "completed": true}}});
        let (base, seen) = scripted_server(vec![
            ("200 OK", r#"{"prompt_id": "p-2"}"#.to_string()),
            ("200 OK", finished.to_string()),
        ]);

        engine(&base, None).execute(&sample_workflow(), "p-2").unwrap();

        let seen = seen.lock().unwrap();
        let (_, raw_body) = seen[0].split_once("\r\n\r\n").unwrap();
        let body: Value = serde_json::from_str(raw_body).unwrap();
        assert_eq!(body["prompt"]["16"]["class_type"], "WanVideoSampler");
        assert_eq!(body["prompt"]["16"]["inputs"]["steps"], 6);
        assert_eq!(body["prompt_id"], "p-2");
        assert!(!body["client_id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn rejection_keeps_status_and_host_message() {
        let body = json!({
            "error": {"type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation", "details": ""},
            "node_errors": {"12": {"errors": [{"message": "Invalid image file"}]}}
        });
        let (base, _) = scripted_server(vec![("400 Bad Request", body.to_string())]);

        let err = engine(&base, None)
            .execute(&sample_workflow(), "p-2")
            .unwrap_err();
        match err {
            EngineError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("Prompt outputs failed validation"));
                assert!(message.contains("Invalid image file"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn execution_error_surfaces_exception_message() {
        let failed = json!({
            "p-3": {
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "p-3"}],
                        ["execution_error", {
                            "node_id": "16", "node_type": "WanVideoSampler",
                            "exception_message": "CUDA out of memory\n"
                        }]
                    ]
                },
                "outputs": {}
            }
        });
        let (base, _) = scripted_server(vec![
            ("200 OK", r#"{"prompt_id": "p-3", "node_errors": {}}"#.to_string()),
            ("200 OK", failed.to_string()),
        ]);

        let err = engine(&base, None)
            .execute(&sample_workflow(), "p-3")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Failed { ref message } if message == "CUDA out of memory (node 16, WanVideoSampler)"
        ));
    }

    #[test]
    fn deadline_turns_into_timeout() {
        let (base, _) = scripted_server(vec![
            ("200 OK", r#"{"prompt_id": "p-4"}"#.to_string()),
            ("200 OK", "{}".to_string()),
            ("200 OK", "{}".to_string()),
            ("200 OK", "{}".to_string()),
        ]);

        let err = engine(&base, Some(Duration::ZERO))
            .execute(&sample_workflow(), "p-4")
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut { .. }));
    }

    #[test]
    fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = engine(&base, None)
            .execute(&sample_workflow(), "p-5")
            .unwrap_err();
        assert!(matches!(err, EngineError::Unreachable(_)));
    }

    #[test]
    fn history_without_status_but_with_outputs_counts_as_done() {
        let history = json!({"p": {"outputs": {"9": {"videos": [
            {"filename": "clip.webm", "subfolder": "runs", "type": "output"}
        ]}}}});
        let report = parse_history(&history, "p").unwrap().unwrap();
        assert_eq!(report.outputs, vec![PathBuf::from("runs").join("clip.webm")]);
    }

    #[test]
    fn running_entry_is_still_pending() {
        let history = json!({"p": {"status": {"status_str": null, "completed": false}}});
        assert!(parse_history(&history, "p").unwrap().is_none());
        assert!(parse_history(&json!({}), "p").unwrap().is_none());
    }

    #[test]
    fn base_url_gains_trailing_slash_for_joining() {
        let engine = engine("http://host:8188/comfy", None);
        assert_eq!(
            engine.endpoint("prompt").unwrap().as_str(),
            "http://host:8188/comfy/prompt"
        );
        assert!(ComfyHttpEngine::new("not a url", Duration::from_millis(1), None).is_err());
    }
}
