//! The AI-assisted investigation loop.
//!
//! The model is given a redacted projection of the report and a small tool
//! surface: `report_get` to page through the full report, and `ledger_record`
//! to accumulate evidence. Malformed tool input is normalized before
//! interpretation; cancellation aborts an in-flight completion without
//! touching ledger or report state.

use crate::report::{AiAnalysisResult, CrashAnalysisResult};
use crate::status::Status;
use futures_util::future::{select, Either};
use ledger::{LedgerHandle, LedgerItemInput};
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::pin;

pub mod jsonutil;
pub mod ledger;
pub mod prompt;
pub mod sampling;

/// The caller supplied a bad tool request; distinct from an internal failure.
#[derive(Debug)]
pub struct ToolInputError(pub String);

impl std::fmt::Display for ToolInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid tool input: {}", self.0)
    }
}

impl std::error::Error for ToolInputError {}

#[derive(Clone, Debug)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Clone, Debug, Default)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument text as produced by the model; normalized before use.
    pub arguments: String,
}

/// The external model connection. The completion call is the only operation
/// in this crate expected to suspend for unbounded time; retry policy belongs
/// to the transport, not here.
pub trait SamplingClient: Send + Sync {
    fn supports_sampling(&self) -> bool;
    fn complete(
        &self,
        request: &ModelRequest,
    ) -> impl std::future::Future<Output = anyhow::Result<ModelResponse>> + Send;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportGetArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    page_kind: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Resolve a dot-delimited path into the serialized report, with optional
/// paging. An unknown path is an empty result, not an error; a missing path
/// is a caller error.
pub fn report_get(report: &Value, args: &Value) -> Result<Value, ToolInputError> {
    let args: ReportGetArgs = serde_json::from_value(args.clone())
        .map_err(|e| ToolInputError(format!("bad arguments: {e}")))?;
    let path = match args.path.as_deref() {
        None | Some("") => return Err(ToolInputError("`path` is required".into())),
        Some(path) => path,
    };

    let mut current = report;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(Value::Null),
        }
    }

    if args.page_kind.as_deref() == Some("keys") {
        return Ok(match current {
            Value::Object(map) => json!({ "keys": map.keys().collect::<Vec<_>>() }),
            Value::Array(items) => json!({ "length": items.len() }),
            other => other.clone(),
        });
    }

    if let (Some(limit), Value::Array(items)) = (args.limit, current) {
        if items.len() > limit {
            return Ok(json!({
                "items": items[..limit],
                "truncated": true,
                "totalItems": items.len(),
            }));
        }
    }

    Ok(current.clone())
}

const MAX_ROUNDS_DEFAULT: usize = 16;

const SYSTEM_PROMPT: &str = "You are a crash-dump investigator. You are given a condensed view of \
a crash analysis report. Use the report_get tool to read any section of the full report (path is \
a dot-delimited JSON path, e.g. `threads.all.0.callStack`), and record findings with the \
ledger_record tool as you go. When you are done, reply with a JSON object: \
{\"summary\": \"...\", \"recommendations\": [\"...\"]}.";

pub struct AiAnalysisOrchestrator<'a, C> {
    client: &'a C,
    status: &'a Status,
    ledger: LedgerHandle,
    report: Value,
    prompt_text: String,
    max_rounds: usize,
}

impl<'a, C: SamplingClient> AiAnalysisOrchestrator<'a, C> {
    pub fn new(
        client: &'a C,
        status: &'a Status,
        report: &CrashAnalysisResult,
        max_ledger_items: usize,
        max_rounds: usize,
    ) -> anyhow::Result<Self> {
        Ok(AiAnalysisOrchestrator {
            client,
            status,
            ledger: LedgerHandle::spawn(max_ledger_items),
            report: serde_json::to_value(report)?,
            prompt_text: serde_json::to_string_pretty(&prompt::build_prompt(report))?,
            max_rounds: if max_rounds == 0 { MAX_ROUNDS_DEFAULT } else { max_rounds },
        })
    }

    pub fn is_sampling_available(&self) -> bool {
        self.client.supports_sampling()
    }

    fn tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "report_get".into(),
                description: "Read a section of the full crash report by dot-delimited path."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "pageKind": { "type": "string", "enum": ["keys"] },
                        "limit": { "type": "integer" },
                    },
                    "required": ["path"],
                }),
            },
            ToolDefinition {
                name: "ledger_record".into(),
                description: "Record or update evidence items in the investigation ledger."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": { "type": "string" },
                                    "source": { "type": "string" },
                                    "finding": { "type": "string" },
                                },
                            },
                        },
                    },
                    "required": ["items"],
                }),
            },
        ]
    }

    async fn handle_tool_call(&self, call: &ToolCall) -> String {
        // Normalize before interpreting anything: the model may produce
        // concatenated objects or a JSON-quoted object.
        let arguments = match jsonutil::tolerant_value(&call.arguments) {
            Ok(value) => value,
            Err(e) => return format!("invalid tool input: {e:#}"),
        };

        match call.name.as_str() {
            "report_get" => match report_get(&self.report, &arguments) {
                Ok(value) => value.to_string(),
                Err(e) => e.to_string(),
            },
            "ledger_record" => {
                let items: Vec<LedgerItemInput> = match arguments
                    .get("items")
                    .cloned()
                    .map(serde_json::from_value)
                {
                    Some(Ok(items)) => items,
                    Some(Err(e)) => return format!("invalid tool input: {e}"),
                    None => return "invalid tool input: `items` is required".to_string(),
                };
                match self.ledger.add_or_update(items).await {
                    Ok(outcome) => {
                        self.status
                            .ai
                            .set_ledger_items(self.status.ai.ledger_items() + outcome.added_ids.len());
                        serde_json::to_string(&outcome).unwrap_or_default()
                    }
                    Err(e) => format!("internal error: {e:#}"),
                }
            }
            other => format!("invalid tool input: unknown tool {other:?}"),
        }
    }

    /// Run the investigation loop. Returns `None` when sampling is
    /// unavailable or the run is cancelled before completing.
    pub async fn run(&self) -> anyhow::Result<Option<AiAnalysisResult>> {
        if !self.is_sampling_available() {
            log::info!("model connection does not support sampling; skipping AI analysis");
            return Ok(None);
        }

        let mut messages = vec![
            Message {
                role: "system".into(),
                content: SYSTEM_PROMPT.into(),
            },
            Message {
                role: "user".into(),
                content: self.prompt_text.clone(),
            },
        ];
        let tools = Self::tool_definitions();

        for _round in 0..self.max_rounds {
            if self.status.is_cancelled() {
                return Ok(None);
            }

            let request = ModelRequest {
                messages: messages.clone(),
                tools: tools.clone(),
            };
            // Race the completion against cancellation; aborting here is safe
            // since tool effects are only applied after a call completes.
            let completion = pin!(self.client.complete(&request));
            let cancelled = pin!(self.status.cancelled());
            let response = match select(completion, cancelled).await {
                Either::Left((response, _)) => response?,
                Either::Right(((), _)) => return Ok(None),
            };
            self.status.ai.inc_rounds();

            if response.tool_calls.is_empty() {
                let text = response.text.unwrap_or_default();
                let mut result = parse_final_answer(&text);
                result.evidence = self.ledger.snapshot().await?;
                return Ok(Some(result));
            }

            if let Some(text) = &response.text {
                messages.push(Message {
                    role: "assistant".into(),
                    content: text.clone(),
                });
            }
            for call in &response.tool_calls {
                let output = self.handle_tool_call(call).await;
                messages.push(Message {
                    role: "tool".into(),
                    content: format!("[{}] {}", call.name, output),
                });
            }
        }

        log::warn!("AI analysis did not converge within {} rounds", self.max_rounds);
        let evidence = self.ledger.snapshot().await?;
        Ok(Some(AiAnalysisResult {
            summary: "Investigation did not converge; see collected evidence.".into(),
            evidence,
            recommendations: Vec::new(),
        }))
    }
}

/// Parse the model's free-text final answer, tolerating malformed JSON and
/// falling back to the raw text as the summary.
fn parse_final_answer(text: &str) -> AiAnalysisResult {
    if let Ok(value) = jsonutil::tolerant_value(text) {
        if let Ok(result) = serde_json::from_value::<AiAnalysisResult>(value) {
            return result;
        }
    }
    AiAnalysisResult {
        summary: text.trim().to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Value {
        json!({
            "summary": { "text": "s" },
            "threads": {
                "all": [
                    { "threadId": "1", "state": "Running" },
                    { "threadId": "2", "state": "Wait" },
                    { "threadId": "3", "state": "Wait" },
                ]
            }
        })
    }

    #[test]
    fn missing_path_is_a_caller_error() {
        let err = report_get(&report(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("path"));
        let err = report_get(&report(), &json!({ "path": "" })).unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn unknown_path_is_null_not_an_error() {
        let value = report_get(&report(), &json!({ "path": "no.such.path" })).unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn paths_traverse_objects_and_arrays() {
        let value =
            report_get(&report(), &json!({ "path": "threads.all.1.threadId" })).unwrap();
        assert_eq!(value, json!("2"));
    }

    #[test]
    fn keys_paging_returns_structure_only() {
        let value = report_get(
            &report(),
            &json!({ "path": "threads.all", "pageKind": "keys" }),
        )
        .unwrap();
        assert_eq!(value, json!({ "length": 3 }));

        let value = report_get(&report(), &json!({ "path": "summary", "pageKind": "keys" }))
            .unwrap();
        assert_eq!(value, json!({ "keys": ["text"] }));
    }

    #[test]
    fn limit_truncates_arrays_with_a_wrapper() {
        let value =
            report_get(&report(), &json!({ "path": "threads.all", "limit": 2 })).unwrap();
        assert_eq!(value["truncated"], true);
        assert_eq!(value["totalItems"], 3);
        assert_eq!(value["items"].as_array().unwrap().len(), 2);

        let value =
            report_get(&report(), &json!({ "path": "threads.all", "limit": 10 })).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn final_answer_tolerates_concatenated_json() {
        let result = parse_final_answer(r#"{"summary":"root cause"}{"summary":"noise"}"#);
        assert_eq!(result.summary, "root cause");
    }

    #[test]
    fn final_answer_falls_back_to_raw_text() {
        let result = parse_final_answer("The crash is a deadlock.");
        assert_eq!(result.summary, "The crash is a deadlock.");
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn final_answer_accepts_summary_rewrite_alias() {
        let result = parse_final_answer(r#"{"summaryRewrite":"migrated"}"#);
        assert_eq!(result.summary, "migrated");
    }

    struct FailingClient;

    impl SamplingClient for FailingClient {
        fn supports_sampling(&self) -> bool {
            true
        }

        async fn complete(&self, _request: &ModelRequest) -> anyhow::Result<ModelResponse> {
            Err(anyhow::anyhow!("connection refused").context("sampling request failed"))
        }
    }

    #[tokio::test]
    async fn endpoint_failure_propagates_out_of_the_loop() {
        let status = Status::new();
        let report = CrashAnalysisResult::default();
        let orchestrator =
            AiAnalysisOrchestrator::new(&FailingClient, &status, &report, 10, 4).unwrap();
        let err = orchestrator.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("sampling request failed"));
    }
}
