//! Integration tests for the Ollama backend against an in-process fake

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use relay_cli::llm::{
    Decision, LlmError, LlmProvider, Message, OllamaProvider, ToolCall, ToolDefinition,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct FakeOllama {
    status: StatusCode,
    reply: Value,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeOllama {
    fn replying(reply: Value) -> Self {
        Self {
            status: StatusCode::OK,
            reply,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn last_request(&self) -> Value {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

async fn chat_handler(
    State(fake): State<FakeOllama>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.requests.lock().unwrap().push(request);
    (fake.status, Json(fake.reply.clone()))
}

async fn tags_handler() -> Json<Value> {
    Json(json!({
        "models": [
            {"name": "llama3.2:latest", "size": 2019393189},
            {"name": "qwen2.5:7b", "size": 4683087332u64}
        ]
    }))
}

async fn spawn(fake: FakeOllama) -> String {
    let app = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/tags", get(tags_handler))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn provider(base_url: &str, model: &str) -> OllamaProvider {
    OllamaProvider::new()
        .unwrap()
        .with_base_url(base_url)
        .with_model(model)
}

fn db_tools() -> Vec<ToolDefinition> {
    ["add_data", "read_data"]
        .into_iter()
        .map(|name| ToolDefinition {
            name: name.to_string(),
            description: format!("{} on the people table", name),
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        })
        .collect()
}

#[tokio::test]
async fn native_tool_call_becomes_invoke() {
    let fake = FakeOllama::replying(json!({
        "model": "llama3.2",
        "message": {
            "role": "assistant",
            "content": "",
            "tool_calls": [{
                "function": {
                    "name": "add_data",
                    "arguments": {"query": "INSERT INTO people (name, age, profession) VALUES ('Momo', 22, 'Software engineer')"}
                }
            }]
        },
        "done": true,
        "prompt_eval_count": 120,
        "eval_count": 30
    }));
    let url = spawn(fake.clone()).await;
    let llm = provider(&url, "llama3.2");

    let messages = vec![
        Message::system("sys"),
        Message::user("add to db: Momo, age 22, Software engineer"),
    ];
    let (decision, usage) = llm.decide_with_usage(&messages, &db_tools()).await.unwrap();

    match decision {
        Decision::Invoke(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].name, "add_data");
            assert!(calls[0].arguments["query"]
                .as_str()
                .unwrap()
                .starts_with("INSERT INTO people"));
        }
        other => panic!("expected Invoke, got {:?}", other),
    }
    assert_eq!(usage.unwrap().total_tokens, 150);

    let request = fake.last_request();
    assert_eq!(request["model"], "llama3.2");
    assert_eq!(request["stream"], false);
    assert_eq!(request["tools"].as_array().unwrap().len(), 2);
    assert_eq!(request["tools"][0]["type"], "function");
    assert_eq!(request["messages"][0]["role"], "system");
}

#[tokio::test]
async fn text_reply_becomes_final_answer() {
    let fake = FakeOllama::replying(json!({
        "message": {"role": "assistant", "content": "Hello! How can I help?"},
        "done": true
    }));
    let url = spawn(fake.clone()).await;

    let decision = provider(&url, "llama3.2")
        .decide(&[Message::user("hi")], &[])
        .await
        .unwrap();

    assert_eq!(
        decision,
        Decision::FinalAnswer("Hello! How can I help?".to_string())
    );
    // No tools means none are advertised
    assert!(fake.last_request().get("tools").is_none());
}

#[tokio::test]
async fn tool_results_are_sent_with_the_tool_name() {
    let fake = FakeOllama::replying(json!({
        "message": {"role": "assistant", "content": "No entries found."},
        "done": true
    }));
    let url = spawn(fake.clone()).await;

    let call = ToolCall {
        id: "call_abc".to_string(),
        name: "read_data".to_string(),
        arguments: json!({"query": "SELECT * FROM people"}),
    };
    let messages = vec![
        Message::system("sys"),
        Message::user("now retrieve all the data entries in the database"),
        Message::assistant_tool_calls(std::slice::from_ref(&call)),
        Message::tool_result("call_abc", "No entries found."),
    ];
    provider(&url, "llama3.2")
        .chat(&messages, Some(&db_tools()))
        .await
        .unwrap();

    let sent = &fake.last_request()["messages"];
    assert_eq!(sent[2]["role"], "assistant");
    assert_eq!(sent[2]["tool_calls"][0]["function"]["name"], "read_data");
    assert_eq!(sent[3]["role"], "tool");
    assert_eq!(sent[3]["tool_name"], "read_data");
    assert_eq!(sent[3]["content"], "No entries found.");
}

#[tokio::test]
async fn text_encoded_tool_call_is_recovered_for_known_tools() {
    let fake = FakeOllama::replying(json!({
        "message": {
            "role": "assistant",
            "content": "{\"name\": \"read_data\", \"parameters\": {\"query\": \"SELECT * FROM people\"}}"
        },
        "done": true
    }));
    let url = spawn(fake).await;

    let decision = provider(&url, "llama3.2")
        .decide(&[Message::user("list people")], &db_tools())
        .await
        .unwrap();

    match decision {
        Decision::Invoke(calls) => {
            assert_eq!(calls[0].name, "read_data");
            assert_eq!(calls[0].arguments, json!({"query": "SELECT * FROM people"}));
        }
        other => panic!("expected Invoke, got {:?}", other),
    }
}

#[tokio::test]
async fn server_errors_are_typed() {
    let mut fake = FakeOllama::replying(json!({"error": "model runner crashed"}));
    fake.status = StatusCode::INTERNAL_SERVER_ERROR;
    let url = spawn(fake).await;

    let err = provider(&url, "llama3.2")
        .chat(&[Message::user("hi")], None)
        .await
        .unwrap_err();

    let llm_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<LlmError>())
        .expect("typed error in chain");
    assert!(matches!(llm_err, LlmError::ServiceError(_)));
    assert!(llm_err.is_retryable());
}

#[tokio::test]
async fn health_check_requires_the_model_to_be_installed() {
    let url = spawn(FakeOllama::replying(json!({}))).await;

    provider(&url, "llama3.2").health_check().await.unwrap();
    provider(&url, "qwen2.5:7b").health_check().await.unwrap();

    let err = provider(&url, "mistral").health_check().await.unwrap_err();
    assert!(err.to_string().contains("ollama pull mistral"));
}

#[tokio::test]
async fn unreachable_backend_is_reported() {
    let llm = provider("http://127.0.0.1:1", "llama3.2");
    assert!(!llm.is_available().await);

    let health = llm.health_check().await.unwrap_err();
    assert!(health
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<LlmError>(), Some(LlmError::Unreachable(_)))));

    let err = llm.chat(&[Message::user("hi")], None).await.unwrap_err();
    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<LlmError>(), Some(LlmError::Unreachable(_)))));
}
