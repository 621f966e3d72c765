use axum::{routing::post, Json, Router};
use base64::Engine;
use hack_gate::session::SessionStore;
use hack_gate::AppState;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

async fn setup() -> (String, Client, tokio::task::JoinHandle<()>) {
    let (addr, handle) = hack_gate::test::spawn().await;
    let base = format!("http://{}", addr);
    let http = Client::new();
    (base, http, handle)
}

async fn create(http: &Client, base: &str, files: Value) -> reqwest::Response {
    http.post(format!("{}/v1/sessions", base))
        .json(&json!({ "files": files }))
        .send()
        .await
        .unwrap()
}

async fn open_session(http: &Client, base: &str, src: &str) -> String {
    let r: Value = create(http, base, json!([{ "name": "Main.vm", "content": src }]))
        .await
        .json()
        .await
        .unwrap();
    r["id"].as_str().unwrap().to_string()
}

async fn post_json(http: &Client, url: String, body: Value) -> Value {
    http.post(url).json(&body).send().await.unwrap().json().await.unwrap()
}

const ADD: &str = "function Main.main 0\npush constant 7\npush constant 8\nadd\nreturn\n";
const SPIN: &str = "function Main.main 0\nlabel L\ngoto L\n";

// ── health / middleware ──────────────────────────────────────────

#[tokio::test]
async fn healthz_ok() {
    let (base, http, _h) = setup().await;
    let r: Value = http.get(format!("{}/healthz", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(r["ok"], true);
}

#[tokio::test]
async fn post_without_json_content_type_is_rejected() {
    let (base, http, _h) = setup().await;
    let resp = http
        .post(format!("{}/v1/sessions", base))
        .body(r#"{"files":[]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unsupported_media_type");
}

// ── session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn create_then_run_to_halt() {
    let (base, http, _h) = setup().await;
    let resp = create(&http, &base, json!([{ "name": "Main.vm", "content": ADD }])).await;
    assert_eq!(resp.status(), 201);
    let info: Value = resp.json().await.unwrap();
    assert_eq!(info["entry"], "Main.main");
    assert_eq!(info["instructions"], 5);
    let id = info["id"].as_str().unwrap();

    let state = post_json(&http, format!("{}/v1/sessions/{}/run", base, id), json!({})).await;
    assert_eq!(state["status"], "halted");
    assert_eq!(state["exit_code"], 15);
    assert_eq!(state["ran"], 5);

    let mem: Value = http
        .get(format!("{}/v1/sessions/{}/memory?address=256&length=1", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mem["values"], json!([15]));
}

#[tokio::test]
async fn step_pause_run_and_reset() {
    let (base, http, _h) = setup().await;
    let id = open_session(&http, &base, SPIN).await;

    let s = post_json(&http, format!("{}/v1/sessions/{}/step", base, id), json!({ "count": 3 })).await;
    assert_eq!(s["status"], "running");
    assert_eq!(s["steps"], 3);

    let s = post_json(&http, format!("{}/v1/sessions/{}/run", base, id), json!({ "budget": 100 })).await;
    assert_eq!(s["status"], "running");
    assert_eq!(s["ran"], 100);
    assert_eq!(s["function"], "Main.main");

    let s = post_json(&http, format!("{}/v1/sessions/{}/pause", base, id), json!({})).await;
    assert_eq!(s["status"], "paused");
    assert_eq!(s["steps"], 103);

    let s = post_json(&http, format!("{}/v1/sessions/{}/reset", base, id), json!({})).await;
    assert_eq!(s["status"], "ready");
    assert_eq!(s["steps"], 0);
    assert_eq!(s["pc"], 0);
    assert_eq!(s["sp"], 261);
}

#[tokio::test]
async fn delete_removes_session() {
    let (base, http, _h) = setup().await;
    let id = open_session(&http, &base, ADD).await;
    let resp = http.delete(format!("{}/v1/sessions/{}", base, id)).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = http.get(format!("{}/v1/sessions/{}", base, id)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn long_run_does_not_block_other_sessions() {
    let (base, http, _h) = setup().await;
    let spinning = open_session(&http, &base, SPIN).await;
    let idle = open_session(&http, &base, ADD).await;

    let long = tokio::spawn({
        let http = http.clone();
        let url = format!("{}/v1/sessions/{}/run", base, spinning);
        async move { post_json(&http, url, json!({ "budget": 1_000_000 })).await }
    });

    let resp = tokio::time::timeout(
        Duration::from_secs(10),
        http.get(format!("{}/v1/sessions/{}", base, idle)).send(),
    )
    .await
    .expect("idle session answered while another ran")
    .unwrap();
    assert_eq!(resp.status(), 200);
    let s = post_json(&http, format!("{}/v1/sessions/{}/run", base, idle), json!({})).await;
    assert_eq!(s["exit_code"], 15);

    let s = long.await.unwrap();
    assert_eq!(s["status"], "running");
    assert_eq!(s["ran"], 1_000_000);
}

// ── build errors ─────────────────────────────────────────────────

#[tokio::test]
async fn parse_error_reports_file_and_line() {
    let (base, http, _h) = setup().await;
    let resp = create(
        &http,
        &base,
        json!([{ "name": "Main.vm", "content": "function Main.main 0\njump 3\n" }]),
    )
    .await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "parse_error");
    assert_eq!(body["detail"]["file"], "Main.vm");
    assert_eq!(body["detail"]["line"], 2);
}

#[tokio::test]
async fn unresolved_call_is_a_link_error() {
    let (base, http, _h) = setup().await;
    let resp = create(
        &http,
        &base,
        json!([{ "name": "Main.vm", "content": "function Main.main 0\ncall Missing.fn 0\nreturn\n" }]),
    )
    .await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "link_error");
    assert_eq!(body["detail"]["kind"], "unresolved_call");
    assert_eq!(body["detail"]["detail"]["name"], "Missing.fn");
}

#[tokio::test]
async fn unknown_entry_is_rejected() {
    let (base, http, _h) = setup().await;
    let resp = http
        .post(format!("{}/v1/sessions", base))
        .json(&json!({
            "files": [{ "name": "Main.vm", "content": ADD }],
            "entry": "Main.other",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
}

// ── faults ───────────────────────────────────────────────────────

#[tokio::test]
async fn underflow_faults_the_session() {
    let (base, http, _h) = setup().await;
    let id = open_session(&http, &base, "function Main.main 1\npop local 0\n").await;
    let s = post_json(&http, format!("{}/v1/sessions/{}/step", base, id), json!({ "count": 5 })).await;
    assert_eq!(s["status"], "error");
    assert_eq!(s["ran"], 1);
    assert_eq!(s["fault"]["error"]["kind"], "stack_underflow");
    assert_eq!(s["fault"]["pc"], 1);
    assert_eq!(s["fault"]["function"], "Main.main");

    // Stays faulted until reset.
    let s = post_json(&http, format!("{}/v1/sessions/{}/run", base, id), json!({})).await;
    assert_eq!(s["status"], "error");
    assert_eq!(s["ran"], 0);
}

// ── memory-mapped I/O ────────────────────────────────────────────

const ECHO_KEY: &str = "\
function Main.main 0
    push constant 24576
    pop pointer 1
    push that 0
    push constant 16384
    pop pointer 1
    pop that 0
    push constant 0
    return
";

#[tokio::test]
async fn keyboard_reaches_program_and_screen() {
    let (base, http, _h) = setup().await;
    let id = open_session(&http, &base, ECHO_KEY).await;

    let k: Value = http
        .put(format!("{}/v1/sessions/{}/keyboard", base, id))
        .json(&json!({ "key": "Enter" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(k["key"], 128);

    let s = post_json(&http, format!("{}/v1/sessions/{}/run", base, id), json!({})).await;
    assert_eq!(s["status"], "halted");

    let screen: Value = http
        .get(format!("{}/v1/sessions/{}/screen", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(screen["width"], 512);
    assert_eq!(screen["height"], 256);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(screen["words_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 8192 * 2);
    assert_eq!(&bytes[..2], &[0x00, 0x80]);

    let resp = http
        .put(format!("{}/v1/sessions/{}/keyboard", base, id))
        .json(&json!({ "key": "Hyper" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn host_memory_writes_and_bounds() {
    let (base, http, _h) = setup().await;
    let id = open_session(&http, &base, ADD).await;

    let resp = http
        .put(format!("{}/v1/sessions/{}/memory", base, id))
        .json(&json!({ "address": 16384, "value": -1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mem: Value = http
        .get(format!("{}/v1/sessions/{}/memory?address=16383&length=2", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mem["values"], json!([0, -1]));

    let resp = http
        .get(format!("{}/v1/sessions/{}/memory?address=24577", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("out of bounds"));
}

// ── session store limits ─────────────────────────────────────────

#[tokio::test]
async fn oldest_session_is_evicted_at_capacity() {
    let state = AppState::new(SessionStore::new(1, Duration::from_secs(60)), "http://127.0.0.1:9", 1000);
    let (addr, _h) = hack_gate::test::spawn_with(state).await;
    let base = format!("http://{}", addr);
    let http = Client::new();

    let first = open_session(&http, &base, ADD).await;
    let second = open_session(&http, &base, ADD).await;
    let resp = http.get(format!("{}/v1/sessions/{}", base, first)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = http.get(format!("{}/v1/sessions/{}", base, second)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

// ── compile proxy ────────────────────────────────────────────────

async fn fake_compiler(reply: Value) -> (String, tokio::task::JoinHandle<()>) {
    let router = Router::new().route(
        "/compile",
        post(move |Json(req): Json<Value>| {
            let reply = reply.clone();
            async move {
                assert!(req["files"].is_array(), "proxy must forward the file list");
                Json(reply)
            }
        }),
    );
    let (addr, handle) = hack_gate::test::serve(router).await;
    (format!("http://{}", addr), handle)
}

async fn gate_with_compiler(url: &str) -> (String, Client, tokio::task::JoinHandle<()>) {
    let state = AppState::new(SessionStore::new(8, Duration::from_secs(60)), url, 1000);
    let (addr, handle) = hack_gate::test::spawn_with(state).await;
    (format!("http://{}", addr), Client::new(), handle)
}

#[tokio::test]
async fn compile_opens_session_on_returned_vm_code() {
    let (upstream, _u) = fake_compiler(json!({
        "vm": [
            { "name": "Sys.vm", "content": "function Sys.init 0\ncall Main.main 0\nreturn\n" },
            { "name": "Main.vm", "content": ADD },
        ],
        "asm": "@256\nD=A\n",
        "hack": "0000000100000000\n",
    }))
    .await;
    let (base, http, _h) = gate_with_compiler(&upstream).await;

    let r = post_json(
        &http,
        format!("{}/v1/compile", base),
        json!({ "files": [{ "name": "Main.jack", "content": "class Main {}" }] }),
    )
    .await;
    assert_eq!(r["session"]["entry"], "Sys.init");
    assert_eq!(r["vm"][0]["name"], "Main.vm");
    assert_eq!(r["asm"], "@256\nD=A\n");

    let id = r["session"]["id"].as_str().unwrap();
    let s = post_json(&http, format!("{}/v1/sessions/{}/run", base, id), json!({})).await;
    assert_eq!(s["exit_code"], 15);
}

#[tokio::test]
async fn compile_error_is_passed_through() {
    let (upstream, _u) = fake_compiler(json!({ "error": "Jack Compilation Failed:\nline 3" })).await;
    let (base, http, _h) = gate_with_compiler(&upstream).await;
    let resp = http
        .post(format!("{}/v1/compile", base))
        .json(&json!({ "files": [{ "name": "Main.jack", "content": "class" }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "compile_error");
    assert!(body["message"].as_str().unwrap().starts_with("Jack Compilation Failed"));
}

#[tokio::test]
async fn unreachable_compiler_is_bad_gateway() {
    let (base, http, _h) = gate_with_compiler("http://127.0.0.1:9").await;
    let resp = http
        .post(format!("{}/v1/compile", base))
        .json(&json!({ "files": [{ "name": "Main.jack", "content": "class Main {}" }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}
