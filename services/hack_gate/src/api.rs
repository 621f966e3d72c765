use crate::error::AppError;
use crate::session::lock_vm;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use hack_vm::memory::{MEMORY_SIZE, SCREEN_HEIGHT, SCREEN_WIDTH};
use hack_vm::{key_code, parse, Fault, ParsedFile, Program, Status, Vm, Word};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Upper bound on instructions executed by one request.
const MAX_BUDGET: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateReq {
    pub files: Vec<SourceFile>,
    pub entry: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub entry: String,
    pub functions: Vec<String>,
    pub instructions: usize,
}

/// What the host needs to draw its controls after every request.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<Word>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    pub pc: usize,
    pub steps: u64,
    pub function: String,
    pub instruction: Option<String>,
    pub call_depth: usize,
    pub sp: i32,
    /// Instructions executed by this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ran: Option<u64>,
}

impl SessionView {
    fn of(id: &str, vm: &Vm) -> Self {
        let (exit_code, fault) = match vm.status() {
            Status::Halted(code) => (Some(*code), None),
            Status::Error(fault) => (None, Some(fault.clone())),
            _ => (None, None),
        };
        Self {
            id: id.to_string(),
            status: vm.status().as_str(),
            exit_code,
            fault,
            pc: vm.pc(),
            steps: vm.steps(),
            function: vm.current_function().to_string(),
            instruction: vm.current_instruction().map(|i| i.to_string()),
            call_depth: vm.call_depth(),
            sp: vm.stack_pointer(),
            ran: None,
        }
    }

    fn ran(mut self, steps: u64) -> Self {
        self.ran = Some(steps);
        self
    }
}

fn build(files: &[SourceFile], entry: Option<&str>) -> Result<Vm, AppError> {
    if files.is_empty() {
        return Err(AppError::bad_request("no files provided"));
    }
    let parsed = files
        .iter()
        .map(|f| parse(&f.content, &f.name))
        .collect::<Result<Vec<ParsedFile>, _>>()?;
    let mut program = Program::link(&parsed)?;
    if let Some(name) = entry {
        program = program.with_entry(name)?;
    }
    Ok(Vm::new(program))
}

fn open(state: &AppState, vm: Vm) -> SessionInfo {
    let program = vm.program();
    let entry = program.entry().name.clone();
    let functions = program.functions().iter().map(|f| f.name.clone()).collect();
    let instructions = program.len();
    let id = state.sessions.insert(vm);
    info!(session = %id, %entry, instructions, "session created");
    SessionInfo {
        id,
        entry,
        functions,
        instructions,
    }
}

fn session<R>(state: &AppState, id: &str, f: impl FnOnce(&mut Vm) -> R) -> Result<R, AppError> {
    state
        .sessions
        .with(id, f)
        .ok_or_else(|| AppError::not_found("session"))
}

/// Runs an execution batch on the blocking pool so async workers keep serving other sessions.
async fn session_blocking<R, F>(state: &AppState, id: &str, f: F) -> Result<R, AppError>
where
    R: Send + 'static,
    F: FnOnce(&mut Vm) -> R + Send + 'static,
{
    let vm = state
        .sessions
        .get(id)
        .ok_or_else(|| AppError::not_found("session"))?;
    tokio::task::spawn_blocking(move || {
        let mut guard = lock_vm(&vm);
        f(&mut *guard)
    })
        .await
        .map_err(|e| AppError::internal(format!("execution task failed: {e}")))
}

fn log_fault(id: &str, view: &SessionView) {
    if let Some(fault) = &view.fault {
        warn!(session = %id, %fault, "session faulted");
    }
}

// ── sessions ────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateReq>,
) -> Result<(StatusCode, Json<SessionInfo>), AppError> {
    let vm = build(&req.files, req.entry.as_deref())?;
    Ok((StatusCode::CREATED, Json(open(&state, vm))))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    session(&state, &id, |vm| Json(SessionView::of(&id, vm)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sessions.remove(&id) {
        info!(session = %id, "session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("session"))
    }
}

// ── execution ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StepReq {
    pub count: Option<u64>,
}

pub async fn step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StepReq>>,
) -> Result<Json<SessionView>, AppError> {
    let count = body
        .and_then(|Json(b)| b.count)
        .unwrap_or(1)
        .min(MAX_BUDGET);
    let sid = id.clone();
    let view = session_blocking(&state, &id, move |vm| {
        let start = vm.steps();
        for _ in 0..count {
            if !matches!(vm.step(), Ok(None)) {
                break;
            }
        }
        let ran = vm.steps() - start;
        SessionView::of(&sid, vm).ran(ran)
    })
    .await?;
    log_fault(&id, &view);
    Ok(Json(view))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunReq {
    pub budget: Option<u64>,
}

/// One host tick: resume if needed, then execute up to `budget` instructions.
pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunReq>>,
) -> Result<Json<SessionView>, AppError> {
    let budget = body
        .and_then(|Json(b)| b.budget)
        .unwrap_or(state.steps_per_tick)
        .min(MAX_BUDGET);
    let sid = id.clone();
    let view = session_blocking(&state, &id, move |vm| {
        vm.run();
        let report = vm.run_for(budget);
        SessionView::of(&sid, vm).ran(report.steps)
    })
    .await?;
    log_fault(&id, &view);
    Ok(Json(view))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    session(&state, &id, |vm| {
        vm.pause();
        Json(SessionView::of(&id, vm))
    })
}

pub async fn reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    session(&state, &id, |vm| {
        vm.reset();
        Json(SessionView::of(&id, vm))
    })
}

// ── memory-mapped I/O ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub address: i32,
    pub length: Option<usize>,
}

pub async fn read_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MemoryQuery>,
) -> Result<Json<Value>, AppError> {
    let length = q.length.unwrap_or(1);
    if length > MEMORY_SIZE {
        return Err(AppError::bad_request(format!(
            "length {length} exceeds memory size {MEMORY_SIZE}"
        )));
    }
    let values = session(&state, &id, |vm| {
        vm.read_range(q.address, length).map(|w| w.to_vec())
    })??;
    Ok(Json(json!({ "address": q.address, "values": values })))
}

#[derive(Debug, Deserialize)]
pub struct MemoryWrite {
    pub address: i32,
    pub value: Word,
}

pub async fn write_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MemoryWrite>,
) -> Result<Json<Value>, AppError> {
    session(&state, &id, |vm| vm.write(req.address, req.value))??;
    Ok(Json(json!({ "address": req.address, "value": req.value })))
}

/// Screen words as big-endian bytes; bit 0 of each word is its leftmost pixel.
pub async fn screen(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let bytes = session(&state, &id, |vm| {
        vm.screen()
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect::<Vec<u8>>()
    })?;
    Ok(Json(json!({
        "width": SCREEN_WIDTH,
        "height": SCREEN_HEIGHT,
        "words_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
    })))
}

#[derive(Debug, Deserialize)]
pub struct KeyReq {
    /// Key name, single character, numeric code, or null for release.
    #[serde(default)]
    pub key: Value,
}

fn resolve_key(key: &Value) -> Result<Word, AppError> {
    match key {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .filter(|c| (0..=Word::MAX as i64).contains(c))
            .map(|c| c as Word)
            .ok_or_else(|| AppError::bad_request(format!("key code {n} out of range"))),
        Value::String(s) => key_code(s).ok_or_else(|| AppError::bad_request(format!("unknown key '{s}'"))),
        _ => Err(AppError::bad_request("key must be a name, a code or null")),
    }
}

pub async fn keyboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<KeyReq>,
) -> Result<Json<Value>, AppError> {
    let code = resolve_key(&req.key)?;
    session(&state, &id, |vm| vm.set_keyboard(code))?;
    Ok(Json(json!({ "key": code })))
}

// ── compile service ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CompileReq {
    pub files: Vec<SourceFile>,
}

#[derive(Debug, Deserialize)]
struct CompileReply {
    #[serde(default)]
    vm: Vec<SourceFile>,
    #[serde(default)]
    asm: String,
    #[serde(default)]
    hack: String,
    error: Option<String>,
}

/// Forwards sources to the compile service and opens a session on the returned VM code.
pub async fn compile(
    State(state): State<AppState>,
    Json(req): Json<CompileReq>,
) -> Result<Json<Value>, AppError> {
    if req.files.is_empty() {
        return Err(AppError::bad_request("no files provided"));
    }
    let url = format!("{}/compile", state.compile_url);
    info!(files = req.files.len(), %url, "compile request");

    let resp = state
        .http
        .post(&url)
        .json(&json!({ "files": req.files }))
        .send()
        .await
        .map_err(|e| AppError::bad_gateway(format!("compile service unreachable: {e}")))?;
    let status = resp.status();
    let reply: CompileReply = resp
        .json()
        .await
        .map_err(|e| AppError::bad_gateway(format!("invalid compile service response: {e}")))?;

    if let Some(err) = reply.error {
        return Err(AppError::unprocessable("compile_error", err));
    }
    if !status.is_success() {
        return Err(AppError::bad_gateway(format!(
            "compile service returned HTTP {}",
            status.as_u16()
        )));
    }

    let mut vm_files = reply.vm;
    vm_files.sort_by(|a, b| a.name.cmp(&b.name));
    let vm = build(&vm_files, None)?;
    let session = open(&state, vm);
    Ok(Json(json!({
        "session": session,
        "vm": vm_files,
        "asm": reply.asm,
        "hack": reply.hack,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_resolve_from_names_codes_and_null() {
        assert_eq!(resolve_key(&json!("Enter")).unwrap(), 128);
        assert_eq!(resolve_key(&json!("x")).unwrap(), 120);
        assert_eq!(resolve_key(&json!(140)).unwrap(), 140);
        assert_eq!(resolve_key(&Value::Null).unwrap(), 0);
        assert!(resolve_key(&json!(-1)).is_err());
        assert!(resolve_key(&json!(70000)).is_err());
        assert!(resolve_key(&json!("Meta")).is_err());
        assert!(resolve_key(&json!([1])).is_err());
    }

    #[test]
    fn build_rejects_empty_file_list() {
        let err = build(&[], None).err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_view_reports_halt() {
        let files = [SourceFile {
            name: "Main.vm".into(),
            content: "function Main.main 0\npush constant 3\nreturn\n".into(),
        }];
        let mut vm = build(&files, None).unwrap();
        vm.run_to_end(10);
        let view = serde_json::to_value(SessionView::of("vm-1", &vm)).unwrap();
        assert_eq!(view["status"], "halted");
        assert_eq!(view["exit_code"], 3);
        assert!(view.get("fault").is_none());
        assert!(view.get("ran").is_none());
    }
}
