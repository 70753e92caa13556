use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as RoutePath, Query, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::{Mutex, Semaphore},
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    preview_cache: Arc<Mutex<HashMap<String, Preview>>>,
    worker_slots: Arc<Semaphore>,
    worker_capacity: usize,
    root_dir: PathBuf,
    downloads_dir: PathBuf,
    started_at: DateTime<Utc>,
}

const DEFAULT_WORKER_SLOTS: usize = 2;
const PREVIEW_CACHE_TTL_SECONDS: i64 = 180;
const PREVIEW_CACHE_MAX_ENTRIES: usize = 1_000;
const JOB_LOG_MAX_LINES: usize = 200;
const JOB_LOG_TAIL_LINES: usize = 25;
const FETCH_TIMEOUT_SECONDS: u64 = 30 * 60;
const PREVIEW_TIMEOUT_SECONDS: u64 = 60;
const STALE_JOB_DIR_SECONDS: u64 = 2 * 60 * 60;
const MAX_FILENAME_CHARS: usize = 140;
const DEDUPE_MAX_PROBES: u32 = 99;
const FALLBACK_FILENAME: &str = "download";
const MP3_TARGET_QUALITY: &str = "192K";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

const HINT_UNAVAILABLE: &str = "The media is unavailable (private, removed, region locked or age \
     restricted). Try a different link or configure a cookies file.";
const HINT_EMPTY_FILE: &str = "This usually means the request was blocked or the chosen format is \
     unavailable. Try the video download instead or configure a cookies file.";
const HINT_UNSUPPORTED_URL: &str =
    "The link is invalid or not supported. Try a direct link to the media page.";
const HINT_COOKIES_REQUIRED: &str = "Facebook downloads are often unstable without cookies. Set \
     COOKIES_FILE or place a cookies.txt next to the backend.";
const FACEBOOK_PREVIEW_WARNING: &str = "Facebook previews can be limited without cookies. If the \
     title, thumbnail or description are missing, set COOKIES_FILE or place a cookies.txt next \
     to the backend.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DownloadType {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AudioFormat {
    Mp3,
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone)]
struct Job {
    id: String,
    status: JobStatus,
    download_type: DownloadType,
    audio_format: AudioFormat,
    url: String,
    filename: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Preview {
    url: String,
    title: Option<String>,
    uploader: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    extractor: Option<String>,
    warning: Option<String>,
    needs_cookies: bool,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    download_type: DownloadType,
    #[serde(default)]
    audio_format: Option<AudioFormat>,
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    url: String,
}

#[derive(Debug, Serialize)]
struct JobStatusPayload {
    id: String,
    status: JobStatus,
    download_type: DownloadType,
    audio_format: AudioFormat,
    filename: Option<String>,
    error: Option<String>,
}

impl From<&Job> for JobStatusPayload {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            download_type: job.download_type,
            audio_format: job.audio_format,
            filename: job.filename.clone(),
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PreviewPayload {
    ok: bool,
    url: String,
    title: Option<String>,
    uploader: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    duration_text: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    extractor: Option<String>,
    warning: Option<String>,
    needs_cookies: bool,
}

impl From<Preview> for PreviewPayload {
    fn from(preview: Preview) -> Self {
        let duration_text = human_duration(preview.duration);
        Self {
            ok: true,
            url: preview.url,
            title: preview.title,
            uploader: preview.uploader,
            description: preview.description,
            duration: preview.duration,
            duration_text,
            thumbnail: preview.thumbnail,
            webpage_url: preview.webpage_url,
            extractor: preview.extractor,
            warning: preview.warning,
            needs_cookies: preview.needs_cookies,
        }
    }
}

#[derive(Debug, Serialize)]
struct PreviewFailure {
    ok: bool,
    url: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Metadata printed by `yt-dlp --dump-json --no-simulate` during a fetch.
#[derive(Debug, Deserialize)]
struct FetchedInfo {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    entries: Option<Vec<FetchedInfo>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpPreviewInfo {
    #[serde(rename = "_type")]
    kind: Option<String>,
    entries: Option<Vec<YtDlpPreviewInfo>>,
    title: Option<String>,
    uploader: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<YtDlpThumbnail>>,
    webpage_url: Option<String>,
    extractor_key: Option<String>,
    extractor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let downloads_dir = std::env::var("DOWNLOADS_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| root_dir.join("downloads"));

    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the downloads directory: {error}"))
        })?;

    cleanup_stale_job_dirs(&downloads_dir, STALE_JOB_DIR_SECONDS).await;

    let worker_capacity = read_usize_env("WORKER_SLOTS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_WORKER_SLOTS);

    match find_ffmpeg_dir(&root_dir) {
        Some(dir) => info!("ffmpeg found at {}", dir.display()),
        None => warn!("ffmpeg was not found. MP3 conversion and stream merging are disabled."),
    }
    if maybe_cookie_file(&root_dir).is_none() {
        info!("No cookies file configured. Set COOKIES_FILE for cookie-gated platforms.");
    }

    let state = AppState {
        jobs: Arc::new(Mutex::new(HashMap::new())),
        preview_cache: Arc::new(Mutex::new(HashMap::new())),
        worker_slots: Arc::new(Semaphore::new(worker_capacity)),
        worker_capacity,
        root_dir,
        downloads_dir,
        started_at: Utc::now(),
    };

    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/preview", get(preview))
        .route("/api/download", post(start_download))
        .route("/api/jobs/{job_id}", get(job_status))
        .route("/api/files/{job_id}", get(download_file))
        .route("/api/diagnostics", get(diagnostics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Backend ready at http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn diagnostics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ffmpeg_dir = find_ffmpeg_dir(&state.root_dir);
    Json(serde_json::json!({
        "started_at": state.started_at,
        "ffmpeg_available": ffmpeg_dir.is_some(),
        "ffmpeg_location": ffmpeg_dir.map(|dir| dir.display().to_string()),
        "cookies_file": maybe_cookie_file(&state.root_dir).map(|path| path.display().to_string()),
        "downloads_dir": state.downloads_dir.display().to_string(),
        "worker_slots": state.worker_capacity,
    }))
}

async fn preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response, ApiError> {
    let url = query.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("Provide a URL to preview."));
    }

    // Extraction problems are data, not HTTP errors: the page keeps working.
    match preview_for_url(&state, &url).await {
        Ok(preview) => Ok(Json(PreviewPayload::from(preview)).into_response()),
        Err(error) => Ok(Json(PreviewFailure {
            ok: false,
            url,
            error,
        })
        .into_response()),
    }
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("Provide a URL before downloading."));
    }

    let audio_format = payload.audio_format.unwrap_or(AudioFormat::Mp3);
    let job = create_job(&state.jobs, payload.download_type, audio_format, url).await;
    info!("job {} queued for {}", job.id, job.url);

    spawn_job(state.clone(), job.id.clone());

    Ok((StatusCode::ACCEPTED, Json(JobStatusPayload::from(&job))).into_response())
}

async fn job_status(
    State(state): State<AppState>,
    RoutePath(job_id): RoutePath<String>,
) -> Result<Json<JobStatusPayload>, ApiError> {
    let job = get_job(&state.jobs, &job_id)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown job."))?;
    Ok(Json(JobStatusPayload::from(&job)))
}

async fn download_file(
    State(state): State<AppState>,
    RoutePath(job_id): RoutePath<String>,
) -> Result<Response, ApiError> {
    let job = get_job(&state.jobs, &job_id)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown job."))?;

    let filename = match (&job.status, &job.filename) {
        (JobStatus::Done, Some(filename)) => filename.clone(),
        _ => return Err(ApiError::not_ready("The file is not ready yet.")),
    };

    let file_path = state.downloads_dir.join(&job.id).join(&filename);
    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            warn!(
                "artifact missing for finished job {}: {}",
                job.id,
                file_path.display()
            );
            return Err(ApiError::not_found("The downloaded file was not found."));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not open the downloaded file: {error}"
            )));
        }
    };

    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("Could not read the downloaded file: {error}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

// ---------------------------------------------------------------------------
// Job registry

async fn create_job(
    jobs: &Mutex<HashMap<String, Job>>,
    download_type: DownloadType,
    audio_format: AudioFormat,
    url: &str,
) -> Job {
    let job = Job {
        id: Uuid::new_v4().simple().to_string(),
        status: JobStatus::Queued,
        download_type,
        audio_format,
        url: url.to_string(),
        filename: None,
        error: None,
    };
    jobs.lock().await.insert(job.id.clone(), job.clone());
    job
}

async fn get_job(jobs: &Mutex<HashMap<String, Job>>, job_id: &str) -> Option<Job> {
    jobs.lock().await.get(job_id).cloned()
}

/// Single lock acquisition per transition, so pollers never observe a job
/// whose status and filename/error disagree.
async fn transition_job(
    jobs: &Mutex<HashMap<String, Job>>,
    job_id: &str,
    status: JobStatus,
    filename: Option<String>,
    error: Option<String>,
) {
    let mut jobs = jobs.lock().await;
    if let Some(job) = jobs.get_mut(job_id) {
        job.status = status;
        job.filename = filename;
        job.error = error;
    }
}

// ---------------------------------------------------------------------------
// Worker pool and job runner

/// Hands the job to the worker pool and returns immediately. Slots are
/// granted in submission order once a worker frees up.
fn spawn_job(state: AppState, job_id: String) {
    tokio::spawn(async move {
        let _permit = match state.worker_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                transition_job(
                    &state.jobs,
                    &job_id,
                    JobStatus::Error,
                    None,
                    Some("The worker pool is no longer accepting jobs.".to_string()),
                )
                .await;
                return;
            }
        };

        let runner = tokio::spawn(run_job(state.clone(), job_id.clone()));
        if let Err(join_error) = runner.await {
            // A panic inside the runner must still leave the job terminal,
            // otherwise pollers would wait forever.
            warn!("job {job_id} runner crashed: {join_error}");
            transition_job(
                &state.jobs,
                &job_id,
                JobStatus::Error,
                None,
                Some(format!(
                    "The download task crashed unexpectedly: {join_error}"
                )),
            )
            .await;
        }
    });
}

async fn run_job(state: AppState, job_id: String) {
    transition_job(&state.jobs, &job_id, JobStatus::Running, None, None).await;
    let Some(job) = get_job(&state.jobs, &job_id).await else {
        return;
    };

    let mut log = JobLog::from_env();
    let cookie_file = maybe_cookie_file(&state.root_dir);
    let job_dir = state.downloads_dir.join(&job.id);

    match fetch_and_finalize(
        &job,
        &job_dir,
        cookie_file.as_deref(),
        &state.root_dir,
        &mut log,
    )
    .await
    {
        Ok(filename) => {
            info!("job {} finished: {filename}", job.id);
            transition_job(&state.jobs, &job.id, JobStatus::Done, Some(filename), None).await;
        }
        Err(base) => {
            warn!("job {} failed: {base}", job.id);
            let message = compose_job_error(&base, &job.url, cookie_file.is_some(), &log);
            transition_job(&state.jobs, &job.id, JobStatus::Error, None, Some(message)).await;
        }
    }
}

async fn fetch_and_finalize(
    job: &Job,
    job_dir: &Path,
    cookie_file: Option<&Path>,
    root_dir: &Path,
    log: &mut JobLog,
) -> Result<String, String> {
    // Ids are unique per submission, so an existing directory can only be
    // leftovers from an interrupted cleanup.
    if job_dir.exists() {
        let _ = tokio::fs::remove_dir_all(job_dir).await;
    }
    tokio::fs::create_dir_all(job_dir)
        .await
        .map_err(|error| format!("Could not create the job directory: {error}"))?;

    let ffmpeg_dir = find_ffmpeg_dir(root_dir);
    let args = build_fetch_args(job, job_dir, cookie_file, ffmpeg_dir.as_deref());
    let output = run_yt_dlp(args, FETCH_TIMEOUT_SECONDS).await?;
    log.absorb_stderr(&output.stderr);
    if !output.status.success() {
        return Err(extractor_error_message(&output.stderr));
    }

    let info = parse_fetched_info(&output.stdout);
    finalize_artifact(job_dir, info.as_ref(), &job.id).await
}

fn parse_fetched_info(stdout: &[u8]) -> Option<FetchedInfo> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{'))?;
    let info: FetchedInfo = serde_json::from_str(line).ok()?;
    Some(first_entry(info))
}

fn first_entry(mut info: FetchedInfo) -> FetchedInfo {
    if matches!(info.kind.as_deref(), Some("playlist" | "multi_video"))
        && let Some(entries) = info.entries.as_mut()
        && !entries.is_empty()
    {
        return entries.remove(0);
    }
    info
}

/// Picks the artifact, verifies it and gives it a readable name. The rename
/// is cosmetic: if metadata is missing or the rename fails, the id-based
/// filename is kept and the job still succeeds.
async fn finalize_artifact(
    job_dir: &Path,
    info: Option<&FetchedInfo>,
    job_id: &str,
) -> Result<String, String> {
    let Some(mut produced) = pick_latest_file(job_dir).await? else {
        return Err("No artifact was produced by the extractor.".to_string());
    };

    let size = tokio::fs::metadata(&produced)
        .await
        .map_err(|error| format!("Could not read the downloaded file: {error}"))?
        .len();
    if size == 0 {
        return Err("The downloaded file is empty (0 bytes).".to_string());
    }

    if let Some(info) = info {
        let title = info
            .title
            .as_deref()
            .map(fix_mojibake)
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
        let source_id = info.id.as_deref().unwrap_or(job_id);
        let extension = produced
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let desired = format!(
            "{}{extension}",
            sanitize_filename(&format!("{title} [{source_id}]"))
        );
        let target = dedupe_path(&produced.with_file_name(desired));
        if tokio::fs::rename(&produced, &target).await.is_ok() {
            produced = target;
        }
    }

    produced
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| "Could not determine the artifact file name.".to_string())
}

async fn pick_latest_file(dir: &Path) -> Result<Option<PathBuf>, String> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|error| format!("Could not open the job directory: {error}"))?;

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| format!("Could not list the job directory: {error}"))?
    {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        if latest.as_ref().is_none_or(|(stamp, _)| modified >= *stamp) {
            latest = Some((modified, entry.path()));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

// ---------------------------------------------------------------------------
// Failure classification

fn compose_job_error(base: &str, url: &str, has_cookie_file: bool, log: &JobLog) -> String {
    let mut message = base.to_string();
    if let Some(hint) = failure_hint(base, url, has_cookie_file) {
        message.push_str("\n\nHint: ");
        message.push_str(hint);
    }

    let tail = log.tail(JOB_LOG_TAIL_LINES);
    if !tail.is_empty() {
        message.push_str("\n\nDetails (yt-dlp):\n");
        message.push_str(&tail.join("\n"));
    }
    message
}

// Best-effort matching on the extractor's error phrasing; first match wins.
fn failure_hint(base: &str, url: &str, has_cookie_file: bool) -> Option<&'static str> {
    let lower = base.to_lowercase();
    if lower.contains("unavailable") {
        Some(HINT_UNAVAILABLE)
    } else if lower.contains("0 bytes") || lower.contains("file is empty") {
        Some(HINT_EMPTY_FILE)
    } else if lower.contains("unsupported url") {
        Some(HINT_UNSUPPORTED_URL)
    } else if !has_cookie_file && is_cookie_gated_host(url) {
        Some(HINT_COOKIES_REQUIRED)
    } else {
        None
    }
}

fn is_cookie_gated_host(url: &str) -> bool {
    is_domain_match(url, "facebook.com") || is_domain_match(url, "fb.watch")
}

fn is_domain_match(input: &str, domain: &str) -> bool {
    Url::parse(input)
        .ok()
        .and_then(|parsed| parsed.host_str().map(ToString::to_string))
        .map(|host| {
            let host = host.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Job log

/// Bounded log of leveled extractor lines for one job. Only the tail ends up
/// in user-facing error messages.
struct JobLog {
    lines: VecDeque<String>,
    verbose: bool,
}

impl JobLog {
    fn new(verbose: bool) -> Self {
        Self {
            lines: VecDeque::new(),
            verbose,
        }
    }

    fn from_env() -> Self {
        let verbose = std::env::var("YTDLP_VERBOSE").is_ok_and(|value| !value.trim().is_empty());
        Self::new(verbose)
    }

    fn push(&mut self, level: &str, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.lines.push_back(format!("[{level}] {message}"));
        while self.lines.len() > JOB_LOG_MAX_LINES {
            self.lines.pop_front();
        }
    }

    fn absorb_stderr(&mut self, stderr: &[u8]) {
        for line in String::from_utf8_lossy(stderr).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("ERROR:") {
                self.push("error", rest);
            } else if let Some(rest) = line.strip_prefix("WARNING:") {
                self.push("warning", rest);
            } else if self.verbose {
                self.push("debug", line);
            }
        }
    }

    fn tail(&self, count: usize) -> Vec<String> {
        self.lines
            .iter()
            .skip(self.lines.len().saturating_sub(count))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Extractor adapter

async fn run_yt_dlp(
    args: Vec<String>,
    timeout_seconds: u64,
) -> Result<std::process::Output, String> {
    let command_future = Command::new("yt-dlp").args(args).output();
    let output = timeout(Duration::from_secs(timeout_seconds), command_future)
        .await
        .map_err(|_| "yt-dlp did not finish within the time limit.".to_string())?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                "yt-dlp is not installed on this system. Install yt-dlp and restart the backend."
                    .to_string()
            } else {
                format!("Could not run yt-dlp: {error}")
            }
        })?;
    Ok(output)
}

fn extractor_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(|line| {
            line.strip_prefix("ERROR:")
                .map(str::trim)
                .unwrap_or(line)
                .to_string()
        })
        .unwrap_or_else(|| "yt-dlp could not complete the operation.".to_string())
}

fn build_fetch_args(
    job: &Job,
    job_dir: &Path,
    cookie_file: Option<&Path>,
    ffmpeg_dir: Option<&Path>,
) -> Vec<String> {
    // Titles on some platforms contain characters that are illegal in
    // filenames. Download under a safe id-based template, rename afterwards.
    let mut args: Vec<String> = vec![
        "--no-playlist".into(),
        "--no-progress".into(),
        "--dump-json".into(),
        "--no-simulate".into(),
        "--retries".into(),
        "5".into(),
        "--fragment-retries".into(),
        "5".into(),
        "--extractor-retries".into(),
        "3".into(),
        "--socket-timeout".into(),
        "20".into(),
        "--user-agent".into(),
        DEFAULT_USER_AGENT.into(),
        "--add-headers".into(),
        format!("Accept-Language:{ACCEPT_LANGUAGE}"),
        "--windows-filenames".into(),
        "-o".into(),
        format!("{}/%(id)s.%(ext)s", job_dir.to_string_lossy()),
    ];

    if let Some(cookie_file) = cookie_file {
        args.push("--cookies".into());
        args.push(cookie_file.to_string_lossy().into_owned());
    }

    match ffmpeg_dir {
        Some(dir) => {
            args.push("--ffmpeg-location".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        None => {
            // Container fixup runs ffmpeg; without one it must be off.
            args.push("--fixup".into());
            args.push("never".into());
        }
    }

    match job.download_type {
        DownloadType::Audio => {
            args.push("-f".into());
            args.push("bestaudio/best".into());
            // MP3 conversion needs ffmpeg. Otherwise the user receives the
            // best available source container (m4a/webm/...).
            if job.audio_format == AudioFormat::Mp3 && ffmpeg_dir.is_some() {
                args.push("-x".into());
                args.push("--audio-format".into());
                args.push("mp3".into());
                args.push("--audio-quality".into());
                args.push(MP3_TARGET_QUALITY.into());
            }
        }
        DownloadType::Video => {
            if ffmpeg_dir.is_some() {
                args.push("-f".into());
                args.push("bv*+ba/best".into());
                args.push("--merge-output-format".into());
                args.push("mp4".into());
            } else {
                // Merging separate video and audio streams needs ffmpeg, so
                // settle for a single pre-muxed stream.
                args.push("-f".into());
                args.push("best[ext=mp4]/best".into());
            }
        }
    }

    args.push(job.url.clone());
    args
}

fn build_preview_args(url: &str, cookie_file: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-J".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--retries".into(),
        "2".into(),
        "--socket-timeout".into(),
        "15".into(),
        "--user-agent".into(),
        DEFAULT_USER_AGENT.into(),
        "--add-headers".into(),
        format!("Accept-Language:{ACCEPT_LANGUAGE}"),
    ];

    if let Some(cookie_file) = cookie_file {
        args.push("--cookies".into());
        args.push(cookie_file.to_string_lossy().into_owned());
    }

    args.push(url.to_string());
    args
}

// ---------------------------------------------------------------------------
// Preview cache

async fn preview_for_url(state: &AppState, url: &str) -> Result<Preview, String> {
    {
        let cache = state.preview_cache.lock().await;
        if let Some(cached) = fresh_preview(&cache, url, Utc::now()) {
            debug!("preview cache hit for {url}");
            return Ok(cached);
        }
    }

    // The extractor call happens outside the lock so previews for different
    // URLs do not serialize behind the network round trip. Two concurrent
    // misses for the same URL may both fetch; the last writer wins.
    let preview = fetch_preview(state, url).await?;

    let mut cache = state.preview_cache.lock().await;
    prune_preview_cache(&mut cache, Utc::now());
    cache.insert(url.to_string(), preview.clone());
    Ok(preview)
}

fn fresh_preview(
    cache: &HashMap<String, Preview>,
    url: &str,
    now: DateTime<Utc>,
) -> Option<Preview> {
    cache
        .get(url)
        .filter(|preview| (now - preview.captured_at).num_seconds() < PREVIEW_CACHE_TTL_SECONDS)
        .cloned()
}

fn prune_preview_cache(cache: &mut HashMap<String, Preview>, now: DateTime<Utc>) {
    cache.retain(|_, preview| {
        (now - preview.captured_at).num_seconds() < PREVIEW_CACHE_TTL_SECONDS
    });

    if cache.len() <= PREVIEW_CACHE_MAX_ENTRIES {
        return;
    }

    let overflow = cache.len() - PREVIEW_CACHE_MAX_ENTRIES;
    let mut oldest = cache
        .iter()
        .map(|(url, preview)| (url.clone(), preview.captured_at))
        .collect::<Vec<_>>();
    oldest.sort_by_key(|(_, captured_at)| *captured_at);
    for (url, _) in oldest.into_iter().take(overflow) {
        cache.remove(&url);
    }
}

async fn fetch_preview(state: &AppState, url: &str) -> Result<Preview, String> {
    let cookie_file = maybe_cookie_file(&state.root_dir);
    let args = build_preview_args(url, cookie_file.as_deref());
    let output = run_yt_dlp(args, PREVIEW_TIMEOUT_SECONDS).await?;
    if !output.status.success() {
        return Err(extractor_error_message(&output.stderr));
    }

    let info: YtDlpPreviewInfo = serde_json::from_slice(&output.stdout)
        .map_err(|error| format!("Could not parse extractor metadata: {error}"))?;
    let info = preview_first_entry(info);

    let thumbnail = best_thumbnail(&info);
    let YtDlpPreviewInfo {
        title,
        uploader,
        description,
        duration,
        webpage_url,
        extractor_key,
        extractor,
        ..
    } = info;

    let extractor = extractor_key.or(extractor);
    let title = title.as_deref().map(fix_mojibake);
    let uploader = uploader.as_deref().map(fix_mojibake);
    let description = description.as_deref().map(fix_mojibake);

    let mut needs_cookies = false;
    let mut warning = None;
    if cookie_file.is_none()
        && extractor
            .as_deref()
            .is_some_and(|name| name.to_ascii_lowercase().starts_with("facebook"))
    {
        // Facebook often withholds metadata without cookies. Not fatal, the
        // caller only gets a hint.
        needs_cookies = true;
        if title.is_none() || thumbnail.is_none() || description.is_none() {
            warning = Some(FACEBOOK_PREVIEW_WARNING.to_string());
        }
    }

    Ok(Preview {
        url: url.to_string(),
        title,
        uploader,
        description,
        duration,
        thumbnail,
        webpage_url,
        extractor,
        warning,
        needs_cookies,
        captured_at: Utc::now(),
    })
}

fn preview_first_entry(mut info: YtDlpPreviewInfo) -> YtDlpPreviewInfo {
    if matches!(info.kind.as_deref(), Some("playlist" | "multi_video"))
        && let Some(entries) = info.entries.as_mut()
        && !entries.is_empty()
    {
        return entries.remove(0);
    }
    info
}

fn best_thumbnail(info: &YtDlpPreviewInfo) -> Option<String> {
    if let Some(thumbnail) = info.thumbnail.as_deref().and_then(non_empty) {
        return Some(thumbnail.to_string());
    }

    let mut best_url: Option<&str> = None;
    let mut best_score: i64 = -1;
    for thumb in info.thumbnails.as_deref().unwrap_or_default() {
        let Some(url) = thumb.url.as_deref().and_then(non_empty) else {
            continue;
        };
        let score = match (thumb.width, thumb.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                i64::from(width) * i64::from(height)
            }
            _ => 0,
        };
        if score >= best_score {
            best_score = score;
            best_url = Some(url);
        }
    }
    best_url.map(ToString::to_string)
}

// ---------------------------------------------------------------------------
// Environment probes

fn maybe_cookie_file(root_dir: &Path) -> Option<PathBuf> {
    if let Ok(value) = std::env::var("COOKIES_FILE")
        && let Some(value) = non_empty(&value)
    {
        let path = PathBuf::from(value);
        if path.is_file() {
            return Some(path);
        }
    }

    let fallback = root_dir.join("cookies.txt");
    fallback.is_file().then_some(fallback)
}

#[cfg(windows)]
const FFMPEG_BINARIES: [&str; 2] = ["ffmpeg.exe", "ffprobe.exe"];
#[cfg(not(windows))]
const FFMPEG_BINARIES: [&str; 2] = ["ffmpeg", "ffprobe"];

fn dir_has_ffmpeg(dir: &Path) -> bool {
    FFMPEG_BINARIES
        .iter()
        .any(|binary| dir.join(binary).is_file())
}

/// Directory containing ffmpeg/ffprobe, if any: explicit override first, then
/// bundled locations, then PATH.
fn find_ffmpeg_dir(root_dir: &Path) -> Option<PathBuf> {
    if let Ok(value) = std::env::var("FFMPEG_PATH")
        && let Some(value) = non_empty(&value)
    {
        let path = PathBuf::from(value);
        if path.is_dir() && dir_has_ffmpeg(&path) {
            return Some(path);
        }
        if path.is_file()
            && let Some(parent) = path.parent()
        {
            return Some(parent.to_path_buf());
        }
    }

    for candidate in [
        root_dir.join("ffmpeg").join("bin"),
        root_dir.join("tools").join("ffmpeg").join("bin"),
    ] {
        if dir_has_ffmpeg(&candidate) {
            return Some(candidate);
        }
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find(|dir| dir_has_ffmpeg(dir))
}

async fn cleanup_stale_job_dirs(downloads_dir: &Path, older_than_secs: u64) {
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open the downloads directory for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        if now.duration_since(modified).unwrap_or_default() < max_age {
            continue;
        }

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => info!("removed stale job data: {}", path.display()),
            Err(error) if error.kind() != ErrorKind::NotFound => {
                warn!("Could not remove stale job data {}: {error}", path.display());
            }
            Err(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration helpers

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not configured. Falling back to development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(normalize_origin)
                .is_some_and(|value| allowed_origins.contains(&value))
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s)",
        allowed_origins.len()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

// ---------------------------------------------------------------------------
// Filenames and text repair

const INVALID_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Keeps Unicode but removes characters invalid on common filesystems, then
/// bounds the length so deep paths stay under Windows MAX_PATH.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) || (c as u32) < 32 {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = cleaned.trim_matches([' ', '.']);
    if cleaned.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }

    if cleaned.chars().count() <= MAX_FILENAME_CHARS {
        return cleaned.to_string();
    }
    let truncated: String = cleaned.chars().take(MAX_FILENAME_CHARS).collect();
    let truncated = truncated.trim_end_matches([' ', '.']);
    if truncated.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        truncated.to_string()
    }
}

fn dedupe_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    for index in 1..=DEDUPE_MAX_PROBES {
        let candidate = path.with_file_name(format!("{stem} ({index}){suffix}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

const MOJIBAKE_MARKERS: [char; 3] = ['â', 'Ã', 'ð'];

fn mojibake_score(text: &str) -> usize {
    text.chars().filter(|c| MOJIBAKE_MARKERS.contains(c)).count()
}

/// Some extractors occasionally return text that looks like UTF-8 bytes
/// decoded as Windows-1252 or Latin-1 (e.g. "â€™" instead of "’"). Re-encode
/// under both legacy encodings, decode as UTF-8 again and keep whichever
/// variant carries the fewest marker characters, preferring the input on ties.
fn fix_mojibake(text: &str) -> String {
    let original_score = mojibake_score(text);
    if original_score == 0 {
        return text.to_string();
    }

    let mut best = text.to_string();
    let mut best_score = original_score;
    for bytes in [encode_windows_1252(text), encode_latin_1(text)] {
        let candidate = String::from_utf8_lossy(&bytes).replace('\u{FFFD}', "");
        let score = mojibake_score(&candidate);
        if score < best_score {
            best = candidate;
            best_score = score;
        }
    }
    best
}

fn encode_latin_1(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| u8::try_from(c as u32).ok())
        .collect()
}

// Windows-1252 is Latin-1 with printable characters mapped into the
// 0x80..0x9F range. Characters with no representation are dropped.
fn encode_windows_1252(text: &str) -> Vec<u8> {
    text.chars()
        .filter_map(|c| match c {
            '\u{20AC}' => Some(0x80),
            '\u{201A}' => Some(0x82),
            '\u{0192}' => Some(0x83),
            '\u{201E}' => Some(0x84),
            '\u{2026}' => Some(0x85),
            '\u{2020}' => Some(0x86),
            '\u{2021}' => Some(0x87),
            '\u{02C6}' => Some(0x88),
            '\u{2030}' => Some(0x89),
            '\u{0160}' => Some(0x8A),
            '\u{2039}' => Some(0x8B),
            '\u{0152}' => Some(0x8C),
            '\u{017D}' => Some(0x8E),
            '\u{2018}' => Some(0x91),
            '\u{2019}' => Some(0x92),
            '\u{201C}' => Some(0x93),
            '\u{201D}' => Some(0x94),
            '\u{2022}' => Some(0x95),
            '\u{2013}' => Some(0x96),
            '\u{2014}' => Some(0x97),
            '\u{02DC}' => Some(0x98),
            '\u{2122}' => Some(0x99),
            '\u{0161}' => Some(0x9A),
            '\u{203A}' => Some(0x9B),
            '\u{0153}' => Some(0x9C),
            '\u{017E}' => Some(0x9E),
            '\u{0178}' => Some(0x9F),
            c if (c as u32) < 0x80 => Some(c as u8),
            c if (0xA0..=0xFF).contains(&(c as u32)) => Some(c as u8),
            _ => None,
        })
        .collect()
}

fn human_duration(seconds: Option<f64>) -> Option<String> {
    let seconds = seconds?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    let total = seconds.round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        Some(format!("{hours}:{minutes:02}:{secs:02}"))
    } else {
        Some(format!("{minutes}:{secs:02}"))
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')' | '[' | ']')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview_fixture(url: &str, captured_at: DateTime<Utc>) -> Preview {
        Preview {
            url: url.to_string(),
            title: Some("title".to_string()),
            uploader: None,
            description: None,
            duration: Some(12.0),
            thumbnail: None,
            webpage_url: None,
            extractor: None,
            warning: None,
            needs_cookies: false,
            captured_at,
        }
    }

    #[test]
    fn sanitizer_strips_forbidden_characters() {
        let cleaned = sanitize_filename("a<b>c:d\"e/f\\g|h?i*j\u{7}");
        assert_eq!(cleaned, "a_b_c_d_e_f_g_h_i_j_");
        assert!(cleaned.chars().all(|c| !INVALID_FILENAME_CHARS.contains(&c)));
    }

    #[test]
    fn sanitizer_preserves_non_ascii_text() {
        assert_eq!(sanitize_filename("日本語 タイトル"), "日本語 タイトル");
        assert_eq!(sanitize_filename("Crème brûlée"), "Crème brûlée");
    }

    #[test]
    fn sanitizer_collapses_whitespace_and_trims_edges() {
        assert_eq!(sanitize_filename("  My    title ..."), "My title");
        assert_eq!(sanitize_filename(". leading dot"), "leading dot");
    }

    #[test]
    fn sanitizer_falls_back_for_empty_results() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
        assert_eq!(sanitize_filename(" . . "), "download");
    }

    #[test]
    fn sanitizer_truncates_and_retrims_long_names() {
        let plain = "x".repeat(200);
        assert_eq!(sanitize_filename(&plain).chars().count(), MAX_FILENAME_CHARS);

        let input = format!("{}. extra words beyond the limit", "a".repeat(139));
        assert_eq!(sanitize_filename(&input), "a".repeat(139));
    }

    #[test]
    fn dedupe_is_identity_for_free_paths() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip.mp4");
        assert_eq!(dedupe_path(&base), base);
    }

    #[test]
    fn dedupe_numbers_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip.mp4");
        std::fs::write(&base, b"x").unwrap();

        let first = dedupe_path(&base);
        assert_eq!(first, dir.path().join("clip (1).mp4"));

        std::fs::write(&first, b"x").unwrap();
        assert_eq!(dedupe_path(&base), dir.path().join("clip (2).mp4"));
    }

    #[test]
    fn dedupe_returns_the_original_when_probes_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip.mp4");
        std::fs::write(&base, b"x").unwrap();
        for index in 1..=DEDUPE_MAX_PROBES {
            std::fs::write(dir.path().join(format!("clip ({index}).mp4")), b"x").unwrap();
        }
        assert_eq!(dedupe_path(&base), base);
    }

    #[test]
    fn mojibake_text_is_repaired() {
        assert_eq!(fix_mojibake("Itâ€™s here"), "It’s here");
        assert_eq!(fix_mojibake("CafÃ©"), "Café");
        assert_eq!(fix_mojibake("ðŸ˜€"), "😀");
    }

    #[test]
    fn clean_text_is_left_alone() {
        assert_eq!(fix_mojibake("Normal title"), "Normal title");
        assert_eq!(fix_mojibake("Münchën ünïcode"), "Münchën ünïcode");
    }

    #[test]
    fn repair_never_increases_marker_count() {
        for input in ["â alone", "Ã—Ã·", "ð mixed with ascii", "âââ"] {
            let repaired = fix_mojibake(input);
            assert!(
                mojibake_score(&repaired) <= mojibake_score(input),
                "{input}"
            );
        }
    }

    #[test]
    fn durations_render_like_a_clock() {
        assert_eq!(human_duration(None), None);
        assert_eq!(human_duration(Some(-3.0)), None);
        assert_eq!(human_duration(Some(f64::NAN)), None);
        assert_eq!(human_duration(Some(59.0)).as_deref(), Some("0:59"));
        assert_eq!(human_duration(Some(61.0)).as_deref(), Some("1:01"));
        assert_eq!(human_duration(Some(3661.4)).as_deref(), Some("1:01:01"));
    }

    #[tokio::test]
    async fn job_registry_walks_the_success_lifecycle() {
        let jobs = Mutex::new(HashMap::new());
        let job = create_job(&jobs, DownloadType::Audio, AudioFormat::Mp3, "https://e.com/a").await;
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.filename.is_none() && job.error.is_none());

        transition_job(&jobs, &job.id, JobStatus::Running, None, None).await;
        let running = get_job(&jobs, &job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.filename.is_none() && running.error.is_none());

        transition_job(&jobs, &job.id, JobStatus::Done, Some("clip.mp3".to_string()), None).await;
        let done = get_job(&jobs, &job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.filename.as_deref(), Some("clip.mp3"));
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn job_registry_error_state_carries_only_the_message() {
        let jobs = Mutex::new(HashMap::new());
        let job = create_job(&jobs, DownloadType::Video, AudioFormat::Mp3, "https://e.com/b").await;

        transition_job(&jobs, &job.id, JobStatus::Running, None, None).await;
        transition_job(&jobs, &job.id, JobStatus::Error, None, Some("boom".to_string())).await;

        let failed = get_job(&jobs, &job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.filename.is_none());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_job_ids_are_not_found() {
        let jobs = Mutex::new(HashMap::new());
        assert!(get_job(&jobs, "missing").await.is_none());
    }

    #[test]
    fn preview_cache_entries_stay_fresh_within_the_ttl() {
        let mut cache = HashMap::new();
        let now = Utc::now();

        cache.insert(
            "u".to_string(),
            preview_fixture("u", now - chrono::Duration::seconds(179)),
        );
        assert!(fresh_preview(&cache, "u", now).is_some());

        cache.insert(
            "u".to_string(),
            preview_fixture("u", now - chrono::Duration::seconds(181)),
        );
        assert!(fresh_preview(&cache, "u", now).is_none());
        assert!(fresh_preview(&cache, "other", now).is_none());
    }

    #[test]
    fn preview_cache_prune_drops_stale_entries_and_caps_size() {
        let mut cache = HashMap::new();
        let now = Utc::now();

        cache.insert(
            "stale".to_string(),
            preview_fixture("stale", now - chrono::Duration::seconds(400)),
        );
        for index in 0..(PREVIEW_CACHE_MAX_ENTRIES + 5) {
            let url = format!("https://example.com/{index}");
            let age = chrono::Duration::seconds((index % 100) as i64);
            cache.insert(url.clone(), preview_fixture(&url, now - age));
        }

        prune_preview_cache(&mut cache, now);
        assert!(!cache.contains_key("stale"));
        assert!(cache.len() <= PREVIEW_CACHE_MAX_ENTRIES);
    }

    #[test]
    fn failure_hints_match_known_causes() {
        let yt = "https://youtu.be/x";
        let fb = "https://www.facebook.com/watch?v=1";

        assert_eq!(
            failure_hint("Video unavailable", yt, true),
            Some(HINT_UNAVAILABLE)
        );
        assert_eq!(
            failure_hint("The downloaded file is empty (0 bytes).", yt, true),
            Some(HINT_EMPTY_FILE)
        );
        assert_eq!(
            failure_hint("Unsupported URL: https://example.com", yt, true),
            Some(HINT_UNSUPPORTED_URL)
        );
        assert_eq!(
            failure_hint("something odd", fb, false),
            Some(HINT_COOKIES_REQUIRED)
        );
        assert_eq!(failure_hint("something odd", fb, true), None);
        assert_eq!(failure_hint("something odd", yt, false), None);
        // phrasing matches take precedence over the host fallback
        assert_eq!(
            failure_hint("Video unavailable", fb, false),
            Some(HINT_UNAVAILABLE)
        );
    }

    #[test]
    fn cookie_gated_hosts_are_matched_by_domain() {
        assert!(is_cookie_gated_host("https://www.facebook.com/watch?v=1"));
        assert!(is_cookie_gated_host("https://fb.watch/abc"));
        assert!(!is_cookie_gated_host("https://www.youtube.com/watch?v=1"));
        assert!(!is_cookie_gated_host("not a url"));
    }

    #[test]
    fn job_errors_carry_hint_and_log_tail() {
        let mut log = JobLog::new(false);
        for index in 0..30 {
            log.push("warning", &format!("line {index}"));
        }

        let message = compose_job_error("Video unavailable", "https://youtu.be/x", true, &log);
        assert!(message.starts_with("Video unavailable"));
        assert!(message.contains(HINT_UNAVAILABLE));
        assert!(message.contains("[warning] line 29"));
        assert!(message.contains("[warning] line 5"));
        assert!(!message.contains("[warning] line 0"));
    }

    #[test]
    fn job_errors_without_log_lines_skip_the_tail() {
        let log = JobLog::new(false);
        let message = compose_job_error("boom", "https://youtu.be/x", true, &log);
        assert_eq!(message, "boom");
    }

    #[test]
    fn job_log_caps_retained_lines() {
        let mut log = JobLog::new(false);
        for index in 0..250 {
            log.push("warning", &format!("line {index}"));
        }
        assert_eq!(log.lines.len(), JOB_LOG_MAX_LINES);
        assert_eq!(
            log.lines.front().map(String::as_str),
            Some("[warning] line 50")
        );
    }

    #[test]
    fn stderr_lines_are_leveled_and_debug_is_gated() {
        let mut log = JobLog::new(false);
        log.absorb_stderr(b"WARNING: slow connection\nERROR: boom\nplain progress line\n");
        assert_eq!(
            log.tail(10),
            vec![
                "[warning] slow connection".to_string(),
                "[error] boom".to_string()
            ]
        );

        let mut verbose = JobLog::new(true);
        verbose.absorb_stderr(b"plain progress line\n");
        assert_eq!(
            verbose.tail(10),
            vec!["[debug] plain progress line".to_string()]
        );
    }

    #[test]
    fn extractor_errors_keep_the_last_meaningful_line() {
        let stderr = b"WARNING: something\nERROR: Video unavailable\n\n";
        assert_eq!(extractor_error_message(stderr), "Video unavailable");
        assert_eq!(
            extractor_error_message(b""),
            "yt-dlp could not complete the operation."
        );
    }

    #[test]
    fn fetch_args_follow_the_format_policy() {
        let job = Job {
            id: "j1".to_string(),
            status: JobStatus::Queued,
            download_type: DownloadType::Audio,
            audio_format: AudioFormat::Mp3,
            url: "https://youtu.be/x".to_string(),
            filename: None,
            error: None,
        };
        let dir = PathBuf::from("/tmp/j1");
        let ffmpeg = PathBuf::from("/opt/ffmpeg");

        let with_ffmpeg = build_fetch_args(&job, &dir, None, Some(&ffmpeg));
        assert!(with_ffmpeg.contains(&"--audio-format".to_string()));
        assert!(with_ffmpeg.contains(&"mp3".to_string()));
        assert!(with_ffmpeg.contains(&"--ffmpeg-location".to_string()));
        assert!(!with_ffmpeg.contains(&"--fixup".to_string()));

        let without_ffmpeg = build_fetch_args(&job, &dir, None, None);
        assert!(without_ffmpeg.contains(&"bestaudio/best".to_string()));
        assert!(!without_ffmpeg.contains(&"--audio-format".to_string()));
        assert!(without_ffmpeg.contains(&"--fixup".to_string()));

        let keep_original = Job {
            audio_format: AudioFormat::Original,
            ..job.clone()
        };
        let original_args = build_fetch_args(&keep_original, &dir, None, Some(&ffmpeg));
        assert!(!original_args.contains(&"--audio-format".to_string()));

        let video = Job {
            download_type: DownloadType::Video,
            ..job.clone()
        };
        let merged = build_fetch_args(&video, &dir, None, Some(&ffmpeg));
        assert!(merged.contains(&"bv*+ba/best".to_string()));
        assert!(merged.contains(&"--merge-output-format".to_string()));

        let premuxed = build_fetch_args(&video, &dir, None, None);
        assert!(premuxed.contains(&"best[ext=mp4]/best".to_string()));
        assert!(!premuxed.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn preview_args_skip_the_download() {
        let args = build_preview_args("https://youtu.be/x", None);
        assert!(args.contains(&"-J".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(!args.contains(&"--no-simulate".to_string()));

        let cookies = PathBuf::from("/tmp/cookies.txt");
        let with_cookies = build_preview_args("https://youtu.be/x", Some(&cookies));
        assert!(with_cookies.contains(&"--cookies".to_string()));
    }

    #[test]
    fn parse_fetched_info_skips_progress_noise() {
        let stdout = b"[download] item done\n{\"id\":\"x1\",\"title\":\"Song\"}\n";
        let info = parse_fetched_info(stdout).unwrap();
        assert_eq!(info.id.as_deref(), Some("x1"));
        assert_eq!(info.title.as_deref(), Some("Song"));

        assert!(parse_fetched_info(b"no json here\n").is_none());
    }

    #[test]
    fn multi_item_containers_resolve_to_the_first_entry() {
        let json = r#"{"_type":"multi_video","id":"list","entries":[{"id":"first","title":"A"},{"id":"second"}]}"#;
        let info: FetchedInfo = serde_json::from_str(json).unwrap();
        let first = first_entry(info);
        assert_eq!(first.id.as_deref(), Some("first"));

        let single: FetchedInfo = serde_json::from_str(r#"{"id":"solo"}"#).unwrap();
        assert_eq!(first_entry(single).id.as_deref(), Some("solo"));
    }

    #[test]
    fn best_thumbnail_prefers_the_largest_area() {
        let json = r#"{
            "thumbnails": [
                {"url": "small", "width": 10, "height": 10},
                {"url": "large", "width": 100, "height": 100},
                {"url": "unsized"}
            ]
        }"#;
        let info: YtDlpPreviewInfo = serde_json::from_str(json).unwrap();
        assert_eq!(best_thumbnail(&info).as_deref(), Some("large"));

        let direct: YtDlpPreviewInfo =
            serde_json::from_str(r#"{"thumbnail": " direct ", "thumbnails": []}"#).unwrap();
        assert_eq!(best_thumbnail(&direct).as_deref(), Some("direct"));
    }

    #[tokio::test]
    async fn finalize_renames_with_title_and_source_id() {
        let dir = tempfile::tempdir().unwrap();
        let produced = dir.path().join("abc123.mp4");
        std::fs::write(&produced, b"data").unwrap();

        let info: FetchedInfo =
            serde_json::from_str(r#"{"id":"abc123","title":"My: Clip?"}"#).unwrap();
        let name = finalize_artifact(dir.path(), Some(&info), "job1")
            .await
            .unwrap();
        assert_eq!(name, "My_ Clip_ [abc123].mp4");
        assert!(dir.path().join(&name).exists());
        assert!(!produced.exists());
    }

    #[tokio::test]
    async fn finalize_keeps_the_id_name_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123.webm"), b"data").unwrap();

        let name = finalize_artifact(dir.path(), None, "job1").await.unwrap();
        assert_eq!(name, "abc123.webm");
    }

    #[tokio::test]
    async fn finalize_fails_without_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let error = finalize_artifact(dir.path(), None, "job1")
            .await
            .unwrap_err();
        assert!(error.to_lowercase().contains("no artifact"));
    }

    #[tokio::test]
    async fn finalize_rejects_empty_artifacts_without_renaming() {
        let dir = tempfile::tempdir().unwrap();
        let produced = dir.path().join("abc123.mp4");
        std::fs::write(&produced, b"").unwrap();

        let info: FetchedInfo =
            serde_json::from_str(r#"{"id":"abc123","title":"My Clip"}"#).unwrap();
        let error = finalize_artifact(dir.path(), Some(&info), "job1")
            .await
            .unwrap_err();
        assert!(error.to_lowercase().contains("empty"));
        assert!(produced.exists());
        // the message itself triggers the empty-file hint downstream
        assert_eq!(
            failure_hint(&error, "https://youtu.be/x", true),
            Some(HINT_EMPTY_FILE)
        );
    }

    #[tokio::test]
    async fn latest_file_wins_and_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("old.mp4"), b"old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(25));
        std::fs::write(dir.path().join("new.mp4"), b"new").unwrap();

        let latest = pick_latest_file(dir.path()).await.unwrap().unwrap();
        assert_eq!(latest, dir.path().join("new.mp4"));

        let empty = tempfile::tempdir().unwrap();
        assert!(pick_latest_file(empty.path()).await.unwrap().is_none());
    }

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type_for_filename("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("a.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.xyz"), "application/octet-stream");
        assert_eq!(content_type_for_filename("noext"), "application/octet-stream");
    }

    #[test]
    fn content_disposition_keeps_an_ascii_fallback() {
        let value = build_content_disposition("Süper [id1].mp4");
        assert!(value.contains("filename=\"S_per [id1].mp4\""));
        assert!(value.contains("filename*=UTF-8''S%C3%BCper%20%5Bid1%5D.mp4"));
    }

    #[test]
    fn origins_normalize_scheme_host_and_port() {
        assert_eq!(
            normalize_origin("https://Example.com/"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://localhost:5173"),
            Some("http://localhost:5173".to_string())
        );
        assert_eq!(
            normalize_origin("https://example.com:443"),
            Some("https://example.com".to_string())
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
        assert_eq!(normalize_origin("not a url"), None);
    }
}
