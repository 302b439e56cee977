//! IPC dispatcher.
//!
//! Watches each group's `requests/` directory (filesystem events plus a
//! polling sweep so nothing strands), reads request envelopes atomically
//! with parse-retry, validates that the request really belongs to the
//! group owning the directory, enforces the main-group privilege matrix,
//! executes the handler, and writes the response to
//! `responses/<id>.json`. Files that cannot even be parsed move to the
//! group's `errors/` quarantine.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dotclaw_channels::{MediaPayload, MessageId, OutboundMessage, ProviderRegistry};
use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::{read_json_retry, write_json_atomic};
use dotclaw_store::{HostStore, MemoryFilter, MemoryStore};
use dotclaw_types::group::Group;
use dotclaw_types::ipc::{IpcRequest, IpcResponse, RequestKind};
use dotclaw_types::memory::{MemoryItem, MemoryScope};
use dotclaw_types::task::{ContextMode, ScheduleType, TaskStatus};

use crate::groups::GroupRegistry;
use crate::now_ms;
use crate::router::RequestRouter;
use crate::scheduler::TaskScheduler;

/// Download size cap for `download_url`.
const DOWNLOAD_CAP_BYTES: u64 = 10 * 1_048_576;

/// Optional text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`; returns the bytes of an audio file and its
    /// file extension.
    async fn synthesize(&self, text: &str) -> Result<(Vec<u8>, &'static str), String>;
}

/// The dispatcher service.
pub struct IpcDispatcher {
    paths: DataPaths,
    groups: Arc<GroupRegistry>,
    providers: ProviderRegistry,
    store: HostStore,
    memory: MemoryStore,
    router: Arc<RequestRouter>,
    scheduler: Arc<TaskScheduler>,
    tts: Option<Arc<dyn SpeechSynthesizer>>,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl IpcDispatcher {
    /// Wire the dispatcher.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: DataPaths,
        groups: Arc<GroupRegistry>,
        providers: ProviderRegistry,
        store: HostStore,
        memory: MemoryStore,
        router: Arc<RequestRouter>,
        scheduler: Arc<TaskScheduler>,
        tts: Option<Arc<dyn SpeechSynthesizer>>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            groups,
            providers,
            store,
            memory,
            router,
            scheduler,
            tts,
            http: reqwest::Client::new(),
            poll_interval,
        })
    }

    /// Run until shutdown: filesystem events wake the sweep early, the
    /// interval guarantees progress even when events are lost.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!("ipc dispatcher started");
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let _watcher = {
            use notify::Watcher;
            let mut watcher = notify::recommended_watcher(move |res| {
                if matches!(res, Ok(_)) {
                    let _ = wake_tx.send(());
                }
            })
            .ok();
            if let Some(w) = watcher.as_mut() {
                if let Err(e) = w.watch(&self.paths.ipc_dir(), notify::RecursiveMode::Recursive) {
                    warn!(error = %e, "ipc watcher unavailable, polling only");
                }
            }
            watcher
        };

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
                _ = wake_rx.recv() => {}
            }
            self.sweep().await;
        }
    }

    /// Process every pending request file once.
    pub async fn sweep(&self) {
        let Ok(mut groups) = tokio::fs::read_dir(self.paths.ipc_dir()).await else {
            return;
        };
        while let Ok(Some(group)) = groups.next_entry().await {
            let folder = group.file_name().to_string_lossy().into_owned();
            let requests = group.path().join("requests");
            let Ok(mut entries) = tokio::fs::read_dir(&requests).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_request = path.extension().is_some_and(|e| e == "json")
                    && !path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().ends_with(".response.json"));
                if is_request {
                    self.process_file(&folder, &path).await;
                }
            }
        }
    }

    /// Handle one request file end to end.
    pub async fn process_file(&self, folder: &str, path: &Path) {
        let request: IpcRequest =
            match read_json_retry(path, 5, Duration::from_millis(50)).await {
                Ok(request) => request,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable ipc request");
                    self.quarantine(folder, path).await;
                    return;
                }
            };

        // Sender identity: the id in the envelope must match the file,
        // and the directory owner must be a registered group.
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let response = if request.id != stem {
            IpcResponse::err(request.id.clone(), "request id does not match file name")
        } else {
            match self.groups.by_folder(folder) {
                None => IpcResponse::err(request.id.clone(), "unknown group"),
                Some(group) => self.dispatch(&group, &request).await,
            }
        };

        let response_path = self
            .paths
            .group_ipc_dir(folder)
            .join("responses")
            .join(format!("{}.json", request.id));
        if let Err(e) = write_json_atomic(&response_path, &response).await {
            warn!(error = %e, "failed to write ipc response");
            self.quarantine(folder, path).await;
            return;
        }
        if !response.ok {
            debug!(id = %request.id, error = ?response.error, "ipc request denied or failed");
        }
        let _ = tokio::fs::remove_file(path).await;
    }

    async fn quarantine(&self, folder: &str, path: &Path) {
        let errors = self.paths.group_ipc_dir(folder).join("errors");
        let _ = tokio::fs::create_dir_all(&errors).await;
        if let Some(name) = path.file_name() {
            let _ = tokio::fs::rename(path, errors.join(name)).await;
        }
    }

    /// Authorization plus handler execution.
    async fn dispatch(&self, group: &Group, request: &IpcRequest) -> IpcResponse {
        if let Err(denied) = self.authorize(group, request) {
            return IpcResponse::err(request.id.clone(), denied);
        }
        match self.handle(group, request).await {
            Ok(result) => IpcResponse::ok(request.id.clone(), result),
            Err(message) => IpcResponse::err(request.id.clone(), message),
        }
    }

    /// The main-group privilege matrix.
    fn authorize(&self, group: &Group, request: &IpcRequest) -> Result<(), String> {
        let kind = request.kind;
        if kind.is_main_only() && !group.is_main() {
            return Err("only the main group may do that".into());
        }

        if kind.is_provider_op() {
            let target = request.payload.get("chatId").and_then(Value::as_str);
            match target {
                Some(chat) if chat == group.chat_id || group.is_main() => {}
                Some(_) => return Err("cannot message other chats".into()),
                None => return Err("chatId is required".into()),
            }
        }

        if kind.is_task_op() || kind.is_memory_op() {
            let target = request
                .payload
                .get("groupFolder")
                .and_then(Value::as_str)
                .unwrap_or(&group.folder);
            if target != group.folder && !group.is_main() {
                return Err("cannot act on another group".into());
            }
        }

        if kind.is_memory_op() && !group.is_main() {
            let scope = request.payload.get("scope").and_then(Value::as_str);
            let writes = matches!(kind, RequestKind::MemoryUpsert | RequestKind::MemoryForget);
            if writes && scope == Some("global") {
                return Err("global memory writes are main-only".into());
            }
        }
        Ok(())
    }

    async fn handle(&self, group: &Group, request: &IpcRequest) -> Result<Value, String> {
        let payload = &request.payload;
        let target_folder = payload
            .get("groupFolder")
            .and_then(Value::as_str)
            .unwrap_or(&group.folder)
            .to_string();

        match request.kind {
            RequestKind::SendMessage => {
                let chat_id = str_field(payload, "chatId")?;
                let text = str_field(payload, "text")?;
                let provider = self.providers.route(&chat_id).map_err(|e| e.to_string())?;
                let msg = OutboundMessage {
                    chat_id: chat_id.clone(),
                    text,
                    reply_to: payload.get("replyTo").and_then(Value::as_str).map(String::from),
                    parse_mode: payload.get("parseMode").and_then(Value::as_str).map(String::from),
                };
                let id = provider.send(&msg).await.map_err(|e| e.to_string())?;
                Ok(json!({"messageId": id.0}))
            }
            RequestKind::EditMessage => {
                let chat_id = str_field(payload, "chatId")?;
                let message_id = MessageId(str_field(payload, "messageId")?);
                let text = str_field(payload, "text")?;
                let provider = self.providers.route(&chat_id).map_err(|e| e.to_string())?;
                provider
                    .edit(&chat_id, &message_id, &text)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"edited": true}))
            }
            RequestKind::DeleteMessage => {
                let chat_id = str_field(payload, "chatId")?;
                let message_id = MessageId(str_field(payload, "messageId")?);
                let provider = self.providers.route(&chat_id).map_err(|e| e.to_string())?;
                provider
                    .delete(&chat_id, &message_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"deleted": true}))
            }
            RequestKind::SendPhoto
            | RequestKind::SendDocument
            | RequestKind::SendVoice
            | RequestKind::SendAudio
            | RequestKind::SendLocation
            | RequestKind::SendContact
            | RequestKind::SendPoll
            | RequestKind::SendButtons => {
                let chat_id = str_field(payload, "chatId")?;
                let provider = self.providers.route(&chat_id).map_err(|e| e.to_string())?;
                let kind = media_kind(request.kind);
                let media = MediaPayload {
                    kind: kind.to_string(),
                    fields: payload.clone(),
                };
                let id = provider
                    .send_media(&chat_id, &media)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"messageId": id.0}))
            }

            RequestKind::ScheduleTask => {
                let prompt = str_field(payload, "prompt")?;
                let schedule_type = str_field(payload, "scheduleType")
                    .and_then(|s| ScheduleType::parse(&s).ok_or("bad scheduleType".into()))?;
                let schedule_value = str_field(payload, "scheduleValue")?;
                let chat_jid = payload
                    .get("chatJid")
                    .and_then(Value::as_str)
                    .unwrap_or(&group.chat_id)
                    .to_string();
                let context_mode = match payload.get("contextMode").and_then(Value::as_str) {
                    Some("recent") => ContextMode::Recent,
                    _ => ContextMode::None,
                };
                let id = self
                    .scheduler
                    .schedule(
                        &target_folder,
                        &chat_jid,
                        &prompt,
                        schedule_type,
                        &schedule_value,
                        context_mode,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"taskId": id}))
            }
            RequestKind::UpdateTask => {
                let id = str_field(payload, "taskId")?;
                let schedule = match (
                    payload.get("scheduleType").and_then(Value::as_str),
                    payload.get("scheduleValue").and_then(Value::as_str),
                ) {
                    (Some(kind), Some(value)) => {
                        let kind = ScheduleType::parse(kind).ok_or("bad scheduleType")?;
                        let next = crate::scheduler::compute_next_run(kind, value, now_ms())
                            .map_err(|e| e.to_string())?
                            .ok_or("schedule has no future occurrence")?;
                        Some((kind, value.to_string(), next))
                    }
                    _ => None,
                };
                let context_mode = payload.get("contextMode").and_then(Value::as_str).map(|m| {
                    if m == "recent" { ContextMode::Recent } else { ContextMode::None }
                });
                self.store
                    .update_task(
                        &id,
                        payload.get("prompt").and_then(Value::as_str).map(String::from),
                        schedule,
                        context_mode,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"updated": true}))
            }
            RequestKind::PauseTask => self.task_status(payload, TaskStatus::Paused).await,
            RequestKind::ResumeTask => self.task_status(payload, TaskStatus::Active).await,
            RequestKind::CancelTask => self.task_status(payload, TaskStatus::Canceled).await,
            RequestKind::ListTasks => {
                // Main may list all; everyone else only their own group.
                let scope = if group.is_main() && payload.get("groupFolder").is_none() {
                    None
                } else {
                    Some(target_folder)
                };
                let tasks = self.store.list_tasks(scope).await.map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(tasks).map_err(|e| e.to_string())?)
            }
            RequestKind::GetTask => {
                let id = str_field(payload, "taskId")?;
                let task = self.store.task(&id).await.map_err(|e| e.to_string())?;
                match task {
                    Some(task) => Ok(serde_json::to_value(task).map_err(|e| e.to_string())?),
                    None => Err(format!("no such task: {id}")),
                }
            }
            RequestKind::RunTask => {
                let id = str_field(payload, "taskId")?;
                self.store
                    .finish_task_run(&id, "manual run requested".into(), 0, Some(now_ms()))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"queued": true}))
            }

            RequestKind::MemoryUpsert => {
                let items = payload
                    .get("items")
                    .and_then(Value::as_array)
                    .ok_or("items array is required")?;
                let now = now_ms();
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    rows.push(memory_item_from(item, &target_folder, now)?);
                }
                let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
                self.memory.upsert(rows).await.map_err(|e| e.to_string())?;
                Ok(json!({"ids": ids}))
            }
            RequestKind::MemorySearch => {
                let query = str_field(payload, "query")?;
                let limit = payload.get("maxResults").and_then(Value::as_u64).unwrap_or(8) as u32;
                let tokens = crate::recall::normalize_query(&query);
                let hits = self
                    .memory
                    .search_keyword(&target_folder, &tokens, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                let out: Vec<Value> = hits
                    .iter()
                    .map(|h| {
                        json!({
                            "id": h.item.id,
                            "type": h.item.kind,
                            "content": h.item.content,
                            "score": h.score,
                        })
                    })
                    .collect();
                Ok(json!({"results": out}))
            }
            RequestKind::MemoryList => {
                let filter = MemoryFilter {
                    scope: payload
                        .get("scope")
                        .and_then(Value::as_str)
                        .and_then(MemoryScope::parse),
                    subject_id: payload
                        .get("subjectId")
                        .and_then(Value::as_str)
                        .map(String::from),
                    kind: payload.get("type").and_then(Value::as_str).map(String::from),
                };
                let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(50) as u32;
                let items = self
                    .memory
                    .list(&target_folder, filter, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(items).map_err(|e| e.to_string())?)
            }
            RequestKind::MemoryForget => {
                let id = str_field(payload, "id")?;
                let removed = self
                    .memory
                    .forget(&target_folder, &id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"removed": removed}))
            }
            RequestKind::MemoryStats => {
                let stats = self.memory.stats(&target_folder).await.map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(stats).map_err(|e| e.to_string())?)
            }

            RequestKind::RegisterGroup => {
                let new_group = Group {
                    chat_id: str_field(payload, "chatId")?,
                    name: str_field(payload, "name")?,
                    folder: str_field(payload, "folder")?,
                    trigger: payload.get("trigger").and_then(Value::as_str).map(String::from),
                    extra_mounts: Vec::new(),
                    env: Default::default(),
                };
                self.groups.register(new_group).await.map_err(|e| e.to_string())?;
                Ok(json!({"registered": true}))
            }
            RequestKind::RemoveGroup => {
                let chat_id = str_field(payload, "chatId")?;
                let removed = self.groups.remove(&chat_id).await.map_err(|e| e.to_string())?;
                Ok(json!({"removed": removed.is_some()}))
            }
            RequestKind::ListGroups => {
                Ok(serde_json::to_value(self.groups.list()).map_err(|e| e.to_string())?)
            }
            RequestKind::SetModel => {
                let model = str_field(payload, "model")?;
                self.router.set_model(&model).await.map_err(|e| e.to_string())?;
                Ok(json!({"model": model}))
            }

            RequestKind::DownloadUrl => {
                let url = str_field(payload, "url")?;
                self.download_url(group, &url).await
            }
            RequestKind::TextToSpeech => {
                let text = str_field(payload, "text")?;
                let Some(tts) = &self.tts else {
                    return Err("no speech backend configured".into());
                };
                let (bytes, ext) = tts.synthesize(&text).await?;
                let dir = self.paths.group_dir(&group.folder).join("tts");
                tokio::fs::create_dir_all(&dir).await.map_err(|e| e.to_string())?;
                let name = format!("tts-{}.{ext}", uuid::Uuid::new_v4());
                tokio::fs::write(dir.join(&name), &bytes)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"path": format!("tts/{name}"), "bytes": bytes.len()}))
            }
        }
    }

    async fn task_status(&self, payload: &Value, status: TaskStatus) -> Result<Value, String> {
        let id = str_field(payload, "taskId")?;
        self.store
            .set_task_status(&id, status)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({"status": status.as_str()}))
    }

    /// Host-side fetch with SSRF guard and size cap; the file lands in
    /// the group folder so the container can read it.
    async fn download_url(&self, group: &Group, url: &str) -> Result<Value, String> {
        let parsed = validate_download_url(url)?;
        let response = self
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| format!("fetch failed: {e}"))?;
        if let Some(len) = response.content_length()
            && len > DOWNLOAD_CAP_BYTES
        {
            return Err(format!("response too large: {len} bytes"));
        }
        let bytes = response.bytes().await.map_err(|e| format!("read failed: {e}"))?;
        if bytes.len() as u64 > DOWNLOAD_CAP_BYTES {
            return Err(format!("response too large: {} bytes", bytes.len()));
        }

        let dir = self.paths.group_dir(&group.folder).join("downloads");
        tokio::fs::create_dir_all(&dir).await.map_err(|e| e.to_string())?;
        let name = format!("dl-{}", uuid::Uuid::new_v4());
        tokio::fs::write(dir.join(&name), &bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({"path": format!("downloads/{name}"), "bytes": bytes.len()}))
    }
}

/// Reject URLs that could reach internal services.
fn validate_download_url(url: &str) -> Result<reqwest::Url, String> {
    let parsed: reqwest::Url = url.parse().map_err(|_| format!("invalid url: {url}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", parsed.scheme()));
    }
    let Some(host) = parsed.host_str() else {
        return Err("url has no host".into());
    };
    let lowered = host.to_lowercase();
    if lowered == "localhost" || lowered.ends_with(".localhost") || lowered.ends_with(".local") {
        return Err("internal hosts are not allowed".into());
    }
    if let Ok(ip) = lowered.trim_matches(['[', ']']).parse::<IpAddr>() {
        let private = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.octets()[0] == 169
            }
            IpAddr::V6(v6) => {
                v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
            }
        };
        if private {
            return Err("internal addresses are not allowed".into());
        }
    }
    Ok(parsed)
}

fn str_field(payload: &Value, name: &str) -> Result<String, String> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| format!("{name} is required"))
}

fn media_kind(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::SendPhoto => "photo",
        RequestKind::SendDocument => "document",
        RequestKind::SendVoice => "voice",
        RequestKind::SendAudio => "audio",
        RequestKind::SendLocation => "location",
        RequestKind::SendContact => "contact",
        RequestKind::SendPoll => "poll",
        RequestKind::SendButtons => "buttons",
        _ => "unknown",
    }
}

fn memory_item_from(value: &Value, group_folder: &str, now: i64) -> Result<MemoryItem, String> {
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .ok_or("memory item needs content")?;
    let scope = value
        .get("scope")
        .and_then(Value::as_str)
        .and_then(MemoryScope::parse)
        .unwrap_or(MemoryScope::Group);
    Ok(MemoryItem {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("mem-{}", uuid::Uuid::new_v4())),
        group_folder: if scope == MemoryScope::Global {
            "global".to_string()
        } else {
            group_folder.to_string()
        },
        scope,
        subject_id: value.get("subjectId").and_then(Value::as_str).map(String::from),
        kind: value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("fact")
            .to_string(),
        content: content.to_string(),
        tags: value
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.to_lowercase())
                    .collect()
            })
            .unwrap_or_default(),
        metadata: value
            .get("metadata")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default(),
        importance: value.get("importance").and_then(Value::as_f64).unwrap_or(0.5),
        confidence: value.get("confidence").and_then(Value::as_f64).unwrap_or(0.5),
        conflict_key: value.get("conflictKey").and_then(Value::as_str).map(String::from),
        created_at: now,
        updated_at: now,
        embedding: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownRegistry;
    use crate::executor::AgentExecutor;
    use crate::lanes::{GroupLocks, LaneGate};
    use crate::recall::RecallBackend;
    use crate::router::HeuristicClassifier;
    use crate::runner::testing::StubRunner;
    use crate::session::SessionManager;
    use crate::trace::TraceWriter;
    use dotclaw_channels::MockProvider;
    use dotclaw_platform::fs::{read_json_opt, write_json_atomic};
    use dotclaw_types::config::{
        ContainerConfig, LaneConfig, ModelConfig, RecallConfig, RouterConfig, SchedulerConfig,
        SessionConfig,
    };
    use dotclaw_types::memory::MemoryStats;

    struct NoRecall;

    #[async_trait]
    impl RecallBackend for NoRecall {
        async fn build_recall(&self, _: &str, _: &str, _: &str, _: u32, _: u32) -> Vec<String> {
            Vec::new()
        }
        async fn build_user_profile(&self, _: &str, _: &str) -> Option<String> {
            None
        }
        async fn stats(&self, _: &str) -> MemoryStats {
            MemoryStats::default()
        }
    }

    struct World {
        dispatcher: Arc<IpcDispatcher>,
        provider: Arc<MockProvider>,
        store: HostStore,
        memory: MemoryStore,
        paths: DataPaths,
        _dir: tempfile::TempDir,
    }

    async fn world() -> World {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        paths.ensure_layout().await.unwrap();

        let store = HostStore::open(paths.messages_db()).await.unwrap();
        let memory = MemoryStore::open(paths.memory_db()).await.unwrap();
        let cooldowns = CooldownRegistry::empty(paths.cooldowns_file());
        write_json_atomic(
            &paths.model_file(),
            &ModelConfig {
                model: "model-a".into(),
                fallbacks: vec![],
                allowlist: vec!["model-a".into(), "model-b".into()],
            },
        )
        .await
        .unwrap();
        let router = Arc::new(
            RequestRouter::load(
                RouterConfig::default(),
                RecallConfig::default(),
                paths.model_file(),
                cooldowns.clone(),
                Arc::new(HeuristicClassifier),
            )
            .await
            .unwrap(),
        );
        let executor = AgentExecutor::new(
            StubRunner::ok("unused"),
            Arc::clone(&router),
            cooldowns,
            LaneGate::new(LaneConfig::default()),
            GroupLocks::new(),
            Arc::new(SessionManager::new(paths.clone(), SessionConfig::default())),
            Arc::new(NoRecall),
            TraceWriter::new(paths.clone()),
            ContainerConfig::default(),
            RouterConfig::default(),
            dotclaw_types::config::ToolPolicy::default(),
        );

        let groups = GroupRegistry::load(paths.clone()).await.unwrap();
        for (chat, name, folder) in
            [("mock:-1", "Main", "main"), ("mock:-2", "Side", "side")]
        {
            groups
                .register(Group {
                    chat_id: chat.into(),
                    name: name.into(),
                    folder: folder.into(),
                    trigger: None,
                    extra_mounts: vec![],
                    env: Default::default(),
                })
                .await
                .unwrap();
        }

        let provider = Arc::new(MockProvider::named("mock"));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let scheduler = TaskScheduler::new(
            store.clone(),
            executor,
            providers.clone(),
            Arc::clone(&groups),
            SchedulerConfig::default(),
            3_800,
        );
        let dispatcher = IpcDispatcher::new(
            paths.clone(),
            groups,
            providers,
            store.clone(),
            memory.clone(),
            router,
            scheduler,
            None,
            Duration::from_millis(250),
        );
        World {
            dispatcher,
            provider,
            store,
            memory,
            paths,
            _dir: dir,
        }
    }

    async fn drop_request(w: &World, folder: &str, id: &str, kind: &str, payload: Value) {
        let path = w
            .paths
            .group_ipc_dir(folder)
            .join("requests")
            .join(format!("{id}.json"));
        write_json_atomic(
            &path,
            &json!({"id": id, "kind": kind, "payload": payload, "createdAt": now_ms()}),
        )
        .await
        .unwrap();
    }

    async fn response(w: &World, folder: &str, id: &str) -> IpcResponse {
        let path = w
            .paths
            .group_ipc_dir(folder)
            .join("responses")
            .join(format!("{id}.json"));
        read_json_opt(&path).await.unwrap().expect("response file")
    }

    #[tokio::test]
    async fn send_message_roundtrip_through_files() {
        let w = world().await;
        drop_request(
            &w,
            "main",
            "req-1",
            "send_message",
            json!({"chatId": "mock:-1", "text": "hello from the container"}),
        )
        .await;
        w.dispatcher.sweep().await;

        let resp = response(&w, "main", "req-1").await;
        assert!(resp.ok, "{resp:?}");
        assert!(resp.result.unwrap()["messageId"].is_string());
        assert_eq!(w.provider.sent_texts(), vec!["hello from the container"]);
        // Request file consumed.
        assert!(
            !w.paths
                .group_ipc_dir("main")
                .join("requests")
                .join("req-1.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn non_main_cannot_message_other_chats() {
        let w = world().await;
        drop_request(
            &w,
            "side",
            "req-1",
            "send_message",
            json!({"chatId": "mock:-1", "text": "sneaky"}),
        )
        .await;
        w.dispatcher.sweep().await;

        let resp = response(&w, "side", "req-1").await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("other chats"));
        assert!(w.provider.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn main_may_message_any_chat() {
        let w = world().await;
        drop_request(
            &w,
            "main",
            "req-1",
            "send_message",
            json!({"chatId": "mock:-2", "text": "cross-chat"}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "main", "req-1").await.ok);
    }

    #[tokio::test]
    async fn set_model_is_main_only_and_respects_allowlist() {
        let w = world().await;
        drop_request(&w, "side", "req-1", "set_model", json!({"model": "model-b"})).await;
        w.dispatcher.sweep().await;
        assert!(!response(&w, "side", "req-1").await.ok);

        drop_request(&w, "main", "req-2", "set_model", json!({"model": "model-b"})).await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "main", "req-2").await.ok);

        drop_request(&w, "main", "req-3", "set_model", json!({"model": "evil"})).await;
        w.dispatcher.sweep().await;
        assert!(!response(&w, "main", "req-3").await.ok);
    }

    #[tokio::test]
    async fn schedule_and_list_tasks_scoped_by_group() {
        let w = world().await;
        drop_request(
            &w,
            "side",
            "req-1",
            "schedule_task",
            json!({"prompt": "water the plants", "scheduleType": "interval", "scheduleValue": "3600000"}),
        )
        .await;
        w.dispatcher.sweep().await;
        let resp = response(&w, "side", "req-1").await;
        assert!(resp.ok, "{resp:?}");

        // Non-main cannot schedule into another group.
        drop_request(
            &w,
            "side",
            "req-2",
            "schedule_task",
            json!({"prompt": "x", "scheduleType": "interval", "scheduleValue": "1000", "groupFolder": "main"}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(!response(&w, "side", "req-2").await.ok);

        // list_tasks from side sees only its own task even with no filter.
        drop_request(&w, "side", "req-3", "list_tasks", json!({})).await;
        w.dispatcher.sweep().await;
        let resp = response(&w, "side", "req-3").await;
        let tasks = resp.result.unwrap();
        assert_eq!(tasks.as_array().unwrap().len(), 1);
        assert_eq!(tasks[0]["groupFolder"], "side");

        // Main lists all.
        drop_request(&w, "main", "req-4", "list_tasks", json!({})).await;
        w.dispatcher.sweep().await;
        let resp = response(&w, "main", "req-4").await;
        assert_eq!(resp.result.unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_resume_cancel_task_ops() {
        let w = world().await;
        drop_request(
            &w,
            "main",
            "req-1",
            "schedule_task",
            json!({"prompt": "p", "scheduleType": "interval", "scheduleValue": "60000"}),
        )
        .await;
        w.dispatcher.sweep().await;
        let task_id = response(&w, "main", "req-1").await.result.unwrap()["taskId"]
            .as_str()
            .unwrap()
            .to_string();

        drop_request(&w, "main", "req-2", "pause_task", json!({"taskId": task_id})).await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "main", "req-2").await.ok);
        assert_eq!(
            w.store.task(&task_id).await.unwrap().unwrap().status,
            TaskStatus::Paused
        );

        drop_request(&w, "main", "req-3", "resume_task", json!({"taskId": task_id})).await;
        w.dispatcher.sweep().await;
        assert_eq!(
            w.store.task(&task_id).await.unwrap().unwrap().status,
            TaskStatus::Active
        );

        drop_request(&w, "main", "req-4", "cancel_task", json!({"taskId": task_id})).await;
        w.dispatcher.sweep().await;
        assert_eq!(
            w.store.task(&task_id).await.unwrap().unwrap().status,
            TaskStatus::Canceled
        );
    }

    #[tokio::test]
    async fn memory_upsert_search_and_global_guard() {
        let w = world().await;
        drop_request(
            &w,
            "side",
            "req-1",
            "memory_upsert",
            json!({"items": [{"type": "preference", "content": "prefers green tea", "tags": ["Tea"]}]}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "side", "req-1").await.ok);

        drop_request(
            &w,
            "side",
            "req-2",
            "memory_search",
            json!({"query": "what tea does the user like"}),
        )
        .await;
        w.dispatcher.sweep().await;
        let resp = response(&w, "side", "req-2").await;
        let hits = resp.result.unwrap();
        assert_eq!(hits["results"].as_array().unwrap().len(), 1);
        assert_eq!(hits["results"][0]["type"], "preference");

        // Global writes from a non-main group are denied.
        drop_request(
            &w,
            "side",
            "req-3",
            "memory_upsert",
            json!({"scope": "global", "items": [{"content": "x", "scope": "global"}]}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(!response(&w, "side", "req-3").await.ok);

        // Main may write global memories.
        drop_request(
            &w,
            "main",
            "req-4",
            "memory_upsert",
            json!({"scope": "global", "items": [{"content": "holiday friday", "scope": "global"}]}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "main", "req-4").await.ok);
        let stats = w.memory.stats("global").await.unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn register_group_via_ipc_is_main_only() {
        let w = world().await;
        drop_request(
            &w,
            "main",
            "req-1",
            "register_group",
            json!({"chatId": "mock:-9", "name": "New", "folder": "new-group"}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(response(&w, "main", "req-1").await.ok);
        assert!(w.dispatcher.groups.by_chat_id("mock:-9").is_some());

        drop_request(
            &w,
            "side",
            "req-2",
            "register_group",
            json!({"chatId": "mock:-10", "name": "Nope", "folder": "nope"}),
        )
        .await;
        w.dispatcher.sweep().await;
        assert!(!response(&w, "side", "req-2").await.ok);
    }

    #[tokio::test]
    async fn mismatched_envelope_id_is_rejected() {
        let w = world().await;
        let path = w
            .paths
            .group_ipc_dir("main")
            .join("requests")
            .join("req-1.json");
        write_json_atomic(
            &path,
            &json!({"id": "req-other", "kind": "list_groups", "payload": {}, "createdAt": 1}),
        )
        .await
        .unwrap();
        w.dispatcher.sweep().await;

        let resp = response(&w, "main", "req-other").await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("does not match"));
    }

    #[tokio::test]
    async fn unparseable_request_is_quarantined() {
        let w = world().await;
        let path = w
            .paths
            .group_ipc_dir("main")
            .join("requests")
            .join("bad.json");
        tokio::fs::write(&path, "{never valid json").await.unwrap();
        w.dispatcher.sweep().await;

        assert!(!path.exists());
        assert!(
            w.paths
                .group_ipc_dir("main")
                .join("errors")
                .join("bad.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn text_to_speech_without_backend_errors() {
        let w = world().await;
        drop_request(&w, "main", "req-1", "text_to_speech", json!({"text": "hi"})).await;
        w.dispatcher.sweep().await;
        let resp = response(&w, "main", "req-1").await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("speech backend"));
    }

    #[test]
    fn download_url_guard() {
        assert!(validate_download_url("https://example.com/file.pdf").is_ok());
        assert!(validate_download_url("http://93.184.216.34/x").is_ok());

        for bad in [
            "ftp://example.com/x",
            "file:///etc/passwd",
            "http://localhost/admin",
            "http://db.local/metrics",
            "http://127.0.0.1:8080/",
            "http://10.0.0.5/secrets",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "not a url",
        ] {
            assert!(validate_download_url(bad).is_err(), "{bad} should be rejected");
        }
    }
}
