// ABOUTME: Scripted in-memory Provider and recording transport used by unit and integration tests
// ABOUTME: Records every platform call so tests can assert which side effects happened

use crate::transport::{self, ChatTransport};
use crate::providers::{
    ContainerSpec, ContainerState, ContainerSummary, ExecStream, OutputChunk, Provider,
    ProviderError, Result, SandboxPhase, StreamType,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Captures everything written to an exec session's stdin
struct RecordingStdin {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for RecordingStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        guard(&self.buf).extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub struct MockProvider {
    containers: Mutex<HashMap<String, (String, ContainerSpec)>>,
    states: Mutex<VecDeque<(SandboxPhase, bool)>>,
    last_spec: Mutex<Option<ContainerSpec>>,
    exec_inputs: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
    exec_output: Mutex<(String, String)>,
    exec_delay: Mutex<Option<Duration>>,
    fail_create: AtomicBool,
    fail_remove: AtomicBool,
    create_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    inspect_calls: AtomicUsize,
    exec_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Inspect answers in order; the last one repeats
    pub fn script_states(&self, states: Vec<(SandboxPhase, bool)>) {
        *guard(&self.states) = states.into();
    }

    pub fn set_exec_output(&self, stdout: &str, stderr: &str) {
        *guard(&self.exec_output) = (stdout.to_string(), stderr.to_string());
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *guard(&self.exec_delay) = Some(delay);
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        guard(&self.last_spec).clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = guard(&self.containers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Stdin text of each exec session, oldest first
    pub fn exec_inputs(&self) -> Vec<String> {
        guard(&self.exec_inputs)
            .iter()
            .map(|buf| String::from_utf8_lossy(&guard(buf)).into_owned())
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    /// Total calls of any kind that reach the platform
    pub fn platform_calls(&self) -> usize {
        self.create_calls() + self.remove_calls() + self.inspect_calls() + self.exec_calls()
    }

    fn next_state(&self, name: &str) -> Result<ContainerState> {
        let mut states = guard(&self.states);
        let scripted = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().copied()
        };

        match scripted {
            Some((phase, ready)) => Ok(ContainerState {
                phase,
                ready,
                message: None,
            }),
            None if guard(&self.containers).contains_key(name) => Ok(ContainerState {
                phase: SandboxPhase::Running,
                ready: true,
                message: None,
            }),
            None => Err(ProviderError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ensure_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        *guard(&self.last_spec) = Some(spec.clone());

        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("scripted create failure".into()));
        }

        let mut containers = guard(&self.containers);
        if containers.contains_key(&spec.name) {
            return Err(ProviderError::ContainerError(format!(
                "name {} already in use",
                spec.name
            )));
        }

        let id = format!("mock-{}", spec.name);
        containers.insert(spec.name.clone(), (id.clone(), spec.clone()));
        Ok(id)
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("scripted remove failure".into()));
        }
        guard(&self.containers).remove(name);
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerState> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        self.next_state(name)
    }

    async fn list_containers(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ContainerSummary>> {
        let containers = guard(&self.containers);
        let mut listed: Vec<_> = containers
            .iter()
            .filter(|(_, (_, spec))| labels.iter().all(|(k, v)| spec.labels.get(k) == Some(v)))
            .map(|(name, (id, spec))| {
                let mut all_labels = spec.labels.clone();
                all_labels.insert("disclaude.scope".to_string(), spec.namespace.clone());
                ContainerSummary {
                    id: id.clone(),
                    name: name.clone(),
                    phase: SandboxPhase::Running,
                    labels: all_labels,
                    created_at: None,
                }
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn open_exec(&self, _name: &str, _command: Vec<String>) -> Result<ExecStream> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);

        let buf = Arc::new(Mutex::new(Vec::new()));
        guard(&self.exec_inputs).push(buf.clone());

        let (stdout, stderr) = guard(&self.exec_output).clone();
        let delay = *guard(&self.exec_delay);

        let mut chunks = vec![OutputChunk {
            stream: StreamType::Stdout,
            data: stdout.into_bytes(),
        }];
        if !stderr.is_empty() {
            chunks.push(OutputChunk {
                stream: StreamType::Stderr,
                data: stderr.into_bytes(),
            });
        }

        let output = futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed();

        Ok(ExecStream {
            stdin: Box::pin(RecordingStdin { buf }),
            output,
        })
    }
}

/// Chat transport that keeps every delivered chunk in memory
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(thread, text)` pairs in delivery order
    pub fn sent(&self) -> Vec<(String, String)> {
        guard(&self.sent).clone()
    }

    pub fn last(&self, thread_id: &str) -> Option<String> {
        guard(&self.sent)
            .iter()
            .rev()
            .find(|(thread, _)| thread == thread_id)
            .map(|(_, text)| text.clone())
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_chunk(&self, thread_id: &str, text: &str) -> transport::Result<()> {
        guard(&self.sent).push((thread_id.to_string(), text.to_string()));
        Ok(())
    }
}
