//! Test doubles shared across unit and integration tests.
//!
//! [`ScriptedRunner`] replays queued process outputs. [`FakeShell`] answers
//! `ssh` invocations by matching the remote command. [`FakeCloud`] keeps
//! instances in memory and records every call. [`FakeArtifactProbe`] reports
//! the pairing artifact ready after a configurable number of checks.
//! [`RecordingStateStore`] keeps every state written.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::backend::{
    ACTIVE_STATUS, BackendFuture, CloudClient, Instance, InstanceId, InstanceSpec, ProviderError,
};
use crate::identifier::Identifier;
use crate::probe::{ArtifactProbe, PollResult, ProbeFuture};
use crate::session::{CommandOutput, CommandRunner, CommandSpec, RunnerFuture, SessionError};
use crate::state::{MemoryStateStore, ProvisioningState, StateStore};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output(
    code: Option<i32>,
    stdout: impl Into<String>,
    stderr: impl Into<String>,
) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

#[derive(Clone, Debug)]
enum Scripted {
    Output(CommandOutput),
    Hang,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Scripted>>>,
    invocations: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandSpec> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(Scripted::Output(output(code, stdout, stderr)));
    }

    /// Pushes a response that never arrives.
    pub fn push_hang(&self) {
        lock(&self.responses).push_back(Scripted::Hang);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        lock(&self.invocations).push(spec.clone());
        let next = lock(&self.responses).pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Output(output)) => Ok(output),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(SessionError::Spawn {
                    program: spec.program.clone(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

#[derive(Debug, Default)]
struct ShellState {
    rules: Vec<(String, CommandOutput)>,
    connect_failures: u32,
    opened: u32,
    closed: u32,
    remote_commands: Vec<String>,
}

/// Runner that emulates an SSH host.
///
/// Control master open and close always succeed unless connect failures are
/// queued. Remote commands are answered by the first rule whose pattern is
/// a substring of the command; `whoami` prints `root` and `pgrep` finds a
/// process unless a rule says otherwise. Anything else succeeds silently.
#[derive(Clone, Debug, Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    /// Creates a shell with the default answers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers remote commands containing `pattern` with the given output.
    pub fn respond(
        &self,
        pattern: impl Into<String>,
        code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state)
            .rules
            .push((pattern.into(), output(Some(code), stdout, stderr)));
    }

    /// Makes the next `count` master connections fail with status 255.
    pub fn fail_connects(&self, count: u32) {
        lock(&self.state).connect_failures = count;
    }

    /// Remote commands received so far, in order.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        lock(&self.state).remote_commands.clone()
    }

    /// Number of control masters opened successfully.
    #[must_use]
    pub fn opened(&self) -> u32 {
        lock(&self.state).opened
    }

    /// Number of control masters closed.
    #[must_use]
    pub fn closed(&self) -> u32 {
        lock(&self.state).closed
    }

    fn answer(&self, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<String> = spec
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let mut state = lock(&self.state);

        if args.iter().any(|arg| arg == "-M") {
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return output(Some(255), "", "Connection refused");
            }
            state.opened += 1;
            return output(Some(0), "", "");
        }
        if args.iter().any(|arg| arg == "-O") {
            state.closed += 1;
            return output(Some(0), "", "");
        }

        let command = args.last().cloned().unwrap_or_default();
        state.remote_commands.push(command.clone());
        if let Some((_, answer)) = state
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return answer.clone();
        }
        if command == "whoami" {
            return output(Some(0), "root\n", "");
        }
        if command.starts_with("pgrep") {
            return output(Some(0), "4242\n", "");
        }
        output(Some(0), "", "")
    }
}

impl CommandRunner for FakeShell {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        let answer = self.answer(spec);
        Box::pin(async move { Ok(answer) })
    }
}

/// A call made against [`FakeCloud`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloudCall {
    /// `create` with the instance name.
    Create(String),
    /// `get` with the instance id.
    Get(String),
    /// `get_by_name` with the name.
    GetByName(String),
    /// `list_by_tag` with the tag.
    ListByTag(String),
    /// `delete` with the instance id.
    Delete(String),
    /// `reboot` with the instance id.
    Reboot(String),
}

#[derive(Debug)]
struct CreateFailure {
    error: ProviderError,
    accepted: bool,
}

#[derive(Debug)]
struct CloudState {
    instances: Vec<Instance>,
    pending_polls: HashMap<String, u32>,
    calls: Vec<CloudCall>,
    create_failures: VecDeque<CreateFailure>,
    stalled_tags: BTreeSet<String>,
    delete_failure: Option<ProviderError>,
    activation_polls: u32,
    public_ip: Option<Ipv4Addr>,
    next_id: u64,
}

/// In-memory cloud provider.
///
/// Created instances start as `new` and turn `active` after the configured
/// number of `get` calls, at which point they receive the public address.
#[derive(Debug)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

/// Public address assigned by [`FakeCloud`] unless overridden.
pub const FAKE_PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            state: Mutex::new(CloudState {
                instances: Vec::new(),
                pending_polls: HashMap::new(),
                calls: Vec::new(),
                create_failures: VecDeque::new(),
                stalled_tags: BTreeSet::new(),
                delete_failure: None,
                activation_polls: 0,
                public_ip: Some(FAKE_PUBLIC_IP),
                next_id: 1000,
            }),
        }
    }
}

impl FakeCloud {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an existing instance.
    pub fn seed(&self, instance: Instance) {
        lock(&self.state).instances.push(instance);
    }

    /// Fails the next `create` call with `error`. Calls queue up.
    pub fn fail_next_create(&self, error: ProviderError) {
        lock(&self.state).create_failures.push_back(CreateFailure {
            error,
            accepted: false,
        });
    }

    /// Creates the instance on the next `create` call but still answers with
    /// `error`, as when the response is lost after the provider accepted it.
    pub fn accept_then_fail_next_create(&self, error: ProviderError) {
        lock(&self.state).create_failures.push_back(CreateFailure {
            error,
            accepted: true,
        });
    }

    /// Makes every `list_by_tag` call for `tag` wait forever.
    pub fn stall_listing(&self, tag: impl Into<String>) {
        lock(&self.state).stalled_tags.insert(tag.into());
    }

    /// Fails every `delete` call with `error`.
    pub fn fail_deletes(&self, error: ProviderError) {
        lock(&self.state).delete_failure = Some(error);
    }

    /// Number of `get` calls a new instance reports `new` before `active`.
    pub fn set_activation_polls(&self, polls: u32) {
        lock(&self.state).activation_polls = polls;
    }

    /// Address given to instances on activation.
    pub fn set_public_ip(&self, ip: Option<Ipv4Addr>) {
        lock(&self.state).public_ip = ip;
    }

    /// Calls received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.state).calls.clone()
    }

    /// Instances currently present.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        lock(&self.state).instances.clone()
    }

    fn record(&self, call: CloudCall) -> std::sync::MutexGuard<'_, CloudState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

impl CloudState {
    fn insert_instance(&mut self, spec: &InstanceSpec) -> InstanceId {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.pending_polls.insert(id.clone(), self.activation_polls);
        self.instances.push(Instance {
            id: InstanceId::new(id.clone()),
            name: spec.name.clone(),
            status: String::from("new"),
            created_at: Utc::now(),
            public_ipv4: None,
            tags: spec.tags.clone(),
        });
        InstanceId::new(id)
    }
}

impl CloudClient for FakeCloud {
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> BackendFuture<'a, InstanceId> {
        let result = {
            let mut state = self.record(CloudCall::Create(spec.name.clone()));
            match state.create_failures.pop_front() {
                Some(CreateFailure {
                    error,
                    accepted: false,
                }) => Err(error),
                Some(CreateFailure {
                    error,
                    accepted: true,
                }) => {
                    state.insert_instance(spec);
                    Err(error)
                }
                None => Ok(state.insert_instance(spec)),
            }
        };
        Box::pin(async move { result })
    }

    fn get<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, Option<Instance>> {
        let result = {
            let mut state = self.record(CloudCall::Get(id.to_string()));
            let activate = match state.pending_polls.get_mut(id.as_str()) {
                Some(remaining) if *remaining == 0 => true,
                Some(remaining) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            };
            let public_ip = state.public_ip;
            let found = state
                .instances
                .iter_mut()
                .find(|instance| instance.id == *id);
            if let Some(instance) = found {
                if activate {
                    instance.status = String::from(ACTIVE_STATUS);
                    instance.public_ipv4 = public_ip;
                }
                Some(instance.clone())
            } else {
                None
            }
        };
        Box::pin(async move { Ok(result) })
    }

    fn get_by_name<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Instance>> {
        let result = self
            .record(CloudCall::GetByName(name.to_owned()))
            .instances
            .iter()
            .find(|instance| instance.name == name)
            .cloned();
        Box::pin(async move { Ok(result) })
    }

    fn list_by_tag<'a>(&'a self, tag: &'a str) -> BackendFuture<'a, Vec<Instance>> {
        let (stalled, result): (bool, Vec<Instance>) = {
            let state = self.record(CloudCall::ListByTag(tag.to_owned()));
            let matches = state
                .instances
                .iter()
                .filter(|instance| instance.tags.iter().any(|candidate| candidate == tag))
                .cloned()
                .collect();
            (state.stalled_tags.contains(tag), matches)
        };
        Box::pin(async move {
            if stalled {
                std::future::pending::<()>().await;
            }
            Ok(result)
        })
    }

    fn delete<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()> {
        let result = {
            let mut state = self.record(CloudCall::Delete(id.to_string()));
            if let Some(err) = state.delete_failure.clone() {
                Err(err)
            } else {
                state.instances.retain(|instance| instance.id != *id);
                state.pending_polls.remove(id.as_str());
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn reboot<'a>(&'a self, id: &'a InstanceId) -> BackendFuture<'a, ()> {
        drop(self.record(CloudCall::Reboot(id.to_string())));
        Box::pin(async move { Ok(()) })
    }
}

/// Builds an active instance for seeding [`FakeCloud`].
#[must_use]
pub fn active_instance(id: &str, name: &str, tags: &[&str], created_at: DateTime<Utc>) -> Instance {
    Instance {
        id: InstanceId::new(id),
        name: name.to_owned(),
        status: String::from(ACTIVE_STATUS),
        created_at,
        public_ipv4: Some(FAKE_PUBLIC_IP),
        tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
    }
}

/// Artifact probe that turns ready after a fixed number of pending checks.
#[derive(Debug, Default)]
pub struct FakeArtifactProbe {
    pending_checks: Option<u32>,
    calls: AtomicU32,
}

impl FakeArtifactProbe {
    /// Ready on the first check.
    #[must_use]
    pub fn ready() -> Self {
        Self::ready_after(0)
    }

    /// Pending for `pending_checks` checks, then ready.
    #[must_use]
    pub const fn ready_after(pending_checks: u32) -> Self {
        Self {
            pending_checks: Some(pending_checks),
            calls: AtomicU32::new(0),
        }
    }

    /// Never ready.
    #[must_use]
    pub const fn never_ready() -> Self {
        Self {
            pending_checks: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of checks made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactProbe for FakeArtifactProbe {
    fn check(&self, _ip: Ipv4Addr) -> ProbeFuture<'_, PollResult<()>> {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.pending_checks {
            Some(pending) if previous >= pending => PollResult::Ready(()),
            _ => PollResult::Pending(String::from("pairing QR code not served yet")),
        };
        Box::pin(async move { result })
    }
}

/// State store that keeps every write for later inspection.
#[derive(Debug, Default)]
pub struct RecordingStateStore {
    inner: MemoryStateStore,
    history: Mutex<Vec<(Identifier, ProvisioningState)>>,
}

impl RecordingStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state written for `id`, oldest first.
    #[must_use]
    pub fn history(&self, id: &Identifier) -> Vec<ProvisioningState> {
        lock(&self.history)
            .iter()
            .filter(|(key, _)| key == id)
            .map(|(_, state)| state.clone())
            .collect()
    }
}

impl StateStore for RecordingStateStore {
    fn get(&self, id: &Identifier) -> Option<ProvisioningState> {
        self.inner.get(id)
    }

    fn set(&self, id: &Identifier, state: ProvisioningState) {
        let mut history = lock(&self.history);
        history.push((id.clone(), state.clone()));
        self.inner.set(id, state);
    }

    fn delete(&self, id: &Identifier) {
        self.inner.delete(id);
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
